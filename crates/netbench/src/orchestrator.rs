//! Lifecycle orchestrator.
//!
//! Brings a described topology up in three phases and takes it down again:
//!
//! 1. materialize the fabric ([`TopologyBuilder::build`]),
//! 2. bind, attach and start every switch,
//! 3. disable offloads on every host interface.
//!
//! Switches are grouped by effective controller. Groups run concurrently;
//! inside a group switches are started one after another so that a single
//! controller never sees two registrations racing. The first failure in any
//! group abandons every other group at its next await point, then whatever
//! was started is stopped, the fabric is released and the original error is
//! returned.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::agent::ForwardingAgent;
use crate::binding::{BindingState, ControllerBinding, PortRegistry, DEFAULT_STARTUP_TIMEOUT};
use crate::builder::TopologyBuilder;
use crate::endpoint::Endpoint;
use crate::error::TestbedResult;
use crate::fabric::LinkFabric;
use crate::topology::{NodeTeardownError, Topology};
use crate::tuning::InterfaceTuner;

type SharedBinding = Arc<Mutex<ControllerBinding>>;

/// Result of a teardown pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    /// Switches whose binding reached `Stopped`.
    pub stopped: Vec<String>,
    /// Links removed from the fabric.
    pub released_links: Vec<String>,
    /// Steps that failed. The pass continued past each of them.
    pub errors: Vec<NodeTeardownError>,
}

impl TeardownReport {
    /// Returns true if every step succeeded.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stopped {} switches, released {} links, {} errors",
            self.stopped.len(),
            self.released_links.len(),
            self.errors.len()
        )
    }
}

/// A topology whose switches are running.
///
/// Must be handed back to [`Orchestrator::stop`]; dropping it otherwise
/// leaks agents and fabric resources.
pub struct RunningTopology {
    topology: Topology,
    bindings: Vec<(String, SharedBinding)>,
    controllers: BTreeMap<String, Endpoint>,
    tuned: Vec<String>,
    stopped: bool,
}

impl RunningTopology {
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Effective controller of every switch.
    pub fn controllers(&self) -> &BTreeMap<String, Endpoint> {
        &self.controllers
    }

    /// Host interfaces whose offloads were disabled.
    pub fn tuned_interfaces(&self) -> &[String] {
        &self.tuned
    }

    /// Current binding state of every switch.
    pub async fn switch_states(&self) -> BTreeMap<String, BindingState> {
        let mut states = BTreeMap::new();
        for (name, binding) in &self.bindings {
            states.insert(name.clone(), binding.lock().await.state());
        }
        states
    }
}

impl fmt::Debug for RunningTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningTopology")
            .field("topology", &self.topology)
            .field("controllers", &self.controllers)
            .field("tuned", &self.tuned)
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl Drop for RunningTopology {
    fn drop(&mut self) {
        if !self.stopped {
            warn!(
                switches = ?self.controllers.keys().collect::<Vec<_>>(),
                links = self.topology.links().len(),
                "Running topology dropped without stop(), agents and links leaked"
            );
        }
    }
}

/// Drives topologies through build, start and stop.
pub struct Orchestrator {
    fabric: Arc<dyn LinkFabric>,
    agent: Arc<dyn ForwardingAgent>,
    tuner: Arc<dyn InterfaceTuner>,
    startup_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        fabric: Arc<dyn LinkFabric>,
        agent: Arc<dyn ForwardingAgent>,
        tuner: Arc<dyn InterfaceTuner>,
    ) -> Self {
        Self {
            fabric,
            agent,
            tuner,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    /// Sets the per-switch bound on `start()`.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Builds the topology and starts every switch, then tunes the hosts.
    ///
    /// `controller` is used by every switch that does not override it.
    #[instrument(skip(self, builder, controller), fields(controller = %controller, fabric = self.fabric.name(), agent = self.agent.name()))]
    pub async fn build_and_start(
        &self,
        builder: TopologyBuilder,
        controller: Endpoint,
    ) -> TestbedResult<RunningTopology> {
        let topology = builder.build(self.fabric.clone()).await?;

        let registry = Arc::new(PortRegistry::new());
        let mut bindings: Vec<(String, SharedBinding)> = Vec::new();
        let mut controllers = BTreeMap::new();
        let mut groups: BTreeMap<Endpoint, Vec<(SharedBinding, Endpoint)>> = BTreeMap::new();

        for node in topology.switches() {
            let Some(spec) = node.switch_spec() else {
                continue;
            };
            let ports = node
                .interfaces
                .iter()
                .map(|i| (i.ordinal, i.name.clone()))
                .collect();
            let binding = Arc::new(Mutex::new(
                ControllerBinding::new(
                    &node.name,
                    spec.device_id,
                    ports,
                    registry.clone(),
                    self.agent.clone(),
                )
                .with_startup_timeout(self.startup_timeout),
            ));
            let effective = spec.controller.clone().unwrap_or_else(|| controller.clone());

            controllers.insert(node.name.clone(), effective.clone());
            groups
                .entry(effective)
                .or_default()
                .push((binding.clone(), spec.data_plane.clone()));
            bindings.push((node.name.clone(), binding));
        }

        let mut running = RunningTopology {
            topology,
            bindings,
            controllers,
            tuned: Vec::new(),
            stopped: false,
        };

        info!("Starting {} switches in {} controller groups", running.bindings.len(), groups.len());
        // Dropping the other group futures abandons their in-flight start();
        // a binding left mid-start still has its agent marked for stop().
        let started = try_join_all(
            groups
                .into_iter()
                .map(|(controller, members)| start_group(controller, members)),
        )
        .await;
        if let Err(err) = started {
            error!(error = %err, "Switch startup failed, tearing down");
            let report = self.teardown(&mut running).await;
            if !report.is_clean() {
                warn!("Teardown after startup failure: {}", report);
            }
            return Err(err);
        }

        if let Err(err) = self.tune_hosts(&mut running).await {
            error!(error = %err, "Host tuning failed, tearing down");
            let report = self.teardown(&mut running).await;
            if !report.is_clean() {
                warn!("Teardown after tuning failure: {}", report);
            }
            return Err(err);
        }

        info!(
            switches = running.bindings.len(),
            tuned = running.tuned.len(),
            "Topology running"
        );
        Ok(running)
    }

    async fn tune_hosts(&self, running: &mut RunningTopology) -> TestbedResult<()> {
        let targets: Vec<(String, String)> = running
            .topology
            .hosts()
            .flat_map(|h| h.interfaces.iter().map(|i| (h.name.clone(), i.name.clone())))
            .collect();
        for (host, iface) in targets {
            self.tuner.disable_offloads(&host, &iface).await?;
            running.tuned.push(iface);
        }
        Ok(())
    }

    /// Stops every switch, then releases the fabric.
    ///
    /// Errors are collected in the report; the pass always runs to the end.
    #[instrument(skip(self, running), fields(switches = running.bindings.len()))]
    pub async fn stop(&self, mut running: RunningTopology) -> TeardownReport {
        let report = self.teardown(&mut running).await;
        if report.is_clean() {
            info!("Teardown complete: {}", report);
        } else {
            warn!("Teardown finished with errors: {}", report);
        }
        report
    }

    async fn teardown(&self, running: &mut RunningTopology) -> TeardownReport {
        let mut report = TeardownReport::default();

        for (name, binding) in &running.bindings {
            let mut binding = binding.lock().await;
            if let Err(e) = binding.stop().await {
                report.errors.push(NodeTeardownError {
                    node: name.clone(),
                    message: e.to_string(),
                });
            }
            if binding.state() == BindingState::Stopped {
                report.stopped.push(name.clone());
            }
        }

        let outcome = running.topology.release().await;
        report.released_links = outcome.links;
        report.errors.extend(outcome.errors);
        running.stopped = true;
        report
    }
}

/// Starts the switches of one controller group in order, stopping at the
/// first failure.
async fn start_group(
    controller: Endpoint,
    members: Vec<(SharedBinding, Endpoint)>,
) -> TestbedResult<()> {
    for (binding, data_plane) in members {
        let mut binding = binding.lock().await;
        binding.bind_data_plane(data_plane).await?;
        binding.attach_controller(controller.clone()).await?;
        binding.start().await?;
    }
    Ok(())
}
