//! Switch controller binding.
//!
//! Each switch exposes two control channels: a local data-plane
//! configuration endpoint served by its forwarding agent, and a reference to
//! the upstream controller. [`ControllerBinding`] enforces the order in
//! which they come up:
//!
//! ```text
//! Unbound -> DataPlaneListening -> ControllerAttached -> Running -> Stopped
//!     \______________\____________________\_______________\-> Failed
//! ```
//!
//! The data-plane port is reserved in the topology's [`PortRegistry`] and
//! checked free on the host before the controller reference is accepted, so
//! no two switches of a topology ever listen on the same port and no switch
//! is mistaken for a process that already holds it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentLaunch, ForwardingAgent};
use crate::endpoint::Endpoint;
use crate::error::{TestbedError, TestbedResult};

/// Default bound on `start()`.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a switch binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BindingState {
    /// Nothing reserved yet.
    Unbound,
    /// Data-plane port reserved.
    DataPlaneListening,
    /// Controller reference accepted.
    ControllerAttached,
    /// Forwarding agent launched and ready.
    Running,
    /// Resources released. Terminal.
    Stopped,
    /// A transition failed. Only `stop()` is accepted.
    Failed,
}

impl BindingState {
    /// Returns true for `Stopped` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BindingState::Stopped | BindingState::Failed)
    }
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Data-plane ports reserved within one topology.
#[derive(Debug, Default)]
pub struct PortRegistry {
    held: Mutex<BTreeMap<u16, String>>,
}

impl PortRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the port of `endpoint` for `switch`.
    ///
    /// Reserving a port the same switch already holds succeeds.
    pub fn reserve(&self, switch: &str, endpoint: &Endpoint) -> TestbedResult<()> {
        let mut held = self.held.lock().expect("port registry lock");
        match held.get(&endpoint.port) {
            Some(holder) if holder != switch => Err(TestbedError::BindConflict {
                switch: switch.to_string(),
                endpoint: endpoint.clone(),
                holder: holder.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                held.insert(endpoint.port, switch.to_string());
                Ok(())
            }
        }
    }

    /// Releases the port of `endpoint` if `switch` holds it.
    pub fn release(&self, switch: &str, endpoint: &Endpoint) {
        let mut held = self.held.lock().expect("port registry lock");
        if held.get(&endpoint.port).map(String::as_str) == Some(switch) {
            held.remove(&endpoint.port);
        }
    }

    /// Returns the switch holding `port`.
    pub fn holder(&self, port: u16) -> Option<String> {
        self.held.lock().expect("port registry lock").get(&port).cloned()
    }

    /// Number of reserved ports.
    pub fn len(&self) -> usize {
        self.held.lock().expect("port registry lock").len()
    }

    /// Returns true if no port is reserved.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Binding of one switch to its data-plane endpoint and controller.
pub struct ControllerBinding {
    switch: String,
    device_id: u64,
    ports: Vec<(u32, String)>,
    state: BindingState,
    data_plane: Option<Endpoint>,
    controller: Option<Endpoint>,
    agent_launched: bool,
    startup_timeout: Duration,
    registry: Arc<PortRegistry>,
    agent: Arc<dyn ForwardingAgent>,
}

impl fmt::Debug for ControllerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerBinding")
            .field("switch", &self.switch)
            .field("state", &self.state)
            .field("data_plane", &self.data_plane)
            .field("controller", &self.controller)
            .field("agent", &self.agent.name())
            .finish()
    }
}

impl ControllerBinding {
    /// Creates an unbound binding.
    ///
    /// `ports` are the switch's `(port number, interface name)` pairs handed
    /// to the forwarding agent.
    pub fn new(
        switch: impl Into<String>,
        device_id: u64,
        ports: Vec<(u32, String)>,
        registry: Arc<PortRegistry>,
        agent: Arc<dyn ForwardingAgent>,
    ) -> Self {
        Self {
            switch: switch.into(),
            device_id,
            ports,
            state: BindingState::Unbound,
            data_plane: None,
            controller: None,
            agent_launched: false,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            registry,
            agent,
        }
    }

    /// Sets the bound on `start()`.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn switch(&self) -> &str {
        &self.switch
    }

    pub fn state(&self) -> BindingState {
        self.state
    }

    pub fn data_plane(&self) -> Option<&Endpoint> {
        self.data_plane.as_ref()
    }

    pub fn controller(&self) -> Option<&Endpoint> {
        self.controller.as_ref()
    }

    fn require(&self, expected: BindingState, operation: &'static str) -> TestbedResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(TestbedError::InvalidState {
                switch: self.switch.clone(),
                operation,
                state: self.state,
            })
        }
    }

    fn fail(&mut self, err: TestbedError) -> TestbedError {
        warn!(switch = %self.switch, error = %err, "Binding failed in state {}", self.state);
        self.state = BindingState::Failed;
        err
    }

    /// Reserves the data-plane endpoint. `Unbound -> DataPlaneListening`.
    ///
    /// The port must be free both in the topology's registry and on the host.
    #[instrument(skip(self, endpoint), fields(switch = %self.switch, endpoint = %endpoint))]
    pub async fn bind_data_plane(&mut self, endpoint: Endpoint) -> TestbedResult<()> {
        self.require(BindingState::Unbound, "bind_data_plane")?;

        if let Err(e) = self.registry.reserve(&self.switch, &endpoint) {
            return Err(self.fail(e));
        }
        if let Err(e) = self.agent.check_endpoint(&endpoint).await {
            self.registry.release(&self.switch, &endpoint);
            let err = TestbedError::BindConflict {
                switch: self.switch.clone(),
                endpoint,
                holder: format!("another process on the host ({})", e),
            };
            return Err(self.fail(err));
        }
        self.data_plane = Some(endpoint);
        self.state = BindingState::DataPlaneListening;
        debug!("Data-plane endpoint reserved");
        Ok(())
    }

    /// Accepts the controller reference. `DataPlaneListening -> ControllerAttached`.
    #[instrument(skip(self, endpoint), fields(switch = %self.switch, controller = %endpoint))]
    pub async fn attach_controller(&mut self, endpoint: Endpoint) -> TestbedResult<()> {
        self.require(BindingState::DataPlaneListening, "attach_controller")?;

        self.controller = Some(endpoint);
        self.state = BindingState::ControllerAttached;
        debug!("Controller attached");
        Ok(())
    }

    /// Launches the forwarding agent and waits for readiness.
    /// `ControllerAttached -> Running`.
    ///
    /// Readiness is bounded by the startup timeout. There is no retry.
    #[instrument(skip(self), fields(switch = %self.switch))]
    pub async fn start(&mut self) -> TestbedResult<()> {
        self.require(BindingState::ControllerAttached, "start")?;

        let (Some(data_plane), Some(controller)) = (self.data_plane.clone(), self.controller.clone())
        else {
            return Err(self.fail(TestbedError::agent(
                &self.switch,
                "binding has no endpoints",
            )));
        };
        let launch = AgentLaunch {
            switch: self.switch.clone(),
            device_id: self.device_id,
            data_plane: data_plane.clone(),
            controller,
            ports: self.ports.clone(),
        };

        // Set before launching so that stop() still shuts the agent down if
        // this future is dropped mid-start. Stopping an unknown switch is a no-op.
        self.agent_launched = true;
        if let Err(e) = self.agent.launch(&launch).await {
            return Err(self.fail(e));
        }

        match tokio::time::timeout(self.startup_timeout, self.agent.wait_ready(&launch)).await {
            Ok(Ok(())) => {
                self.state = BindingState::Running;
                info!(data_plane = %data_plane, "Switch {} running", self.switch);
                Ok(())
            }
            Ok(Err(e)) => Err(self.fail(e)),
            Err(_) => {
                let err = TestbedError::StartupTimeout {
                    switch: self.switch.clone(),
                    endpoint: data_plane,
                    timeout: self.startup_timeout,
                };
                Err(self.fail(err))
            }
        }
    }

    /// Stops the agent if launched, releases the port and drops the
    /// controller reference. Any state except `Stopped` ends in `Stopped`;
    /// calling it on a stopped binding does nothing.
    ///
    /// An agent shutdown error is returned after the release completes.
    #[instrument(skip(self), fields(switch = %self.switch, state = %self.state))]
    pub async fn stop(&mut self) -> TestbedResult<()> {
        if self.state == BindingState::Stopped {
            return Ok(());
        }

        let mut result = Ok(());
        if self.agent_launched {
            if let Err(e) = self.agent.shutdown(&self.switch).await {
                warn!(error = %e, "Failed to stop forwarding agent for {}", self.switch);
                result = Err(e);
            }
            self.agent_launched = false;
        }
        if let Some(endpoint) = self.data_plane.take() {
            self.registry.release(&self.switch, &endpoint);
        }
        self.controller = None;
        self.state = BindingState::Stopped;
        debug!("Binding stopped");
        result
    }
}
