//! In-memory backends.
//!
//! [`SimFabric`], [`SimAgent`] and [`SimTuner`] implement the external
//! interfaces without touching the host. They record every call so a run can
//! be inspected afterwards, and they can be told to fail. `netbench run
//! --dry-run` uses them, and so do the tests.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::agent::{AgentLaunch, ForwardingAgent};
use crate::endpoint::Endpoint;
use crate::error::{TestbedError, TestbedResult};
use crate::fabric::LinkFabric;
use crate::node::{Link, Node};
use crate::tuning::InterfaceTuner;

/// A call observed by [`SimFabric`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FabricEvent {
    NodeCreated(String),
    LinkCreated(String),
    LinkRemoved(String),
    NodeDestroyed(String),
}

#[derive(Debug, Default)]
struct FabricState {
    events: Vec<FabricEvent>,
    nodes: BTreeSet<String>,
    links: BTreeSet<String>,
}

/// Fabric that keeps nodes and links in memory.
#[derive(Debug, Default)]
pub struct SimFabric {
    state: Mutex<FabricState>,
    fail_link_touching: Option<String>,
    fail_node: Option<String>,
}

impl SimFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `create_link` fail for any link touching `node`.
    pub fn fail_links_touching(mut self, node: impl Into<String>) -> Self {
        self.fail_link_touching = Some(node.into());
        self
    }

    /// Makes `create_node` fail for `node`.
    pub fn fail_node(mut self, node: impl Into<String>) -> Self {
        self.fail_node = Some(node.into());
        self
    }

    /// Every call so far, in order.
    pub fn events(&self) -> Vec<FabricEvent> {
        self.state.lock().expect("sim fabric lock").events.clone()
    }

    /// Nodes currently materialized.
    pub fn live_nodes(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("sim fabric lock")
            .nodes
            .iter()
            .cloned()
            .collect()
    }

    /// Links currently materialized, as `a <-> b`.
    pub fn live_links(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("sim fabric lock")
            .links
            .iter()
            .cloned()
            .collect()
    }

    fn link_key(link: &Link) -> String {
        let mut ends = [link.a.name.as_str(), link.b.name.as_str()];
        ends.sort_unstable();
        format!("{} <-> {}", ends[0], ends[1])
    }
}

#[async_trait]
impl LinkFabric for SimFabric {
    fn name(&self) -> &str {
        "sim"
    }

    async fn create_node(&self, node: &Node) -> TestbedResult<()> {
        if self.fail_node.as_deref() == Some(node.name.as_str()) {
            return Err(TestbedError::fabric(
                "create_node",
                format!("injected failure for {}", node.name),
            ));
        }
        let mut state = self.state.lock().expect("sim fabric lock");
        state.nodes.insert(node.name.clone());
        state.events.push(FabricEvent::NodeCreated(node.name.clone()));
        Ok(())
    }

    async fn create_link(
        &self,
        link: &Link,
        _a_ns: Option<&str>,
        _b_ns: Option<&str>,
    ) -> TestbedResult<()> {
        if let Some(node) = &self.fail_link_touching {
            if link.touches(node) {
                return Err(TestbedError::fabric(
                    "create_link",
                    format!("injected failure for {}", link),
                ));
            }
        }
        let key = Self::link_key(link);
        let mut state = self.state.lock().expect("sim fabric lock");
        state.links.insert(key.clone());
        state.events.push(FabricEvent::LinkCreated(key));
        Ok(())
    }

    async fn teardown_link(&self, link: &Link, _a_ns: Option<&str>) -> TestbedResult<()> {
        let key = Self::link_key(link);
        let mut state = self.state.lock().expect("sim fabric lock");
        state.links.remove(&key);
        state.events.push(FabricEvent::LinkRemoved(key));
        Ok(())
    }

    async fn destroy_node(&self, node: &Node) -> TestbedResult<()> {
        let mut state = self.state.lock().expect("sim fabric lock");
        state.nodes.remove(&node.name);
        state
            .events
            .push(FabricEvent::NodeDestroyed(node.name.clone()));
        Ok(())
    }
}

/// How a simulated agent reacts to a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimBehavior {
    /// Launches and reports ready.
    #[default]
    Ready,
    /// Launches but never reports ready.
    Unresponsive,
    /// Fails to launch.
    FailLaunch,
    /// Launches and reports ready, but fails to shut down.
    FailShutdown,
}

#[derive(Debug, Default)]
struct AgentState {
    launches: Vec<AgentLaunch>,
    shutdowns: Vec<String>,
    running: BTreeSet<String>,
    // switch -> controller, for launches still waiting for readiness
    starting: HashMap<String, Endpoint>,
    max_starting: usize,
    max_starting_per_controller: HashMap<Endpoint, usize>,
}

/// Agent that records launches instead of spawning processes.
#[derive(Debug, Default)]
pub struct SimAgent {
    state: Mutex<AgentState>,
    behaviors: HashMap<String, SimBehavior>,
    ready_delay: Duration,
    occupied_ports: BTreeSet<u16>,
}

impl SimAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the behavior for one switch.
    pub fn with_behavior(mut self, switch: impl Into<String>, behavior: SimBehavior) -> Self {
        self.behaviors.insert(switch.into(), behavior);
        self
    }

    /// Delays readiness of every `Ready` switch.
    pub fn with_ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = delay;
        self
    }

    /// Pretends a process outside the topology listens on `port`.
    pub fn with_occupied_port(mut self, port: u16) -> Self {
        self.occupied_ports.insert(port);
        self
    }

    fn behavior(&self, switch: &str) -> SimBehavior {
        self.behaviors.get(switch).copied().unwrap_or_default()
    }

    /// Every launch so far, in order.
    pub fn launches(&self) -> Vec<AgentLaunch> {
        self.state.lock().expect("sim agent lock").launches.clone()
    }

    /// Every shutdown so far, in order.
    pub fn shutdowns(&self) -> Vec<String> {
        self.state.lock().expect("sim agent lock").shutdowns.clone()
    }

    /// Switches with a launched agent, sorted.
    pub fn running(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("sim agent lock")
            .running
            .iter()
            .cloned()
            .collect()
    }

    /// Highest number of switches that were starting at the same time.
    pub fn max_concurrent_starts(&self) -> usize {
        self.state.lock().expect("sim agent lock").max_starting
    }

    /// Same as [`SimAgent::max_concurrent_starts`], restricted to one controller.
    pub fn max_concurrent_starts_for(&self, controller: &Endpoint) -> usize {
        self.state
            .lock()
            .expect("sim agent lock")
            .max_starting_per_controller
            .get(controller)
            .copied()
            .unwrap_or(0)
    }

    fn finish_starting(&self, switch: &str) {
        self.state
            .lock()
            .expect("sim agent lock")
            .starting
            .remove(switch);
    }
}

#[async_trait]
impl ForwardingAgent for SimAgent {
    fn name(&self) -> &str {
        "sim"
    }

    async fn check_endpoint(&self, endpoint: &Endpoint) -> io::Result<()> {
        if self.occupied_ports.contains(&endpoint.port) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("port {} is occupied", endpoint.port),
            ));
        }
        Ok(())
    }

    async fn launch(&self, launch: &AgentLaunch) -> TestbedResult<()> {
        if self.behavior(&launch.switch) == SimBehavior::FailLaunch {
            return Err(TestbedError::agent(&launch.switch, "injected launch failure"));
        }

        let mut state = self.state.lock().expect("sim agent lock");
        if !state.running.insert(launch.switch.clone()) {
            return Err(TestbedError::agent(&launch.switch, "agent already running"));
        }
        state.launches.push(launch.clone());
        state
            .starting
            .insert(launch.switch.clone(), launch.controller.clone());

        let total = state.starting.len();
        state.max_starting = state.max_starting.max(total);
        let same_controller = state
            .starting
            .values()
            .filter(|c| **c == launch.controller)
            .count();
        let max = state
            .max_starting_per_controller
            .entry(launch.controller.clone())
            .or_default();
        *max = (*max).max(same_controller);

        debug!(switch = %launch.switch, controller = %launch.controller, "Simulated agent launched");
        Ok(())
    }

    async fn wait_ready(&self, launch: &AgentLaunch) -> TestbedResult<()> {
        if self.behavior(&launch.switch) == SimBehavior::Unresponsive {
            std::future::pending::<()>().await;
        }
        if !self.ready_delay.is_zero() {
            tokio::time::sleep(self.ready_delay).await;
        }
        self.finish_starting(&launch.switch);
        Ok(())
    }

    async fn shutdown(&self, switch: &str) -> TestbedResult<()> {
        let mut state = self.state.lock().expect("sim agent lock");
        state.starting.remove(switch);
        if !state.running.remove(switch) {
            return Ok(());
        }
        state.shutdowns.push(switch.to_string());
        if self.behavior(switch) == SimBehavior::FailShutdown {
            return Err(TestbedError::agent(switch, "injected shutdown failure"));
        }
        Ok(())
    }
}

/// Tuner that records which interfaces it was asked to tune.
#[derive(Debug, Default)]
pub struct SimTuner {
    tuned: Mutex<Vec<(String, String)>>,
    fail_host: Option<String>,
}

impl SimTuner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes tuning fail for every interface of `host`.
    pub fn fail_host(mut self, host: impl Into<String>) -> Self {
        self.fail_host = Some(host.into());
        self
    }

    /// `(host, interface)` pairs tuned so far, in order.
    pub fn tuned(&self) -> Vec<(String, String)> {
        self.tuned.lock().expect("sim tuner lock").clone()
    }
}

#[async_trait]
impl InterfaceTuner for SimTuner {
    async fn disable_offloads(&self, host: &str, interface: &str) -> TestbedResult<()> {
        if self.fail_host.as_deref() == Some(host) {
            return Err(TestbedError::Tuning {
                host: host.to_string(),
                interface: interface.to_string(),
                message: "injected tuning failure".to_string(),
            });
        }
        self.tuned
            .lock()
            .expect("sim tuner lock")
            .push((host.to_string(), interface.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Interface;

    fn launch(switch: &str, controller: u16) -> AgentLaunch {
        AgentLaunch {
            switch: switch.to_string(),
            device_id: 1,
            data_plane: Endpoint::new("127.0.0.1", 50051),
            controller: Endpoint::new("127.0.0.1", controller),
            ports: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_fabric_tracks_live_resources() {
        let fabric = SimFabric::new();
        let h1 = Node::host("h1");
        let link = Link::new(Interface::new("s1", 1), Interface::new("h1", 0));

        fabric.create_node(&h1).await.unwrap();
        fabric.create_link(&link, None, Some("h1")).await.unwrap();
        assert_eq!(fabric.live_links(), vec!["h1-eth0 <-> s1-eth1".to_string()]);

        fabric.teardown_link(&link, None).await.unwrap();
        fabric.destroy_node(&h1).await.unwrap();
        assert!(fabric.live_links().is_empty());
        assert!(fabric.live_nodes().is_empty());
        assert_eq!(fabric.events().len(), 4);
    }

    #[tokio::test]
    async fn test_agent_counts_concurrent_starts() {
        let agent = SimAgent::new();
        agent.launch(&launch("s1", 6653)).await.unwrap();
        agent.launch(&launch("s2", 6653)).await.unwrap();
        agent.launch(&launch("s3", 6654)).await.unwrap();

        assert_eq!(agent.max_concurrent_starts(), 3);
        assert_eq!(
            agent.max_concurrent_starts_for(&Endpoint::new("127.0.0.1", 6653)),
            2
        );

        agent.wait_ready(&launch("s1", 6653)).await.unwrap();
        agent.shutdown("s1").await.unwrap();
        agent.shutdown("s1").await.unwrap();
        assert_eq!(agent.shutdowns(), vec!["s1".to_string()]);
        assert_eq!(agent.running(), vec!["s2".to_string(), "s3".to_string()]);
    }

    #[tokio::test]
    async fn test_tuner_failure() {
        let tuner = SimTuner::new().fail_host("h2");
        tuner.disable_offloads("h1", "h1-eth0").await.unwrap();
        assert!(tuner.disable_offloads("h2", "h2-eth0").await.is_err());
        assert_eq!(tuner.tuned().len(), 1);
    }
}
