//! Forwarding agents: the per-switch data-plane processes.
//!
//! A forwarding agent serves the switch's data-plane configuration endpoint
//! (a P4Runtime server for BMv2). The orchestrator launches it once the
//! controller reference is attached, then waits until the endpoint accepts
//! connections. The wire protocol spoken on the endpoint is opaque here.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::endpoint::Endpoint;
use crate::error::{TestbedError, TestbedResult};

/// Default readiness probe interval.
pub const DEFAULT_READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a stopping agent gets before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Everything an agent needs to bring one switch up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLaunch {
    /// Switch name.
    pub switch: String,
    /// Device id announced on the data-plane channel.
    pub device_id: u64,
    /// Data-plane endpoint the agent must serve.
    pub data_plane: Endpoint,
    /// Upstream controller reference.
    pub controller: Endpoint,
    /// Switch ports as `(port number, interface name)`.
    pub ports: Vec<(u32, String)>,
}

/// A per-switch forwarding agent.
#[async_trait]
pub trait ForwardingAgent: Send + Sync {
    /// Returns the name of this agent kind (for logging).
    fn name(&self) -> &str;

    /// Checks that nothing on the host already listens on `endpoint`.
    async fn check_endpoint(&self, endpoint: &Endpoint) -> std::io::Result<()> {
        ensure_port_free(endpoint).await
    }

    /// Starts the agent for one switch. Must not wait for readiness.
    async fn launch(&self, launch: &AgentLaunch) -> TestbedResult<()>;

    /// Resolves once the agent acknowledges readiness.
    ///
    /// May never resolve; the caller bounds it with the startup timeout.
    async fn wait_ready(&self, launch: &AgentLaunch) -> TestbedResult<()>;

    /// Stops the agent for `switch`. Stopping an unknown switch is a no-op.
    async fn shutdown(&self, switch: &str) -> TestbedResult<()>;
}

/// Binds `endpoint` and releases it right away.
pub async fn ensure_port_free(endpoint: &Endpoint) -> std::io::Result<()> {
    TcpListener::bind(endpoint.to_string()).await.map(drop)
}

/// Returns true if `endpoint` accepts a TCP connection.
async fn probe_once(endpoint: &Endpoint) -> bool {
    match TcpStream::connect(endpoint.dial_addr()).await {
        Ok(_) => {
            debug!(endpoint = %endpoint, "Data-plane endpoint accepted connection");
            true
        }
        Err(e) => {
            debug!(endpoint = %endpoint, error = %e, "Data-plane endpoint not ready");
            false
        }
    }
}

/// Polls `endpoint` until a TCP connection succeeds.
pub async fn probe_until_ready(endpoint: &Endpoint, interval: Duration) {
    while !probe_once(endpoint).await {
        tokio::time::sleep(interval).await;
    }
}

/// Command line template for process-backed agents.
///
/// Each argument may contain placeholders: `{name}`, `{device_id}`,
/// `{data_plane}`, `{data_plane_port}`, `{controller}`. An argument that is
/// exactly `{ports}` expands to `-i <n>@<iface>` for every switch port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCommand {
    /// Binary to execute.
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Argument template.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
}

fn default_binary() -> String {
    "simple_switch_grpc".to_string()
}

fn default_args() -> Vec<String> {
    [
        "--device-id",
        "{device_id}",
        "{ports}",
        "--no-p4",
        "--",
        "--grpc-server-addr",
        "{data_plane}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            args: default_args(),
        }
    }
}

impl AgentCommand {
    /// Expands the argument template for one switch.
    pub fn render(&self, launch: &AgentLaunch) -> Vec<String> {
        let mut out = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            if arg == "{ports}" {
                for (port, iface) in &launch.ports {
                    out.push("-i".to_string());
                    out.push(format!("{}@{}", port, iface));
                }
                continue;
            }
            out.push(
                arg.replace("{name}", &launch.switch)
                    .replace("{device_id}", &launch.device_id.to_string())
                    .replace("{data_plane_port}", &launch.data_plane.port.to_string())
                    .replace("{data_plane}", &launch.data_plane.to_string())
                    .replace("{controller}", &launch.controller.to_string()),
            );
        }
        out
    }
}

/// Agent that runs one external process per switch.
pub struct ProcessAgent {
    command: AgentCommand,
    poll_interval: Duration,
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessAgent {
    /// Creates a process agent from a command template.
    pub fn new(command: AgentCommand) -> Self {
        Self {
            command,
            poll_interval: DEFAULT_READY_POLL_INTERVAL,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the readiness probe interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Number of agent processes currently tracked.
    pub async fn running_count(&self) -> usize {
        self.children.lock().await.len()
    }

    /// Fails if the agent process for `switch` is gone.
    async fn ensure_alive(&self, switch: &str) -> TestbedResult<()> {
        let mut children = self.children.lock().await;
        let child = children
            .get_mut(switch)
            .ok_or_else(|| TestbedError::agent(switch, "agent is not running"))?;
        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(TestbedError::agent(
                switch,
                format!("agent exited with {} before becoming ready", status),
            )),
            Err(e) => Err(TestbedError::agent(
                switch,
                format!("failed to poll agent: {}", e),
            )),
        }
    }
}

#[async_trait]
impl ForwardingAgent for ProcessAgent {
    fn name(&self) -> &str {
        &self.command.binary
    }

    #[instrument(skip(self, launch), fields(switch = %launch.switch, data_plane = %launch.data_plane))]
    async fn launch(&self, launch: &AgentLaunch) -> TestbedResult<()> {
        let mut children = self.children.lock().await;
        if children.contains_key(&launch.switch) {
            return Err(TestbedError::agent(&launch.switch, "agent already running"));
        }

        let args = self.command.render(launch);
        debug!(binary = %self.command.binary, ?args, "Spawning forwarding agent");

        let child = Command::new(&self.command.binary)
            .args(&args)
            .env("NETBENCH_SWITCH", &launch.switch)
            .env("NETBENCH_CONTROLLER", launch.controller.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TestbedError::agent(
                    &launch.switch,
                    format!("failed to spawn {}: {}", self.command.binary, e),
                )
            })?;

        info!(
            pid = ?child.id(),
            controller = %launch.controller,
            "Launched {} for {}",
            self.command.binary,
            launch.switch
        );
        children.insert(launch.switch.clone(), child);
        Ok(())
    }

    /// Ready once the endpoint accepts a connection while our own child is
    /// still alive.
    async fn wait_ready(&self, launch: &AgentLaunch) -> TestbedResult<()> {
        loop {
            let connected = probe_once(&launch.data_plane).await;
            self.ensure_alive(&launch.switch).await?;
            if connected {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    #[instrument(skip(self))]
    async fn shutdown(&self, switch: &str) -> TestbedResult<()> {
        let Some(mut child) = self.children.lock().await.remove(switch) else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            warn!(%status, "Forwarding agent for {} had already exited", switch);
            return Ok(());
        }

        child
            .start_kill()
            .map_err(|e| TestbedError::agent(switch, format!("failed to signal agent: {}", e)))?;
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(%status, "Forwarding agent for {} exited", switch);
                Ok(())
            }
            Ok(Err(e)) => Err(TestbedError::agent(
                switch,
                format!("failed to reap agent: {}", e),
            )),
            Err(_) => Err(TestbedError::agent(
                switch,
                format!("agent did not exit within {:?}", SHUTDOWN_GRACE),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch() -> AgentLaunch {
        AgentLaunch {
            switch: "s1".to_string(),
            device_id: 1,
            data_plane: Endpoint::new("127.0.0.1", 50051),
            controller: Endpoint::new("127.0.0.1", 6653),
            ports: vec![(1, "s1-eth1".to_string()), (2, "s1-eth2".to_string())],
        }
    }

    #[test]
    fn test_default_command_renders_bmv2_args() {
        let args = AgentCommand::default().render(&launch());
        assert_eq!(
            args,
            vec![
                "--device-id",
                "1",
                "-i",
                "1@s1-eth1",
                "-i",
                "2@s1-eth2",
                "--no-p4",
                "--",
                "--grpc-server-addr",
                "127.0.0.1:50051",
            ]
        );
    }

    #[test]
    fn test_render_placeholders() {
        let cmd = AgentCommand {
            binary: "agent".to_string(),
            args: vec![
                "--name={name}".to_string(),
                "--port={data_plane_port}".to_string(),
                "--controller={controller}".to_string(),
            ],
        };
        assert_eq!(
            cmd.render(&launch()),
            vec!["--name=s1", "--port=50051", "--controller=127.0.0.1:6653"]
        );
    }

    #[tokio::test]
    async fn test_probe_until_ready_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = Endpoint::new("127.0.0.1", port);

        let probe = probe_until_ready(&endpoint, Duration::from_millis(10));
        tokio::time::timeout(Duration::from_secs(5), probe)
            .await
            .expect("probe should connect to a listening socket");
    }

    #[tokio::test]
    async fn test_probe_times_out_without_listener() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = Endpoint::new("127.0.0.1", port);

        let probe = probe_until_ready(&endpoint, Duration::from_millis(10));
        assert!(tokio::time::timeout(Duration::from_millis(200), probe)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_process_agent_launch_and_shutdown() {
        let agent = ProcessAgent::new(AgentCommand {
            binary: "sleep".to_string(),
            args: vec!["30".to_string()],
        });

        agent.launch(&launch()).await.unwrap();
        assert_eq!(agent.running_count().await, 1);
        assert!(agent.launch(&launch()).await.is_err());

        agent.shutdown("s1").await.unwrap();
        assert_eq!(agent.running_count().await, 0);

        // Unknown switch is a no-op
        agent.shutdown("s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_port_free() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(ensure_port_free(&Endpoint::new("127.0.0.1", port)).await.is_err());

        drop(listener);
        ensure_port_free(&Endpoint::new("127.0.0.1", port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_process_agent_ready_with_live_child() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut launch = launch();
        launch.data_plane = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        let agent = ProcessAgent::new(AgentCommand {
            binary: "sleep".to_string(),
            args: vec!["30".to_string()],
        })
        .with_poll_interval(Duration::from_millis(10));

        agent.launch(&launch).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), agent.wait_ready(&launch))
            .await
            .expect("agent should become ready")
            .unwrap();
        agent.shutdown("s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_process_agent_exited_child_is_not_ready() {
        // Someone else answers on the port, but our agent is gone
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut launch = launch();
        launch.data_plane = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        let agent = ProcessAgent::new(AgentCommand {
            binary: "true".to_string(),
            args: Vec::new(),
        })
        .with_poll_interval(Duration::from_millis(10));

        agent.launch(&launch).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let result = tokio::time::timeout(Duration::from_secs(5), agent.wait_ready(&launch))
            .await
            .expect("wait_ready should return once the child has exited");
        match result {
            Err(TestbedError::Agent { switch, message }) => {
                assert_eq!(switch, "s1");
                assert!(message.contains("exited"));
            }
            other => panic!("Expected Agent error, got {:?}", other),
        }
        agent.shutdown("s1").await.unwrap();
        assert_eq!(agent.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_process_agent_spawn_failure() {
        let agent = ProcessAgent::new(AgentCommand {
            binary: "/nonexistent/forwarding-agent".to_string(),
            args: Vec::new(),
        });

        match agent.launch(&launch()).await {
            Err(TestbedError::Agent { switch, message }) => {
                assert_eq!(switch, "s1");
                assert!(message.contains("failed to spawn"));
            }
            other => panic!("Expected Agent error, got {:?}", other),
        }
    }
}
