//! Link fabric: the virtual-networking substrate.
//!
//! The fabric realizes nodes and point-to-point links. [`NetnsFabric`] does
//! it the way Mininet does: each host gets its own network namespace,
//! switches stay in the root namespace, and every link is a veth pair whose
//! ends are moved into the owning namespaces.

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use netbench_common::shell::{self, netns_prefix, shellquote, IP_CMD};

use crate::error::TestbedResult;
use crate::node::{Link, Node};

/// Creation and removal of virtual nodes and links.
///
/// Calls are synchronous from the orchestrator's point of view: when a
/// future resolves, the resource exists (or is gone).
#[async_trait]
pub trait LinkFabric: Send + Sync {
    /// Returns the name of this fabric (for logging).
    fn name(&self) -> &str;

    /// Prepares the isolation context for `node` (e.g. a namespace).
    async fn create_node(&self, node: &Node) -> TestbedResult<()>;

    /// Materializes a point-to-point link.
    ///
    /// `a_ns` / `b_ns` are the namespaces the two ends must live in.
    async fn create_link(
        &self,
        link: &Link,
        a_ns: Option<&str>,
        b_ns: Option<&str>,
    ) -> TestbedResult<()>;

    /// Removes a link created by [`LinkFabric::create_link`].
    async fn teardown_link(&self, link: &Link, a_ns: Option<&str>) -> TestbedResult<()>;

    /// Releases the isolation context of `node`.
    async fn destroy_node(&self, node: &Node) -> TestbedResult<()>;
}

/// Fabric backed by Linux network namespaces and veth pairs.
#[derive(Debug, Default)]
pub struct NetnsFabric {
    /// Mock mode for testing (don't execute shell commands).
    #[cfg(test)]
    mock_mode: bool,

    /// Captured shell commands in mock mode.
    #[cfg(test)]
    captured_commands: std::sync::Mutex<Vec<String>>,
}

impl NetnsFabric {
    /// Creates a new namespace fabric.
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifies that the host has the `ip` tool.
    pub async fn check_host() -> TestbedResult<()> {
        shell::require_tool(IP_CMD).await?;
        Ok(())
    }

    async fn run(&self, cmd: String) -> TestbedResult<()> {
        #[cfg(test)]
        if self.mock_mode {
            self.captured_commands
                .lock()
                .expect("captured commands lock")
                .push(cmd);
            return Ok(());
        }

        shell::exec_checked(&cmd).await?;
        Ok(())
    }

    /// Runs a command whose failure is expected and harmless.
    async fn run_best_effort(&self, cmd: String) {
        #[cfg(test)]
        if self.mock_mode {
            return;
        }

        let _ = shell::exec(&cmd).await;
    }

    /// Moves `iface` into `ns` (if any) and brings it up there.
    async fn place_interface(&self, iface: &str, ns: Option<&str>) -> TestbedResult<()> {
        if let Some(ns) = ns {
            self.run(format!(
                "{} link set {} netns {}",
                IP_CMD,
                shellquote(iface),
                shellquote(ns)
            ))
            .await?;
        }
        self.run(format!(
            "{}{} link set {} up",
            netns_prefix(ns),
            IP_CMD,
            shellquote(iface)
        ))
        .await
    }
}

#[async_trait]
impl LinkFabric for NetnsFabric {
    fn name(&self) -> &str {
        "netns"
    }

    #[instrument(skip(self, node), fields(node = %node.name, kind = node.kind.label()))]
    async fn create_node(&self, node: &Node) -> TestbedResult<()> {
        let Some(ns) = node.namespace() else {
            debug!("Switch {} stays in the root namespace", node.name);
            return Ok(());
        };

        // Stale namespace from an aborted run
        self.run_best_effort(format!("{} netns del {}", IP_CMD, shellquote(ns)))
            .await;
        self.run(format!("{} netns add {}", IP_CMD, shellquote(ns)))
            .await?;
        self.run(format!(
            "{}{} link set lo up",
            netns_prefix(Some(ns)),
            IP_CMD
        ))
        .await?;
        info!("Created namespace {}", ns);
        Ok(())
    }

    #[instrument(skip(self, link), fields(link = %link))]
    async fn create_link(
        &self,
        link: &Link,
        a_ns: Option<&str>,
        b_ns: Option<&str>,
    ) -> TestbedResult<()> {
        self.run(format!(
            "{} link add {} type veth peer name {}",
            IP_CMD,
            shellquote(&link.a.name),
            shellquote(&link.b.name)
        ))
        .await?;
        self.place_interface(&link.a.name, a_ns).await?;
        self.place_interface(&link.b.name, b_ns).await?;
        info!("Created link {}", link);
        Ok(())
    }

    #[instrument(skip(self, link), fields(link = %link))]
    async fn teardown_link(&self, link: &Link, a_ns: Option<&str>) -> TestbedResult<()> {
        // Deleting one end of a veth pair removes its peer as well
        self.run(format!(
            "{}{} link del {}",
            netns_prefix(a_ns),
            IP_CMD,
            shellquote(&link.a.name)
        ))
        .await?;
        debug!("Removed link {}", link);
        Ok(())
    }

    #[instrument(skip(self, node), fields(node = %node.name))]
    async fn destroy_node(&self, node: &Node) -> TestbedResult<()> {
        if let Some(ns) = node.namespace() {
            self.run(format!("{} netns del {}", IP_CMD, shellquote(ns)))
                .await?;
            debug!("Deleted namespace {}", ns);
        }
        Ok(())
    }
}
