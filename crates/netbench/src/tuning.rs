//! Host interface tuning.
//!
//! Benchmarks run with segmentation and checksum offloads disabled on every
//! host interface, so measured throughput reflects the switch rather than
//! the NIC emulation.

use async_trait::async_trait;
use tracing::{debug, instrument};

use netbench_common::shell::{self, netns_prefix, shellquote, ETHTOOL_CMD};

use crate::error::{TestbedError, TestbedResult};

/// Offload features switched off on host interfaces.
pub const OFFLOAD_FEATURES: &[&str] = &["gro", "rx", "tx"];

/// Applies offload settings to a host interface.
#[async_trait]
pub trait InterfaceTuner: Send + Sync {
    /// Disables [`OFFLOAD_FEATURES`] on `interface` inside `host`'s namespace.
    ///
    /// Must be idempotent.
    async fn disable_offloads(&self, host: &str, interface: &str) -> TestbedResult<()>;
}

/// Builds the `ethtool -K` command for one host interface.
pub fn offload_command(host: &str, interface: &str) -> String {
    let features: Vec<String> = OFFLOAD_FEATURES
        .iter()
        .map(|f| format!("{} off", f))
        .collect();
    format!(
        "{}{} -K {} {}",
        netns_prefix(Some(host)),
        ETHTOOL_CMD,
        shellquote(interface),
        features.join(" ")
    )
}

/// Tuner that shells out to `ethtool`.
#[derive(Debug, Default)]
pub struct EthtoolTuner {
    /// Mock mode for testing (don't execute shell commands).
    #[cfg(test)]
    mock_mode: bool,

    /// Captured shell commands in mock mode.
    #[cfg(test)]
    captured_commands: std::sync::Mutex<Vec<String>>,
}

impl EthtoolTuner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifies that the host has `ethtool`.
    pub async fn check_host() -> TestbedResult<()> {
        shell::require_tool(ETHTOOL_CMD).await?;
        Ok(())
    }
}

#[async_trait]
impl InterfaceTuner for EthtoolTuner {
    #[instrument(skip(self))]
    async fn disable_offloads(&self, host: &str, interface: &str) -> TestbedResult<()> {
        let cmd = offload_command(host, interface);

        #[cfg(test)]
        if self.mock_mode {
            self.captured_commands
                .lock()
                .expect("captured commands lock")
                .push(cmd);
            return Ok(());
        }

        shell::exec_checked(&cmd)
            .await
            .map_err(|e| TestbedError::Tuning {
                host: host.to_string(),
                interface: interface.to_string(),
                message: e.to_string(),
            })?;
        debug!("Disabled offloads on {} in {}", interface, host);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offload_command() {
        assert_eq!(
            offload_command("h1", "h1-eth0"),
            "/sbin/ip netns exec \"h1\" /sbin/ethtool -K \"h1-eth0\" gro off rx off tx off"
        );
    }

    #[tokio::test]
    async fn test_mock_tuner_captures_commands() {
        let tuner = EthtoolTuner {
            mock_mode: true,
            ..EthtoolTuner::default()
        };
        tuner.disable_offloads("h1", "h1-eth0").await.unwrap();
        tuner.disable_offloads("h1", "h1-eth0").await.unwrap();

        let cmds = tuner.captured_commands.lock().unwrap();
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0], cmds[1]);
    }
}
