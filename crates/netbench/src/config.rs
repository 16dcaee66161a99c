//! Topology description files.
//!
//! A testbed is described in YAML:
//!
//! ```yaml
//! controller: 127.0.0.1:6653
//! hosts: [h1, h2]
//! switches:
//!   - name: s1
//!     data_plane: 127.0.0.1:50051
//! links:
//!   - [s1, h1]
//!   - [s1, h2]
//! ```
//!
//! Every other field has a default.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::{AgentCommand, DEFAULT_READY_POLL_INTERVAL};
use crate::binding::DEFAULT_STARTUP_TIMEOUT;
use crate::builder::TopologyBuilder;
use crate::endpoint::Endpoint;
use crate::error::{TestbedError, TestbedResult};
use crate::node::SwitchSpec;

/// Lifecycle tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Bound on each switch's `start()`, in seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    /// Readiness probe interval, in milliseconds
    #[serde(default = "default_ready_poll_interval_ms")]
    pub ready_poll_interval_ms: u64,

    /// Per-node interface cap (unbounded if absent)
    #[serde(default)]
    pub max_interfaces_per_node: Option<usize>,
}

/// One switch entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchConfig {
    pub name: String,
    pub data_plane: Endpoint,
    #[serde(default)]
    pub device_id: Option<u64>,
    /// Overrides the topology-wide controller
    #[serde(default)]
    pub controller: Option<Endpoint>,
}

/// A whole testbed description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestbedConfig {
    /// Controller used by switches without an override
    #[serde(default = "default_controller")]
    pub controller: Endpoint,

    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub agent: AgentCommand,

    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub switches: Vec<SwitchConfig>,

    /// Links as `[a, b]` node name pairs
    #[serde(default)]
    pub links: Vec<[String; 2]>,
}

fn default_controller() -> Endpoint {
    Endpoint::new("127.0.0.1", 6653)
}

fn default_startup_timeout_secs() -> u64 {
    DEFAULT_STARTUP_TIMEOUT.as_secs()
}

fn default_ready_poll_interval_ms() -> u64 {
    DEFAULT_READY_POLL_INTERVAL.as_millis() as u64
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            startup_timeout_secs: default_startup_timeout_secs(),
            ready_poll_interval_ms: default_ready_poll_interval_ms(),
            max_interfaces_per_node: None,
        }
    }
}

impl TestbedConfig {
    /// Loads and validates a description file.
    pub fn load(path: impl AsRef<Path>) -> TestbedResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config = Self::from_yaml(&contents)?;
        debug!(path = %path.display(), "Loaded testbed description");
        Ok(config)
    }

    /// Parses and validates a description.
    pub fn from_yaml(contents: &str) -> TestbedResult<Self> {
        let config: Self = serde_yaml::from_str(contents)
            .map_err(|e| TestbedError::config("yaml", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.startup_timeout_secs)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.settings.ready_poll_interval_ms)
    }

    /// Checks fields that the builder does not check itself.
    pub fn validate(&self) -> TestbedResult<()> {
        if self.settings.startup_timeout_secs == 0 {
            return Err(TestbedError::config(
                "settings.startup_timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.settings.ready_poll_interval_ms == 0 {
            return Err(TestbedError::config(
                "settings.ready_poll_interval_ms",
                "must be greater than 0",
            ));
        }
        if self.agent.binary.trim().is_empty() {
            return Err(TestbedError::config("agent.binary", "must not be empty"));
        }

        let mut names = HashSet::new();
        let all_names = self
            .hosts
            .iter()
            .chain(self.switches.iter().map(|s| &s.name));
        for name in all_names {
            if name.trim().is_empty() {
                return Err(TestbedError::config("name", "node names must not be empty"));
            }
            if !names.insert(name.as_str()) {
                return Err(TestbedError::config(
                    "name",
                    format!("node '{}' is declared twice", name),
                ));
            }
        }

        let mut ports = HashSet::new();
        for switch in &self.switches {
            if !ports.insert(switch.data_plane.port) {
                return Err(TestbedError::config(
                    "switches.data_plane",
                    format!(
                        "port {} of '{}' is used by another switch",
                        switch.data_plane.port, switch.name
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Replays the description into a builder.
    pub fn to_builder(&self) -> TestbedResult<TopologyBuilder> {
        let mut builder = TopologyBuilder::new();
        if let Some(limit) = self.settings.max_interfaces_per_node {
            builder = builder.with_interface_limit(limit);
        }

        for host in &self.hosts {
            builder.add_host(host)?;
        }
        for (index, switch) in self.switches.iter().enumerate() {
            builder.add_switch_spec(
                &switch.name,
                SwitchSpec {
                    data_plane: switch.data_plane.clone(),
                    device_id: switch.device_id.unwrap_or(index as u64 + 1),
                    controller: switch.controller.clone(),
                },
            )?;
        }
        for [a, b] in &self.links {
            builder.add_link(a, b)?;
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const STAR: &str = r#"
controller: 10.0.0.1:6653
hosts: [h1, h2]
switches:
  - name: s1
    data_plane: 127.0.0.1:50051
links:
  - [s1, h1]
  - [s1, h2]
"#;

    #[test]
    fn test_defaults() {
        let config = TestbedConfig::from_yaml(STAR).unwrap();
        assert_eq!(config.controller, Endpoint::new("10.0.0.1", 6653));
        assert_eq!(config.startup_timeout(), Duration::from_secs(5));
        assert_eq!(config.ready_poll_interval(), Duration::from_millis(100));
        assert_eq!(config.agent, AgentCommand::default());
        assert_eq!(config.switches[0].device_id, None);
    }

    #[test]
    fn test_to_builder() {
        let config = TestbedConfig::from_yaml(STAR).unwrap();
        let builder = config.to_builder().unwrap();

        let names: Vec<&str> = builder.nodes().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["h1", "h2", "s1"]);
        assert_eq!(builder.links().len(), 2);
        let s1 = builder.node("s1").unwrap().switch_spec().unwrap();
        assert_eq!(s1.device_id, 1);
        assert_eq!(s1.controller, None);
    }

    #[test]
    fn test_controller_override() {
        let yaml = r#"
hosts: [h1]
switches:
  - name: s1
    data_plane: 127.0.0.1:50051
    device_id: 7
    controller: 127.0.0.1:6654
links:
  - [s1, h1]
"#;
        let config = TestbedConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.controller, Endpoint::new("127.0.0.1", 6653));
        let builder = config.to_builder().unwrap();
        let spec = builder.node("s1").unwrap().switch_spec().unwrap();
        assert_eq!(spec.device_id, 7);
        assert_eq!(spec.controller, Some(Endpoint::new("127.0.0.1", 6654)));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let yaml = "hosts: [h1, h1]\n";
        assert!(matches!(
            TestbedConfig::from_yaml(yaml),
            Err(TestbedError::Config { .. })
        ));

        let yaml = r#"
switches:
  - name: s1
    data_plane: 127.0.0.1:50051
  - name: s2
    data_plane: 0.0.0.0:50051
"#;
        match TestbedConfig::from_yaml(yaml) {
            Err(TestbedError::Config { field, .. }) => assert_eq!(field, "switches.data_plane"),
            other => panic!("Expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let yaml = "settings:\n  startup_timeout_secs: 0\n";
        assert!(TestbedConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_bad_endpoint_is_a_yaml_error() {
        let yaml = "controller: nowhere\n";
        match TestbedConfig::from_yaml(yaml) {
            Err(TestbedError::Config { field, .. }) => assert_eq!(field, "yaml"),
            other => panic!("Expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_link_endpoint_surfaces_in_builder() {
        let yaml = "hosts: [h1]\nlinks:\n  - [h1, s9]\n";
        let config = TestbedConfig::from_yaml(yaml).unwrap();
        assert!(matches!(
            config.to_builder(),
            Err(TestbedError::UnknownNode { .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(STAR.as_bytes()).unwrap();

        let config = TestbedConfig::load(file.path()).unwrap();
        assert_eq!(config.hosts, vec!["h1".to_string(), "h2".to_string()]);

        assert!(matches!(
            TestbedConfig::load("/nonexistent/topo.yaml"),
            Err(TestbedError::Io(_))
        ));
    }
}
