//! Error types for topology construction and lifecycle operations.

use std::time::Duration;

use netbench_common::CommonError;
use thiserror::Error;

use crate::binding::BindingState;
use crate::endpoint::Endpoint;

/// Result type alias for testbed operations.
pub type TestbedResult<T> = Result<T, TestbedError>;

/// Errors raised while describing, building, starting or stopping a testbed.
#[derive(Debug, Error)]
pub enum TestbedError {
    /// A node with this name already exists in the topology.
    #[error("Node '{name}' already exists")]
    DuplicateName {
        /// The conflicting node name.
        name: String,
    },

    /// A link or lookup referenced a node that is not in the topology.
    #[error("Unknown node '{name}'")]
    UnknownNode {
        /// The missing node name.
        name: String,
    },

    /// A link was rejected before any interface was allocated.
    #[error("Invalid link {a} <-> {b}: {reason}")]
    InvalidLink {
        /// First endpoint node.
        a: String,
        /// Second endpoint node.
        b: String,
        /// Why the link was rejected.
        reason: String,
    },

    /// The node already owns the configured maximum number of interfaces.
    #[error("Node '{node}' has no free interface (limit {limit})")]
    InterfaceExhaustion {
        /// The node that ran out of interfaces.
        node: String,
        /// The configured per-node limit.
        limit: usize,
    },

    /// Structural validation failed at build time.
    #[error("Incomplete topology, orphan links: {}", orphans.join(", "))]
    IncompleteTopology {
        /// Human-readable descriptions of the offending links.
        orphans: Vec<String>,
    },

    /// Another switch in the same topology already holds the data-plane port.
    #[error("Data-plane endpoint {endpoint} for '{switch}' conflicts with '{holder}'")]
    BindConflict {
        /// The switch that attempted the bind.
        switch: String,
        /// The requested endpoint.
        endpoint: Endpoint,
        /// The switch currently holding the port.
        holder: String,
    },

    /// A binding operation was issued from a state that does not allow it.
    #[error("Switch '{switch}': {operation} not allowed in state {state}")]
    InvalidState {
        /// The switch whose binding was misused.
        switch: String,
        /// The rejected operation.
        operation: &'static str,
        /// The state the binding was in.
        state: BindingState,
    },

    /// The forwarding agent did not acknowledge readiness in time.
    #[error("Switch '{switch}': forwarding agent at {endpoint} not ready after {timeout:?}")]
    StartupTimeout {
        /// The switch being started.
        switch: String,
        /// The data-plane endpoint that was probed.
        endpoint: Endpoint,
        /// The configured startup timeout.
        timeout: Duration,
    },

    /// The forwarding agent process could not be launched or stopped.
    #[error("Forwarding agent for '{switch}': {message}")]
    Agent {
        /// The switch the agent belongs to.
        switch: String,
        /// Error message.
        message: String,
    },

    /// The link fabric failed to create or release a resource.
    #[error("Link fabric operation '{operation}' failed: {message}")]
    Fabric {
        /// The fabric operation that failed.
        operation: String,
        /// Error message.
        message: String,
    },

    /// Host interface tuning failed.
    #[error("Tuning {interface} on '{host}' failed: {message}")]
    Tuning {
        /// The host owning the interface.
        host: String,
        /// The interface being tuned.
        interface: String,
        /// Error message.
        message: String,
    },

    /// The topology description is invalid.
    #[error("Invalid configuration for {field}: {message}")]
    Config {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// A host command failed.
    #[error(transparent)]
    Shell(#[from] CommonError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TestbedError {
    /// Creates a duplicate-name error.
    pub fn duplicate_name(name: impl Into<String>) -> Self {
        Self::DuplicateName { name: name.into() }
    }

    /// Creates an unknown-node error.
    pub fn unknown_node(name: impl Into<String>) -> Self {
        Self::UnknownNode { name: name.into() }
    }

    /// Creates an agent error.
    pub fn agent(switch: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Agent {
            switch: switch.into(),
            message: message.into(),
        }
    }

    /// Creates a fabric error.
    pub fn fabric(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fabric {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns true if rerunning the whole startup sequence may succeed.
    ///
    /// Build-time and binding-sequence errors need a fixed description or
    /// fixed code; only a readiness timeout is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TestbedError::StartupTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TestbedError::duplicate_name("h1");
        assert_eq!(err.to_string(), "Node 'h1' already exists");

        let err = TestbedError::unknown_node("h9");
        assert_eq!(err.to_string(), "Unknown node 'h9'");
    }

    #[test]
    fn test_incomplete_topology_lists_orphans() {
        let err = TestbedError::IncompleteTopology {
            orphans: vec!["s1-eth1 <-> h1-eth0".to_string(), "s1-eth2 <-> h2-eth0".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Incomplete topology, orphan links: s1-eth1 <-> h1-eth0, s1-eth2 <-> h2-eth0"
        );
    }

    #[test]
    fn test_invalid_state_display() {
        let err = TestbedError::InvalidState {
            switch: "s1".to_string(),
            operation: "attach_controller",
            state: BindingState::Unbound,
        };
        assert_eq!(
            err.to_string(),
            "Switch 's1': attach_controller not allowed in state Unbound"
        );
    }

    #[test]
    fn test_is_retryable() {
        let timeout = TestbedError::StartupTimeout {
            switch: "s1".to_string(),
            endpoint: Endpoint::new("127.0.0.1", 50051),
            timeout: Duration::from_secs(5),
        };
        assert!(timeout.is_retryable());
        assert!(!TestbedError::duplicate_name("h1").is_retryable());
        assert!(!TestbedError::agent("s1", "spawn failed").is_retryable());
    }

    #[test]
    fn test_shell_error_conversion() {
        let err: TestbedError = CommonError::tool_missing("ethtool").into();
        assert_eq!(err.to_string(), "Required tool 'ethtool' not found");
    }
}
