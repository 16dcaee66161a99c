//! Error types for host command execution.
//!
//! All errors implement `std::error::Error` via `thiserror`.

use std::io;
use thiserror::Error;

/// Result type alias for common operations.
pub type CommonResult<T> = Result<T, CommonError>;

/// Errors that can occur while driving host networking tools.
#[derive(Debug, Error)]
pub enum CommonError {
    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// A required host tool is not installed.
    #[error("Required tool '{tool}' not found")]
    ToolMissing {
        /// The tool name or path.
        tool: String,
    },
}

impl CommonError {
    /// Creates a tool-missing error.
    pub fn tool_missing(tool: impl Into<String>) -> Self {
        Self::ToolMissing { tool: tool.into() }
    }

    /// Returns the failing command, if this error came from one.
    pub fn command(&self) -> Option<&str> {
        match self {
            CommonError::ShellExec { command, .. }
            | CommonError::ShellCommandFailed { command, .. } => Some(command),
            CommonError::ToolMissing { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_command_failed() {
        let err = CommonError::ShellCommandFailed {
            command: "ip link add h1-eth0 type veth peer name s1-eth1".to_string(),
            exit_code: 2,
            output: "RTNETLINK answers: File exists".to_string(),
        };
        assert!(err.to_string().contains("ip link add"));
        assert!(err.to_string().contains("exit code 2"));
        assert_eq!(
            err.command(),
            Some("ip link add h1-eth0 type veth peer name s1-eth1")
        );
    }

    #[test]
    fn test_tool_missing() {
        let err = CommonError::tool_missing("ethtool");
        assert_eq!(err.to_string(), "Required tool 'ethtool' not found");
        assert_eq!(err.command(), None);
    }
}
