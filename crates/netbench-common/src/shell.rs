//! Shell command execution for host network configuration.
//!
//! Everything the testbed does to the host network stack (namespaces, veth
//! pairs, offload settings) goes through [`exec`] / [`exec_checked`], with
//! every user-supplied token passed through [`shellquote`].
//!
//! # Example
//!
//! ```ignore
//! use netbench_common::shell::{self, IP_CMD, shellquote};
//!
//! let ns = "h1";
//! let cmd = format!("{} netns add {}", IP_CMD, shellquote(ns));
//! shell::exec_checked(&cmd).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{CommonError, CommonResult};

/// Path to the `ip` command for namespace and link configuration.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `ethtool` command for NIC offload configuration.
pub const ETHTOOL_CMD: &str = "/sbin/ethtool";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// Wraps the string in double quotes and escapes `$`, `` ` ``, `"`, `\`
/// and newline.
///
/// # Example
///
/// ```
/// use netbench_common::shell::shellquote;
///
/// assert_eq!(shellquote("h1-eth0"), "\"h1-eth0\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Returns the prefix that runs a command inside network namespace `ns`.
///
/// `None` means the root namespace and yields an empty prefix.
pub fn netns_prefix(ns: Option<&str>) -> String {
    match ns {
        Some(ns) => format!("{} netns exec {} ", IP_CMD, shellquote(ns)),
        None => String::new(),
    }
}

/// Exit code and trimmed output of a finished command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Non-empty streams joined by a newline, stdout first.
    pub fn combined_output(&self) -> String {
        [self.stdout.as_str(), self.stderr.as_str()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Runs `cmd` through `/bin/sh -c`. A non-zero exit is not an error here.
pub async fn exec(cmd: &str) -> CommonResult<ExecResult> {
    let output = Command::new("/bin/sh")
        .args(["-c", cmd])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| CommonError::ShellExec {
            command: cmd.to_string(),
            source,
        })?;

    let result = ExecResult {
        // Killed by a signal
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };
    tracing::debug!(command = %cmd, exit_code = result.exit_code, "Ran host command");
    Ok(result)
}

/// Runs `cmd` and returns its stdout, failing on a non-zero exit.
pub async fn exec_checked(cmd: &str) -> CommonResult<String> {
    let result = exec(cmd).await?;
    if !result.success() {
        return Err(CommonError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        });
    }
    Ok(result.stdout)
}

/// Checks that `tool` resolves to an executable on this host.
pub async fn require_tool(tool: &str) -> CommonResult<()> {
    let cmd = format!("command -v {}", shellquote(tool));
    let result = exec(&cmd).await?;
    if result.success() {
        Ok(())
    } else {
        Err(CommonError::tool_missing(tool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shellquote_simple() {
        assert_eq!(shellquote("simple"), "\"simple\"");
        assert_eq!(shellquote("s1-eth1"), "\"s1-eth1\"");
        assert_eq!(shellquote("50051"), "\"50051\"");
    }

    #[test]
    fn test_shellquote_special_chars() {
        assert_eq!(shellquote("$HOME"), "\"\\$HOME\"");
        assert_eq!(shellquote("`whoami`"), "\"\\`whoami\\`\"");
        assert_eq!(shellquote("say \"hello\""), "\"say \\\"hello\\\"\"");
        assert_eq!(shellquote("path\\to"), "\"path\\\\to\"");
        assert_eq!(shellquote("line1\nline2"), "\"line1\\\nline2\"");
    }

    #[test]
    fn test_shellquote_empty() {
        assert_eq!(shellquote(""), "\"\"");
    }

    #[test]
    fn test_netns_prefix() {
        assert_eq!(netns_prefix(None), "");
        assert_eq!(netns_prefix(Some("h1")), "/sbin/ip netns exec \"h1\" ");
    }

    #[test]
    fn test_exec_result_combined() {
        let result = ExecResult {
            exit_code: 0,
            stdout: "stdout".to_string(),
            stderr: "stderr".to_string(),
        };
        assert!(result.success());
        assert_eq!(result.combined_output(), "stdout\nstderr");

        let result = ExecResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: "error message".to_string(),
        };
        assert!(!result.success());
        assert_eq!(result.combined_output(), "error message");
    }

    #[tokio::test]
    async fn test_exec_echo() {
        let result = exec("echo hello").await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hello");
    }

    #[tokio::test]
    async fn test_exec_failure() {
        let result = exec("exit 42").await.unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, 42);
    }

    #[tokio::test]
    async fn test_exec_checked_failure() {
        match exec_checked("exit 1").await {
            Err(CommonError::ShellCommandFailed { exit_code, .. }) => {
                assert_eq!(exit_code, 1);
            }
            other => panic!("Expected ShellCommandFailed error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_require_tool() {
        assert!(require_tool("sh").await.is_ok());
        assert!(matches!(
            require_tool("definitely-not-a-real-tool-xyz").await,
            Err(CommonError::ToolMissing { .. })
        ));
    }
}
