//! Shared host plumbing for the netbench testbed.
//!
//! - [`shell`]: Safe shell command execution with proper quoting
//! - [`error`]: Error types for command execution
//!
//! The testbed never links against netlink directly; namespaces, veth pairs
//! and offload settings are configured through the same `ip` / `ethtool`
//! invocations an operator would type, so every step shows up verbatim in
//! the debug log.
//!
//! # Example
//!
//! ```ignore
//! use netbench_common::{shell::{self, IP_CMD, shellquote}, CommonResult};
//!
//! async fn add_namespace(name: &str) -> CommonResult<()> {
//!     let cmd = format!("{} netns add {}", IP_CMD, shellquote(name));
//!     shell::exec_checked(&cmd).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod shell;

pub use error::{CommonError, CommonResult};
