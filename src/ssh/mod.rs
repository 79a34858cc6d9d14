//! SSH layer: the narrow "open remote shell" interface.
//!
//! Wraps russh behind [`SshClient::open`] and [`ShellHandle`]; nothing
//! outside this module touches the SSH protocol.

mod client;
mod error;
mod shell;

pub use client::{AuthMethod, BridgeHandler, ShellTarget, SshClient};
pub use error::{ExitReason, OpenError, ShellError};
pub use shell::{spawn_shell_driver, ShellCommand, ShellHandle};
