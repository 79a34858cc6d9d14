//! SSH error types.

use thiserror::Error;

/// Failure to open a remote shell.
///
/// Variants are deliberately coarse: the browser only ever sees the
/// sanitized reason from [`OpenError::user_reason`], never the detail.
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("authentication rejected by server")]
    AuthRejected,

    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("connection timed out")]
    Timeout,

    #[error("SSH protocol error: {0}")]
    Protocol(String),
}

impl OpenError {
    /// Human-readable, credential-free reason safe to send to the browser.
    #[must_use]
    pub const fn user_reason(&self) -> &'static str {
        match self {
            Self::AuthRejected => "authentication failed",
            Self::Unreachable(_) => "host unreachable",
            Self::Timeout => "connection timed out",
            Self::Protocol(_) => "SSH protocol error",
        }
    }
}

impl From<russh::Error> for OpenError {
    fn from(err: russh::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// I/O failure on an open shell.
#[derive(Error, Debug)]
pub enum ShellError {
    #[error("shell channel closed")]
    Closed,

    #[error("shell I/O error: {0}")]
    Io(String),
}

/// Why a shell terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Remote process exited with a status code.
    Exited(u32),
    /// Remote side sent EOF or closed the channel without a status.
    Eof,
    /// The SSH connection dropped abruptly.
    ConnectionLost,
}
