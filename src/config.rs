//! Bridge configuration.
//!
//! A static object consumed at startup; the bridge core never mutates it.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for the bridge server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Address the WebSocket listener binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Maximum concurrent sessions before admission control rejects.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Per-frame payload size cap in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Seconds a new connection may take to deliver its handshake message.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Upper bound on the whole SSH open sequence (connect + auth + PTY).
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,

    /// Optional idle timeout: a streaming session with no traffic in either
    /// direction for this long is force-closed. Disabled when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,

    /// Interval between server-initiated keepalive pings.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// How long `drain` waits for live sessions before abandoning them.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8022".to_string()
}

fn default_max_sessions() -> usize {
    64
}

fn default_max_frame_bytes() -> usize {
    256 * 1024
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_auth_timeout() -> u64 {
    30
}

fn default_ping_interval() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    10
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_sessions: default_max_sessions(),
            max_frame_bytes: default_max_frame_bytes(),
            handshake_timeout_secs: default_handshake_timeout(),
            auth_timeout_secs: default_auth_timeout(),
            idle_timeout_secs: None,
            ping_interval_secs: default_ping_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

/// Configuration load failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

impl BridgeConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Handshake timeout as a [`Duration`].
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// SSH open timeout as a [`Duration`].
    #[must_use]
    pub const fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    /// Idle timeout as a [`Duration`], if enabled.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    /// Keepalive ping interval as a [`Duration`].
    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Drain grace period as a [`Duration`].
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
