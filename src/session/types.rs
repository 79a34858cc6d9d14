//! Session types and handshake payload.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::SessionState;
use crate::ssh::{AuthMethod, ShellTarget};

fn default_rows() -> u16 {
    24
}

fn default_cols() -> u16 {
    80
}

/// Initial handshake payload from the browser: target, credentials, and
/// initial terminal dimensions.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectRequest {
    /// Hostname or IP of the SSH server.
    pub host: String,
    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Login username.
    pub username: String,
    /// Authentication material; consumed by the open call, never logged.
    pub auth: AuthMethod,
    /// Initial terminal rows.
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Initial terminal columns.
    #[serde(default = "default_cols")]
    pub cols: u16,
}

fn default_ssh_port() -> u16 {
    22
}

impl ConnectRequest {
    /// Structural validation of the handshake.
    ///
    /// # Errors
    /// Returns a static description suitable for the Disconnect reason.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.host.trim().is_empty() {
            return Err("handshake rejected: host must not be empty");
        }
        if self.username.trim().is_empty() {
            return Err("handshake rejected: username must not be empty");
        }
        if self.rows == 0 || self.cols == 0 {
            return Err("handshake rejected: terminal dimensions must be positive");
        }
        Ok(())
    }

    /// The credential-free target.
    #[must_use]
    pub fn target(&self) -> ShellTarget {
        ShellTarget {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
        }
    }
}

/// Last-activity clock shared between a session's pump tasks and the
/// registry. Millisecond granularity is plenty for idle detection.
#[derive(Debug)]
pub struct ActivityTracker {
    last_millis: AtomicU64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_millis: AtomicU64::new(now_millis()),
        }
    }

    /// Record traffic in either direction.
    pub fn touch(&self) {
        self.last_millis.store(now_millis(), Ordering::Relaxed);
    }

    /// Time since the last recorded traffic.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last = self.last_millis.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }
}

/// Snapshot of one tracked session, safe to expose: never carries
/// credentials.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: String,
    /// `user@host:port` of the remote end.
    pub target: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Negotiated terminal rows.
    pub rows: u16,
    /// Negotiated terminal columns.
    pub cols: u16,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Seconds since the last traffic in either direction.
    pub idle_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(rows: u16, cols: u16) -> ConnectRequest {
        ConnectRequest {
            host: "example.com".to_string(),
            port: 22,
            username: "deploy".to_string(),
            auth: AuthMethod::Password {
                password: "hunter2".to_string(),
            },
            rows,
            cols,
        }
    }

    #[test]
    fn validates_dimensions() {
        assert!(request(24, 80).validate().is_ok());
        assert!(request(0, 80).validate().is_err());
        assert!(request(24, 0).validate().is_err());
    }

    #[test]
    fn validates_target_fields() {
        let mut req = request(24, 80);
        req.host = "  ".to_string();
        assert!(req.validate().is_err());
    }

    #[test]
    fn handshake_json_defaults() {
        let req: ConnectRequest = serde_json::from_str(
            r#"{"host":"h","username":"u","auth":{"type":"password","password":"p"}}"#,
        )
        .unwrap();
        assert_eq!(req.port, 22);
        assert_eq!(req.rows, 24);
        assert_eq!(req.cols, 80);
    }

    #[test]
    fn auth_debug_redacts_credentials() {
        let req = request(24, 80);
        let rendered = format!("{req:?}");
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn activity_tracker_touch_resets_idle() {
        let tracker = ActivityTracker::new();
        tracker.touch();
        assert!(tracker.idle_for() < Duration::from_secs(1));
    }
}
