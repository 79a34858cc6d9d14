//! Forced reconnect.
//!
//! The browser connection survives; the session behind it is torn down
//! through the normal Closing path and a fresh one is opened with the
//! retained target and credentials. The old shell is fully released -
//! driver task joined, SSH connection dropped - before the new open
//! starts, so rapid repeated reconnects cannot leak a handle.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use super::registry::{RegistryError, SessionRegistry};
use super::types::ActivityTracker;
use crate::ssh::{AuthMethod, OpenError, ShellHandle, ShellTarget, SshClient};

/// Reconnect failure.
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Open(#[from] OpenError),
}

impl ReconnectError {
    /// Sanitized reason for the browser.
    #[must_use]
    pub fn user_reason(&self) -> &'static str {
        match self {
            Self::Registry(RegistryError::CapacityExceeded { .. }) => "server at capacity",
            Self::Registry(RegistryError::Draining) => "server shutting down",
            Self::Registry(_) => "reconnect failed",
            Self::Open(open) => open.user_reason(),
        }
    }
}

/// What is needed to rebuild a session: the target and credentials from the
/// original handshake plus the latest negotiated dimensions. This is the
/// one place credentials outlive the open call, and it lives exactly as
/// long as the browser connection.
pub struct ReconnectSpec {
    pub target: ShellTarget,
    pub auth: AuthMethod,
    pub rows: u16,
    pub cols: u16,
}

/// Handles client-issued forced reconnects for one browser connection.
pub struct ReconnectController {
    registry: Arc<SessionRegistry>,
    auth_timeout: Duration,
    spec: ReconnectSpec,
}

impl ReconnectController {
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, auth_timeout: Duration, spec: ReconnectSpec) -> Self {
        Self {
            registry,
            auth_timeout,
            spec,
        }
    }

    /// Keep the retained spec in step with resize frames so a reconnected
    /// shell opens at the size the client last negotiated.
    pub fn update_dimensions(&mut self, rows: u16, cols: u16) {
        self.spec.rows = rows;
        self.spec.cols = cols;
    }

    /// The retained target.
    #[must_use]
    pub fn target(&self) -> &ShellTarget {
        &self.spec.target
    }

    /// Close the old session and open its replacement.
    ///
    /// Ordering is the whole point: the old shell's close completes (its
    /// driver joined, its connection dropped) before the new shell opens.
    /// Whatever shell output was buffered but undelivered is discarded.
    ///
    /// # Errors
    /// Registry admission or shell open failure; the old session is fully
    /// released either way.
    pub async fn recycle(
        &self,
        old_session_id: &str,
        old_shell: &mut ShellHandle,
    ) -> Result<(String, Arc<ActivityTracker>, ShellHandle), ReconnectError> {
        info!(
            "forced reconnect: recycling session {} for {}",
            old_session_id,
            self.spec.target.display()
        );

        let _ = self.registry.begin_close(old_session_id);
        old_shell.close().await;
        let _ = self.registry.complete_close(old_session_id);
        self.registry.remove(old_session_id);

        let (new_id, activity) =
            self.registry
                .create(&self.spec.target, self.spec.rows, self.spec.cols)?;
        self.registry.begin_authentication(&new_id)?;

        // Cancelled by a concurrent drain the same way the first open is.
        let mut shutdown = self.registry.shutdown_signal();
        let opened = tokio::select! {
            result = SshClient::open(
                &self.spec.target,
                &self.spec.auth,
                self.spec.rows,
                self.spec.cols,
                self.auth_timeout,
            ) => Some(result),
            _ = shutdown.wait_for(|draining| *draining) => None,
        };

        let shell = match opened {
            Some(Ok(shell)) => shell,
            Some(Err(e)) => {
                let _ = self.registry.fail(&new_id, e.user_reason());
                self.registry.remove(&new_id);
                return Err(e.into());
            }
            None => {
                let _ = self.registry.fail(&new_id, "server shutting down");
                self.registry.remove(&new_id);
                return Err(RegistryError::Draining.into());
            }
        };

        self.registry.begin_streaming(&new_id)?;
        info!(
            "forced reconnect complete: session {} replaced by {}",
            old_session_id, new_id
        );
        Ok((new_id, activity, shell))
    }
}
