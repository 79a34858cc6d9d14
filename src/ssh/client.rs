//! SSH client: opens a remote shell with a PTY, using russh.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::OpenError;
use super::shell::{spawn_shell_driver, ShellHandle};

/// Remote endpoint for a shell session. Never carries credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellTarget {
    /// Hostname or IP of the SSH server.
    pub host: String,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login username.
    pub username: String,
}

fn default_port() -> u16 {
    22
}

impl ShellTarget {
    /// Sanitized display form, safe for logs and session listings.
    #[must_use]
    pub fn display(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Authentication material for the `Open` call.
///
/// Held only for the duration of the open (and the retained reconnect spec);
/// deliberately excluded from `Debug` and log output.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication.
    Password { password: String },
    /// Private key file, with optional passphrase.
    Key {
        key_path: String,
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password { .. } => f.write_str("AuthMethod::Password(..)"),
            Self::Key { key_path, .. } => f
                .debug_struct("AuthMethod::Key")
                .field("key_path", key_path)
                .finish_non_exhaustive(),
        }
    }
}

/// Opens remote shells. Stateless; one call per session.
pub struct SshClient;

impl SshClient {
    /// Open an interactive shell on `target` with the given PTY size.
    ///
    /// The entire sequence - TCP connect, SSH handshake, authentication,
    /// PTY and shell requests - runs under `limit`; the library's own
    /// timeout behavior is not relied on.
    ///
    /// # Errors
    /// Returns [`OpenError`] describing which stage failed. Credential
    /// detail never appears in the error.
    pub async fn open(
        target: &ShellTarget,
        auth: &AuthMethod,
        rows: u16,
        cols: u16,
        limit: Duration,
    ) -> Result<ShellHandle, OpenError> {
        match tokio::time::timeout(limit, Self::open_inner(target, auth, rows, cols)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("shell open timed out for {}", target.display());
                Err(OpenError::Timeout)
            }
        }
    }

    async fn open_inner(
        target: &ShellTarget,
        auth: &AuthMethod,
        rows: u16,
        cols: u16,
    ) -> Result<ShellHandle, OpenError> {
        let addr = format!("{}:{}", target.host, target.port);
        info!("opening shell on {}", target.display());

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| OpenError::Unreachable(format!("address resolution failed: {e}")))?
            .next()
            .ok_or_else(|| OpenError::Unreachable("no address found".to_string()))?;

        let ssh_config = client::Config {
            // Liveness is handled at the bridge level (keepalive pings and
            // the optional idle timeout), not by the SSH transport.
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let mut connection = client::connect(
            Arc::new(ssh_config),
            socket_addr,
            BridgeHandler::new(target.host.clone(), target.port),
        )
        .await
        .map_err(|e| OpenError::Unreachable(e.to_string()))?;

        debug!("SSH handshake completed for {}", target.display());

        let authenticated = match auth {
            AuthMethod::Password { password } => connection
                .authenticate_password(&target.username, password)
                .await
                .map_err(OpenError::from)?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| {
                        warn!("failed to load private key {}: {}", key_path, e);
                        OpenError::AuthRejected
                    })?;
                connection
                    .authenticate_publickey(
                        &target.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), None),
                    )
                    .await
                    .map_err(OpenError::from)?
            }
        };

        if !authenticated.success() {
            info!("authentication rejected for {}", target.display());
            return Err(OpenError::AuthRejected);
        }

        info!("authenticated to {}", target.display());

        let channel = connection
            .channel_open_session()
            .await
            .map_err(|e| OpenError::Protocol(format!("channel open failed: {e}")))?;

        channel
            .request_pty(
                false,
                "xterm-256color",
                u32::from(cols),
                u32::from(rows),
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| OpenError::Protocol(format!("PTY request failed: {e}")))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| OpenError::Protocol(format!("shell request failed: {e}")))?;

        let session_id = uuid::Uuid::new_v4().to_string();
        info!(
            "interactive shell started on {} (shell id {})",
            target.display(),
            session_id
        );

        Ok(spawn_shell_driver(connection, channel, session_id))
    }
}

/// russh callback handler.
///
/// Host keys are accepted and their fingerprint logged, matching the
/// auto-add policy this bridge has always run with; the browser client has
/// no channel for an interactive trust prompt.
pub struct BridgeHandler {
    host: String,
    port: u16,
}

impl BridgeHandler {
    fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    /// SHA256 fingerprint in the OpenSSH display format.
    fn fingerprint(key: &PublicKey) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.public_key_bytes());
        let hash = hasher.finalize();
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }
}

impl client::Handler for BridgeHandler {
    type Error = OpenError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            "accepting host key for {}:{} ({})",
            self.host,
            self.port,
            Self::fingerprint(server_public_key)
        );
        Ok(true)
    }
}
