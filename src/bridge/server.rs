//! WebSocket listener and per-connection session lifecycle.
//!
//! Each accepted connection walks the full session state machine:
//! handshake (Connecting), shell open (Authenticating), pump (Streaming),
//! teardown (Closing -> Closed / Failed). Every termination path - normal,
//! error, forced reconnect - delivers exactly one Disconnect frame with a
//! sanitized reason before the socket closes.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::pump::{BridgePump, PumpEnd, WsSink, WsSource};
use crate::config::BridgeConfig;
use crate::protocol::{disconnect_frame, FrameCodec};
use crate::session::{
    ConnectRequest, ReconnectController, ReconnectSpec, RegistryError, SessionRegistry,
};
use crate::ssh::{ExitReason, ShellHandle, SshClient};

/// Server-level failure.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

/// The bridge server: one listener, one registry, many sessions.
pub struct BridgeServer {
    config: Arc<BridgeConfig>,
    registry: Arc<SessionRegistry>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl BridgeServer {
    /// Build a server from static configuration.
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.max_sessions));
        Self {
            config: Arc::new(config),
            registry,
            local_addr: parking_lot::Mutex::new(None),
        }
    }

    /// The address the listener is bound to, once [`BridgeServer::bind`]
    /// has run.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// The session registry (shared with supervisor plumbing and tests).
    #[must_use]
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Readiness: accepting new sessions.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.registry.is_accepting()
    }

    /// Bind the configured listen address.
    ///
    /// # Errors
    /// [`BridgeError::Bind`] on an I/O failure.
    pub async fn bind(&self) -> Result<TcpListener, BridgeError> {
        let bind_err = |source| BridgeError::Bind {
            addr: self.config.listen_addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(bind_err)?;
        let addr = listener.local_addr().map_err(bind_err)?;
        *self.local_addr.lock() = Some(addr);
        info!("bridge listening on {}", addr);
        Ok(listener)
    }

    /// Accept connections until shutdown is signalled.
    pub async fn serve(&self, listener: TcpListener) {
        let mut shutdown = self.registry.shutdown_signal();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let config = Arc::clone(&self.config);
                            let registry = Arc::clone(&self.registry);
                            tokio::spawn(async move {
                                handle_connection(config, registry, stream, peer).await;
                            });
                        }
                        Err(e) => {
                            error!("accept failed: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("listener stopping: shutdown signalled");
                        break;
                    }
                }
            }
        }
    }

    /// Drain: stop accepting, then force-close every live session within
    /// the configured grace period.
    pub async fn drain(&self) {
        for session in self.registry.list() {
            info!(
                "draining session {} ({}, {:?}, idle {}s)",
                session.id, session.target, session.state, session.idle_secs
            );
        }
        self.registry
            .force_close_all(self.config.shutdown_grace())
            .await;
    }
}

/// Drive one browser connection from handshake to teardown.
async fn handle_connection(
    config: Arc<BridgeConfig>,
    registry: Arc<SessionRegistry>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    // Interactive terminal: latency beats throughput.
    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let ws_stream = match tokio::time::timeout(config.handshake_timeout(), accept_async(stream))
        .await
    {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!("websocket handshake with {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("websocket handshake with {} timed out", peer);
            return;
        }
    };

    info!("browser connected from {}", peer);
    let codec = FrameCodec::new(config.max_frame_bytes);
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Connecting: the first message must be the connect request.
    let request =
        match tokio::time::timeout(config.handshake_timeout(), read_handshake(&mut ws_receiver))
            .await
        {
            Ok(Ok(request)) => request,
            Ok(Err(reason)) => {
                warn!("{}: {}", peer, reason);
                finish(&mut ws_sender, codec, reason).await;
                return;
            }
            Err(_) => {
                warn!("{}: handshake timed out", peer);
                finish(&mut ws_sender, codec, "handshake rejected: timed out").await;
                return;
            }
        };

    let target = request.target();

    // Admission control.
    let (session_id, activity) = match registry.create(&target, request.rows, request.cols) {
        Ok(created) => created,
        Err(e) => {
            warn!("{}: session rejected: {}", peer, e);
            finish(&mut ws_sender, codec, admission_reason(&e)).await;
            return;
        }
    };

    // Authenticating.
    if registry.begin_authentication(&session_id).is_err() {
        registry.remove(&session_id);
        finish(&mut ws_sender, codec, "internal error").await;
        return;
    }

    // The open races the shutdown signal so a drain cancels sessions still
    // in Authenticating instead of waiting out the auth timeout.
    let mut shutdown = registry.shutdown_signal();
    let opened = tokio::select! {
        result = SshClient::open(
            &target,
            &request.auth,
            request.rows,
            request.cols,
            config.auth_timeout(),
        ) => Some(result),
        _ = shutdown.wait_for(|draining| *draining) => None,
    };

    let shell = match opened {
        Some(Ok(shell)) => shell,
        Some(Err(e)) => {
            let reason = e.user_reason();
            debug!("session {}: shell open failed: {}", session_id, e);
            let _ = registry.fail(&session_id, reason);
            finish(&mut ws_sender, codec, reason).await;
            registry.remove(&session_id);
            return;
        }
        None => {
            info!("session {}: shell open cancelled by shutdown", session_id);
            let _ = registry.fail(&session_id, "server shutting down");
            finish(&mut ws_sender, codec, "server shutting down").await;
            registry.remove(&session_id);
            return;
        }
    };

    if registry.begin_streaming(&session_id).is_err() {
        registry.remove(&session_id);
        finish(&mut ws_sender, codec, "internal error").await;
        return;
    }

    let controller = ReconnectController::new(
        Arc::clone(&registry),
        config.auth_timeout(),
        ReconnectSpec {
            target,
            auth: request.auth,
            rows: request.rows,
            cols: request.cols,
        },
    );

    stream_session(
        &config,
        &registry,
        codec,
        session_id,
        activity,
        shell,
        controller,
        ws_sender,
        &mut ws_receiver,
    )
    .await;
}

/// Streaming phase, looping across forced reconnects on the same browser
/// connection.
#[allow(clippy::too_many_arguments)]
async fn stream_session(
    config: &BridgeConfig,
    registry: &Arc<SessionRegistry>,
    codec: FrameCodec,
    mut session_id: String,
    mut activity: Arc<crate::session::ActivityTracker>,
    mut shell: ShellHandle,
    mut controller: ReconnectController,
    ws_sender: WsSink,
    ws_receiver: &mut WsSource,
) {
    let pump = BridgePump::new(codec, config.ping_interval(), config.idle_timeout());
    let mut shutdown = registry.shutdown_signal();
    let mut ws_sender = Some(ws_sender);

    loop {
        // Invariant on entry: the sender is present; reconnect only loops
        // around while the browser side is still usable.
        let Some(sender) = ws_sender.take() else {
            break;
        };

        let (returned_sender, end) = {
            let sid = session_id.clone();
            let registry_ref = Arc::clone(registry);
            let controller_ref = &mut controller;
            let mut on_resize = move |rows: u16, cols: u16| {
                let _ = registry_ref.update_dimensions(&sid, rows, cols);
                controller_ref.update_dimensions(rows, cols);
            };
            pump.run(
                &session_id,
                sender,
                ws_receiver,
                &mut shell,
                Arc::clone(&activity),
                &mut on_resize,
                &mut shutdown,
            )
            .await
        };
        ws_sender = returned_sender;

        if end == PumpEnd::ReconnectRequested && ws_sender.is_some() {
            // Old session terminates with its one Disconnect frame, then
            // the same connection continues on a fresh session.
            if let Some(sender) = ws_sender.as_mut() {
                send_disconnect(sender, codec, "reconnecting").await;
            }
            match controller.recycle(&session_id, &mut shell).await {
                Ok((new_id, new_activity, new_shell)) => {
                    session_id = new_id;
                    activity = new_activity;
                    shell = new_shell;
                    continue;
                }
                Err(e) => {
                    warn!("session {}: reconnect failed: {}", session_id, e);
                    if let Some(mut sender) = ws_sender.take() {
                        finish(&mut sender, codec, e.user_reason()).await;
                    }
                    // recycle released the old session either way.
                    return;
                }
            }
        }

        // Closing: shell first, then the one Disconnect frame, then the
        // socket. The order of side closures is irrelevant; both are
        // idempotent.
        let _ = registry.begin_close(&session_id);
        let reason = teardown_reason(&end, &shell);
        shell.close().await;

        if let Some(mut sender) = ws_sender.take() {
            finish(&mut sender, codec, reason).await;
        }

        let _ = registry.complete_close(&session_id);
        registry.remove(&session_id);
        info!("session {} closed: {}", session_id, reason);
        return;
    }

    // Reached only if the sender was lost mid-reconnect; the shell still
    // needs releasing.
    let _ = registry.begin_close(&session_id);
    shell.close().await;
    let _ = registry.complete_close(&session_id);
    registry.remove(&session_id);
}

/// Read and validate the connect request. Control messages ahead of the
/// first data message are skipped, not treated as the handshake.
async fn read_handshake(ws_receiver: &mut WsSource) -> Result<ConnectRequest, &'static str> {
    let request: ConnectRequest = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                break serde_json::from_str(&text)
                    .map_err(|_| "handshake rejected: malformed connect request")?
            }
            Some(Ok(Message::Binary(raw))) => {
                break serde_json::from_slice(&raw)
                    .map_err(|_| "handshake rejected: malformed connect request")?
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            _ => return Err("handshake rejected: expected connect request"),
        }
    };
    request.validate()?;
    Ok(request)
}

/// Map a pump end to the browser-facing reason.
fn teardown_reason(end: &PumpEnd, shell: &ShellHandle) -> &'static str {
    match end {
        PumpEnd::BrowserClosed | PumpEnd::BrowserError(_) | PumpEnd::BrowserUnresponsive => {
            "session closed"
        }
        PumpEnd::ShellEnded => match shell.exit_reason() {
            Some(ExitReason::ConnectionLost) => "connection to host lost",
            _ => "shell exited",
        },
        PumpEnd::ShellGone => "connection to host lost",
        PumpEnd::ProtocolViolation(_) => "protocol error",
        PumpEnd::IdleTimeout => "session idle timeout",
        PumpEnd::Shutdown => "server shutting down",
        // Handled before teardown.
        PumpEnd::ReconnectRequested => "reconnecting",
    }
}

fn admission_reason(err: &RegistryError) -> &'static str {
    match err {
        RegistryError::CapacityExceeded { .. } => "server at capacity",
        RegistryError::Draining => "server shutting down",
        _ => "session rejected",
    }
}

/// Send the final Disconnect frame (best effort) and close the socket.
async fn finish(ws_sender: &mut WsSink, codec: FrameCodec, reason: &str) {
    send_disconnect(ws_sender, codec, reason).await;
    let _ = ws_sender.send(Message::Close(None)).await;
    let _ = ws_sender.close().await;
}

async fn send_disconnect(ws_sender: &mut WsSink, codec: FrameCodec, reason: &str) {
    let wire = codec.encode(&disconnect_frame(reason));
    if let Err(e) = ws_sender.send(Message::Binary(wire.to_vec())).await {
        debug!("failed to deliver disconnect frame: {}", e);
    }
}
