//! Shell handle and channel driver task.
//!
//! A [`ShellHandle`] is the exclusive owner of one remote shell: one SSH
//! connection plus the PTY channel opened on it. The driver task started by
//! [`spawn_shell_driver`] owns both and pumps the channel; when the task
//! ends, dropping them tears the TCP connection down, so a joined driver
//! means every descriptor is released.

use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info};

use super::client::BridgeHandler;
use super::error::{ExitReason, ShellError};

/// Output channel depth. Bounded so that a saturated consumer pauses the
/// driver's channel reads instead of growing memory.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Command channel depth.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// How long `close` waits for the driver before aborting it.
const CLOSE_GRACE: std::time::Duration = std::time::Duration::from_secs(3);

/// Commands accepted by the shell driver task.
#[derive(Debug)]
pub enum ShellCommand {
    /// Bytes for the shell's stdin.
    Data(Vec<u8>),
    /// New PTY dimensions (rows, cols).
    Resize(u16, u16),
    /// Terminate the channel.
    Close,
}

/// Exclusive handle to one open remote shell.
pub struct ShellHandle {
    id: String,
    cmd_tx: mpsc::Sender<ShellCommand>,
    output_rx: Option<mpsc::Receiver<Vec<u8>>>,
    exit_rx: watch::Receiver<Option<ExitReason>>,
    driver: Option<JoinHandle<()>>,
}

impl ShellHandle {
    /// Session id this shell belongs to.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Receive the next chunk of shell output.
    ///
    /// Returns `None` once the shell has terminated and all buffered output
    /// has been consumed. Unblocks promptly when the handle is closed from
    /// another path.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        match self.output_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Detach the output stream so a dedicated task can own the
    /// shell-to-browser direction. Returns `None` if already taken.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.output_rx.take()
    }

    /// Write bytes to the shell's stdin.
    ///
    /// # Errors
    /// Returns [`ShellError::Closed`] if the shell has terminated.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), ShellError> {
        self.cmd_tx
            .send(ShellCommand::Data(data))
            .await
            .map_err(|_| ShellError::Closed)
    }

    /// Change the remote PTY dimensions.
    ///
    /// Silently coalesced to `Ok` if the shell has already exited; a resize
    /// racing a shell exit is not an error.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), ShellError> {
        match self.cmd_tx.send(ShellCommand::Resize(rows, cols)).await {
            Ok(()) => Ok(()),
            Err(_) => Ok(()),
        }
    }

    /// Why the shell terminated, once it has.
    #[must_use]
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit_rx.borrow().clone()
    }

    /// Close the shell and release every resource it holds.
    ///
    /// Idempotent and safe to call while `read`/`write` are in flight
    /// elsewhere. Returns only after the driver task has finished (or been
    /// aborted after a grace period), so the SSH connection is fully gone
    /// when this returns.
    pub async fn close(&mut self) {
        let _ = self.cmd_tx.try_send(ShellCommand::Close);
        // Unblock a driver stalled on a full output queue.
        if let Some(rx) = self.output_rx.as_mut() {
            rx.close();
        }

        if let Some(mut driver) = self.driver.take() {
            if timeout(CLOSE_GRACE, &mut driver).await.is_err() {
                debug!("shell driver for session {} unresponsive, aborting", self.id);
                driver.abort();
                let _ = driver.await;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        cmd_tx: mpsc::Sender<ShellCommand>,
        output_rx: mpsc::Receiver<Vec<u8>>,
        exit_rx: watch::Receiver<Option<ExitReason>>,
    ) -> Self {
        Self {
            id: "test".to_string(),
            cmd_tx,
            output_rx: Some(output_rx),
            exit_rx,
            driver: None,
        }
    }
}

impl Drop for ShellHandle {
    fn drop(&mut self) {
        // Best-effort: a handle dropped without close() still signals the
        // driver, which exits once the command channel closes.
        let _ = self.cmd_tx.try_send(ShellCommand::Close);
    }
}

/// Spawn the driver task for a freshly opened shell channel.
///
/// Takes ownership of the SSH connection handle and the channel; both are
/// dropped when the driver exits.
#[must_use]
pub fn spawn_shell_driver(
    connection: Handle<BridgeHandler>,
    mut channel: Channel<Msg>,
    session_id: String,
) -> ShellHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ShellCommand>(COMMAND_CHANNEL_CAPACITY);
    let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_CHANNEL_CAPACITY);
    let (exit_tx, exit_rx) = watch::channel::<Option<ExitReason>>(None);

    let id = session_id.clone();
    let driver = tokio::spawn(async move {
        // Keep the connection alive for as long as the channel is in use.
        let _connection = connection;
        let mut exit_status: Option<u32> = None;
        let reason: ExitReason;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ShellCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                error!("session {}: shell write failed: {}", id, e);
                                reason = ExitReason::ConnectionLost;
                                break;
                            }
                        }
                        Some(ShellCommand::Resize(rows, cols)) => {
                            debug!("session {}: window change to {}x{}", id, rows, cols);
                            // A failed resize is not fatal to the stream.
                            if let Err(e) = channel
                                .window_change(u32::from(cols), u32::from(rows), 0, 0)
                                .await
                            {
                                debug!("session {}: window change failed: {}", id, e);
                            }
                        }
                        Some(ShellCommand::Close) | None => {
                            info!("session {}: shell close requested", id);
                            let _ = channel.eof().await;
                            reason = exit_status.map_or(ExitReason::Eof, ExitReason::Exited);
                            break;
                        }
                    }
                }

                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if output_tx.send(data.to_vec()).await.is_err() {
                                // Consumer gone; session is shutting down.
                                reason = exit_status.map_or(ExitReason::Eof, ExitReason::Exited);
                                break;
                            }
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) => {
                            // ext 1 is stderr; merge it into the terminal stream.
                            if ext == 1 && output_tx.send(data.to_vec()).await.is_err() {
                                reason = exit_status.map_or(ExitReason::Eof, ExitReason::Exited);
                                break;
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                            info!("session {}: shell exit status {}", id, status);
                            exit_status = Some(status);
                        }
                        Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                            info!("session {}: shell exit signal {:?}", id, signal_name);
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => {
                            info!("session {}: shell channel ended", id);
                            reason = exit_status.map_or(ExitReason::Eof, ExitReason::Exited);
                            break;
                        }
                        Some(_) => {}
                        None => {
                            info!("session {}: SSH connection lost", id);
                            reason = ExitReason::ConnectionLost;
                            break;
                        }
                    }
                }
            }
        }

        let _ = exit_tx.send(Some(reason));
        debug!("shell driver for session {} terminated", id);
    });

    ShellHandle {
        id: session_id,
        cmd_tx,
        output_rx: Some(output_rx),
        exit_rx,
        driver: Some(driver),
    }
}
