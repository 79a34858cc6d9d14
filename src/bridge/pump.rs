//! The bidirectional copy loop for one streaming session.
//!
//! Two concurrent directions, both backpressured end to end:
//!
//! - shell -> browser: a dedicated task drains the shell's bounded output
//!   channel, encodes Data frames, and feeds the bounded frame channel; a
//!   sender task drains that channel into the WebSocket under a dead-client
//!   timeout. When the browser side saturates, the chain of bounded sends
//!   pauses the shell driver's channel reads - no terminal output is ever
//!   dropped while the session lives.
//! - browser -> shell: decoded inline; Data writes await the shell's
//!   bounded command channel, so a saturated shell pauses browser reads
//!   symmetrically.
//!
//! The pump owns nothing across sessions; a stalled peer here cannot delay
//! any other session.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::protocol::{data_frame, DecodeError, Frame, FrameCodec};
use crate::session::ActivityTracker;
use crate::ssh::ShellHandle;

/// Outgoing frame queue depth per session.
const FRAME_CHANNEL_CAPACITY: usize = 4096;

/// A browser that cannot take a frame for this long is considered dead.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket send half.
pub type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
/// WebSocket receive half.
pub type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Why the pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpEnd {
    /// Browser closed the connection or sent a Disconnect frame.
    BrowserClosed,
    /// Transport error on the browser side.
    BrowserError(String),
    /// Browser stopped draining frames.
    BrowserUnresponsive,
    /// Shell output stream finished; consult the shell's exit reason.
    ShellEnded,
    /// Write to the shell failed.
    ShellGone,
    /// Frame stream is corrupted beyond recovery.
    ProtocolViolation(&'static str),
    /// No traffic in either direction within the idle limit.
    IdleTimeout,
    /// Client requested a forced reconnect.
    ReconnectRequested,
    /// Process-wide shutdown.
    Shutdown,
}

/// How the shell-to-frame task finished.
enum OutputEnd {
    ShellEnded,
    SinkGone,
}

/// Per-session bidirectional pump.
#[derive(Clone, Copy)]
pub struct BridgePump {
    codec: FrameCodec,
    ping_interval: Duration,
    idle_timeout: Option<Duration>,
}

impl BridgePump {
    #[must_use]
    pub const fn new(
        codec: FrameCodec,
        ping_interval: Duration,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            codec,
            ping_interval,
            idle_timeout,
        }
    }

    /// Pump until one side terminates the session.
    ///
    /// Returns the WebSocket send half (if still usable) so the caller can
    /// deliver the final Disconnect frame after all buffered output has
    /// drained, and the reason the pump stopped. `on_resize` is invoked for
    /// every accepted resize after it was forwarded to the shell; it must
    /// not block.
    pub async fn run(
        &self,
        session_id: &str,
        ws_sender: WsSink,
        ws_receiver: &mut WsSource,
        shell: &mut ShellHandle,
        activity: Arc<ActivityTracker>,
        on_resize: &mut (dyn FnMut(u16, u16) + Send),
        shutdown: &mut watch::Receiver<bool>,
    ) -> (Option<WsSink>, PumpEnd) {
        if *shutdown.borrow() {
            return (Some(ws_sender), PumpEnd::Shutdown);
        }

        let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(FRAME_CHANNEL_CAPACITY);

        let sender_task = spawn_sender(ws_sender, frame_rx);

        let Some(output_rx) = shell.take_output() else {
            // A shell is pumped at most once.
            drop(frame_tx);
            let ws_sender = match sender_task.await {
                Ok((sender, _)) => Some(sender),
                Err(_) => None,
            };
            return (ws_sender, PumpEnd::ShellGone);
        };
        let mut output_task = spawn_output_forwarder(
            self.codec,
            output_rx,
            frame_tx.clone(),
            Arc::clone(&activity),
        );

        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + self.ping_interval,
            self.ping_interval,
        );
        let mut idle_check = tokio::time::interval(Duration::from_secs(1));
        let mut ping_seq: u32 = 0;

        let end = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break PumpEnd::Shutdown;
                    }
                }

                result = &mut output_task => {
                    match result {
                        Ok(OutputEnd::ShellEnded) => break PumpEnd::ShellEnded,
                        Ok(OutputEnd::SinkGone) | Err(_) => break PumpEnd::BrowserUnresponsive,
                    }
                }

                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(raw))) => {
                            activity.touch();
                            match self.handle_frame(session_id, &raw, shell, &frame_tx, on_resize).await {
                                Some(end) => break end,
                                None => {}
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => activity.touch(),
                        Some(Ok(Message::Text(_))) => {
                            // The frame protocol is binary-only after the handshake.
                            debug!("session {}: ignoring text message mid-stream", session_id);
                        }
                        Some(Ok(Message::Close(_))) | None => break PumpEnd::BrowserClosed,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break PumpEnd::BrowserError(e.to_string()),
                    }
                }

                _ = ping.tick() => {
                    ping_seq = ping_seq.wrapping_add(1);
                    let wire = self.codec.encode(&Frame::Ping { seq: ping_seq });
                    // Keepalives are droppable under load.
                    if frame_tx.try_send(wire).is_err() {
                        debug!("session {}: frame queue full, skipping keepalive", session_id);
                    }
                }

                _ = idle_check.tick(), if self.idle_timeout.is_some() => {
                    if let Some(limit) = self.idle_timeout {
                        if activity.idle_for() >= limit {
                            break PumpEnd::IdleTimeout;
                        }
                    }
                }
            }
        };

        // Tear the directions down in order: stop producing frames, then
        // let the sender drain what is already queued so the caller's
        // Disconnect frame is the last thing the browser sees.
        output_task.abort();
        drop(frame_tx);
        let ws_sender = match sender_task.await {
            Ok((sender, _clean)) => Some(sender),
            Err(_) => None,
        };

        debug!("session {}: pump ended: {:?}", session_id, end);
        (ws_sender, end)
    }

    /// Process one inbound wire message. Returns a pump end to break with,
    /// or `None` to keep streaming.
    async fn handle_frame(
        &self,
        session_id: &str,
        raw: &[u8],
        shell: &ShellHandle,
        frame_tx: &mpsc::Sender<Bytes>,
        on_resize: &mut (dyn FnMut(u16, u16) + Send),
    ) -> Option<PumpEnd> {
        match self.codec.decode(raw) {
            Ok(Frame::Data(data)) => {
                if shell.write(data.to_vec()).await.is_err() {
                    return Some(PumpEnd::ShellGone);
                }
                None
            }
            Ok(Frame::Resize { rows, cols }) => {
                debug!("session {}: resize to {}x{}", session_id, rows, cols);
                if shell.resize(rows, cols).await.is_err() {
                    return Some(PumpEnd::ShellGone);
                }
                on_resize(rows, cols);
                None
            }
            Ok(Frame::Ping { seq }) => {
                // Echo with the same sequence; droppable under load.
                let _ = frame_tx.try_send(self.codec.encode(&Frame::Ping { seq }));
                None
            }
            Ok(Frame::Disconnect { .. }) => Some(PumpEnd::BrowserClosed),
            Ok(Frame::Reconnect) => Some(PumpEnd::ReconnectRequested),
            Err(DecodeError::InvalidDimensions { rows, cols }) => {
                // The frame is dropped; the session stays in Streaming and
                // nothing reaches the shell.
                warn!(
                    "session {}: dropping resize with invalid dimensions {}x{}",
                    session_id, rows, cols
                );
                None
            }
            Err(e @ DecodeError::Oversized { .. }) => {
                warn!("session {}: {}", session_id, e);
                Some(PumpEnd::ProtocolViolation("frame exceeds size limit"))
            }
            Err(DecodeError::Malformed(detail)) => {
                // Binary framing cannot be resynchronized once corrupted.
                warn!("session {}: malformed frame: {}", session_id, detail);
                Some(PumpEnd::ProtocolViolation(detail))
            }
        }
    }
}

/// Sender task: sole owner of the WebSocket sink. Returns the sink and
/// whether it was still healthy when the frame channel closed.
fn spawn_sender(
    mut ws_sender: WsSink,
    mut frame_rx: mpsc::Receiver<Bytes>,
) -> tokio::task::JoinHandle<(WsSink, bool)> {
    tokio::spawn(async move {
        while let Some(wire) = frame_rx.recv().await {
            match tokio::time::timeout(SEND_TIMEOUT, ws_sender.send(Message::Binary(wire.to_vec())))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("websocket send failed: {}", e);
                    return (ws_sender, false);
                }
                Err(_) => {
                    warn!("websocket send timed out after {:?}, client unresponsive", SEND_TIMEOUT);
                    return (ws_sender, false);
                }
            }
        }
        (ws_sender, true)
    })
}

/// Shell-output task: encodes Data frames into the frame channel, pausing
/// (and thereby pausing the shell driver) when the channel is full.
fn spawn_output_forwarder(
    codec: FrameCodec,
    mut output_rx: mpsc::Receiver<Vec<u8>>,
    frame_tx: mpsc::Sender<Bytes>,
    activity: Arc<ActivityTracker>,
) -> tokio::task::JoinHandle<OutputEnd> {
    tokio::spawn(async move {
        while let Some(chunk) = output_rx.recv().await {
            activity.touch();
            let wire = codec.encode(&data_frame(Bytes::from(chunk)));
            if frame_tx.send(wire).await.is_err() {
                return OutputEnd::SinkGone;
            }
        }
        OutputEnd::ShellEnded
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, client_async};

    use crate::protocol::disconnect_frame;
    use crate::ssh::ShellCommand;

    async fn ws_pair() -> (
        WebSocketStream<TcpStream>,
        WebSocketStream<TcpStream>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            client_async("ws://localhost/", stream).await.unwrap().0
        });
        let (stream, _) = listener.accept().await.unwrap();
        let server = accept_async(stream).await.unwrap();
        (server, client.await.unwrap())
    }

    fn test_pump() -> BridgePump {
        BridgePump::new(FrameCodec::new(1024), Duration::from_secs(30), None)
    }

    #[tokio::test]
    async fn shell_output_arrives_complete_in_order_and_before_disconnect() {
        let (server_ws, mut client) = ws_pair().await;
        let (ws_sender, ws_receiver) = server_ws.split();

        let (cmd_tx, _cmd_rx) = mpsc::channel(4);
        // Output capacity far below the chunk count, so the producer is
        // paused by the bounded sends rather than buffering freely.
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(4);
        let (_exit_tx, exit_rx) = tokio::sync::watch::channel(None);
        let shell = ShellHandle::for_tests(cmd_tx, output_rx, exit_rx);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let feeder = tokio::spawn(async move {
            for i in 0..200u32 {
                output_tx
                    .send(format!("chunk {i};").into_bytes())
                    .await
                    .unwrap();
            }
        });

        let pump = test_pump();
        let activity = Arc::new(ActivityTracker::new());
        let pump_task = tokio::spawn(async move {
            let mut ws_receiver = ws_receiver;
            let mut shell = shell;
            let mut shutdown = shutdown_rx;
            let mut on_resize = |_: u16, _: u16| {};
            pump.run(
                "pump-order",
                ws_sender,
                &mut ws_receiver,
                &mut shell,
                activity,
                &mut on_resize,
                &mut shutdown,
            )
            .await
        });

        // Let the producer run well ahead of the consumer first.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let codec = FrameCodec::new(1024);
        let mut received = Vec::new();
        while received.len() < 200 {
            match client.next().await {
                Some(Ok(Message::Binary(raw))) => match codec.decode(&raw).unwrap() {
                    Frame::Data(data) => {
                        received.push(String::from_utf8(data.to_vec()).unwrap());
                    }
                    Frame::Ping { .. } => {}
                    other => panic!("unexpected frame before shell end: {other:?}"),
                },
                other => panic!("unexpected message: {other:?}"),
            }
        }
        for (i, chunk) in received.iter().enumerate() {
            assert_eq!(chunk, &format!("chunk {i};"));
        }
        feeder.await.unwrap();

        // Output channel closed: the pump ends and hands the sink back
        // only after the sender has drained everything.
        let (sender, end) = pump_task.await.unwrap();
        assert_eq!(end, PumpEnd::ShellEnded);
        let mut sender = sender.expect("sink recovered after drain");

        let wire = codec.encode(&disconnect_frame("shell exited"));
        sender.send(Message::Binary(wire.to_vec())).await.unwrap();
        match client.next().await {
            Some(Ok(Message::Binary(raw))) => {
                assert!(matches!(
                    codec.decode(&raw).unwrap(),
                    Frame::Disconnect { .. }
                ));
            }
            other => panic!("expected the final disconnect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_dimension_resize_is_dropped_mid_stream() {
        let (server_ws, mut client) = ws_pair().await;
        let (ws_sender, ws_receiver) = server_ws.split();

        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(4);
        let (_exit_tx, exit_rx) = tokio::sync::watch::channel(None);
        let shell = ShellHandle::for_tests(cmd_tx, output_rx, exit_rx);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let resized = Arc::new(AtomicBool::new(false));
        let resized_flag = Arc::clone(&resized);

        let pump = test_pump();
        let activity = Arc::new(ActivityTracker::new());
        let pump_task = tokio::spawn(async move {
            let mut ws_receiver = ws_receiver;
            let mut shell = shell;
            let mut shutdown = shutdown_rx;
            let mut on_resize =
                move |_: u16, _: u16| resized_flag.store(true, Ordering::SeqCst);
            pump.run(
                "pump-resize",
                ws_sender,
                &mut ws_receiver,
                &mut shell,
                activity,
                &mut on_resize,
                &mut shutdown,
            )
            .await
        });

        let codec = FrameCodec::new(1024);
        let zero_resize = codec.encode(&Frame::Resize { rows: 0, cols: 80 });
        client
            .send(Message::Binary(zero_resize.to_vec()))
            .await
            .unwrap();
        let data = codec.encode(&Frame::Data(Bytes::from_static(b"still here")));
        client.send(Message::Binary(data.to_vec())).await.unwrap();

        // The session stayed up and only the data write reached the shell.
        match cmd_rx.recv().await.unwrap() {
            ShellCommand::Data(bytes) => assert_eq!(bytes, b"still here"),
            other => panic!("zero-dimension resize was forwarded: {other:?}"),
        }
        assert!(!resized.load(Ordering::SeqCst));

        let bye = codec.encode(&disconnect_frame("done"));
        client.send(Message::Binary(bye.to_vec())).await.unwrap();
        let (sender, end) = pump_task.await.unwrap();
        assert_eq!(end, PumpEnd::BrowserClosed);
        assert!(sender.is_some());
        drop(output_tx);
    }
}
