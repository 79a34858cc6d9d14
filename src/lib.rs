//! webssh-bridge - a WebSocket-to-SSH terminal bridge.
//!
//! Browsers connect over a persistent WebSocket, hand over a target and
//! credentials in a JSON handshake, and from then on exchange binary
//! frames (data, resize, disconnect, keepalive) with a remote shell
//! reached over SSH. The bridge multiplexes many independent sessions,
//! pumps bytes with backpressure in both directions, and tears every
//! session down cleanly whichever side fails first.

pub mod bridge;
pub mod config;
pub mod protocol;
pub mod session;
pub mod ssh;

pub use bridge::BridgeServer;
pub use config::BridgeConfig;
