//! The WebSocket bridge: listener, per-connection lifecycle, and the
//! per-session pump.

mod pump;
mod server;

pub use pump::{BridgePump, PumpEnd, WsSink, WsSource};
pub use server::{BridgeError, BridgeServer};
