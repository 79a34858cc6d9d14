//! Session management: lifecycle state machine, registry with admission
//! control, and the forced-reconnect path.

mod reconnect;
mod registry;
mod state;
mod types;

pub use reconnect::{ReconnectController, ReconnectError, ReconnectSpec};
pub use registry::{RegistryError, SessionRegistry};
pub use state::{SessionState, SessionStateMachine, StateError};
pub use types::{ActivityTracker, ConnectRequest, SessionInfo};
