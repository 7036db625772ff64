//! Connection management for one account's websocket

mod liveness;
mod manager;
mod reconnect;
mod transport;

pub use liveness::{Liveness, LivenessMonitor};
pub use manager::{ConnectionEvent, ConnectionManager};
pub use reconnect::{reconnect_allowed, ExponentialBackoff, ReconnectPolicy};
pub use transport::{Transport, TransportEvent};
