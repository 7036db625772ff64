//! Response streams
//!
//! A [`StreamSession`] turns producer output into start/token/event/finish
//! frames behind the start acknowledgement gate. The [`SessionRegistry`]
//! owns the live sessions of one account and routes acknowledgements.

mod ack;
mod filter;
mod registry;
mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use ack::AckTable;
pub use filter::SentinelFilter;
pub use registry::{SessionRegistry, SweepReport};
pub use session::{StreamSession, StreamState};
