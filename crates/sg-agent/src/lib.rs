//! sg-agent: Streaming reply agent for streamgate
//!
//! The agent holds one long-lived websocket per chat-service account and
//! streams replies to inbound messages over it. Many replies share the
//! socket; each one waits for the remote side to acknowledge its start
//! before any of its data goes out.

pub mod connection;
pub mod dispatch;
pub mod state;
pub mod stream;

pub use state::AccountRuntime;
