//! sg-protocol: Wire protocol for streamgate
//!
//! This crate defines the JSON frames exchanged between the agent and the
//! remote chat service over a single long-lived websocket, plus the codec
//! and identifiers used to multiplex many response streams on it.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message_id;

pub use codec::{FrameCodec, DEFAULT_MAX_FRAME_BYTES};
pub use error::ProtocolError;
pub use frame::{
    Frame, FrameType, RequestType, StreamEvent, StructuredEvent, Trigger, PROTOCOL_VERSION,
    SUPERSEDED_CLOSE_CODE,
};
pub use message_id::MessageId;
