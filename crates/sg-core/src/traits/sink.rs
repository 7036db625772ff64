//! Outbound stream primitives

use sg_protocol::{MessageId, StructuredEvent};

/// Send primitives a response stream is written through.
///
/// Every method reports whether the frame was handed to the transport.
/// `false` means "not currently connected"; nothing is queued or retried.
pub trait StreamSink: Send + Sync {
    /// Ask the remote side to open a response stream
    fn start_stream(&self, message_id: &MessageId) -> bool;

    /// Send a text delta
    fn stream_token(&self, message_id: &MessageId, text: &str) -> bool;

    /// Send a structured outcome
    fn stream_event(&self, message_id: &MessageId, event: &StructuredEvent) -> bool;

    /// Keep a quiet stream from idling out
    fn stream_heartbeat(&self, message_id: &MessageId) -> bool;

    /// Close the stream
    fn finish_stream(&self, message_id: &MessageId) -> bool;
}
