//! Frame types for the streamgate protocol
//!
//! Every websocket text message carries exactly one JSON frame, tagged by
//! its `type` field.
//!
//! # Message Flow
//!
//! Typical sequence for one response stream:
//!
//! 1. Remote sends `trigger` for a new inbound message
//! 2. Agent sends `start_response` once it has something to stream
//! 3. Remote answers with `ack` (or `error`) for the `start_response` request
//! 4. Agent sends `stream_event` frames (tokens and structured outcomes)
//! 5. Agent sends `finish_response`
//!
//! `ping`/`pong` frames are keepalives and may flow in either direction at
//! any time. They are never associated with a stream.

use serde::{Deserialize, Serialize};

use crate::message_id::MessageId;

/// Current protocol version string, sent in the handshake request.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Websocket close code meaning "this connection was replaced by a newer one".
///
/// A client receiving it must not reconnect, otherwise two sockets for the
/// same account keep evicting each other.
pub const SUPERSEDED_CLOSE_CODE: u16 = 4000;

/// An inbound message that needs a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Identifier of the message to answer
    pub message_id: MessageId,
    /// Conversation the message belongs to
    pub conversation_id: String,
    /// Display name or id of the sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Message body
    pub text: String,
}

/// An opaque, tagged payload streamed alongside text (tool calls, tool results, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredEvent {
    /// Event tag, e.g. `tool_call` or `tool_result`
    pub tag: String,
    /// Arbitrary payload
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl StructuredEvent {
    /// Create a new structured event
    pub fn new(tag: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            tag: tag.into(),
            payload,
        }
    }

    /// Whether this event reports tool activity
    pub fn is_tool(&self) -> bool {
        self.tag.starts_with("tool")
    }
}

/// Body of a `stream_event` frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A text delta
    Token { text: String },
    /// A structured outcome
    Outcome(StructuredEvent),
}

/// Agent requests the remote side acknowledges or rejects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    StartResponse,
    StreamEvent,
    FinishResponse,
    Heartbeat,
    ProactiveSend,
}

impl RequestType {
    /// Wire name of the request type
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::StartResponse => "start_response",
            RequestType::StreamEvent => "stream_event",
            RequestType::FinishResponse => "finish_response",
            RequestType::Heartbeat => "heartbeat",
            RequestType::ProactiveSend => "proactive_send",
        }
    }
}

/// Frame type identifier, used for routing and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Trigger,
    StartResponse,
    StreamEvent,
    FinishResponse,
    Heartbeat,
    ProactiveSend,
    Ping,
    Pong,
    Ack,
    Error,
}

impl FrameType {
    /// Wire name of the frame type
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Trigger => "trigger",
            FrameType::StartResponse => "start_response",
            FrameType::StreamEvent => "stream_event",
            FrameType::FinishResponse => "finish_response",
            FrameType::Heartbeat => "heartbeat",
            FrameType::ProactiveSend => "proactive_send",
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
            FrameType::Ack => "ack",
            FrameType::Error => "error",
        }
    }

    /// Keepalive frames are consumed by the connection and never forwarded
    pub fn is_keepalive(&self) -> bool {
        matches!(self, FrameType::Ping | FrameType::Pong)
    }
}

/// Protocol frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// A new message needs a response (remote → agent)
    Trigger(Trigger),

    /// Open a response stream for a message (agent → remote)
    StartResponse { message_id: MessageId },

    /// Stream data for an open response (agent → remote)
    StreamEvent {
        message_id: MessageId,
        event: StreamEvent,
    },

    /// Close a response stream (agent → remote)
    FinishResponse { message_id: MessageId },

    /// Keep a slow response stream from idling out (agent → remote)
    Heartbeat { message_id: MessageId },

    /// Unsolicited message into a conversation (agent → remote)
    ProactiveSend {
        conversation_id: String,
        text: String,
    },

    /// Keepalive request (either direction)
    Ping {
        /// Sender's clock in milliseconds
        timestamp: u64,
    },

    /// Keepalive reply (either direction)
    Pong {
        /// Echo of the request timestamp
        timestamp: u64,
    },

    /// Request accepted (remote → agent).
    ///
    /// The remote side only echoes `message_id` for some request types, so
    /// correlation may have to fall back to arrival order.
    Ack {
        request_type: RequestType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
    },

    /// Request rejected (remote → agent)
    Error {
        request_type: RequestType,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
}

impl Frame {
    /// Get the frame type
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Trigger(_) => FrameType::Trigger,
            Frame::StartResponse { .. } => FrameType::StartResponse,
            Frame::StreamEvent { .. } => FrameType::StreamEvent,
            Frame::FinishResponse { .. } => FrameType::FinishResponse,
            Frame::Heartbeat { .. } => FrameType::Heartbeat,
            Frame::ProactiveSend { .. } => FrameType::ProactiveSend,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
        }
    }

    /// Build a text token frame
    pub fn token(message_id: MessageId, text: impl Into<String>) -> Self {
        Frame::StreamEvent {
            message_id,
            event: StreamEvent::Token { text: text.into() },
        }
    }

    /// Build a structured outcome frame
    pub fn outcome(message_id: MessageId, event: StructuredEvent) -> Self {
        Frame::StreamEvent {
            message_id,
            event: StreamEvent::Outcome(event),
        }
    }
}
