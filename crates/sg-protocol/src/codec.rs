//! JSON codec for protocol frames

use crate::error::ProtocolError;
use crate::frame::Frame;

/// Default maximum encoded frame size (1 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Codec for encoding/decoding protocol frames to websocket text payloads
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Largest frame accepted in either direction
    max_frame_bytes: usize,
}

impl FrameCodec {
    /// Create a new codec with the default size limit
    pub fn new() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Create a codec with a custom size limit
    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    /// Encode a frame into a JSON string
    pub fn encode(&self, frame: &Frame) -> Result<String, ProtocolError> {
        let text = serde_json::to_string(frame)?;
        self.check_size(text.len())?;
        Ok(text)
    }

    /// Decode a JSON string into a frame
    pub fn decode(&self, text: &str) -> Result<Frame, ProtocolError> {
        self.check_size(text.len())?;
        Ok(serde_json::from_str(text)?)
    }

    /// Decode a binary payload that should contain a UTF-8 JSON frame
    pub fn decode_bytes(&self, data: &[u8]) -> Result<Frame, ProtocolError> {
        self.check_size(data.len())?;
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(serde_json::from_str(text)?)
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_frame_bytes {
            return Err(ProtocolError::PayloadTooLarge {
                size,
                max: self.max_frame_bytes,
            });
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
