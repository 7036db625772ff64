//! Response stream configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_millis;

/// Configuration for response streams and their registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// How long a started stream waits for its acknowledgement
    #[serde(rename = "ack_timeout_ms", with = "duration_millis")]
    pub ack_timeout: Duration,

    /// How long a finished stream stays registered while its ack is outstanding
    #[serde(rename = "disposal_grace_ms", with = "duration_millis")]
    pub disposal_grace: Duration,

    /// How often deadlines are checked
    #[serde(rename = "sweep_interval_ms", with = "duration_millis")]
    pub sweep_interval: Duration,

    /// Reply that is withheld when it follows tool activity (e.g. `NO_REPLY`)
    pub silent_reply_sentinel: Option<String>,

    /// Largest frame accepted in either direction
    pub max_frame_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            disposal_grace: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(250),
            silent_reply_sentinel: None,
            max_frame_bytes: sg_protocol::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}
