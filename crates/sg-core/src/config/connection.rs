//! Connection lifecycle configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};

/// Exponential backoff configuration for reconnects.
///
/// The delay before attempt `n` is `min(base * 2^n, max)`, scaled by a
/// random factor in `[0.5, 1.0)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first reconnect
    #[serde(rename = "base_ms", with = "duration_millis")]
    pub base: Duration,

    /// Upper bound for any single delay
    #[serde(rename = "max_ms", with = "duration_millis")]
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// Liveness detection configuration.
///
/// Two independent probes run while the socket is open: an application
/// `ping` frame answered by a `pong` frame, and a websocket control ping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Interval between application-level ping frames
    #[serde(with = "duration_secs")]
    pub ping_interval: Duration,

    /// Missed ping intervals tolerated before forcing a reconnect
    pub pong_tolerance: u32,

    /// Interval between websocket control pings
    #[serde(with = "duration_secs")]
    pub probe_interval: Duration,

    /// Idle time (no control pong and no inbound frame) before the socket is dropped
    #[serde(with = "duration_secs")]
    pub idle_threshold: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_tolerance: 3,
            probe_interval: Duration::from_secs(15),
            idle_threshold: Duration::from_secs(45),
        }
    }
}

impl LivenessConfig {
    /// Longest tolerated silence after an application ping
    pub fn pong_deadline(&self) -> Duration {
        self.ping_interval.saturating_mul(self.pong_tolerance)
    }
}
