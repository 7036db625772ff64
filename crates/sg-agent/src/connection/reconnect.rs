//! Exponential backoff for reconnection

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sg_core::config::BackoffConfig;
use sg_protocol::SUPERSEDED_CLOSE_CODE;

/// Largest exponent applied to the base delay; beyond this the cap always wins
const MAX_EXPONENT: u32 = 30;

/// Exponential backoff with multiplicative jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay before the first retry
    base: Duration,
    /// Maximum delay before jitter
    max: Duration,
    /// Number of retries scheduled since the last reset
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.base, config.max)
    }

    /// Create a new backoff with custom parameters
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Number of retries scheduled since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Un-jittered delay for the current attempt: `min(base * 2^attempt, max)`
    pub fn ceiling(&self) -> Duration {
        let factor = 2f64.powi(self.attempt.min(MAX_EXPONENT) as i32);
        let scaled = self.base.as_secs_f64() * factor;
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }

    /// Get the next delay and advance the backoff.
    ///
    /// The delay is the ceiling scaled by a random factor in `[0.5, 1.0)`.
    pub fn next_delay<R: Rng>(&mut self, rng: &mut R) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        ceiling.mul_f64(rng.gen_range(0.5..1.0))
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Whether a close code allows an automatic reconnect
pub fn reconnect_allowed(close_code: Option<u16>) -> bool {
    close_code != Some(SUPERSEDED_CLOSE_CODE)
}

/// Decides whether and when to reconnect after the socket goes away
#[derive(Debug)]
pub struct ReconnectPolicy {
    backoff: ExponentialBackoff,
    rng: StdRng,
}

impl ReconnectPolicy {
    /// Create a policy with an entropy-seeded jitter source
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            backoff: ExponentialBackoff::from_config(config),
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a policy with a fixed jitter seed
    pub fn with_seed(config: &BackoffConfig, seed: u64) -> Self {
        Self {
            backoff: ExponentialBackoff::from_config(config),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// The socket opened successfully
    pub fn on_open(&mut self) {
        self.backoff.reset();
    }

    /// The socket closed. Returns the delay before the next attempt, or
    /// `None` when the close code forbids reconnecting.
    pub fn on_close(&mut self, close_code: Option<u16>) -> Option<Duration> {
        if !reconnect_allowed(close_code) {
            return None;
        }
        Some(self.backoff.next_delay(&mut self.rng))
    }

    /// A connection attempt failed before the socket opened
    pub fn on_connect_failure(&mut self) -> Duration {
        self.backoff.next_delay(&mut self.rng)
    }

    /// Retries scheduled since the last successful open
    pub fn attempt(&self) -> u32 {
        self.backoff.attempt()
    }
}
