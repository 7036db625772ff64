//! Connection liveness tracking
//!
//! Two independent signals decide whether an open socket is still usable:
//!
//! - application `ping` frames must be answered by `pong` frames within
//!   `ping_interval * pong_tolerance`. Intermediaries can swallow these while
//!   the socket itself stays open.
//! - websocket control pings. The socket counts as idle when neither a
//!   control pong nor any inbound frame arrived within `idle_threshold`.

use std::time::{Duration, Instant};

use sg_core::config::LivenessConfig;

/// Verdict of a liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Link looks healthy
    Alive,
    /// No application `pong` for too long
    PongOverdue(Duration),
    /// No control pong or inbound frame for too long
    Idle(Duration),
}

/// Activity timestamps for one open socket
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    pong_deadline: Duration,
    idle_threshold: Duration,
    last_app_pong: Instant,
    last_control_pong: Instant,
    last_inbound: Instant,
}

impl LivenessMonitor {
    /// Start tracking a socket that opened at `opened_at`
    pub fn new(config: &LivenessConfig, opened_at: Instant) -> Self {
        Self {
            pong_deadline: config.pong_deadline(),
            idle_threshold: config.idle_threshold,
            last_app_pong: opened_at,
            last_control_pong: opened_at,
            last_inbound: opened_at,
        }
    }

    /// Any frame arrived
    pub fn record_inbound(&mut self, at: Instant) {
        self.last_inbound = self.last_inbound.max(at);
    }

    /// An application `pong` frame arrived
    pub fn record_app_pong(&mut self, at: Instant) {
        self.last_app_pong = self.last_app_pong.max(at);
    }

    /// A websocket control pong arrived
    pub fn record_control_pong(&mut self, at: Instant) {
        self.last_control_pong = self.last_control_pong.max(at);
    }

    /// Time since the last application pong
    pub fn since_app_pong(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_app_pong)
    }

    /// Time since the most recent control pong or inbound frame
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_control_pong.max(self.last_inbound))
    }

    /// Check the application-level probe
    pub fn check_app(&self, now: Instant) -> Liveness {
        let silent = self.since_app_pong(now);
        if silent > self.pong_deadline {
            Liveness::PongOverdue(silent)
        } else {
            Liveness::Alive
        }
    }

    /// Check the transport-level probe
    pub fn check_control(&self, now: Instant) -> Liveness {
        let idle = self.idle_for(now);
        if idle > self.idle_threshold {
            Liveness::Idle(idle)
        } else {
            Liveness::Alive
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LivenessConfig {
        LivenessConfig {
            ping_interval: Duration::from_secs(10),
            pong_tolerance: 3,
            probe_interval: Duration::from_secs(5),
            idle_threshold: Duration::from_secs(20),
        }
    }

    #[test]
    fn test_fresh_socket_is_alive() {
        let t0 = Instant::now();
        let monitor = LivenessMonitor::new(&config(), t0);
        assert_eq!(monitor.check_app(t0), Liveness::Alive);
        assert_eq!(monitor.check_control(t0), Liveness::Alive);
    }

    #[test]
    fn test_pong_overdue_after_tolerance() {
        let t0 = Instant::now();
        let mut monitor = LivenessMonitor::new(&config(), t0);

        assert_eq!(monitor.check_app(t0 + Duration::from_secs(30)), Liveness::Alive);
        assert!(matches!(
            monitor.check_app(t0 + Duration::from_secs(31)),
            Liveness::PongOverdue(_)
        ));

        monitor.record_app_pong(t0 + Duration::from_secs(25));
        assert_eq!(monitor.check_app(t0 + Duration::from_secs(31)), Liveness::Alive);
    }

    #[test]
    fn test_inbound_traffic_keeps_control_probe_alive() {
        let t0 = Instant::now();
        let mut monitor = LivenessMonitor::new(&config(), t0);

        monitor.record_inbound(t0 + Duration::from_secs(15));
        assert_eq!(
            monitor.check_control(t0 + Duration::from_secs(30)),
            Liveness::Alive
        );
        assert_eq!(
            monitor.check_control(t0 + Duration::from_secs(36)),
            Liveness::Idle(Duration::from_secs(21))
        );
    }

    #[test]
    fn test_control_pong_keeps_control_probe_alive() {
        let t0 = Instant::now();
        let mut monitor = LivenessMonitor::new(&config(), t0);

        monitor.record_control_pong(t0 + Duration::from_secs(18));
        assert_eq!(monitor.idle_for(t0 + Duration::from_secs(20)), Duration::from_secs(2));
    }

    #[test]
    fn test_application_pong_does_not_count_as_control_activity() {
        let t0 = Instant::now();
        let mut monitor = LivenessMonitor::new(&config(), t0);

        monitor.record_app_pong(t0 + Duration::from_secs(19));
        assert!(matches!(
            monitor.check_control(t0 + Duration::from_secs(21)),
            Liveness::Idle(_)
        ));
    }

    #[test]
    fn test_out_of_order_records_never_move_backwards() {
        let t0 = Instant::now();
        let mut monitor = LivenessMonitor::new(&config(), t0);

        monitor.record_inbound(t0 + Duration::from_secs(10));
        monitor.record_inbound(t0 + Duration::from_secs(5));
        assert_eq!(monitor.idle_for(t0 + Duration::from_secs(10)), Duration::ZERO);
    }
}
