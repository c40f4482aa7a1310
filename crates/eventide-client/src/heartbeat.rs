//! Heartbeat monitoring for the transport connection.
//!
//! The monitor is a pure state machine driven by the scheduler's tick and
//! fed by package-received signals. Any inbound traffic counts as liveness;
//! heartbeats never touch an operation's retry budget.

use std::time::{Duration, Instant};

/// What the scheduler should do after a heartbeat check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatAction {
    /// Connection is live; nothing to do.
    None,
    /// Idle past the interval; send a heartbeat probe.
    SendProbe,
    /// No traffic within the timeout after a probe; the connection is
    /// unhealthy and must be force-closed.
    TimedOut,
}

/// Tracks connection idleness and probe timeouts.
#[derive(Debug)]
pub(crate) struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    last_traffic: Instant,
    probe_sent_at: Option<Instant>,
}

impl HeartbeatMonitor {
    /// Creates a monitor with the given idle interval and probe timeout.
    pub(crate) fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            last_traffic: Instant::now(),
            probe_sent_at: None,
        }
    }

    /// Records inbound traffic, clearing any outstanding probe.
    pub(crate) fn on_package_received(&mut self, now: Instant) {
        self.last_traffic = now;
        self.probe_sent_at = None;
    }

    /// Restarts the idle clock, e.g. after a (re)connect.
    pub(crate) fn reset(&mut self, now: Instant) {
        self.last_traffic = now;
        self.probe_sent_at = None;
    }

    /// Advances the state machine; called once per scheduler tick.
    pub(crate) fn check(&mut self, now: Instant) -> HeartbeatAction {
        if let Some(sent_at) = self.probe_sent_at {
            if now.duration_since(sent_at) >= self.timeout {
                return HeartbeatAction::TimedOut;
            }
            return HeartbeatAction::None;
        }
        if now.duration_since(self.last_traffic) >= self.interval {
            self.probe_sent_at = Some(now);
            return HeartbeatAction::SendProbe;
        }
        HeartbeatAction::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(Duration::from_millis(750), Duration::from_millis(1500))
    }

    #[test]
    fn test_quiet_connection_gets_probe_after_interval() {
        let mut m = monitor();
        let start = Instant::now();
        m.reset(start);
        assert_eq!(m.check(start + Duration::from_millis(100)), HeartbeatAction::None);
        assert_eq!(
            m.check(start + Duration::from_millis(800)),
            HeartbeatAction::SendProbe
        );
    }

    #[test]
    fn test_traffic_defers_probe() {
        let mut m = monitor();
        let start = Instant::now();
        m.reset(start);
        m.on_package_received(start + Duration::from_millis(700));
        assert_eq!(
            m.check(start + Duration::from_millis(800)),
            HeartbeatAction::None
        );
        assert_eq!(
            m.check(start + Duration::from_millis(1500)),
            HeartbeatAction::SendProbe
        );
    }

    #[test]
    fn test_probe_answered_by_any_traffic() {
        let mut m = monitor();
        let start = Instant::now();
        m.reset(start);
        assert_eq!(
            m.check(start + Duration::from_millis(800)),
            HeartbeatAction::SendProbe
        );
        m.on_package_received(start + Duration::from_millis(900));
        assert_eq!(
            m.check(start + Duration::from_millis(2000)),
            HeartbeatAction::None
        );
    }

    #[test]
    fn test_unanswered_probe_times_out() {
        let mut m = monitor();
        let start = Instant::now();
        m.reset(start);
        assert_eq!(
            m.check(start + Duration::from_millis(800)),
            HeartbeatAction::SendProbe
        );
        assert_eq!(
            m.check(start + Duration::from_millis(1000)),
            HeartbeatAction::None
        );
        assert_eq!(
            m.check(start + Duration::from_millis(2400)),
            HeartbeatAction::TimedOut
        );
    }

    #[test]
    fn test_only_one_probe_per_idle_period() {
        let mut m = monitor();
        let start = Instant::now();
        m.reset(start);
        assert_eq!(
            m.check(start + Duration::from_millis(800)),
            HeartbeatAction::SendProbe
        );
        // a second tick inside the timeout window does not re-probe
        assert_eq!(
            m.check(start + Duration::from_millis(1600)),
            HeartbeatAction::None
        );
    }

    #[test]
    fn test_reset_clears_outstanding_probe() {
        let mut m = monitor();
        let start = Instant::now();
        m.reset(start);
        assert_eq!(
            m.check(start + Duration::from_millis(800)),
            HeartbeatAction::SendProbe
        );
        m.reset(start + Duration::from_millis(900));
        assert_eq!(
            m.check(start + Duration::from_millis(2400)),
            HeartbeatAction::None
        );
    }
}
