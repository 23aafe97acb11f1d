//! Window-ack and inactivity timers for one session
//!
//! Two deadlines run side by side. The window timer paces retransmission of
//! whatever the session is currently waiting to have acknowledged; the
//! inactivity timer watches for the peer going silent altogether. Deadlines
//! are derived from the arm times so a live parameter update reflows them.

use std::time::Duration;
use tokio::time::Instant;

/// Which deadline fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// The window went unacknowledged for a full timeout
    WindowAck,
    /// No peer traffic for the whole inactivity timeout
    Inactivity,
}

/// Deadline bookkeeping for one session
#[derive(Debug)]
pub struct TransferTimers {
    timeout: Duration,
    inactivity: Duration,
    window_armed_at: Option<Instant>,
    last_activity: Option<Instant>,
}

impl TransferTimers {
    /// Create timers with the given window-ack and inactivity budgets
    pub fn new(timeout: Duration, inactivity: Duration) -> Self {
        Self {
            timeout,
            inactivity,
            window_armed_at: None,
            last_activity: None,
        }
    }

    /// Start (or restart) the window-ack countdown
    pub fn arm_window(&mut self, now: Instant) {
        self.window_armed_at = Some(now);
    }

    /// Stop the window-ack countdown
    pub fn clear_window(&mut self) {
        self.window_armed_at = None;
    }

    /// Record peer traffic, pushing the inactivity deadline out
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = Some(now);
    }

    /// Stop both countdowns
    pub fn cancel(&mut self) {
        self.window_armed_at = None;
        self.last_activity = None;
    }

    /// Adopt new budgets, reflowing any armed deadlines
    pub fn set_budgets(&mut self, timeout: Duration, inactivity: Duration) {
        self.timeout = timeout;
        self.inactivity = inactivity;
    }

    /// Earliest pending deadline, if any countdown is armed
    pub fn next_deadline(&self) -> Option<Instant> {
        let window = self.window_armed_at.map(|t| t + self.timeout);
        let idle = self.last_activity.map(|t| t + self.inactivity);
        match (window, idle) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (v @ Some(_), None) | (None, v @ Some(_)) => v,
            (None, None) => None,
        }
    }

    /// Which countdown, if any, has expired at `now`
    ///
    /// Inactivity wins a tie; it is the stronger condition.
    pub fn expired(&self, now: Instant) -> Option<TimerKind> {
        if let Some(t) = self.last_activity {
            if now >= t + self.inactivity {
                return Some(TimerKind::Inactivity);
            }
        }
        if let Some(t) = self.window_armed_at {
            if now >= t + self.timeout {
                return Some(TimerKind::WindowAck);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_window_deadline_fires_first() {
        let mut timers = TransferTimers::new(Duration::from_secs(1), Duration::from_secs(10));
        let now = Instant::now();
        timers.arm_window(now);
        timers.touch(now);

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(1)));
        assert_eq!(timers.expired(now), None);
        assert_eq!(
            timers.expired(now + Duration::from_secs(1)),
            Some(TimerKind::WindowAck)
        );
    }

    #[tokio::test]
    async fn test_inactivity_outlasts_window_resets() {
        let mut timers = TransferTimers::new(Duration::from_secs(1), Duration::from_secs(3));
        let start = Instant::now();
        timers.touch(start);

        // window keeps getting re-armed, peer stays silent
        timers.arm_window(start + Duration::from_secs(1));
        timers.arm_window(start + Duration::from_secs(2));
        assert_eq!(
            timers.expired(start + Duration::from_secs(3)),
            Some(TimerKind::Inactivity)
        );
    }

    #[tokio::test]
    async fn test_budget_update_reflows_armed_deadline() {
        let mut timers = TransferTimers::new(Duration::from_secs(5), Duration::from_secs(60));
        let now = Instant::now();
        timers.arm_window(now);

        timers.set_budgets(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(
            timers.expired(now + Duration::from_secs(1)),
            Some(TimerKind::WindowAck)
        );
    }

    #[tokio::test]
    async fn test_cancel_disarms_everything() {
        let mut timers = TransferTimers::new(Duration::from_secs(1), Duration::from_secs(1));
        let now = Instant::now();
        timers.arm_window(now);
        timers.touch(now);
        timers.cancel();
        assert_eq!(timers.next_deadline(), None);
        assert_eq!(timers.expired(now + Duration::from_secs(5)), None);
    }
}
