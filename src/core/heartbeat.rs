use std::time::{Duration, Instant};

/// Heartbeat bookkeeping for the session watchdog.
///
/// The session sends a PING command every `interval` and arms a `pong_wait`
/// deadline after each send. Any inbound frame counts as liveness and defuses
/// the armed deadline; a deadline that fires with no inbound traffic since the
/// ping forces a disconnect.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    pong_wait: Duration,
    seq: u64,
    last_ping_at: Option<Instant>,
    last_inbound_at: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, pong_wait: Duration) -> Self {
        Self {
            interval,
            pong_wait,
            seq: 0,
            last_ping_at: None,
            last_inbound_at: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn pong_wait(&self) -> Duration {
        self.pong_wait
    }

    /// Record an outbound ping; returns the sequence number guarding its
    /// pong-wait deadline.
    pub fn mark_ping(&mut self) -> u64 {
        self.seq = self.seq.wrapping_add(1);
        self.last_ping_at = Some(Instant::now());
        self.seq
    }

    /// Record any inbound frame (reply, push or transport heartbeat).
    pub fn mark_inbound(&mut self) {
        self.last_inbound_at = Some(Instant::now());
    }

    /// True if the deadline guarded by `seq` fired without inbound traffic
    /// since the matching ping. A stale `seq` (superseded ping or reset)
    /// never reports stale.
    pub fn is_stale(&self, seq: u64) -> bool {
        if self.seq != seq {
            return false;
        }
        match (self.last_ping_at, self.last_inbound_at) {
            (Some(ping), Some(inbound)) => inbound < ping,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Invalidate outstanding deadlines; called on connect and disconnect.
    pub fn reset(&mut self) {
        self.seq = self.seq.wrapping_add(1);
        self.last_ping_at = None;
        self.last_inbound_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(Duration::from_secs(30), Duration::from_secs(5))
    }

    #[test]
    fn inbound_traffic_defuses_the_deadline() {
        let mut hb = monitor();
        let seq = hb.mark_ping();
        hb.mark_inbound();
        assert!(!hb.is_stale(seq));
    }

    #[test]
    fn silence_after_ping_reports_stale() {
        let mut hb = monitor();
        let seq = hb.mark_ping();
        assert!(hb.is_stale(seq));
    }

    #[test]
    fn superseded_or_reset_deadlines_never_fire() {
        let mut hb = monitor();
        let first = hb.mark_ping();
        let second = hb.mark_ping();
        assert!(!hb.is_stale(first));
        assert!(hb.is_stale(second));

        hb.reset();
        assert!(!hb.is_stale(second));
    }

    #[test]
    fn inbound_older_than_ping_still_counts_as_stale() {
        let mut hb = monitor();
        hb.mark_inbound();
        std::thread::sleep(Duration::from_millis(2));
        let seq = hb.mark_ping();
        assert!(hb.is_stale(seq));
    }
}
