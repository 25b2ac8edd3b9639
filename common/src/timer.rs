/// A single-slot one-shot timer handle.
///
/// Arming while already armed cancels the pending expiry and starts over,
/// so at most one expiry is ever in flight.
pub trait TimerSlot {
    fn arm(&mut self, delay_ms: u64);
    fn cancel(&mut self);
    fn is_armed(&self) -> bool;
}

/// Deterministic timer driven by an externally supplied millisecond clock.
#[derive(Debug, Clone, Default)]
pub struct DeadlineTimer {
    now_ms: u64,
    deadline_ms: Option<u64>,
}

impl DeadlineTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deadline_ms(&self) -> Option<u64> {
        self.deadline_ms
    }

    /// Advances the clock; returns true exactly once when the deadline passes.
    pub fn fire_if_due(&mut self, now_ms: u64) -> bool {
        self.now_ms = now_ms;
        match self.deadline_ms {
            Some(deadline) if now_ms >= deadline => {
                self.deadline_ms = None;
                true
            }
            _ => false,
        }
    }
}

impl TimerSlot for DeadlineTimer {
    fn arm(&mut self, delay_ms: u64) {
        self.deadline_ms = Some(self.now_ms.saturating_add(delay_ms));
    }

    fn cancel(&mut self) {
        self.deadline_ms = None;
    }

    fn is_armed(&self) -> bool {
        self.deadline_ms.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_at_deadline() {
        let mut timer = DeadlineTimer::new();
        timer.arm(1_000);
        assert!(!timer.fire_if_due(999));
        assert!(timer.fire_if_due(1_000));
        assert!(!timer.fire_if_due(5_000));
        assert!(!timer.is_armed());
    }

    #[test]
    fn rearm_restarts_the_delay() {
        let mut timer = DeadlineTimer::new();
        timer.arm(1_000);
        timer.fire_if_due(800);
        timer.arm(1_000);
        assert!(!timer.fire_if_due(1_200));
        assert!(timer.fire_if_due(1_800));
    }

    #[test]
    fn cancel_drops_pending_expiry() {
        let mut timer = DeadlineTimer::new();
        timer.arm(10);
        timer.cancel();
        assert!(!timer.fire_if_due(100));
    }
}
