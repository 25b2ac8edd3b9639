use crate::types::PinLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEdge {
    /// Stable falling edge on the active-low input.
    Pressed,
    Released,
}

/// Debouncer for an active-low push button with a pull-up.
///
/// A level change only counts once the raw input has held the new level for
/// the whole window. Every flip inside the window restarts it, so contact
/// bounce collapses into at most one edge.
#[derive(Debug, Clone)]
pub struct DebouncedButton {
    window_ms: u64,
    stable: PinLevel,
    candidate: PinLevel,
    candidate_since_ms: u64,
}

impl DebouncedButton {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            stable: PinLevel::High,
            candidate: PinLevel::High,
            candidate_since_ms: 0,
        }
    }

    pub fn is_pressed(&self) -> bool {
        self.stable == PinLevel::Low
    }

    pub fn sample(&mut self, level: PinLevel, now_ms: u64) -> Option<ButtonEdge> {
        if level != self.candidate {
            self.candidate = level;
            self.candidate_since_ms = now_ms;
            return None;
        }

        if self.candidate == self.stable
            || now_ms.saturating_sub(self.candidate_since_ms) < self.window_ms
        {
            return None;
        }

        self.stable = self.candidate;
        Some(match self.stable {
            PinLevel::Low => ButtonEdge::Pressed,
            PinLevel::High => ButtonEdge::Released,
        })
    }
}
