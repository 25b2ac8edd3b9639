use crate::types::ClockTime;

/// Decides the hour and half-hour beeps.
///
/// Double pulse at `hh:00:00`, single pulse at `hh:30:00`. Each boundary is
/// announced at most once even though the loop sees second zero several
/// times per second.
#[derive(Debug, Clone, Default)]
pub struct ChimePlanner {
    last_announced: Option<(u8, u8)>,
}

impl ChimePlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pulse count to play, if any.
    pub fn check(&mut self, now: ClockTime, alarm_triggered: bool) -> Option<u8> {
        if now.second != 0 {
            return None;
        }
        let pulses = match now.minute {
            0 => 2,
            30 => 1,
            _ => return None,
        };

        let key = (now.hour, now.minute);
        if self.last_announced == Some(key) {
            return None;
        }
        self.last_announced = Some(key);

        if alarm_triggered {
            return None;
        }
        Some(pulses)
    }
}
