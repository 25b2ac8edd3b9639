//! Minute-granularity alarm latch.
//!
//! The buzzer is switched on once when the clock enters the alarm minute and
//! switched off when the minute changes or the alarm is dismissed. Only
//! transitions produce an [`AlarmAction`]; a buzzer that is already in the
//! requested state is left alone.

use crate::{error::ConfigError, types::ClockTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmAction {
    BuzzerOn,
    BuzzerOff,
}

/// Alarm time plus its trigger latch. `-1` in either field means unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmConfig {
    pub hour: i32,
    pub minute: i32,
    pub triggered: bool,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            hour: -1,
            minute: -1,
            triggered: false,
        }
    }
}

/// Accepts `h` in 0..=23 and `m` in 0..=59, or `(-1, -1)` for "no alarm".
pub(crate) fn validate_alarm(hour: i32, minute: i32) -> Result<(), ConfigError> {
    let clearing = hour == -1 && minute == -1;
    if clearing || ((0..=23).contains(&hour) && (0..=59).contains(&minute)) {
        Ok(())
    } else {
        Err(ConfigError::AlarmOutOfRange { hour, minute })
    }
}

impl AlarmConfig {
    pub fn is_set(&self) -> bool {
        self.hour >= 0 && self.minute >= 0
    }
}

#[derive(Debug, Clone)]
pub struct AlarmController {
    config: AlarmConfig,
    buzzer_on: bool,
    // A dismissal inside the alarm minute must not re-fire on the next poll.
    dismissed_in_minute: bool,
}

impl AlarmController {
    pub fn new(hour: i32, minute: i32) -> Self {
        let mut controller = Self {
            config: AlarmConfig::default(),
            buzzer_on: false,
            dismissed_in_minute: false,
        };
        if controller.set(hour, minute).is_err() {
            controller.config = AlarmConfig::default();
        }
        controller
    }

    pub fn config(&self) -> AlarmConfig {
        self.config
    }

    pub fn is_triggered(&self) -> bool {
        self.config.triggered
    }

    pub fn is_buzzer_on(&self) -> bool {
        self.buzzer_on
    }

    /// Accepts `h` in 0..=23 and `m` in 0..=59, or `(-1, -1)` to clear.
    /// Re-arms the latch; a sounding buzzer is switched off.
    pub fn set(&mut self, hour: i32, minute: i32) -> Result<Option<AlarmAction>, ConfigError> {
        validate_alarm(hour, minute)?;

        self.config = AlarmConfig {
            hour,
            minute,
            triggered: false,
        };
        self.dismissed_in_minute = false;
        Ok(self.switch_buzzer(false))
    }

    /// Fires at most once per alarm minute. A dismissal holds until the
    /// minute changes, and any minute other than the alarm's re-arms it.
    pub fn evaluate(&mut self, now: ClockTime) -> Option<AlarmAction> {
        if !self.config.is_set() {
            return self.switch_buzzer(false);
        }

        let hour = i32::from(now.hour);
        let minute = i32::from(now.minute);

        if hour == self.config.hour && minute == self.config.minute {
            if !self.config.triggered && !self.dismissed_in_minute {
                self.config.triggered = true;
                return self.switch_buzzer(true);
            }
            None
        } else if minute != self.config.minute {
            self.config.triggered = false;
            self.dismissed_in_minute = false;
            self.switch_buzzer(false)
        } else {
            None
        }
    }

    /// Silences the buzzer and clears the latch. Dismissing twice is a no-op.
    pub fn dismiss(&mut self) -> Option<AlarmAction> {
        if self.config.triggered {
            self.dismissed_in_minute = true;
        }
        self.config.triggered = false;
        self.switch_buzzer(false)
    }

    fn switch_buzzer(&mut self, on: bool) -> Option<AlarmAction> {
        if self.buzzer_on == on {
            return None;
        }
        self.buzzer_on = on;
        Some(if on {
            AlarmAction::BuzzerOn
        } else {
            AlarmAction::BuzzerOff
        })
    }
}
