use chrono::{DateTime, TimeZone, Utc};

use crate::{
    alarm::{AlarmAction, AlarmConfig, AlarmController},
    button::{ButtonEdge, DebouncedButton},
    chime::ChimePlanner,
    config::{DisplayConfig, RuntimeConfig},
    display::{DisplayDriver, DisplayFrame},
    error::ConfigError,
    types::{AlarmView, ClockTime, PinLevel, TimezoneOffset},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockAction {
    Render { hour: u8, minute: u8, second: u8 },
    AmPmIndicator(bool),
    SecondsIndicator(bool),
    Chime { pulses: u8 },
    BuzzerOn,
    BuzzerOff,
}

impl From<AlarmAction> for ClockAction {
    fn from(action: AlarmAction) -> Self {
        match action {
            AlarmAction::BuzzerOn => Self::BuzzerOn,
            AlarmAction::BuzzerOff => Self::BuzzerOff,
        }
    }
}

/// Physical outputs driven by [`ClockAction`]s.
pub trait ClockOutputs: DisplayDriver {
    fn set_buzzer(&mut self, on: bool);
    fn set_seconds_led(&mut self, on: bool);
    fn set_pm_led(&mut self, pm: bool);
    /// May block for the length of the pulses.
    fn chime(&mut self, pulses: u8);
}

pub fn apply_actions<O: ClockOutputs + ?Sized>(outputs: &mut O, actions: &[ClockAction]) {
    for action in actions {
        match *action {
            ClockAction::Render {
                hour,
                minute,
                second,
            } => outputs.render(hour, minute, second),
            ClockAction::AmPmIndicator(pm) => outputs.set_pm_led(pm),
            ClockAction::SecondsIndicator(on) => outputs.set_seconds_led(on),
            ClockAction::Chime { pulses } => outputs.chime(pulses),
            ClockAction::BuzzerOn => outputs.set_buzzer(true),
            ClockAction::BuzzerOff => outputs.set_buzzer(false),
        }
    }
}

/// The UTC instant at which the local clock reads `time` today.
pub fn retarget_wall_clock(
    now_utc: DateTime<Utc>,
    offset: TimezoneOffset,
    time: ClockTime,
) -> Option<DateTime<Utc>> {
    let zone = offset.fixed();
    let local_date = now_utc.with_timezone(&zone).date_naive();
    let naive = local_date.and_hms_opt(time.hour.into(), time.minute.into(), time.second.into())?;
    zone.from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
}

/// One pass of the control loop. Holds no platform handles; the caller
/// feeds it time and the raw button level and executes what comes back.
pub struct ClockEngine {
    display: DisplayConfig,
    alarm: AlarmController,
    chime: ChimePlanner,
    button: DebouncedButton,
    last_second: Option<u8>,
    seconds_led: bool,
}

impl ClockEngine {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            display: config.display,
            alarm: AlarmController::new(config.settings.alarm_hour, config.settings.alarm_minute),
            chime: ChimePlanner::new(),
            button: DebouncedButton::new(config.clock.debounce_ms),
            last_second: None,
            seconds_led: false,
        }
    }

    pub fn alarm(&self) -> AlarmConfig {
        self.alarm.config()
    }

    pub fn alarm_view(&self) -> AlarmView {
        let alarm = self.alarm.config();
        AlarmView {
            hour: alarm.hour,
            minute: alarm.minute,
            set: alarm.is_set(),
            triggered: alarm.triggered,
        }
    }

    pub fn tick(&mut self, now: ClockTime, button: PinLevel, now_ms: u64) -> Vec<ClockAction> {
        let mut actions = Vec::new();

        let frame = DisplayFrame::new(now, self.display.twelve_hour);
        actions.push(ClockAction::Render {
            hour: frame.shown_hour(),
            minute: now.minute,
            second: now.second,
        });
        if let Some(pm) = frame.pm {
            actions.push(ClockAction::AmPmIndicator(pm));
        }

        if let Some(last) = self.last_second {
            if last != now.second {
                self.seconds_led = !self.seconds_led;
                actions.push(ClockAction::SecondsIndicator(self.seconds_led));
            }
        }
        self.last_second = Some(now.second);

        // Alarm runs before the chime so a chime never overlaps the first
        // second of the alarm.
        let alarm_action = self.alarm.evaluate(now);
        if self.display.chimes {
            if let Some(pulses) = self.chime.check(now, self.alarm.is_triggered()) {
                actions.push(ClockAction::Chime { pulses });
            }
        }
        actions.extend(alarm_action.map(ClockAction::from));

        if self.button.sample(button, now_ms) == Some(ButtonEdge::Pressed) {
            actions.extend(self.alarm.dismiss().map(ClockAction::from));
        }

        actions
    }

    pub fn set_alarm(&mut self, hour: i32, minute: i32) -> Result<Vec<ClockAction>, ConfigError> {
        let action = self.alarm.set(hour, minute)?;
        Ok(action.map(ClockAction::from).into_iter().collect())
    }

    pub fn dismiss_alarm(&mut self) -> Vec<ClockAction> {
        self.alarm.dismiss().map(ClockAction::from).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::PersistedSettings;

    fn engine(alarm: (i32, i32), display: DisplayConfig) -> ClockEngine {
        let config = RuntimeConfig {
            display,
            settings: PersistedSettings {
                alarm_hour: alarm.0,
                alarm_minute: alarm.1,
                ..PersistedSettings::default()
            },
            ..RuntimeConfig::default()
        };
        ClockEngine::new(&config)
    }

    fn at(hour: u8, minute: u8, second: u8) -> ClockTime {
        ClockTime::new(hour, minute, second).unwrap()
    }

    fn without_render(actions: Vec<ClockAction>) -> Vec<ClockAction> {
        actions
            .into_iter()
            .filter(|a| !matches!(a, ClockAction::Render { .. } | ClockAction::SecondsIndicator(_)))
            .collect()
    }

    #[test]
    fn renders_every_tick_and_blinks_on_second_change() {
        let mut clock = engine((-1, -1), DisplayConfig::default());
        let first = clock.tick(at(10, 11, 12), PinLevel::High, 0);
        assert_eq!(
            first,
            vec![ClockAction::Render {
                hour: 10,
                minute: 11,
                second: 12
            }]
        );

        let same = clock.tick(at(10, 11, 12), PinLevel::High, 100);
        assert_eq!(same.len(), 1);

        let next = clock.tick(at(10, 11, 13), PinLevel::High, 200);
        assert_eq!(next[1], ClockAction::SecondsIndicator(true));
        let next = clock.tick(at(10, 11, 14), PinLevel::High, 300);
        assert_eq!(next[1], ClockAction::SecondsIndicator(false));
    }

    #[test]
    fn twelve_hour_mode_drives_pm_lamp() {
        let display = DisplayConfig {
            twelve_hour: true,
            chimes: false,
        };
        let mut clock = engine((-1, -1), display);
        let actions = clock.tick(at(13, 5, 0), PinLevel::High, 0);
        assert_eq!(
            actions,
            vec![
                ClockAction::Render {
                    hour: 1,
                    minute: 5,
                    second: 0
                },
                ClockAction::AmPmIndicator(true),
            ]
        );
    }

    #[test]
    fn alarm_minute_sounds_once_and_stops_next_minute() {
        let mut clock = engine((7, 30), DisplayConfig::default());
        let mut now_ms = 0;
        let mut buzzer_events = Vec::new();

        for second in 0..60 {
            for _poll in 0..10 {
                now_ms += 100;
                let actions = clock.tick(at(7, 30, second), PinLevel::High, now_ms);
                buzzer_events.extend(
                    actions
                        .into_iter()
                        .filter(|a| matches!(a, ClockAction::BuzzerOn | ClockAction::BuzzerOff)),
                );
            }
        }
        assert_eq!(buzzer_events, vec![ClockAction::BuzzerOn]);

        let actions = clock.tick(at(7, 31, 0), PinLevel::High, now_ms + 100);
        assert!(actions.contains(&ClockAction::BuzzerOff));
    }

    #[test]
    fn chime_is_suppressed_by_alarm() {
        let mut clock = engine((8, 0), DisplayConfig::default());
        let actions = without_render(clock.tick(at(8, 0, 0), PinLevel::High, 0));
        assert_eq!(actions, vec![ClockAction::BuzzerOn]);

        let mut clock = engine((-1, -1), DisplayConfig::default());
        let actions = without_render(clock.tick(at(8, 0, 0), PinLevel::High, 0));
        assert_eq!(actions, vec![ClockAction::Chime { pulses: 2 }]);
    }

    #[test]
    fn bouncing_button_dismisses_once() {
        let mut clock = engine((6, 0), DisplayConfig::default());
        clock.tick(at(6, 0, 1), PinLevel::High, 0);
        assert!(clock.alarm().triggered);

        let levels = [
            PinLevel::Low,
            PinLevel::High,
            PinLevel::Low,
            PinLevel::High,
            PinLevel::Low,
        ];
        let mut dismissals = 0;
        let mut now_ms = 0;
        for level in levels.into_iter().chain(std::iter::repeat(PinLevel::Low).take(10)) {
            now_ms += 20;
            let actions = clock.tick(at(6, 0, 2), level, now_ms);
            dismissals += actions.iter().filter(|a| **a == ClockAction::BuzzerOff).count();
        }
        assert_eq!(dismissals, 1);
        assert!(!clock.alarm().triggered);
    }

    #[test]
    fn explicit_dismiss_is_idempotent() {
        let mut clock = engine((6, 0), DisplayConfig::default());
        clock.tick(at(6, 0, 0), PinLevel::High, 0);

        assert_eq!(clock.dismiss_alarm(), vec![ClockAction::BuzzerOff]);
        assert!(clock.dismiss_alarm().is_empty());
        assert!(!clock.alarm_view().triggered);
    }

    #[derive(Default)]
    struct Panel {
        text: String,
        buzzer: bool,
        seconds: bool,
        pm: Option<bool>,
        chimes: Vec<u8>,
    }

    impl DisplayDriver for Panel {
        fn render(&mut self, hour: u8, minute: u8, second: u8) {
            self.text = format!("{hour:02}{minute:02}{second:02}");
        }

        fn render_text(&mut self, text: &str) {
            self.text = text.to_string();
        }

        fn clear(&mut self) {
            self.text.clear();
        }
    }

    impl ClockOutputs for Panel {
        fn set_buzzer(&mut self, on: bool) {
            self.buzzer = on;
        }

        fn set_seconds_led(&mut self, on: bool) {
            self.seconds = on;
        }

        fn set_pm_led(&mut self, pm: bool) {
            self.pm = Some(pm);
        }

        fn chime(&mut self, pulses: u8) {
            self.chimes.push(pulses);
        }
    }

    #[test]
    fn actions_drive_outputs() {
        let mut clock = engine((9, 0), DisplayConfig::default());
        let mut panel = Panel::default();
        panel.render_text("------");

        let actions = clock.tick(at(9, 0, 0), PinLevel::High, 0);
        apply_actions(&mut panel, &actions);
        assert_eq!(panel.text, "090000");
        assert!(panel.buzzer);
        assert!(panel.chimes.is_empty());

        apply_actions(&mut panel, &clock.dismiss_alarm());
        assert!(!panel.buzzer);

        let actions = clock.tick(at(9, 0, 1), PinLevel::High, 100);
        apply_actions(&mut panel, &actions);
        assert!(panel.seconds);
        assert_eq!(panel.pm, None);
    }

    #[test]
    fn retarget_keeps_local_date() {
        let now = Utc.with_ymd_and_hms(2026, 3, 9, 23, 30, 0).unwrap();
        let offset = TimezoneOffset::new(5, 30).unwrap();
        // 05:00 local on 2026-03-10 is 23:30 UTC on 2026-03-09.
        let target = retarget_wall_clock(now, offset, at(7, 15, 0)).unwrap();
        assert_eq!(target, Utc.with_ymd_and_hms(2026, 3, 10, 1, 45, 0).unwrap());

        let offset = TimezoneOffset::new(-3, 30).unwrap();
        let target = retarget_wall_clock(now, offset, at(7, 15, 0)).unwrap();
        assert_eq!(target, Utc.with_ymd_and_hms(2026, 3, 9, 10, 45, 0).unwrap());
    }

    #[test]
    fn set_alarm_rejects_out_of_range() {
        let mut clock = engine((6, 0), DisplayConfig::default());
        assert!(clock.set_alarm(25, 0).is_err());
        assert_eq!(clock.alarm().hour, 6);
        assert_eq!(clock.set_alarm(-1, -1), Ok(Vec::new()));
        assert!(!clock.alarm_view().set);
    }
}
