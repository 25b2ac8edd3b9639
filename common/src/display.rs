use crate::types::ClockTime;

/// Six-digit numeric display. Implementations log and swallow write errors;
/// the next refresh repaints everything anyway.
pub trait DisplayDriver {
    fn render(&mut self, hour: u8, minute: u8, second: u8);
    fn render_text(&mut self, text: &str);
    fn clear(&mut self);
}

/// Digits left to right as `HHMMSS`, plus the AM/PM lamp in 12-hour mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayFrame {
    pub digits: [u8; 6],
    pub pm: Option<bool>,
}

impl DisplayFrame {
    pub fn new(time: ClockTime, twelve_hour: bool) -> Self {
        let (hour, pm) = if twelve_hour {
            let (hour, pm) = time.twelve_hour();
            (hour, Some(pm))
        } else {
            (time.hour, None)
        };

        Self {
            digits: [
                hour / 10,
                hour % 10,
                time.minute / 10,
                time.minute % 10,
                time.second / 10,
                time.second % 10,
            ],
            pm,
        }
    }

    /// The hour actually shown, used when handing the frame to a driver.
    pub fn shown_hour(&self) -> u8 {
        self.digits[0] * 10 + self.digits[1]
    }

    pub fn text(&self) -> String {
        self.digits.iter().map(|d| char::from(b'0' + d)).collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn twenty_four_hour_frame() {
        let frame = DisplayFrame::new(ClockTime::new(21, 5, 9).unwrap(), false);
        assert_eq!(frame.digits, [2, 1, 0, 5, 0, 9]);
        assert_eq!(frame.pm, None);
        assert_eq!(frame.text(), "210509");
    }

    #[test]
    fn twelve_hour_frame_sets_pm_lamp() {
        let frame = DisplayFrame::new(ClockTime::new(21, 5, 9).unwrap(), true);
        assert_eq!(frame.text(), "090509");
        assert_eq!(frame.pm, Some(true));

        let frame = DisplayFrame::new(ClockTime::new(0, 0, 0).unwrap(), true);
        assert_eq!(frame.shown_hour(), 12);
        assert_eq!(frame.pm, Some(false));
    }
}
