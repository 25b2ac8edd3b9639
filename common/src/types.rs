use chrono::{FixedOffset, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::{arbiter::ArbiterSnapshot, config::PersistedSettings, error::ConfigError};

/// Longest SSID the radio accepts, in bytes.
pub const MAX_SSID_LEN: usize = 31;
/// Longest WPA passphrase the radio accepts, in bytes.
pub const MAX_PASSWORD_LEN: usize = 63;
/// Shortest passphrase that counts as a real password.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Time of day as shown on the display. Recomputed from the wall clock every poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockTime {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl ClockTime {
    pub fn new(hour: u8, minute: u8, second: u8) -> Result<Self, ConfigError> {
        if hour > 23 || minute > 59 || second > 59 {
            return Err(ConfigError::TimeOutOfRange {
                hour: hour.into(),
                minute: minute.into(),
                second: second.into(),
            });
        }
        Ok(Self {
            hour,
            minute,
            second,
        })
    }

    pub fn from_datetime<T: Timelike>(now: &T) -> Self {
        Self {
            hour: now.hour() as u8,
            minute: now.minute() as u8,
            second: now.second() as u8,
        }
    }

    /// Hour in 12-hour form plus whether it is afternoon.
    pub fn twelve_hour(self) -> (u8, bool) {
        match self.hour {
            0 => (12, false),
            h @ 1..=11 => (h, false),
            12 => (12, true),
            h => (h - 12, true),
        }
    }
}

/// Offset of local time from UTC. Stored with the UTC+ sign convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimezoneOffset {
    pub hours: i32,
    pub minutes: i32,
}

impl Default for TimezoneOffset {
    fn default() -> Self {
        Self {
            hours: 0,
            minutes: 0,
        }
    }
}

impl TimezoneOffset {
    pub fn new(hours: i32, minutes: i32) -> Result<Self, ConfigError> {
        if !(-12..=14).contains(&hours) || !matches!(minutes, 0 | 30) {
            return Err(ConfigError::TimezoneOutOfRange { hours, minutes });
        }
        Ok(Self { hours, minutes })
    }

    /// Signed offset in seconds. The minute component follows the sign of the hours.
    pub fn total_seconds(self) -> i32 {
        let sign = if self.hours < 0 { -1 } else { 1 };
        self.hours * 3600 + sign * self.minutes * 60
    }

    pub fn fixed(self) -> FixedOffset {
        FixedOffset::east_opt(self.total_seconds()).unwrap_or_else(|| Utc.fix())
    }

    /// Human form, e.g. `UTC+05:30`.
    pub fn label(self) -> String {
        let sign = if self.hours < 0 { '-' } else { '+' };
        format!("UTC{sign}{:02}:{:02}", self.hours.abs(), self.minutes)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationCredentials {
    pub ssid: String,
    pub password: String,
    pub has_password: bool,
}

impl StationCredentials {
    /// Validates the pair against radio limits and the device's own AP name.
    pub fn new(ssid: &str, password: &str, own_ap_ssid: &str) -> Result<Self, ConfigError> {
        let ssid = ssid.trim();
        if ssid.is_empty() {
            return Err(ConfigError::EmptySsid);
        }
        if ssid.len() > MAX_SSID_LEN {
            return Err(ConfigError::SsidTooLong { len: ssid.len() });
        }
        if password.len() > MAX_PASSWORD_LEN {
            return Err(ConfigError::PasswordTooLong {
                len: password.len(),
            });
        }
        if ssid == own_ap_ssid {
            return Err(ConfigError::SelfConnection {
                ssid: ssid.to_string(),
            });
        }

        Ok(Self {
            ssid: ssid.to_string(),
            password: password.to_string(),
            has_password: password.len() >= MIN_PASSWORD_LEN,
        })
    }

    pub fn is_present(&self) -> bool {
        !self.ssid.is_empty()
    }

    /// Password to hand the radio; short passwords join as an open network.
    pub fn effective_password(&self) -> &str {
        if self.has_password {
            &self.password
        } else {
            ""
        }
    }
}

/// Electrical level of a GPIO input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinLevel {
    Low,
    High,
}

impl PinLevel {
    pub fn from_high(high: bool) -> Self {
        if high {
            Self::High
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlarmView {
    pub hour: i32,
    pub minute: i32,
    pub set: bool,
    pub triggered: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClockStatus {
    pub time: String,
    pub alarm: AlarmView,
    pub timezone: String,
    #[serde(rename = "tzHours")]
    pub tz_hours: i32,
    #[serde(rename = "tzMinutes")]
    pub tz_minutes: i32,
    #[serde(rename = "wifiSsid")]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    pub wifi_pass_set: bool,
    #[serde(rename = "connectivity")]
    pub connectivity: &'static str,
    #[serde(rename = "stationConnected")]
    pub station_connected: bool,
    #[serde(rename = "apClients")]
    pub ap_clients: u32,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
}

impl ClockStatus {
    pub fn new(
        now: ClockTime,
        alarm: AlarmView,
        settings: &PersistedSettings,
        network: ArbiterSnapshot,
        time_synced: bool,
    ) -> Self {
        let offset = settings.timezone();
        Self {
            time: format!("{:02}:{:02}:{:02}", now.hour, now.minute, now.second),
            alarm,
            timezone: offset.label(),
            tz_hours: offset.hours,
            tz_minutes: offset.minutes,
            wifi_ssid: settings.wifi_ssid.clone(),
            wifi_pass_set: settings.wifi_has_pass,
            connectivity: network.state.as_str(),
            station_connected: network.connectivity.station_connected,
            ap_clients: network.connectivity.ap_client_count,
            time_synced,
        }
    }
}
