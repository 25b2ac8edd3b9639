use serde::{Deserialize, Serialize};

use crate::{
    alarm::validate_alarm,
    error::ConfigError,
    types::{StationCredentials, TimezoneOffset},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockConfig {
    pub poll_interval_ms: u64,
    pub debounce_ms: u64,
    pub reconnect_delay_ms: u64,
    pub sync_interval_ms: u64,
    pub sync_retry_count: u32,
    pub sync_retry_interval_ms: u64,
    pub min_plausible_year: i32,
    pub ntp_servers: [String; 2],
    pub chime_pulse_ms: u64,
    pub restart_delay_ms: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            debounce_ms: 100,
            reconnect_delay_ms: 10_000,
            sync_interval_ms: 3_600_000,
            sync_retry_count: 15,
            sync_retry_interval_ms: 2_000,
            min_plausible_year: 2020,
            ntp_servers: ["pool.ntp.org".to_string(), "time.google.com".to_string()],
            chime_pulse_ms: 120,
            restart_delay_ms: 3_000,
        }
    }
}

impl ClockConfig {
    pub fn sanitize(&mut self) {
        self.poll_interval_ms = self.poll_interval_ms.clamp(1, 1_000);
        self.debounce_ms = self.debounce_ms.min(1_000);
        self.sync_retry_count = self.sync_retry_count.max(1);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessPointConfig {
    pub ssid: String,
    pub password: String,
    pub channel: u8,
    pub max_clients: u16,
}

impl Default for AccessPointConfig {
    fn default() -> Self {
        Self {
            ssid: "ESP32_Clock".to_string(),
            password: "12345678".to_string(),
            channel: 1,
            max_clients: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisplayConfig {
    pub twelve_hour: bool,
    pub chimes: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            twelve_hour: false,
            chimes: true,
        }
    }
}

/// The flat record kept in the settings store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedSettings {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub wifi_has_pass: bool,
    pub alarm_hour: i32,
    pub alarm_minute: i32,
    pub tz_hours: i32,
    pub tz_minutes: i32,
}

impl Default for PersistedSettings {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            wifi_has_pass: false,
            alarm_hour: -1,
            alarm_minute: -1,
            tz_hours: 0,
            tz_minutes: 0,
        }
    }
}

impl PersistedSettings {
    /// Repairs a record read back from storage. Anything invalid falls back to "unset".
    pub fn sanitize(&mut self, own_ap_ssid: &str) {
        let alarm_valid = (0..=23).contains(&self.alarm_hour) && (0..=59).contains(&self.alarm_minute);
        if !alarm_valid {
            self.alarm_hour = -1;
            self.alarm_minute = -1;
        }

        if TimezoneOffset::new(self.tz_hours, self.tz_minutes).is_err() {
            self.tz_hours = 0;
            self.tz_minutes = 0;
        }

        if self.wifi_ssid.is_empty() {
            self.wifi_pass.clear();
            self.wifi_has_pass = false;
        } else {
            match StationCredentials::new(&self.wifi_ssid, &self.wifi_pass, own_ap_ssid) {
                Ok(creds) => self.apply_credentials(&creds),
                Err(_) => {
                    self.wifi_ssid.clear();
                    self.wifi_pass.clear();
                    self.wifi_has_pass = false;
                }
            }
        }
    }

    pub fn timezone(&self) -> TimezoneOffset {
        TimezoneOffset::new(self.tz_hours, self.tz_minutes).unwrap_or_default()
    }

    pub fn credentials(&self) -> StationCredentials {
        StationCredentials {
            ssid: self.wifi_ssid.clone(),
            password: self.wifi_pass.clone(),
            has_password: self.wifi_has_pass,
        }
    }

    /// Rejected offsets leave the stored value untouched.
    pub fn set_timezone(&mut self, hours: i32, minutes: i32) -> Result<bool, ConfigError> {
        let offset = TimezoneOffset::new(hours, minutes)?;
        let changed = offset != self.timezone();
        self.tz_hours = offset.hours;
        self.tz_minutes = offset.minutes;
        Ok(changed)
    }

    pub fn set_station_credentials(
        &mut self,
        ssid: &str,
        password: &str,
        own_ap_ssid: &str,
    ) -> Result<bool, ConfigError> {
        let creds = StationCredentials::new(ssid, password, own_ap_ssid)?;
        let changed = creds != self.credentials();
        self.apply_credentials(&creds);
        Ok(changed)
    }

    pub fn set_alarm(&mut self, hour: i32, minute: i32) -> Result<bool, ConfigError> {
        validate_alarm(hour, minute)?;
        let changed = (hour, minute) != (self.alarm_hour, self.alarm_minute);
        self.alarm_hour = hour;
        self.alarm_minute = minute;
        Ok(changed)
    }

    fn apply_credentials(&mut self, creds: &StationCredentials) {
        self.wifi_ssid = creds.ssid.clone();
        self.wifi_pass = creds.password.clone();
        self.wifi_has_pass = creds.has_password;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub access_point: AccessPointConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    pub settings: PersistedSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            clock: ClockConfig::default(),
            access_point: AccessPointConfig::default(),
            display: DisplayConfig::default(),
            settings: PersistedSettings::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.clock.sanitize();
        let ap_ssid = self.access_point.ssid.clone();
        self.settings.sanitize(&ap_ssid);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn rejected_timezone_keeps_previous_value() {
        let mut settings = PersistedSettings::default();
        assert_eq!(settings.set_timezone(5, 30), Ok(true));

        assert!(settings.set_timezone(5, 15).is_err());
        assert!(settings.set_timezone(-13, 0).is_err());
        assert!(settings.set_timezone(15, 30).is_err());

        assert_eq!(settings.timezone(), TimezoneOffset::new(5, 30).unwrap());
    }

    #[test]
    fn rejected_alarm_keeps_previous_value() {
        let mut settings = PersistedSettings::default();
        assert_eq!(settings.set_alarm(7, 30), Ok(true));
        assert_eq!(settings.set_alarm(7, 30), Ok(false));

        assert!(settings.set_alarm(24, 0).is_err());
        assert!(settings.set_alarm(-1, 0).is_err());
        assert_eq!((settings.alarm_hour, settings.alarm_minute), (7, 30));

        assert_eq!(settings.set_alarm(-1, -1), Ok(true));
    }

    #[test]
    fn rejected_credentials_keep_previous_value() {
        let mut settings = PersistedSettings::default();
        settings
            .set_station_credentials("Home", "0123456789", "ESP32_Clock")
            .unwrap();
        let before = settings.clone();

        assert!(settings
            .set_station_credentials("ESP32_Clock", "0123456789", "ESP32_Clock")
            .is_err());
        assert_eq!(settings, before);
    }

    #[test]
    fn sanitize_repairs_corrupt_record() {
        let mut settings = PersistedSettings {
            wifi_ssid: "ESP32_Clock".to_string(),
            wifi_pass: "12345678".to_string(),
            wifi_has_pass: true,
            alarm_hour: 7,
            alarm_minute: 75,
            tz_hours: 3,
            tz_minutes: 20,
        };
        settings.sanitize("ESP32_Clock");

        assert_eq!(settings, PersistedSettings::default());
    }

    #[test]
    fn sanitize_recomputes_password_flag() {
        let mut settings = PersistedSettings {
            wifi_ssid: "Home".to_string(),
            wifi_pass: "abc".to_string(),
            wifi_has_pass: true,
            ..PersistedSettings::default()
        };
        settings.sanitize("ESP32_Clock");

        assert!(!settings.wifi_has_pass);
        assert_eq!(settings.wifi_ssid, "Home");
    }
}
