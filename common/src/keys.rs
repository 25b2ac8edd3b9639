pub const KEY_WIFI_SSID: &str = "wifi_ssid";
pub const KEY_WIFI_PASS: &str = "wifi_pass";
pub const KEY_WIFI_HAS_PASS: &str = "wifi_has_pass";

pub const KEY_ALARM_HOUR: &str = "alarm_hour";
pub const KEY_ALARM_MINUTE: &str = "alarm_minute";

pub const KEY_TZ_HOURS: &str = "tz_hours";
pub const KEY_TZ_MINUTES: &str = "tz_minutes";
