use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("time {hour}:{minute}:{second} is out of range")]
    TimeOutOfRange { hour: i32, minute: i32, second: i32 },
    #[error("alarm {hour}:{minute} is out of range (use -1:-1 to clear)")]
    AlarmOutOfRange { hour: i32, minute: i32 },
    #[error("timezone offset {hours}:{minutes} rejected (hours -12..14, minutes 0 or 30)")]
    TimezoneOutOfRange { hours: i32, minutes: i32 },
    #[error("ssid cannot be empty")]
    EmptySsid,
    #[error("ssid is {len} bytes, limit is 31")]
    SsidTooLong { len: usize },
    #[error("password is {len} bytes, limit is 63")]
    PasswordTooLong { len: usize },
    #[error("ssid `{ssid}` is the clock's own access point")]
    SelfConnection { ssid: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("station is not connected")]
    Unavailable,
    #[error("a time sync is already running")]
    InProgress,
    #[error("no plausible time after {attempts} polls")]
    Exhausted { attempts: u32 },
    #[error("time server error: {0}")]
    Server(String),
}
