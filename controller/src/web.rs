use std::collections::HashMap;

use alarmclock_common::ConfigError;
use thiserror::Error;

pub const INDEX_HTML: &str = include_str!("../web/index.html");

/// Upper bound for a query string or request body.
pub const MAX_REQUEST_BYTES: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request is {len} bytes, limit is {MAX_REQUEST_BYTES}")]
    TooLarge { len: usize },
    #[error("missing '{0}' parameter")]
    Missing(&'static str),
    #[error("invalid '{name}' value `{value}`")]
    Invalid { name: &'static str, value: String },
}

impl RequestError {
    pub fn status(&self) -> u16 {
        match self {
            Self::TooLarge { .. } => 413,
            Self::Missing(_) | Self::Invalid { .. } => 400,
        }
    }
}

/// Outcome of a settings update that did not take effect.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Rejected(#[from] ConfigError),
    #[error("Failed to persist settings")]
    Persist(anyhow::Error),
}

impl SettingsError {
    pub fn status(&self) -> u16 {
        match self {
            Self::Rejected(_) => 400,
            Self::Persist(_) => 500,
        }
    }
}

pub type Params = HashMap<String, String>;

/// Splits a form-encoded query. Oversized input is refused before decoding.
pub fn parse_query(query: &str) -> Result<Params, RequestError> {
    if query.len() > MAX_REQUEST_BYTES {
        return Err(RequestError::TooLarge { len: query.len() });
    }

    let mut params = HashMap::new();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(url_decode(name), url_decode(value));
    }
    Ok(params)
}

/// Query part of a request URI, or "" when there is none.
pub fn query_of(uri: &str) -> &str {
    uri.split_once('?').map(|(_, query)| query).unwrap_or_default()
}

pub fn url_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

pub fn int_param(params: &Params, name: &'static str) -> Result<i32, RequestError> {
    let raw = params.get(name).ok_or(RequestError::Missing(name))?;
    raw.trim().parse().map_err(|_| RequestError::Invalid {
        name,
        value: raw.clone(),
    })
}

/// Integer parameter that must also fit a clock field.
pub fn u8_param(params: &Params, name: &'static str) -> Result<u8, RequestError> {
    let value = int_param(params, name)?;
    u8::try_from(value).map_err(|_| RequestError::Invalid {
        name,
        value: value.to_string(),
    })
}

pub fn str_param<'a>(params: &'a Params, name: &'static str) -> Result<&'a str, RequestError> {
    params
        .get(name)
        .map(String::as_str)
        .ok_or(RequestError::Missing(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plus_and_percent_escapes() {
        assert_eq!(url_decode("My+Home%20Net"), "My Home Net");
        assert_eq!(url_decode("p%40ss%2Bword"), "p@ss+word");
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(url_decode("%zz"), "%zz");
    }

    #[test]
    fn parses_query_pairs() {
        let params = parse_query("hours=-3&minutes=30&flag").unwrap();
        assert_eq!(int_param(&params, "hours"), Ok(-3));
        assert_eq!(int_param(&params, "minutes"), Ok(30));
        assert_eq!(str_param(&params, "flag"), Ok(""));
        assert_eq!(int_param(&params, "seconds"), Err(RequestError::Missing("seconds")));
    }

    #[test]
    fn rejects_non_numeric_and_negative_clock_fields() {
        let params = parse_query("hour=seven&minute=-1").unwrap();
        assert!(matches!(
            int_param(&params, "hour"),
            Err(RequestError::Invalid { name: "hour", .. })
        ));
        assert_eq!(int_param(&params, "minute"), Ok(-1));
        assert!(u8_param(&params, "minute").is_err());
    }

    #[test]
    fn oversized_query_is_refused() {
        let query = format!("ssid={}", "a".repeat(MAX_REQUEST_BYTES));
        let err = parse_query(&query).unwrap_err();
        assert_eq!(err.status(), 413);
    }

    #[test]
    fn settings_errors_map_to_client_and_server_status() {
        let rejected = SettingsError::from(ConfigError::AlarmOutOfRange { hour: 24, minute: 0 });
        assert_eq!(rejected.status(), 400);
        assert_eq!(
            rejected.to_string(),
            ConfigError::AlarmOutOfRange { hour: 24, minute: 0 }.to_string()
        );

        let failed = SettingsError::Persist(anyhow::anyhow!("disk full"));
        assert_eq!(failed.status(), 500);
        assert_eq!(failed.to_string(), "Failed to persist settings");
    }

    #[test]
    fn query_is_split_from_uri() {
        assert_eq!(query_of("/api/alarm?hour=7&minute=0"), "hour=7&minute=0");
        assert_eq!(query_of("/api/dismiss"), "");
    }
}
