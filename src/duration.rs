//! Human-readable durations for the command line and the config file.

use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use plant_gateway::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num, unit_millis) = if let Some(num) = src.strip_suffix("ms") {
        (num, 1)
    } else if let Some(num) = src.strip_suffix('h') {
        (num, 3_600_000)
    } else if let Some(num) = src.strip_suffix('m') {
        (num, 60_000)
    } else if let Some(num) = src.strip_suffix('s') {
        (num, 1_000)
    } else {
        (src, 1_000)
    };

    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {}", src))?;
    value
        .checked_mul(unit_millis)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration out of range: {}", src))
}

/// Serde helper accepting either a duration string (`"1s"`) or a bare number
/// of seconds.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_seconds() {
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("0s").unwrap(), Duration::from_secs(0));
    }

    #[test]
    fn test_parse_duration_minutes() {
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn test_parse_duration_hours() {
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn test_parse_duration_milliseconds() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_duration_no_suffix() {
        assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_duration_with_whitespace() {
        assert_eq!(parse_duration(" 3s ").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("3 s").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("1.5s").is_err());
    }

    #[test]
    fn test_deserialize_string_or_number() {
        #[derive(Deserialize)]
        struct Holder {
            #[serde(deserialize_with = "deserialize")]
            delay: Duration,
        }

        let text: Holder = serde_yaml::from_str("delay: 250ms").unwrap();
        assert_eq!(text.delay, Duration::from_millis(250));

        let number: Holder = serde_yaml::from_str("delay: 2").unwrap();
        assert_eq!(number.delay, Duration::from_secs(2));

        assert!(serde_yaml::from_str::<Holder>("delay: soon").is_err());
    }
}
