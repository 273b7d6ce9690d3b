//! Duration strings for the networks file (`"90s"`, `"10m"`, `"1h"`).

use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Parse a duration string like `"30s"`, `"10m"`, `"1h"`, `"1d"`.
pub fn parse(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration cannot be empty".to_owned());
    }

    let unit_pos = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration {s:?} must have a unit (e.g. \"30s\", \"10m\")"))?;

    let value: u64 = s[..unit_pos]
        .parse()
        .map_err(|_| format!("duration {s:?} must start with a positive integer"))?;

    let seconds = match &s[unit_pos..] {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86400,
        unit => return Err(format!("unknown duration unit {unit:?}; use s, m, h or d")),
    };

    Ok(Duration::from_secs(seconds))
}

/// serde adapter for fields holding duration strings.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse(&s).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_parse() {
        assert_eq!(parse("45s"), Ok(Duration::from_secs(45)));
        assert_eq!(parse("10m"), Ok(Duration::from_secs(600)));
        assert_eq!(parse("2h"), Ok(Duration::from_secs(7200)));
        assert_eq!(parse("1d"), Ok(Duration::from_secs(86400)));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse("").is_err());
        assert!(parse("10").is_err());
        assert!(parse("m10").is_err());
        assert!(parse("10w").is_err());
    }
}
