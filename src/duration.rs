//! Human-readable durations for configuration ("500ms", "60s", "10m", "1h")
//! and countdown rendering.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer, Serializer};

/// Parse a duration string like "500ms", "60s", "10m" or "1h".
///
/// Supported units: `ms`, `s`, `m`, `h`. Input is case-insensitive and
/// surrounding whitespace is ignored.
///
/// ```
/// use ratesync::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
/// ```
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .context("Duration must end with ms, s, m, or h")?;
    let (num, unit) = s.split_at(split);
    if num.is_empty() {
        anyhow::bail!("Duration is missing a number: {s:?}");
    }
    let num: u64 = num.parse().context("Invalid number in duration")?;

    let millis = match unit {
        "ms" => Some(num),
        "s" => num.checked_mul(1_000),
        "m" => num.checked_mul(60_000),
        "h" => num.checked_mul(3_600_000),
        other => anyhow::bail!("Unknown duration unit {other:?}; use ms, s, m, or h"),
    }
    .context("Duration is too large")?;

    Ok(Duration::from_millis(millis))
}

/// Render a duration in the largest unit that divides it exactly, so the
/// output parses back with [`parse_duration`].
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 3_600_000 == 0 {
        format!("{}h", millis / 3_600_000)
    } else if millis % 60_000 == 0 {
        format!("{}m", millis / 60_000)
    } else if millis % 1_000 == 0 {
        format!("{}s", millis / 1_000)
    } else {
        format!("{millis}ms")
    }
}

/// Render a countdown for display, e.g. `4m 05s`. Sub-second remainders are
/// rounded up so a pending refresh never shows as `0s`.
pub fn format_countdown(d: Duration) -> String {
    let mut secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs += 1;
    }
    match (secs / 60, secs % 60) {
        (0, s) => format!("{s}s"),
        (m, s) => format!("{m}m {s:02}s"),
    }
}

/// Serde deserializer for duration strings.
///
/// Use with `#[serde(deserialize_with = "deserialize_duration")]`.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(de::Error::custom)
}

/// Serde serializer matching [`deserialize_duration`].
pub fn serialize_duration<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(*d))
}

/// Like [`deserialize_duration`] for `Option<Duration>` fields. Pair with
/// `#[serde(default)]` so a missing key stays `None`.
pub fn deserialize_optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    s.map(|s| parse_duration(&s).map_err(de::Error::custom))
        .transpose()
}

/// Serde serializer matching [`deserialize_optional_duration`].
pub fn serialize_optional_duration<S>(d: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match d {
        Some(d) => serializer.serialize_some(&format_duration(*d)),
        None => serializer.serialize_none(),
    }
}
