//! Value types shared by the configuration schema.

use std::fmt;
use std::ops::Deref;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A list field that also accepts a single bare value.
///
/// `"domain": "example.com"` and `"domain": ["example.com"]` deserialize to
/// the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listable<T>(pub Vec<T>);

impl<T> Default for Listable<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> Deref for Listable<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> From<Vec<T>> for Listable<T> {
    fn from(items: Vec<T>) -> Self {
        Self(items)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Listable<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(item) => Self(vec![item]),
            OneOrMany::Many(items) => Self(items),
        })
    }
}

impl<T: Serialize> Serialize for Listable<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

/// Error returned when a duration string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid duration: {0:?}")]
pub struct DurationError(pub String);

/// A duration written as `1h30m`, `500ms`, `10s` and so on.
///
/// Kept as text in the schema so that a malformed value is reported by the
/// component that owns the field instead of failing the whole document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct DurationStr(pub String);

impl DurationStr {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse the value, falling back to `default` when it is empty.
    pub fn parse_or(&self, default: Duration) -> Result<Duration, DurationError> {
        if self.0.is_empty() {
            Ok(default)
        } else {
            parse_duration(&self.0)
        }
    }
}

impl fmt::Display for DurationStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse a sequence of `<number><unit>` pairs.
///
/// Units: `ns`, `us`, `ms`, `s`, `m`, `h`. A bare `0` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let err = || DurationError(input.to_string());
    let text = input.trim();
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    if text.is_empty() {
        return Err(err());
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(err)?;
        if digits == 0 {
            return Err(err());
        }
        let value: f64 = rest[..digits].parse().map_err(|_| err())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit: f64 = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(err()),
        };
        rest = &rest[unit_len..];
        total += Duration::from_nanos((value * nanos_per_unit) as u64);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listable_accepts_single_value() {
        let one: Listable<String> = serde_json::from_str(r#""example.com""#).unwrap();
        let many: Listable<String> = serde_json::from_str(r#"["a.com", "b.com"]"#).unwrap();
        assert_eq!(one.0, vec!["example.com".to_string()]);
        assert_eq!(many.len(), 2);
    }

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_malformed_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s10").is_err());
        assert!(parse_duration("3 days").is_err());
    }

    #[test]
    fn empty_duration_uses_default() {
        let value = DurationStr::default();
        assert_eq!(
            value.parse_or(Duration::from_secs(60)).unwrap(),
            Duration::from_secs(60)
        );
    }
}
