//! Serde helpers for human-readable `Duration` fields.
//!
//! Durations in manifests, host configuration, and persisted snapshots are
//! written as strings with a unit suffix: `"500ms"`, `"30s"`, `"5m"`,
//! `"24h"`. Deserialization also accepts the `{secs, nanos}` object form so
//! values serialized by older hosts keep loading.

use serde::{Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let millis = duration.as_millis();
    if millis < 1000 || millis % 1000 != 0 {
        return serializer.serialize_str(&format!("{millis}ms"));
    }
    serializer.serialize_str(&format!("{}s", duration.as_secs()))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    use serde::Deserialize;
    use serde_json::Value;

    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => parse(&s).map_err(Error::custom),
        Value::Object(obj) => {
            let secs = obj
                .get("secs")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| Error::custom("missing 'secs' field"))?;
            let nanos = obj.get("nanos").and_then(|v| v.as_u64()).unwrap_or(0);
            Ok(Duration::new(secs, nanos as u32))
        }
        _ => Err(Error::custom("invalid duration format")),
    }
}

/// Parse a `"500ms"` / `"30s"` / `"5m"` / `"24h"` string.
pub fn parse(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }
    if let Some(stripped) = s.strip_suffix("ms") {
        let num: u64 = stripped
            .parse()
            .map_err(|_| format!("invalid number: {stripped}"))?;
        return Ok(Duration::from_millis(num));
    }
    if let Some(stripped) = s.strip_suffix('s') {
        let num: f64 = stripped
            .parse()
            .map_err(|_| format!("invalid number: {stripped}"))?;
        let secs = num.trunc() as u64;
        let nanos = (num.fract() * 1_000_000_000.0).round() as u32;
        return Ok(Duration::new(secs, nanos));
    }
    if let Some(stripped) = s.strip_suffix('m') {
        let num: u64 = stripped
            .parse()
            .map_err(|_| format!("invalid number: {stripped}"))?;
        return Ok(Duration::from_secs(num * 60));
    }
    if let Some(stripped) = s.strip_suffix('h') {
        let num: u64 = stripped
            .parse()
            .map_err(|_| format!("invalid number: {stripped}"))?;
        return Ok(Duration::from_secs(num * 3600));
    }
    Err(format!("unknown duration unit: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_unit() {
        assert_eq!(parse("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse("24h").unwrap(), Duration::from_secs(86400));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("").is_err());
        assert!(parse("30x").is_err());
        assert!(parse("abc").is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Wrapper {
            #[serde(with = "crate::duration_serde")]
            d: Duration,
        }

        let w: Wrapper = toml::from_str("d = \"45s\"").unwrap();
        assert_eq!(w.d, Duration::from_secs(45));

        let text = toml::to_string(&Wrapper {
            d: Duration::from_millis(500),
        })
        .unwrap();
        assert!(text.contains("500ms"));
    }
}
