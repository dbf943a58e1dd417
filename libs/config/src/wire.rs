//! On-disk config format. Everything here is deserialized as-is and only
//! validated when converted into [`crate::CoordinationConfig`].

use std::num::NonZeroU32;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, de};

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// comma separated `host:port` list of the coordination service
    pub hosts: String,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    pub region: String,
    pub cluster: String,
    pub service_type: String,
    pub service_id: String,
    /// `null` waits for the lock forever
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: Retry,
    #[serde(default = "default_cache_poll_interval_ms")]
    pub cache_poll_interval_ms: u64,
    #[serde(default)]
    pub shared_caches: Vec<SharedCache>,
    #[serde(default)]
    pub party: Party,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Retry {
    /// `null` retries forever
    #[serde(default = "default_max_retries")]
    pub max_retries: Option<u32>,
    /// `null` waits for a connection forever
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: Option<u64>,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SharedCache {
    /// path relative to the namespace prefix
    pub path: String,
    /// entries not modified for this long are expired, accepts "3600", "60m", "1h"
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub expire_after: Option<NonZeroU32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Party {
    /// absolute base path, defaults to the namespace prefix
    pub prefix: Option<String>,
    #[serde(default = "default_autojoin")]
    pub autojoin: bool,
}

impl Default for Party {
    fn default() -> Self {
        Self {
            prefix: None,
            autojoin: default_autojoin(),
        }
    }
}

pub const fn default_session_timeout_ms() -> u64 {
    1_000
}

pub const fn default_lock_timeout_ms() -> Option<u64> {
    Some(60_000)
}

pub const fn default_max_retries() -> Option<u32> {
    Some(4)
}

pub const fn default_connect_timeout_ms() -> Option<u64> {
    Some(10_000)
}

pub const fn default_cache_poll_interval_ms() -> u64 {
    500
}

pub const fn default_autojoin() -> bool {
    true
}

/// Parse a duration string with optional time units
/// Accepts: "3600", "3600s", "60m", "24h"
/// If no unit is specified, assumes seconds
fn parse_duration(s: &str) -> Result<u32> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow::Error::msg("empty duration string"));
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u32>().context("invalid number")?;

    let num_seconds = match unit.trim() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        other => anyhow::bail!("invalid duration unit {other:?}, expected s, m or h"),
    };
    num.checked_mul(num_seconds)
        .context("duration value too large")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireDuration {
    Seconds(u64),
    String(String),
}

impl WireDuration {
    fn into_nonzero<E: de::Error>(self) -> Result<NonZeroU32, E> {
        match self {
            WireDuration::Seconds(val) => NonZeroU32::new(
                u32::try_from(val).map_err(|_| E::custom("duration value too large"))?,
            )
            .ok_or_else(|| E::custom("duration cannot be zero")),
            WireDuration::String(s) => NonZeroU32::new(parse_duration(&s).map_err(E::custom)?)
                .ok_or_else(|| E::custom("duration cannot be zero")),
        }
    }
}

fn deserialize_optional_duration<'de, D>(de: D) -> Result<Option<NonZeroU32>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<WireDuration>::deserialize(de)?
        .map(WireDuration::into_nonzero)
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    pub static EXAMPLE: &str = include_str!("../sample/config.yaml");

    // test we can encode/decode example file
    #[test]
    fn test_example() {
        let cfg: Config = serde_yaml::from_str(EXAMPLE).unwrap();
        assert_eq!(cfg.service_type, "bs");
        assert_eq!(cfg.shared_caches.len(), 2);
        // back to the yaml
        let s = serde_yaml::to_string(&cfg).unwrap();
        let again: Config = serde_yaml::from_str(&s).unwrap();
        assert_eq!(cfg, again);
    }

    #[test]
    fn test_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{"hosts": "zk1:2181", "region": "r", "cluster": "c",
                "service_type": "bs", "service_id": "bs1"}"#,
        )
        .unwrap();
        assert_eq!(cfg.session_timeout_ms, 1_000);
        assert_eq!(cfg.lock_timeout_ms, Some(60_000));
        assert_eq!(cfg.retry, Retry::default());
        assert_eq!(cfg.cache_poll_interval_ms, 500);
        assert!(cfg.shared_caches.is_empty());
        assert!(cfg.party.autojoin);
        assert!(cfg.party.prefix.is_none());
    }

    #[test]
    fn test_explicit_null_means_forever() {
        let cfg: Config = serde_json::from_str(
            r#"{"hosts": "zk1:2181", "region": "r", "cluster": "c",
                "service_type": "bs", "service_id": "bs1",
                "lock_timeout_ms": null,
                "retry": {"max_retries": null, "connect_timeout_ms": null}}"#,
        )
        .unwrap();
        assert_eq!(cfg.lock_timeout_ms, None);
        assert_eq!(cfg.retry.max_retries, None);
        assert_eq!(cfg.retry.connect_timeout_ms, None);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("3600").unwrap(), 3600);
        assert_eq!(parse_duration("60s").unwrap(), 60);
        assert_eq!(parse_duration("90m").unwrap(), 5400);
        assert_eq!(parse_duration("24h").unwrap(), 86400);
        assert!(parse_duration("").is_err());
        assert!(parse_duration("60d").is_err());
        assert!(parse_duration("60mins").is_err());
    }

    #[test]
    fn test_expire_after_forms() {
        let caches: Vec<SharedCache> = serde_json::from_str(
            r#"[{"path": "a", "expire_after": 300},
                {"path": "b", "expire_after": "5m"},
                {"path": "c"}]"#,
        )
        .unwrap();
        assert_eq!(caches[0].expire_after.unwrap().get(), 300);
        assert_eq!(caches[1].expire_after.unwrap().get(), 300);
        assert!(caches[2].expire_after.is_none());

        assert!(serde_json::from_str::<SharedCache>(r#"{"path": "a", "expire_after": 0}"#).is_err());
    }
}
