use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::{MAX_BROWSE_DAYS, MAX_GENERATION_DAYS};

/// Runtime settings, read once at startup from `SLOTBOOK_*` variables.
/// Unset or unparsable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// WAL appends after which the compactor rewrites the log.
    pub compact_threshold: u64,
    pub session_idle: Duration,
    /// Bound on how long a checkout waits for slot locks.
    pub checkout_timeout: Duration,
    pub generation_days: u32,
    pub browse_days: u32,
    pub hold_ttl: Duration,
    pub reaper_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            session_idle: Duration::from_secs(30 * 60),
            checkout_timeout: Duration::from_secs(5),
            generation_days: 30,
            browse_days: 7,
            hold_ttl: Duration::from_secs(10 * 60),
            reaper_interval: Duration::from_secs(5),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            data_dir: lookup("SLOTBOOK_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            metrics_port: parsed(&lookup, "SLOTBOOK_METRICS_PORT"),
            compact_threshold: parsed(&lookup, "SLOTBOOK_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            session_idle: parsed(&lookup, "SLOTBOOK_SESSION_IDLE_SECS")
                .map_or(d.session_idle, Duration::from_secs),
            checkout_timeout: parsed(&lookup, "SLOTBOOK_CHECKOUT_TIMEOUT_MS")
                .map_or(d.checkout_timeout, Duration::from_millis),
            generation_days: parsed::<u32>(&lookup, "SLOTBOOK_GENERATION_DAYS")
                .filter(|n| (1..=MAX_GENERATION_DAYS).contains(n))
                .unwrap_or(d.generation_days),
            browse_days: parsed::<u32>(&lookup, "SLOTBOOK_BROWSE_DAYS")
                .filter(|n| (1..=MAX_BROWSE_DAYS).contains(n))
                .unwrap_or(d.browse_days),
            hold_ttl: parsed(&lookup, "SLOTBOOK_HOLD_TTL_SECS").map_or(d.hold_ttl, Duration::from_secs),
            reaper_interval: parsed::<u64>(&lookup, "SLOTBOOK_REAPER_INTERVAL_SECS")
                .filter(|n| *n > 0)
                .map_or(d.reaper_interval, Duration::from_secs),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(config(&[]), Config::default());
        assert_eq!(Config::default().session_idle, Duration::from_secs(1800));
    }

    #[test]
    fn reads_overrides() {
        let c = config(&[
            ("SLOTBOOK_DATA_DIR", "/var/lib/slotbook"),
            ("SLOTBOOK_METRICS_PORT", "9100"),
            ("SLOTBOOK_CHECKOUT_TIMEOUT_MS", "250"),
            ("SLOTBOOK_GENERATION_DAYS", "60"),
            ("SLOTBOOK_HOLD_TTL_SECS", " 90 "),
        ]);
        assert_eq!(c.wal_path(), PathBuf::from("/var/lib/slotbook/slotbook.wal"));
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.checkout_timeout, Duration::from_millis(250));
        assert_eq!(c.generation_days, 60);
        assert_eq!(c.hold_ttl, Duration::from_secs(90));
    }

    #[test]
    fn bad_values_fall_back() {
        let c = config(&[
            ("SLOTBOOK_METRICS_PORT", "ninety"),
            ("SLOTBOOK_GENERATION_DAYS", "0"),
            ("SLOTBOOK_BROWSE_DAYS", "1000"),
            ("SLOTBOOK_SESSION_IDLE_SECS", "-5"),
        ]);
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.generation_days, 30);
        assert_eq!(c.browse_days, 7);
        assert_eq!(c.session_idle, Duration::from_secs(1800));
    }
}
