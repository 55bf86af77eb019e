use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::{
    connection::DEFAULT_READ_TIMEOUT,
    policy::{DEFAULT_COOLDOWN, OverflowPolicy},
};

/// Queue capacity used when none is configured.
pub const DEFAULT_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    /// One client, one server.
    OneWay,
    /// Many clients fanned in to one server; replies routed back by origin.
    MultiWay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    /// Receive, forward and acknowledge one message at a time.
    Sync,
    /// Ingest and forward concurrently; acknowledgments follow on their own.
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowKind {
    /// A full queue or failed read ends the session.
    Strict,
    /// A full queue or failed read pauses ingestion for one cooldown.
    Tolerant,
}

/// Everything the relay engine needs to know before it sees a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub topology: Topology,
    pub mode: DeliveryMode,
    pub capacity: usize,
    pub overflow: OverflowKind,
    pub read_timeout_ms: u64,
    pub cooldown_ms: u64,
    /// Minimum spacing between two sends to the server. Unset means no
    /// pacing at all.
    pub send_interval_ms: Option<u64>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            topology: Topology::OneWay,
            mode: DeliveryMode::Sync,
            capacity: DEFAULT_CAPACITY,
            overflow: OverflowKind::Strict,
            read_timeout_ms: DEFAULT_READ_TIMEOUT.as_millis() as u64,
            cooldown_ms: DEFAULT_COOLDOWN.as_millis() as u64,
            send_interval_ms: None,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.capacity > 0, "queue capacity must be a positive integer");
        ensure!(self.read_timeout_ms > 0, "read timeout must be positive");
        ensure!(
            self.overflow == OverflowKind::Strict || self.cooldown_ms > 0,
            "tolerant overflow policy needs a positive cooldown"
        );
        ensure!(
            self.send_interval_ms != Some(0),
            "send interval must be positive when set"
        );
        Ok(())
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).context("invalid relay configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("in config file {}", path.display()))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn send_interval(&self) -> Option<Duration> {
        self.send_interval_ms.map(Duration::from_millis)
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        match self.overflow {
            OverflowKind::Strict => OverflowPolicy::Strict,
            OverflowKind::Tolerant => OverflowPolicy::Tolerant {
                cooldown: Duration::from_millis(self.cooldown_ms),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RelayConfig::default();
        config.validate().expect("defaults are valid");
        assert_eq!(config.capacity, 10);
        assert_eq!(config.read_timeout(), Duration::from_secs(50));
        assert_eq!(config.send_interval(), None);
        assert_eq!(config.overflow_policy(), OverflowPolicy::Strict);
    }

    #[test]
    fn rejects_zero_capacity() {
        let config = RelayConfig {
            capacity: 0,
            ..RelayConfig::default()
        };
        let err = config.validate().expect_err("zero capacity");
        assert!(err.to_string().contains("capacity"));
    }

    #[test]
    fn parses_kebab_case_selectors() {
        let config = RelayConfig::from_json_str(
            r#"{"topology": "multi-way", "mode": "async", "overflow": "tolerant", "cooldown_ms": 1500}"#,
        )
        .expect("valid config");

        assert_eq!(config.topology, Topology::MultiWay);
        assert_eq!(config.mode, DeliveryMode::Async);
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert_eq!(
            config.overflow_policy(),
            OverflowPolicy::Tolerant {
                cooldown: Duration::from_millis(1500)
            }
        );
    }

    #[test]
    fn rejects_unknown_fields_and_bad_values() {
        assert!(RelayConfig::from_json_str(r#"{"capacty": 3}"#).is_err());
        assert!(RelayConfig::from_json_str(r#"{"topology": "star"}"#).is_err());
        assert!(RelayConfig::from_json_str(r#"{"send_interval_ms": 0}"#).is_err());
    }

    #[test]
    fn loads_from_a_file() {
        let path = std::env::temp_dir().join(format!("line-relay-config-{}.json", std::process::id()));
        fs::write(&path, r#"{"capacity": 3, "mode": "async"}"#).expect("write config");

        let loaded = RelayConfig::from_json_file(&path);
        let _ = fs::remove_file(&path);

        let config = loaded.expect("config loads");
        assert_eq!(config.capacity, 3);
        assert_eq!(config.mode, DeliveryMode::Async);
    }
}
