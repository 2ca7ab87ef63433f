//! Scheduler configuration: strategy chain, dispatch-queue tuning, and
//! fallback-reconciler cadence.
//!
//! These values are nested under the `[scheduler]` table of the
//! controller's TOML config file; `fleet-cli` resolves the surrounding
//! chain (CLI flag > env var > config file > default) and hands the
//! parsed `[scheduler]` section to this crate as-is.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A named node-selection strategy. See `scheduler::strategies`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyName {
    Direct,
    Affinity,
    LabelMatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub default: StrategyName,
    pub chain: Vec<StrategyName>,
    pub label_match: LabelMatchConfig,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            default: StrategyName::LabelMatch,
            chain: vec![
                StrategyName::Direct,
                StrategyName::Affinity,
                StrategyName::LabelMatch,
            ],
            label_match: LabelMatchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelMatchConfig {
    pub load_balance: bool,
}

impl Default for LabelMatchConfig {
    fn default() -> Self {
        Self { load_balance: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    #[serde(with = "humantime_secs")]
    pub read_timeout: Duration,
    pub read_count: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            read_count: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    #[serde(with = "humantime_secs")]
    pub interval: Duration,
    #[serde(with = "humantime_secs")]
    pub stale_threshold: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            stale_threshold: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequeueConfig {
    #[serde(with = "humantime_secs")]
    pub offline_threshold: Duration,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            offline_threshold: Duration::from_secs(30),
        }
    }
}

/// The `[scheduler]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub strategy: StrategyConfig,
    pub redis: RedisConfig,
    pub fallback: FallbackConfig,
    pub requeue: RequeueConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyConfig::default(),
            redis: RedisConfig::default(),
            fallback: FallbackConfig::default(),
            requeue: RequeueConfig::default(),
        }
    }
}

/// The `[heartbeat]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    #[serde(with = "humantime_secs")]
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

impl HeartbeatConfig {
    /// TTL for a heartbeat cache record: 3x the heartbeat interval.
    pub fn offline_threshold(&self) -> Duration {
        self.interval * 3
    }
}

/// Serializes a `Duration` as whole seconds, so config files read
/// `interval = 10` rather than a nested struct.
mod humantime_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = SchedulerConfig::default();
        assert_eq!(
            cfg.strategy.chain,
            vec![
                StrategyName::Direct,
                StrategyName::Affinity,
                StrategyName::LabelMatch
            ]
        );
        assert!(cfg.strategy.label_match.load_balance);
        assert_eq!(cfg.redis.read_timeout, Duration::from_secs(5));
        assert_eq!(cfg.redis.read_count, 10);
        assert_eq!(cfg.fallback.interval, Duration::from_secs(300));
        assert_eq!(cfg.fallback.stale_threshold, Duration::from_secs(300));
        assert_eq!(cfg.requeue.offline_threshold, Duration::from_secs(30));
    }

    #[test]
    fn heartbeat_offline_threshold_is_triple_interval() {
        let cfg = HeartbeatConfig::default();
        assert_eq!(cfg.interval, Duration::from_secs(10));
        assert_eq!(cfg.offline_threshold(), Duration::from_secs(30));
    }

    #[test]
    fn scheduler_config_parses_from_toml() {
        let toml_str = r#"
            [strategy]
            default = "direct"
            chain = ["direct", "label_match"]

            [strategy.label_match]
            load_balance = false

            [redis]
            read_timeout = 2
            read_count = 20

            [fallback]
            interval = 60
            stale_threshold = 30

            [requeue]
            offline_threshold = 15
        "#;
        let cfg: SchedulerConfig = toml::from_str(toml_str).expect("should parse");
        assert_eq!(cfg.strategy.default, StrategyName::Direct);
        assert!(!cfg.strategy.label_match.load_balance);
        assert_eq!(cfg.redis.read_count, 20);
        assert_eq!(cfg.fallback.interval, Duration::from_secs(60));
        assert_eq!(cfg.requeue.offline_threshold, Duration::from_secs(15));
    }
}
