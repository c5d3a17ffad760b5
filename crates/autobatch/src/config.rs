//! Autobatching configuration: strategy selection, batch caps, and plan cache sizing.
//!
//! Settings follow the `--autobatch N` convention (`0` disables batching, `1` selects the
//! agenda-based scheduler, `2` the depth-based one) and can be loaded from JSON or from the
//! `AUTOBATCH`, `AUTOBATCH_MAX_BATCH`, and `AUTOBATCH_PLAN_CACHE` environment variables.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::env;

/// Default number of cached plans retained per graph before LRU eviction kicks in.
pub const DEFAULT_PLAN_CACHE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown autobatch strategy `{0}` (expected 0|1|2|off|agenda|depth)")]
    UnknownStrategy(String),
    #[error("invalid value `{value}` for {setting}")]
    InvalidValue { setting: &'static str, value: String },
    #[error("malformed autobatch config: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Scheduling strategy used to group pending nodes into batched steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BatchStrategy {
    /// Every node runs on its own, in creation order.
    #[default]
    Off,
    /// Ready nodes are bucketed by signature; the shallowest bucket runs first.
    Agenda,
    /// Nodes are grouped by (depth, signature) and run depth by depth.
    Depth,
}

impl BatchStrategy {
    pub const ALL: [BatchStrategy; 3] =
        [BatchStrategy::Off, BatchStrategy::Agenda, BatchStrategy::Depth];

    /// Numeric level matching the command-line convention.
    pub fn level(self) -> u8 {
        match self {
            BatchStrategy::Off => 0,
            BatchStrategy::Agenda => 1,
            BatchStrategy::Depth => 2,
        }
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(BatchStrategy::Off),
            1 => Some(BatchStrategy::Agenda),
            2 => Some(BatchStrategy::Depth),
            _ => None,
        }
    }

    pub fn is_enabled(self) -> bool {
        self != BatchStrategy::Off
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStrategy::Off => "off",
            BatchStrategy::Agenda => "agenda",
            BatchStrategy::Depth => "depth",
        }
    }
}

impl fmt::Display for BatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStrategy {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if let Ok(level) = trimmed.parse::<u8>() {
            return BatchStrategy::from_level(level)
                .ok_or_else(|| ConfigError::UnknownStrategy(trimmed.to_string()));
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "agenda" => Ok(BatchStrategy::Agenda),
            "depth" => Ok(BatchStrategy::Depth),
            "none" => Ok(BatchStrategy::Off),
            other => match env::parse_bool(other) {
                // Bare on/off toggles select the default batching strategy.
                Some(true) => Ok(BatchStrategy::Agenda),
                Some(false) => Ok(BatchStrategy::Off),
                None => Err(ConfigError::UnknownStrategy(trimmed.to_string())),
            },
        }
    }
}

impl Serialize for BatchStrategy {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BatchStrategy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Setting {
            Level(u8),
            Name(String),
        }

        match Setting::deserialize(deserializer)? {
            Setting::Level(level) => BatchStrategy::from_level(level).ok_or_else(|| {
                serde::de::Error::custom(ConfigError::UnknownStrategy(level.to_string()))
            }),
            Setting::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Per-graph autobatching settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutobatchConfig {
    pub strategy: BatchStrategy,
    /// Upper bound on the number of nodes per batched kernel call; `None` is unbounded.
    pub max_batch_size: Option<usize>,
    /// Number of structural plans kept per graph; `0` disables plan caching.
    pub plan_cache_capacity: usize,
}

impl Default for AutobatchConfig {
    fn default() -> Self {
        AutobatchConfig {
            strategy: BatchStrategy::Off,
            max_batch_size: None,
            plan_cache_capacity: DEFAULT_PLAN_CACHE_CAPACITY,
        }
    }
}

impl AutobatchConfig {
    pub fn new(strategy: BatchStrategy) -> Self {
        AutobatchConfig {
            strategy,
            ..AutobatchConfig::default()
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = Some(max_batch_size);
        self
    }

    pub fn with_plan_cache_capacity(mut self, capacity: usize) -> Self {
        self.plan_cache_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == Some(0) {
            return Err(ConfigError::InvalidValue {
                setting: "max_batch_size",
                value: "0".into(),
            });
        }
        Ok(())
    }

    pub fn from_json_str(src: &str) -> Result<Self, ConfigError> {
        let config: AutobatchConfig = serde_json::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Overlays the `AUTOBATCH*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env::read)
    }

    /// Like [`AutobatchConfig::from_env`], but falls back to defaults on malformed values.
    pub fn from_env_or_default() -> Self {
        match Self::from_env() {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring malformed autobatch environment");
                AutobatchConfig::default()
            }
        }
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = AutobatchConfig::default();
        if let Some(value) = lookup(env::AUTOBATCH_VAR) {
            config.strategy = value.parse()?;
        }
        if let Some(value) = lookup(env::MAX_BATCH_VAR) {
            let parsed = value.parse().map_err(|_| ConfigError::InvalidValue {
                setting: env::MAX_BATCH_VAR,
                value: value.clone(),
            })?;
            config.max_batch_size = Some(parsed);
        }
        if let Some(value) = lookup(env::PLAN_CACHE_VAR) {
            config.plan_cache_capacity = value.parse().map_err(|_| ConfigError::InvalidValue {
                setting: env::PLAN_CACHE_VAR,
                value: value.clone(),
            })?;
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parses_levels_names_and_toggles() {
        assert_eq!("0".parse::<BatchStrategy>().unwrap(), BatchStrategy::Off);
        assert_eq!("1".parse::<BatchStrategy>().unwrap(), BatchStrategy::Agenda);
        assert_eq!(" depth ".parse::<BatchStrategy>().unwrap(), BatchStrategy::Depth);
        assert_eq!("on".parse::<BatchStrategy>().unwrap(), BatchStrategy::Agenda);
        assert!("3".parse::<BatchStrategy>().is_err());
        assert!("fast".parse::<BatchStrategy>().is_err());
    }

    #[test]
    fn json_accepts_numeric_and_named_strategies() {
        let config = AutobatchConfig::from_json_str(r#"{"strategy": 2}"#).unwrap();
        assert_eq!(config.strategy, BatchStrategy::Depth);
        assert_eq!(config.plan_cache_capacity, DEFAULT_PLAN_CACHE_CAPACITY);

        let config =
            AutobatchConfig::from_json_str(r#"{"strategy": "agenda", "max_batch_size": 8}"#)
                .unwrap();
        assert_eq!(config.strategy, BatchStrategy::Agenda);
        assert_eq!(config.max_batch_size, Some(8));
    }

    #[test]
    fn zero_batch_cap_is_rejected() {
        let err = AutobatchConfig::from_json_str(r#"{"max_batch_size": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn lookup_overlays_environment_values() {
        let config = AutobatchConfig::from_lookup(|name| match name {
            "AUTOBATCH" => Some("2".into()),
            "AUTOBATCH_PLAN_CACHE" => Some("0".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.strategy, BatchStrategy::Depth);
        assert_eq!(config.plan_cache_capacity, 0);
        assert_eq!(config.max_batch_size, None);

        let err = AutobatchConfig::from_lookup(|name| {
            (name == "AUTOBATCH_MAX_BATCH").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("AUTOBATCH_MAX_BATCH"));
    }

    #[test]
    fn serialized_config_round_trips_names() {
        let config = AutobatchConfig::new(BatchStrategy::Agenda).with_max_batch_size(4);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"agenda\""));
        assert_eq!(AutobatchConfig::from_json_str(&json).unwrap(), config);
    }
}
