//! Configuration loading, defaulting and validation
//!
//! Configuration comes from a YAML file selected with `--config`, with any
//! scalar option overridable through the environment: `REPLICATOR_` plus
//! the uppercased dotted path with `_` separators (for example
//! `REPLICATOR_SOURCE_SLOT_NAME`). Target arrays are file-only.

use crate::error::{CdcError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "REPLICATOR_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub targets: TargetsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Source database and replication slot settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    #[serde(default)]
    pub connection_string: String,
    #[serde(default)]
    pub slot_name: String,
    #[serde(default)]
    pub publication: String,
}

/// Downstream targets, grouped by store kind
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetsConfig {
    #[serde(default)]
    pub postgres: Vec<PostgresTarget>,
    #[serde(default)]
    pub clickhouse: Vec<ClickHouseTarget>,
    #[serde(default)]
    pub redis: Vec<RedisTarget>,
}

/// Settings common to every target
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetBase {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub batch_size: usize,
    #[serde(default, with = "humantime_serde::option")]
    pub batch_interval: Option<Duration>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Transactional SQL target
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostgresTarget {
    #[serde(flatten)]
    pub base: TargetBase,
    #[serde(default)]
    pub connection_string: String,
}

/// Columnar analytic target
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClickHouseTarget {
    #[serde(flatten)]
    pub base: TargetBase,
    #[serde(default)]
    pub connection_string: String,
}

/// Key/value target
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedisTarget {
    #[serde(flatten)]
    pub base: TargetBase,
    #[serde(default)]
    pub connection_string: String,
    /// Key template, e.g. `users:{id}`; `{table}` and `{schema}` are also
    /// available
    #[serde(default)]
    pub key_pattern: String,
}

/// Bounded exponential backoff settings for one sink
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default, with = "humantime_serde::option")]
    pub backoff: Option<Duration>,
}

impl RetryPolicy {
    fn fill_defaults(&mut self) {
        if self.max_attempts == 0 {
            self.max_attempts = 3;
        }
        if self.backoff.is_none() || self.backoff == Some(Duration::ZERO) {
            self.backoff = Some(Duration::from_millis(100));
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn backoff(&self) -> Duration {
        self.backoff.unwrap_or(Duration::from_millis(100))
    }
}

/// Event routing and batching settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_interval", with = "humantime_serde")]
    pub batch_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            buffer_size: default_buffer_size(),
            batch_size: default_batch_size(),
            batch_interval: default_batch_interval(),
        }
    }
}

/// Metrics endpoint settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_address")]
    pub address: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            address: default_telemetry_address(),
        }
    }
}

fn default_worker_count() -> usize {
    4
}

fn default_buffer_size() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    1_000
}

fn default_batch_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_telemetry_address() -> String {
    ":9090".to_string()
}

/// Load configuration from an optional YAML file, apply environment
/// overrides, fill sink defaults and validate.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                CdcError::config(format!("failed to read {}: {}", path.display(), e))
            })?;
            serde_yaml::from_str(&contents).map_err(|e| {
                CdcError::config(format!("failed to parse {}: {}", path.display(), e))
            })?
        }
        None => Config::default(),
    };

    apply_env_overrides(&mut config)?;
    config.fill_defaults();
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Some(v) = env_var("SOURCE_CONNECTION_STRING") {
        config.source.connection_string = v;
    }
    if let Some(v) = env_var("SOURCE_SLOT_NAME") {
        config.source.slot_name = v;
    }
    if let Some(v) = env_var("SOURCE_PUBLICATION") {
        config.source.publication = v;
    }
    if let Some(v) = env_var("PIPELINE_WORKER_COUNT") {
        config.pipeline.worker_count = parse_env("pipeline.worker_count", &v)?;
    }
    if let Some(v) = env_var("PIPELINE_BUFFER_SIZE") {
        config.pipeline.buffer_size = parse_env("pipeline.buffer_size", &v)?;
    }
    if let Some(v) = env_var("PIPELINE_BATCH_SIZE") {
        config.pipeline.batch_size = parse_env("pipeline.batch_size", &v)?;
    }
    if let Some(v) = env_var("PIPELINE_BATCH_INTERVAL") {
        config.pipeline.batch_interval = humantime::parse_duration(&v).map_err(|e| {
            CdcError::config(format!("invalid pipeline.batch_interval '{}': {}", v, e))
        })?;
    }
    if let Some(v) = env_var("TELEMETRY_ADDRESS") {
        config.telemetry.address = v;
    }
    Ok(())
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, suffix)).ok()
}

fn parse_env<T: std::str::FromStr>(option: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| CdcError::config(format!("invalid {} '{}': {}", option, value, e)))
}

impl Config {
    /// Replace absent or non-positive sizes and intervals with the
    /// sink-specific defaults
    fn fill_defaults(&mut self) {
        for target in &mut self.targets.postgres {
            fill_target_defaults(&mut target.base, 1_000, Duration::from_secs(1));
        }
        for target in &mut self.targets.clickhouse {
            fill_target_defaults(&mut target.base, 5_000, Duration::from_secs(2));
        }
        for target in &mut self.targets.redis {
            fill_target_defaults(&mut target.base, 1_000, Duration::from_secs(1));
        }

        if self.pipeline.worker_count == 0 {
            self.pipeline.worker_count = default_worker_count();
        }
        if self.pipeline.buffer_size == 0 {
            self.pipeline.buffer_size = default_buffer_size();
        }
        if self.pipeline.batch_size == 0 {
            self.pipeline.batch_size = default_batch_size();
        }
        if self.pipeline.batch_interval.is_zero() {
            self.pipeline.batch_interval = default_batch_interval();
        }
        if self.telemetry.address.is_empty() {
            self.telemetry.address = default_telemetry_address();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.source.connection_string.is_empty() {
            return Err(CdcError::config("source.connection_string is required"));
        }
        if self.source.slot_name.is_empty() {
            return Err(CdcError::config("source.slot_name is required"));
        }
        if self.targets.postgres.is_empty() && self.targets.clickhouse.is_empty() {
            return Err(CdcError::config(
                "at least one target (postgres or clickhouse) must be defined",
            ));
        }

        validate_targets("postgres", self.targets.postgres.iter().map(|t| {
            (&t.base, t.connection_string.as_str())
        }))?;
        validate_targets("clickhouse", self.targets.clickhouse.iter().map(|t| {
            (&t.base, t.connection_string.as_str())
        }))?;
        validate_targets("redis", self.targets.redis.iter().map(|t| {
            (&t.base, t.connection_string.as_str())
        }))?;

        Ok(())
    }
}

fn fill_target_defaults(base: &mut TargetBase, batch_size: usize, interval: Duration) {
    if base.batch_size == 0 {
        base.batch_size = batch_size;
    }
    if base.batch_interval.is_none() || base.batch_interval == Some(Duration::ZERO) {
        base.batch_interval = Some(interval);
    }
    base.retry.fill_defaults();
}

fn validate_targets<'a>(
    kind: &str,
    targets: impl Iterator<Item = (&'a TargetBase, &'a str)>,
) -> Result<()> {
    for (index, (base, connection_string)) in targets.enumerate() {
        if base.name.is_empty() {
            return Err(CdcError::config(format!(
                "targets.{}[{}].name is required",
                kind, index
            )));
        }
        if connection_string.is_empty() {
            return Err(CdcError::config(format!(
                "targets.{}[{}].connection_string is required",
                kind, index
            )));
        }
    }
    Ok(())
}
