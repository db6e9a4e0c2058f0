//! Engine configuration.
//!
//! Every struct deserializes with defaults for missing fields, so a JSON
//! document only needs the values it changes. [`BatchConfig::with_env_overrides`]
//! applies `BATCHFLOW_*` environment variables on top.

use crate::errors::{BatchError, BatchResult};
use crate::retry::{
    BackOffPolicy, ExponentialBackOffPolicy, FixedBackOffPolicy, JitterStrategy, NoBackOffPolicy,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "BATCHFLOW_";

/// How to pause between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackOffStrategy {
    /// Retry immediately.
    #[default]
    None,
    /// Same delay every time.
    Fixed,
    /// Geometrically growing delay.
    Exponential,
}

impl FromStr for BackOffStrategy {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(BatchError::Configuration(format!(
                "unknown backoff strategy '{other}'"
            ))),
        }
    }
}

/// Backoff between retry attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackOffConfig {
    /// Strategy.
    pub strategy: BackOffStrategy,
    /// First delay (or the fixed delay).
    pub initial_delay_ms: u64,
    /// Growth factor for exponential backoff.
    pub multiplier: f64,
    /// Delay cap for exponential backoff.
    pub max_delay_ms: u64,
    /// Jitter for exponential backoff.
    pub jitter: JitterStrategy,
}

impl Default for BackOffConfig {
    fn default() -> Self {
        Self {
            strategy: BackOffStrategy::None,
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: JitterStrategy::None,
        }
    }
}

impl BackOffConfig {
    /// Builds the configured policy.
    #[must_use]
    pub fn build(&self) -> Arc<dyn BackOffPolicy> {
        match self.strategy {
            BackOffStrategy::None => Arc::new(NoBackOffPolicy),
            BackOffStrategy::Fixed => Arc::new(FixedBackOffPolicy::new(Duration::from_millis(
                self.initial_delay_ms,
            ))),
            BackOffStrategy::Exponential => Arc::new(
                ExponentialBackOffPolicy::new()
                    .with_initial_interval_ms(self.initial_delay_ms)
                    .with_multiplier(self.multiplier)
                    .with_max_interval_ms(self.max_delay_ms)
                    .with_jitter(self.jitter),
            ),
        }
    }
}

/// Settings of a chunk-oriented step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    /// Items per chunk.
    pub commit_interval: usize,
    /// Maximum number of skipped items (read, process and write together).
    pub skip_limit: usize,
    /// Maximum attempts per item; 0 and 1 both mean a single attempt.
    pub retry_limit: usize,
    /// Error kinds that may be skipped.
    pub skippable_kinds: Vec<String>,
    /// Error kinds that may be retried.
    pub retryable_kinds: Vec<String>,
    /// Error kinds that do not roll the chunk back.
    pub no_rollback_kinds: Vec<String>,
    /// Maximum number of starts per job instance; `None` is unbounded.
    pub start_limit: Option<usize>,
    /// Re-run the step on restart even if it already completed.
    pub allow_start_if_complete: bool,
    /// Backoff between retries.
    pub backoff: BackOffConfig,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            commit_interval: 10,
            skip_limit: 0,
            retry_limit: 0,
            skippable_kinds: Vec::new(),
            retryable_kinds: Vec::new(),
            no_rollback_kinds: Vec::new(),
            start_limit: None,
            allow_start_if_complete: false,
            backoff: BackOffConfig::default(),
        }
    }
}

impl StepConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the commit interval.
    #[must_use]
    pub fn with_commit_interval(mut self, commit_interval: usize) -> Self {
        self.commit_interval = commit_interval;
        self
    }

    /// Sets the skip limit and the kinds that may be skipped.
    #[must_use]
    pub fn with_skip<I, S>(mut self, skip_limit: usize, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_limit = skip_limit;
        self.skippable_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the retry limit and the kinds that may be retried.
    #[must_use]
    pub fn with_retry<I, S>(mut self, retry_limit: usize, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retry_limit = retry_limit;
        self.retryable_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the kinds that do not roll the chunk back.
    #[must_use]
    pub fn with_no_rollback<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.no_rollback_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the start limit.
    #[must_use]
    pub fn with_start_limit(mut self, start_limit: usize) -> Self {
        self.start_limit = Some(start_limit);
        self
    }

    /// Allows re-running a completed step on restart.
    #[must_use]
    pub fn with_allow_start_if_complete(mut self, allow: bool) -> Self {
        self.allow_start_if_complete = allow;
        self
    }

    /// Sets the backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackOffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Checks the settings for contradictions.
    pub fn validate(&self) -> BatchResult<()> {
        if self.commit_interval == 0 {
            return Err(BatchError::Configuration(
                "commit_interval must be greater than zero".to_string(),
            ));
        }
        if self.retry_limit > 1 && self.retryable_kinds.is_empty() {
            return Err(BatchError::Configuration(
                "a retry limit requires at least one retryable kind".to_string(),
            ));
        }
        if self.skip_limit > 0 && self.skippable_kinds.is_empty() {
            return Err(BatchError::Configuration(
                "a skip limit requires at least one skippable kind".to_string(),
            ));
        }
        if self.start_limit == Some(0) {
            return Err(BatchError::Configuration(
                "start_limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings of a partitioned step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Number of partitions to create.
    pub grid_size: usize,
    /// Concurrent workers; 0 runs every partition on the caller.
    pub threads: usize,
    /// Poll the repository at this interval instead of awaiting workers.
    pub poll_interval_ms: Option<u64>,
    /// Give up waiting after this long.
    pub timeout_ms: Option<u64>,
    /// Regenerate every partition on restart instead of only the failed ones.
    pub override_on_restart: bool,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            grid_size: 6,
            threads: 0,
            poll_interval_ms: None,
            timeout_ms: None,
            override_on_restart: false,
        }
    }
}

impl PartitionConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the grid size.
    #[must_use]
    pub fn with_grid_size(mut self, grid_size: usize) -> Self {
        self.grid_size = grid_size;
        self
    }

    /// Sets the number of workers.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Enables repository polling.
    #[must_use]
    pub fn with_poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = Some(interval);
        self
    }

    /// Sets the overall timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout: u64) -> Self {
        self.timeout_ms = Some(timeout);
        self
    }

    /// Checks the settings for contradictions.
    pub fn validate(&self) -> BatchResult<()> {
        if self.grid_size == 0 {
            return Err(BatchError::Configuration(
                "grid_size must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_ms == Some(0) {
            return Err(BatchError::Configuration(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Step settings.
    pub step: StepConfig,
    /// Partition settings.
    pub partition: PartitionConfig,
    /// Capacity of the stateful retry cache.
    pub retry_cache_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            step: StepConfig::default(),
            partition: PartitionConfig::default(),
            retry_cache_capacity: 4096,
        }
    }
}

impl BatchConfig {
    /// Parses a JSON document.
    pub fn from_json_str(json: &str) -> BatchResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| BatchError::Configuration(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> BatchResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            BatchError::Configuration(format!("cannot read '{}': {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    /// Applies `BATCHFLOW_*` variables from the process environment.
    pub fn with_env_overrides(self) -> BatchResult<Self> {
        self.with_overrides(std::env::vars())
    }

    /// Applies `BATCHFLOW_*` overrides from any key/value source.
    ///
    /// Unknown `BATCHFLOW_*` keys are ignored; list values are comma
    /// separated.
    pub fn with_overrides<I, K, V>(mut self, vars: I) -> BatchResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref();
            match name {
                "COMMIT_INTERVAL" => self.step.commit_interval = parse(name, value)?,
                "SKIP_LIMIT" => self.step.skip_limit = parse(name, value)?,
                "RETRY_LIMIT" => self.step.retry_limit = parse(name, value)?,
                "SKIPPABLE_KINDS" => self.step.skippable_kinds = split_list(value),
                "RETRYABLE_KINDS" => self.step.retryable_kinds = split_list(value),
                "NO_ROLLBACK_KINDS" => self.step.no_rollback_kinds = split_list(value),
                "START_LIMIT" => self.step.start_limit = Some(parse(name, value)?),
                "ALLOW_START_IF_COMPLETE" => {
                    self.step.allow_start_if_complete = parse(name, value)?;
                }
                "BACKOFF_STRATEGY" => self.step.backoff.strategy = value.parse()?,
                "BACKOFF_INITIAL_DELAY_MS" => {
                    self.step.backoff.initial_delay_ms = parse(name, value)?;
                }
                "BACKOFF_MULTIPLIER" => self.step.backoff.multiplier = parse(name, value)?,
                "BACKOFF_MAX_DELAY_MS" => self.step.backoff.max_delay_ms = parse(name, value)?,
                "GRID_SIZE" => self.partition.grid_size = parse(name, value)?,
                "THREADS" => self.partition.threads = parse(name, value)?,
                "POLL_INTERVAL_MS" => self.partition.poll_interval_ms = Some(parse(name, value)?),
                "TIMEOUT_MS" => self.partition.timeout_ms = Some(parse(name, value)?),
                "OVERRIDE_ON_RESTART" => self.partition.override_on_restart = parse(name, value)?,
                "RETRY_CACHE_CAPACITY" => self.retry_cache_capacity = parse(name, value)?,
                _ => {}
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// Checks every section.
    pub fn validate(&self) -> BatchResult<()> {
        self.step.validate()?;
        self.partition.validate()?;
        if self.retry_cache_capacity == 0 {
            return Err(BatchError::Configuration(
                "retry_cache_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> BatchResult<T> {
    value.trim().parse().map_err(|_| {
        BatchError::Configuration(format!("invalid value '{value}' for {ENV_PREFIX}{name}"))
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|kind| !kind.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = BatchConfig::default();
        assert_eq!(config.step.commit_interval, 10);
        assert_eq!(config.step.skip_limit, 0);
        assert_eq!(config.step.start_limit, None);
        assert_eq!(config.partition.threads, 0);
        assert_eq!(config.retry_cache_capacity, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = BatchConfig::from_json_str(
            r#"{
                "step": {
                    "commit_interval": 3,
                    "retry_limit": 3,
                    "retryable_kinds": ["transient"],
                    "backoff": {"strategy": "exponential", "jitter": "full"}
                },
                "partition": {"grid_size": 4, "threads": 2}
            }"#,
        )
        .unwrap();

        assert_eq!(config.step.commit_interval, 3);
        assert_eq!(config.step.retryable_kinds, vec!["transient".to_string()]);
        assert_eq!(config.step.backoff.strategy, BackOffStrategy::Exponential);
        assert_eq!(config.step.backoff.initial_delay_ms, 100);
        assert_eq!(config.step.backoff.jitter, JitterStrategy::Full);
        assert_eq!(config.partition.grid_size, 4);
        assert_eq!(config.partition.poll_interval_ms, None);
    }

    #[test]
    fn test_overrides() {
        let config = BatchConfig::default()
            .with_overrides([
                ("BATCHFLOW_COMMIT_INTERVAL", "25"),
                ("BATCHFLOW_SKIP_LIMIT", "2"),
                ("BATCHFLOW_SKIPPABLE_KINDS", "poison, parse"),
                ("BATCHFLOW_THREADS", "8"),
                ("BATCHFLOW_BACKOFF_STRATEGY", "fixed"),
                ("PATH", "/usr/bin"),
            ])
            .unwrap();

        assert_eq!(config.step.commit_interval, 25);
        assert_eq!(config.step.skippable_kinds, vec!["poison", "parse"]);
        assert_eq!(config.partition.threads, 8);
        assert_eq!(config.step.backoff.strategy, BackOffStrategy::Fixed);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = BatchConfig::default()
            .with_overrides([("BATCHFLOW_COMMIT_INTERVAL", "many")])
            .unwrap_err();
        assert!(matches!(err, BatchError::Configuration(_)));

        let err = BatchConfig::from_json_str(r#"{"step": {"skip_limit": 3}}"#).unwrap_err();
        assert!(matches!(err, BatchError::Configuration(_)));

        assert!(StepConfig::new().with_commit_interval(0).validate().is_err());
        assert!(StepConfig::new().with_retry(3, ["transient"]).validate().is_ok());
    }

    #[test]
    fn test_backoff_build() {
        let fixed = BackOffConfig {
            strategy: BackOffStrategy::Fixed,
            initial_delay_ms: 7,
            ..BackOffConfig::default()
        };
        let mut ctx = crate::retry::BackOffContext::default();
        assert_eq!(fixed.build().next_delay(&mut ctx), Duration::from_millis(7));
    }
}
