//! Connector configuration.
//!
//! [`ConnectorConfig`] is the flat `key = value` property map a job
//! description supplies. [`KinesisSourceConfig::from_config`] turns it into
//! a validated, typed configuration.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::error::ConnectorError;
use crate::shard::StartingPosition;

/// Upper bound the service enforces on `getRecords` batch size.
pub const MAX_RECORDS_PER_FETCH_LIMIT: usize = 10_000;

/// Flat property map for a connector instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    connector_type: String,
    properties: HashMap<String, String>,
}

impl ConnectorConfig {
    /// Create an empty config for the given connector type.
    #[must_use]
    pub fn new(connector_type: impl Into<String>) -> Self {
        Self {
            connector_type: connector_type.into(),
            properties: HashMap::new(),
        }
    }

    /// Builder-style property setter.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a property.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Connector type this config was created for.
    #[must_use]
    pub fn connector_type(&self) -> &str {
        &self.connector_type
    }

    /// Raw value of a property.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Value of a required property.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::MissingConfig` if the key is absent.
    pub fn require(&self, key: &str) -> Result<&str, ConnectorError> {
        self.get(key)
            .ok_or_else(|| ConnectorError::MissingConfig(key.to_string()))
    }

    /// Parsed value of an optional property.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ConfigurationError` if the value is present
    /// but does not parse.
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>, ConnectorError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
                ConnectorError::ConfigurationError(format!(
                    "invalid value '{raw}' for '{key}': {e}"
                ))
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Option enums
// ---------------------------------------------------------------------------

/// Where a fresh job starts reading the shards present at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StartingPositionKind {
    /// Oldest retained record.
    TrimHorizon,
    /// Only records written after startup.
    #[default]
    Latest,
    /// Records at or after `starting.timestamp.ms`.
    AtTimestamp,
}

str_enum!(StartingPositionKind, uppercase, "invalid starting.position",
    TrimHorizon => "TRIM_HORIZON";
    Latest => "LATEST";
    AtTimestamp => "AT_TIMESTAMP");

/// Built-in shard assignment policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AssignerKind {
    /// Fewest active splits wins.
    #[default]
    Uniform,
    /// Deterministic hash of the shard id.
    Hash,
}

str_enum!(AssignerKind, lowercase, "invalid shard.assigner",
    Uniform => "uniform";
    Hash => "hash", "hash_based");

// ---------------------------------------------------------------------------
// Serde helper: Duration as milliseconds
// ---------------------------------------------------------------------------

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Retry policy for transient service failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// First backoff delay.
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Attempts before a transient failure becomes fatal.
    pub max_attempts: u32,
    /// Randomize each delay in `[0, computed]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_secs(10),
            multiplier: 1.5,
            max_attempts: 10,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Build a fresh backoff tracker for this policy.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self)
    }
}

/// Validated configuration of the Kinesis source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KinesisSourceConfig {
    /// Stream to read.
    pub stream_arn: String,
    /// Starting position for shards present at job start.
    pub starting_position: StartingPositionKind,
    /// Epoch millis used with [`StartingPositionKind::AtTimestamp`].
    pub starting_timestamp_ms: Option<i64>,
    /// Period between two shard discoveries.
    #[serde(with = "duration_millis")]
    pub discovery_interval: Duration,
    /// Minimum delay between two fetches of the same split.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// `getRecords` batch limit.
    pub max_records_per_fetch: usize,
    /// Built-in assignment policy.
    pub assigner: AssignerKind,
    /// Maximum active splits per reader; 0 means unbounded.
    pub max_splits_per_reader: usize,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
}

impl KinesisSourceConfig {
    /// Create a config for `stream_arn` with every other option at its default.
    #[must_use]
    pub fn new(stream_arn: impl Into<String>) -> Self {
        Self {
            stream_arn: stream_arn.into(),
            starting_position: StartingPositionKind::default(),
            starting_timestamp_ms: None,
            discovery_interval: Duration::from_secs(10),
            poll_interval: Duration::from_millis(200),
            max_records_per_fetch: MAX_RECORDS_PER_FETCH_LIMIT,
            assigner: AssignerKind::default(),
            max_splits_per_reader: 0,
            retry: RetryConfig::default(),
        }
    }

    /// Builds a [`KinesisSourceConfig`] from a flat [`ConnectorConfig`].
    ///
    /// Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::MissingConfig` if `stream.arn` is absent and
    /// `ConnectorError::ConfigurationError` if a value cannot be parsed or
    /// fails validation.
    pub fn from_config(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        let defaults = Self::new(config.require("stream.arn")?.trim());
        let retry_defaults = RetryConfig::default();

        let starting_position: StartingPositionKind = config
            .get_parsed("starting.position")?
            .unwrap_or(defaults.starting_position);

        let discovery_ms: Option<u64> = config.get_parsed("shard.discovery.interval.ms")?;
        let poll_ms: Option<u64> = config.get_parsed("poll.interval.ms")?;
        let initial_ms: Option<u64> = config.get_parsed("retry.initial.backoff.ms")?;
        let max_ms: Option<u64> = config.get_parsed("retry.max.backoff.ms")?;

        let cfg = Self {
            starting_position,
            starting_timestamp_ms: config.get_parsed("starting.timestamp.ms")?,
            discovery_interval: discovery_ms
                .map_or(defaults.discovery_interval, Duration::from_millis),
            poll_interval: poll_ms.map_or(defaults.poll_interval, Duration::from_millis),
            max_records_per_fetch: config
                .get_parsed("max.records.per.fetch")?
                .unwrap_or(defaults.max_records_per_fetch),
            assigner: config
                .get_parsed("shard.assigner")?
                .unwrap_or(defaults.assigner),
            max_splits_per_reader: config
                .get_parsed("max.splits.per.reader")?
                .unwrap_or(defaults.max_splits_per_reader),
            retry: RetryConfig {
                initial_backoff: initial_ms
                    .map_or(retry_defaults.initial_backoff, Duration::from_millis),
                max_backoff: max_ms.map_or(retry_defaults.max_backoff, Duration::from_millis),
                multiplier: config
                    .get_parsed("retry.backoff.multiplier")?
                    .unwrap_or(retry_defaults.multiplier),
                max_attempts: config
                    .get_parsed("retry.max.attempts")?
                    .unwrap_or(retry_defaults.max_attempts),
                jitter: config
                    .get_parsed("retry.jitter")?
                    .unwrap_or(retry_defaults.jitter),
            },
            ..defaults
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ConfigurationError` describing the first
    /// violated constraint.
    pub fn validate(&self) -> Result<(), ConnectorError> {
        if self.stream_arn.is_empty() {
            return Err(ConnectorError::ConfigurationError(
                "stream.arn must not be empty".into(),
            ));
        }
        match (self.starting_position, self.starting_timestamp_ms) {
            (StartingPositionKind::AtTimestamp, None) => {
                return Err(ConnectorError::ConfigurationError(
                    "starting.position AT_TIMESTAMP requires starting.timestamp.ms".into(),
                ));
            }
            (StartingPositionKind::AtTimestamp, Some(ts)) if ts < 0 => {
                return Err(ConnectorError::ConfigurationError(format!(
                    "starting.timestamp.ms must not be negative, got {ts}"
                )));
            }
            _ => {}
        }
        if !(1..=MAX_RECORDS_PER_FETCH_LIMIT).contains(&self.max_records_per_fetch) {
            return Err(ConnectorError::ConfigurationError(format!(
                "max.records.per.fetch must be in 1..={MAX_RECORDS_PER_FETCH_LIMIT}, got {}",
                self.max_records_per_fetch
            )));
        }
        if self.discovery_interval.is_zero() {
            return Err(ConnectorError::ConfigurationError(
                "shard.discovery.interval.ms must be > 0".into(),
            ));
        }
        if self.retry.max_backoff < self.retry.initial_backoff {
            return Err(ConnectorError::ConfigurationError(format!(
                "retry.max.backoff.ms ({}) must be >= retry.initial.backoff.ms ({})",
                self.retry.max_backoff.as_millis(),
                self.retry.initial_backoff.as_millis()
            )));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConnectorError::ConfigurationError(format!(
                "retry.backoff.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConnectorError::ConfigurationError(
                "retry.max.attempts must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Position used for shards present in the first discovery of a fresh job.
    ///
    /// `LATEST` resolves to the job start time `start_time_ms`, so a split
    /// checkpointed before its first record still resumes where the job
    /// began.
    #[must_use]
    pub fn initial_position(&self, start_time_ms: i64) -> StartingPosition {
        match self.starting_position {
            StartingPositionKind::TrimHorizon => StartingPosition::TrimHorizon,
            StartingPositionKind::Latest => StartingPosition::AtTimestamp(start_time_ms),
            StartingPositionKind::AtTimestamp => {
                StartingPosition::AtTimestamp(self.starting_timestamp_ms.unwrap_or(0))
            }
        }
    }

    /// Per-reader split capacity, `None` when unbounded.
    #[must_use]
    pub fn reader_capacity(&self) -> Option<usize> {
        (self.max_splits_per_reader > 0).then_some(self.max_splits_per_reader)
    }
}
