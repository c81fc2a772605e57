//! Application configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Redis configuration.
    pub redis: RedisConfig,
    /// Transmission pipeline configuration.
    #[serde(default)]
    pub transmit: TransmitConfig,
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Key prefix for all Redis keys.
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

/// Settings for the publish transmission pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct TransmitConfig {
    /// Maximum number of queue items selected by one batch run.
    #[serde(default = "default_query_limit")]
    pub max_transmit_query_limit: u64,
    /// Number of delivery attempts before an item is marked failed.
    #[serde(default = "default_max_retry_attempt")]
    pub max_retry_attempt: i32,
    /// Delay before a failed item becomes eligible again.
    #[serde(default = "default_retry_delay_minutes")]
    pub retry_attempt_delay_minutes: i64,
    /// Interval between scheduler ticks.
    #[serde(default = "default_schedule_interval_secs")]
    pub schedule_interval_secs: u64,
    /// Expiry of the global batch run lock.
    #[serde(default = "default_batch_lock_expiry_secs")]
    pub batch_lock_expiry_secs: u64,
    /// Expiry of each per-subscriber lock.
    #[serde(default = "default_subscriber_lock_expiry_secs")]
    pub subscriber_lock_expiry_secs: u64,
    /// Soft time limit for a batch run or subscriber worker task.
    #[serde(default = "default_soft_time_limit_secs")]
    pub task_soft_time_limit_secs: u64,
    /// Batch run requests older than this are dropped unexecuted.
    #[serde(default = "default_trigger_expiry_secs")]
    pub trigger_expiry_secs: u64,
    /// Maximum number of tasks the local executor runs at once.
    #[serde(default = "default_executor_concurrency")]
    pub executor_concurrency: usize,
    /// Capacity of the local task channel.
    #[serde(default = "default_task_queue_capacity")]
    pub task_queue_capacity: usize,
    /// Reset items stuck in progress back to retrying.
    #[serde(default)]
    pub reconcile_stuck_items: bool,
    /// How long an item may stay in progress before it counts as stuck.
    #[serde(default = "default_subscriber_lock_expiry_secs")]
    pub stuck_item_threshold_secs: u64,
}

impl Default for TransmitConfig {
    fn default() -> Self {
        Self {
            max_transmit_query_limit: default_query_limit(),
            max_retry_attempt: default_max_retry_attempt(),
            retry_attempt_delay_minutes: default_retry_delay_minutes(),
            schedule_interval_secs: default_schedule_interval_secs(),
            batch_lock_expiry_secs: default_batch_lock_expiry_secs(),
            subscriber_lock_expiry_secs: default_subscriber_lock_expiry_secs(),
            task_soft_time_limit_secs: default_soft_time_limit_secs(),
            trigger_expiry_secs: default_trigger_expiry_secs(),
            executor_concurrency: default_executor_concurrency(),
            task_queue_capacity: default_task_queue_capacity(),
            reconcile_stuck_items: false,
            stuck_item_threshold_secs: default_subscriber_lock_expiry_secs(),
        }
    }
}

impl TransmitConfig {
    /// Interval between scheduler ticks.
    #[must_use]
    pub const fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_secs)
    }

    /// Soft time limit applied to each task.
    #[must_use]
    pub const fn soft_time_limit(&self) -> Duration {
        Duration::from_secs(self.task_soft_time_limit_secs)
    }

    /// Maximum age of a batch run request.
    #[must_use]
    pub const fn trigger_expiry(&self) -> Duration {
        Duration::from_secs(self.trigger_expiry_secs)
    }

    /// Delay applied before retrying a failed item.
    ///
    /// Out-of-range values are rejected by [`Self::validate`].
    #[must_use]
    pub fn retry_delay(&self) -> chrono::Duration {
        chrono::Duration::try_minutes(self.retry_attempt_delay_minutes)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Age after which an in-progress item counts as stuck.
    #[must_use]
    pub fn stuck_item_threshold(&self) -> chrono::Duration {
        i64::try_from(self.stuck_item_threshold_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        let positive = [
            ("schedule_interval_secs", self.schedule_interval_secs),
            ("task_soft_time_limit_secs", self.task_soft_time_limit_secs),
            ("max_transmit_query_limit", self.max_transmit_query_limit),
            ("executor_concurrency", self.executor_concurrency as u64),
            ("task_queue_capacity", self.task_queue_capacity as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(AppError::Config(format!("transmit.{name} must be greater than 0")));
            }
        }

        if self.max_retry_attempt < 1 {
            return Err(AppError::Config(
                "transmit.max_retry_attempt must be at least 1".to_string(),
            ));
        }

        if self.retry_attempt_delay_minutes < 0
            || chrono::Duration::try_minutes(self.retry_attempt_delay_minutes).is_none()
        {
            return Err(AppError::Config(format!(
                "transmit.retry_attempt_delay_minutes out of range: {}",
                self.retry_attempt_delay_minutes
            )));
        }

        let threshold_in_range = i64::try_from(self.stuck_item_threshold_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .is_some();
        if !threshold_in_range {
            return Err(AppError::Config(format!(
                "transmit.stuck_item_threshold_secs out of range: {}",
                self.stuck_item_threshold_secs
            )));
        }

        if chrono::Duration::from_std(self.trigger_expiry()).is_err() {
            return Err(AppError::Config(format!(
                "transmit.trigger_expiry_secs out of range: {}",
                self.trigger_expiry_secs
            )));
        }

        Ok(())
    }
}

const fn default_max_connections() -> u32 {
    20
}

const fn default_min_connections() -> u32 {
    2
}

fn default_redis_prefix() -> String {
    "courier".to_string()
}

const fn default_query_limit() -> u64 {
    500
}

const fn default_max_retry_attempt() -> i32 {
    10
}

const fn default_retry_delay_minutes() -> i64 {
    3
}

const fn default_schedule_interval_secs() -> u64 {
    10
}

const fn default_batch_lock_expiry_secs() -> u64 {
    1800
}

const fn default_subscriber_lock_expiry_secs() -> u64 {
    300
}

const fn default_soft_time_limit_secs() -> u64 {
    1800
}

const fn default_trigger_expiry_secs() -> u64 {
    10
}

const fn default_executor_concurrency() -> usize {
    8
}

const fn default_task_queue_capacity() -> usize {
    1000
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env` (if present, exported into the process environment)
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `COURIER_ENV`)
    /// 4. Environment variables with `COURIER__` prefix
    ///
    /// The result is validated before it is returned.
    pub fn load() -> AppResult<Self> {
        dotenvy::dotenv().ok();

        let env = std::env::var("COURIER_ENV").unwrap_or_else(|_| "development".to_string());
        tracing::debug!(environment = %env, "Loading configuration");

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("COURIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Self::validated(config.try_deserialize()?)
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("COURIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Self::validated(config.try_deserialize()?)
    }

    fn validated(config: Self) -> AppResult<Self> {
        config.transmit.validate()?;
        Ok(config)
    }
}
