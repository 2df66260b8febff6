//! Configuration management for Commandpool.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{PoolError, Result};

/// Prefix for environment overrides, e.g. `COMMANDPOOL__LIMITS__SUBMIT__LIMIT=8`.
pub const ENV_PREFIX: &str = "COMMANDPOOL";

/// Main configuration for the Commandpool service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandPoolConfig {
    /// Per-origin request limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Distribution engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Token store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Lifecycle sweeper settings
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Ingestion feeds
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Process-level settings for the `run` command
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// A single fixed-window limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Requests admitted per origin per window
    pub limit: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl LimitConfig {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window_secs: window.as_secs(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Rate limiting configuration for both action classes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Limit on submissions
    #[serde(default = "default_submit_limit")]
    pub submit: LimitConfig,

    /// Limit on distribution requests
    #[serde(default = "default_distribute_limit")]
    pub distribute: LimitConfig,

    /// Idle origin records are reclaimed this many windows after their reset time
    #[serde(default = "default_reclaim_after_windows")]
    pub reclaim_after_windows: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            submit: default_submit_limit(),
            distribute: default_distribute_limit(),
            reclaim_after_windows: default_reclaim_after_windows(),
        }
    }
}

fn default_window_secs() -> u64 {
    60
}

fn default_submit_limit() -> LimitConfig {
    LimitConfig {
        limit: 5,
        window_secs: default_window_secs(),
    }
}

fn default_distribute_limit() -> LimitConfig {
    LimitConfig {
        limit: 10,
        window_secs: default_window_secs(),
    }
}

fn default_reclaim_after_windows() -> u32 {
    5
}

/// Distribution engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// A command is handed out at most this many times
    #[serde(default = "default_max_views")]
    pub max_views: u32,

    /// Minimum content length in characters, after trimming
    #[serde(default = "default_min_content_chars")]
    pub min_content_chars: usize,

    /// Maximum content length in characters, after trimming
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,

    /// Extra attempts after a contention failure
    #[serde(default = "default_contention_retries")]
    pub contention_retries: u32,

    /// Backoff before the first retry, doubled on each further retry
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Offer a requester their own submissions when nothing else is left
    #[serde(default)]
    pub offer_own_as_last_resort: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_views: default_max_views(),
            min_content_chars: default_min_content_chars(),
            max_content_chars: default_max_content_chars(),
            contention_retries: default_contention_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            offer_own_as_last_resort: false,
        }
    }
}

impl EngineConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn default_max_views() -> u32 {
    3
}

fn default_min_content_chars() -> usize {
    10
}

fn default_max_content_chars() -> usize {
    500
}

fn default_contention_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    20
}

/// Which store implementation backs the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

/// Token store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection string for the `postgres` backend
    #[serde(default)]
    pub database_url: Option<String>,

    /// How long a transaction waits for a row lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Connection pool size for the `postgres` backend
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            database_url: None,
            lock_timeout_ms: default_lock_timeout_ms(),
            max_connections: default_max_connections(),
        }
    }
}

impl StoreConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

fn default_lock_timeout_ms() -> u64 {
    2000
}

fn default_max_connections() -> u32 {
    5
}

/// Lifecycle sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Interval between age sweeps
    #[serde(default = "default_age_sweep_interval")]
    pub age_sweep_interval_secs: u64,

    /// Crawler commands older than this are swept
    #[serde(default = "default_crawler_retention")]
    pub crawler_retention_secs: u64,

    /// Delay before the first age sweep
    #[serde(default = "default_startup_delay")]
    pub startup_delay_secs: u64,

    /// Whether the daily full reset runs at all
    #[serde(default = "default_daily_reset")]
    pub daily_reset: bool,

    /// Hour of day (0-23) at which the pool is wiped
    #[serde(default)]
    pub reset_hour: u32,

    /// Fixed UTC offset for the reset boundary; local time when unset
    #[serde(default)]
    pub reset_utc_offset_minutes: Option<i32>,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            age_sweep_interval_secs: default_age_sweep_interval(),
            crawler_retention_secs: default_crawler_retention(),
            startup_delay_secs: default_startup_delay(),
            daily_reset: default_daily_reset(),
            reset_hour: 0,
            reset_utc_offset_minutes: None,
        }
    }
}

impl SweeperConfig {
    pub fn age_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.age_sweep_interval_secs)
    }

    pub fn crawler_retention(&self) -> Duration {
        Duration::from_secs(self.crawler_retention_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }
}

fn default_age_sweep_interval() -> u64 {
    3600
}

fn default_crawler_retention() -> u64 {
    3600
}

fn default_startup_delay() -> u64 {
    15
}

fn default_daily_reset() -> bool {
    true
}

/// A crawl report file that is re-ingested on a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Name used in logs
    pub name: String,

    /// Path of the JSON crawl report
    pub path: PathBuf,

    /// Interval between ingestions
    pub interval_secs: u64,

    /// Delay before the first ingestion
    #[serde(default)]
    pub startup_delay_secs: u64,
}

impl FeedConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }
}

/// Ingestion configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

/// Settings for the long-running process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Interval between pool statistics log lines
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: default_stats_interval(),
        }
    }
}

fn default_stats_interval() -> u64 {
    300
}

impl CommandPoolConfig {
    /// Load configuration from an optional YAML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: CommandPoolConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: CommandPoolConfig =
            serde_yaml::from_str(yaml).map_err(|e| PoolError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (name, limit) in [
            ("submit", &self.limits.submit),
            ("distribute", &self.limits.distribute),
        ] {
            if limit.limit == 0 || limit.window_secs == 0 {
                return Err(PoolError::Config(format!(
                    "limits.{} needs a non-zero limit and window",
                    name
                )));
            }
        }

        if self.engine.max_views == 0 {
            return Err(PoolError::Config("engine.max_views must be at least 1".into()));
        }

        if self.engine.min_content_chars > self.engine.max_content_chars {
            return Err(PoolError::Config(
                "engine.min_content_chars exceeds engine.max_content_chars".into(),
            ));
        }

        if self.sweeper.reset_hour >= 24 {
            return Err(PoolError::Config("sweeper.reset_hour must be 0-23".into()));
        }

        if self.store.backend == StoreBackend::Postgres && self.store.database_url.is_none() {
            return Err(PoolError::Config(
                "store.database_url is required for the postgres backend".into(),
            ));
        }

        if self.sweeper.age_sweep_interval_secs == 0 {
            return Err(PoolError::Config(
                "sweeper.age_sweep_interval_secs must be non-zero".into(),
            ));
        }

        for feed in &self.ingest.feeds {
            if feed.interval_secs == 0 {
                return Err(PoolError::Config(format!(
                    "ingest feed '{}' needs a non-zero interval",
                    feed.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_reference_policy() {
        let config = CommandPoolConfig::default();

        assert_eq!(config.limits.submit, LimitConfig::new(5, Duration::from_secs(60)));
        assert_eq!(config.limits.distribute, LimitConfig::new(10, Duration::from_secs(60)));
        assert_eq!(config.limits.reclaim_after_windows, 5);
        assert_eq!(config.engine.max_views, 3);
        assert_eq!(config.engine.min_content_chars, 10);
        assert_eq!(config.engine.max_content_chars, 500);
        assert!(!config.engine.offer_own_as_last_resort);
        assert_eq!(config.sweeper.crawler_retention(), Duration::from_secs(3600));
        assert_eq!(config.sweeper.age_sweep_interval(), Duration::from_secs(3600));
        assert_eq!(config.sweeper.reset_hour, 0);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
limits:
  submit:
    limit: 2
engine:
  offer_own_as_last_resort: true
sweeper:
  reset_hour: 4
  reset_utc_offset_minutes: 480
ingest:
  feeds:
    - name: single_thread
      path: /var/lib/commandpool/commands.json
      interval_secs: 1800
"#;
        let config = CommandPoolConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.limits.submit.limit, 2);
        assert_eq!(config.limits.submit.window_secs, 60);
        assert_eq!(config.limits.distribute.limit, 10);
        assert!(config.engine.offer_own_as_last_resort);
        assert_eq!(config.sweeper.reset_hour, 4);
        assert_eq!(config.sweeper.reset_utc_offset_minutes, Some(480));
        assert_eq!(config.ingest.feeds.len(), 1);
        assert_eq!(config.ingest.feeds[0].interval(), Duration::from_secs(1800));
        assert_eq!(config.ingest.feeds[0].startup_delay(), Duration::ZERO);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let err = CommandPoolConfig::from_yaml("engine:\n  max_views: 0\n").unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));

        let err = CommandPoolConfig::from_yaml("sweeper:\n  reset_hour: 24\n").unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));

        let err = CommandPoolConfig::from_yaml("store:\n  backend: postgres\n").unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));

        let err = CommandPoolConfig::from_yaml(
            "engine:\n  min_content_chars: 20\n  max_content_chars: 10\n",
        )
        .unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));

        let err = CommandPoolConfig::from_yaml("sweeper:\n  age_sweep_interval_secs: 0\n")
            .unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "limits:\n  distribute:\n    limit: 20\n    window_secs: 30").unwrap();

        let config = CommandPoolConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.limits.distribute.limit, 20);
        assert_eq!(config.limits.distribute.window(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = CommandPoolConfig::load(Some(Path::new("/nonexistent/commandpool.yaml")));
        assert!(matches!(result, Err(PoolError::Config(_))));
    }
}
