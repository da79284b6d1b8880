//! Scheduler configuration.
//!
//! Every setting has a default, so an empty environment and no config file is a
//! valid deployment. Values are layered: defaults, then an optional YAML file,
//! then `DEFERQ_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default Redis key of the scheduled-job registry.
pub const DEFAULT_JOBS_KEY: &str = "rq:scheduler:scheduled_jobs";

/// Default Redis key of the scheduler lease.
pub const DEFAULT_LOCK_KEY: &str = "rq:scheduler:scheduler_lock";

/// Extra lease lifetime on top of the poll interval.
const LEASE_SAFETY_MARGIN: Duration = Duration::from_secs(10);

/// Configuration consumed by the scheduler core.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    // Store settings
    /// Redis connection URL.
    pub redis_url: String,
    /// Key of the scheduled-job registry.
    pub jobs_key: String,
    /// Key of the scheduler lease. Distinct keys give independent scheduler groups.
    pub lock_key: String,
    /// Prefix of job record keys.
    pub job_key_prefix: String,
    /// Prefix of execution queue keys.
    pub queue_key_prefix: String,

    // Job defaults
    /// Queue used when a job does not name one.
    pub default_queue: String,
    /// Execution limit handed to workers.
    pub default_timeout: Duration,
    /// Retention after success. `None` keeps the record forever.
    pub default_result_ttl: Option<Duration>,
    /// Retention after failure. `None` keeps the record forever.
    pub default_failure_ttl: Option<Duration>,

    // Loop settings
    /// How often the active instance renews its lease and scans for due jobs.
    pub poll_interval: Duration,
    /// Lease lifetime; must exceed `poll_interval`.
    pub lease_ttl: Duration,
    /// Upper bound on the lease release attempted at shutdown.
    pub release_timeout: Duration,
    /// First delay after a store failure.
    pub backoff_initial: Duration,
    /// Cap on the delay between retries after store failures.
    pub backoff_max: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let poll_interval = Duration::from_secs(60);
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            jobs_key: DEFAULT_JOBS_KEY.to_string(),
            lock_key: DEFAULT_LOCK_KEY.to_string(),
            job_key_prefix: "rq:job:".to_string(),
            queue_key_prefix: "rq:queue:".to_string(),

            default_queue: "default".to_string(),
            default_timeout: Duration::from_secs(180),
            default_result_ttl: Some(Duration::from_secs(500)),
            default_failure_ttl: Some(Duration::from_secs(365 * 24 * 3600)),

            poll_interval,
            lease_ttl: poll_interval + LEASE_SAFETY_MARGIN,
            release_timeout: Duration::from_secs(5),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

/// On-disk layout of the YAML config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    redis_url: Option<String>,
    jobs_key: Option<String>,
    lock_key: Option<String>,
    job_key_prefix: Option<String>,
    queue_key_prefix: Option<String>,
    default_queue: Option<String>,
    default_timeout_secs: Option<u64>,
    result_ttl_secs: Option<i64>,
    failure_ttl_secs: Option<i64>,
    poll_interval_secs: Option<u64>,
    lease_ttl_secs: Option<u64>,
    release_timeout_secs: Option<u64>,
    backoff_max_secs: Option<u64>,
}

impl SchedulerConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads defaults, then the optional YAML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DEFERQ_REDIS_URL`: Redis URL (default: redis://localhost:6379)
    /// - `DEFERQ_JOBS_KEY`: Registry key (default: rq:scheduler:scheduled_jobs)
    /// - `DEFERQ_LOCK_KEY`: Lease key (default: rq:scheduler:scheduler_lock)
    /// - `DEFERQ_JOB_KEY_PREFIX`: Job record key prefix (default: rq:job:)
    /// - `DEFERQ_QUEUE_KEY_PREFIX`: Queue key prefix (default: rq:queue:)
    /// - `DEFERQ_DEFAULT_QUEUE`: Default queue name (default: default)
    /// - `DEFERQ_DEFAULT_TIMEOUT_SECS`: Job timeout (default: 180)
    /// - `DEFERQ_RESULT_TTL_SECS`: Result retention, -1 keeps forever (default: 500)
    /// - `DEFERQ_FAILURE_TTL_SECS`: Failure retention, -1 keeps forever (default: one year)
    /// - `DEFERQ_POLL_INTERVAL_SECS`: Poll interval (default: 60)
    /// - `DEFERQ_LEASE_TTL_SECS`: Lease TTL (default: poll interval + 10)
    /// - `DEFERQ_RELEASE_TIMEOUT_SECS`: Shutdown release bound (default: 5)
    /// - `DEFERQ_BACKOFF_MAX_SECS`: Retry backoff cap (default: 60)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.apply_lookup(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a YAML config file on top of the defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Parses YAML config text on top of the defaults.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = if contents.trim().is_empty() {
            FileConfig::default()
        } else {
            serde_yaml::from_str(contents)?
        };

        let mut config = Self::default();
        let explicit_lease = file.lease_ttl_secs.is_some();

        if let Some(v) = file.redis_url {
            config.redis_url = v;
        }
        if let Some(v) = file.jobs_key {
            config.jobs_key = v;
        }
        if let Some(v) = file.lock_key {
            config.lock_key = v;
        }
        if let Some(v) = file.job_key_prefix {
            config.job_key_prefix = v;
        }
        if let Some(v) = file.queue_key_prefix {
            config.queue_key_prefix = v;
        }
        if let Some(v) = file.default_queue {
            config.default_queue = v;
        }
        if let Some(v) = file.default_timeout_secs {
            config.default_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.result_ttl_secs {
            config.default_result_ttl = retention_from_secs(v);
        }
        if let Some(v) = file.failure_ttl_secs {
            config.default_failure_ttl = retention_from_secs(v);
        }
        if let Some(v) = file.poll_interval_secs {
            config.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.lease_ttl_secs {
            config.lease_ttl = Duration::from_secs(v);
        }
        if let Some(v) = file.release_timeout_secs {
            config.release_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.backoff_max_secs {
            config.backoff_max = Duration::from_secs(v);
        }

        if !explicit_lease {
            config.lease_ttl = config.poll_interval + LEASE_SAFETY_MARGIN;
        }

        Ok(config)
    }

    fn apply_lookup<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Store settings
        if let Some(val) = lookup("DEFERQ_REDIS_URL") {
            self.redis_url = val;
        }
        if let Some(val) = lookup("DEFERQ_JOBS_KEY") {
            self.jobs_key = val;
        }
        if let Some(val) = lookup("DEFERQ_LOCK_KEY") {
            self.lock_key = val;
        }
        if let Some(val) = lookup("DEFERQ_JOB_KEY_PREFIX") {
            self.job_key_prefix = val;
        }
        if let Some(val) = lookup("DEFERQ_QUEUE_KEY_PREFIX") {
            self.queue_key_prefix = val;
        }

        // Job defaults
        if let Some(val) = lookup("DEFERQ_DEFAULT_QUEUE") {
            self.default_queue = val;
        }
        if let Some(val) = lookup("DEFERQ_DEFAULT_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "DEFERQ_DEFAULT_TIMEOUT_SECS")?;
            self.default_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("DEFERQ_RESULT_TTL_SECS") {
            let secs: i64 = parse_env_value(&val, "DEFERQ_RESULT_TTL_SECS")?;
            self.default_result_ttl = retention_from_secs(secs);
        }
        if let Some(val) = lookup("DEFERQ_FAILURE_TTL_SECS") {
            let secs: i64 = parse_env_value(&val, "DEFERQ_FAILURE_TTL_SECS")?;
            self.default_failure_ttl = retention_from_secs(secs);
        }

        // Loop settings
        let mut explicit_lease = false;
        if let Some(val) = lookup("DEFERQ_POLL_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "DEFERQ_POLL_INTERVAL_SECS")?;
            self.poll_interval = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("DEFERQ_LEASE_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "DEFERQ_LEASE_TTL_SECS")?;
            self.lease_ttl = Duration::from_secs(secs);
            explicit_lease = true;
        }
        if !explicit_lease && self.lease_ttl <= self.poll_interval {
            self.lease_ttl = self.poll_interval + LEASE_SAFETY_MARGIN;
        }
        if let Some(val) = lookup("DEFERQ_RELEASE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "DEFERQ_RELEASE_TIMEOUT_SECS")?;
            self.release_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("DEFERQ_BACKOFF_MAX_SECS") {
            let secs: u64 = parse_env_value(&val, "DEFERQ_BACKOFF_MAX_SECS")?;
            self.backoff_max = Duration::from_secs(secs);
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.jobs_key.is_empty() || self.lock_key.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "jobs_key and lock_key cannot be empty".to_string(),
            ));
        }

        if self.jobs_key == self.lock_key {
            return Err(ConfigError::ValidationFailed(
                "jobs_key and lock_key must differ".to_string(),
            ));
        }

        if self.default_queue.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "default_queue cannot be empty".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.lease_ttl <= self.poll_interval {
            return Err(ConfigError::ValidationFailed(format!(
                "lease_ttl ({:?}) must exceed poll_interval ({:?})",
                self.lease_ttl, self.poll_interval
            )));
        }

        if self.backoff_initial.is_zero() || self.backoff_max < self.backoff_initial {
            return Err(ConfigError::ValidationFailed(
                "backoff_max must be at least backoff_initial, which must be non-zero"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the registry and lease keys of the scheduler group.
    pub fn with_keys(mut self, jobs_key: impl Into<String>, lock_key: impl Into<String>) -> Self {
        self.jobs_key = jobs_key.into();
        self.lock_key = lock_key.into();
        self
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_result_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_result_ttl = ttl;
        self
    }

    pub fn with_failure_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_failure_ttl = ttl;
        self
    }

    /// Sets the poll interval, stretching the lease TTL if it would no longer exceed it.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        if self.lease_ttl <= interval {
            self.lease_ttl = interval + LEASE_SAFETY_MARGIN;
        }
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }
}

/// Negative seconds mean "never expire".
pub fn retention_from_secs(secs: i64) -> Option<Duration> {
    u64::try_from(secs).ok().map(Duration::from_secs)
}

/// Inverse of [`retention_from_secs`].
pub fn retention_to_secs(ttl: Option<Duration>) -> i64 {
    match ttl {
        Some(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        None => -1,
    }
}

/// Parse an environment variable value into the specified type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();

        assert_eq!(config.jobs_key, "rq:scheduler:scheduled_jobs");
        assert_eq!(config.lock_key, "rq:scheduler:scheduler_lock");
        assert_eq!(config.default_queue, "default");
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.lease_ttl, Duration::from_secs(70));
        assert_eq!(config.default_result_ttl, Some(Duration::from_secs(500)));
        assert_eq!(config.default_timeout, Duration::from_secs(180));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_environment_is_not_an_error() {
        let config = SchedulerConfig::from_lookup(|_| None).expect("defaults are valid");
        assert_eq!(config, SchedulerConfig::default());
    }

    #[test]
    fn test_environment_overrides() {
        let config = SchedulerConfig::from_lookup(lookup_from(&[
            ("DEFERQ_JOBS_KEY", "group-b:jobs"),
            ("DEFERQ_LOCK_KEY", "group-b:lock"),
            ("DEFERQ_POLL_INTERVAL_SECS", "5"),
            ("DEFERQ_RESULT_TTL_SECS", "-1"),
            ("DEFERQ_FAILURE_TTL_SECS", "3600"),
        ]))
        .expect("should parse");

        assert_eq!(config.jobs_key, "group-b:jobs");
        assert_eq!(config.lock_key, "group-b:lock");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        // Lease TTL keeps its default since it still exceeds the interval.
        assert_eq!(config.lease_ttl, Duration::from_secs(70));
        assert_eq!(config.default_result_ttl, None);
        assert_eq!(config.default_failure_ttl, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_long_poll_interval_stretches_lease() {
        let config =
            SchedulerConfig::from_lookup(lookup_from(&[("DEFERQ_POLL_INTERVAL_SECS", "300")]))
                .expect("should parse");
        assert_eq!(config.lease_ttl, Duration::from_secs(310));
    }

    #[test]
    fn test_invalid_environment_value() {
        let result =
            SchedulerConfig::from_lookup(lookup_from(&[("DEFERQ_POLL_INTERVAL_SECS", "soon")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_explicit_short_lease_is_rejected() {
        let result = SchedulerConfig::from_lookup(lookup_from(&[
            ("DEFERQ_POLL_INTERVAL_SECS", "30"),
            ("DEFERQ_LEASE_TTL_SECS", "20"),
        ]));
        assert!(matches!(result, Err(ConfigError::ValidationFailed(_))));
    }

    #[test]
    fn test_validation_same_keys() {
        let config = SchedulerConfig::default().with_keys("same", "same");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = SchedulerConfig::new()
            .with_redis_url("redis://cache:6380/2")
            .with_default_queue("paper:default")
            .with_poll_interval(Duration::from_secs(120))
            .with_release_timeout(Duration::from_secs(1));

        assert_eq!(config.redis_url, "redis://cache:6380/2");
        assert_eq!(config.default_queue, "paper:default");
        assert_eq!(config.lease_ttl, Duration::from_secs(130));
        assert_eq!(config.release_timeout, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "redis_url: redis://10.0.0.5:6379/1\njobs_key: paper:jobs\nlock_key: paper:lock\npoll_interval_secs: 15\nresult_ttl_secs: -1"
        )
        .expect("write config");

        let config = SchedulerConfig::from_yaml_file(file.path()).expect("should load");
        assert_eq!(config.redis_url, "redis://10.0.0.5:6379/1");
        assert_eq!(config.jobs_key, "paper:jobs");
        assert_eq!(config.poll_interval, Duration::from_secs(15));
        assert_eq!(config.lease_ttl, Duration::from_secs(25));
        assert_eq!(config.default_result_ttl, None);
    }

    #[test]
    fn test_yaml_unknown_key_rejected() {
        let result = SchedulerConfig::from_yaml_str("pol_interval_secs: 3\n");
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_empty_yaml_is_defaults() {
        let config = SchedulerConfig::from_yaml_str("").expect("empty file is fine");
        assert_eq!(config, SchedulerConfig::default());
    }

    #[test]
    fn test_retention_conversion() {
        assert_eq!(retention_from_secs(-1), None);
        assert_eq!(retention_from_secs(0), Some(Duration::ZERO));
        assert_eq!(retention_to_secs(None), -1);
        assert_eq!(retention_to_secs(Some(Duration::from_secs(42))), 42);
    }
}
