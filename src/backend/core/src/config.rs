//! Configuration management.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{KeelError, Result};
use crate::telemetry::LoggingConfig;

/// Main process configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Dispatcher roles to run in this process
    #[serde(default = "default_dispatchers")]
    pub dispatchers: Vec<DispatcherConfig>,

    /// Worker roles to run in this process
    #[serde(default = "default_workers")]
    pub workers: Vec<WorkerConfig>,

    /// Recurring task scheduler
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// How long to wait for a pooled connection
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

/// Settings for a dispatcher: promotes due scheduled jobs and runs concurrency maintenance.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum rows moved per tick
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Idle backoff between ticks that found nothing due
    #[serde(default = "default_dispatcher_polling_interval", with = "humantime_serde")]
    pub polling_interval: Duration,

    /// Cadence of semaphore expiry and blocked-job release
    #[serde(default = "default_concurrency_maintenance_interval", with = "humantime_serde")]
    pub concurrency_maintenance_interval: Duration,

    /// Sleep a random fraction of the polling interval before the first tick
    #[serde(default = "default_initial_jitter")]
    pub initial_jitter: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            polling_interval: default_dispatcher_polling_interval(),
            concurrency_maintenance_interval: default_concurrency_maintenance_interval(),
            initial_jitter: default_initial_jitter(),
        }
    }
}

/// Settings for a worker: claims ready jobs and performs them.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Queue filter expression (`"*"`, `"a,b"`, `"reports*"`)
    #[serde(default = "default_queues")]
    pub queues: String,

    /// Jobs performed concurrently
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Idle backoff between empty claims
    #[serde(default = "default_worker_polling_interval", with = "humantime_serde")]
    pub polling_interval: Duration,

    /// How long shutdown waits for in-flight jobs
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: default_queues(),
            threads: default_threads(),
            polling_interval: default_worker_polling_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Settings for the recurring task scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Idle backoff of the scheduler's own loop
    #[serde(default = "default_scheduler_polling_interval", with = "humantime_serde")]
    pub polling_interval: Duration,

    /// Static recurring tasks keyed by their unique key
    #[serde(default)]
    pub recurring_tasks: BTreeMap<String, RecurringTaskConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            polling_interval: default_scheduler_polling_interval(),
            recurring_tasks: BTreeMap::new(),
        }
    }
}

/// One statically configured recurring task.
#[derive(Debug, Clone, Deserialize)]
pub struct RecurringTaskConfig {
    /// Job class to enqueue
    pub class: String,

    /// Cron expression
    pub schedule: String,

    /// Static argument list
    #[serde(default)]
    pub args: Vec<serde_json::Value>,

    /// Queue override
    pub queue: Option<String>,

    /// Priority override
    pub priority: Option<i32>,
}

// Default value functions
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(5) }
fn default_batch_size() -> usize { 500 }
fn default_dispatcher_polling_interval() -> Duration { Duration::from_secs(1) }
fn default_concurrency_maintenance_interval() -> Duration { Duration::from_secs(600) }
fn default_initial_jitter() -> bool { true }
fn default_queues() -> String { "*".to_string() }
fn default_threads() -> usize { 3 }
fn default_worker_polling_interval() -> Duration { Duration::from_millis(100) }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(5) }
fn default_scheduler_polling_interval() -> Duration { Duration::from_secs(1) }
fn default_dispatchers() -> Vec<DispatcherConfig> { vec![DispatcherConfig::default()] }
fn default_workers() -> Vec<WorkerConfig> { vec![WorkerConfig::default()] }

impl Config {
    /// Load configuration from environment variables (`KEEL__DATABASE__URL`, ...).
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("KEEL").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, overlaid by the environment.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("KEEL").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML document without consulting the environment. Used by
    /// embedding applications that ship their queue settings inline.
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(document)
            .map_err(|e| KeelError::invalid_config(format!("invalid TOML: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the roles cannot run with.
    pub fn validate(&self) -> Result<()> {
        for dispatcher in &self.dispatchers {
            if dispatcher.batch_size == 0 {
                return Err(KeelError::invalid_config("dispatcher batch_size must be positive"));
            }
            if dispatcher.polling_interval.is_zero()
                || dispatcher.concurrency_maintenance_interval.is_zero()
            {
                return Err(KeelError::invalid_config("dispatcher intervals must be positive"));
            }
        }
        for worker in &self.workers {
            if worker.threads == 0 {
                return Err(KeelError::invalid_config("worker threads must be positive"));
            }
            if worker.polling_interval.is_zero() {
                return Err(KeelError::invalid_config("worker polling_interval must be positive"));
            }
            if worker.queues.trim().is_empty() {
                return Err(KeelError::invalid_config("worker queues must not be empty"));
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
    fn test_from_file_applies_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[database]
url = "postgres://keel@localhost/keel"

[[dispatchers]]
batch_size = 100
polling_interval = "2s"

[[workers]]
queues = "critical,default"
threads = 5

[scheduler.recurring_tasks.cleanup]
class = "CleanupJob"
schedule = "0 * * * *"
args = [42]
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.dispatchers.len(), 1);
        assert_eq!(config.dispatchers[0].batch_size, 100);
        assert_eq!(config.dispatchers[0].polling_interval, Duration::from_secs(2));
        assert_eq!(
            config.dispatchers[0].concurrency_maintenance_interval,
            Duration::from_secs(600)
        );
        assert_eq!(config.workers[0].queues, "critical,default");
        assert_eq!(config.workers[0].threads, 5);
        assert_eq!(config.workers[0].polling_interval, Duration::from_millis(100));

        let cleanup = &config.scheduler.recurring_tasks["cleanup"];
        assert_eq!(cleanup.class, "CleanupJob");
        assert_eq!(cleanup.args, vec![serde_json::json!(42)]);
    }

    #[test]
    fn test_from_toml_str() {
        let config = Config::from_toml_str(
            r#"
[database]
url = "postgres://keel@localhost/keel"

[[workers]]
queues = "reports*"
shutdown_timeout = "30s"
"#,
        )
        .unwrap();

        assert_eq!(config.dispatchers.len(), 1);
        assert_eq!(config.workers[0].queues, "reports*");
        assert_eq!(config.workers[0].shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.workers[0].threads, 3);

        let err = Config::from_toml_str("[[workers]]\nthreads = 0\n").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidConfiguration);
    }

    #[test]
    fn test_validate_rejects_zero_threads() {
        let config = Config {
            database: DatabaseConfig {
                url: "postgres://localhost/keel".to_string(),
                max_connections: 1,
                min_connections: 1,
                acquire_timeout: Duration::from_secs(1),
            },
            logging: LoggingConfig::default(),
            dispatchers: vec![],
            workers: vec![WorkerConfig { threads: 0, ..Default::default() }],
            scheduler: SchedulerConfig::default(),
        };

        assert!(config.validate().is_err());
    }
}
