// Daemon settings
// defaults -> optional TOML file -> CARBONBATCH__SECTION__KEY environment variables

use carbonbatch_core::application::{BackoffPolicy, SchedulerConfig};
use carbonbatch_core::port::MaintenanceConfig;
use carbonbatch_infra_system::SubprocessConfig;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "CARBONBATCH_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/carbonbatch.toml";
const ENV_PREFIX: &str = "CARBONBATCH";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub scheduler: SchedulerSettings,
    pub processor: ProcessorSettings,
    pub maintenance: MaintenanceSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    /// Nothing survives a restart
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub backend: StoreBackend,
    /// SQLite file; `~` is expanded, `:memory:` keeps everything in RAM
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: "~/.carbonbatch/batches.db".to_string(),
            max_connections: 5,
        }
    }
}

impl DatabaseSettings {
    /// Expanded database file, `None` for an in-memory database
    pub fn file_path(&self) -> Option<PathBuf> {
        if self.path == ":memory:" {
            return None;
        }
        Some(PathBuf::from(shellexpand::tilde(&self.path).into_owned()))
    }

    pub fn url(&self) -> String {
        match self.file_path() {
            Some(path) => format!("sqlite://{}", path.display()),
            None => "sqlite::memory:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub polling_interval_secs: u64,
    pub worker_pool_size: usize,
    pub jitter_range_secs: u64,
    pub max_batches_per_poll: usize,
    pub lock_timeout_secs: u64,
    pub batch_timeout_secs: u64,
    pub store_timeout_secs: u64,
    pub default_max_retries: i64,
    pub default_priority: i32,
    pub activity_concurrency: usize,
    pub auto_retry: bool,
    pub instance_id: Option<String>,
    /// How long `stop` waits for in-flight batches on SIGINT
    pub shutdown_timeout_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            polling_interval_secs: defaults.polling_interval.as_secs(),
            worker_pool_size: defaults.worker_pool_size,
            jitter_range_secs: defaults.jitter_range.as_secs(),
            max_batches_per_poll: defaults.max_batches_per_poll,
            lock_timeout_secs: defaults.lock_timeout.as_secs(),
            batch_timeout_secs: defaults.batch_timeout.as_secs(),
            store_timeout_secs: defaults.store_timeout.as_secs(),
            default_max_retries: defaults.default_max_retries,
            default_priority: defaults.default_priority,
            activity_concurrency: defaults.activity_concurrency,
            auto_retry: defaults.auto_retry,
            instance_id: None,
            shutdown_timeout_secs: 30,
        }
    }
}

impl SchedulerSettings {
    pub fn to_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            polling_interval: Duration::from_secs(self.polling_interval_secs),
            worker_pool_size: self.worker_pool_size,
            jitter_range: Duration::from_secs(self.jitter_range_secs),
            max_batches_per_poll: self.max_batches_per_poll,
            lock_timeout: Duration::from_secs(self.lock_timeout_secs),
            batch_timeout: Duration::from_secs(self.batch_timeout_secs),
            store_timeout: Duration::from_secs(self.store_timeout_secs),
            default_max_retries: self.default_max_retries,
            default_priority: self.default_priority,
            activity_concurrency: self.activity_concurrency,
            auto_retry: self.auto_retry,
            lock_release_backoff: BackoffPolicy::default(),
            instance_id: self.instance_id.clone(),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorSettings {
    /// Emissions calculator executable
    pub command: String,
    pub args: Vec<String>,
    pub env_allowlist: Vec<String>,
    pub working_dir: Option<String>,
    pub grace_period_ms: u64,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        let defaults = SubprocessConfig::new("carbon-calc");
        Self {
            command: defaults.command,
            args: defaults.args,
            env_allowlist: defaults.env_allowlist,
            working_dir: None,
            grace_period_ms: defaults.grace_period.as_millis() as u64,
        }
    }
}

impl ProcessorSettings {
    pub fn to_config(&self) -> SubprocessConfig {
        SubprocessConfig {
            command: self.command.clone(),
            args: self.args.clone(),
            env_allowlist: self.env_allowlist.clone(),
            working_dir: self
                .working_dir
                .as_deref()
                .map(|dir| PathBuf::from(shellexpand::tilde(dir).into_owned())),
            grace_period: Duration::from_millis(self.grace_period_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    pub enabled: bool,
    pub interval_hours: u64,
    pub finished_batch_retention_days: i64,
    pub max_db_size_mb: f64,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        let defaults = MaintenanceConfig::default();
        Self {
            enabled: true,
            interval_hours: 24,
            finished_batch_retention_days: defaults.finished_batch_retention_days,
            max_db_size_mb: defaults.max_db_size_mb,
        }
    }
}

impl MaintenanceSettings {
    pub fn to_config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            finished_batch_retention_days: self.finished_batch_retention_days,
            max_db_size_mb: self.max_db_size_mb,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours.max(1) * 60 * 60)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub format: LogFormat,
    /// EnvFilter directives, overridden by RUST_LOG
    pub filter: String,
    /// Daily-rolling JSON log files go here when set
    pub directory: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            filter: "carbonbatch=info".to_string(),
            directory: None,
        }
    }
}

impl Settings {
    /// Load from `$CARBONBATCH_CONFIG` (or the default path) and the process environment
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path, environment())
    }

    fn load_from(path: &str, env: Environment) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(env)
            .build()?
            .try_deserialize()
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
