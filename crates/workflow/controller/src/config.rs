//! Configuration for the workflow controller
//!
//! Loaded in layers: built-in defaults, then an optional file, then
//! `WORKFLOW__`-prefixed environment variables (`WORKFLOW__DISPATCH__WORKERS=8`).

use serde::{Deserialize, Serialize};
use std::time::Duration;
use workflow_engine::{EngineConfig, DEFAULT_MAX_STACK_DEPTH, DEFAULT_OFFLOAD_THRESHOLD};
use workflow_sync::ThrottleLimits;

/// Main controller configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Worker pool and queue timing
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Admission limits
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// Semaphore and mutex settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Reconciliation engine settings
    #[serde(default)]
    pub engine: EngineSettings,

    /// Node status offloading
    #[serde(default)]
    pub offload: OffloadConfig,

    /// Workflow archive
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Config map whose changes update the parallelism limits
    #[serde(default)]
    pub controller_config_map: ConfigMapRef,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker pool and queue timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Concurrent reconciliation workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Every reconciled workflow is looked at again after this period
    #[serde(default = "default_resync_period")]
    pub resync_period_secs: u64,

    /// Delay before a newly added workflow is first reconciled
    #[serde(default)]
    pub initial_delay_ms: u64,

    /// How long a completed workflow stays in the recent-completions set
    #[serde(default = "default_recent_completion_window")]
    pub recent_completion_window_secs: u64,

    /// Rate-limited retries of a transient failure before the workflow errors
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            resync_period_secs: default_resync_period(),
            initial_delay_ms: 0,
            recent_completion_window_secs: default_recent_completion_window(),
            max_transient_retries: default_max_transient_retries(),
        }
    }
}

/// Admission limits; 0 means unlimited
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default)]
    pub parallelism: usize,

    #[serde(default)]
    pub namespace_parallelism: usize,
}

impl ThrottleConfig {
    pub fn limits(&self) -> ThrottleLimits {
        ThrottleLimits::new(self.parallelism, self.namespace_parallelism)
    }
}

/// Semaphore and mutex settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Delay before a waiter is reconciled after a lock frees up
    #[serde(default = "default_notify_delay")]
    pub notify_delay_ms: u64,

    /// How often holders of deleted workflows are swept
    #[serde(default = "default_existence_check_period")]
    pub existence_check_period_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            notify_delay_ms: default_notify_delay(),
            existence_check_period_secs: default_existence_check_period(),
        }
    }
}

/// Reconciliation engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_max_stack_depth")]
    pub max_stack_depth: usize,

    /// How soon a workflow with running tasks is looked at again
    #[serde(default = "default_task_poll_interval")]
    pub task_poll_interval_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_stack_depth: default_max_stack_depth(),
            task_poll_interval_secs: default_task_poll_interval(),
        }
    }
}

/// Node status offloading
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffloadConfig {
    /// Serialized node maps above this size are offloaded
    #[serde(default = "default_offload_threshold")]
    pub threshold_bytes: usize,

    /// Offload every node map regardless of size
    #[serde(default)]
    pub always_offload: bool,

    #[serde(default = "default_offload_gc_period")]
    pub gc_period_secs: u64,

    /// Namespace swept by offload GC; empty means all
    #[serde(default)]
    pub namespace: String,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: default_offload_threshold(),
            always_offload: false,
            gc_period_secs: default_offload_gc_period(),
            namespace: String::new(),
        }
    }
}

/// Workflow archive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Archived workflows older than this are deleted; 0 keeps them forever
    #[serde(default)]
    pub ttl_secs: u64,

    #[serde(default = "default_archive_gc_period")]
    pub gc_period_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: 0,
            gc_period_secs: default_archive_gc_period(),
        }
    }
}

/// `namespace/name` of a config map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMapRef {
    pub namespace: String,
    pub name: String,
}

impl Default for ConfigMapRef {
    fn default() -> Self {
        Self {
            namespace: "workflows".to_string(),
            name: "workflow-controller-configmap".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_workers() -> usize {
    32
}

fn default_resync_period() -> u64 {
    20 * 60
}

fn default_recent_completion_window() -> u64 {
    10 * 60
}

fn default_max_transient_retries() -> u32 {
    10
}

fn default_notify_delay() -> u64 {
    1000
}

fn default_existence_check_period() -> u64 {
    60
}

fn default_max_stack_depth() -> usize {
    DEFAULT_MAX_STACK_DEPTH
}

fn default_task_poll_interval() -> u64 {
    10
}

fn default_offload_threshold() -> usize {
    DEFAULT_OFFLOAD_THRESHOLD
}

fn default_offload_gc_period() -> u64 {
    5 * 60
}

fn default_archive_gc_period() -> u64 {
    24 * 60 * 60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ControllerConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&ControllerConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("WORKFLOW")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_stack_depth: self.engine.max_stack_depth,
            archive_enabled: self.archive.enabled,
            task_poll_interval: Duration::from_secs(self.engine.task_poll_interval_secs),
        }
    }

    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.dispatch.resync_period_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.dispatch.initial_delay_ms)
    }

    pub fn notify_delay(&self) -> Duration {
        Duration::from_millis(self.sync.notify_delay_ms)
    }

    pub fn recent_completion_window(&self) -> Duration {
        Duration::from_secs(self.dispatch.recent_completion_window_secs)
    }

    /// Logging settings with command-line overrides applied on top
    pub fn effective_logging(&self, level: Option<&str>, json: bool) -> LoggingConfig {
        LoggingConfig {
            level: level.map_or_else(|| self.logging.level.clone(), str::to_string),
            json: json || self.logging.json,
        }
    }

    pub fn archive_ttl(&self) -> Option<Duration> {
        (self.archive.enabled && self.archive.ttl_secs > 0)
            .then(|| Duration::from_secs(self.archive.ttl_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.dispatch.workers, 32);
        assert_eq!(config.resync_period(), Duration::from_secs(1200));
        assert_eq!(config.notify_delay(), Duration::from_secs(1));
        assert_eq!(config.recent_completion_window(), Duration::from_secs(600));
        assert_eq!(config.throttle.limits(), ThrottleLimits::new(0, 0));
    }

    #[test]
    fn test_engine_defaults() {
        let engine = ControllerConfig::default().engine_config();
        assert_eq!(engine.max_stack_depth, 100);
        assert!(!engine.archive_enabled);
    }

    #[test]
    fn test_archive_ttl_requires_archiving() {
        let mut config = ControllerConfig::default();
        config.archive.ttl_secs = 3600;
        assert_eq!(config.archive_ttl(), None);
        config.archive.enabled = true;
        assert_eq!(config.archive_ttl(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_logging_overrides() {
        let mut config = ControllerConfig::default();
        config.logging.level = "debug".to_string();
        config.logging.json = true;

        let logging = config.effective_logging(None, false);
        assert_eq!(logging.level, "debug");
        assert!(logging.json);

        let logging = config.effective_logging(Some("warn"), false);
        assert_eq!(logging.level, "warn");
        assert!(logging.json);

        let logging = ControllerConfig::default().effective_logging(None, true);
        assert_eq!(logging.level, "info");
        assert!(logging.json);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = ControllerConfig::load(None).unwrap();
        assert_eq!(config.offload.threshold_bytes, 1024 * 1024);
        assert_eq!(config.archive.gc_period_secs, 86400);
    }
}
