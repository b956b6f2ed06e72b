use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "WATCHTOWER_CONFIG";

/// Top-level configuration loaded from `~/.watchtower/config.toml`.
///
/// Every section falls back to its defaults, so a partial file (or no file
/// at all) yields a usable configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load config from `$WATCHTOWER_CONFIG` if set, else from
    /// `~/.watchtower/config.toml`, falling back to defaults when the file
    /// does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        if let Some(explicit) = std::env::var_os(CONFIG_ENV) {
            return Self::load_from(PathBuf::from(explicit));
        }
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.scheduler.validate()?;
        self.execution.validate()?;
        self.health.validate()?;
        self.retention.validate()?;
        self.sources.validate()?;
        Ok(())
    }

    /// Expand a leading `~/` in the store path against the home directory.
    pub fn resolved_store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".watchtower")
            .join("config.toml")
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

fn require_positive(key: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Validation(format!("{key} must be greater than 0")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl GeneralConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.log_format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "general.log_format must be `pretty` or `json`, got `{other}`"
            ))),
        }
    }

    pub fn json_logs(&self) -> bool {
        self.log_format == "json"
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "~/.watchtower/watchtower.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Process-wide cap on simultaneously running executions.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_concurrent_executions: default_max_concurrent(),
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("scheduler.poll_interval_secs", self.poll_interval_secs)?;
        require_positive(
            "scheduler.max_concurrent_executions",
            u64::from(self.max_concurrent_executions),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_poll_interval() -> u64 {
    60
}
fn default_max_concurrent() -> u32 {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Deadline for in-process executions.
    #[serde(default = "default_execution_timeout")]
    pub timeout_secs: u64,
    /// How long a cancelled in-process executor may take to wind down.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: u64,
    /// When false, agents asking for isolation run in-process instead.
    #[serde(default = "default_true")]
    pub isolation_enabled: bool,
    #[serde(default = "default_isolation_timeout")]
    pub isolation_timeout_secs: u64,
    #[serde(default = "default_isolation_poll")]
    pub isolation_poll_interval_ms: u64,
    /// Path or name (resolved via `PATH`) of the isolated worker binary.
    #[serde(default = "default_worker_binary")]
    pub worker_binary: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_execution_timeout(),
            cancel_grace_secs: default_cancel_grace(),
            isolation_enabled: true,
            isolation_timeout_secs: default_isolation_timeout(),
            isolation_poll_interval_ms: default_isolation_poll(),
            worker_binary: default_worker_binary(),
        }
    }
}

impl ExecutionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("execution.timeout_secs", self.timeout_secs)?;
        require_positive("execution.isolation_timeout_secs", self.isolation_timeout_secs)?;
        require_positive(
            "execution.isolation_poll_interval_ms",
            self.isolation_poll_interval_ms,
        )?;
        if self.worker_binary.trim().is_empty() {
            return Err(ConfigError::Validation(
                "execution.worker_binary must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn isolation_timeout(&self) -> Duration {
        Duration::from_secs(self.isolation_timeout_secs)
    }

    pub fn isolation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.isolation_poll_interval_ms)
    }
}

fn default_execution_timeout() -> u64 {
    300
}
fn default_cancel_grace() -> u64 {
    5
}
fn default_isolation_timeout() -> u64 {
    600
}
fn default_isolation_poll() -> u64 {
    500
}
fn default_worker_binary() -> String {
    "watchtower-worker".into()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval")]
    pub check_interval_secs: u64,
    /// Trailing window of executions considered for success rate.
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: f64,
    #[serde(default = "default_max_error_count")]
    pub max_error_count: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_health_interval(),
            window_days: default_window_days(),
            success_threshold: default_success_threshold(),
            max_error_count: default_max_error_count(),
        }
    }
}

impl HealthConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("health.check_interval_secs", self.check_interval_secs)?;
        require_positive("health.window_days", u64::from(self.window_days))?;
        require_positive("health.max_error_count", u64::from(self.max_error_count))?;
        if !(0.0..=1.0).contains(&self.success_threshold) {
            return Err(ConfigError::Validation(format!(
                "health.success_threshold must be within 0.0..=1.0, got {}",
                self.success_threshold
            )));
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.window_days))
    }
}

fn default_health_interval() -> u64 {
    300
}
fn default_window_days() -> u32 {
    7
}
fn default_success_threshold() -> f64 {
    0.8
}
fn default_max_error_count() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
    #[serde(default = "default_max_results_per_agent")]
    pub max_results_per_agent: u32,
    #[serde(default = "default_compaction_interval")]
    pub compaction_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            max_results_per_agent: default_max_results_per_agent(),
            compaction_interval_secs: default_compaction_interval(),
        }
    }
}

impl RetentionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("retention.max_age_days", u64::from(self.max_age_days))?;
        require_positive(
            "retention.max_results_per_agent",
            u64::from(self.max_results_per_agent),
        )?;
        require_positive(
            "retention.compaction_interval_secs",
            self.compaction_interval_secs,
        )
    }

    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.max_age_days))
    }

    pub fn compaction_interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_secs)
    }
}

fn default_max_age_days() -> u32 {
    30
}
fn default_max_results_per_agent() -> u32 {
    1000
}
fn default_compaction_interval() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Consecutive failures before a source's breaker opens.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_failure_threshold: u32,
    /// How long an open breaker refuses calls before probing again.
    #[serde(default = "default_breaker_reset")]
    pub breaker_reset_secs: u64,
    /// Upper bound for a single source fetch.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            breaker_failure_threshold: default_breaker_threshold(),
            breaker_reset_secs: default_breaker_reset(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

impl SourcesConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_positive(
            "sources.breaker_failure_threshold",
            u64::from(self.breaker_failure_threshold),
        )?;
        require_positive("sources.fetch_timeout_secs", self.fetch_timeout_secs)
    }

    pub fn breaker_reset(&self) -> Duration {
        Duration::from_secs(self.breaker_reset_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_reset() -> u64 {
    300
}
fn default_fetch_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl DaemonConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8420
}
