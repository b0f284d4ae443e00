//! Configuration loader and validator for the relationship engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Environment variable that overrides `security.cron_secret`.
pub const CRON_SECRET_ENV: &str = "RELATIONSHIP_CRON_SECRET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub security: Security,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Offset of the tenant-local calendar from UTC.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Base URL used to build links placed in messages.
    #[serde(default)]
    pub app_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineSettings {
    pub max_parallel_strategies: usize,
    pub max_tasks_per_subject_per_day: u32,
    pub template_cache_ttl_seconds: u64,
    pub lock_timeout_seconds: i64,
    /// Local hour at which generated tasks are scheduled.
    pub send_hour: u32,
    pub default_channel: String,
    pub max_page_size: u32,
    /// How long after a status change it may still be undone.
    pub undo_window_seconds: i64,
    pub horizons: Horizons,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_parallel_strategies: 5,
            max_tasks_per_subject_per_day: 3,
            template_cache_ttl_seconds: 300,
            lock_timeout_seconds: 300,
            send_hour: 9,
            default_channel: "whatsapp".into(),
            max_page_size: 100,
            undo_window_seconds: 5,
            horizons: Horizons::default(),
        }
    }
}

/// Look-ahead windows (days) of the anchors that select upcoming dates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Horizons {
    pub first_workout_days: i64,
    pub birthday_days: i64,
    pub renewal_days: i64,
}

impl Default for Horizons {
    fn default() -> Self {
        Self {
            first_workout_days: 7,
            birthday_days: 7,
            renewal_days: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Security {
    pub cron_secret: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/relationship.db", self.app.data_dir))
    }

    /// The privileged-trigger secret, preferring the environment override.
    pub fn cron_secret(&self) -> String {
        match std::env::var(CRON_SECRET_ENV) {
            Ok(secret) if !secret.trim().is_empty() => secret,
            _ => self.security.cron_secret.clone(),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.utc_offset_minutes.abs() > 14 * 60 {
        return Err(ConfigError::Invalid("app.utc_offset_minutes must be within ±840"));
    }

    let engine = &cfg.engine;
    if engine.max_parallel_strategies == 0 {
        return Err(ConfigError::Invalid("engine.max_parallel_strategies must be > 0"));
    }
    if engine.max_tasks_per_subject_per_day == 0 {
        return Err(ConfigError::Invalid("engine.max_tasks_per_subject_per_day must be > 0"));
    }
    if engine.lock_timeout_seconds <= 0 {
        return Err(ConfigError::Invalid("engine.lock_timeout_seconds must be > 0"));
    }
    if engine.send_hour > 23 {
        return Err(ConfigError::Invalid("engine.send_hour must be between 0 and 23"));
    }
    if engine.default_channel.trim().is_empty() {
        return Err(ConfigError::Invalid("engine.default_channel must be non-empty"));
    }
    if engine.max_page_size == 0 {
        return Err(ConfigError::Invalid("engine.max_page_size must be > 0"));
    }
    if engine.undo_window_seconds < 0 {
        return Err(ConfigError::Invalid("engine.undo_window_seconds must not be negative"));
    }
    let h = &engine.horizons;
    if h.first_workout_days < 0 || h.birthday_days < 0 || h.renewal_days < 0 {
        return Err(ConfigError::Invalid("engine.horizons must not be negative"));
    }

    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  utc_offset_minutes: -180
  app_url: "https://app.example.com"

engine:
  max_parallel_strategies: 5
  max_tasks_per_subject_per_day: 3
  template_cache_ttl_seconds: 300
  lock_timeout_seconds: 300
  send_hour: 9
  default_channel: "whatsapp"
  max_page_size: 100
  undo_window_seconds: 5
  horizons:
    first_workout_days: 7
    birthday_days: 7
    renewal_days: 30

security:
  cron_secret: "CHANGE_ME"
"#
}
