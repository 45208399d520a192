//! TOML-based configuration for tether.
//!
//! Supports a config file (tether.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [worker]
//! command = "python3"
//! args = ["src/chatbot_persistent.py"]
//! working_dir = "${HOME}/chatbot"
//! ready_sentinel = "READY"
//! restart_backoff = "2s"
//!
//! [worker.env]
//! TOKENIZERS_PARALLELISM = "false"
//!
//! [fallback]
//! enabled = true
//!
//! [requests]
//! timeout = "30s"
//! fallback_timeout = "60s"
//!
//! [shutdown]
//! grace_period = "5s"
//! settle_delay = "500ms"
//!
//! [logging]
//! level = "info"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::worker::CommandSpec;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "TETHER_CONFIG";

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to render config: {0}")]
    RenderError(#[from] toml::ser::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid duration format: {0}")]
    InvalidDuration(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Persistent worker process.
    pub worker: WorkerSettings,

    /// One-shot fallback process.
    pub fallback: FallbackSettings,

    /// Request deadlines.
    pub requests: RequestSettings,

    /// Shutdown timing.
    pub shutdown: ShutdownSettings,

    /// Log filtering.
    pub logging: LoggingSettings,
}

/// Worker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Program to run (supports ${ENV_VAR} expansion).
    pub command: String,

    /// Arguments passed to the program.
    pub args: Vec<String>,

    /// Working directory for the worker.
    pub working_dir: Option<String>,

    /// Stderr substring that also counts as the readiness signal.
    pub ready_sentinel: Option<String>,

    /// Delay before relaunching an exited worker (e.g., "2s").
    pub restart_backoff: String,

    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            args: vec!["chatbot_persistent.py".to_string()],
            working_dir: None,
            ready_sentinel: Some("READY".to_string()),
            restart_backoff: "2s".to_string(),
            env: BTreeMap::new(),
        }
    }
}

impl WorkerSettings {
    pub fn restart_backoff(&self) -> Result<Duration, SettingsError> {
        parse_duration(&self.restart_backoff)
    }

    /// Build the worker command with environment variables expanded.
    pub fn command_spec(&self) -> Result<CommandSpec, SettingsError> {
        build_spec(&self.command, &self.args, self)
    }
}

/// Fallback configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FallbackSettings {
    /// Use the one-shot path when the persistent worker is unavailable.
    pub enabled: bool,

    /// Program to run; defaults to the worker command.
    pub command: Option<String>,

    /// Arguments placed before the payload; default to the worker args.
    pub args: Option<Vec<String>>,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            command: None,
            args: None,
        }
    }
}

impl FallbackSettings {
    /// Build the fallback command, inheriting unset fields from the worker.
    ///
    /// Returns `None` when the fallback is disabled.
    pub fn command_spec(
        &self,
        worker: &WorkerSettings,
    ) -> Result<Option<CommandSpec>, SettingsError> {
        if !self.enabled {
            return Ok(None);
        }
        let command = self.command.as_deref().unwrap_or(&worker.command);
        let args = self.args.as_deref().unwrap_or(&worker.args);
        build_spec(command, args, worker).map(Some)
    }
}

/// Request deadline configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestSettings {
    /// Deadline for the persistent path (e.g., "30s").
    pub timeout: String,

    /// Deadline for a fallback process (e.g., "60s").
    pub fallback_timeout: String,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            timeout: "30s".to_string(),
            fallback_timeout: "60s".to_string(),
        }
    }
}

impl RequestSettings {
    pub fn timeout(&self) -> Result<Duration, SettingsError> {
        parse_duration(&self.timeout)
    }

    pub fn fallback_timeout(&self) -> Result<Duration, SettingsError> {
        parse_duration(&self.fallback_timeout)
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownSettings {
    /// Time the worker gets to exit before it is killed.
    pub grace_period: String,

    /// Pause after teardown so in-flight log output can flush.
    pub settle_delay: String,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            grace_period: "5s".to_string(),
            settle_delay: "500ms".to_string(),
        }
    }
}

impl ShutdownSettings {
    pub fn grace_period(&self) -> Result<Duration, SettingsError> {
        parse_duration(&self.grace_period)
    }

    pub fn settle_delay(&self) -> Result<Duration, SettingsError> {
        parse_duration(&self.settle_delay)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate settings from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `TETHER_CONFIG`
    /// 2. `./tether.toml`
    /// 3. `~/.config/tether/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var(CONFIG_ENV_VAR) {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("tether.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("tether").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    /// Check values that deserialize fine but cannot be used.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.worker.command.trim().is_empty() {
            return Err(SettingsError::InvalidConfig(
                "worker.command must not be empty".to_string(),
            ));
        }
        if let Some(command) = &self.fallback.command {
            if command.trim().is_empty() {
                return Err(SettingsError::InvalidConfig(
                    "fallback.command must not be empty".to_string(),
                ));
            }
        }
        self.worker.restart_backoff()?;
        self.requests.timeout()?;
        self.requests.fallback_timeout()?;
        self.shutdown.grace_period()?;
        self.shutdown.settle_delay()?;
        Ok(())
    }

    /// Render the settings back to TOML.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn build_spec(
    command: &str,
    args: &[String],
    worker: &WorkerSettings,
) -> Result<CommandSpec, SettingsError> {
    let mut spec = CommandSpec::new(expand_env_vars(command)?);
    for arg in args {
        spec.args.push(expand_env_vars(arg)?);
    }
    for (key, value) in &worker.env {
        spec.env.insert(key.clone(), expand_env_vars(value)?);
    }
    if let Some(dir) = &worker.working_dir {
        spec.working_dir = Some(PathBuf::from(expand_env_vars(dir)?));
    }
    Ok(spec)
}

/// Parse a duration such as `"500ms"`, `"30s"`, `"5m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, SettingsError> {
    let s = s.trim();
    let invalid = || SettingsError::InvalidDuration(s.to_string());

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(value.saturating_mul(3600))),
        _ => Err(invalid()),
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.next_if_eq(&'{').is_some() {
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
        } else {
            while let Some(ch) = chars.next_if(|ch| ch.is_alphanumeric() || *ch == '_') {
                var_name.push(ch);
            }
            if var_name.is_empty() {
                // Lone `$`.
                result.push('$');
                continue;
            }
        }

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
