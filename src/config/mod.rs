//! Configuration module for tether.
//!
//! Handles the settings file, environment variable expansion and durations.

mod settings;

pub use settings::{
    expand_env_vars, parse_duration, FallbackSettings, LoggingSettings, RequestSettings,
    Settings, SettingsError, ShutdownSettings, WorkerSettings, CONFIG_ENV_VAR,
};
