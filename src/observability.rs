//! Logging setup shared by the binaries.
//!
//! Invalid `PROPENSITY_LOG_*` values are rejected the same way pipeline
//! variables are, instead of silently falling back to defaults.

use thiserror::Error;
use tracing::info;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

use crate::config::{env_value, PipelineConfig};

pub const ENV_LOG_LEVEL: &str = "PROPENSITY_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "PROPENSITY_LOG_FORMAT";
pub const ENV_LOG_TARGET: &str = "PROPENSITY_LOG_TARGET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, e.g. `info` or `propensity=debug`.
    pub filter: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
    #[error("PROPENSITY_LOG_LEVEL filter '{filter}' is invalid: {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: ParseError,
    },
    #[error("PROPENSITY_LOG_FORMAT must be 'json' or 'pretty', got '{0}'")]
    InvalidFormat(String),
    #[error("PROPENSITY_LOG_TARGET must be a boolean, got '{0}'")]
    InvalidTarget(String),
}

pub fn logging_config_from_env() -> Result<LoggingConfig, LoggingInitError> {
    let mut config = LoggingConfig::default();

    if let Some(filter) = env_value(ENV_LOG_LEVEL) {
        config.filter = filter;
    }

    if let Some(raw) = env_value(ENV_LOG_FORMAT) {
        config.format = parse_log_format(&raw).ok_or(LoggingInitError::InvalidFormat(raw))?;
    }

    if let Some(raw) = env_value(ENV_LOG_TARGET) {
        config.include_target = parse_bool(&raw).ok_or(LoggingInitError::InvalidTarget(raw))?;
    }

    Ok(config)
}

pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingInitError> {
    EnvFilter::try_new(&config.filter).map_err(|source| LoggingInitError::InvalidFilter {
        filter: config.filter.clone(),
        source,
    })
}

/// Installs the global subscriber. Fails before installing anything if the filter is invalid.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config)?)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(app: &str, config: &LoggingConfig) {
    info!(
        component = app,
        event = "app.start",
        version = env!("CARGO_PKG_VERSION"),
        log_filter = %config.filter,
        log_format = config.format.as_str(),
        include_target = config.include_target
    );
}

pub fn log_pipeline_config(app: &str, config: &PipelineConfig) {
    let windows: Vec<&str> = config.windows.iter().map(|w| w.token()).collect();
    info!(
        component = app,
        event = "app.config",
        data_dir = %config.data_dir.display(),
        store_path = %config.store_path.display(),
        feature_table = %config.feature_table,
        day_zero = %config.day_zero,
        anchor_day_count = config.anchor_day_count,
        windows = ?windows,
        recency = ?config.feature_options.recency
    );
}

pub fn log_app_finish(app: &str, elapsed_ms: u128) {
    info!(
        component = app,
        event = "app.finish",
        elapsed_ms = elapsed_ms as u64
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
