//! Pipeline configuration, passed explicitly to every stage.

use std::env;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::{FeatureOptions, RecencySentinel};
use crate::window::{parse_window_list, WindowError, WindowKind, ALL_WINDOWS};

pub const ENV_DATA_DIR: &str = "PROPENSITY_DATA_DIR";
pub const ENV_STORE_PATH: &str = "PROPENSITY_STORE_PATH";
pub const ENV_FEATURE_TABLE: &str = "PROPENSITY_FEATURE_TABLE";
pub const ENV_DAY_ZERO: &str = "PROPENSITY_DAY_ZERO";
pub const ENV_ANCHOR_DAYS: &str = "PROPENSITY_ANCHOR_DAYS";
pub const ENV_WINDOWS: &str = "PROPENSITY_WINDOWS";
pub const ENV_RECENCY: &str = "PROPENSITY_RECENCY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory holding `transaction_data.csv` and `product.csv`.
    pub data_dir: PathBuf,
    pub store_path: PathBuf,
    pub feature_table: String,
    /// Date assigned to day number 1 of the raw data.
    pub day_zero: NaiveDate,
    /// Number of trailing dataset days to build feature sets for.
    pub anchor_day_count: u32,
    pub windows: Vec<WindowKind>,
    pub feature_options: FeatureOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/propensity/bronze"),
            store_path: PathBuf::from("data/propensity/propensity.sqlite"),
            feature_table: "propensity_features".to_string(),
            day_zero: NaiveDate::from_ymd_opt(2018, 1, 1).expect("valid default day zero"),
            anchor_day_count: 30,
            windows: ALL_WINDOWS.to_vec(),
            feature_options: FeatureOptions::default(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: {source}")]
    Window {
        var: &'static str,
        #[source]
        source: WindowError,
    },
    #[error("{var} must be a YYYY-MM-DD date, got '{value}'")]
    InvalidDate { var: &'static str, value: String },
    #[error("{var} must be a positive integer, got '{value}'")]
    InvalidCount { var: &'static str, value: String },
    #[error("{var} must be 'window_span' or 'never_observed', got '{value}'")]
    InvalidRecency { var: &'static str, value: String },
    #[error("{0} must name at least one window")]
    NoWindows(&'static str),
}

/// Builds a config from `PROPENSITY_*` variables; unset or blank variables keep defaults.
pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    let mut config = PipelineConfig::default();

    if let Some(raw) = env_value(ENV_DATA_DIR) {
        config.data_dir = PathBuf::from(raw);
    }

    if let Some(raw) = env_value(ENV_STORE_PATH) {
        config.store_path = PathBuf::from(raw);
    }

    if let Some(raw) = env_value(ENV_FEATURE_TABLE) {
        config.feature_table = raw;
    }

    if let Some(raw) = env_value(ENV_DAY_ZERO) {
        config.day_zero = NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|_| {
            ConfigError::InvalidDate {
                var: ENV_DAY_ZERO,
                value: raw.clone(),
            }
        })?;
    }

    if let Some(raw) = env_value(ENV_ANCHOR_DAYS) {
        config.anchor_day_count = match raw.parse::<u32>() {
            Ok(count) if count > 0 => count,
            _ => {
                return Err(ConfigError::InvalidCount {
                    var: ENV_ANCHOR_DAYS,
                    value: raw,
                })
            }
        };
    }

    if let Some(raw) = env_value(ENV_WINDOWS) {
        let windows = parse_window_list(&raw).map_err(|source| ConfigError::Window {
            var: ENV_WINDOWS,
            source,
        })?;
        if windows.is_empty() {
            return Err(ConfigError::NoWindows(ENV_WINDOWS));
        }
        config.windows = windows;
    }

    if let Some(raw) = env_value(ENV_RECENCY) {
        config.feature_options.recency =
            parse_recency(&raw).ok_or(ConfigError::InvalidRecency {
                var: ENV_RECENCY,
                value: raw.clone(),
            })?;
    }

    Ok(config)
}

pub(crate) fn env_value(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_recency(raw: &str) -> Option<RecencySentinel> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "window_span" => Some(RecencySentinel::WindowSpan),
        "never_observed" => Some(RecencySentinel::NeverObserved),
        _ => None,
    }
}
