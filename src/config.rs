//! Pipeline configuration with `TRAFFIC_*` environment overrides.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::features::{FeatureConfig, RollingWindow, FEATURE_SCHEMA_VERSION};
use crate::labels::LabelConfig;
use crate::source::RetryPolicy;
use crate::split::{SplitConfig, SplitCutoff};

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub sample_interval_minutes: u32,
    pub cycle_interval_minutes: u32,
    pub lag_steps: Vec<u32>,
    pub rolling_windows: Vec<RollingWindow>,
    pub schema_version: u32,
    pub horizons_minutes: Vec<u32>,
    pub label_tolerance_minutes: u32,
    pub split_gap_minutes: u32,
    pub validation_fraction: f64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub fetch_timeout_ms: u64,
    pub points_path: PathBuf,
    pub store_path: PathBuf,
    pub predictions_path: PathBuf,
    pub training_dir: PathBuf,
    pub model_path: Option<PathBuf>,
    pub source_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let features = FeatureConfig::default();
        let labels = LabelConfig::default();
        Self {
            sample_interval_minutes: features.sample_interval_minutes,
            cycle_interval_minutes: 30,
            lag_steps: features.lag_steps,
            rolling_windows: features.rolling_windows,
            schema_version: FEATURE_SCHEMA_VERSION,
            horizons_minutes: labels.horizons_minutes,
            label_tolerance_minutes: labels.tolerance_minutes,
            split_gap_minutes: 60,
            validation_fraction: 0.2,
            max_retries: 3,
            retry_backoff_ms: 200,
            fetch_timeout_ms: 10_000,
            points_path: PathBuf::from("data/points.csv"),
            store_path: PathBuf::from("data/feature_store.sqlite"),
            predictions_path: PathBuf::from("data/predictions.csv"),
            training_dir: PathBuf::from("data/training"),
            model_path: None,
            source_url: None,
        }
    }
}

impl PipelineConfig {
    pub fn feature_config(&self) -> FeatureConfig {
        FeatureConfig {
            sample_interval_minutes: self.sample_interval_minutes,
            lag_steps: self.lag_steps.clone(),
            rolling_windows: self.rolling_windows.clone(),
            schema_version: self.schema_version,
        }
    }

    pub fn label_config(&self) -> LabelConfig {
        LabelConfig {
            horizons_minutes: self.horizons_minutes.clone(),
            tolerance_minutes: self.label_tolerance_minutes,
        }
    }

    pub fn split_config(&self) -> SplitConfig {
        SplitConfig {
            cutoff: SplitCutoff::ValidationFraction(self.validation_fraction),
            gap_minutes: self.split_gap_minutes,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_backoff_ms: self.retry_backoff_ms,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Malformed { var: &'static str, value: String },
    #[error("{var}: {message}")]
    Invalid { var: &'static str, message: String },
}

pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    let mut cfg = PipelineConfig::default();

    if let Some(v) = parse_var("TRAFFIC_SAMPLE_INTERVAL_MINUTES")? {
        cfg.sample_interval_minutes = positive("TRAFFIC_SAMPLE_INTERVAL_MINUTES", v)?;
    }
    if let Some(v) = parse_var("TRAFFIC_CYCLE_INTERVAL_MINUTES")? {
        cfg.cycle_interval_minutes = positive("TRAFFIC_CYCLE_INTERVAL_MINUTES", v)?;
    }
    if let Some(v) = parse_list_var("TRAFFIC_LAG_STEPS")? {
        cfg.lag_steps = v;
    }
    if let Some(v) = parse_var("TRAFFIC_SCHEMA_VERSION")? {
        cfg.schema_version = v;
    }
    if let Some(v) = parse_list_var("TRAFFIC_HORIZONS_MINUTES")? {
        if v.is_empty() {
            return Err(ConfigError::Invalid {
                var: "TRAFFIC_HORIZONS_MINUTES",
                message: "at least one horizon is required".to_string(),
            });
        }
        cfg.horizons_minutes = v;
    }
    if let Some(v) = parse_var("TRAFFIC_LABEL_TOLERANCE_MINUTES")? {
        cfg.label_tolerance_minutes = v;
    }
    if let Some(v) = parse_var("TRAFFIC_SPLIT_GAP_MINUTES")? {
        cfg.split_gap_minutes = v;
    }
    if let Some(v) = parse_var::<f64>("TRAFFIC_VALIDATION_FRACTION")? {
        if !(v > 0.0 && v < 1.0) {
            return Err(ConfigError::Invalid {
                var: "TRAFFIC_VALIDATION_FRACTION",
                message: format!("must be in (0, 1), got {v}"),
            });
        }
        cfg.validation_fraction = v;
    }
    if let Some(v) = parse_var("TRAFFIC_MAX_RETRIES")? {
        cfg.max_retries = v;
    }
    if let Some(v) = parse_var("TRAFFIC_RETRY_BACKOFF_MS")? {
        cfg.retry_backoff_ms = v;
    }
    if let Some(v) = parse_var("TRAFFIC_FETCH_TIMEOUT_MS")? {
        cfg.fetch_timeout_ms = v;
    }
    if let Some(v) = string_var("TRAFFIC_POINTS_PATH") {
        cfg.points_path = PathBuf::from(v);
    }
    if let Some(v) = string_var("TRAFFIC_STORE_PATH") {
        cfg.store_path = PathBuf::from(v);
    }
    if let Some(v) = string_var("TRAFFIC_PREDICTIONS_PATH") {
        cfg.predictions_path = PathBuf::from(v);
    }
    if let Some(v) = string_var("TRAFFIC_TRAINING_DIR") {
        cfg.training_dir = PathBuf::from(v);
    }
    if let Some(v) = string_var("TRAFFIC_MODEL_PATH") {
        cfg.model_path = Some(PathBuf::from(v));
    }
    if let Some(v) = string_var("TRAFFIC_SOURCE_URL") {
        cfg.source_url = Some(v);
    }

    Ok(cfg)
}

fn string_var(var: &'static str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_var<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match string_var(var) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Malformed { var, value: raw }),
        None => Ok(None),
    }
}

fn parse_list_var(var: &'static str) -> Result<Option<Vec<u32>>, ConfigError> {
    let Some(raw) = string_var(var) else {
        return Ok(None);
    };
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse().map_err(|_| ConfigError::Malformed {
                var,
                value: raw.clone(),
            })
        })
        .collect::<Result<Vec<u32>, _>>()
        .map(Some)
}

fn positive(var: &'static str, value: u32) -> Result<u32, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            message: "must be > 0".to_string(),
        });
    }
    Ok(value)
}
