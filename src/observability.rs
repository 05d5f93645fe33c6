//! Logging setup for the binaries and the structured events shared by the
//! inference cycle.

use std::env;

use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::orchestrator::CyclePhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
    pub include_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
            include_thread_ids: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Some(level) = env_value("TRAFFIC_LOG_LEVEL") {
        config.level = level;
    }
    if let Some(format) = env_value("TRAFFIC_LOG_FORMAT").and_then(|raw| parse_log_format(&raw)) {
        config.format = format;
    }
    if let Some(flag) = env_value("TRAFFIC_LOG_TARGET").and_then(|raw| parse_bool(&raw)) {
        config.include_target = flag;
    }
    if let Some(flag) = env_value("TRAFFIC_LOG_THREAD_IDS").and_then(|raw| parse_bool(&raw)) {
        config.include_thread_ids = flag;
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_thread_ids(config.include_thread_ids)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(component: &'static str, config: &LoggingConfig) {
    info!(
        component,
        event = "app.start",
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target,
        include_thread_ids = config.include_thread_ids
    );
}

pub fn log_cycle_phase(phase: CyclePhase, cycle_ts_ms_utc: i64) {
    info!(
        component = "orchestrator",
        event = "cycle.phase",
        phase = phase.as_str(),
        cycle_ts_ms_utc
    );
}

pub fn log_cycle_deferred(trigger_ts_ms_utc: i64, running_phase: CyclePhase) {
    info!(
        component = "orchestrator",
        event = "cycle.deferred",
        trigger_ts_ms_utc,
        running_phase = running_phase.as_str()
    );
}

pub fn log_entity_failed(entity_id: &str, phase: CyclePhase, reason: &str) {
    warn!(
        component = "orchestrator",
        event = "cycle.entity.failed",
        entity_id,
        phase = phase.as_str(),
        reason
    );
}

fn env_value(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
