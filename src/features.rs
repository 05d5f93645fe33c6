//! Shared observation-window-to-features transform.
//!
//! `FeatureEngine::compute` is the only feature definition in the crate. The
//! backfill and runtime entry points both delegate to it, so a row computed
//! offline and the same row recomputed online serialize to identical bytes.

use std::collections::{BTreeMap, HashSet};
use std::f64::consts::PI;

use chrono::{Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::normalize::{DisruptionEvent, EntityRegistry, Observation, RawMetrics};

const WEEK_SECONDS: f64 = 7.0 * 24.0 * 60.0 * 60.0;
const MINUTE_MS: i64 = 60_000;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const DYNAMIC_FEATURE_GROUP: &str = "traffic_dynamic";
pub const STATIC_FEATURE_GROUP: &str = "point_static";

pub const CONGESTION_INDEX: &str = "congestion_index";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    F64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub group: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn group_names(&self) -> Vec<String> {
        let mut groups: Vec<String> = Vec::new();
        for column in &self.columns {
            if !groups.contains(&column.group) {
                groups.push(column.group.clone());
            }
        }
        groups
    }

    pub fn columns_in_group<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a FeatureColumn> {
        self.columns.iter().filter(move |column| column.group == group)
    }
}

// `None` marks an absent value and is never replaced by a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub entity_id: String,
    pub ts_ms_utc: i64,
    pub schema_version: u32,
    pub values: BTreeMap<String, Option<f64>>,
}

impl FeatureRow {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied().flatten()
    }

    pub fn absent_features(&self) -> Vec<&str> {
        self.values
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.entity_id.as_bytes());
        out.push(0);
        out.extend_from_slice(&self.ts_ms_utc.to_be_bytes());
        out.extend_from_slice(&self.schema_version.to_be_bytes());
        for (name, value) in &self.values {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            match value {
                Some(v) => {
                    out.push(1);
                    out.extend_from_slice(&v.to_bits().to_be_bytes());
                }
                None => out.push(0),
            }
        }
        out
    }

    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_bytes()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingWindow {
    pub minutes: u32,
    pub min_samples: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub sample_interval_minutes: u32,
    pub lag_steps: Vec<u32>,
    pub rolling_windows: Vec<RollingWindow>,
    pub schema_version: u32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            sample_interval_minutes: 1,
            lag_steps: vec![1, 2, 3],
            rolling_windows: vec![
                RollingWindow {
                    minutes: 15,
                    min_samples: 10,
                },
                RollingWindow {
                    minutes: 60,
                    min_samples: 40,
                },
            ],
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

impl FeatureConfig {
    pub fn sample_interval_ms(&self) -> i64 {
        i64::from(self.sample_interval_minutes) * MINUTE_MS
    }

    pub fn lookback_ms(&self) -> i64 {
        let max_lag = self.lag_steps.iter().copied().max().unwrap_or(0);
        let lag_ms = i64::from(max_lag) * self.sample_interval_ms();
        let rolling_ms = self
            .rolling_windows
            .iter()
            .map(|w| i64::from(w.minutes) * MINUTE_MS)
            .max()
            .unwrap_or(0);
        lag_ms.max(rolling_ms)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FeatureError {
    #[error("invalid feature config: {0}")]
    InvalidConfig(String),
    #[error("unknown entity_id: {0}")]
    UnknownEntity(String),
    #[error("timestamp {ts_ms_utc} is not aligned to {interval_ms}ms")]
    UnalignedTimestamp { ts_ms_utc: i64, interval_ms: i64 },
    #[error("invalid UTC timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("window observation for {found} passed to computation for {expected}")]
    ForeignObservation { expected: String, found: String },
}

#[derive(Debug, Clone, Copy)]
pub struct FeatureWindow<'a> {
    pub entity_id: &'a str,
    pub as_of_ts_ms_utc: i64,
    pub observations: &'a [Observation],
    pub disruptions: &'a [DisruptionEvent],
}

#[derive(Debug, Clone)]
pub struct FeatureEngine {
    cfg: FeatureConfig,
    schema: FeatureSchema,
}

impl FeatureEngine {
    pub fn new(cfg: FeatureConfig) -> Result<Self, FeatureError> {
        validate_config(&cfg)?;
        let schema = build_feature_schema(&cfg);
        Ok(Self { cfg, schema })
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.cfg
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn compute(
        &self,
        registry: &EntityRegistry,
        window: &FeatureWindow<'_>,
    ) -> Result<FeatureRow, FeatureError> {
        let entity_id = window.entity_id;
        if !registry.contains(entity_id) {
            return Err(FeatureError::UnknownEntity(entity_id.to_string()));
        }
        let interval_ms = self.cfg.sample_interval_ms();
        let t = window.as_of_ts_ms_utc;
        if t.rem_euclid(interval_ms) != 0 {
            return Err(FeatureError::UnalignedTimestamp {
                ts_ms_utc: t,
                interval_ms,
            });
        }

        let snapshots = merge_snapshots(entity_id, t, window.observations)?;
        let metrics_at = |ts: i64| snapshots.get(&ts);
        let congestion_at = |ts: i64| metrics_at(ts).and_then(congestion_index);

        let mut values = BTreeMap::new();
        let current = metrics_at(t);
        values.insert(
            "speed_ratio".to_string(),
            current.and_then(speed_ratio),
        );
        let current_congestion = congestion_at(t);
        values.insert(CONGESTION_INDEX.to_string(), current_congestion);
        values.insert(
            "delay_seconds".to_string(),
            current.and_then(delay_seconds),
        );
        values.insert(
            "confidence".to_string(),
            current.and_then(|m| m.confidence),
        );
        values.insert(
            "temperature_c".to_string(),
            current.and_then(|m| m.temperature_c),
        );
        values.insert(
            "precipitation_mm".to_string(),
            current.and_then(|m| m.precipitation_mm),
        );

        let mut lag_1 = None;
        for k in &self.cfg.lag_steps {
            let lagged = congestion_at(t - i64::from(*k) * interval_ms);
            if *k == 1 {
                lag_1 = lagged;
            }
            values.insert(format!("{CONGESTION_INDEX}_lag_{k}"), lagged);
        }
        let delta = match (current_congestion, lag_1) {
            (Some(now), Some(prev)) => Some(now - prev),
            _ => None,
        };
        values.insert(format!("{CONGESTION_INDEX}_delta_1"), delta);

        for window_cfg in &self.cfg.rolling_windows {
            let start_exclusive = t - i64::from(window_cfg.minutes) * MINUTE_MS;
            let samples: Vec<f64> = snapshots
                .range((start_exclusive + 1)..=t)
                .filter_map(|(_, metrics)| congestion_index(metrics))
                .collect();
            let (mean, std) = rolling_mean_std(&samples, window_cfg.min_samples as usize);
            values.insert(
                format!("{CONGESTION_INDEX}_roll_mean_{}m", window_cfg.minutes),
                mean,
            );
            values.insert(
                format!("{CONGESTION_INDEX}_roll_std_{}m", window_cfg.minutes),
                std,
            );
        }

        let road_id = registry.road_of(entity_id);
        let active_severity = window
            .disruptions
            .iter()
            .filter(|event| event.applies_to(entity_id, road_id) && event.contains(t))
            .map(|event| event.severity)
            .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.max(s))));
        values.insert(
            "disruption_active".to_string(),
            Some(if active_severity.is_some() { 1.0 } else { 0.0 }),
        );
        values.insert(
            "disruption_severity".to_string(),
            Some(active_severity.unwrap_or(0.0)),
        );

        let calendar = calendar_features(t)?;
        values.insert("hour_of_day".to_string(), Some(calendar.hour_of_day));
        values.insert("day_of_week".to_string(), Some(calendar.day_of_week));
        values.insert("is_weekend".to_string(), Some(calendar.is_weekend));
        values.insert("tow_sin".to_string(), Some(calendar.tow_sin));
        values.insert("tow_cos".to_string(), Some(calendar.tow_cos));

        debug!(
            component = "features",
            event = "features.row.computed",
            entity_id = entity_id,
            ts_ms_utc = t,
            absent = values.values().filter(|v| v.is_none()).count()
        );

        Ok(FeatureRow {
            entity_id: entity_id.to_string(),
            ts_ms_utc: t,
            schema_version: self.schema.version,
            values,
        })
    }

    pub fn compute_static(
        &self,
        registry: &EntityRegistry,
        entity_id: &str,
    ) -> Result<FeatureRow, FeatureError> {
        let point = registry
            .point(entity_id)
            .ok_or_else(|| FeatureError::UnknownEntity(entity_id.to_string()))?;
        let mut values = BTreeMap::new();
        values.insert("latitude".to_string(), Some(point.latitude).filter(|v| v.is_finite()));
        values.insert("longitude".to_string(), Some(point.longitude).filter(|v| v.is_finite()));
        Ok(FeatureRow {
            entity_id: entity_id.to_string(),
            ts_ms_utc: 0,
            schema_version: self.schema.version,
            values,
        })
    }

    pub fn compute_for_backfill(
        &self,
        registry: &EntityRegistry,
        entity_id: &str,
        history: &[Observation],
        disruptions: &[DisruptionEvent],
        start_ts_ms_utc: i64,
        end_ts_ms_utc_exclusive: i64,
    ) -> Result<Vec<FeatureRow>, FeatureError> {
        let mut sorted: Vec<&Observation> = history.iter().collect();
        sorted.sort_by(|a, b| {
            a.ts_ms_utc
                .cmp(&b.ts_ms_utc)
                .then_with(|| a.source_tag.cmp(&b.source_tag))
        });
        let owned: Vec<Observation> = sorted.into_iter().cloned().collect();

        let mut timestamps: Vec<i64> = owned
            .iter()
            .map(|obs| obs.ts_ms_utc)
            .filter(|ts| *ts >= start_ts_ms_utc && *ts < end_ts_ms_utc_exclusive)
            .collect();
        timestamps.dedup();

        let mut rows = Vec::with_capacity(timestamps.len());
        for t in timestamps {
            let visible = owned.partition_point(|obs| obs.ts_ms_utc <= t);
            let window = FeatureWindow {
                entity_id,
                as_of_ts_ms_utc: t,
                observations: &owned[..visible],
                disruptions,
            };
            rows.push(self.compute(registry, &window)?);
        }

        info!(
            component = "features",
            event = "features.backfill.entity",
            entity_id = entity_id,
            rows = rows.len()
        );
        Ok(rows)
    }

    pub fn compute_for_runtime(
        &self,
        registry: &EntityRegistry,
        window: &FeatureWindow<'_>,
    ) -> Result<FeatureRow, FeatureError> {
        self.compute(registry, window)
    }
}

pub fn build_feature_schema(cfg: &FeatureConfig) -> FeatureSchema {
    let mut names: Vec<String> = vec![
        "speed_ratio".to_string(),
        CONGESTION_INDEX.to_string(),
        "delay_seconds".to_string(),
        "confidence".to_string(),
        "temperature_c".to_string(),
        "precipitation_mm".to_string(),
    ];
    for k in &cfg.lag_steps {
        names.push(format!("{CONGESTION_INDEX}_lag_{k}"));
    }
    names.push(format!("{CONGESTION_INDEX}_delta_1"));
    for window in &cfg.rolling_windows {
        names.push(format!("{CONGESTION_INDEX}_roll_mean_{}m", window.minutes));
        names.push(format!("{CONGESTION_INDEX}_roll_std_{}m", window.minutes));
    }
    for name in [
        "disruption_active",
        "disruption_severity",
        "hour_of_day",
        "day_of_week",
        "is_weekend",
        "tow_sin",
        "tow_cos",
    ] {
        names.push(name.to_string());
    }

    let mut columns: Vec<FeatureColumn> = names
        .into_iter()
        .map(|name| FeatureColumn {
            name,
            group: DYNAMIC_FEATURE_GROUP.to_string(),
            dtype: FeatureDType::F64,
        })
        .collect();
    for name in ["latitude", "longitude"] {
        columns.push(FeatureColumn {
            name: name.to_string(),
            group: STATIC_FEATURE_GROUP.to_string(),
            dtype: FeatureDType::F64,
        });
    }

    let fingerprint = schema_fingerprint(cfg, &columns);

    info!(
        component = "features",
        event = "features.schema.built",
        version = cfg.schema_version,
        lag_steps = ?cfg.lag_steps,
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    FeatureSchema {
        version: cfg.schema_version,
        fingerprint,
        columns,
    }
}

pub fn speed_ratio(metrics: &RawMetrics) -> Option<f64> {
    let speed = metrics.current_speed?;
    let free_flow = metrics.free_flow_speed?;
    if free_flow <= 0.0 {
        return None;
    }
    Some(speed / free_flow)
}

pub fn congestion_index(metrics: &RawMetrics) -> Option<f64> {
    speed_ratio(metrics).map(|ratio| (1.0 - ratio).clamp(0.0, 1.0))
}

pub fn delay_seconds(metrics: &RawMetrics) -> Option<f64> {
    let travel = metrics.travel_time?;
    let free_flow = metrics.free_flow_travel_time?;
    Some((travel - free_flow).max(0.0))
}

pub fn congestion_series(
    entity_id: &str,
    observations: &[Observation],
) -> Result<BTreeMap<i64, f64>, FeatureError> {
    let snapshots = merge_snapshots(entity_id, i64::MAX, observations)?;
    Ok(snapshots
        .iter()
        .filter_map(|(ts, metrics)| congestion_index(metrics).map(|ci| (*ts, ci)))
        .collect())
}

// Merges same-timestamp observations field by field in ascending
// `source_tag` order. Only `ts <= as_of` is kept.
fn merge_snapshots(
    entity_id: &str,
    as_of_ts_ms_utc: i64,
    observations: &[Observation],
) -> Result<BTreeMap<i64, RawMetrics>, FeatureError> {
    let mut ordered: Vec<&Observation> = Vec::with_capacity(observations.len());
    for obs in observations {
        if obs.entity_id != entity_id {
            return Err(FeatureError::ForeignObservation {
                expected: entity_id.to_string(),
                found: obs.entity_id.clone(),
            });
        }
        if obs.ts_ms_utc <= as_of_ts_ms_utc {
            ordered.push(obs);
        }
    }
    ordered.sort_by(|a, b| {
        a.ts_ms_utc
            .cmp(&b.ts_ms_utc)
            .then_with(|| a.source_tag.cmp(&b.source_tag))
    });

    let mut snapshots: BTreeMap<i64, RawMetrics> = BTreeMap::new();
    for obs in ordered {
        snapshots
            .entry(obs.ts_ms_utc)
            .and_modify(|merged| merged.fill_missing_from(&obs.metrics))
            .or_insert(obs.metrics);
    }
    Ok(snapshots)
}

fn rolling_mean_std(samples: &[f64], min_samples: usize) -> (Option<f64>, Option<f64>) {
    if samples.is_empty() || samples.len() < min_samples {
        return (None, None);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples
        .iter()
        .map(|v| {
            let d = *v - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (Some(mean), Some(variance.sqrt()))
}

struct CalendarFeatures {
    hour_of_day: f64,
    day_of_week: f64,
    is_weekend: f64,
    tow_sin: f64,
    tow_cos: f64,
}

fn calendar_features(ts_ms_utc: i64) -> Result<CalendarFeatures, FeatureError> {
    let dt = Utc
        .timestamp_millis_opt(ts_ms_utc)
        .single()
        .ok_or(FeatureError::InvalidTimestamp(ts_ms_utc))?;
    let weekday = dt.weekday().num_days_from_monday() as f64;
    let seconds_of_day = dt.hour() as f64 * 3600.0 + dt.minute() as f64 * 60.0 + dt.second() as f64;
    let seconds_of_week = weekday * 86_400.0 + seconds_of_day;
    let angle = 2.0 * PI * (seconds_of_week / WEEK_SECONDS);
    Ok(CalendarFeatures {
        hour_of_day: dt.hour() as f64,
        day_of_week: weekday,
        is_weekend: if weekday >= 5.0 { 1.0 } else { 0.0 },
        tow_sin: angle.sin(),
        tow_cos: angle.cos(),
    })
}

fn validate_config(cfg: &FeatureConfig) -> Result<(), FeatureError> {
    if cfg.sample_interval_minutes == 0 {
        return Err(FeatureError::InvalidConfig(
            "sample_interval_minutes must be > 0".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for k in &cfg.lag_steps {
        if *k == 0 {
            return Err(FeatureError::InvalidConfig(
                "lag_steps entries must be > 0".to_string(),
            ));
        }
        if !seen.insert(*k) {
            return Err(FeatureError::InvalidConfig(
                "lag_steps entries must be unique".to_string(),
            ));
        }
    }

    let mut seen = HashSet::new();
    for window in &cfg.rolling_windows {
        if window.minutes == 0 || window.min_samples == 0 {
            return Err(FeatureError::InvalidConfig(
                "rolling windows need minutes > 0 and min_samples > 0".to_string(),
            ));
        }
        if !seen.insert(window.minutes) {
            return Err(FeatureError::InvalidConfig(
                "rolling window lengths must be unique".to_string(),
            ));
        }
        let capacity = window.minutes / cfg.sample_interval_minutes;
        if window.min_samples > capacity {
            return Err(FeatureError::InvalidConfig(format!(
                "rolling window {}m can hold at most {capacity} samples, min_samples is {}",
                window.minutes, window.min_samples
            )));
        }
    }

    Ok(())
}

fn schema_fingerprint(cfg: &FeatureConfig, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.schema_version));
    hasher.update(format!("interval_minutes:{};", cfg.sample_interval_minutes));
    hasher.update("lags:");
    for k in &cfg.lag_steps {
        hasher.update(format!("{k},"));
    }
    hasher.update(";rolling:");
    for window in &cfg.rolling_windows {
        hasher.update(format!("{}/{},", window.minutes, window.min_samples));
    }
    hasher.update(";columns:");
    for column in columns {
        hasher.update(column.group.as_bytes());
        hasher.update(".");
        hasher.update(column.name.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_ratio_requires_positive_free_flow() {
        let metrics = RawMetrics {
            current_speed: Some(20.0),
            free_flow_speed: Some(40.0),
            ..RawMetrics::default()
        };
        assert_eq!(speed_ratio(&metrics), Some(0.5));
        assert_eq!(congestion_index(&metrics), Some(0.5));

        let zero = RawMetrics {
            free_flow_speed: Some(0.0),
            ..metrics
        };
        assert_eq!(speed_ratio(&zero), None);

        let missing = RawMetrics {
            free_flow_speed: None,
            ..metrics
        };
        assert_eq!(speed_ratio(&missing), None);
    }

    #[test]
    fn congestion_index_is_clamped() {
        let faster_than_free_flow = RawMetrics {
            current_speed: Some(60.0),
            free_flow_speed: Some(40.0),
            ..RawMetrics::default()
        };
        assert_eq!(congestion_index(&faster_than_free_flow), Some(0.0));
    }

    #[test]
    fn delay_is_clipped_at_zero() {
        let early = RawMetrics {
            travel_time: Some(50.0),
            free_flow_travel_time: Some(60.0),
            ..RawMetrics::default()
        };
        assert_eq!(delay_seconds(&early), Some(0.0));

        let late = RawMetrics {
            travel_time: Some(90.0),
            free_flow_travel_time: Some(60.0),
            ..RawMetrics::default()
        };
        assert_eq!(delay_seconds(&late), Some(30.0));
    }

    #[test]
    fn rolling_requires_min_samples() {
        assert_eq!(rolling_mean_std(&[0.1, 0.2], 3), (None, None));
        let (mean, std) = rolling_mean_std(&[0.1, 0.2, 0.3], 3);
        assert!((mean.unwrap() - 0.2).abs() < 1e-12);
        assert!(std.unwrap() > 0.0);
    }

    #[test]
    fn config_validation_rejects_impossible_min_samples() {
        let cfg = FeatureConfig {
            rolling_windows: vec![RollingWindow {
                minutes: 5,
                min_samples: 6,
            }],
            ..FeatureConfig::default()
        };
        assert!(matches!(
            FeatureEngine::new(cfg),
            Err(FeatureError::InvalidConfig(_))
        ));

        let cfg = FeatureConfig {
            lag_steps: vec![1, 1],
            ..FeatureConfig::default()
        };
        assert!(matches!(
            FeatureEngine::new(cfg),
            Err(FeatureError::InvalidConfig(_))
        ));
    }

    #[test]
    fn lookback_covers_longest_lag_or_window() {
        let cfg = FeatureConfig::default();
        assert_eq!(cfg.lookback_ms(), 60 * MINUTE_MS);

        let cfg = FeatureConfig {
            sample_interval_minutes: 30,
            lag_steps: vec![1, 4],
            rolling_windows: vec![],
            ..FeatureConfig::default()
        };
        assert_eq!(cfg.lookback_ms(), 120 * MINUTE_MS);
    }
}
