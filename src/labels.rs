//! Multi-horizon targets for offline training.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::features::{congestion_series, FeatureError, FeatureRow};
use crate::normalize::{EntityRegistry, ObservationLog};

const MINUTE_MS: i64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelConfig {
    pub horizons_minutes: Vec<u32>,
    pub tolerance_minutes: u32,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            horizons_minutes: vec![30, 60],
            tolerance_minutes: 2,
        }
    }
}

impl LabelConfig {
    pub fn max_horizon_minutes(&self) -> u32 {
        self.horizons_minutes.iter().copied().max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRow {
    pub entity_id: String,
    pub ts_ms_utc: i64,
    pub horizon_minutes: u32,
    pub target_value: Option<f64>,
    pub target_defined: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingExample {
    pub features: FeatureRow,
    pub horizon_minutes: u32,
    pub target_value: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum LabelError {
    #[error("unknown entity_id: {0}")]
    UnknownEntity(String),
    #[error("no horizons configured")]
    NoHorizons,
    #[error("horizons must be > 0")]
    ZeroHorizon,
    #[error(transparent)]
    Feature(#[from] FeatureError),
}

pub fn generate_labels(
    registry: &EntityRegistry,
    log: &ObservationLog,
    rows: &[FeatureRow],
    cfg: &LabelConfig,
) -> Result<Vec<LabelRow>, LabelError> {
    if cfg.horizons_minutes.is_empty() {
        return Err(LabelError::NoHorizons);
    }
    if cfg.horizons_minutes.contains(&0) {
        return Err(LabelError::ZeroHorizon);
    }

    let tolerance_ms = i64::from(cfg.tolerance_minutes) * MINUTE_MS;
    let mut series_cache: BTreeMap<&str, BTreeMap<i64, f64>> = BTreeMap::new();
    let mut labels = Vec::with_capacity(rows.len() * cfg.horizons_minutes.len());

    for row in rows {
        let entity_id = row.entity_id.as_str();
        if !registry.contains(entity_id) {
            return Err(LabelError::UnknownEntity(entity_id.to_string()));
        }
        if !series_cache.contains_key(entity_id) {
            let observations = log.observations_for(entity_id, i64::MAX);
            series_cache.insert(entity_id, congestion_series(entity_id, &observations)?);
        }
        let series = &series_cache[entity_id];

        for horizon in &cfg.horizons_minutes {
            let target_ts = row.ts_ms_utc + i64::from(*horizon) * MINUTE_MS;
            let target_value = nearest_within(series, target_ts, tolerance_ms);
            labels.push(LabelRow {
                entity_id: entity_id.to_string(),
                ts_ms_utc: row.ts_ms_utc,
                horizon_minutes: *horizon,
                target_value,
                target_defined: target_value.is_some(),
            });
        }
    }

    let undefined = labels.iter().filter(|label| !label.target_defined).count();
    info!(
        component = "labels",
        event = "labels.generated",
        rows = rows.len(),
        labels = labels.len(),
        undefined
    );
    Ok(labels)
}

pub fn trainable_examples(rows: &[FeatureRow], labels: &[LabelRow]) -> Vec<TrainingExample> {
    let by_key: BTreeMap<(&str, i64), &FeatureRow> = rows
        .iter()
        .map(|row| ((row.entity_id.as_str(), row.ts_ms_utc), row))
        .collect();

    labels
        .iter()
        .filter_map(|label| {
            let target_value = label.target_value.filter(|_| label.target_defined)?;
            let row = by_key.get(&(label.entity_id.as_str(), label.ts_ms_utc))?;
            Some(TrainingExample {
                features: (*row).clone(),
                horizon_minutes: label.horizon_minutes,
                target_value,
            })
        })
        .collect()
}

// Nearest defined value to `target_ts` within `tolerance_ms`; ties go to the
// earlier timestamp.
fn nearest_within(series: &BTreeMap<i64, f64>, target_ts: i64, tolerance_ms: i64) -> Option<f64> {
    let before = series
        .range((target_ts - tolerance_ms)..=target_ts)
        .next_back();
    let after = series
        .range((target_ts + 1)..=(target_ts + tolerance_ms))
        .next();

    match (before, after) {
        (Some((b_ts, b)), Some((a_ts, a))) => {
            if a_ts - target_ts < target_ts - b_ts {
                Some(*a)
            } else {
                Some(*b)
            }
        }
        (Some((_, b)), None) => Some(*b),
        (None, Some((_, a))) => Some(*a),
        (None, None) => None,
    }
}
