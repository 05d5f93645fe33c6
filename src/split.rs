//! Chronological train/validation split with an embargo gap.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::labels::{LabelConfig, TrainingExample};

const MINUTE_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SplitCutoff {
    Timestamp(i64),
    ValidationFraction(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitConfig {
    pub cutoff: SplitCutoff,
    pub gap_minutes: u32,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            cutoff: SplitCutoff::ValidationFraction(0.2),
            gap_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitResult {
    pub cutoff_ts_ms_utc: i64,
    pub train: Vec<TrainingExample>,
    pub validation: Vec<TrainingExample>,
    pub dropped_in_gap: usize,
    pub purged_from_train: usize,
}

#[derive(Debug, Error, PartialEq)]
pub enum SplitError {
    #[error("gap of {gap_minutes}m is shorter than the largest horizon {max_horizon_minutes}m")]
    InsufficientGap {
        gap_minutes: u32,
        max_horizon_minutes: u32,
    },
    #[error("validation fraction must be in (0, 1), got {0}")]
    InvalidFraction(f64),
    #[error("no examples to split")]
    Empty,
}

// A label may come from a snapshot up to `tolerance_minutes` after `T + h`,
// so a training example is kept only if `T + h + tolerance` is still before
// the validation start.
pub fn time_split(
    examples: Vec<TrainingExample>,
    cfg: &SplitConfig,
    labels: &LabelConfig,
) -> Result<SplitResult, SplitError> {
    let max_horizon_minutes = labels.max_horizon_minutes();
    if cfg.gap_minutes < max_horizon_minutes {
        return Err(SplitError::InsufficientGap {
            gap_minutes: cfg.gap_minutes,
            max_horizon_minutes,
        });
    }

    let cutoff_ts_ms_utc = match cfg.cutoff {
        SplitCutoff::Timestamp(ts) => ts,
        SplitCutoff::ValidationFraction(fraction) => fraction_cutoff(&examples, fraction)?,
    };
    let validation_start =
        cutoff_ts_ms_utc.saturating_add(i64::from(cfg.gap_minutes) * MINUTE_MS);
    let tolerance_ms = i64::from(labels.tolerance_minutes) * MINUTE_MS;

    let mut train = Vec::new();
    let mut validation = Vec::new();
    let mut dropped_in_gap = 0usize;
    let mut purged_from_train = 0usize;
    for example in examples {
        let ts = example.features.ts_ms_utc;
        if ts < cutoff_ts_ms_utc {
            let latest_label_ts = ts
                .saturating_add(i64::from(example.horizon_minutes) * MINUTE_MS)
                .saturating_add(tolerance_ms);
            if latest_label_ts < validation_start {
                train.push(example);
            } else {
                purged_from_train += 1;
            }
        } else if ts >= validation_start {
            validation.push(example);
        } else {
            dropped_in_gap += 1;
        }
    }

    info!(
        component = "split",
        event = "split.completed",
        cutoff_ts_ms_utc,
        validation_start_ts_ms_utc = validation_start,
        train = train.len(),
        validation = validation.len(),
        dropped_in_gap,
        purged_from_train
    );

    Ok(SplitResult {
        cutoff_ts_ms_utc,
        train,
        validation,
        dropped_in_gap,
        purged_from_train,
    })
}

fn fraction_cutoff(examples: &[TrainingExample], fraction: f64) -> Result<i64, SplitError> {
    if !(fraction > 0.0 && fraction < 1.0) {
        return Err(SplitError::InvalidFraction(fraction));
    }
    let timestamps: Vec<i64> = examples
        .iter()
        .map(|example| example.features.ts_ms_utc)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if timestamps.is_empty() {
        return Err(SplitError::Empty);
    }
    let train_count = ((timestamps.len() as f64) * (1.0 - fraction)).floor() as usize;
    let index = train_count.min(timestamps.len() - 1);
    Ok(timestamps[index])
}
