//! Offline training-set construction.
//!
//! Rows are computed with `compute_for_backfill`, written to the feature store,
//! and read back through `point_in_time_join`, the same retrieval the
//! inference cycle uses.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

use crate::features::{
    FeatureEngine, FeatureError, FeatureRow, FeatureSchema, DYNAMIC_FEATURE_GROUP,
    STATIC_FEATURE_GROUP,
};
use crate::labels::{generate_labels, trainable_examples, LabelConfig, LabelError, LabelRow, TrainingExample};
use crate::normalize::{EntityRegistry, ObservationLog, RawFlowRecord, RawRecord};
use crate::split::{time_split, SplitConfig, SplitError, SplitResult};
use crate::store::{ensure_group_registered, point_in_time_join, FeatureStore, StoreError};

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Label(#[from] LabelError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("line {line}: {source}")]
    JsonLine {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillRange {
    pub start_ts_ms_utc: i64,
    pub end_ts_ms_utc_exclusive: i64,
}

impl BackfillRange {
    pub fn unbounded() -> Self {
        Self {
            start_ts_ms_utc: i64::MIN,
            end_ts_ms_utc_exclusive: i64::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSet {
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureRow>,
    pub labels: Vec<LabelRow>,
    pub split: SplitResult,
}

pub struct BackfillPlan<'a> {
    pub registry: &'a EntityRegistry,
    pub engine: &'a FeatureEngine,
    pub store: &'a dyn FeatureStore,
    pub labels: &'a LabelConfig,
    pub split: &'a SplitConfig,
    pub range: BackfillRange,
}

pub fn build_training_set(
    plan: &BackfillPlan<'_>,
    log: &ObservationLog,
) -> Result<TrainingSet, BackfillError> {
    let schema = plan.engine.schema();
    for group in schema.group_names() {
        ensure_group_registered(plan.store, &group, schema)?;
    }

    let mut rows = Vec::new();
    for entity_id in plan.registry.entity_ids() {
        let history = log.observations_for(&entity_id, i64::MAX);
        if history.is_empty() {
            warn!(
                component = "backfill",
                event = "backfill.entity.no_history",
                entity_id = %entity_id
            );
            continue;
        }

        let computed = plan.engine.compute_for_backfill(
            plan.registry,
            &entity_id,
            &history,
            log.disruptions(),
            plan.range.start_ts_ms_utc,
            plan.range.end_ts_ms_utc_exclusive,
        )?;
        let stat = plan.engine.compute_static(plan.registry, &entity_id)?;
        plan.store.write(STATIC_FEATURE_GROUP, &stat)?;
        for row in &computed {
            plan.store.write(DYNAMIC_FEATURE_GROUP, row)?;
        }

        let single = std::slice::from_ref(&entity_id);
        for row in &computed {
            let joined = point_in_time_join(plan.store, schema, plan.registry, single, row.ts_ms_utc)?;
            rows.extend(joined.rows);
        }
    }

    let labels = generate_labels(plan.registry, log, &rows, plan.labels)?;
    let examples = trainable_examples(&rows, &labels);
    let split = time_split(examples, plan.split, plan.labels)?;

    info!(
        component = "backfill",
        event = "backfill.completed",
        rows = rows.len(),
        labels = labels.len(),
        train = split.train.len(),
        validation = split.validation.len(),
        dropped_in_gap = split.dropped_in_gap,
        purged_from_train = split.purged_from_train
    );

    Ok(TrainingSet {
        schema: schema.clone(),
        rows,
        labels,
        split,
    })
}

pub fn read_flow_csv(path: &Path) -> Result<Vec<RawRecord>, BackfillError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for row in reader.deserialize::<RawFlowRecord>() {
        records.push(RawRecord::Flow(row?));
    }
    Ok(records)
}

pub fn read_records_jsonl(path: &Path) -> Result<Vec<RawRecord>, BackfillError> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| BackfillError::JsonLine {
            line: idx + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

pub fn write_examples_csv(
    path: &Path,
    schema: &FeatureSchema,
    examples: &[TrainingExample],
) -> Result<(), BackfillError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut writer = csv::Writer::from_path(path)?;
    let mut header = vec![
        "entity_id".to_string(),
        "ts_ms_utc".to_string(),
        "horizon_minutes".to_string(),
        "target_value".to_string(),
    ];
    header.extend(schema.columns.iter().map(|column| column.name.clone()));
    writer.write_record(&header)?;

    for example in examples {
        let mut record = vec![
            example.features.entity_id.clone(),
            example.features.ts_ms_utc.to_string(),
            example.horizon_minutes.to_string(),
            example.target_value.to_string(),
        ];
        record.extend(schema.columns.iter().map(|column| {
            example
                .features
                .get(&column.name)
                .map(|value| value.to_string())
                .unwrap_or_default()
        }));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}
