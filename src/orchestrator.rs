//! One scheduled inference cycle.
//!
//! Cycles are serialized by a lock. Within a cycle, every phase finishes for
//! all entities before the next one starts, and per-entity fetch, normalize and
//! featurize work runs on scoped worker threads. The store is only written from
//! the single writer step at the start of JOINING.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock, TryLockError};
use std::thread;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::features::{
    FeatureEngine, FeatureRow, FeatureSchema, FeatureWindow, DYNAMIC_FEATURE_GROUP,
    STATIC_FEATURE_GROUP,
};
use crate::model::{ModelArtifact, ModelError};
use crate::normalize::{floor_to_interval, EntityRegistry, NormalizeError, Normalizer, ObservationLog, RawRecord};
use crate::observability::{log_cycle_deferred, log_cycle_phase, log_entity_failed};
use crate::publish::{PredictionRow, PredictionSink, PublishError};
use crate::source::{fetch_with_retry, RetryPolicy, SourceError, UpstreamSource};
use crate::store::{ensure_group_registered, point_in_time_join, FeatureStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Fetching,
    Normalizing,
    Featurizing,
    Joining,
    Predicting,
    Publishing,
}

impl CyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Normalizing => "normalizing",
            Self::Featurizing => "featurizing",
            Self::Joining => "joining",
            Self::Predicting => "predicting",
            Self::Publishing => "publishing",
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityFailure {
    pub entity_id: String,
    pub phase: CyclePhase,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleResult {
    pub cycle_ts_ms_utc: i64,
    pub predictions: Vec<PredictionRow>,
    pub succeeded_entities: Vec<String>,
    pub failed_entities: Vec<EntityFailure>,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("schema version mismatch in {context}: expected {expected}, got {actual}")]
    SchemaVersionMismatch {
        context: String,
        expected: u32,
        actual: u32,
    },
    #[error("schema fingerprint mismatch in {context}: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch {
        context: String,
        expected: String,
        actual: String,
    },
    #[error("normalizer setup failed: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("feature store failure: {0}")]
    Store(StoreError),
    #[error("model failure: {0}")]
    Model(ModelError),
    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),
    #[error("orchestrator lock poisoned")]
    LockPoisoned,
}

impl From<StoreError> for CycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SchemaVersionMismatch {
                group,
                expected,
                actual,
            } => Self::SchemaVersionMismatch {
                context: format!("feature group {group}"),
                expected,
                actual,
            },
            StoreError::SchemaFingerprintMismatch {
                group,
                expected,
                actual,
            } => Self::SchemaFingerprintMismatch {
                context: format!("feature group {group}"),
                expected,
                actual,
            },
            other => Self::Store(other),
        }
    }
}

impl From<ModelError> for CycleError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::SchemaVersionMismatch {
                model_version,
                required,
                actual,
            } => Self::SchemaVersionMismatch {
                context: format!("model {model_version}"),
                expected: actual,
                actual: required,
            },
            other => Self::Model(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub horizons_minutes: Vec<u32>,
    pub retry: RetryPolicy,
}

pub struct InferenceOrchestrator {
    registry: EntityRegistry,
    engine: FeatureEngine,
    source: Arc<dyn UpstreamSource>,
    store: Arc<dyn FeatureStore>,
    model: Arc<dyn ModelArtifact>,
    sink: Arc<dyn PredictionSink>,
    settings: OrchestratorSettings,
    cycle_lock: Mutex<()>,
    phase: RwLock<CyclePhase>,
}

impl InferenceOrchestrator {
    pub fn new(
        registry: EntityRegistry,
        engine: FeatureEngine,
        source: Arc<dyn UpstreamSource>,
        store: Arc<dyn FeatureStore>,
        model: Arc<dyn ModelArtifact>,
        sink: Arc<dyn PredictionSink>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            engine,
            source,
            store,
            model,
            sink,
            settings,
            cycle_lock: Mutex::new(()),
            phase: RwLock::new(CyclePhase::Idle),
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
            .read()
            .map(|phase| *phase)
            .unwrap_or(CyclePhase::Idle)
    }

    pub fn run_cycle(&self, now_ts_ms_utc: i64) -> Result<CycleResult, CycleError> {
        let _cycle = match self.cycle_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                log_cycle_deferred(now_ts_ms_utc, self.phase());
                self.cycle_lock.lock().map_err(|_| CycleError::LockPoisoned)?
            }
            Err(TryLockError::Poisoned(_)) => return Err(CycleError::LockPoisoned),
        };

        let interval_ms = self.engine.config().sample_interval_ms();
        let cycle_ts = floor_to_interval(now_ts_ms_utc, interval_ms);
        let outcome = self.run_phases(cycle_ts);
        self.set_phase(CyclePhase::Idle, cycle_ts);

        match &outcome {
            Ok(result) => info!(
                component = "orchestrator",
                event = "cycle.completed",
                cycle_ts_ms_utc = cycle_ts,
                predictions = result.predictions.len(),
                succeeded_entities = result.succeeded_entities.len(),
                failed_entities = result.failed_entities.len()
            ),
            Err(err) => error!(
                component = "orchestrator",
                event = "cycle.aborted",
                cycle_ts_ms_utc = cycle_ts,
                error = %err
            ),
        }
        outcome
    }

    fn run_phases(&self, cycle_ts: i64) -> Result<CycleResult, CycleError> {
        let mut failures: Vec<EntityFailure> = Vec::new();
        let entity_ids = self.registry.entity_ids();
        let interval_ms = self.engine.config().sample_interval_ms();
        let since = cycle_ts - self.engine.config().lookback_ms();

        self.set_phase(CyclePhase::Fetching, cycle_ts);
        let fetched: Vec<(String, Result<Vec<RawRecord>, SourceError>)> =
            parallel_map(&entity_ids, |entity_id| {
                let result = fetch_with_retry(
                    self.source.as_ref(),
                    std::slice::from_ref(entity_id),
                    since,
                    &self.settings.retry,
                );
                (entity_id.clone(), result)
            });
        let mut fetched_ok: Vec<(String, Vec<RawRecord>)> = Vec::with_capacity(fetched.len());
        for (entity_id, result) in fetched {
            match result {
                Ok(records) => fetched_ok.push((entity_id, records)),
                Err(err) => {
                    record_failure(&mut failures, entity_id, CyclePhase::Fetching, err.to_string())
                }
            }
        }

        self.set_phase(CyclePhase::Normalizing, cycle_ts);
        let normalizer = Normalizer::new(&self.registry, interval_ms)?;
        let normalized: Vec<(String, Result<ObservationLog, String>)> =
            parallel_map(&fetched_ok, |(entity_id, records)| {
                let mut log = ObservationLog::new();
                let report = log.ingest(&normalizer, records);
                let result = if report.accepted == 0 && report.rejected > 0 {
                    Err(report
                        .first_error
                        .unwrap_or_else(|| "all records rejected".to_string()))
                } else {
                    Ok(log)
                };
                (entity_id.clone(), result)
            });
        let mut logs: Vec<(String, ObservationLog)> = Vec::with_capacity(normalized.len());
        for (entity_id, result) in normalized {
            match result {
                Ok(log) => logs.push((entity_id, log)),
                Err(reason) => {
                    record_failure(&mut failures, entity_id, CyclePhase::Normalizing, reason)
                }
            }
        }

        self.set_phase(CyclePhase::Featurizing, cycle_ts);
        let schema = self.engine.schema();
        self.check_model_schema(schema)?;
        for group in schema.group_names() {
            ensure_group_registered(self.store.as_ref(), &group, schema)?;
        }

        let featurized: Vec<(String, Result<(FeatureRow, FeatureRow), String>)> =
            parallel_map(&logs, |(entity_id, log)| {
                let observations = log.observations_for(entity_id, cycle_ts);
                let window = FeatureWindow {
                    entity_id,
                    as_of_ts_ms_utc: cycle_ts,
                    observations: &observations,
                    disruptions: log.disruptions(),
                };
                let rows = self
                    .engine
                    .compute_for_runtime(&self.registry, &window)
                    .and_then(|dynamic| {
                        let stat = self.engine.compute_static(&self.registry, entity_id)?;
                        Ok((dynamic, stat))
                    })
                    .map_err(|err| err.to_string());
                (entity_id.clone(), rows)
            });

        self.set_phase(CyclePhase::Joining, cycle_ts);
        let mut joinable: Vec<String> = Vec::with_capacity(featurized.len());
        for (entity_id, rows) in featurized {
            let (dynamic, stat) = match rows {
                Ok(rows) => rows,
                Err(reason) => {
                    record_failure(&mut failures, entity_id, CyclePhase::Featurizing, reason);
                    continue;
                }
            };
            match self.write_rows(&dynamic, &stat) {
                Ok(()) => joinable.push(entity_id),
                Err(StoreError::ImmutableRowConflict { .. }) => record_failure(
                    &mut failures,
                    entity_id,
                    CyclePhase::Joining,
                    "stored feature row differs from recomputed row".to_string(),
                ),
                Err(err) => return Err(err.into()),
            }
        }

        let joined = point_in_time_join(
            self.store.as_ref(),
            schema,
            &self.registry,
            &joinable,
            cycle_ts,
        )?;
        for missing in joined.missing {
            record_failure(
                &mut failures,
                missing.entity_id,
                CyclePhase::Joining,
                format!("no row in group {}", missing.group),
            );
        }

        self.set_phase(CyclePhase::Predicting, cycle_ts);
        let mut predictions = Vec::new();
        let mut succeeded_entities = Vec::new();
        for row in &joined.rows {
            match self.predict_all_horizons(row, cycle_ts) {
                Ok(rows) => {
                    predictions.extend(rows);
                    succeeded_entities.push(row.entity_id.clone());
                }
                Err(err @ ModelError::SchemaVersionMismatch { .. }) => return Err(err.into()),
                Err(err) => record_failure(
                    &mut failures,
                    row.entity_id.clone(),
                    CyclePhase::Predicting,
                    err.to_string(),
                ),
            }
        }

        self.set_phase(CyclePhase::Publishing, cycle_ts);
        if !predictions.is_empty() {
            self.sink.publish(&predictions)?;
        }

        failures.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(CycleResult {
            cycle_ts_ms_utc: cycle_ts,
            predictions,
            succeeded_entities,
            failed_entities: failures,
        })
    }

    fn check_model_schema(&self, schema: &FeatureSchema) -> Result<(), CycleError> {
        let context = format!("model {}", self.model.model_version());
        if self.model.required_schema_version() != schema.version {
            return Err(CycleError::SchemaVersionMismatch {
                context,
                expected: schema.version,
                actual: self.model.required_schema_version(),
            });
        }
        match self.model.required_schema_fingerprint() {
            Some(required) if required != schema.fingerprint => {
                Err(CycleError::SchemaFingerprintMismatch {
                    context,
                    expected: schema.fingerprint.clone(),
                    actual: required.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn write_rows(&self, dynamic: &FeatureRow, stat: &FeatureRow) -> Result<(), StoreError> {
        self.store.write(DYNAMIC_FEATURE_GROUP, dynamic)?;
        self.store.write(STATIC_FEATURE_GROUP, stat)?;
        Ok(())
    }

    fn predict_all_horizons(
        &self,
        row: &FeatureRow,
        cycle_ts: i64,
    ) -> Result<Vec<PredictionRow>, ModelError> {
        self.settings
            .horizons_minutes
            .iter()
            .map(|horizon| {
                let predicted_value = self.model.predict(row, *horizon)?;
                Ok(PredictionRow {
                    entity_id: row.entity_id.clone(),
                    generated_at_ts_ms_utc: cycle_ts,
                    horizon_minutes: *horizon,
                    predicted_value,
                    model_version: self.model.model_version().to_string(),
                    schema_version: row.schema_version,
                })
            })
            .collect()
    }

    fn set_phase(&self, phase: CyclePhase, cycle_ts: i64) {
        if let Ok(mut current) = self.phase.write() {
            *current = phase;
        }
        log_cycle_phase(phase, cycle_ts);
    }
}

fn record_failure(
    failures: &mut Vec<EntityFailure>,
    entity_id: String,
    phase: CyclePhase,
    reason: String,
) {
    log_entity_failed(&entity_id, phase, &reason);
    failures.push(EntityFailure {
        entity_id,
        phase,
        reason,
    });
}

fn parallel_map<T, R, F>(items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    if items.is_empty() {
        return Vec::new();
    }
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(items.len());
    let chunk_size = items.len().div_ceil(workers);

    thread::scope(|scope| {
        let f = &f;
        let handles: Vec<_> = items
            .chunks(chunk_size)
            .map(|chunk| scope.spawn(move || chunk.iter().map(f).collect::<Vec<R>>()))
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|payload| std::panic::resume_unwind(payload))
            })
            .collect()
    })
}
