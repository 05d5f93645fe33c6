use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tempfile::tempdir;
use traffic_forecast::{
    build_feature_schema, read_predictions_csv, CsvPredictionSink, CycleError, CyclePhase,
    EntityRegistry, FeatureConfig, FeatureEngine, FeatureStore, InMemoryFeatureStore,
    InMemoryPredictionSink, InferenceOrchestrator, LinearHorizon, LinearModel, ModelArtifact, Normalizer, ObservationLog, OrchestratorSettings,
    PersistenceModel, PointMetadata, PredictionSink, RawDisruptionRecord, RawFlowRecord,
    RawRecord, RawSeverity, RetryPolicy, SourceError, StaticRecordSource, UpstreamSource,
    DYNAMIC_FEATURE_GROUP, STATIC_FEATURE_GROUP,
};

const START_TS_MS: i64 = 1_735_689_600_000; // 2025-01-01T00:00:00Z
const MINUTE_MS: i64 = 60_000;
const CYCLE_TS_MS: i64 = START_TS_MS + 8 * 60 * MINUTE_MS;

fn registry(ids: &[&str]) -> EntityRegistry {
    EntityRegistry::new(ids.iter().enumerate().map(|(idx, id)| PointMetadata {
        entity_id: id.to_string(),
        latitude: 51.0 + idx as f64 / 10.0,
        longitude: -0.1,
        road_id: Some("a40".to_string()),
    }))
    .expect("registry should build")
}

/// One flow snapshot per minute over the 90 minutes before the cycle.
fn history_for(entity_id: &str, speed: f64) -> Vec<RawRecord> {
    (0..=90)
        .map(|back| {
            RawRecord::Flow(RawFlowRecord {
                entity_id: entity_id.to_string(),
                ts_ms_utc: CYCLE_TS_MS - back * MINUTE_MS + 2_500,
                current_speed: Some(speed - (back % 4) as f64),
                free_flow_speed: Some(50.0),
                current_travel_time: Some(80.0),
                free_flow_travel_time: Some(60.0),
                confidence: Some(0.9),
                source_tag: None,
            })
        })
        .collect()
}

struct ScriptedSource {
    inner: StaticRecordSource,
    failing: Vec<String>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl ScriptedSource {
    fn new(records: Vec<RawRecord>, failing: &[&str]) -> Self {
        Self {
            inner: StaticRecordSource::new(records),
            failing: failing.iter().map(|id| id.to_string()).collect(),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn attempts_for(&self, entity_id: &str) -> u32 {
        self.attempts
            .lock()
            .expect("attempts lock")
            .get(entity_id)
            .copied()
            .unwrap_or(0)
    }
}

impl UpstreamSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch(&self, entity_ids: &[String], since: i64) -> Result<Vec<RawRecord>, SourceError> {
        let mut attempts = self.attempts.lock().expect("attempts lock");
        for id in entity_ids {
            *attempts.entry(id.clone()).or_default() += 1;
        }
        drop(attempts);

        if entity_ids.iter().any(|id| self.failing.contains(id)) {
            return Err(SourceError::HttpRequest {
                url: "http://upstream.test/records".to_string(),
                message: "connection reset".to_string(),
            });
        }
        self.inner.fetch(entity_ids, since)
    }
}

struct Harness {
    orchestrator: InferenceOrchestrator,
    store: Arc<InMemoryFeatureStore>,
    sink: Arc<InMemoryPredictionSink>,
}

fn harness(
    registry: EntityRegistry,
    source: Arc<dyn UpstreamSource>,
    model: Arc<dyn ModelArtifact>,
) -> Harness {
    let store = Arc::new(InMemoryFeatureStore::new());
    let sink = Arc::new(InMemoryPredictionSink::new());
    let dyn_store: Arc<dyn FeatureStore> = store.clone();
    let dyn_sink: Arc<dyn PredictionSink> = sink.clone();
    let orchestrator = InferenceOrchestrator::new(
        registry,
        FeatureEngine::new(FeatureConfig::default()).expect("engine"),
        source,
        dyn_store,
        model,
        dyn_sink,
        OrchestratorSettings {
            horizons_minutes: vec![30, 60],
            retry: RetryPolicy {
                max_retries: 2,
                retry_backoff_ms: 1,
            },
        },
    );
    Harness {
        orchestrator,
        store,
        sink,
    }
}

#[test]
fn fetch_failure_isolates_one_entity_and_publishes_the_rest() {
    let source = Arc::new(ScriptedSource::new(
        [history_for("A", 40.0), history_for("B", 30.0)].concat(),
        &["A"],
    ));
    let h = harness(
        registry(&["A", "B"]),
        source.clone(),
        Arc::new(PersistenceModel::new(1)),
    );

    let result = h
        .orchestrator
        .run_cycle(CYCLE_TS_MS + 20_000)
        .expect("cycle should succeed");

    assert_eq!(result.cycle_ts_ms_utc, CYCLE_TS_MS);
    assert_eq!(source.attempts_for("A"), 3);
    assert_eq!(source.attempts_for("B"), 1);

    assert_eq!(result.failed_entities.len(), 1);
    assert_eq!(result.failed_entities[0].entity_id, "A");
    assert_eq!(result.failed_entities[0].phase, CyclePhase::Fetching);
    assert!(result.failed_entities[0].reason.contains("connection reset"));

    assert_eq!(result.succeeded_entities, vec!["B".to_string()]);
    assert_eq!(result.predictions.len(), 2);
    for prediction in &result.predictions {
        assert_eq!(prediction.entity_id, "B");
        assert_eq!(prediction.generated_at_ts_ms_utc, CYCLE_TS_MS);
        assert_eq!(prediction.schema_version, 1);
        assert_eq!(prediction.model_version, "persistence-v1");
        assert!((prediction.predicted_value - 0.4).abs() < 1e-12);
    }
    assert_eq!(h.sink.rows(), result.predictions);
    assert_eq!(h.orchestrator.phase(), CyclePhase::Idle);
}

#[test]
fn fully_rejected_records_fail_the_entity_at_normalizing() {
    let mut records = history_for("B", 30.0);
    records.push(RawRecord::Disruption(RawDisruptionRecord {
        entity_id: Some("A".to_string()),
        road_id: None,
        start_ts_ms_utc: CYCLE_TS_MS - 10 * MINUTE_MS,
        end_ts_ms_utc: None,
        severity: RawSeverity::Label("apocalyptic".to_string()),
    }));
    let h = harness(
        registry(&["A", "B"]),
        Arc::new(StaticRecordSource::new(records)),
        Arc::new(PersistenceModel::new(1)),
    );

    let result = h.orchestrator.run_cycle(CYCLE_TS_MS).expect("cycle");
    assert_eq!(result.failed_entities.len(), 1);
    assert_eq!(result.failed_entities[0].entity_id, "A");
    assert_eq!(result.failed_entities[0].phase, CyclePhase::Normalizing);
    assert_eq!(result.succeeded_entities, vec!["B".to_string()]);
}

#[test]
fn missing_current_snapshot_fails_at_predicting_without_imputation() {
    let mut a_records = history_for("A", 40.0);
    a_records.retain(|record| match record {
        RawRecord::Flow(flow) => flow.ts_ms_utc < CYCLE_TS_MS,
        _ => true,
    });
    let h = harness(
        registry(&["A", "B"]),
        Arc::new(StaticRecordSource::new(
            [a_records, history_for("B", 30.0)].concat(),
        )),
        Arc::new(PersistenceModel::new(1)),
    );

    let result = h.orchestrator.run_cycle(CYCLE_TS_MS).expect("cycle");
    assert_eq!(result.failed_entities.len(), 1);
    assert_eq!(result.failed_entities[0].entity_id, "A");
    assert_eq!(result.failed_entities[0].phase, CyclePhase::Predicting);
    assert!(result.predictions.iter().all(|row| row.entity_id == "B"));
}

#[test]
fn model_schema_mismatch_aborts_without_publishing() {
    let h = harness(
        registry(&["A", "B"]),
        Arc::new(StaticRecordSource::new(
            [history_for("A", 40.0), history_for("B", 30.0)].concat(),
        )),
        Arc::new(PersistenceModel::new(2)),
    );

    let err = h
        .orchestrator
        .run_cycle(CYCLE_TS_MS)
        .expect_err("schema mismatch should abort");
    assert!(matches!(
        err,
        CycleError::SchemaVersionMismatch {
            expected: 1,
            actual: 2,
            ..
        }
    ));
    assert!(h.sink.rows().is_empty());
    assert_eq!(h.orchestrator.phase(), CyclePhase::Idle);
}

#[test]
fn store_group_version_mismatch_aborts_without_publishing() {
    let h = harness(
        registry(&["A", "B"]),
        Arc::new(StaticRecordSource::new(
            [history_for("A", 40.0), history_for("B", 30.0)].concat(),
        )),
        Arc::new(PersistenceModel::new(1)),
    );
    h.store
        .register_group(STATIC_FEATURE_GROUP, 7, "v7")
        .expect("register");

    let err = h
        .orchestrator
        .run_cycle(CYCLE_TS_MS)
        .expect_err("store mismatch should abort");
    match err {
        CycleError::SchemaVersionMismatch { context, actual, .. } => {
            assert!(context.contains(STATIC_FEATURE_GROUP));
            assert_eq!(actual, 7);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(h.sink.rows().is_empty());
}

#[test]
fn store_built_with_other_lags_aborts_without_publishing() {
    let h = harness(
        registry(&["A", "B"]),
        Arc::new(StaticRecordSource::new(
            [history_for("A", 40.0), history_for("B", 30.0)].concat(),
        )),
        Arc::new(PersistenceModel::new(1)),
    );
    let offline = build_feature_schema(&FeatureConfig {
        lag_steps: vec![1, 2, 3, 5],
        ..FeatureConfig::default()
    });
    h.store
        .register_group(DYNAMIC_FEATURE_GROUP, offline.version, &offline.fingerprint)
        .expect("register");

    let err = h
        .orchestrator
        .run_cycle(CYCLE_TS_MS)
        .expect_err("fingerprint mismatch should abort");
    match err {
        CycleError::SchemaFingerprintMismatch { context, actual, .. } => {
            assert!(context.contains(DYNAMIC_FEATURE_GROUP));
            assert_eq!(actual, offline.fingerprint);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(h.sink.rows().is_empty());
    assert_eq!(h.orchestrator.phase(), CyclePhase::Idle);
}

#[test]
fn model_trained_on_other_features_aborts_without_publishing() {
    let trained_on = build_feature_schema(&FeatureConfig {
        lag_steps: vec![1, 2],
        ..FeatureConfig::default()
    });
    let model = LinearModel {
        model_version: "lin-lags-1-2".to_string(),
        schema_version: trained_on.version,
        schema_fingerprint: trained_on.fingerprint.clone(),
        horizons: [(
            30,
            LinearHorizon {
                intercept: 0.0,
                weights: [("congestion_index".to_string(), 1.0)].into_iter().collect(),
            },
        )]
        .into_iter()
        .collect(),
    };
    let h = harness(
        registry(&["A"]),
        Arc::new(StaticRecordSource::new(history_for("A", 40.0))),
        Arc::new(model),
    );

    let err = h
        .orchestrator
        .run_cycle(CYCLE_TS_MS)
        .expect_err("model fingerprint mismatch should abort");
    assert!(matches!(
        err,
        CycleError::SchemaFingerprintMismatch { ref context, .. } if context.contains("lin-lags-1-2")
    ));
    assert!(h.sink.rows().is_empty());
}

#[test]
fn runtime_rows_match_backfill_rows_byte_for_byte() {
    let records = history_for("A", 40.0);
    let registry_offline = registry(&["A"]);
    let h = harness(
        registry(&["A"]),
        Arc::new(StaticRecordSource::new(records.clone())),
        Arc::new(PersistenceModel::new(1)),
    );
    h.orchestrator.run_cycle(CYCLE_TS_MS).expect("cycle");

    let online = h
        .store
        .latest_at_or_before(DYNAMIC_FEATURE_GROUP, "A", 1, CYCLE_TS_MS)
        .expect("read")
        .expect("runtime row stored");

    let engine = FeatureEngine::new(FeatureConfig::default()).expect("engine");
    let normalizer = Normalizer::new(&registry_offline, engine.config().sample_interval_ms())
        .expect("normalizer");
    let mut log = ObservationLog::new();
    log.ingest(&normalizer, &records);
    let offline = engine
        .compute_for_backfill(
            &registry_offline,
            "A",
            &log.observations_for("A", i64::MAX),
            log.disruptions(),
            CYCLE_TS_MS,
            CYCLE_TS_MS + MINUTE_MS,
        )
        .expect("backfill");

    assert_eq!(offline.len(), 1);
    assert_eq!(offline[0].canonical_bytes(), online.canonical_bytes());
}

#[test]
fn rerunning_a_cycle_is_idempotent_for_the_store() {
    let h = harness(
        registry(&["A"]),
        Arc::new(StaticRecordSource::new(history_for("A", 40.0))),
        Arc::new(PersistenceModel::new(1)),
    );
    let first = h.orchestrator.run_cycle(CYCLE_TS_MS).expect("first");
    let second = h.orchestrator.run_cycle(CYCLE_TS_MS + 30_000).expect("second");

    assert_eq!(first.predictions, second.predictions);
    assert!(second.failed_entities.is_empty());
    assert_eq!(h.sink.rows().len(), 4);
}

struct SlowSource {
    inner: StaticRecordSource,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl UpstreamSource for SlowSource {
    fn name(&self) -> &str {
        "slow"
    }

    fn fetch(&self, entity_ids: &[String], since: i64) -> Result<Vec<RawRecord>, SourceError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(40));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.fetch(entity_ids, since)
    }
}

#[test]
fn overlapping_triggers_run_one_cycle_at_a_time() {
    let source = Arc::new(SlowSource {
        inner: StaticRecordSource::new(history_for("A", 40.0)),
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
    });
    let h = Arc::new(harness(
        registry(&["A"]),
        source.clone(),
        Arc::new(PersistenceModel::new(1)),
    ));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let h = Arc::clone(&h);
            thread::spawn(move || h.orchestrator.run_cycle(CYCLE_TS_MS))
        })
        .collect();
    for handle in handles {
        handle
            .join()
            .expect("trigger thread should not panic")
            .expect("cycle should succeed");
    }

    assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(h.sink.rows().len(), 6);
}

#[test]
fn csv_sink_receives_cycle_predictions() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("predictions.csv");
    let store: Arc<dyn FeatureStore> = Arc::new(InMemoryFeatureStore::new());
    let sink: Arc<dyn PredictionSink> = Arc::new(CsvPredictionSink::new(&path));
    let orchestrator = InferenceOrchestrator::new(
        registry(&["A", "B"]),
        FeatureEngine::new(FeatureConfig::default()).expect("engine"),
        Arc::new(StaticRecordSource::new(
            [history_for("A", 40.0), history_for("B", 30.0)].concat(),
        )),
        store,
        Arc::new(PersistenceModel::new(1)),
        sink,
        OrchestratorSettings {
            horizons_minutes: vec![15, 30, 60],
            retry: RetryPolicy::default(),
        },
    );

    let result = orchestrator.run_cycle(CYCLE_TS_MS).expect("cycle");
    let written = read_predictions_csv(&path).expect("read csv");
    assert_eq!(written.len(), 6);
    assert_eq!(written, result.predictions);
}
