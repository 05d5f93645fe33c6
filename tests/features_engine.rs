use std::f64::consts::PI;

use traffic_forecast::{
    build_feature_schema, DisruptionEvent, DisruptionTarget,
    EntityRegistry, FeatureConfig, FeatureEngine, FeatureError, FeatureWindow, Observation,
    PointMetadata, RawMetrics, RollingWindow, DYNAMIC_FEATURE_GROUP, FEATURE_SCHEMA_VERSION,
    STATIC_FEATURE_GROUP,
};

const START_TS_MS: i64 = 1_735_689_600_000; // 2025-01-01T00:00:00Z, a Wednesday
const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;

fn registry() -> EntityRegistry {
    EntityRegistry::new(vec![
        PointMetadata {
            entity_id: "p1".to_string(),
            latitude: 51.5,
            longitude: -0.12,
            road_id: Some("A40".to_string()),
        },
        PointMetadata {
            entity_id: "p2".to_string(),
            latitude: 51.4,
            longitude: -0.3,
            road_id: Some("M25".to_string()),
        },
    ])
    .expect("registry should build")
}

fn flow(entity_id: &str, ts_ms_utc: i64, speed: f64, free_flow: f64) -> Observation {
    Observation {
        entity_id: entity_id.to_string(),
        ts_ms_utc,
        metrics: RawMetrics {
            current_speed: Some(speed),
            free_flow_speed: Some(free_flow),
            ..RawMetrics::default()
        },
        source_tag: "flow".to_string(),
    }
}

fn minute_series(entity_id: &str, end_ts: i64, minutes: i64) -> Vec<Observation> {
    (0..minutes)
        .rev()
        .map(|back| {
            let ts = end_ts - back * MINUTE_MS;
            flow(entity_id, ts, 20.0 + (back % 7) as f64, 40.0)
        })
        .collect()
}

fn rolling_engine(minutes: u32, min_samples: u32) -> FeatureEngine {
    FeatureEngine::new(FeatureConfig {
        rolling_windows: vec![RollingWindow {
            minutes,
            min_samples,
        }],
        ..FeatureConfig::default()
    })
    .expect("engine should build")
}

fn assert_close(actual: Option<f64>, expected: f64) {
    let actual = actual.expect("value should be present");
    assert!(
        (actual - expected).abs() < 1e-12,
        "expected {expected}, got {actual}"
    );
}

#[test]
fn schema_order_and_fingerprint_are_deterministic() {
    let cfg = FeatureConfig::default();
    let schema_a = build_feature_schema(&cfg);
    let schema_b = build_feature_schema(&cfg);

    assert_eq!(schema_a, schema_b);
    assert_eq!(schema_a.version, FEATURE_SCHEMA_VERSION);
    assert_eq!(schema_a.columns.len(), 23);
    assert_eq!(schema_a.columns[0].name, "speed_ratio");
    assert_eq!(schema_a.columns[1].name, "congestion_index");
    assert_eq!(schema_a.columns[6].name, "congestion_index_lag_1");
    assert_eq!(schema_a.columns[20].name, "tow_cos");
    assert_eq!(schema_a.columns[21].group, STATIC_FEATURE_GROUP);
    assert_eq!(
        schema_a.group_names(),
        vec![DYNAMIC_FEATURE_GROUP.to_string(), STATIC_FEATURE_GROUP.to_string()]
    );
    assert_eq!(schema_a.fingerprint.len(), 64);

    let other = build_feature_schema(&FeatureConfig {
        lag_steps: vec![1, 2],
        ..FeatureConfig::default()
    });
    assert_ne!(schema_a.fingerprint, other.fingerprint);
}

#[test]
fn speed_ratio_and_congestion_follow_free_flow() {
    let registry = registry();
    let engine = FeatureEngine::new(FeatureConfig::default()).expect("engine");
    let t = START_TS_MS + HOUR_MS;

    let observations = vec![flow("p1", t, 20.0, 40.0)];
    let row = engine
        .compute(
            &registry,
            &FeatureWindow {
                entity_id: "p1",
                as_of_ts_ms_utc: t,
                observations: &observations,
                disruptions: &[],
            },
        )
        .expect("row");
    assert_close(row.get("speed_ratio"), 0.5);
    assert_close(row.get("congestion_index"), 0.5);
    assert_eq!(row.get("congestion_index_lag_1"), None);
    assert_eq!(row.get("delay_seconds"), None);

    let stalled_sensor = vec![flow("p1", t, 20.0, 0.0)];
    let row = engine
        .compute(
            &registry,
            &FeatureWindow {
                entity_id: "p1",
                as_of_ts_ms_utc: t,
                observations: &stalled_sensor,
                disruptions: &[],
            },
        )
        .expect("row");
    assert_eq!(row.get("speed_ratio"), None);
    assert_eq!(row.get("congestion_index"), None);
    assert!(row.absent_features().contains(&"speed_ratio"));
}

#[test]
fn lags_and_delta_read_exact_prior_snapshots() {
    let registry = registry();
    let engine = FeatureEngine::new(FeatureConfig::default()).expect("engine");
    let t = START_TS_MS + HOUR_MS;

    let observations = vec![
        flow("p1", t - 3 * MINUTE_MS, 36.0, 40.0),
        flow("p1", t - MINUTE_MS, 30.0, 40.0),
        flow("p1", t, 20.0, 40.0),
    ];
    let row = engine
        .compute(
            &registry,
            &FeatureWindow {
                entity_id: "p1",
                as_of_ts_ms_utc: t,
                observations: &observations,
                disruptions: &[],
            },
        )
        .expect("row");

    assert_close(row.get("congestion_index_lag_1"), 0.25);
    assert_eq!(row.get("congestion_index_lag_2"), None);
    assert_close(row.get("congestion_index_lag_3"), 0.1);
    assert_close(row.get("congestion_index_delta_1"), 0.25);
}

#[test]
fn rolling_features_need_the_minimum_sample_count() {
    let registry = registry();
    let engine = rolling_engine(15, 10);
    let t = START_TS_MS + HOUR_MS;
    let window_of = |observations: &[Observation]| {
        engine
            .compute(
                &registry,
                &FeatureWindow {
                    entity_id: "p1",
                    as_of_ts_ms_utc: t,
                    observations,
                    disruptions: &[],
                },
            )
            .expect("row")
    };

    let mut observations = minute_series("p1", t, 9);
    observations.push(flow("p1", t - 15 * MINUTE_MS, 10.0, 40.0));
    let row = window_of(&observations);
    assert_eq!(row.get("congestion_index_roll_mean_15m"), None);
    assert_eq!(row.get("congestion_index_roll_std_15m"), None);

    let observations = minute_series("p1", t, 10);
    let row = window_of(&observations);
    let values: Vec<f64> = observations
        .iter()
        .map(|obs| 1.0 - obs.metrics.current_speed.expect("speed") / 40.0)
        .collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    assert_close(row.get("congestion_index_roll_mean_15m"), mean);
    assert_close(row.get("congestion_index_roll_std_15m"), variance.sqrt());
}

#[test]
fn disruption_flags_follow_the_event_interval() {
    let registry = registry();
    let engine = FeatureEngine::new(FeatureConfig::default()).expect("engine");
    let ten_am = START_TS_MS + 10 * HOUR_MS;
    let disruptions = vec![DisruptionEvent {
        target: DisruptionTarget::Road("a40".to_string()),
        start_ts_ms_utc: ten_am,
        end_ts_ms_utc: Some(ten_am + 30 * MINUTE_MS),
        severity: 4.0,
    }];

    let at = |entity_id: &str, ts: i64| {
        engine
            .compute(
                &registry,
                &FeatureWindow {
                    entity_id,
                    as_of_ts_ms_utc: ts,
                    observations: &[],
                    disruptions: &disruptions,
                },
            )
            .expect("row")
    };

    let during = at("p1", ten_am + 15 * MINUTE_MS);
    assert_eq!(during.get("disruption_active"), Some(1.0));
    assert_eq!(during.get("disruption_severity"), Some(4.0));

    let after = at("p1", ten_am + 45 * MINUTE_MS);
    assert_eq!(after.get("disruption_active"), Some(0.0));
    assert_eq!(after.get("disruption_severity"), Some(0.0));

    let other_road = at("p2", ten_am + 15 * MINUTE_MS);
    assert_eq!(other_road.get("disruption_active"), Some(0.0));
}

#[test]
fn calendar_features_use_utc_week_position() {
    let registry = registry();
    let engine = FeatureEngine::new(FeatureConfig::default()).expect("engine");
    let row = engine
        .compute(
            &registry,
            &FeatureWindow {
                entity_id: "p1",
                as_of_ts_ms_utc: START_TS_MS,
                observations: &[],
                disruptions: &[],
            },
        )
        .expect("row");

    assert_eq!(row.get("hour_of_day"), Some(0.0));
    assert_eq!(row.get("day_of_week"), Some(2.0));
    assert_eq!(row.get("is_weekend"), Some(0.0));
    let angle = 2.0 * PI * 2.0 / 7.0;
    assert_close(row.get("tow_sin"), angle.sin());
    assert_close(row.get("tow_cos"), angle.cos());

    let saturday = engine
        .compute(
            &registry,
            &FeatureWindow {
                entity_id: "p1",
                as_of_ts_ms_utc: START_TS_MS + 3 * 24 * HOUR_MS + 8 * HOUR_MS,
                observations: &[],
                disruptions: &[],
            },
        )
        .expect("row");
    assert_eq!(saturday.get("day_of_week"), Some(5.0));
    assert_eq!(saturday.get("hour_of_day"), Some(8.0));
    assert_eq!(saturday.get("is_weekend"), Some(1.0));
}

#[test]
fn same_timestamp_sources_merge_field_by_field() {
    let registry = registry();
    let engine = FeatureEngine::new(FeatureConfig::default()).expect("engine");
    let t = START_TS_MS + HOUR_MS;

    let speeds = Observation {
        source_tag: "flow_a".to_string(),
        ..flow("p1", t, 30.0, 40.0)
    };
    let travel = Observation {
        entity_id: "p1".to_string(),
        ts_ms_utc: t,
        metrics: RawMetrics {
            current_speed: Some(10.0),
            travel_time: Some(95.0),
            free_flow_travel_time: Some(60.0),
            ..RawMetrics::default()
        },
        source_tag: "flow_b".to_string(),
    };

    let forward = vec![speeds.clone(), travel.clone()];
    let reversed = vec![travel, speeds];
    let compute = |observations: &[Observation]| {
        engine
            .compute(
                &registry,
                &FeatureWindow {
                    entity_id: "p1",
                    as_of_ts_ms_utc: t,
                    observations,
                    disruptions: &[],
                },
            )
            .expect("row")
    };

    let row = compute(&forward);
    assert_close(row.get("speed_ratio"), 0.75);
    assert_close(row.get("delay_seconds"), 35.0);
    assert_eq!(row.canonical_bytes(), compute(&reversed).canonical_bytes());
}

#[test]
fn future_observations_never_change_a_row() {
    let registry = registry();
    let engine = FeatureEngine::new(FeatureConfig::default()).expect("engine");
    let t = START_TS_MS + 2 * HOUR_MS;

    let past = minute_series("p1", t, 70);
    let mut with_future = past.clone();
    with_future.extend((1..=30).map(|k| flow("p1", t + k * MINUTE_MS, 5.0, 40.0)));

    let compute = |observations: &[Observation]| {
        engine
            .compute(
                &registry,
                &FeatureWindow {
                    entity_id: "p1",
                    as_of_ts_ms_utc: t,
                    observations,
                    disruptions: &[],
                },
            )
            .expect("row")
    };

    let a = compute(&past);
    let b = compute(&with_future);
    assert_eq!(a.canonical_bytes(), b.canonical_bytes());
    assert_eq!(a.digest(), b.digest());
}

#[test]
fn backfill_and_runtime_rows_are_byte_identical() {
    let registry = registry();
    let engine = FeatureEngine::new(FeatureConfig::default()).expect("engine");
    let end = START_TS_MS + 3 * HOUR_MS;

    let mut history = minute_series("p1", end, 150);
    history.retain(|obs| (obs.ts_ms_utc / MINUTE_MS) % 11 != 0);
    let disruptions = vec![DisruptionEvent {
        target: DisruptionTarget::Entity("p1".to_string()),
        start_ts_ms_utc: START_TS_MS + 2 * HOUR_MS,
        end_ts_ms_utc: None,
        severity: 2.0,
    }];

    let offline = engine
        .compute_for_backfill(
            &registry,
            "p1",
            &history,
            &disruptions,
            START_TS_MS + HOUR_MS,
            end + MINUTE_MS,
        )
        .expect("backfill rows");
    assert!(!offline.is_empty());
    assert!(offline.iter().all(|row| row.ts_ms_utc >= START_TS_MS + HOUR_MS));

    for row in &offline {
        let visible: Vec<Observation> = history
            .iter()
            .filter(|obs| obs.ts_ms_utc <= row.ts_ms_utc)
            .cloned()
            .collect();
        let online = engine
            .compute_for_runtime(
                &registry,
                &FeatureWindow {
                    entity_id: "p1",
                    as_of_ts_ms_utc: row.ts_ms_utc,
                    observations: &visible,
                    disruptions: &disruptions,
                },
            )
            .expect("runtime row");
        assert_eq!(row.canonical_bytes(), online.canonical_bytes());
    }
}

#[test]
fn unknown_entities_and_unaligned_times_are_rejected() {
    let registry = registry();
    let engine = FeatureEngine::new(FeatureConfig::default()).expect("engine");

    let err = engine
        .compute(
            &registry,
            &FeatureWindow {
                entity_id: "ghost",
                as_of_ts_ms_utc: START_TS_MS,
                observations: &[],
                disruptions: &[],
            },
        )
        .expect_err("unknown entity");
    assert_eq!(err, FeatureError::UnknownEntity("ghost".to_string()));

    let err = engine
        .compute(
            &registry,
            &FeatureWindow {
                entity_id: "p1",
                as_of_ts_ms_utc: START_TS_MS + 1_500,
                observations: &[],
                disruptions: &[],
            },
        )
        .expect_err("unaligned");
    assert!(matches!(err, FeatureError::UnalignedTimestamp { .. }));

    let foreign = vec![flow("p2", START_TS_MS, 10.0, 40.0)];
    let err = engine
        .compute(
            &registry,
            &FeatureWindow {
                entity_id: "p1",
                as_of_ts_ms_utc: START_TS_MS,
                observations: &foreign,
                disruptions: &[],
            },
        )
        .expect_err("foreign observation");
    assert!(matches!(err, FeatureError::ForeignObservation { .. }));
}

#[test]
fn static_features_carry_point_coordinates() {
    let registry = registry();
    let engine = FeatureEngine::new(FeatureConfig::default()).expect("engine");
    let row = engine.compute_static(&registry, "p2").expect("static row");
    assert_eq!(row.ts_ms_utc, 0);
    assert_eq!(row.get("latitude"), Some(51.4));
    assert_eq!(row.get("longitude"), Some(-0.3));
}
