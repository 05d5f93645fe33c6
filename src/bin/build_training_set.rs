use std::path::PathBuf;

use tracing::info;
use traffic_forecast::{
    build_training_set, evaluate, init_logging, log_app_start, logging_config_from_env,
    pipeline_config_from_env, read_flow_csv, read_records_jsonl, write_examples_csv,
    BackfillPlan, BackfillRange, EntityRegistry, FeatureEngine, Normalizer, ObservationLog,
    PersistenceModel, SqliteFeatureStore, CONGESTION_INDEX,
};

// Usage: `build_training_set <input>...`. `.jsonl` inputs hold kind-tagged
// records; anything else is read as a flow CSV.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("build_training_set", &logging_cfg);

    let inputs: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if inputs.is_empty() {
        return Err("usage: build_training_set <flow.csv|records.jsonl>...".into());
    }

    let cfg = pipeline_config_from_env()?;
    let registry = EntityRegistry::from_csv_path(&cfg.points_path)?;
    let engine = FeatureEngine::new(cfg.feature_config())?;
    let store = SqliteFeatureStore::open(&cfg.store_path)?;

    let normalizer = Normalizer::new(&registry, engine.config().sample_interval_ms())?;
    let mut log = ObservationLog::new();
    for input in &inputs {
        let is_jsonl = input
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("jsonl"))
            .unwrap_or(false);
        let records = if is_jsonl {
            read_records_jsonl(input)?
        } else {
            read_flow_csv(input)?
        };
        let report = log.ingest(&normalizer, &records);
        info!(
            component = "build_training_set",
            event = "input.ingested",
            path = %input.display(),
            accepted = report.accepted,
            replaced = report.replaced,
            rejected = report.rejected
        );
    }

    let labels = cfg.label_config();
    let split = cfg.split_config();
    let plan = BackfillPlan {
        registry: &registry,
        engine: &engine,
        store: &store,
        labels: &labels,
        split: &split,
        range: BackfillRange::unbounded(),
    };
    let training = build_training_set(&plan, &log)?;

    let train_path = cfg.training_dir.join("train.csv");
    let validation_path = cfg.training_dir.join("validation.csv");
    write_examples_csv(&train_path, &training.schema, &training.split.train)?;
    write_examples_csv(&validation_path, &training.schema, &training.split.validation)?;

    if !training.split.validation.is_empty() {
        let baseline = PersistenceModel::new(training.schema.version);
        let usable: Vec<_> = training
            .split
            .validation
            .iter()
            .filter(|example| example.features.get(CONGESTION_INDEX).is_some())
            .cloned()
            .collect();
        if !usable.is_empty() {
            let report = evaluate(&baseline, &usable)?;
            info!(
                component = "build_training_set",
                event = "baseline.validation",
                count = report.count,
                mae = report.mae,
                rmse = report.rmse
            );
        }
    }

    info!(
        component = "build_training_set",
        event = "output.written",
        train_path = %train_path.display(),
        validation_path = %validation_path.display(),
        train = training.split.train.len(),
        validation = training.split.validation.len(),
        schema_fingerprint = %training.schema.fingerprint
    );
    Ok(())
}
