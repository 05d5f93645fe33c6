use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use traffic_forecast::{
    init_logging, log_app_start, logging_config_from_env, pipeline_config_from_env,
    CsvPredictionSink, EntityRegistry, FeatureEngine, FeatureStore, HttpJsonSource,
    InferenceOrchestrator, LinearModel, ModelArtifact, OrchestratorSettings, PersistenceModel,
    PredictionSink, SqliteFeatureStore, UpstreamSource,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("inference_scheduler", &logging_cfg);

    let cfg = pipeline_config_from_env()?;
    let source_url = cfg
        .source_url
        .clone()
        .ok_or("TRAFFIC_SOURCE_URL must be set for the inference scheduler")?;

    let registry = EntityRegistry::from_csv_path(&cfg.points_path)?;
    let engine = FeatureEngine::new(cfg.feature_config())?;
    let source: Arc<dyn UpstreamSource> =
        Arc::new(HttpJsonSource::new(source_url, cfg.fetch_timeout_ms)?);
    let store: Arc<dyn FeatureStore> = Arc::new(SqliteFeatureStore::open(&cfg.store_path)?);
    let model: Arc<dyn ModelArtifact> = match &cfg.model_path {
        Some(path) => Arc::new(LinearModel::from_json_path(path)?),
        None => Arc::new(PersistenceModel::new(cfg.schema_version)),
    };
    let sink: Arc<dyn PredictionSink> = Arc::new(CsvPredictionSink::new(&cfg.predictions_path));

    info!(
        component = "inference_scheduler",
        event = "scheduler.configured",
        entities = registry.len(),
        cycle_interval_minutes = cfg.cycle_interval_minutes,
        model_version = model.model_version(),
        schema_version = engine.schema().version,
        schema_fingerprint = %engine.schema().fingerprint
    );

    let orchestrator = Arc::new(InferenceOrchestrator::new(
        registry,
        engine,
        source,
        store,
        model,
        sink,
        OrchestratorSettings {
            horizons_minutes: cfg.horizons_minutes.clone(),
            retry: cfg.retry_policy(),
        },
    ));

    let mut ticker = tokio::time::interval(Duration::from_secs(
        u64::from(cfg.cycle_interval_minutes) * 60,
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let orchestrator = Arc::clone(&orchestrator);
                let now_ts_ms_utc = Utc::now().timestamp_millis();
                let outcome =
                    tokio::task::spawn_blocking(move || orchestrator.run_cycle(now_ts_ms_utc)).await?;
                if let Err(err) = outcome {
                    error!(
                        component = "inference_scheduler",
                        event = "scheduler.cycle_failed",
                        trigger_ts_ms_utc = now_ts_ms_utc,
                        error = %err
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(component = "inference_scheduler", event = "scheduler.shutdown");
                break;
            }
        }
    }

    Ok(())
}
