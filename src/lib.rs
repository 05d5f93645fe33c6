//! Short-horizon road congestion forecasting core.
//!
//! Raw flow, weather and disruption records are normalized per monitoring
//! point, turned into point-in-time feature rows by one shared transform, and
//! served through a versioned feature store to both offline training-set
//! construction and the scheduled inference cycle.

mod backfill;
mod config;
mod features;
mod labels;
mod model;
mod normalize;
mod observability;
mod orchestrator;
mod publish;
mod source;
mod split;
mod store;

pub use backfill::{
    build_training_set, read_flow_csv, read_records_jsonl, write_examples_csv, BackfillError,
    BackfillPlan, BackfillRange, TrainingSet,
};
pub use config::{pipeline_config_from_env, ConfigError, PipelineConfig};
pub use features::{
    build_feature_schema, congestion_index, congestion_series,
    delay_seconds, speed_ratio, FeatureColumn, FeatureConfig, FeatureDType, FeatureEngine,
    FeatureError, FeatureRow, FeatureSchema, FeatureWindow, RollingWindow, CONGESTION_INDEX,
    DYNAMIC_FEATURE_GROUP, FEATURE_SCHEMA_VERSION, STATIC_FEATURE_GROUP,
};
pub use labels::{generate_labels, trainable_examples, LabelConfig, LabelError, LabelRow, TrainingExample};
pub use model::{
    evaluate, EvaluationReport, LinearHorizon, LinearModel, ModelArtifact, ModelError,
    PersistenceModel,
};
pub use normalize::{
    floor_to_interval, DisruptionEvent, DisruptionTarget, EntityRegistry, IngestReport,
    NormalizeError, Normalized, Normalizer, Observation, ObservationLog, PointMetadata,
    RawDisruptionRecord, RawFlowRecord, RawMetrics, RawRecord, RawSeverity, RawWeatherRecord,
    RegistryError, DEFAULT_SAMPLE_INTERVAL_MS,
};
pub use observability::{
    init_logging, log_app_start, log_cycle_deferred, log_cycle_phase, log_entity_failed,
    logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError,
};
pub use orchestrator::{
    CycleError, CyclePhase, CycleResult, EntityFailure, InferenceOrchestrator,
    OrchestratorSettings,
};
pub use publish::{
    read_predictions_csv, CsvPredictionSink, InMemoryPredictionSink, PredictionRow,
    PredictionSink, PublishError,
};
pub use source::{
    fetch_with_retry, HttpFetcher, HttpJsonSource, ReqwestBlockingFetcher, RetryPolicy,
    SourceError, StaticRecordSource, UpstreamSource,
};
pub use split::{time_split, SplitConfig, SplitCutoff, SplitError, SplitResult};
pub use store::{
    ensure_group_registered, point_in_time_join, FeatureStore, GroupRegistration,
    InMemoryFeatureStore, JoinResult, MissingGroupRow, SqliteFeatureStore, StoreError,
    WriteOutcome,
};
