//! Pluggable model artifacts and offline evaluation.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::features::{FeatureRow, CONGESTION_INDEX};
use crate::labels::TrainingExample;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model {model_version} needs schema v{required}, row has v{actual}")]
    SchemaVersionMismatch {
        model_version: String,
        required: u32,
        actual: u32,
    },
    #[error("feature {feature} is absent for {entity_id}@{ts_ms_utc}")]
    MissingFeature {
        feature: String,
        entity_id: String,
        ts_ms_utc: i64,
    },
    #[error("model {model_version} has no coefficients for horizon {horizon_minutes}m")]
    UnsupportedHorizon {
        model_version: String,
        horizon_minutes: u32,
    },
    #[error("no examples to evaluate")]
    EmptyEvaluation,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

pub trait ModelArtifact: Send + Sync {
    fn model_version(&self) -> &str;

    fn required_schema_version(&self) -> u32;

    // `None` when the model reads nothing beyond the version-fixed base columns.
    fn required_schema_fingerprint(&self) -> Option<&str>;

    fn predict(&self, row: &FeatureRow, horizon_minutes: u32) -> Result<f64, ModelError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceModel {
    pub model_version: String,
    pub schema_version: u32,
}

impl PersistenceModel {
    pub fn new(schema_version: u32) -> Self {
        Self {
            model_version: format!("persistence-v{schema_version}"),
            schema_version,
        }
    }
}

impl ModelArtifact for PersistenceModel {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn required_schema_version(&self) -> u32 {
        self.schema_version
    }

    fn required_schema_fingerprint(&self) -> Option<&str> {
        None
    }

    fn predict(&self, row: &FeatureRow, _horizon_minutes: u32) -> Result<f64, ModelError> {
        check_row_schema(self, row)?;
        required_feature(row, CONGESTION_INDEX)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearHorizon {
    pub intercept: f64,
    pub weights: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub model_version: String,
    pub schema_version: u32,
    pub schema_fingerprint: String,
    pub horizons: BTreeMap<u32, LinearHorizon>,
}

impl LinearModel {
    pub fn from_json_path(path: &Path) -> Result<Self, ModelError> {
        let reader = BufReader::new(File::open(path)?);
        let model: Self = serde_json::from_reader(reader)?;
        info!(
            component = "model",
            event = "model.loaded",
            path = %path.display(),
            model_version = %model.model_version,
            schema_version = model.schema_version,
            schema_fingerprint = %model.schema_fingerprint,
            horizons = ?model.horizons.keys().collect::<Vec<_>>()
        );
        Ok(model)
    }
}

impl ModelArtifact for LinearModel {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn required_schema_version(&self) -> u32 {
        self.schema_version
    }

    fn required_schema_fingerprint(&self) -> Option<&str> {
        Some(&self.schema_fingerprint)
    }

    fn predict(&self, row: &FeatureRow, horizon_minutes: u32) -> Result<f64, ModelError> {
        check_row_schema(self, row)?;
        let coefficients =
            self.horizons
                .get(&horizon_minutes)
                .ok_or_else(|| ModelError::UnsupportedHorizon {
                    model_version: self.model_version.clone(),
                    horizon_minutes,
                })?;

        let mut total = coefficients.intercept;
        for (feature, weight) in &coefficients.weights {
            total += weight * required_feature(row, feature)?;
        }
        Ok(total.clamp(0.0, 1.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub count: usize,
    pub mae: f64,
    pub rmse: f64,
}

pub fn evaluate(
    model: &dyn ModelArtifact,
    examples: &[TrainingExample],
) -> Result<EvaluationReport, ModelError> {
    if examples.is_empty() {
        return Err(ModelError::EmptyEvaluation);
    }

    let mut abs_sum = 0.0;
    let mut sq_sum = 0.0;
    for example in examples {
        let predicted = model.predict(&example.features, example.horizon_minutes)?;
        let err = predicted - example.target_value;
        abs_sum += err.abs();
        sq_sum += err * err;
    }

    let n = examples.len() as f64;
    let report = EvaluationReport {
        count: examples.len(),
        mae: abs_sum / n,
        rmse: (sq_sum / n).sqrt(),
    };
    info!(
        component = "model",
        event = "model.evaluated",
        model_version = model.model_version(),
        count = report.count,
        mae = report.mae,
        rmse = report.rmse
    );
    Ok(report)
}

fn check_row_schema(model: &dyn ModelArtifact, row: &FeatureRow) -> Result<(), ModelError> {
    if row.schema_version != model.required_schema_version() {
        return Err(ModelError::SchemaVersionMismatch {
            model_version: model.model_version().to_string(),
            required: model.required_schema_version(),
            actual: row.schema_version,
        });
    }
    Ok(())
}

fn required_feature(row: &FeatureRow, feature: &str) -> Result<f64, ModelError> {
    row.get(feature).ok_or_else(|| ModelError::MissingFeature {
        feature: feature.to_string(),
        entity_id: row.entity_id.clone(),
        ts_ms_utc: row.ts_ms_utc,
    })
}
