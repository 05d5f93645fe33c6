//! Prediction sinks: an in-memory buffer and an append-only CSV file.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub entity_id: String,
    pub generated_at_ts_ms_utc: i64,
    pub horizon_minutes: u32,
    pub predicted_value: f64,
    pub model_version: String,
    pub schema_version: u32,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("sink lock poisoned")]
    LockPoisoned,
}

pub trait PredictionSink: Send + Sync {
    fn publish(&self, rows: &[PredictionRow]) -> Result<(), PublishError>;
}

#[derive(Debug, Default)]
pub struct InMemoryPredictionSink {
    rows: Mutex<Vec<PredictionRow>>,
}

impl InMemoryPredictionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<PredictionRow> {
        self.rows
            .lock()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }
}

impl PredictionSink for InMemoryPredictionSink {
    fn publish(&self, rows: &[PredictionRow]) -> Result<(), PublishError> {
        let mut stored = self.rows.lock().map_err(|_| PublishError::LockPoisoned)?;
        stored.extend_from_slice(rows);
        Ok(())
    }
}

#[derive(Debug)]
pub struct CsvPredictionSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CsvPredictionSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PredictionSink for CsvPredictionSink {
    fn publish(&self, rows: &[PredictionRow]) -> Result<(), PublishError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| PublishError::LockPoisoned)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let is_new = std::fs::metadata(&self.path)
            .map(|meta| meta.len() == 0)
            .unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;

        info!(
            component = "publish",
            event = "publish.csv.appended",
            path = %self.path.display(),
            rows = rows.len()
        );
        Ok(())
    }
}

pub fn read_predictions_csv(path: &Path) -> Result<Vec<PredictionRow>, PublishError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}
