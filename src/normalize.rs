//! Raw signal normalization: heterogeneous source records into observations
//! and disruption events for a closed set of monitoring points.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_SAMPLE_INTERVAL_MS: i64 = 60_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointMetadata {
    #[serde(alias = "point_id")]
    pub entity_id: String,
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lon")]
    pub longitude: f64,
    #[serde(default, alias = "road")]
    pub road_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityRegistry {
    points: BTreeMap<String, PointMetadata>,
    roads: HashMap<String, BTreeSet<String>>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("duplicate entity_id in registry: {0}")]
    DuplicateEntity(String),
    #[error("entity_id must not be empty")]
    EmptyEntityId,
}

impl EntityRegistry {
    pub fn new(points: impl IntoIterator<Item = PointMetadata>) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        for point in points {
            registry.insert(point)?;
        }
        Ok(registry)
    }

    // Loads a points file with the header
    // `entity_id,latitude,longitude,road_id` (`point_id,lat,lon,road` is
    // also accepted).
    pub fn from_csv_path(path: &Path) -> Result<Self, RegistryError> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut registry = Self::default();
        for record in reader.deserialize() {
            let point: PointMetadata = record?;
            registry.insert(point)?;
        }

        info!(
            component = "normalize",
            event = "registry.loaded",
            path = %path.display(),
            entity_count = registry.len()
        );
        Ok(registry)
    }

    fn insert(&mut self, mut point: PointMetadata) -> Result<(), RegistryError> {
        point.entity_id = point.entity_id.trim().to_string();
        if point.entity_id.is_empty() {
            return Err(RegistryError::EmptyEntityId);
        }
        point.road_id = point
            .road_id
            .map(|road| road.trim().to_ascii_lowercase())
            .filter(|road| !road.is_empty());

        if self.points.contains_key(&point.entity_id) {
            return Err(RegistryError::DuplicateEntity(point.entity_id));
        }
        if let Some(road) = &point.road_id {
            self.roads
                .entry(road.clone())
                .or_default()
                .insert(point.entity_id.clone());
        }
        self.points.insert(point.entity_id.clone(), point);
        Ok(())
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.points.contains_key(entity_id)
    }

    pub fn knows_road(&self, road_id: &str) -> bool {
        self.roads.contains_key(&road_id.to_ascii_lowercase())
    }

    pub fn point(&self, entity_id: &str) -> Option<&PointMetadata> {
        self.points.get(entity_id)
    }

    pub fn road_of(&self, entity_id: &str) -> Option<&str> {
        self.points
            .get(entity_id)
            .and_then(|point| point.road_id.as_deref())
    }

    pub fn entity_ids(&self) -> Vec<String> {
        self.points.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMetrics {
    pub current_speed: Option<f64>,
    pub free_flow_speed: Option<f64>,
    pub travel_time: Option<f64>,
    pub free_flow_travel_time: Option<f64>,
    pub confidence: Option<f64>,
    pub temperature_c: Option<f64>,
    pub precipitation_mm: Option<f64>,
}

impl RawMetrics {
    pub fn fill_missing_from(&mut self, other: &RawMetrics) {
        self.current_speed = self.current_speed.or(other.current_speed);
        self.free_flow_speed = self.free_flow_speed.or(other.free_flow_speed);
        self.travel_time = self.travel_time.or(other.travel_time);
        self.free_flow_travel_time = self.free_flow_travel_time.or(other.free_flow_travel_time);
        self.confidence = self.confidence.or(other.confidence);
        self.temperature_c = self.temperature_c.or(other.temperature_c);
        self.precipitation_mm = self.precipitation_mm.or(other.precipitation_mm);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub entity_id: String,
    pub ts_ms_utc: i64,
    pub metrics: RawMetrics,
    pub source_tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum DisruptionTarget {
    Entity(String),
    Road(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisruptionEvent {
    pub target: DisruptionTarget,
    pub start_ts_ms_utc: i64,
    pub end_ts_ms_utc: Option<i64>,
    pub severity: f64,
}

impl DisruptionEvent {
    pub fn contains(&self, ts_ms_utc: i64) -> bool {
        ts_ms_utc >= self.start_ts_ms_utc
            && self.end_ts_ms_utc.map(|end| ts_ms_utc < end).unwrap_or(true)
    }

    pub fn applies_to(&self, entity_id: &str, road_id: Option<&str>) -> bool {
        match &self.target {
            DisruptionTarget::Entity(id) => id == entity_id,
            DisruptionTarget::Road(road) => road_id
                .map(|r| r.eq_ignore_ascii_case(road))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFlowRecord {
    pub entity_id: String,
    pub ts_ms_utc: i64,
    pub current_speed: Option<f64>,
    pub free_flow_speed: Option<f64>,
    pub current_travel_time: Option<f64>,
    pub free_flow_travel_time: Option<f64>,
    pub confidence: Option<f64>,
    pub source_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawWeatherRecord {
    pub entity_id: String,
    pub ts_ms_utc: i64,
    pub temperature_c: Option<f64>,
    pub precipitation_mm: Option<f64>,
    pub source_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawSeverity {
    Score(f64),
    Label(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDisruptionRecord {
    pub entity_id: Option<String>,
    pub road_id: Option<String>,
    pub start_ts_ms_utc: i64,
    pub end_ts_ms_utc: Option<i64>,
    pub severity: RawSeverity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawRecord {
    Flow(RawFlowRecord),
    Weather(RawWeatherRecord),
    Disruption(RawDisruptionRecord),
}

impl RawRecord {
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            Self::Flow(flow) => Some(&flow.entity_id),
            Self::Weather(weather) => Some(&weather.entity_id),
            Self::Disruption(disruption) => disruption.entity_id.as_deref(),
        }
    }

    pub fn observed_since(&self, since_ts_ms_utc: i64) -> bool {
        match self {
            Self::Flow(flow) => flow.ts_ms_utc >= since_ts_ms_utc,
            Self::Weather(weather) => weather.ts_ms_utc >= since_ts_ms_utc,
            Self::Disruption(disruption) => disruption
                .end_ts_ms_utc
                .map_or(true, |end| end > since_ts_ms_utc),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Observation(Observation),
    Disruption(DisruptionEvent),
}

#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("unknown entity_id: {0}")]
    UnknownEntity(String),
    #[error("unknown road reference: {0}")]
    UnknownGeoReference(String),
    #[error("disruption record names neither an entity nor a road")]
    MissingDisruptionTarget,
    #[error("unrecognized disruption severity: {0}")]
    InvalidSeverity(String),
    #[error("disruption ends at {end_ts_ms_utc} before it starts at {start_ts_ms_utc}")]
    InvalidInterval {
        start_ts_ms_utc: i64,
        end_ts_ms_utc: i64,
    },
    #[error("invalid sample interval: {0}ms")]
    InvalidSampleInterval(i64),
}

#[derive(Debug, Clone)]
pub struct Normalizer<'a> {
    registry: &'a EntityRegistry,
    sample_interval_ms: i64,
}

impl<'a> Normalizer<'a> {
    pub fn new(registry: &'a EntityRegistry, sample_interval_ms: i64) -> Result<Self, NormalizeError> {
        if sample_interval_ms <= 0 {
            return Err(NormalizeError::InvalidSampleInterval(sample_interval_ms));
        }
        Ok(Self {
            registry,
            sample_interval_ms,
        })
    }

    pub fn normalize(&self, record: &RawRecord) -> Result<Normalized, NormalizeError> {
        match record {
            RawRecord::Flow(flow) => {
                self.require_entity(&flow.entity_id)?;
                Ok(Normalized::Observation(Observation {
                    entity_id: flow.entity_id.clone(),
                    ts_ms_utc: floor_to_interval(flow.ts_ms_utc, self.sample_interval_ms),
                    metrics: RawMetrics {
                        current_speed: finite(flow.current_speed),
                        free_flow_speed: finite(flow.free_flow_speed),
                        travel_time: finite(flow.current_travel_time),
                        free_flow_travel_time: finite(flow.free_flow_travel_time),
                        confidence: finite(flow.confidence),
                        ..RawMetrics::default()
                    },
                    source_tag: source_tag_or(&flow.source_tag, "flow"),
                }))
            }
            RawRecord::Weather(weather) => {
                self.require_entity(&weather.entity_id)?;
                Ok(Normalized::Observation(Observation {
                    entity_id: weather.entity_id.clone(),
                    ts_ms_utc: floor_to_interval(weather.ts_ms_utc, self.sample_interval_ms),
                    metrics: RawMetrics {
                        temperature_c: finite(weather.temperature_c),
                        precipitation_mm: finite(weather.precipitation_mm),
                        ..RawMetrics::default()
                    },
                    source_tag: source_tag_or(&weather.source_tag, "weather"),
                }))
            }
            RawRecord::Disruption(disruption) => {
                let target = match (&disruption.entity_id, &disruption.road_id) {
                    (Some(entity_id), _) => {
                        self.require_entity(entity_id)?;
                        DisruptionTarget::Entity(entity_id.clone())
                    }
                    (None, Some(road_id)) => {
                        let road = road_id.trim().to_ascii_lowercase();
                        if !self.registry.knows_road(&road) {
                            return Err(NormalizeError::UnknownGeoReference(road_id.clone()));
                        }
                        DisruptionTarget::Road(road)
                    }
                    (None, None) => return Err(NormalizeError::MissingDisruptionTarget),
                };

                let start = floor_to_interval(disruption.start_ts_ms_utc, self.sample_interval_ms);
                let end = disruption
                    .end_ts_ms_utc
                    .map(|end| floor_to_interval(end, self.sample_interval_ms));
                if let Some(end) = end {
                    if end < start {
                        return Err(NormalizeError::InvalidInterval {
                            start_ts_ms_utc: start,
                            end_ts_ms_utc: end,
                        });
                    }
                }

                Ok(Normalized::Disruption(DisruptionEvent {
                    target,
                    start_ts_ms_utc: start,
                    end_ts_ms_utc: end,
                    severity: severity_score(&disruption.severity)?,
                }))
            }
        }
    }

    fn require_entity(&self, entity_id: &str) -> Result<(), NormalizeError> {
        if self.registry.contains(entity_id) {
            Ok(())
        } else {
            Err(NormalizeError::UnknownEntity(entity_id.to_string()))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub accepted: u64,
    pub replaced: u64,
    pub rejected: u64,
    pub first_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ObservationLog {
    observations: BTreeMap<(String, i64, String), Observation>,
    disruptions: Vec<DisruptionEvent>,
}

impl ObservationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_observation(&mut self, observation: Observation) -> bool {
        let key = (
            observation.entity_id.clone(),
            observation.ts_ms_utc,
            observation.source_tag.clone(),
        );
        self.observations.insert(key, observation).is_some()
    }

    pub fn insert_disruption(&mut self, event: DisruptionEvent) {
        if !self.disruptions.contains(&event) {
            self.disruptions.push(event);
        }
    }

    pub fn ingest<'r>(
        &mut self,
        normalizer: &Normalizer<'_>,
        records: impl IntoIterator<Item = &'r RawRecord>,
    ) -> IngestReport {
        let mut report = IngestReport::default();
        for record in records {
            match normalizer.normalize(record) {
                Ok(Normalized::Observation(observation)) => {
                    let key_ts = observation.ts_ms_utc;
                    if self.insert_observation(observation) {
                        report.replaced += 1;
                        debug!(
                            component = "normalize",
                            event = "normalize.duplicate_replaced",
                            entity_id = record.entity_id().unwrap_or_default(),
                            ts_ms_utc = key_ts
                        );
                    }
                    report.accepted += 1;
                }
                Ok(Normalized::Disruption(event)) => {
                    self.insert_disruption(event);
                    report.accepted += 1;
                }
                Err(err) => {
                    warn!(
                        component = "normalize",
                        event = "normalize.record_rejected",
                        entity_id = record.entity_id().unwrap_or_default(),
                        error = %err
                    );
                    report.rejected += 1;
                    if report.first_error.is_none() {
                        report.first_error = Some(err.to_string());
                    }
                }
            }
        }
        report
    }

    pub fn observations_for(&self, entity_id: &str, until_ts_ms_utc: i64) -> Vec<Observation> {
        let start = (entity_id.to_string(), i64::MIN, String::new());
        self.observations
            .range(start..)
            .take_while(|((id, _, _), _)| id == entity_id)
            .filter(|((_, ts, _), _)| *ts <= until_ts_ms_utc)
            .map(|(_, observation)| observation.clone())
            .collect()
    }

    pub fn disruptions(&self) -> &[DisruptionEvent] {
        &self.disruptions
    }

    pub fn entity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .observations
            .keys()
            .map(|(id, _, _)| id.clone())
            .collect();
        ids.dedup();
        ids
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

pub fn floor_to_interval(ts_ms_utc: i64, interval_ms: i64) -> i64 {
    ts_ms_utc.div_euclid(interval_ms) * interval_ms
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

fn source_tag_or(tag: &Option<String>, fallback: &str) -> String {
    tag.as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

fn severity_score(raw: &RawSeverity) -> Result<f64, NormalizeError> {
    match raw {
        RawSeverity::Score(score) if score.is_finite() && *score >= 0.0 => Ok(*score),
        RawSeverity::Score(score) => Err(NormalizeError::InvalidSeverity(score.to_string())),
        RawSeverity::Label(label) => match label.trim().to_ascii_lowercase().as_str() {
            "minimal" => Ok(1.0),
            "moderate" => Ok(2.0),
            "serious" => Ok(3.0),
            "severe" => Ok(4.0),
            "critical" => Ok(5.0),
            _ => Err(NormalizeError::InvalidSeverity(label.clone())),
        },
    }
}
