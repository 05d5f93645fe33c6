//! Versioned feature store and the point-in-time join.
//!
//! Rows are keyed by `(group, entity_id, schema_version, ts_ms_utc)` and never
//! change once written. Each group is registered with a schema version and
//! the fingerprint of the feature definition that produced its rows; every
//! read names the version it expects.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, RwLock};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::features::{FeatureRow, FeatureSchema};
use crate::normalize::EntityRegistry;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("feature group {0} is not registered")]
    UnknownGroup(String),
    #[error("unknown entity_id: {0}")]
    UnknownEntity(String),
    #[error("schema version mismatch for group {group}: expected {expected}, got {actual}")]
    SchemaVersionMismatch {
        group: String,
        expected: u32,
        actual: u32,
    },
    #[error("schema fingerprint mismatch for group {group}: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch {
        group: String,
        expected: String,
        actual: String,
    },
    #[error("row {group}/{entity_id}@{ts_ms_utc} v{schema_version} already exists with different values")]
    ImmutableRowConflict {
        group: String,
        entity_id: String,
        ts_ms_utc: i64,
        schema_version: u32,
    },
    #[error("column {column} is provided by both {first_group} and {second_group}")]
    ColumnConflict {
        column: String,
        first_group: String,
        second_group: String,
    },
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("row encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRegistration {
    pub version: u32,
    pub fingerprint: String,
}

pub trait FeatureStore: Send + Sync {
    fn register_group(&self, group: &str, version: u32, fingerprint: &str) -> Result<(), StoreError>;

    fn group_registration(&self, group: &str) -> Result<Option<GroupRegistration>, StoreError>;

    fn write(&self, group: &str, row: &FeatureRow) -> Result<WriteOutcome, StoreError>;

    fn latest_at_or_before(
        &self,
        group: &str,
        entity_id: &str,
        version: u32,
        ts_ms_utc: i64,
    ) -> Result<Option<FeatureRow>, StoreError>;
}

type RowKey = (String, String, u32);

#[derive(Default)]
struct MemoryState {
    groups: HashMap<String, GroupRegistration>,
    rows: HashMap<RowKey, BTreeMap<i64, FeatureRow>>,
}

#[derive(Default)]
pub struct InMemoryFeatureStore {
    state: RwLock<MemoryState>,
}

impl InMemoryFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FeatureStore for InMemoryFeatureStore {
    fn register_group(&self, group: &str, version: u32, fingerprint: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::LockPoisoned)?;
        let registration = GroupRegistration {
            version,
            fingerprint: fingerprint.to_string(),
        };
        let previous = state.groups.insert(group.to_string(), registration.clone());
        log_group_registered(group, &registration, previous.as_ref());
        Ok(())
    }

    fn group_registration(&self, group: &str) -> Result<Option<GroupRegistration>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(state.groups.get(group).cloned())
    }

    fn write(&self, group: &str, row: &FeatureRow) -> Result<WriteOutcome, StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::LockPoisoned)?;
        let version = state
            .groups
            .get(group)
            .map(|registered| registered.version)
            .ok_or_else(|| StoreError::UnknownGroup(group.to_string()))?;
        check_row_version(group, version, row)?;

        let key = (group.to_string(), row.entity_id.clone(), row.schema_version);
        let series = state.rows.entry(key).or_default();
        match series.get(&row.ts_ms_utc) {
            Some(existing) => compare_existing(group, existing, row),
            None => {
                series.insert(row.ts_ms_utc, row.clone());
                Ok(WriteOutcome::Inserted)
            }
        }
    }

    fn latest_at_or_before(
        &self,
        group: &str,
        entity_id: &str,
        version: u32,
        ts_ms_utc: i64,
    ) -> Result<Option<FeatureRow>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::LockPoisoned)?;
        let key = (group.to_string(), entity_id.to_string(), version);
        Ok(state
            .rows
            .get(&key)
            .and_then(|series| series.range(..=ts_ms_utc).next_back())
            .map(|(_, row)| row.clone()))
    }
}

pub struct SqliteFeatureStore {
    conn: Mutex<Connection>,
}

impl SqliteFeatureStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        ensure_schema(&conn)?;

        info!(
            component = "store",
            event = "store.opened",
            path = %path.display()
        );
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl FeatureStore for SqliteFeatureStore {
    fn register_group(&self, group: &str, version: u32, fingerprint: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let previous = read_group_registration(&conn, group)?;
        conn.execute(
            "
            INSERT INTO feature_groups (group_name, version, fingerprint) VALUES (?1, ?2, ?3)
            ON CONFLICT(group_name) DO UPDATE SET
                version = excluded.version,
                fingerprint = excluded.fingerprint
            ",
            params![group, version, fingerprint],
        )?;
        let registration = GroupRegistration {
            version,
            fingerprint: fingerprint.to_string(),
        };
        log_group_registered(group, &registration, previous.as_ref());
        Ok(())
    }

    fn group_registration(&self, group: &str) -> Result<Option<GroupRegistration>, StoreError> {
        let conn = self.lock()?;
        read_group_registration(&conn, group)
    }

    fn write(&self, group: &str, row: &FeatureRow) -> Result<WriteOutcome, StoreError> {
        let mut conn = self.lock()?;
        let version = read_group_registration(&conn, group)?
            .map(|registered| registered.version)
            .ok_or_else(|| StoreError::UnknownGroup(group.to_string()))?;
        check_row_version(group, version, row)?;

        let tx = conn.transaction()?;
        let existing: Option<String> = tx
            .query_row(
                "
                SELECT values_json
                FROM feature_rows
                WHERE group_name = ?1
                  AND entity_id = ?2
                  AND schema_version = ?3
                  AND ts_ms_utc = ?4
                ",
                params![group, row.entity_id, row.schema_version, row.ts_ms_utc],
                |r| r.get(0),
            )
            .optional()?;

        let outcome = match existing {
            Some(values_json) => {
                let existing_row = FeatureRow {
                    entity_id: row.entity_id.clone(),
                    ts_ms_utc: row.ts_ms_utc,
                    schema_version: row.schema_version,
                    values: serde_json::from_str(&values_json)?,
                };
                compare_existing(group, &existing_row, row)?
            }
            None => {
                tx.execute(
                    "
                    INSERT INTO feature_rows (
                        group_name,
                        entity_id,
                        schema_version,
                        ts_ms_utc,
                        values_json
                    ) VALUES (?1, ?2, ?3, ?4, ?5)
                    ",
                    params![
                        group,
                        row.entity_id,
                        row.schema_version,
                        row.ts_ms_utc,
                        serde_json::to_string(&row.values)?,
                    ],
                )?;
                WriteOutcome::Inserted
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    fn latest_at_or_before(
        &self,
        group: &str,
        entity_id: &str,
        version: u32,
        ts_ms_utc: i64,
    ) -> Result<Option<FeatureRow>, StoreError> {
        let conn = self.lock()?;
        let found: Option<(i64, String)> = conn
            .query_row(
                "
                SELECT ts_ms_utc, values_json
                FROM feature_rows
                WHERE group_name = ?1
                  AND entity_id = ?2
                  AND schema_version = ?3
                  AND ts_ms_utc <= ?4
                ORDER BY ts_ms_utc DESC
                LIMIT 1
                ",
                params![group, entity_id, version, ts_ms_utc],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        match found {
            Some((row_ts, values_json)) => Ok(Some(FeatureRow {
                entity_id: entity_id.to_string(),
                ts_ms_utc: row_ts,
                schema_version: version,
                values: serde_json::from_str(&values_json)?,
            })),
            None => Ok(None),
        }
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS feature_groups (
            group_name TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            fingerprint TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS feature_rows (
            group_name TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            schema_version INTEGER NOT NULL,
            ts_ms_utc INTEGER NOT NULL,
            values_json TEXT NOT NULL,
            PRIMARY KEY (group_name, entity_id, schema_version, ts_ms_utc)
        ) WITHOUT ROWID;
        ",
    )?;
    Ok(())
}

fn read_group_registration(
    conn: &Connection,
    group: &str,
) -> Result<Option<GroupRegistration>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT version, fingerprint FROM feature_groups WHERE group_name = ?1",
            params![group],
            |r| {
                Ok(GroupRegistration {
                    version: r.get(0)?,
                    fingerprint: r.get(1)?,
                })
            },
        )
        .optional()?)
}

pub fn ensure_group_registered(
    store: &dyn FeatureStore,
    group: &str,
    schema: &FeatureSchema,
) -> Result<(), StoreError> {
    match store.group_registration(group)? {
        Some(registered) => check_registration(group, &registered, schema),
        None => store.register_group(group, schema.version, &schema.fingerprint),
    }
}

fn check_registration(
    group: &str,
    registered: &GroupRegistration,
    schema: &FeatureSchema,
) -> Result<(), StoreError> {
    if registered.version != schema.version {
        return Err(StoreError::SchemaVersionMismatch {
            group: group.to_string(),
            expected: schema.version,
            actual: registered.version,
        });
    }
    if registered.fingerprint != schema.fingerprint {
        return Err(StoreError::SchemaFingerprintMismatch {
            group: group.to_string(),
            expected: schema.fingerprint.clone(),
            actual: registered.fingerprint.clone(),
        });
    }
    Ok(())
}

fn check_row_version(group: &str, version: u32, row: &FeatureRow) -> Result<(), StoreError> {
    if row.schema_version != version {
        return Err(StoreError::SchemaVersionMismatch {
            group: group.to_string(),
            expected: version,
            actual: row.schema_version,
        });
    }
    Ok(())
}

fn compare_existing(
    group: &str,
    existing: &FeatureRow,
    incoming: &FeatureRow,
) -> Result<WriteOutcome, StoreError> {
    if existing.canonical_bytes() == incoming.canonical_bytes() {
        return Ok(WriteOutcome::Unchanged);
    }
    warn!(
        component = "store",
        event = "store.write.conflict",
        group,
        entity_id = %incoming.entity_id,
        ts_ms_utc = incoming.ts_ms_utc,
        schema_version = incoming.schema_version
    );
    Err(StoreError::ImmutableRowConflict {
        group: group.to_string(),
        entity_id: incoming.entity_id.clone(),
        ts_ms_utc: incoming.ts_ms_utc,
        schema_version: incoming.schema_version,
    })
}

fn log_group_registered(
    group: &str,
    registration: &GroupRegistration,
    previous: Option<&GroupRegistration>,
) {
    match previous {
        Some(previous) if previous != registration => info!(
            component = "store",
            event = "store.group.version_changed",
            group,
            previous = previous.version,
            version = registration.version,
            fingerprint = %registration.fingerprint
        ),
        Some(_) => {}
        None => info!(
            component = "store",
            event = "store.group.registered",
            group,
            version = registration.version,
            fingerprint = %registration.fingerprint
        ),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingGroupRow {
    pub entity_id: String,
    pub group: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinResult {
    pub reference_ts_ms_utc: i64,
    pub rows: Vec<FeatureRow>,
    pub missing: Vec<MissingGroupRow>,
}

// The merged row carries the timestamp of the newest contributing row.
pub fn point_in_time_join(
    store: &dyn FeatureStore,
    schema: &FeatureSchema,
    registry: &EntityRegistry,
    entity_ids: &[String],
    reference_ts_ms_utc: i64,
) -> Result<JoinResult, StoreError> {
    let groups = schema.group_names();
    for group in &groups {
        match store.group_registration(group)? {
            Some(registered) => check_registration(group, &registered, schema)?,
            None => return Err(StoreError::UnknownGroup(group.clone())),
        }
    }

    let mut column_owner: HashMap<&str, &str> = HashMap::new();
    for column in &schema.columns {
        if let Some(first) = column_owner.insert(column.name.as_str(), column.group.as_str()) {
            return Err(StoreError::ColumnConflict {
                column: column.name.clone(),
                first_group: first.to_string(),
                second_group: column.group.clone(),
            });
        }
    }

    let mut rows = Vec::with_capacity(entity_ids.len());
    let mut missing = Vec::new();
    for entity_id in entity_ids {
        if !registry.contains(entity_id) {
            return Err(StoreError::UnknownEntity(entity_id.clone()));
        }

        let mut values = BTreeMap::new();
        let mut newest_ts: Option<i64> = None;
        let mut complete = true;
        for group in &groups {
            let found = store.latest_at_or_before(
                group,
                entity_id,
                schema.version,
                reference_ts_ms_utc,
            )?;
            let Some(row) = found else {
                complete = false;
                missing.push(MissingGroupRow {
                    entity_id: entity_id.clone(),
                    group: group.clone(),
                });
                continue;
            };
            newest_ts = Some(newest_ts.map_or(row.ts_ms_utc, |ts| ts.max(row.ts_ms_utc)));
            for column in schema.columns_in_group(group) {
                values.insert(column.name.clone(), row.get(&column.name));
            }
        }

        if complete {
            rows.push(FeatureRow {
                entity_id: entity_id.clone(),
                ts_ms_utc: newest_ts.unwrap_or(reference_ts_ms_utc),
                schema_version: schema.version,
                values,
            });
        }
    }

    debug!(
        component = "store",
        event = "store.join.completed",
        reference_ts_ms_utc,
        groups = groups.len(),
        rows = rows.len(),
        missing = missing.len()
    );

    Ok(JoinResult {
        reference_ts_ms_utc,
        rows,
        missing,
    })
}
