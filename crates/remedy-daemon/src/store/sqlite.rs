//! SQLite-backed [`IncidentStore`].
//!
//! One connection behind a mutex; the engine serializes per-incident
//! status mutation through the store's compare-and-swap, so connection
//! contention is the only throughput bound and incident volume is low.
//!
//! Timestamps are stored as `INTEGER` epoch nanoseconds; the u64/i64
//! conversion happens at the SQL boundary and surfaces as a backend
//! error rather than wrapping. `provider_data` and event detail are
//! stored as JSON text.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};

use remedy_core::clock::now_ns;
use remedy_core::error::StoreError;
use remedy_core::incident::{
    Incident, IncidentEvent, IncidentEventKind, IncidentStatus, Severity,
};
use remedy_core::store::{IncidentStore, OutcomePatch};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS incidents (
    id              TEXT PRIMARY KEY,
    service_name    TEXT NOT NULL,
    repository      TEXT NOT NULL,
    error_message   TEXT NOT NULL,
    stack_trace     TEXT,
    severity        TEXT NOT NULL,
    provider        TEXT NOT NULL,
    provider_data   TEXT NOT NULL,
    run_id          TEXT,
    pr_url          TEXT,
    diagnosis       TEXT,
    status          TEXT NOT NULL,
    created_at_ns   INTEGER NOT NULL,
    updated_at_ns   INTEGER NOT NULL,
    triggered_at_ns INTEGER,
    completed_at_ns INTEGER
);
CREATE INDEX IF NOT EXISTS idx_incidents_dedup
    ON incidents (service_name, updated_at_ns);
CREATE INDEX IF NOT EXISTS idx_incidents_run_id
    ON incidents (run_id);
CREATE TABLE IF NOT EXISTS incident_events (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    incident_id   TEXT NOT NULL,
    kind          TEXT NOT NULL,
    detail        TEXT NOT NULL,
    created_at_ns INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_incident_events_incident
    ON incident_events (incident_id);
";

const INCIDENT_COLUMNS: &str = "id, service_name, repository, error_message, stack_trace, \
     severity, provider, provider_data, run_id, pr_url, diagnosis, status, \
     created_at_ns, updated_at_ns, triggered_at_ns, completed_at_ns";

/// SQLite-backed incident store.
#[derive(Debug, Clone)]
pub struct SqliteIncidentStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteIncidentStore {
    /// Opens (or creates) the database at `path` and ensures the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the database cannot be opened
    /// or migrated.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Backend(format!("failed to open incident db: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::Backend(format!("failed to enable WAL: {e}")))?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory database, for tests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the database cannot be opened.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Backend(format!("failed to open in-memory db: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Backend(format!("failed to create incident schema: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Backend(format!("incident db lock poisoned: {e}")))
    }
}

fn ns_to_sql(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::Backend(format!("timestamp {value} exceeds i64 range")))
}

fn opt_ns_to_sql(value: Option<u64>) -> Result<Option<i64>, StoreError> {
    value.map(ns_to_sql).transpose()
}

fn conversion_failure(
    index: usize,
    message: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

fn row_to_incident(row: &Row<'_>) -> rusqlite::Result<Incident> {
    let severity: String = row.get(5)?;
    let provider_data: String = row.get(7)?;
    let provider_data: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&provider_data)
            .map_err(|e| conversion_failure(7, format!("malformed provider_data json: {e}")))?;
    let status: String = row.get(11)?;
    let status = IncidentStatus::from_str(&status)
        .map_err(|e| conversion_failure(11, e.to_string()))?;

    let created_at_ns: i64 = row.get(12)?;
    let updated_at_ns: i64 = row.get(13)?;
    let triggered_at_ns: Option<i64> = row.get(14)?;
    let completed_at_ns: Option<i64> = row.get(15)?;

    Ok(Incident {
        id: row.get(0)?,
        service_name: row.get(1)?,
        repository: row.get(2)?,
        error_message: row.get(3)?,
        stack_trace: row.get(4)?,
        severity: Severity::parse(&severity),
        provider: row.get(6)?,
        provider_data,
        run_id: row.get(8)?,
        pr_url: row.get(9)?,
        diagnosis: row.get(10)?,
        status,
        created_at_ns: created_at_ns.unsigned_abs(),
        updated_at_ns: updated_at_ns.unsigned_abs(),
        triggered_at_ns: triggered_at_ns.map(i64::unsigned_abs),
        completed_at_ns: completed_at_ns.map(i64::unsigned_abs),
    })
}

fn incident_params(
    incident: &Incident,
) -> Result<
    (
        String,
        Option<i64>,
        Option<i64>,
        i64,
        i64,
    ),
    StoreError,
> {
    let provider_data = serde_json::to_string(&incident.provider_data)
        .map_err(|e| StoreError::Backend(format!("failed to serialize provider_data: {e}")))?;
    Ok((
        provider_data,
        opt_ns_to_sql(incident.triggered_at_ns)?,
        opt_ns_to_sql(incident.completed_at_ns)?,
        ns_to_sql(incident.created_at_ns)?,
        ns_to_sql(incident.updated_at_ns)?,
    ))
}

impl IncidentStore for SqliteIncidentStore {
    fn create(&self, incident: &Incident) -> Result<(), StoreError> {
        let (provider_data, triggered_at, completed_at, created_at, updated_at) =
            incident_params(incident)?;
        let conn = self.lock()?;
        let result = conn.execute(
            "INSERT INTO incidents (id, service_name, repository, error_message, stack_trace,
                 severity, provider, provider_data, run_id, pr_url, diagnosis, status,
                 created_at_ns, updated_at_ns, triggered_at_ns, completed_at_ns)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                incident.id,
                incident.service_name,
                incident.repository,
                incident.error_message,
                incident.stack_trace,
                incident.severity.as_str(),
                incident.provider,
                provider_data,
                incident.run_id,
                incident.pr_url,
                incident.diagnosis,
                incident.status.as_str(),
                created_at,
                updated_at,
                triggered_at,
                completed_at,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::AlreadyExists(incident.id.clone()))
            },
            Err(e) => Err(StoreError::Backend(format!(
                "failed to insert incident {}: {e}",
                incident.id
            ))),
        }
    }

    fn get(&self, id: &str) -> Result<Incident, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?1"),
            params![id],
            row_to_incident,
        )
        .optional()
        .map_err(|e| StoreError::Backend(format!("failed to load incident {id}: {e}")))?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn update(&self, incident: &Incident) -> Result<(), StoreError> {
        let (provider_data, triggered_at, completed_at, _created_at, updated_at) =
            incident_params(incident)?;
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE incidents SET
                     service_name = ?2, repository = ?3, error_message = ?4,
                     stack_trace = ?5, severity = ?6, provider = ?7, provider_data = ?8,
                     run_id = ?9, pr_url = ?10, diagnosis = ?11, status = ?12,
                     updated_at_ns = ?13, triggered_at_ns = ?14, completed_at_ns = ?15
                 WHERE id = ?1",
                params![
                    incident.id,
                    incident.service_name,
                    incident.repository,
                    incident.error_message,
                    incident.stack_trace,
                    incident.severity.as_str(),
                    incident.provider,
                    provider_data,
                    incident.run_id,
                    incident.pr_url,
                    incident.diagnosis,
                    incident.status.as_str(),
                    updated_at,
                    triggered_at,
                    completed_at,
                ],
            )
            .map_err(|e| {
                StoreError::Backend(format!("failed to update incident {}: {e}", incident.id))
            })?;
        if changed == 0 {
            return Err(StoreError::NotFound(incident.id.clone()));
        }
        Ok(())
    }

    fn touch(&self, id: &str, updated_at_ns: u64) -> Result<(), StoreError> {
        let updated_at = ns_to_sql(updated_at_ns)?;
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE incidents SET updated_at_ns = ?2 WHERE id = ?1",
                params![id, updated_at],
            )
            .map_err(|e| StoreError::Backend(format!("failed to touch incident {id}: {e}")))?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn set_outcome(
        &self,
        id: &str,
        expected: IncidentStatus,
        patch: &OutcomePatch,
        updated_at_ns: u64,
    ) -> Result<(), StoreError> {
        let updated_at = ns_to_sql(updated_at_ns)?;
        let conn = self.lock()?;
        // COALESCE keeps the stored value for every None field; the
        // status guard matches update_status.
        let changed = conn
            .execute(
                "UPDATE incidents SET
                     run_id = COALESCE(?3, run_id),
                     pr_url = COALESCE(?4, pr_url),
                     diagnosis = COALESCE(?5, diagnosis),
                     updated_at_ns = ?6
                 WHERE id = ?1 AND status = ?2",
                params![
                    id,
                    expected.as_str(),
                    patch.run_id,
                    patch.pr_url,
                    patch.diagnosis,
                    updated_at,
                ],
            )
            .map_err(|e| StoreError::Backend(format!("failed to set outcome of {id}: {e}")))?;
        if changed > 0 {
            return Ok(());
        }

        let actual: Option<String> = conn
            .query_row(
                "SELECT status FROM incidents WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Backend(format!("failed to read status of {id}: {e}")))?;
        match actual {
            None => Err(StoreError::NotFound(id.to_string())),
            Some(actual) => {
                let actual = IncidentStatus::from_str(&actual)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                Err(StoreError::StatusConflict {
                    incident_id: id.to_string(),
                    expected,
                    actual,
                })
            },
        }
    }

    fn update_status(
        &self,
        id: &str,
        expected: IncidentStatus,
        incident: &Incident,
    ) -> Result<(), StoreError> {
        let (provider_data, triggered_at, completed_at, _created_at, updated_at) =
            incident_params(incident)?;
        let conn = self.lock()?;
        // Guarded write: only takes effect while the stored status still
        // matches what the caller observed.
        let changed = conn
            .execute(
                "UPDATE incidents SET
                     status = ?3, run_id = ?4, pr_url = ?5, diagnosis = ?6,
                     provider_data = ?7, updated_at_ns = ?8,
                     triggered_at_ns = ?9, completed_at_ns = ?10
                 WHERE id = ?1 AND status = ?2",
                params![
                    id,
                    expected.as_str(),
                    incident.status.as_str(),
                    incident.run_id,
                    incident.pr_url,
                    incident.diagnosis,
                    provider_data,
                    updated_at,
                    triggered_at,
                    completed_at,
                ],
            )
            .map_err(|e| StoreError::Backend(format!("failed to update status of {id}: {e}")))?;
        if changed > 0 {
            return Ok(());
        }

        let actual: Option<String> = conn
            .query_row(
                "SELECT status FROM incidents WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Backend(format!("failed to read status of {id}: {e}")))?;
        match actual {
            None => Err(StoreError::NotFound(id.to_string())),
            Some(actual) => {
                let actual = IncidentStatus::from_str(&actual)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                Err(StoreError::StatusConflict {
                    incident_id: id.to_string(),
                    expected,
                    actual,
                })
            },
        }
    }

    fn list(&self) -> Result<Vec<Incident>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {INCIDENT_COLUMNS} FROM incidents ORDER BY created_at_ns DESC"
            ))
            .map_err(|e| StoreError::Backend(format!("failed to prepare list query: {e}")))?;
        let rows = stmt
            .query_map([], row_to_incident)
            .map_err(|e| StoreError::Backend(format!("failed to list incidents: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| StoreError::Backend(format!("failed to decode incident row: {e}")))
    }

    fn find_by_run_id(&self, run_id: &str) -> Result<Option<Incident>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE run_id = ?1"),
            params![run_id],
            row_to_incident,
        )
        .optional()
        .map_err(|e| StoreError::Backend(format!("failed to look up run id {run_id}: {e}")))
    }

    fn find_duplicate(
        &self,
        service_name: &str,
        error_message: &str,
        window: Duration,
    ) -> Result<Option<Incident>, StoreError> {
        let window_ns = u64::try_from(window.as_nanos()).unwrap_or(u64::MAX);
        let cutoff = ns_to_sql(now_ns().saturating_sub(window_ns))?;
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {INCIDENT_COLUMNS} FROM incidents
                 WHERE service_name = ?1
                   AND error_message = ?2
                   AND status NOT IN ('resolved', 'no_fix_needed')
                   AND updated_at_ns >= ?3
                 ORDER BY updated_at_ns DESC
                 LIMIT 1"
            ),
            params![service_name, error_message, cutoff],
            row_to_incident,
        )
        .optional()
        .map_err(|e| StoreError::Backend(format!("failed duplicate lookup for {service_name}: {e}")))
    }

    fn append_event(&self, event: &IncidentEvent) -> Result<(), StoreError> {
        let detail = serde_json::to_string(&event.detail)
            .map_err(|e| StoreError::Backend(format!("failed to serialize event detail: {e}")))?;
        let created_at = ns_to_sql(event.created_at_ns)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO incident_events (incident_id, kind, detail, created_at_ns)
             VALUES (?1, ?2, ?3, ?4)",
            params![event.incident_id, event.kind.as_str(), detail, created_at],
        )
        .map_err(|e| {
            StoreError::Backend(format!(
                "failed to append {} event for {}: {e}",
                event.kind, event.incident_id
            ))
        })?;
        Ok(())
    }

    fn events_for(&self, incident_id: &str) -> Result<Vec<IncidentEvent>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT incident_id, kind, detail, created_at_ns
                 FROM incident_events
                 WHERE incident_id = ?1
                 ORDER BY seq ASC",
            )
            .map_err(|e| StoreError::Backend(format!("failed to prepare events query: {e}")))?;
        let rows = stmt
            .query_map(params![incident_id], |row| {
                let kind: String = row.get(1)?;
                let kind = IncidentEventKind::from_str(&kind)
                    .map_err(|e| conversion_failure(1, e.to_string()))?;
                let detail: String = row.get(2)?;
                let detail = serde_json::from_str(&detail)
                    .map_err(|e| conversion_failure(2, format!("malformed detail json: {e}")))?;
                let created_at_ns: i64 = row.get(3)?;
                Ok(IncidentEvent {
                    incident_id: row.get(0)?,
                    kind,
                    detail,
                    created_at_ns: created_at_ns.unsigned_abs(),
                })
            })
            .map_err(|e| StoreError::Backend(format!("failed to query events: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| StoreError::Backend(format!("failed to decode event row: {e}")))
    }
}
