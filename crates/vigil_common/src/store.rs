//! Incident store - SQLite-backed pipeline state.
//!
//! Three tables:
//! - incidents: current state per (host, alert-type) pair, PK incident_key
//! - alert_audit: append-only trail, PK short hash of the mail message id
//! - scheduler_state: single-row sliding-window cursor
//!
//! Every operation is one statement (or one statement per key), so per-key
//! atomicity comes from SQLite itself; no cross-incident locking exists.

use chrono::{Local, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;

use crate::error::VigilError;
use crate::signal::{AlertType, Severity};

/// Default database path.
pub const STORE_DB_PATH: &str = "/var/lib/vigil/vigil.db";

/// Ticket placeholder written by the consumer for a queued P1.
pub const PENDING_P1: &str = "PENDING_P1";
/// Ticket placeholder written by the consumer for a queued P2.
pub const PENDING_P2: &str = "PENDING_P2";
/// Ticket placeholder written by the escalation sweeper, kept distinct so
/// the write path that queued the ticket stays identifiable.
pub const QUEUED_P1: &str = "P1_TICKET_QUEUED";

/// Current state of one tracked incident. Never deleted; lifecycle is soft
/// via `is_active`.
#[derive(Debug, Clone)]
pub struct IncidentState {
    pub incident_key: String,
    /// Derived from the key (everything before the final `_TYPE` suffix).
    pub host: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub first_seen: NaiveDateTime,
    pub last_seen: NaiveDateTime,
    /// Ticket id or pending placeholder. Set once, never cleared by the
    /// routine update paths.
    pub ticket_id: Option<String>,
    pub is_active: bool,
    pub flip_count: i64,
}

impl IncidentState {
    /// When the last Info-to-Critical flip happened. Flips are applied
    /// together with a `last_seen` refresh and there is no separate
    /// column, so `last_seen` is the flip clock.
    pub fn last_flip(&self) -> NaiveDateTime {
        self.last_seen
    }
}

/// Short, stable audit key for a source message id.
pub fn short_message_id(message_id: &str) -> String {
    if message_id.is_empty() {
        return "unknown".to_string();
    }
    hex::encode(Sha256::digest(message_id.as_bytes()))[..10].to_string()
}

/// SQLite-backed incident store. The mutex makes the handle shareable
/// with the async loops; every operation is one short statement, so
/// contention is not a concern.
pub struct IncidentStore {
    conn: Mutex<Connection>,
}

impl IncidentStore {
    /// Open (or create) the store at `path` and ensure the schema exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, VigilError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path_ref)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        init_schema_on(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create all tables and indexes if they don't exist. Idempotent.
    pub fn init_schema(&self) -> Result<(), VigilError> {
        let conn = self.conn.lock().unwrap();
        init_schema_on(&conn)
    }

    /// Drop and recreate all tables. For vigilctl only.
    pub fn reset_schema(&self) -> Result<(), VigilError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            DROP TABLE IF EXISTS alert_audit;
            DROP TABLE IF EXISTS incidents;
            DROP TABLE IF EXISTS scheduler_state;
            "#,
        )?;
        init_schema_on(&conn)
    }

    // ------------------------------------------------------------------
    // Incidents
    // ------------------------------------------------------------------

    /// Fetch the record for an incident key, active or not. Resolved
    /// incidents stay visible so recoveries and reactivations can see
    /// prior flip history.
    pub fn get(&self, incident_key: &str) -> Result<Option<IncidentState>, VigilError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT incident_key, type, severity, first_seen, last_seen,
                    ticket_id, is_active, flip_count
             FROM incidents WHERE incident_key = ?1",
        )?;
        let state = stmt
            .query_row(params![incident_key], row_to_state)
            .optional()?;
        Ok(state)
    }

    /// Insert a fresh record, or on conflict overwrite first_seen,
    /// last_seen and severity and force the incident active again.
    pub fn create_or_refresh(
        &self,
        incident_key: &str,
        alert_type: AlertType,
        severity: Severity,
        ts: NaiveDateTime,
    ) -> Result<(), VigilError> {
        self.conn.lock().unwrap().execute(
            "INSERT INTO incidents
                 (incident_key, type, severity, first_seen, last_seen, is_active, flip_count)
             VALUES (?1, ?2, ?3, ?4, ?4, 1, 0)
             ON CONFLICT(incident_key) DO UPDATE SET
                 first_seen = excluded.first_seen,
                 last_seen  = excluded.last_seen,
                 severity   = excluded.severity,
                 is_active  = 1",
            params![incident_key, alert_type.as_str(), severity.as_str(), ts],
        )?;
        Ok(())
    }

    /// Routine update: refresh last_seen, fill ticket/severity if provided
    /// (never nulled here), optionally increment the flip counter.
    pub fn apply_update(
        &self,
        incident_key: &str,
        ts: NaiveDateTime,
        ticket_id: Option<&str>,
        severity: Option<Severity>,
        increment_flip: bool,
    ) -> Result<(), VigilError> {
        self.conn.lock().unwrap().execute(
            "UPDATE incidents
             SET last_seen  = ?2,
                 ticket_id  = COALESCE(?3, ticket_id),
                 severity   = COALESCE(?4, severity),
                 is_active  = 1,
                 flip_count = flip_count + ?5
             WHERE incident_key = ?1",
            params![
                incident_key,
                ts,
                ticket_id,
                severity.map(|s| s.as_str()),
                increment_flip as i64,
            ],
        )?;
        Ok(())
    }

    /// Mark a recovery. The incident only deactivates if it never flapped;
    /// a device with flip history stays active for the sweep and the flap
    /// rule even after it reports healthy.
    pub fn record_resolution(
        &self,
        incident_key: &str,
        ts: NaiveDateTime,
        severity: Severity,
    ) -> Result<(), VigilError> {
        self.conn.lock().unwrap().execute(
            "UPDATE incidents
             SET severity  = ?2,
                 last_seen = ?3,
                 is_active = (flip_count > 0)
             WHERE incident_key = ?1",
            params![incident_key, severity.as_str(), ts],
        )?;
        Ok(())
    }

    /// Active critical reachability incidents with no ticket yet; the
    /// escalation sweeper's candidates.
    pub fn unticketed_critical_reachability(
        &self,
    ) -> Result<Vec<(String, NaiveDateTime)>, VigilError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT incident_key, first_seen
             FROM incidents
             WHERE is_active = 1
               AND type = 'REACHABILITY'
               AND severity = 'Critical'
               AND (ticket_id IS NULL OR ticket_id = '')",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut candidates = Vec::new();
        for row in rows {
            candidates.push(row?);
        }
        Ok(candidates)
    }

    /// Stamp a pending-ticket marker on an incident.
    pub fn assign_pending_ticket(
        &self,
        incident_key: &str,
        marker: &str,
    ) -> Result<(), VigilError> {
        self.conn.lock().unwrap().execute(
            "UPDATE incidents SET ticket_id = ?2 WHERE incident_key = ?1",
            params![incident_key, marker],
        )?;
        Ok(())
    }

    /// All currently active incidents, most recently seen first.
    pub fn active_incidents(&self) -> Result<Vec<IncidentState>, VigilError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT incident_key, type, severity, first_seen, last_seen,
                    ticket_id, is_active, flip_count
             FROM incidents
             WHERE is_active = 1
             ORDER BY last_seen DESC",
        )?;
        let rows = stmt.query_map([], row_to_state)?;
        let mut incidents = Vec::new();
        for row in rows {
            incidents.push(row?);
        }
        Ok(incidents)
    }

    // ------------------------------------------------------------------
    // Audit trail
    // ------------------------------------------------------------------

    /// Append one audit row, keyed by the short hash of the source message
    /// id. Returns false when the row already existed, which is the
    /// redelivery guard for the trail.
    #[allow(clippy::too_many_arguments)]
    pub fn record_audit(
        &self,
        message_id: &str,
        incident_key: &str,
        alert_type: AlertType,
        severity: Severity,
        trap_time: NaiveDateTime,
        subject: &str,
        action_taken: &str,
    ) -> Result<bool, VigilError> {
        let changed = self.conn.lock().unwrap().execute(
            "INSERT OR IGNORE INTO alert_audit
                 (message_id, incident_key, type, severity, trap_time, subject, action_taken)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                short_message_id(message_id),
                incident_key,
                alert_type.as_str(),
                severity.as_str(),
                trap_time,
                subject,
                action_taken,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Number of audit rows recorded for one incident.
    pub fn audit_count(&self, incident_key: &str) -> Result<i64, VigilError> {
        let count = self.conn.lock().unwrap().query_row(
            "SELECT COUNT(*) FROM alert_audit WHERE incident_key = ?1",
            params![incident_key],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Scheduler cursor
    // ------------------------------------------------------------------

    /// Right edge of the last completed sliding window. An empty table
    /// reads as "now": a fresh deployment starts from the present instead
    /// of replaying the whole mailbox.
    pub fn last_processed_time(&self) -> Result<NaiveDateTime, VigilError> {
        let cursor = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT last_processed_time FROM scheduler_state
                 ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor.unwrap_or_else(|| Local::now().naive_local()))
    }

    /// Advance the cursor. Called exactly once per completed cycle.
    pub fn set_last_processed_time(&self, ts: NaiveDateTime) -> Result<(), VigilError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE scheduler_state
             SET last_processed_time = ?1,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = (SELECT id FROM scheduler_state ORDER BY id DESC LIMIT 1)",
            params![ts],
        )?;
        if updated == 0 {
            conn.execute(
                "INSERT INTO scheduler_state (last_processed_time) VALUES (?1)",
                params![ts],
            )?;
        }
        Ok(())
    }

    /// Wipe and reseed the cursor. For vigilctl only.
    pub fn reset_cursor(&self, ts: NaiveDateTime) -> Result<(), VigilError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM scheduler_state", [])?;
        conn.execute(
            "INSERT INTO scheduler_state (last_processed_time) VALUES (?1)",
            params![ts],
        )?;
        Ok(())
    }
}

fn init_schema_on(conn: &Connection) -> Result<(), VigilError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS alert_audit (
            message_id   TEXT PRIMARY KEY,
            incident_key TEXT NOT NULL,
            type         TEXT,
            severity     TEXT,
            trap_time    TIMESTAMP,
            subject      TEXT,
            action_taken TEXT,
            created_at   TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_audit_incident_key
            ON alert_audit(incident_key);

        CREATE TABLE IF NOT EXISTS incidents (
            incident_key TEXT PRIMARY KEY,
            type         TEXT,
            severity     TEXT,
            first_seen   TIMESTAMP,
            last_seen    TIMESTAMP,
            ticket_id    TEXT,
            is_active    INTEGER DEFAULT 1,
            flip_count   INTEGER DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_incidents_active
            ON incidents(is_active);

        CREATE TABLE IF NOT EXISTS scheduler_state (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            last_processed_time TIMESTAMP NOT NULL,
            updated_at          TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );
        "#,
    )?;
    Ok(())
}

fn row_to_state(row: &Row<'_>) -> rusqlite::Result<IncidentState> {
    let incident_key: String = row.get(0)?;
    let host = incident_key
        .rsplit_once('_')
        .map(|(host, _)| host.to_string())
        .unwrap_or_else(|| incident_key.clone());
    let alert_type: String = row.get(1)?;
    let severity: String = row.get(2)?;

    Ok(IncidentState {
        host,
        incident_key,
        alert_type: AlertType::parse(&alert_type),
        severity: Severity::parse(&severity),
        first_seen: row.get(3)?,
        last_seen: row.get(4)?,
        ticket_id: row.get(5)?,
        is_active: row.get::<_, i64>(6)? != 0,
        flip_count: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::ALERT_TIME_FORMAT;
    use tempfile::NamedTempFile;

    fn test_store() -> (NamedTempFile, IncidentStore) {
        let tmp = NamedTempFile::new().unwrap();
        let store = IncidentStore::open(tmp.path()).unwrap();
        (tmp, store)
    }

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, ALERT_TIME_FORMAT).unwrap()
    }

    #[test]
    fn test_get_missing_incident() {
        let (_tmp, store) = test_store();
        assert!(store.get("SW01_REACHABILITY").unwrap().is_none());
    }

    #[test]
    fn test_create_and_get() {
        let (_tmp, store) = test_store();
        store
            .create_or_refresh(
                "SW01_REACHABILITY",
                AlertType::Reachability,
                Severity::Critical,
                ts("2026-02-11 10:00:00"),
            )
            .unwrap();

        let state = store.get("SW01_REACHABILITY").unwrap().unwrap();
        assert_eq!(state.host, "SW01");
        assert_eq!(state.alert_type, AlertType::Reachability);
        assert_eq!(state.severity, Severity::Critical);
        assert_eq!(state.first_seen, ts("2026-02-11 10:00:00"));
        assert!(state.is_active);
        assert_eq!(state.flip_count, 0);
        assert!(state.ticket_id.is_none());
    }

    #[test]
    fn test_refresh_overwrites_and_reactivates() {
        let (_tmp, store) = test_store();
        store
            .create_or_refresh(
                "SW01_REACHABILITY",
                AlertType::Reachability,
                Severity::Critical,
                ts("2026-02-11 10:00:00"),
            )
            .unwrap();
        store
            .record_resolution("SW01_REACHABILITY", ts("2026-02-11 10:05:00"), Severity::Info)
            .unwrap();
        assert!(!store.get("SW01_REACHABILITY").unwrap().unwrap().is_active);

        store
            .create_or_refresh(
                "SW01_REACHABILITY",
                AlertType::Reachability,
                Severity::Critical,
                ts("2026-02-11 11:00:00"),
            )
            .unwrap();
        let state = store.get("SW01_REACHABILITY").unwrap().unwrap();
        assert!(state.is_active);
        assert_eq!(state.first_seen, ts("2026-02-11 11:00:00"));
        assert_eq!(state.severity, Severity::Critical);
    }

    #[test]
    fn test_apply_update_fills_but_never_clears_ticket() {
        let (_tmp, store) = test_store();
        store
            .create_or_refresh(
                "SW01_REACHABILITY",
                AlertType::Reachability,
                Severity::Critical,
                ts("2026-02-11 10:00:00"),
            )
            .unwrap();

        store
            .apply_update(
                "SW01_REACHABILITY",
                ts("2026-02-11 10:05:00"),
                Some(PENDING_P1),
                None,
                false,
            )
            .unwrap();
        let state = store.get("SW01_REACHABILITY").unwrap().unwrap();
        assert_eq!(state.ticket_id.as_deref(), Some(PENDING_P1));

        // A later update without a ticket must not null the existing one.
        store
            .apply_update(
                "SW01_REACHABILITY",
                ts("2026-02-11 10:10:00"),
                None,
                Some(Severity::Info),
                false,
            )
            .unwrap();
        let state = store.get("SW01_REACHABILITY").unwrap().unwrap();
        assert_eq!(state.ticket_id.as_deref(), Some(PENDING_P1));
        assert_eq!(state.severity, Severity::Info);
        assert_eq!(state.last_seen, ts("2026-02-11 10:10:00"));
    }

    #[test]
    fn test_flip_counter_increments() {
        let (_tmp, store) = test_store();
        store
            .create_or_refresh(
                "SW01_REACHABILITY",
                AlertType::Reachability,
                Severity::Info,
                ts("2026-02-11 10:00:00"),
            )
            .unwrap();

        store
            .apply_update(
                "SW01_REACHABILITY",
                ts("2026-02-11 10:05:00"),
                None,
                Some(Severity::Critical),
                true,
            )
            .unwrap();
        store
            .apply_update(
                "SW01_REACHABILITY",
                ts("2026-02-11 10:10:00"),
                None,
                Some(Severity::Critical),
                true,
            )
            .unwrap();

        let state = store.get("SW01_REACHABILITY").unwrap().unwrap();
        assert_eq!(state.flip_count, 2);
    }

    #[test]
    fn test_resolution_deactivation_gated_on_flip_count() {
        let (_tmp, store) = test_store();

        // Never flapped: recovery deactivates.
        store
            .create_or_refresh(
                "A_REACHABILITY",
                AlertType::Reachability,
                Severity::Critical,
                ts("2026-02-11 10:00:00"),
            )
            .unwrap();
        store
            .record_resolution("A_REACHABILITY", ts("2026-02-11 10:05:00"), Severity::Info)
            .unwrap();
        assert!(!store.get("A_REACHABILITY").unwrap().unwrap().is_active);

        // Flapped once: recovery keeps it active.
        store
            .create_or_refresh(
                "B_REACHABILITY",
                AlertType::Reachability,
                Severity::Info,
                ts("2026-02-11 10:00:00"),
            )
            .unwrap();
        store
            .apply_update(
                "B_REACHABILITY",
                ts("2026-02-11 10:02:00"),
                None,
                Some(Severity::Critical),
                true,
            )
            .unwrap();
        store
            .record_resolution("B_REACHABILITY", ts("2026-02-11 10:05:00"), Severity::Info)
            .unwrap();
        let state = store.get("B_REACHABILITY").unwrap().unwrap();
        assert!(state.is_active);
        assert_eq!(state.severity, Severity::Info);
    }

    #[test]
    fn test_audit_dedup_leaves_one_row() {
        let (_tmp, store) = test_store();
        let write = |_i: u32| {
            store.record_audit(
                "AAQkADAwATM3ZmYAZS05Nz...",
                "SW01_REACHABILITY",
                AlertType::Reachability,
                Severity::Critical,
                ts("2026-02-11 10:00:00"),
                "Alarm: SW01(x) [Critical] unreachable",
                "WAIT",
            )
        };
        assert!(write(1).unwrap());
        assert!(!write(2).unwrap());
        assert_eq!(store.audit_count("SW01_REACHABILITY").unwrap(), 1);
    }

    #[test]
    fn test_short_message_id_is_stable_and_short() {
        let a = short_message_id("some-long-entry-id");
        let b = short_message_id("some-long-entry-id");
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        assert_eq!(short_message_id(""), "unknown");
        assert_ne!(short_message_id("x"), short_message_id("y"));
    }

    #[test]
    fn test_sweeper_candidate_filter() {
        let (_tmp, store) = test_store();
        let t = ts("2026-02-11 10:00:00");

        store
            .create_or_refresh("A_REACHABILITY", AlertType::Reachability, Severity::Critical, t)
            .unwrap();
        // Wrong type.
        store
            .create_or_refresh("B_DISK", AlertType::Disk, Severity::Critical, t)
            .unwrap();
        // Wrong severity.
        store
            .create_or_refresh("C_REACHABILITY", AlertType::Reachability, Severity::Info, t)
            .unwrap();
        // Already ticketed.
        store
            .create_or_refresh("D_REACHABILITY", AlertType::Reachability, Severity::Critical, t)
            .unwrap();
        store
            .apply_update("D_REACHABILITY", t, Some(PENDING_P1), None, false)
            .unwrap();
        // Inactive.
        store
            .create_or_refresh("E_REACHABILITY", AlertType::Reachability, Severity::Critical, t)
            .unwrap();
        store
            .record_resolution("E_REACHABILITY", t, Severity::Critical)
            .unwrap();

        let candidates = store.unticketed_critical_reachability().unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0, "A_REACHABILITY");

        // Assigning the marker empties the candidate list: the sweep is
        // idempotent by construction.
        store
            .assign_pending_ticket("A_REACHABILITY", QUEUED_P1)
            .unwrap();
        assert!(store.unticketed_critical_reachability().unwrap().is_empty());
    }

    #[test]
    fn test_cursor_roundtrip_and_reset() {
        let (_tmp, store) = test_store();

        store
            .set_last_processed_time(ts("2026-02-11 10:00:00"))
            .unwrap();
        assert_eq!(
            store.last_processed_time().unwrap(),
            ts("2026-02-11 10:00:00")
        );

        // Update path (row already exists).
        store
            .set_last_processed_time(ts("2026-02-11 10:15:00"))
            .unwrap();
        assert_eq!(
            store.last_processed_time().unwrap(),
            ts("2026-02-11 10:15:00")
        );

        store.reset_cursor(ts("2026-02-10 00:00:00")).unwrap();
        assert_eq!(
            store.last_processed_time().unwrap(),
            ts("2026-02-10 00:00:00")
        );
    }

    #[test]
    fn test_empty_cursor_reads_as_roughly_now() {
        let (_tmp, store) = test_store();
        let cursor = store.last_processed_time().unwrap();
        let now = Local::now().naive_local();
        assert!((now - cursor).num_seconds().abs() < 5);
    }

    #[test]
    fn test_active_incident_listing() {
        let (_tmp, store) = test_store();
        store
            .create_or_refresh(
                "A_REACHABILITY",
                AlertType::Reachability,
                Severity::Critical,
                ts("2026-02-11 10:00:00"),
            )
            .unwrap();
        store
            .create_or_refresh(
                "B_DISK",
                AlertType::Disk,
                Severity::Critical,
                ts("2026-02-11 11:00:00"),
            )
            .unwrap();
        store
            .record_resolution("A_REACHABILITY", ts("2026-02-11 11:30:00"), Severity::Info)
            .unwrap();

        let active = store.active_incidents().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].incident_key, "B_DISK");
    }

    #[test]
    fn test_reset_schema_wipes_data() {
        let (_tmp, store) = test_store();
        store
            .create_or_refresh(
                "A_REACHABILITY",
                AlertType::Reachability,
                Severity::Critical,
                ts("2026-02-11 10:00:00"),
            )
            .unwrap();
        store.reset_schema().unwrap();
        assert!(store.get("A_REACHABILITY").unwrap().is_none());
    }
}
