use crate::error::{Error, Result};
use crate::models::{
    now_iso, CheckOutcome, CheckResult, ContentChange, Heartbeat, Incident, IncidentEvent,
    IncidentEventType, IncidentStatus, MaintenanceWindow, Monitor, MonitorKind, MonitorStatus,
    Proxy, Recurrence, Status,
};
use chrono::{Datelike, NaiveDateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Durable state. A single SQLite database in WAL mode; writes are
/// serialized behind the connection mutex.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
        let store = Store { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Store { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS monitors (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                kind TEXT NOT NULL,
                target TEXT NOT NULL DEFAULT '',
                settings TEXT NOT NULL DEFAULT 'null',
                interval_seconds INTEGER NOT NULL DEFAULT 60,
                timeout_seconds INTEGER NOT NULL DEFAULT 30,
                enabled INTEGER NOT NULL DEFAULT 1,
                failure_threshold INTEGER NOT NULL DEFAULT 1,
                success_threshold INTEGER NOT NULL DEFAULT 1,
                resend_interval_seconds INTEGER NOT NULL DEFAULT 0,
                track_changes INTEGER NOT NULL DEFAULT 0,
                upside_down INTEGER NOT NULL DEFAULT 0,
                group_id TEXT,
                proxy_id TEXT,
                assertions TEXT,
                tags TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS monitor_status (
                monitor_id TEXT PRIMARY KEY REFERENCES monitors(id) ON DELETE CASCADE,
                status TEXT NOT NULL DEFAULT 'up',
                last_check_at TEXT,
                consec_successes INTEGER NOT NULL DEFAULT 0,
                consec_fails INTEGER NOT NULL DEFAULT 0,
                last_body_hash TEXT
            );

            CREATE TABLE IF NOT EXISTS check_results (
                id TEXT PRIMARY KEY,
                monitor_id TEXT NOT NULL REFERENCES monitors(id) ON DELETE CASCADE,
                status TEXT NOT NULL,
                response_time_ms INTEGER NOT NULL,
                status_code INTEGER,
                message TEXT,
                headers TEXT,
                body TEXT,
                body_hash TEXT,
                cert_expiry INTEGER,
                cert_fingerprint TEXT,
                dns_records TEXT,
                checked_at TEXT NOT NULL DEFAULT (datetime('now')),
                seq INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_check_results_monitor ON check_results(monitor_id, seq DESC);
            CREATE INDEX IF NOT EXISTS idx_check_results_checked ON check_results(checked_at);

            CREATE TABLE IF NOT EXISTS incidents (
                id TEXT PRIMARY KEY,
                monitor_id TEXT NOT NULL REFERENCES monitors(id) ON DELETE CASCADE,
                monitor_name TEXT NOT NULL,
                cause TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                acknowledged_at TEXT,
                acknowledged_by TEXT,
                resolved_at TEXT,
                resolved_by TEXT,
                seq INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_incidents_monitor ON incidents(monitor_id, seq DESC);
            CREATE INDEX IF NOT EXISTS idx_incidents_open ON incidents(monitor_id) WHERE status != 'resolved';

            CREATE TABLE IF NOT EXISTS incident_events (
                id TEXT PRIMARY KEY,
                incident_id TEXT NOT NULL REFERENCES incidents(id) ON DELETE CASCADE,
                event_type TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_incident_events_incident ON incident_events(incident_id, created_at ASC);

            CREATE TABLE IF NOT EXISTS content_changes (
                id TEXT PRIMARY KEY,
                monitor_id TEXT NOT NULL REFERENCES monitors(id) ON DELETE CASCADE,
                old_hash TEXT NOT NULL,
                new_hash TEXT NOT NULL,
                diff TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_content_changes_monitor ON content_changes(monitor_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS maintenance_windows (
                id TEXT PRIMARY KEY,
                starts_at TEXT NOT NULL,
                ends_at TEXT NOT NULL,
                recurrence TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS maintenance_monitors (
                window_id TEXT NOT NULL REFERENCES maintenance_windows(id) ON DELETE CASCADE,
                monitor_id TEXT NOT NULL REFERENCES monitors(id) ON DELETE CASCADE,
                PRIMARY KEY (window_id, monitor_id)
            );

            CREATE TABLE IF NOT EXISTS heartbeats (
                monitor_id TEXT PRIMARY KEY REFERENCES monitors(id) ON DELETE CASCADE,
                expected_interval_seconds INTEGER NOT NULL,
                last_ping_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'up'
            );

            CREATE TABLE IF NOT EXISTS proxies (
                id TEXT PRIMARY KEY,
                protocol TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT,
                password TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS daily_rollups (
                monitor_id TEXT NOT NULL REFERENCES monitors(id) ON DELETE CASCADE,
                day TEXT NOT NULL,
                total_checks INTEGER NOT NULL,
                up_checks INTEGER NOT NULL,
                degraded_checks INTEGER NOT NULL,
                down_checks INTEGER NOT NULL,
                avg_response_ms REAL,
                PRIMARY KEY (monitor_id, day)
            );
            ",
        )?;
        Ok(())
    }

    fn next_seq(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COALESCE(MAX(seq), 0) + 1 FROM {table}"), [], |r| r.get(0))
            .unwrap_or(1)
    }

    // ─── Monitors ───────────────────────────────────────────────────────────

    pub fn insert_monitor(&self, monitor: &Monitor) -> Result<()> {
        monitor.validate().map_err(Error::InvalidMonitor)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO monitors (id, name, description, kind, target, settings, interval_seconds,
                timeout_seconds, enabled, failure_threshold, success_threshold, resend_interval_seconds,
                track_changes, upside_down, group_id, proxy_id, assertions, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                monitor.id,
                monitor.name,
                monitor.description,
                monitor.kind.as_str(),
                monitor.target,
                monitor.settings.to_string(),
                monitor.interval_seconds,
                monitor.timeout_seconds,
                monitor.enabled as i32,
                monitor.failure_threshold,
                monitor.success_threshold,
                monitor.resend_interval_seconds,
                monitor.track_changes as i32,
                monitor.upside_down as i32,
                monitor.group_id,
                monitor.proxy_id,
                monitor.assertions.as_ref().map(|a| a.to_string()),
                monitor.tags.join(","),
            ],
        )?;
        // Heartbeat monitors get their ping tracker immediately; the grace
        // period until the first expected ping starts now.
        if monitor.kind == MonitorKind::Heartbeat {
            conn.execute(
                "INSERT INTO heartbeats (monitor_id, expected_interval_seconds, last_ping_at, status)
                 VALUES (?1, ?2, ?3, 'up')
                 ON CONFLICT(monitor_id) DO UPDATE SET expected_interval_seconds = excluded.expected_interval_seconds",
                params![monitor.id, monitor.interval_seconds, Utc::now().timestamp()],
            )?;
        }
        Ok(())
    }

    pub fn update_monitor(&self, monitor: &Monitor) -> Result<()> {
        monitor.validate().map_err(Error::InvalidMonitor)?;
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE monitors SET name = ?2, description = ?3, kind = ?4, target = ?5, settings = ?6,
                interval_seconds = ?7, timeout_seconds = ?8, enabled = ?9, failure_threshold = ?10,
                success_threshold = ?11, resend_interval_seconds = ?12, track_changes = ?13,
                upside_down = ?14, group_id = ?15, proxy_id = ?16, assertions = ?17, tags = ?18,
                updated_at = datetime('now')
             WHERE id = ?1",
            params![
                monitor.id,
                monitor.name,
                monitor.description,
                monitor.kind.as_str(),
                monitor.target,
                monitor.settings.to_string(),
                monitor.interval_seconds,
                monitor.timeout_seconds,
                monitor.enabled as i32,
                monitor.failure_threshold,
                monitor.success_threshold,
                monitor.resend_interval_seconds,
                monitor.track_changes as i32,
                monitor.upside_down as i32,
                monitor.group_id,
                monitor.proxy_id,
                monitor.assertions.as_ref().map(|a| a.to_string()),
                monitor.tags.join(","),
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("monitor {}", monitor.id)));
        }
        Ok(())
    }

    pub fn delete_monitor(&self, id: &str) -> Result<()> {
        let changed = self.conn().execute("DELETE FROM monitors WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("monitor {id}")));
        }
        Ok(())
    }

    pub fn set_monitor_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE monitors SET enabled = ?2, updated_at = datetime('now') WHERE id = ?1",
            params![id, enabled as i32],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("monitor {id}")));
        }
        Ok(())
    }

    pub fn get_monitor(&self, id: &str) -> Result<Monitor> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {MONITOR_COLS} FROM monitors WHERE id = ?1"),
            params![id],
            monitor_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound(format!("monitor {id}")),
            other => Error::Db(other),
        })
    }

    pub fn list_monitors(&self) -> Result<Vec<Monitor>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {MONITOR_COLS} FROM monitors ORDER BY created_at ASC"))?;
        let rows = stmt.query_map([], monitor_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn all_enabled_monitors(&self) -> Result<Vec<Monitor>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MONITOR_COLS} FROM monitors WHERE enabled = 1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map([], monitor_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ─── Check results ──────────────────────────────────────────────────────

    pub fn insert_check_result(&self, monitor_id: &str, outcome: &CheckOutcome) -> Result<CheckResult> {
        let conn = self.conn();
        let seq = Self::next_seq(&conn, "check_results");
        let result = CheckResult {
            id: uuid::Uuid::new_v4().to_string(),
            monitor_id: monitor_id.to_string(),
            status: outcome.status,
            response_time_ms: outcome.response_time_ms,
            status_code: outcome.status_code,
            message: outcome.message.clone(),
            headers: outcome.headers.clone(),
            body: outcome.body.clone(),
            body_hash: outcome.body_hash.clone(),
            cert_expiry: outcome.cert_expiry,
            cert_fingerprint: outcome.cert_fingerprint.clone(),
            dns_records: outcome.dns_records.clone(),
            checked_at: now_iso(),
            seq,
        };
        conn.execute(
            "INSERT INTO check_results (id, monitor_id, status, response_time_ms, status_code, message,
                headers, body, body_hash, cert_expiry, cert_fingerprint, dns_records, checked_at, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                result.id,
                result.monitor_id,
                result.status.as_str(),
                result.response_time_ms,
                result.status_code,
                result.message,
                result.headers.as_ref().map(|h| h.to_string()),
                result.body,
                result.body_hash,
                result.cert_expiry,
                result.cert_fingerprint,
                result.dns_records.as_ref().map(|r| serde_json::to_string(r).unwrap_or_default()),
                result.checked_at,
                result.seq,
            ],
        )?;
        Ok(result)
    }

    pub fn latest_check_result(&self, monitor_id: &str) -> Result<Option<CheckResult>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {CHECK_RESULT_COLS} FROM check_results WHERE monitor_id = ?1 ORDER BY seq DESC LIMIT 1"),
                params![monitor_id],
                check_result_from_row,
            );
        match row {
            Ok(r) => Ok(Some(r)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Db(e)),
        }
    }

    pub fn list_check_results(&self, monitor_id: &str, limit: u32) -> Result<Vec<CheckResult>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHECK_RESULT_COLS} FROM check_results WHERE monitor_id = ?1 ORDER BY seq DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![monitor_id, limit], check_result_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Percentage of checks in the window that were not down.
    pub fn uptime_percent(&self, monitor_id: &str, window_hours: u32) -> Result<f64> {
        let conn = self.conn();
        let (total, ok): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(status != 'down'), 0) FROM check_results
             WHERE monitor_id = ?1 AND checked_at >= datetime('now', ?2)",
            params![monitor_id, format!("-{} hours", window_hours)],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        if total == 0 {
            return Ok(100.0);
        }
        Ok(ok as f64 / total as f64 * 100.0)
    }

    /// p50/p95/p99 response times over the window, or None with no data.
    pub fn response_time_percentiles(
        &self,
        monitor_id: &str,
        window_hours: u32,
    ) -> Result<Option<(u32, u32, u32)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT response_time_ms FROM check_results
             WHERE monitor_id = ?1 AND checked_at >= datetime('now', ?2)
             ORDER BY response_time_ms ASC",
        )?;
        let times: Vec<u32> = stmt
            .query_map(params![monitor_id, format!("-{} hours", window_hours)], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        if times.is_empty() {
            return Ok(None);
        }
        let pick = |p: f64| {
            let idx = ((times.len() - 1) as f64 * p).round() as usize;
            times[idx]
        };
        Ok(Some((pick(0.50), pick(0.95), pick(0.99))))
    }

    // ─── Monitor status ─────────────────────────────────────────────────────

    pub fn get_monitor_status(&self, monitor_id: &str) -> Result<Option<MonitorStatus>> {
        let conn = self.conn();
        let row = conn.query_row(
            "SELECT monitor_id, status, last_check_at, consec_successes, consec_fails, last_body_hash
             FROM monitor_status WHERE monitor_id = ?1",
            params![monitor_id],
            |row| {
                let status_str: String = row.get(1)?;
                Ok(MonitorStatus {
                    monitor_id: row.get(0)?,
                    status: Status::parse(&status_str).unwrap_or(Status::Up),
                    last_check_at: row.get(2)?,
                    consec_successes: row.get(3)?,
                    consec_fails: row.get(4)?,
                    last_body_hash: row.get(5)?,
                })
            },
        );
        match row {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Db(e)),
        }
    }

    pub fn upsert_monitor_status(&self, status: &MonitorStatus) -> Result<()> {
        self.conn().execute(
            "INSERT INTO monitor_status (monitor_id, status, last_check_at, consec_successes, consec_fails, last_body_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(monitor_id) DO UPDATE SET
                status = excluded.status,
                last_check_at = excluded.last_check_at,
                consec_successes = excluded.consec_successes,
                consec_fails = excluded.consec_fails,
                last_body_hash = excluded.last_body_hash",
            params![
                status.monitor_id,
                status.status.as_str(),
                status.last_check_at,
                status.consec_successes,
                status.consec_fails,
                status.last_body_hash,
            ],
        )?;
        Ok(())
    }

    // ─── Content changes ────────────────────────────────────────────────────

    pub fn insert_content_change(
        &self,
        monitor_id: &str,
        old_hash: &str,
        new_hash: &str,
        diff: &str,
    ) -> Result<ContentChange> {
        let change = ContentChange {
            id: uuid::Uuid::new_v4().to_string(),
            monitor_id: monitor_id.to_string(),
            old_hash: old_hash.to_string(),
            new_hash: new_hash.to_string(),
            diff: diff.to_string(),
            created_at: now_iso(),
        };
        self.conn().execute(
            "INSERT INTO content_changes (id, monitor_id, old_hash, new_hash, diff, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![change.id, change.monitor_id, change.old_hash, change.new_hash, change.diff, change.created_at],
        )?;
        Ok(change)
    }

    pub fn list_content_changes(&self, monitor_id: &str, limit: u32) -> Result<Vec<ContentChange>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, monitor_id, old_hash, new_hash, diff, created_at FROM content_changes
             WHERE monitor_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![monitor_id, limit], |row| {
            Ok(ContentChange {
                id: row.get(0)?,
                monitor_id: row.get(1)?,
                old_hash: row.get(2)?,
                new_hash: row.get(3)?,
                diff: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ─── Incidents ──────────────────────────────────────────────────────────

    pub fn open_incident(&self, monitor_id: &str) -> Result<Option<Incident>> {
        let conn = self.conn();
        let row = conn.query_row(
            &format!("SELECT {INCIDENT_COLS} FROM incidents WHERE monitor_id = ?1 AND status != 'resolved' ORDER BY seq DESC LIMIT 1"),
            params![monitor_id],
            incident_from_row,
        );
        match row {
            Ok(i) => Ok(Some(i)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Db(e)),
        }
    }

    pub fn get_incident(&self, id: &str) -> Result<Incident> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {INCIDENT_COLS} FROM incidents WHERE id = ?1"),
            params![id],
            incident_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound(format!("incident {id}")),
            other => Error::Db(other),
        })
    }

    pub fn create_incident(&self, monitor_id: &str, monitor_name: &str, cause: &str) -> Result<Incident> {
        let conn = self.conn();
        let seq = Self::next_seq(&conn, "incidents");
        let incident = Incident {
            id: uuid::Uuid::new_v4().to_string(),
            monitor_id: monitor_id.to_string(),
            monitor_name: monitor_name.to_string(),
            cause: cause.to_string(),
            status: IncidentStatus::Open,
            created_at: now_iso(),
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            seq,
        };
        conn.execute(
            "INSERT INTO incidents (id, monitor_id, monitor_name, cause, status, created_at, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                incident.id,
                incident.monitor_id,
                incident.monitor_name,
                incident.cause,
                incident.status.as_str(),
                incident.created_at,
                incident.seq,
            ],
        )?;
        Ok(incident)
    }

    pub fn update_incident(&self, incident: &Incident) -> Result<()> {
        self.conn().execute(
            "UPDATE incidents SET status = ?2, acknowledged_at = ?3, acknowledged_by = ?4,
                resolved_at = ?5, resolved_by = ?6
             WHERE id = ?1",
            params![
                incident.id,
                incident.status.as_str(),
                incident.acknowledged_at,
                incident.acknowledged_by,
                incident.resolved_at,
                incident.resolved_by,
            ],
        )?;
        Ok(())
    }

    pub fn insert_incident_event(
        &self,
        incident_id: &str,
        event_type: IncidentEventType,
        message: &str,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO incident_events (id, incident_id, event_type, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                uuid::Uuid::new_v4().to_string(),
                incident_id,
                event_type.as_str(),
                message,
                now_iso(),
            ],
        )?;
        Ok(())
    }

    pub fn list_incident_events(&self, incident_id: &str) -> Result<Vec<IncidentEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, incident_id, event_type, message, created_at FROM incident_events
             WHERE incident_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![incident_id], |row| {
            Ok(IncidentEvent {
                id: row.get(0)?,
                incident_id: row.get(1)?,
                event_type: row.get(2)?,
                message: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ─── Maintenance windows ────────────────────────────────────────────────

    pub fn create_maintenance_window(
        &self,
        starts_at: &str,
        ends_at: &str,
        recurrence: Option<Recurrence>,
        monitor_ids: &[String],
    ) -> Result<MaintenanceWindow> {
        let window = MaintenanceWindow {
            id: uuid::Uuid::new_v4().to_string(),
            starts_at: starts_at.to_string(),
            ends_at: ends_at.to_string(),
            recurrence,
            monitor_ids: monitor_ids.to_vec(),
            created_at: now_iso(),
        };
        let conn = self.conn();
        conn.execute(
            "INSERT INTO maintenance_windows (id, starts_at, ends_at, recurrence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                window.id,
                window.starts_at,
                window.ends_at,
                window.recurrence.map(|r| r.as_str()),
                window.created_at,
            ],
        )?;
        for monitor_id in monitor_ids {
            conn.execute(
                "INSERT OR IGNORE INTO maintenance_monitors (window_id, monitor_id) VALUES (?1, ?2)",
                params![window.id, monitor_id],
            )?;
        }
        Ok(window)
    }

    /// True when any maintenance window covering this monitor is active at `now_iso_ts`.
    /// Windows with no monitor links apply to every monitor.
    pub fn is_monitor_in_maintenance(&self, monitor_id: &str, now_iso_ts: &str) -> Result<bool> {
        let now = match parse_ts(now_iso_ts) {
            Some(t) => t,
            None => return Ok(false),
        };
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT w.starts_at, w.ends_at, w.recurrence FROM maintenance_windows w
             WHERE NOT EXISTS (SELECT 1 FROM maintenance_monitors mm WHERE mm.window_id = w.id)
                OR EXISTS (SELECT 1 FROM maintenance_monitors mm WHERE mm.window_id = w.id AND mm.monitor_id = ?1)",
        )?;
        let windows: Vec<(String, String, Option<String>)> = stmt
            .query_map(params![monitor_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .filter_map(|r| r.ok())
            .collect();
        for (starts, ends, recurrence) in windows {
            let (Some(s), Some(e)) = (parse_ts(&starts), parse_ts(&ends)) else { continue };
            let recurrence = recurrence.as_deref().and_then(Recurrence::parse);
            if window_active_at(s, e, recurrence, now) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ─── Heartbeats ─────────────────────────────────────────────────────────

    pub fn get_heartbeat(&self, monitor_id: &str) -> Result<Option<Heartbeat>> {
        let conn = self.conn();
        let row = conn.query_row(
            "SELECT monitor_id, expected_interval_seconds, last_ping_at, status FROM heartbeats WHERE monitor_id = ?1",
            params![monitor_id],
            heartbeat_from_row,
        );
        match row {
            Ok(h) => Ok(Some(h)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Db(e)),
        }
    }

    /// Record an incoming ping and return the status the heartbeat held
    /// before the ping (so the caller can trigger recovery on down→up).
    pub fn record_heartbeat_ping(&self, monitor_id: &str, now_unix: i64) -> Result<Status> {
        let conn = self.conn();
        let prev: String = conn
            .query_row(
                "SELECT status FROM heartbeats WHERE monitor_id = ?1",
                params![monitor_id],
                |r| r.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Error::NotFound(format!("heartbeat {monitor_id}")),
                other => Error::Db(other),
            })?;
        conn.execute(
            "UPDATE heartbeats SET last_ping_at = ?2, status = 'up' WHERE monitor_id = ?1",
            params![monitor_id, now_unix],
        )?;
        Ok(Status::parse(&prev).unwrap_or(Status::Up))
    }

    pub fn list_expired_heartbeats(&self, now_unix: i64) -> Result<Vec<Heartbeat>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT h.monitor_id, h.expected_interval_seconds, h.last_ping_at, h.status
             FROM heartbeats h JOIN monitors m ON m.id = h.monitor_id
             WHERE m.enabled = 1 AND h.last_ping_at + h.expected_interval_seconds < ?1",
        )?;
        let rows = stmt.query_map(params![now_unix], heartbeat_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn update_heartbeat_status(&self, monitor_id: &str, status: Status) -> Result<()> {
        self.conn().execute(
            "UPDATE heartbeats SET status = ?2 WHERE monitor_id = ?1",
            params![monitor_id, status.as_str()],
        )?;
        Ok(())
    }

    // ─── Proxies ────────────────────────────────────────────────────────────

    pub fn create_proxy(&self, proxy: &Proxy) -> Result<()> {
        self.conn().execute(
            "INSERT INTO proxies (id, protocol, host, port, username, password)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![proxy.id, proxy.protocol, proxy.host, proxy.port, proxy.username, proxy.password],
        )?;
        Ok(())
    }

    pub fn get_proxy(&self, id: &str) -> Result<Option<Proxy>> {
        let conn = self.conn();
        let row = conn.query_row(
            "SELECT id, protocol, host, port, username, password FROM proxies WHERE id = ?1",
            params![id],
            proxy_from_row,
        );
        match row {
            Ok(p) => Ok(Some(p)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Db(e)),
        }
    }

    /// Batch lookup used by the scheduler at reload so per-monitor proxy
    /// resolution does not fan out into one read per monitor.
    pub fn get_proxies(&self, ids: &[String]) -> Result<HashMap<String, Proxy>> {
        let mut out = HashMap::new();
        if ids.is_empty() {
            return Ok(out);
        }
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, protocol, host, port, username, password FROM proxies WHERE id = ?1",
        )?;
        for id in ids {
            if let Ok(p) = stmt.query_row(params![id], proxy_from_row) {
                out.insert(p.id.clone(), p);
            }
        }
        Ok(out)
    }

    // ─── Retention and rollups ──────────────────────────────────────────────

    /// Materialize daily uptime rollups for every completed day.
    pub fn rollup_daily(&self) -> Result<usize> {
        let changed = self.conn().execute(
            "INSERT INTO daily_rollups (monitor_id, day, total_checks, up_checks, degraded_checks, down_checks, avg_response_ms)
             SELECT monitor_id, date(checked_at), COUNT(*),
                    COALESCE(SUM(status = 'up'), 0),
                    COALESCE(SUM(status = 'degraded'), 0),
                    COALESCE(SUM(status = 'down'), 0),
                    AVG(response_time_ms)
             FROM check_results
             WHERE date(checked_at) < date('now')
             GROUP BY monitor_id, date(checked_at)
             ON CONFLICT(monitor_id, day) DO UPDATE SET
                total_checks = excluded.total_checks,
                up_checks = excluded.up_checks,
                degraded_checks = excluded.degraded_checks,
                down_checks = excluded.down_checks,
                avg_response_ms = excluded.avg_response_ms",
            [],
        )?;
        Ok(changed)
    }

    pub fn purge_check_results(&self, days: u32) -> Result<usize> {
        let changed = self.conn().execute(
            "DELETE FROM check_results WHERE checked_at < datetime('now', ?1)",
            params![format!("-{} days", days)],
        )?;
        Ok(changed)
    }

    pub fn purge_content_changes(&self, days: u32) -> Result<usize> {
        let changed = self.conn().execute(
            "DELETE FROM content_changes WHERE created_at < datetime('now', ?1)",
            params![format!("-{} days", days)],
        )?;
        Ok(changed)
    }

    pub fn purge_rollups(&self, days: u32) -> Result<usize> {
        let changed = self.conn().execute(
            "DELETE FROM daily_rollups WHERE day < date('now', ?1)",
            params![format!("-{} days", days)],
        )?;
        Ok(changed)
    }
}

// ─── Row mappers ────────────────────────────────────────────────────────────

const MONITOR_COLS: &str = "id, name, description, kind, target, settings, interval_seconds, \
    timeout_seconds, enabled, failure_threshold, success_threshold, resend_interval_seconds, \
    track_changes, upside_down, group_id, proxy_id, assertions, tags, created_at, updated_at";

fn monitor_from_row(row: &Row) -> rusqlite::Result<Monitor> {
    let kind_str: String = row.get(3)?;
    let kind = MonitorKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown monitor kind '{kind_str}'").into(),
        )
    })?;
    let settings_str: String = row.get(5)?;
    let assertions_str: Option<String> = row.get(16)?;
    let tags_str: String = row.get(17)?;
    Ok(Monitor {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        kind,
        target: row.get(4)?,
        settings: serde_json::from_str(&settings_str).unwrap_or(serde_json::Value::Null),
        interval_seconds: row.get(6)?,
        timeout_seconds: row.get(7)?,
        enabled: row.get::<_, i32>(8)? != 0,
        failure_threshold: row.get(9)?,
        success_threshold: row.get(10)?,
        resend_interval_seconds: row.get(11)?,
        track_changes: row.get::<_, i32>(12)? != 0,
        upside_down: row.get::<_, i32>(13)? != 0,
        group_id: row.get(14)?,
        proxy_id: row.get(15)?,
        assertions: assertions_str.and_then(|a| serde_json::from_str(&a).ok()),
        tags: if tags_str.is_empty() {
            Vec::new()
        } else {
            tags_str.split(',').map(|t| t.to_string()).collect()
        },
        proxy_url: None,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}

const CHECK_RESULT_COLS: &str = "id, monitor_id, status, response_time_ms, status_code, message, \
    headers, body, body_hash, cert_expiry, cert_fingerprint, dns_records, checked_at, seq";

fn check_result_from_row(row: &Row) -> rusqlite::Result<CheckResult> {
    let status_str: String = row.get(2)?;
    let headers_str: Option<String> = row.get(6)?;
    let dns_str: Option<String> = row.get(11)?;
    Ok(CheckResult {
        id: row.get(0)?,
        monitor_id: row.get(1)?,
        status: Status::parse(&status_str).unwrap_or(Status::Down),
        response_time_ms: row.get(3)?,
        status_code: row.get(4)?,
        message: row.get(5)?,
        headers: headers_str.and_then(|h| serde_json::from_str(&h).ok()),
        body: row.get(7)?,
        body_hash: row.get(8)?,
        cert_expiry: row.get(9)?,
        cert_fingerprint: row.get(10)?,
        dns_records: dns_str.and_then(|d| serde_json::from_str(&d).ok()),
        checked_at: row.get(12)?,
        seq: row.get(13)?,
    })
}

const INCIDENT_COLS: &str = "id, monitor_id, monitor_name, cause, status, created_at, \
    acknowledged_at, acknowledged_by, resolved_at, resolved_by, seq";

fn incident_from_row(row: &Row) -> rusqlite::Result<Incident> {
    let status_str: String = row.get(4)?;
    Ok(Incident {
        id: row.get(0)?,
        monitor_id: row.get(1)?,
        monitor_name: row.get(2)?,
        cause: row.get(3)?,
        status: IncidentStatus::parse(&status_str).unwrap_or(IncidentStatus::Open),
        created_at: row.get(5)?,
        acknowledged_at: row.get(6)?,
        acknowledged_by: row.get(7)?,
        resolved_at: row.get(8)?,
        resolved_by: row.get(9)?,
        seq: row.get(10)?,
    })
}

fn heartbeat_from_row(row: &Row) -> rusqlite::Result<Heartbeat> {
    let status_str: String = row.get(3)?;
    Ok(Heartbeat {
        monitor_id: row.get(0)?,
        expected_interval_seconds: row.get(1)?,
        last_ping_at: row.get(2)?,
        status: Status::parse(&status_str).unwrap_or(Status::Up),
    })
}

fn proxy_from_row(row: &Row) -> rusqlite::Result<Proxy> {
    Ok(Proxy {
        id: row.get(0)?,
        protocol: row.get(1)?,
        host: row.get(2)?,
        port: row.get(3)?,
        username: row.get(4)?,
        password: row.get(5)?,
    })
}

// ─── Maintenance window math ────────────────────────────────────────────────

fn parse_ts(s: &str) -> Option<NaiveDateTime> {
    let formats = ["%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];
    formats.iter().find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
}

/// Whether a window defined by `[start, end]` covers `now`, projecting the
/// window forward per its recurrence.
fn window_active_at(
    start: NaiveDateTime,
    end: NaiveDateTime,
    recurrence: Option<Recurrence>,
    now: NaiveDateTime,
) -> bool {
    if end <= start {
        return false;
    }
    let duration = end - start;
    match recurrence {
        None => now >= start && now <= end,
        Some(Recurrence::Daily) => {
            let days = (now.date() - start.date()).num_days();
            // Also test the previous occurrence for windows spanning midnight.
            [days, days - 1].iter().any(|d| {
                start
                    .checked_add_signed(chrono::Duration::days(*d))
                    .map(|s| now >= s && now <= s + duration)
                    .unwrap_or(false)
            })
        }
        Some(Recurrence::Weekly) => {
            let weeks = (now.date() - start.date()).num_days() / 7;
            [weeks, weeks - 1].iter().any(|w| {
                start
                    .checked_add_signed(chrono::Duration::weeks(*w))
                    .map(|s| now >= s && now <= s + duration)
                    .unwrap_or(false)
            })
        }
        Some(Recurrence::Monthly) => {
            let months = (now.date().year() - start.date().year()) * 12
                + (now.date().month() as i32 - start.date().month() as i32);
            [months, months - 1].iter().any(|m| {
                if *m < 0 {
                    return now >= start && now <= end;
                }
                start
                    .checked_add_months(chrono::Months::new(*m as u32))
                    .map(|s| now >= s && now <= s + duration)
                    .unwrap_or(false)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        parse_ts(s).unwrap()
    }

    #[test]
    fn one_shot_window_bounds() {
        let s = ts("2026-03-01T10:00:00Z");
        let e = ts("2026-03-01T12:00:00Z");
        assert!(window_active_at(s, e, None, ts("2026-03-01T11:00:00Z")));
        assert!(!window_active_at(s, e, None, ts("2026-03-01T12:30:00Z")));
        assert!(!window_active_at(s, e, None, ts("2026-02-28T11:00:00Z")));
    }

    #[test]
    fn daily_window_recurs() {
        let s = ts("2026-03-01T22:00:00Z");
        let e = ts("2026-03-02T02:00:00Z");
        // Same slot five days later, including the span across midnight.
        assert!(window_active_at(s, e, Some(Recurrence::Daily), ts("2026-03-06T23:00:00Z")));
        assert!(window_active_at(s, e, Some(Recurrence::Daily), ts("2026-03-07T01:00:00Z")));
        assert!(!window_active_at(s, e, Some(Recurrence::Daily), ts("2026-03-06T12:00:00Z")));
    }

    #[test]
    fn weekly_window_recurs() {
        let s = ts("2026-03-02T10:00:00Z"); // a Monday
        let e = ts("2026-03-02T11:00:00Z");
        assert!(window_active_at(s, e, Some(Recurrence::Weekly), ts("2026-03-09T10:30:00Z")));
        assert!(!window_active_at(s, e, Some(Recurrence::Weekly), ts("2026-03-10T10:30:00Z")));
    }

    #[test]
    fn monthly_window_recurs() {
        let s = ts("2026-01-15T08:00:00Z");
        let e = ts("2026-01-15T09:00:00Z");
        assert!(window_active_at(s, e, Some(Recurrence::Monthly), ts("2026-04-15T08:30:00Z")));
        assert!(!window_active_at(s, e, Some(Recurrence::Monthly), ts("2026-04-16T08:30:00Z")));
    }
}
