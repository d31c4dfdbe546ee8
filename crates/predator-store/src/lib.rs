// SPDX-License-Identifier: MIT OR Apache-2.0
//! predator-store
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! SQLite-backed shared control-plane state.
//!
//! The store is the single source of truth for cross-process counters:
//! tenant quotas, session leases, action rates, artifact usage, and circuit
//! breaker state. Mutations run under WAL with `synchronous=FULL` and are
//! serialised by a process-local lock; callers keep critical sections short
//! and never hold the lock across awaits.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

/// Errors from control-plane store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The database directory could not be created.
    #[error("failed to prepare store directory {path}: {source}")]
    Io {
        /// Directory that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Stored JSON could not be decoded.
    #[error("corrupt stored payload: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Point-in-time circuit view for one key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitSnapshot {
    /// `closed`, `open`, or `half_open`; decoded by the breaker.
    pub state: CircuitStateTag,
    /// Unix seconds at which the circuit last opened; `0.0` if never.
    pub opened_at: f64,
}

/// Raw circuit state tag persisted in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStateTag {
    /// Admitting traffic.
    Closed,
    /// Blocking traffic.
    Open,
    /// Admitting a single probe.
    HalfOpen,
}

impl CircuitStateTag {
    /// The persisted string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "open" => Self::Open,
            "half_open" => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Current unix time in fractional seconds.
#[must_use]
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// SQLite-backed shared control-plane state.
#[derive(Debug)]
pub struct ControlPlaneStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl ControlPlaneStore {
    /// Open (or create) the store at `db_path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory cannot be created or the
    /// database cannot be opened.
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tenant_quota (
                tenant_id TEXT PRIMARY KEY,
                quota_json TEXT NOT NULL,
                updated_at REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS action_events (
                tenant_id TEXT NOT NULL,
                ts REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_action_events_tenant_ts
                ON action_events(tenant_id, ts);

            CREATE TABLE IF NOT EXISTS artifact_usage (
                tenant_id TEXT PRIMARY KEY,
                bytes_used INTEGER NOT NULL,
                updated_at REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS session_lease (
                workflow_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                heartbeat_ts REAL NOT NULL,
                created_ts REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_session_lease_tenant
                ON session_lease(tenant_id);

            CREATE TABLE IF NOT EXISTS circuit_state (
                domain TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                opened_at REAL NOT NULL,
                updated_at REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS circuit_failures (
                domain TEXT NOT NULL,
                ts REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_circuit_failures_domain_ts
                ON circuit_failures(domain, ts);
            ",
        )?;
        debug!(path = %db_path.display(), "control-plane store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// Path of the backing database file.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// `host:pid` identity used for lease ownership.
    #[must_use]
    pub fn owner_id() -> String {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".into());
        format!("{host}:{}", std::process::id())
    }

    // --- quotas ---

    /// Upsert a tenant's quota payload.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub fn set_quota(&self, tenant_id: &str, quota_json: &str) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO tenant_quota(tenant_id, quota_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(tenant_id)
             DO UPDATE SET quota_json=excluded.quota_json, updated_at=excluded.updated_at",
            params![tenant_id, quota_json, unix_now()],
        )?;
        Ok(())
    }

    /// Fetch a tenant's quota payload, if one is stored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub fn get_quota(&self, tenant_id: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let row = conn
            .query_row(
                "SELECT quota_json FROM tenant_quota WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(row)
    }

    // --- action rate ---

    /// Record one admitted action at `ts`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub fn register_action(&self, tenant_id: &str, ts: f64) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO action_events(tenant_id, ts) VALUES (?1, ?2)",
            params![tenant_id, ts],
        )?;
        Ok(())
    }

    /// Count actions for a tenant at or after `since_ts`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub fn count_recent_actions(&self, tenant_id: &str, since_ts: f64) -> StoreResult<u64> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM action_events WHERE tenant_id = ?1 AND ts >= ?2",
            params![tenant_id, since_ts],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Delete action events older than `before_ts`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub fn prune_action_events(&self, before_ts: f64) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "DELETE FROM action_events WHERE ts < ?1",
            params![before_ts],
        )?;
        Ok(())
    }

    // --- artifact usage ---

    /// Add bytes to a tenant's artifact usage counter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub fn add_artifact_bytes(&self, tenant_id: &str, bytes_added: u64) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO artifact_usage(tenant_id, bytes_used, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(tenant_id)
             DO UPDATE SET bytes_used = artifact_usage.bytes_used + excluded.bytes_used,
                           updated_at = excluded.updated_at",
            params![tenant_id, bytes_added as i64, unix_now()],
        )?;
        Ok(())
    }

    /// Current artifact usage for a tenant in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub fn get_artifact_bytes(&self, tenant_id: &str) -> StoreResult<u64> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let row: Option<i64> = conn
            .query_row(
                "SELECT bytes_used FROM artifact_usage WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.unwrap_or(0).max(0) as u64)
    }

    // --- session leases ---

    /// Acquire or refresh the lease on a workflow for `owner_id`.
    ///
    /// Stale leases (heartbeat older than the TTL) are reaped first.
    /// Returns `false` when a live lease is held by another owner.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub fn acquire_session_lease(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        owner_id: &str,
        lease_ttl_seconds: u64,
    ) -> StoreResult<bool> {
        let now = unix_now();
        let cutoff = now - lease_ttl_seconds as f64;
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "DELETE FROM session_lease WHERE heartbeat_ts < ?1",
            params![cutoff],
        )?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT owner_id FROM session_lease WHERE workflow_id = ?1",
                params![workflow_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(current) = existing
            && current != owner_id
        {
            debug!(workflow_id, current_owner = %current, "session lease conflict");
            return Ok(false);
        }
        conn.execute(
            "INSERT INTO session_lease(workflow_id, tenant_id, owner_id, heartbeat_ts, created_ts)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(workflow_id)
             DO UPDATE SET tenant_id=excluded.tenant_id,
                           owner_id=excluded.owner_id,
                           heartbeat_ts=excluded.heartbeat_ts",
            params![workflow_id, tenant_id, owner_id, now],
        )?;
        Ok(true)
    }

    /// Extend the heartbeat on a lease this owner holds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub fn heartbeat_session_lease(&self, workflow_id: &str, owner_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE session_lease SET heartbeat_ts = ?1
             WHERE workflow_id = ?2 AND owner_id = ?3",
            params![unix_now(), workflow_id, owner_id],
        )?;
        Ok(())
    }

    /// Release a lease this owner holds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub fn release_session_lease(&self, workflow_id: &str, owner_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "DELETE FROM session_lease WHERE workflow_id = ?1 AND owner_id = ?2",
            params![workflow_id, owner_id],
        )?;
        Ok(())
    }

    /// Count live leases for one tenant, reaping stale ones first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub fn count_active_sessions(
        &self,
        tenant_id: &str,
        lease_ttl_seconds: u64,
    ) -> StoreResult<u64> {
        let cutoff = unix_now() - lease_ttl_seconds as f64;
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "DELETE FROM session_lease WHERE heartbeat_ts < ?1",
            params![cutoff],
        )?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM session_lease WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Count all live leases, reaping stale ones first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub fn count_all_active_sessions(&self, lease_ttl_seconds: u64) -> StoreResult<u64> {
        let cutoff = unix_now() - lease_ttl_seconds as f64;
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "DELETE FROM session_lease WHERE heartbeat_ts < ?1",
            params![cutoff],
        )?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM session_lease", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    // --- circuit breaker ---

    fn circuit_key(domain: &str, tenant_id: Option<&str>) -> String {
        match tenant_id {
            Some(tenant) => format!("{tenant}::{domain}"),
            None => domain.to_string(),
        }
    }

    /// Read the circuit snapshot for a key; closed when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub fn get_circuit(
        &self,
        domain: &str,
        tenant_id: Option<&str>,
    ) -> StoreResult<CircuitSnapshot> {
        let key = Self::circuit_key(domain, tenant_id);
        let conn = self.conn.lock().expect("store lock poisoned");
        let row: Option<(String, f64)> = conn
            .query_row(
                "SELECT state, opened_at FROM circuit_state WHERE domain = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(match row {
            Some((state, opened_at)) => CircuitSnapshot {
                state: CircuitStateTag::parse(&state),
                opened_at,
            },
            None => CircuitSnapshot {
                state: CircuitStateTag::Closed,
                opened_at: 0.0,
            },
        })
    }

    /// All tracked circuit keys.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub fn list_circuit_domains(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare("SELECT domain FROM circuit_state ORDER BY domain")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Upsert the circuit state for a key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub fn set_circuit(
        &self,
        domain: &str,
        tenant_id: Option<&str>,
        state: CircuitStateTag,
        opened_at: f64,
    ) -> StoreResult<()> {
        let key = Self::circuit_key(domain, tenant_id);
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO circuit_state(domain, state, opened_at, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(domain)
             DO UPDATE SET state=excluded.state,
                           opened_at=excluded.opened_at,
                           updated_at=excluded.updated_at",
            params![key, state.as_str(), opened_at, unix_now()],
        )?;
        Ok(())
    }

    /// Append a failure timestamp for a key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub fn add_circuit_failure(
        &self,
        domain: &str,
        tenant_id: Option<&str>,
        ts: f64,
    ) -> StoreResult<()> {
        let key = Self::circuit_key(domain, tenant_id);
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO circuit_failures(domain, ts) VALUES (?1, ?2)",
            params![key, ts],
        )?;
        Ok(())
    }

    /// Count failures for a key at or after `since_ts`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub fn count_circuit_failures(
        &self,
        domain: &str,
        tenant_id: Option<&str>,
        since_ts: f64,
    ) -> StoreResult<u64> {
        let key = Self::circuit_key(domain, tenant_id);
        let conn = self.conn.lock().expect("store lock poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM circuit_failures WHERE domain = ?1 AND ts >= ?2",
            params![key, since_ts],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Delete failures for a key older than `before_ts`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub fn prune_circuit_failures(
        &self,
        domain: &str,
        tenant_id: Option<&str>,
        before_ts: f64,
    ) -> StoreResult<()> {
        let key = Self::circuit_key(domain, tenant_id);
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "DELETE FROM circuit_failures WHERE domain = ?1 AND ts < ?2",
            params![key, before_ts],
        )?;
        Ok(())
    }

    /// Delete all failures for a key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure.
    pub fn clear_circuit_failures(&self, domain: &str, tenant_id: Option<&str>) -> StoreResult<()> {
        let key = Self::circuit_key(domain, tenant_id);
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "DELETE FROM circuit_failures WHERE domain = ?1",
            params![key],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ControlPlaneStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ControlPlaneStore::open(dir.path().join("control.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn quota_round_trips() {
        let (_dir, store) = store();
        assert!(store.get_quota("t1").unwrap().is_none());
        store.set_quota("t1", r#"{"max_actions_per_minute":5}"#).unwrap();
        assert_eq!(
            store.get_quota("t1").unwrap().as_deref(),
            Some(r#"{"max_actions_per_minute":5}"#)
        );
    }

    #[test]
    fn action_rate_window_counts_and_prunes() {
        let (_dir, store) = store();
        let now = unix_now();
        store.register_action("t1", now - 120.0).unwrap();
        store.register_action("t1", now - 10.0).unwrap();
        store.register_action("t1", now).unwrap();
        assert_eq!(store.count_recent_actions("t1", now - 60.0).unwrap(), 2);

        store.prune_action_events(now - 60.0).unwrap();
        assert_eq!(store.count_recent_actions("t1", 0.0).unwrap(), 2);
    }

    #[test]
    fn lease_conflicts_across_owners() {
        let (_dir, store) = store();
        assert!(store.acquire_session_lease("t1", "wf", "a:1", 300).unwrap());
        assert!(!store.acquire_session_lease("t1", "wf", "b:2", 300).unwrap());
        // Re-acquire by the same owner refreshes.
        assert!(store.acquire_session_lease("t1", "wf", "a:1", 300).unwrap());
        store.release_session_lease("wf", "a:1").unwrap();
        assert!(store.acquire_session_lease("t1", "wf", "b:2", 300).unwrap());
    }

    #[test]
    fn stale_leases_are_reaped() {
        let (_dir, store) = store();
        assert!(store.acquire_session_lease("t1", "wf", "a:1", 300).unwrap());
        // TTL zero: every lease is immediately stale.
        assert_eq!(store.count_active_sessions("t1", 0).unwrap(), 0);
        assert!(store.acquire_session_lease("t1", "wf", "b:2", 0).unwrap());
    }

    #[test]
    fn artifact_bytes_accumulate() {
        let (_dir, store) = store();
        store.add_artifact_bytes("t1", 100).unwrap();
        store.add_artifact_bytes("t1", 50).unwrap();
        assert_eq!(store.get_artifact_bytes("t1").unwrap(), 150);
        assert_eq!(store.get_artifact_bytes("t2").unwrap(), 0);
    }

    #[test]
    fn circuit_keys_are_tenant_scoped() {
        let (_dir, store) = store();
        store
            .set_circuit("host.test", Some("t1"), CircuitStateTag::Open, 42.0)
            .unwrap();
        let scoped = store.get_circuit("host.test", Some("t1")).unwrap();
        assert_eq!(scoped.state, CircuitStateTag::Open);
        let unscoped = store.get_circuit("host.test", None).unwrap();
        assert_eq!(unscoped.state, CircuitStateTag::Closed);
        assert_eq!(
            store.list_circuit_domains().unwrap(),
            vec!["t1::host.test".to_string()]
        );
    }

    #[test]
    fn circuit_failures_window() {
        let (_dir, store) = store();
        let now = unix_now();
        store.add_circuit_failure("h", None, now - 200.0).unwrap();
        store.add_circuit_failure("h", None, now).unwrap();
        assert_eq!(store.count_circuit_failures("h", None, now - 120.0).unwrap(), 1);
        store.prune_circuit_failures("h", None, now - 120.0).unwrap();
        assert_eq!(store.count_circuit_failures("h", None, 0.0).unwrap(), 1);
        store.clear_circuit_failures("h", None).unwrap();
        assert_eq!(store.count_circuit_failures("h", None, 0.0).unwrap(), 0);
    }
}
