//! Registry store: the durable `service_workers` table.
//!
//! All access goes through a single SQLite connection behind a mutex. Calls
//! run on the blocking pool so async callers never stall an executor thread
//! on disk I/O. Every write that must be atomic happens inside one
//! transaction.

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use url::Url;

use crate::error::{Result, ServiceWorkerError};
use crate::policy::SecurityPolicy;
use crate::types::{content_fingerprint, InstallState, NewWorker, WorkerId, WorkerMatch, WorkerRecord};

/// Database schema version for migrations
const SCHEMA_VERSION: i64 = 1;

const RECORD_COLUMNS: &str =
    "instance_id, url, scope, install_state, last_checked, content_hash, contents";

/// Current time as epoch seconds.
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Durable worker table.
#[derive(Clone)]
pub struct WorkerStore {
    conn: Arc<Mutex<Connection>>,
    policy: SecurityPolicy,
}

impl WorkerStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: &Path, policy: SecurityPolicy) -> Result<Self> {
        info!(path = %path.display(), "Opening service worker store");
        let conn = Connection::open(path)?;
        Self::from_connection(conn, policy)
    }

    /// An in-memory store, used by tests and ephemeral hosts.
    pub fn open_in_memory(policy: SecurityPolicy) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, policy)
    }

    fn from_connection(conn: Connection, policy: SecurityPolicy) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            policy,
        })
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| ServiceWorkerError::internal("worker store lock poisoned"))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| ServiceWorkerError::internal(format!("store task failed: {}", e)))?
    }

    /// Insert a new worker row and return its id.
    ///
    /// Refused with `PolicyViolation` before touching the database when the
    /// script or scope is insecure and the script is not from a trusted local
    /// host.
    pub async fn insert(&self, worker: NewWorker) -> Result<WorkerId> {
        self.policy.check(&worker.url, &worker.scope)?;

        let url = worker.url.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO service_workers (url, scope, install_state, last_checked, content_hash, contents)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    worker.url.as_str(),
                    worker.scope.as_str(),
                    worker.install_state.as_i64(),
                    worker.last_checked,
                    content_fingerprint(&worker.content),
                    worker.content,
                ],
            )?;
            let id = WorkerId::new(tx.last_insert_rowid());
            tx.commit()?;
            Ok(id)
        })
        .await
        .inspect(|id| debug!(%id, %url, "Inserted service worker"))
    }

    /// Fetch one record by id.
    pub async fn get(&self, id: WorkerId) -> Result<WorkerRecord> {
        self.run(move |conn| fetch_record(conn, id)?.ok_or(ServiceWorkerError::NotFound(id)))
            .await
    }

    /// The non-redundant record for `url` furthest along the lifecycle
    /// (activated, activating, installed, installing), newest first on ties.
    pub async fn newest_record(&self, url: &Url) -> Result<Option<WorkerRecord>> {
        let url = url.to_string();
        self.run(move |conn| {
            let sql = format!(
                "SELECT {} FROM service_workers
                 WHERE url = ?1 AND install_state != ?2
                 ORDER BY install_state DESC, instance_id DESC
                 LIMIT 1",
                RECORD_COLUMNS
            );
            Ok(conn
                .query_row(
                    &sql,
                    params![url, InstallState::Redundant.as_i64()],
                    row_to_record,
                )
                .optional()?)
        })
        .await
    }

    /// Every record for a script URL, newest first.
    pub async fn records_for_url(&self, url: &Url) -> Result<Vec<WorkerRecord>> {
        let url = url.to_string();
        self.run(move |conn| {
            let sql = format!(
                "SELECT {} FROM service_workers WHERE url = ?1 ORDER BY instance_id DESC",
                RECORD_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map([url], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    /// Every record currently in `state`, oldest first.
    pub async fn records_in_state(&self, state: InstallState) -> Result<Vec<WorkerRecord>> {
        self.run(move |conn| {
            let sql = format!(
                "SELECT {} FROM service_workers WHERE install_state = ?1 ORDER BY instance_id ASC",
                RECORD_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map([state.as_i64()], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    /// Move one record to `state` inside a transaction.
    pub async fn set_state(&self, id: WorkerId, state: InstallState) -> Result<WorkerMatch> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let record = fetch_record(&tx, id)?.ok_or(ServiceWorkerError::NotFound(id))?;
            ensure_transition(id, record.install_state, state)?;
            update_state(&tx, id, state)?;
            tx.commit()?;

            let mut snapshot = record.to_match();
            snapshot.install_state = state;
            Ok(snapshot)
        })
        .await
    }

    /// Record a freshness check without touching anything else.
    pub async fn touch_last_checked(&self, id: WorkerId, last_checked: i64) -> Result<()> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE service_workers SET last_checked = ?1 WHERE instance_id = ?2",
                params![last_checked, id.raw()],
            )?;
            if changed == 0 {
                return Err(ServiceWorkerError::NotFound(id));
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Candidates whose scope prefixes `url`, restricted to `states`, most
    /// specific scope first and newest first among equal scopes.
    pub async fn find_by_scope_prefix(
        &self,
        url: &Url,
        states: &[InstallState],
    ) -> Result<Vec<WorkerMatch>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (0..states.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT {} FROM service_workers
             WHERE substr(?1, 1, length(scope)) = scope
               AND install_state IN ({})
             ORDER BY length(scope) DESC, instance_id DESC",
            RECORD_COLUMNS, placeholders
        );

        let mut values = vec![Value::Text(url.to_string())];
        values.extend(states.iter().map(|s| Value::Integer(s.as_i64())));

        self.run(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let matches = stmt
                .query_map(params_from_iter(values), |row| {
                    row_to_record(row).map(|r| r.to_match())
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(matches)
        })
        .await
    }

    /// All workers, in any state, registered at the most specific scope that
    /// covers `page_url`. Newest first.
    pub async fn list_for_url(&self, page_url: &Url) -> Result<Vec<WorkerMatch>> {
        let page_url = page_url.to_string();
        self.run(move |conn| {
            let sql = format!(
                "SELECT {} FROM service_workers
                 WHERE scope = (
                    SELECT scope FROM service_workers
                    WHERE substr(?1, 1, length(scope)) = scope
                    ORDER BY length(scope) DESC
                    LIMIT 1
                 )
                 ORDER BY instance_id DESC",
                RECORD_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let matches = stmt
                .query_map([page_url], |row| row_to_record(row).map(|r| r.to_match()))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(matches)
        })
        .await
    }

    /// Finish an activation: `id` becomes `Activated` and every other
    /// non-redundant record for the same script URL becomes `Redundant`, all
    /// in one transaction. Returns one snapshot per changed record, the
    /// activated worker first.
    pub async fn activate_cascade(&self, id: WorkerId) -> Result<Vec<WorkerMatch>> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let record = fetch_record(&tx, id)?.ok_or(ServiceWorkerError::NotFound(id))?;
            if record.install_state != InstallState::Activating {
                return Err(ServiceWorkerError::InvalidTransition {
                    id,
                    from: record.install_state,
                    to: InstallState::Activated,
                });
            }

            let superseded = {
                let sql = format!(
                    "SELECT {} FROM service_workers
                     WHERE url = ?1 AND instance_id != ?2 AND install_state != ?3
                     ORDER BY instance_id ASC",
                    RECORD_COLUMNS
                );
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt
                    .query_map(
                        params![
                            record.url.as_str(),
                            id.raw(),
                            InstallState::Redundant.as_i64()
                        ],
                        row_to_record,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            update_state(&tx, id, InstallState::Activated)?;
            for old in &superseded {
                update_state(&tx, old.id, InstallState::Redundant)?;
            }
            tx.commit()?;

            let mut changed = Vec::with_capacity(superseded.len() + 1);
            let mut activated = record.to_match();
            activated.install_state = InstallState::Activated;
            changed.push(activated);
            changed.extend(superseded.into_iter().map(|old| {
                let mut m = old.to_match();
                m.install_state = InstallState::Redundant;
                m
            }));
            Ok(changed)
        })
        .await
    }
}

fn ensure_transition(id: WorkerId, from: InstallState, to: InstallState) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(ServiceWorkerError::InvalidTransition { id, from, to })
    }
}

fn update_state(tx: &Transaction<'_>, id: WorkerId, state: InstallState) -> Result<()> {
    let changed = tx.execute(
        "UPDATE service_workers SET install_state = ?1 WHERE instance_id = ?2",
        params![state.as_i64(), id.raw()],
    )?;
    if changed == 0 {
        return Err(ServiceWorkerError::NotFound(id));
    }
    Ok(())
}

fn fetch_record(conn: &Connection, id: WorkerId) -> Result<Option<WorkerRecord>> {
    let sql = format!(
        "SELECT {} FROM service_workers WHERE instance_id = ?1",
        RECORD_COLUMNS
    );
    Ok(conn
        .query_row(&sql, [id.raw()], row_to_record)
        .optional()?)
}

fn parse_url_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Url> {
    let raw: String = row.get(idx)?;
    Url::parse(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<WorkerRecord> {
    let raw_state: i64 = row.get(3)?;
    let install_state = InstallState::from_i64(raw_state)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(3, raw_state))?;

    Ok(WorkerRecord {
        id: WorkerId::new(row.get(0)?),
        url: parse_url_column(row, 1)?,
        scope: parse_url_column(row, 2)?,
        install_state,
        last_checked: row.get(4)?,
        content_hash: row.get(5)?,
        content: row.get(6)?,
    })
}

/// Create or migrate the schema.
fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );",
    )?;

    let version: i64 = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);

    if version < 1 {
        create_schema_v1(conn)?;
    }

    Ok(())
}

fn create_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS service_workers (
            instance_id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL,
            scope TEXT NOT NULL,
            install_state INTEGER NOT NULL,
            last_checked INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            contents BLOB NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sw_url ON service_workers(url);
        CREATE INDEX IF NOT EXISTS idx_sw_scope ON service_workers(scope);
        "#,
    )?;

    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
        params![SCHEMA_VERSION, now_secs()],
    )?;

    Ok(())
}
