//! SQLite-backed registry store
//!
//! Lets several server processes share one pool: each opens the same database file
//! and every registry step runs as a single statement or an IMMEDIATE transaction,
//! so SQLite's write lock provides the cross-process mutual exclusion.

use crate::error::PoolError;
use crate::identity::{ClassKey, ProcessClassIdentity};
use crate::registry::{RegistryStore, ReserveResult, SlotLimits, WorkerEntry, WorkerId, WorkerState};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// How long a writer waits for another process's lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const COLUMNS: &str = "id, path, inode, device_id, share_group_id, pid, socket_path, state, \
                       created_at, last_active_at, retired_at, requests_served, owner_pid";

/// Registry store shared between server processes through one database file
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the registry at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;

        info!("Shared registry opened at {}", path.display());
        Ok(store)
    }

    /// Open a private in-memory registry (for testing)
    pub fn open_in_memory() -> Result<Self, PoolError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<(), PoolError> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);
            if current_version < 1 {
                migrate_v1(&conn)?;
            }
        }
        Ok(())
    }
}

/// Migration v1: workers table
fn migrate_v1(conn: &Connection) -> Result<(), PoolError> {
    debug!("Applying migration v1: workers");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS workers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL,
            inode INTEGER NOT NULL,
            device_id INTEGER NOT NULL,
            share_group_id INTEGER NOT NULL,
            pid INTEGER NOT NULL DEFAULT 0,
            socket_path TEXT NOT NULL DEFAULT '',
            state TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_active_at INTEGER NOT NULL,
            retired_at INTEGER,
            requests_served INTEGER NOT NULL DEFAULT 0,
            owner_pid INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_workers_class
            ON workers(inode, device_id, share_group_id, state);

        INSERT INTO schema_migrations (version) VALUES (1);
        "#,
    )?;
    Ok(())
}

fn state_list(states: &[WorkerState]) -> String {
    states
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn live_states() -> String {
    state_list(&WorkerState::LIVE)
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<WorkerEntry> {
    let state: String = row.get(7)?;
    let state = WorkerState::parse(&state).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            Type::Text,
            Box::new(PoolError::Store(format!("unknown worker state '{}'", state))),
        )
    })?;
    let path: String = row.get(1)?;
    let socket_path: String = row.get(6)?;

    Ok(WorkerEntry {
        id: WorkerId(row.get::<_, i64>(0)? as u64),
        class: ProcessClassIdentity::new(
            PathBuf::from(path),
            row.get::<_, i64>(2)? as u64,
            row.get::<_, i64>(3)? as u64,
            row.get::<_, i64>(4)? as u64,
        ),
        pid: row.get::<_, i64>(5)? as u32,
        socket_path: PathBuf::from(socket_path),
        state,
        created_at: row.get(8)?,
        last_active_at: row.get(9)?,
        retired_at: row.get(10)?,
        requests_served: row.get::<_, i64>(11)? as u64,
        owner_pid: row.get::<_, i64>(12)? as u32,
    })
}

impl RegistryStore for SqliteStore {
    fn claim_idle(&self, class: &ClassKey, now: i64) -> Result<Option<WorkerEntry>, PoolError> {
        let conn = self.conn.lock();
        let sql = format!(
            "UPDATE workers SET state = 'busy', last_active_at = ?1
             WHERE id = (
                 SELECT id FROM workers
                 WHERE inode = ?2 AND device_id = ?3 AND share_group_id = ?4 AND state = 'idle'
                 ORDER BY id LIMIT 1
             ) AND state = 'idle'
             RETURNING {}",
            COLUMNS
        );
        let entry = conn
            .query_row(
                &sql,
                params![
                    now,
                    class.inode as i64,
                    class.device_id as i64,
                    class.share_group_id as i64
                ],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn reserve(
        &self,
        class: &ProcessClassIdentity,
        limits: SlotLimits,
        owner_pid: u32,
        now: i64,
    ) -> Result<ReserveResult, PoolError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let live = live_states();
        let in_class: i64 = tx.query_row(
            &format!(
                "SELECT COUNT(*) FROM workers
                 WHERE inode = ?1 AND device_id = ?2 AND share_group_id = ?3 AND state IN ({})",
                live
            ),
            params![
                class.inode as i64,
                class.device_id as i64,
                class.share_group_id as i64
            ],
            |row| row.get(0),
        )?;
        if in_class as usize >= limits.max_class {
            return Ok(ReserveResult::ClassFull);
        }

        let total: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM workers WHERE state IN ({})", live),
            [],
            |row| row.get(0),
        )?;
        if total as usize >= limits.max_total {
            return Ok(ReserveResult::PoolFull);
        }

        let entry = tx.query_row(
            &format!(
                "INSERT INTO workers
                    (path, inode, device_id, share_group_id, state, created_at, last_active_at, owner_pid)
                 VALUES (?1, ?2, ?3, ?4, 'spawning', ?5, ?5, ?6)
                 RETURNING {}",
                COLUMNS
            ),
            params![
                class.path.to_string_lossy(),
                class.inode as i64,
                class.device_id as i64,
                class.share_group_id as i64,
                now,
                owner_pid as i64
            ],
            row_to_entry,
        )?;
        tx.commit()?;
        Ok(ReserveResult::Reserved(entry))
    }

    fn activate(
        &self,
        id: WorkerId,
        pid: u32,
        socket_path: &Path,
        to: WorkerState,
        now: i64,
    ) -> Result<Option<WorkerEntry>, PoolError> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                &format!(
                    "UPDATE workers SET state = ?1, pid = ?2, socket_path = ?3, last_active_at = ?4
                     WHERE id = ?5 AND state = 'spawning'
                     RETURNING {}",
                    COLUMNS
                ),
                params![
                    to.as_str(),
                    pid as i64,
                    socket_path.to_string_lossy(),
                    now,
                    id.0 as i64
                ],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn finish(&self, id: WorkerId, to: WorkerState, now: i64) -> Result<Option<WorkerEntry>, PoolError> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                &format!(
                    "UPDATE workers SET
                        state = ?1,
                        requests_served = requests_served + 1,
                        last_active_at = ?2,
                        retired_at = CASE WHEN ?1 = 'terminating' THEN ?2 ELSE retired_at END
                     WHERE id = ?3 AND state = 'busy'
                     RETURNING {}",
                    COLUMNS
                ),
                params![to.as_str(), now, id.0 as i64],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn transition(
        &self,
        id: WorkerId,
        from: &[WorkerState],
        to: WorkerState,
        now: i64,
    ) -> Result<Option<WorkerEntry>, PoolError> {
        if from.is_empty() {
            return Ok(None);
        }
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                &format!(
                    "UPDATE workers SET
                        state = ?1,
                        retired_at = CASE WHEN ?1 = 'terminating' THEN COALESCE(retired_at, ?2)
                                          ELSE retired_at END
                     WHERE id = ?3 AND state IN ({})
                     RETURNING {}",
                    state_list(from),
                    COLUMNS
                ),
                params![to.as_str(), now, id.0 as i64],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn get(&self, id: WorkerId) -> Result<Option<WorkerEntry>, PoolError> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                &format!("SELECT {} FROM workers WHERE id = ?1", COLUMNS),
                params![id.0 as i64],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn remove(&self, id: WorkerId) -> Result<Option<WorkerEntry>, PoolError> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                &format!("DELETE FROM workers WHERE id = ?1 RETURNING {}", COLUMNS),
                params![id.0 as i64],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn snapshot(&self) -> Result<Vec<WorkerEntry>, PoolError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM workers ORDER BY id", COLUMNS))?;
        let entries = stmt
            .query_map([], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn live_counts(&self, class: &ClassKey) -> Result<(usize, usize), PoolError> {
        let conn = self.conn.lock();
        let (in_class, total): (i64, i64) = conn.query_row(
            &format!(
                "SELECT
                    COALESCE(SUM(inode = ?1 AND device_id = ?2 AND share_group_id = ?3), 0),
                    COUNT(*)
                 FROM workers WHERE state IN ({})",
                live_states()
            ),
            params![
                class.inode as i64,
                class.device_id as i64,
                class.share_group_id as i64
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((in_class as usize, total as usize))
    }
}
