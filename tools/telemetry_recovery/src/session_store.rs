use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::errors::RecoveryError;
use crate::logging::append_run_log;
use crate::runtime::CallJournal;
use crate::types::{SessionRecord, SessionState};

const READ_POOL_SIZE: usize = 2;

type StoreResult<T> = Result<T, RecoveryError>;

/// Durable session records consumed by the recovery pass.
pub trait SessionStore: Send + Sync {
    fn fetch_session(&self, id: &str) -> StoreResult<Option<SessionRecord>>;
    fn update_session(&self, session: &SessionRecord) -> StoreResult<()>;
    /// Sessions with an end time, oldest first.
    fn fetch_finished_sessions(&self) -> StoreResult<Vec<SessionRecord>>;
    /// Removes the record. Deleting a missing record succeeds.
    fn delete_session(&self, session: &SessionRecord) -> StoreResult<()>;
}

#[derive(Debug)]
enum WriteCmd {
    Insert {
        session: SessionRecord,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    Update {
        session: SessionRecord,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
    Delete {
        id: String,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
}

pub struct SqliteSessionStore {
    write_tx: Option<mpsc::Sender<WriteCmd>>,
    read_pool: ReadPool,
    writer_join: Option<thread::JoinHandle<()>>,
    db_path: PathBuf,
}

impl Drop for SqliteSessionStore {
    fn drop(&mut self) {
        // Closing the sender ends the writer loop; joining flushes queued writes.
        drop(self.write_tx.take());
        if let Some(handle) = self.writer_join.take() {
            let _ = handle.join();
        }
    }
}

impl SqliteSessionStore {
    fn sender(&self) -> StoreResult<&mpsc::Sender<WriteCmd>> {
        self.write_tx
            .as_ref()
            .ok_or_else(|| RecoveryError::Database("store is closed".to_string()))
    }

    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        append_run_log(
            "info",
            "session_store.open",
            json!({ "path": path.display().to_string() }),
        );
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RecoveryError::Database(e.to_string()))?;
        }

        let existed_before_open = path.exists();

        // A zero-byte file is left behind by an interrupted create.
        if existed_before_open {
            let meta =
                std::fs::metadata(&path).map_err(|e| RecoveryError::Database(e.to_string()))?;
            if meta.len() == 0 {
                return Err(RecoveryError::Database(format!(
                    "session database is 0 bytes (corrupt): {}",
                    path.display()
                )));
            }
        }

        let mut write_conn = Connection::open(&path).map_err(db_err)?;
        configure_write_connection(&write_conn)?;

        if existed_before_open {
            let integrity: String = write_conn
                .pragma_query_value(None, "quick_check", |row| row.get(0))
                .map_err(db_err)?;
            if integrity != "ok" {
                return Err(RecoveryError::Database(format!(
                    "session database failed integrity check: {integrity}"
                )));
            }
        }

        run_migrations(&mut write_conn)?;

        let (write_tx, mut write_rx) = mpsc::channel(64);
        let writer_join = thread::spawn(move || {
            while let Some(cmd) = write_rx.blocking_recv() {
                match cmd {
                    WriteCmd::Insert { session, reply } => {
                        let _ = reply.send(insert_session(&write_conn, &session));
                    }
                    WriteCmd::Update { session, reply } => {
                        let _ = reply.send(update_session(&write_conn, &session));
                    }
                    WriteCmd::Delete { id, reply } => {
                        let _ = reply.send(delete_session(&write_conn, &id));
                    }
                }
            }
        });

        let read_pool = ReadPool::open(&path, READ_POOL_SIZE)?;
        Ok(Self {
            write_tx: Some(write_tx),
            read_pool,
            writer_join: Some(writer_join),
            db_path: path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Inserts or replaces a session. Used by session producers and fixtures.
    pub fn insert_session(&self, session: &SessionRecord) -> StoreResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender()?
            .blocking_send(WriteCmd::Insert {
                session: session.clone(),
                reply: reply_tx,
            })
            .map_err(|e| RecoveryError::Database(e.to_string()))?;
        let result = reply_rx
            .blocking_recv()
            .map_err(|e| RecoveryError::Database(e.to_string()))?;
        if result.is_ok() {
            append_run_log(
                "debug",
                "session_store.session.inserted",
                json!({ "session_id": session.id }),
            );
        }
        result
    }

    pub fn count_sessions(&self) -> StoreResult<(usize, usize)> {
        self.read_pool.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(CASE WHEN end_time IS NOT NULL THEN 1 ELSE 0 END), 0)
                 FROM sessions",
                [],
                |row| {
                    let total: i64 = row.get(0)?;
                    let finished: i64 = row.get(1)?;
                    Ok((total as usize, finished as usize))
                },
            )
            .map_err(db_err)
        })
    }

    pub fn list_sessions(&self) -> StoreResult<Vec<SessionRecord>> {
        self.read_pool.with_conn(|conn| {
            let mut statement = conn
                .prepare(&format!("{SELECT_SESSION} ORDER BY start_time ASC, id ASC"))
                .map_err(db_err)?;
            decodable_sessions(&mut statement)
        })
    }
}

impl SessionStore for SqliteSessionStore {
    fn fetch_session(&self, id: &str) -> StoreResult<Option<SessionRecord>> {
        self.read_pool.with_conn(|conn| fetch_session(conn, id))
    }

    fn update_session(&self, session: &SessionRecord) -> StoreResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender()?
            .blocking_send(WriteCmd::Update {
                session: session.clone(),
                reply: reply_tx,
            })
            .map_err(|e| RecoveryError::Database(e.to_string()))?;
        let result = reply_rx
            .blocking_recv()
            .map_err(|e| RecoveryError::Database(e.to_string()))?;
        match result {
            Ok(true) => {
                append_run_log(
                    "debug",
                    "session_store.session.updated",
                    json!({
                        "session_id": session.id,
                        "end_time": session.end_time,
                        "crash_report_id": session.crash_report_id,
                    }),
                );
                Ok(())
            }
            Ok(false) => Err(RecoveryError::Database(format!(
                "session {} not found",
                session.id
            ))),
            Err(e) => Err(e),
        }
    }

    fn fetch_finished_sessions(&self) -> StoreResult<Vec<SessionRecord>> {
        self.read_pool.with_conn(|conn| {
            let mut statement = conn
                .prepare(&format!(
                    "{SELECT_SESSION} WHERE end_time IS NOT NULL ORDER BY start_time ASC, id ASC"
                ))
                .map_err(db_err)?;
            decodable_sessions(&mut statement)
        })
    }

    fn delete_session(&self, session: &SessionRecord) -> StoreResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender()?
            .blocking_send(WriteCmd::Delete {
                id: session.id.clone(),
                reply: reply_tx,
            })
            .map_err(|e| RecoveryError::Database(e.to_string()))?;
        let removed = reply_rx
            .blocking_recv()
            .map_err(|e| RecoveryError::Database(e.to_string()))??;
        append_run_log(
            "debug",
            "session_store.session.deleted",
            json!({ "session_id": session.id, "removed": removed }),
        );
        Ok(())
    }
}

#[derive(Clone)]
struct ReadPool {
    conns: Arc<Vec<Mutex<Connection>>>,
    next: Arc<AtomicUsize>,
}

impl ReadPool {
    fn open(path: &Path, size: usize) -> StoreResult<Self> {
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .map_err(db_err)?;
            conn.busy_timeout(std::time::Duration::from_secs(3))
                .map_err(db_err)?;
            conns.push(Mutex::new(conn));
        }

        Ok(Self {
            conns: Arc::new(conns),
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        let guard = self.conns[idx]
            .lock()
            .map_err(|_| RecoveryError::Database("read connection lock poisoned".to_string()))?;
        f(&guard)
    }
}

fn configure_write_connection(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(db_err)?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(db_err)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(db_err)?;
    Ok(())
}

fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    let migrations = [
        (1_i64, include_str!("../migrations/0001_sessions.sql")),
        (2_i64, include_str!("../migrations/0002_session_properties.sql")),
    ];

    conn.execute_batch("BEGIN IMMEDIATE; CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL); COMMIT;")
        .map_err(db_err)?;

    for (version, sql) in migrations {
        let exists = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some();

        if exists {
            continue;
        }

        append_run_log(
            "info",
            "session_store.migration.applying",
            json!({ "version": version }),
        );
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, system_time_unix()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
    }

    Ok(())
}

const SELECT_SESSION: &str = "SELECT id, process_id, state, start_time, end_time, last_heartbeat_time, \
        crash_report_id, cold_start, clean_exit, app_terminated, properties FROM sessions";

fn insert_session(conn: &Connection, session: &SessionRecord) -> StoreResult<()> {
    let properties = properties_to_db(&session.properties)?;
    conn.execute(
        "INSERT INTO sessions (
            id, process_id, state, start_time, end_time, last_heartbeat_time,
            crash_report_id, cold_start, clean_exit, app_terminated, properties
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(id) DO UPDATE SET
            process_id = excluded.process_id,
            state = excluded.state,
            start_time = excluded.start_time,
            end_time = excluded.end_time,
            last_heartbeat_time = excluded.last_heartbeat_time,
            crash_report_id = excluded.crash_report_id,
            cold_start = excluded.cold_start,
            clean_exit = excluded.clean_exit,
            app_terminated = excluded.app_terminated,
            properties = excluded.properties",
        params![
            session.id,
            session.process_id,
            session.state.as_str(),
            session.start_time,
            session.end_time,
            session.last_heartbeat_time,
            session.crash_report_id,
            session.cold_start,
            session.clean_exit,
            session.app_terminated,
            properties,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn update_session(conn: &Connection, session: &SessionRecord) -> StoreResult<bool> {
    let properties = properties_to_db(&session.properties)?;
    let changed = conn
        .execute(
            "UPDATE sessions
             SET process_id = ?2,
                 state = ?3,
                 start_time = ?4,
                 end_time = ?5,
                 last_heartbeat_time = ?6,
                 crash_report_id = ?7,
                 cold_start = ?8,
                 clean_exit = ?9,
                 app_terminated = ?10,
                 properties = ?11
             WHERE id = ?1",
            params![
                session.id,
                session.process_id,
                session.state.as_str(),
                session.start_time,
                session.end_time,
                session.last_heartbeat_time,
                session.crash_report_id,
                session.cold_start,
                session.clean_exit,
                session.app_terminated,
                properties,
            ],
        )
        .map_err(db_err)?;
    Ok(changed > 0)
}

fn delete_session(conn: &Connection, id: &str) -> StoreResult<bool> {
    let changed = conn
        .execute("DELETE FROM sessions WHERE id = ?1", [id])
        .map_err(db_err)?;
    Ok(changed > 0)
}

fn fetch_session(conn: &Connection, id: &str) -> StoreResult<Option<SessionRecord>> {
    conn.query_row(
        &format!("{SELECT_SESSION} WHERE id = ?1"),
        [id],
        row_to_session,
    )
    .optional()
    .map_err(db_err)
}

/// Rows written by other components may not decode; those are logged and
/// left in place so they never block the rest of the listing.
fn decodable_sessions(statement: &mut rusqlite::Statement<'_>) -> StoreResult<Vec<SessionRecord>> {
    let mut rows = statement.query([]).map_err(db_err)?;
    let mut sessions = Vec::new();
    while let Some(row) = rows.next().map_err(db_err)? {
        match row_to_session(row) {
            Ok(session) => sessions.push(session),
            Err(e) => append_run_log(
                "warn",
                "session_store.row.undecodable",
                json!({
                    "session_id": row.get::<_, String>(0).unwrap_or_default(),
                    "error": e.to_string(),
                }),
            ),
        }
    }
    Ok(sessions)
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let state = row.get::<_, String>(2)?;
    let properties = row.get::<_, String>(10)?;

    Ok(SessionRecord {
        id: row.get(0)?,
        process_id: row.get(1)?,
        state: SessionState::from_db(&state).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "invalid session state",
                )),
            )
        })?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        last_heartbeat_time: row.get(5)?,
        crash_report_id: row.get(6)?,
        cold_start: row.get(7)?,
        clean_exit: row.get(8)?,
        app_terminated: row.get(9)?,
        properties: serde_json::from_str(&properties).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, Box::new(e))
        })?,
    })
}

fn properties_to_db(properties: &BTreeMap<String, String>) -> StoreResult<String> {
    serde_json::to_string(properties).map_err(|e| RecoveryError::Database(e.to_string()))
}

fn db_err(error: rusqlite::Error) -> RecoveryError {
    RecoveryError::Database(error.to_string())
}

pub fn system_time_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Fetch,
    Update,
    FetchFinished,
    Delete,
}

/// In-memory [`SessionStore`] with injectable failures.
///
/// Calls are recorded in the journal as `store.fetch:<id>`, `store.update:<id>`,
/// `store.fetch_finished` and `store.delete:<id>`.
#[derive(Default, Clone)]
pub struct MemorySessionStore {
    sessions: Arc<Mutex<BTreeMap<String, SessionRecord>>>,
    failures: Arc<Mutex<HashMap<(StoreOp, String), RecoveryError>>>,
    journal: CallJournal,
}

impl MemorySessionStore {
    pub fn with_journal(journal: CallJournal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub fn insert(&self, session: SessionRecord) {
        self.sessions
            .lock()
            .expect("sessions lock")
            .insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        self.sessions.lock().expect("sessions lock").get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("sessions lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fails `op` for `session_id`; `"*"` matches every id.
    pub fn fail_on(&self, op: StoreOp, session_id: &str, error: RecoveryError) {
        self.failures
            .lock()
            .expect("failures lock")
            .insert((op, session_id.to_string()), error);
    }

    pub fn journal(&self) -> &CallJournal {
        &self.journal
    }

    fn check(&self, op: StoreOp, session_id: &str) -> StoreResult<()> {
        let failures = self.failures.lock().expect("failures lock");
        if let Some(err) = failures
            .get(&(op, session_id.to_string()))
            .or_else(|| failures.get(&(op, "*".to_string())))
        {
            return Err(err.clone());
        }
        Ok(())
    }
}

impl SessionStore for MemorySessionStore {
    fn fetch_session(&self, id: &str) -> StoreResult<Option<SessionRecord>> {
        self.journal.record(format!("store.fetch:{id}"));
        self.check(StoreOp::Fetch, id)?;
        Ok(self.get(id))
    }

    fn update_session(&self, session: &SessionRecord) -> StoreResult<()> {
        self.journal.record(format!("store.update:{}", session.id));
        self.check(StoreOp::Update, &session.id)?;
        let mut sessions = self.sessions.lock().expect("sessions lock");
        match sessions.get_mut(&session.id) {
            Some(existing) => {
                *existing = session.clone();
                Ok(())
            }
            None => Err(RecoveryError::Database(format!(
                "session {} not found",
                session.id
            ))),
        }
    }

    fn fetch_finished_sessions(&self) -> StoreResult<Vec<SessionRecord>> {
        self.journal.record("store.fetch_finished");
        self.check(StoreOp::FetchFinished, "*")?;
        let mut finished = self
            .sessions
            .lock()
            .expect("sessions lock")
            .values()
            .filter(|session| session.is_finished())
            .cloned()
            .collect::<Vec<_>>();
        finished.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        Ok(finished)
    }

    fn delete_session(&self, session: &SessionRecord) -> StoreResult<()> {
        self.journal.record(format!("store.delete:{}", session.id));
        self.check(StoreOp::Delete, &session.id)?;
        self.sessions
            .lock()
            .expect("sessions lock")
            .remove(&session.id);
        Ok(())
    }
}
