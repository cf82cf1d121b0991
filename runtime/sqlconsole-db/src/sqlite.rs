//! SQLite store backed by the blocking pool.
//!
//! Statements run on tokio's blocking threads. Cancellation interrupts the
//! connection executing the statement.

use std::collections::VecDeque;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::{Connection, InterruptHandle, OpenFlags};

use crate::async_pool::CancelToken;
use crate::lock;
use crate::pool::Pool;
use crate::stats::PoolStats;
use crate::store::{Cursor, Store, StoreError, slot_count_mismatch};
use crate::value::{DynamicValue, ScanType, Slot};

const BUSY_TIMEOUT_MS: u64 = 100;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug)]
pub enum SqliteOpenMode {
    ReadOnly,
    ReadWrite,
}

pub struct SqliteConn {
    conn: Connection,
}

impl SqliteConn {
    pub fn open(path: &Path, mode: SqliteOpenMode) -> Result<Self, rusqlite::Error> {
        let flags = match mode {
            SqliteOpenMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
            SqliteOpenMode::ReadWrite => {
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
            }
        };
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        if matches!(mode, SqliteOpenMode::ReadOnly) {
            conn.pragma_update(None, "query_only", 1)?;
        }
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

pub fn sqlite_pool(path: &Path, pool_size: usize, mode: SqliteOpenMode) -> Arc<Pool<SqliteConn>> {
    let path = path.to_path_buf();
    Pool::new(pool_size, move || SqliteConn::open(&path, mode))
}

/// Maps a declared column type to a scan type using SQLite's affinity rules.
/// Undeclared columns (expressions) and NUMERIC/BLOB affinity are per-value.
pub fn scan_type_for_decl(decl_type: Option<&str>) -> ScanType {
    let Some(decl) = decl_type else {
        return ScanType::Dynamic;
    };
    let decl = decl.to_ascii_uppercase();
    if decl.contains("INT") {
        ScanType::Int
    } else if ["CHAR", "CLOB", "TEXT"].iter().any(|tag| decl.contains(tag)) {
        ScanType::Text
    } else if ["REAL", "FLOA", "DOUB"].iter().any(|tag| decl.contains(tag)) {
        ScanType::Float
    } else {
        ScanType::Dynamic
    }
}

fn decode(value: Value, scan_type: ScanType) -> DynamicValue {
    match (value, scan_type) {
        (Value::Null, _) => DynamicValue::Null,
        (Value::Integer(v), ScanType::Float) => DynamicValue::Float(v as f64),
        (Value::Integer(v), _) => DynamicValue::Int(v),
        (Value::Real(v), _) => DynamicValue::Float(v),
        (Value::Text(v), _) => DynamicValue::Text(v),
        (Value::Blob(v), _) => DynamicValue::Bytes(v),
    }
}

pub struct SqliteStore {
    pool: Arc<Pool<SqliteConn>>,
    acquire_timeout: Duration,
}

impl SqliteStore {
    /// Opens the database once up front so a bad path fails at startup.
    pub fn open(path: &Path, pool_size: usize, mode: SqliteOpenMode) -> Result<Self, rusqlite::Error> {
        SqliteConn::open(path, mode)?;
        Ok(Self {
            pool: sqlite_pool(path, pool_size, mode),
            acquire_timeout: ACQUIRE_TIMEOUT,
        })
    }
}

type SharedInterrupt = Arc<Mutex<Option<InterruptHandle>>>;

impl Store for SqliteStore {
    type Cursor = SqliteCursor;

    fn query(
        &self,
        sql: &str,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<SqliteCursor, StoreError>> + Send {
        let pool = Arc::clone(&self.pool);
        let sql = sql.to_owned();
        let cancel = cancel.clone();
        let timeout = self.acquire_timeout;
        async move {
            let interrupt = SharedInterrupt::default();
            let mut task = {
                let interrupt = Arc::clone(&interrupt);
                let cancel = cancel.clone();
                tokio::task::spawn_blocking(move || {
                    run_query(&pool, &sql, timeout, &cancel, &interrupt)
                })
            };
            tokio::select! {
                joined = &mut task => {
                    return joined.map_err(|err| StoreError::Query(err.to_string()))?;
                }
                _ = cancel.cancelled() => {}
            }
            if let Some(handle) = lock(&interrupt).as_ref() {
                handle.interrupt();
            }
            // The connection goes back to the pool once the statement unwinds.
            let _ = task.await;
            Err(StoreError::Cancelled)
        }
    }

    fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

/// Disarms the shared interrupt handle before the connection returns to the pool.
struct ArmedInterrupt<'a>(&'a SharedInterrupt);

impl Drop for ArmedInterrupt<'_> {
    fn drop(&mut self) {
        lock(self.0).take();
    }
}

fn run_query(
    pool: &Arc<Pool<SqliteConn>>,
    sql: &str,
    timeout: Duration,
    cancel: &CancelToken,
    interrupt: &SharedInterrupt,
) -> Result<SqliteCursor, StoreError> {
    let conn = pool.acquire_with_cancel(Some(timeout), || cancel.is_cancelled())?;
    let connection = conn.as_ref().connection();
    *lock(interrupt) = Some(connection.get_interrupt_handle());
    let _armed = ArmedInterrupt(interrupt);
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }

    let mut stmt = connection
        .prepare(sql)
        .map_err(|err| StoreError::Query(err.to_string()))?;
    let (names, scan_types): (Vec<String>, Vec<ScanType>) = stmt
        .columns()
        .iter()
        .map(|column| (column.name().to_string(), scan_type_for_decl(column.decl_type())))
        .unzip();

    let mut rows = stmt
        .query([])
        .map_err(|err| StoreError::Query(err.to_string()))?;
    let mut buffered = VecDeque::new();
    let mut deferred = None;
    loop {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        match rows.next() {
            Ok(Some(row)) => {
                let mut values = Vec::with_capacity(names.len());
                for idx in 0..names.len() {
                    let value = row
                        .get_ref(idx)
                        .map_err(|err| StoreError::Scan(err.to_string()))?;
                    values.push(Value::from(value));
                }
                buffered.push_back(values);
            }
            Ok(None) => break,
            Err(_) if cancel.is_cancelled() => return Err(StoreError::Cancelled),
            Err(err) if buffered.is_empty() => return Err(StoreError::Query(err.to_string())),
            Err(err) => {
                deferred = Some(StoreError::Query(err.to_string()));
                break;
            }
        }
    }

    Ok(SqliteCursor {
        names,
        scan_types,
        rows: buffered,
        current: None,
        deferred,
    })
}

/// Result of a SQLite statement, stepped to completion on the blocking pool.
pub struct SqliteCursor {
    names: Vec<String>,
    scan_types: Vec<ScanType>,
    rows: VecDeque<Vec<Value>>,
    current: Option<Vec<Value>>,
    deferred: Option<StoreError>,
}

impl Cursor for SqliteCursor {
    fn column_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.names.clone())
    }

    fn column_types(&self) -> Result<Vec<ScanType>, StoreError> {
        Ok(self.scan_types.clone())
    }

    fn advance(&mut self) -> Result<bool, StoreError> {
        self.current = self.rows.pop_front();
        Ok(self.current.is_some())
    }

    fn scan_into(&mut self, slots: &mut [Slot]) -> Result<(), StoreError> {
        let row = self
            .current
            .take()
            .ok_or_else(|| StoreError::Scan("scan called without a current row".to_string()))?;
        if row.len() != slots.len() {
            return Err(slot_count_mismatch(row.len(), slots.len()));
        }
        for (slot, value) in slots.iter_mut().zip(row) {
            let scan_type = slot.scan_type();
            slot.fill(decode(value, scan_type))?;
        }
        Ok(())
    }

    fn finish(self) -> Result<(), StoreError> {
        self.deferred.map_or(Ok(()), Err)
    }
}
