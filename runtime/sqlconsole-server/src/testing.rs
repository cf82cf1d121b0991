//! Test doubles: scripted stores, cursors and an in-memory channel.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sqlconsole_db::{
    CancelToken, Cursor, DynamicValue, PoolStats, ScanType, Slot, SqliteOpenMode, SqliteStore,
    Store, StoreError,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::protocol::Frame;
use crate::session::{Channel, SessionError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    Columns,
    Scan,
    Finish,
}

#[derive(Clone, Debug)]
pub struct FakeCursor {
    names: Vec<String>,
    scan_types: Vec<ScanType>,
    rows: VecDeque<Vec<DynamicValue>>,
    current: Option<Vec<DynamicValue>>,
    fault: Option<Fault>,
}

impl FakeCursor {
    pub fn new(columns: &[(&str, ScanType)], rows: Vec<Vec<DynamicValue>>) -> Self {
        Self {
            names: columns.iter().map(|(name, _)| name.to_string()).collect(),
            scan_types: columns.iter().map(|(_, scan_type)| *scan_type).collect(),
            rows: rows.into(),
            current: None,
            fault: None,
        }
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }
}

impl Cursor for FakeCursor {
    fn column_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.names.clone())
    }

    fn column_types(&self) -> Result<Vec<ScanType>, StoreError> {
        if self.fault == Some(Fault::Columns) {
            return Err(StoreError::Columns("unsupported column type point".into()));
        }
        Ok(self.scan_types.clone())
    }

    fn advance(&mut self) -> Result<bool, StoreError> {
        self.current = self.rows.pop_front();
        Ok(self.current.is_some())
    }

    fn scan_into(&mut self, slots: &mut [Slot]) -> Result<(), StoreError> {
        if self.fault == Some(Fault::Scan) {
            return Err(StoreError::Scan(
                "cannot store text value in int column".into(),
            ));
        }
        let row = self.current.take().unwrap_or_default();
        if row.len() != slots.len() {
            return Err(StoreError::Scan(format!(
                "expected {} destination slots, got {}",
                row.len(),
                slots.len()
            )));
        }
        for (slot, value) in slots.iter_mut().zip(row) {
            slot.fill(value)?;
        }
        Ok(())
    }

    fn finish(self) -> Result<(), StoreError> {
        if self.fault == Some(Fault::Finish) {
            return Err(StoreError::Query("connection reset mid-result".into()));
        }
        Ok(())
    }
}

/// Store that replays one cursor and counts executed queries.
pub struct FakeStore {
    cursor: FakeCursor,
    query_error: Option<StoreError>,
    hang: bool,
    queries: AtomicUsize,
}

impl Default for FakeStore {
    fn default() -> Self {
        Self::with_cursor(FakeCursor::new(
            &[("n", ScanType::Int)],
            vec![vec![DynamicValue::Int(1)]],
        ))
    }
}

impl FakeStore {
    pub fn with_cursor(cursor: FakeCursor) -> Self {
        Self {
            cursor,
            query_error: None,
            hang: false,
            queries: AtomicUsize::new(0),
        }
    }

    pub fn with_query_error(mut self, err: StoreError) -> Self {
        self.query_error = Some(err);
        self
    }

    /// Queries block until cancelled.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl Store for FakeStore {
    type Cursor = FakeCursor;

    fn query(
        &self,
        _sql: &str,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<FakeCursor, StoreError>> + Send {
        async move {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                cancel.cancelled().await;
                return Err(StoreError::Cancelled);
            }
            match &self.query_error {
                Some(err) => Err(err.clone()),
                None => Ok(self.cursor.clone()),
            }
        }
    }

    fn pool_stats(&self) -> PoolStats {
        PoolStats {
            max_open_connections: 2,
            ..PoolStats::default()
        }
    }
}

/// Fresh read-write SQLite database in a temporary directory.
pub fn sqlite_store() -> (TempDir, Arc<SqliteStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::open(&dir.path().join("console.db"), 2, SqliteOpenMode::ReadWrite)
        .expect("open sqlite");
    (dir, Arc::new(store))
}

pub struct MemoryChannel {
    inbound: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<Frame>,
}

/// The client side of a [`MemoryChannel`]. Dropping `to_server` closes it.
pub struct Peer {
    pub to_server: mpsc::UnboundedSender<Frame>,
    pub from_server: mpsc::UnboundedReceiver<Frame>,
}

pub fn memory_channel() -> (MemoryChannel, Peer) {
    let (to_server, inbound) = mpsc::unbounded_channel();
    let (outbound, from_server) = mpsc::unbounded_channel();
    (
        MemoryChannel { inbound, outbound },
        Peer {
            to_server,
            from_server,
        },
    )
}

impl Channel for MemoryChannel {
    fn receive(&mut self) -> impl Future<Output = Result<Option<Frame>, SessionError>> + Send {
        async move { Ok(self.inbound.recv().await) }
    }

    fn send(&mut self, frame: Frame) -> impl Future<Output = Result<(), SessionError>> + Send {
        async move {
            self.outbound
                .send(frame)
                .map_err(|_| SessionError::Send("peer went away".into()))
        }
    }
}
