//! The capability the console core consumes: run a query, walk its cursor,
//! report pool telemetry.

use std::future::Future;

use thiserror::Error;

use crate::async_pool::{AsyncAcquireError, CancelToken};
use crate::pool::AcquireError;
use crate::stats::PoolStats;
use crate::value::{ScanType, Slot};

/// Failure reported by a store. The message is the backend's own text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Executing the statement failed (syntax, semantics, connectivity).
    #[error("{0}")]
    Query(String),

    /// Column names or types could not be resolved.
    #[error("{0}")]
    Columns(String),

    /// A row could not be decoded into its slots.
    #[error("{0}")]
    Scan(String),

    /// No connection could be obtained from the pool.
    #[error("{0}")]
    Pool(String),

    #[error("query cancelled")]
    Cancelled,
}

impl StoreError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled)
    }
}

impl From<AsyncAcquireError> for StoreError {
    fn from(err: AsyncAcquireError) -> Self {
        match err {
            AsyncAcquireError::Cancelled => StoreError::Cancelled,
            other => StoreError::Pool(other.to_string()),
        }
    }
}

impl From<AcquireError> for StoreError {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::Cancelled => StoreError::Cancelled,
            other => StoreError::Pool(other.to_string()),
        }
    }
}

/// A handle that executes arbitrary query text.
///
/// Implementations own their pooling and locking; callers share one store
/// across every session.
pub trait Store: Send + Sync + 'static {
    type Cursor: Cursor;

    /// Executes `sql`. Cancelling `cancel` aborts the statement.
    fn query(
        &self,
        sql: &str,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<Self::Cursor, StoreError>> + Send;

    fn pool_stats(&self) -> PoolStats;
}

/// Row iterator over an executed query.
pub trait Cursor: Send {
    fn column_names(&self) -> Result<Vec<String>, StoreError>;

    fn column_types(&self) -> Result<Vec<ScanType>, StoreError>;

    /// Moves to the next row. `Ok(false)` once the result is exhausted.
    fn advance(&mut self) -> Result<bool, StoreError>;

    /// Decodes the current row into `slots`, one per column.
    fn scan_into(&mut self, slots: &mut [Slot]) -> Result<(), StoreError>;

    /// Reports a fault that surfaced after the last row was delivered.
    fn finish(self) -> Result<(), StoreError>;
}

pub(crate) fn slot_count_mismatch(expected: usize, got: usize) -> StoreError {
    StoreError::Scan(format!(
        "expected {expected} destination slots, got {got}"
    ))
}
