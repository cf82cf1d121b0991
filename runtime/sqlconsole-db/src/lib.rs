//! Store layer for the SQL console: connection pools, the `Store`/`Cursor`
//! capability consumed by the query executor, and the dynamically typed values
//! a cursor decodes rows into.
//!
//! Postgres (`postgres` feature) and SQLite (`sqlite` feature) are the two
//! shipped backends. Both are enabled by default.

pub mod async_pool;
pub mod pool;
pub mod stats;
pub mod store;
pub mod value;

#[cfg(all(feature = "postgres", not(target_arch = "wasm32")))]
pub mod postgres;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub mod sqlite;

pub use async_pool::{AsyncAcquireError, AsyncPool, AsyncPooled, CancelToken};
pub use pool::{AcquireError, Pool, Pooled};
pub use stats::PoolStats;
pub use store::{Cursor, Store, StoreError};
pub use value::{DynamicValue, ScanType, Slot};

#[cfg(all(feature = "postgres", not(target_arch = "wasm32")))]
pub use postgres::{DEFAULT_MAX_IDLE_CONNS, PgPool, PgPoolConfig, PgStore};
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use sqlite::{SqliteOpenMode, SqliteStore};

/// Pool state stays consistent across a panicking holder, so poisoning is ignored.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
