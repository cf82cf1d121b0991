//! Pool telemetry shared by the blocking and async pools.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Point-in-time snapshot of a connection pool.
///
/// Field names serialize in the shape clients of the console already parse
/// (`MaxOpenConnections`, `InUse`, ...). `wait_duration` is in nanoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PoolStats {
    pub max_open_connections: usize,
    pub open_connections: usize,
    pub in_use: usize,
    pub idle: usize,
    pub wait_count: u64,
    pub wait_duration: u64,
    pub max_idle_closed: u64,
    pub max_idle_time_closed: u64,
    pub max_lifetime_closed: u64,
}

#[derive(Default)]
pub(crate) struct PoolCounters {
    wait_count: AtomicU64,
    wait_nanos: AtomicU64,
    max_idle_closed: AtomicU64,
    max_idle_time_closed: AtomicU64,
    max_lifetime_closed: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn record_wait(&self, waited: Duration) {
        let nanos = waited.as_nanos().min(u128::from(u64::MAX)) as u64;
        self.wait_count.fetch_add(1, Ordering::Relaxed);
        self.wait_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub(crate) fn record_max_idle_closed(&self) {
        self.max_idle_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_max_idle_time_closed(&self) {
        self.max_idle_time_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_max_lifetime_closed(&self) {
        self.max_lifetime_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, max: usize, open: usize, idle: usize) -> PoolStats {
        PoolStats {
            max_open_connections: max,
            open_connections: open,
            in_use: open.saturating_sub(idle),
            idle,
            wait_count: self.wait_count.load(Ordering::Relaxed),
            wait_duration: self.wait_nanos.load(Ordering::Relaxed),
            max_idle_closed: self.max_idle_closed.load(Ordering::Relaxed),
            max_idle_time_closed: self.max_idle_time_closed.load(Ordering::Relaxed),
            max_lifetime_closed: self.max_lifetime_closed.load(Ordering::Relaxed),
        }
    }
}

/// Records one wait on drop, whichever way the acquire ends.
pub(crate) struct WaitTimer<'a> {
    counters: &'a PoolCounters,
    started: Instant,
}

impl<'a> WaitTimer<'a> {
    pub(crate) fn start(counters: &'a PoolCounters) -> Self {
        Self {
            counters,
            started: Instant::now(),
        }
    }
}

impl Drop for WaitTimer<'_> {
    fn drop(&mut self) {
        self.counters.record_wait(self.started.elapsed());
    }
}
