//! Blocking connection pool, used by stores whose driver is synchronous.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::lock;
use crate::stats::{PoolCounters, PoolStats, WaitTimer};

struct PoolState<T> {
    idle: Vec<T>,
}

type Factory<T> = Box<dyn Fn() -> Result<T, String> + Send + Sync>;

/// A bounded pool for reusable connection-like objects.
pub struct Pool<T> {
    max: usize,
    factory: Factory<T>,
    state: Mutex<PoolState<T>>,
    available: Condvar,
    in_flight: AtomicUsize,
    counters: PoolCounters,
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum AcquireError {
    #[error("timed out waiting for a pooled connection")]
    Timeout,
    #[error("connection acquire cancelled")]
    Cancelled,
    #[error("{0}")]
    Create(String),
}

/// A pooled value that returns to the pool on drop.
pub struct Pooled<T> {
    pool: Arc<Pool<T>>,
    value: Option<T>,
}

impl<T> Pool<T> {
    pub fn new<F, E>(max: usize, factory: F) -> Arc<Self>
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        E: std::fmt::Display,
    {
        Arc::new(Self {
            max: max.max(1),
            factory: Box::new(move || factory().map_err(|err| err.to_string())),
            state: Mutex::new(PoolState { idle: Vec::new() }),
            available: Condvar::new(),
            in_flight: AtomicUsize::new(0),
            counters: PoolCounters::default(),
        })
    }

    pub fn acquire(self: &Arc<Self>, timeout: Option<Duration>) -> Result<Pooled<T>, AcquireError> {
        self.acquire_with_cancel(timeout, || false)
    }

    /// Waits for a connection, polling `cancel_check` while blocked.
    pub fn acquire_with_cancel<F>(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        mut cancel_check: F,
    ) -> Result<Pooled<T>, AcquireError>
    where
        F: FnMut() -> bool,
    {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        let poll = Duration::from_millis(5);
        let mut waiting: Option<WaitTimer<'_>> = None;
        loop {
            if cancel_check() {
                return Err(AcquireError::Cancelled);
            }
            let mut state = lock(&self.state);
            if let Some(item) = state.idle.pop() {
                return Ok(self.checkout(item));
            }

            if self.in_flight.load(Ordering::SeqCst) < self.max {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                drop(state);
                return match (self.factory)() {
                    Ok(item) => Ok(self.checkout(item)),
                    Err(err) => {
                        self.discard();
                        Err(AcquireError::Create(err))
                    }
                };
            }

            if waiting.is_none() {
                waiting = Some(WaitTimer::start(&self.counters));
            }
            let wait = match deadline {
                None => poll,
                Some(limit) => {
                    let now = Instant::now();
                    if now >= limit {
                        return Err(AcquireError::Timeout);
                    }
                    (limit - now).min(poll)
                }
            };
            let (guard, _) = self
                .available
                .wait_timeout(state, wait)
                .unwrap_or_else(PoisonError::into_inner);
            drop(guard);
            if deadline.is_some_and(|limit| Instant::now() >= limit) {
                return Err(AcquireError::Timeout);
            }
        }
    }

    fn checkout(self: &Arc<Self>, item: T) -> Pooled<T> {
        Pooled {
            pool: Arc::clone(self),
            value: Some(item),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        lock(&self.state).idle.len()
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.idle_count();
        self.counters.snapshot(self.max, self.in_flight(), idle)
    }

    fn release(&self, item: T) {
        lock(&self.state).idle.push(item);
        self.available.notify_one();
    }

    fn discard(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.available.notify_one();
    }
}

impl<T> Pooled<T> {
    pub fn discard(mut self) {
        if self.value.take().is_some() {
            self.pool.discard();
        }
    }
}

impl<T> AsRef<T> for Pooled<T> {
    fn as_ref(&self) -> &T {
        self.value
            .as_ref()
            .expect("Pooled value missing (already released)")
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.value.take() {
            self.pool.release(item);
        }
    }
}
