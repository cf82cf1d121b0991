//! Async connection pool and cancellation primitives.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::lock;
use crate::stats::{PoolCounters, PoolStats, WaitTimer};

struct AsyncPoolState<T> {
    idle: Vec<T>,
}

pub type FactoryFuture<T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send>>;

/// An async bounded pool for reusable connection-like objects.
pub struct AsyncPool<T> {
    max: usize,
    max_idle: Option<usize>,
    factory: Box<dyn Fn() -> FactoryFuture<T> + Send + Sync>,
    state: Mutex<AsyncPoolState<T>>,
    available: Notify,
    in_flight: AtomicUsize,
    counters: PoolCounters,
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum AsyncAcquireError {
    #[error("timed out waiting for a pooled connection")]
    Timeout,
    #[error("connection acquire cancelled")]
    Cancelled,
    #[error("{0}")]
    Create(String),
}

/// Cooperative cancellation flag.
///
/// Tokens form a tree: cancelling a token cancels every child created from
/// it, while cancelling a child leaves the parent untouched.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: CancellationToken,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is cancelled together with `self`.
    pub fn child(&self) -> CancelToken {
        Self {
            inner: self.inner.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }
}

/// A pooled async value that returns to the pool on drop.
pub struct AsyncPooled<T> {
    pool: Arc<AsyncPool<T>>,
    value: Option<T>,
}

impl<T> AsyncPool<T> {
    pub fn new<F, Fut, E>(max: usize, factory: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::fmt::Display,
    {
        Self::with_max_idle(max, None, factory)
    }

    /// Like [`AsyncPool::new`], closing released connections once `max_idle`
    /// are already parked.
    pub fn with_max_idle<F, Fut, E>(max: usize, max_idle: Option<usize>, factory: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::fmt::Display,
    {
        let factory = Box::new(move || {
            let fut = factory();
            Box::pin(async move { fut.await.map_err(|err| err.to_string()) }) as FactoryFuture<T>
        });
        Arc::new(Self {
            max: max.max(1),
            max_idle,
            factory,
            state: Mutex::new(AsyncPoolState { idle: Vec::new() }),
            available: Notify::new(),
            in_flight: AtomicUsize::new(0),
            counters: PoolCounters::default(),
        })
    }

    pub async fn acquire(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<AsyncPooled<T>, AsyncAcquireError> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        let mut waiting: Option<WaitTimer<'_>> = None;
        loop {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(AsyncAcquireError::Cancelled);
                }
            }
            // Register interest before inspecting state so a release between
            // the check and the wait still wakes us.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let item = lock(&self.state).idle.pop();
            if let Some(item) = item {
                return Ok(self.checkout(item));
            }
            if self.try_reserve() {
                match (self.factory)().await {
                    Ok(item) => {
                        return Ok(self.checkout(item));
                    }
                    Err(err) => {
                        self.discard();
                        return Err(AsyncAcquireError::Create(err));
                    }
                }
            }

            if waiting.is_none() {
                waiting = Some(WaitTimer::start(&self.counters));
            }
            let wait = match deadline {
                None => None,
                Some(limit) => {
                    let now = Instant::now();
                    if now >= limit {
                        return Err(AsyncAcquireError::Timeout);
                    }
                    Some(limit - now)
                }
            };

            match (cancel, wait) {
                (Some(token), Some(duration)) => {
                    tokio::select! {
                        _ = notified => {},
                        _ = token.cancelled() => return Err(AsyncAcquireError::Cancelled),
                        _ = sleep(duration) => return Err(AsyncAcquireError::Timeout),
                    }
                }
                (Some(token), None) => {
                    tokio::select! {
                        _ = notified => {},
                        _ = token.cancelled() => return Err(AsyncAcquireError::Cancelled),
                    }
                }
                (None, Some(duration)) => {
                    tokio::select! {
                        _ = notified => {},
                        _ = sleep(duration) => return Err(AsyncAcquireError::Timeout),
                    }
                }
                (None, None) => {
                    notified.await;
                }
            }
        }
    }

    fn try_reserve(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| {
                (open < self.max).then_some(open + 1)
            })
            .is_ok()
    }

    fn checkout(self: &Arc<Self>, item: T) -> AsyncPooled<T> {
        AsyncPooled {
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

    pub(crate) fn counters(&self) -> &PoolCounters {
        &self.counters
    }

    fn release(&self, item: T) {
        let mut state = lock(&self.state);
        if self.max_idle.is_some_and(|max_idle| state.idle.len() >= max_idle) {
            drop(state);
            drop(item);
            self.counters.record_max_idle_closed();
            self.discard();
            return;
        }
        state.idle.push(item);
        drop(state);
        self.available.notify_one();
    }

    fn discard(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.available.notify_one();
    }
}

impl<T> AsyncPooled<T> {
    /// Closes the connection instead of returning it, freeing its slot.
    pub fn discard(mut self) {
        if self.value.take().is_some() {
            self.pool.discard();
        }
    }
}

impl<T> AsRef<T> for AsyncPooled<T> {
    fn as_ref(&self) -> &T {
        self.value
            .as_ref()
            .expect("AsyncPooled value missing (already released)")
    }
}

impl<T> Drop for AsyncPooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.value.take() {
            self.pool.release(item);
        }
    }
}
