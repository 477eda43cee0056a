//! Bounded async pool backing the bundled [`ConnectionPool`] implementations.

use async_trait::async_trait;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::error::BackendError;
use crate::session::{ConnectionPool, Session};
use crate::value::Row;

/// SQLSTATE reported when no connection frees up in time.
const TOO_MANY_CONNECTIONS: &str = "53300";

pub type FactoryFuture<T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send>>;

type Factory<T> = Box<dyn Fn() -> FactoryFuture<T> + Send + Sync>;
type ReuseCheck<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    #[error("timed out waiting for a pooled connection")]
    Timeout,
    #[error("failed to open connection: {0}")]
    Create(BackendError),
}

impl From<AcquireError> for BackendError {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::Timeout => BackendError::database(TOO_MANY_CONNECTIONS, err.to_string()),
            AcquireError::Create(inner) => inner,
        }
    }
}

struct PoolInner<T> {
    max: usize,
    factory: Factory<T>,
    reusable: OnceLock<ReuseCheck<T>>,
    idle: Mutex<Vec<T>>,
    available: Notify,
    in_flight: AtomicUsize,
}

/// Cheaply clonable handle to a bounded pool of connection-like objects.
///
/// The wait limit belongs to the handle (clones copy it); the reuse check
/// belongs to the shared pool.
pub struct AsyncPool<T> {
    inner: Arc<PoolInner<T>>,
    max_wait: Option<Duration>,
}

impl<T> Clone for AsyncPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            max_wait: self.max_wait,
        }
    }
}

/// A slot counted in `in_flight` while its connection is being opened.
/// Released on drop unless handed over to an [`AsyncPooled`].
struct Reservation<'a, T> {
    pool: &'a PoolInner<T>,
    armed: bool,
}

impl<T> Reservation<'_, T> {
    fn fulfil(mut self) {
        self.armed = false;
    }
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.discard();
        }
    }
}

/// A checked-out value; returns to the pool (or is discarded) on drop.
pub struct AsyncPooled<T> {
    pool: Arc<PoolInner<T>>,
    value: Option<T>,
}

impl<T> AsyncPool<T> {
    pub fn new<F, Fut>(max: usize, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BackendError>> + Send + 'static,
    {
        let factory: Factory<T> = Box::new(move || Box::pin(factory()));
        Self {
            inner: Arc::new(PoolInner {
                max: max.max(1),
                factory,
                reusable: OnceLock::new(),
                idle: Mutex::new(Vec::new()),
                available: Notify::new(),
                in_flight: AtomicUsize::new(0),
            }),
            max_wait: None,
        }
    }

    /// Wait at most `max_wait` in [`ConnectionPool::acquire`] on this handle.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Only return values passing `check` to the idle list; others are
    /// dropped and their slot freed.
    ///
    /// Applies to every handle of the pool. A pool takes one check; the
    /// first one installed wins.
    pub fn with_reuse_check<F>(self, check: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        if self.inner.reusable.set(Box::new(check)).is_err() {
            warn!("pool already has a reuse check; ignoring the new one");
        }
        self
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait
    }

    pub async fn acquire_within(
        &self,
        timeout: Option<Duration>,
    ) -> Result<AsyncPooled<T>, AcquireError> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        loop {
            // Register interest before checking state so a release between
            // the check and the wait is not missed.
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.inner.pop_idle() {
                return Ok(self.guard(item));
            }
            if self.inner.try_reserve() {
                let reservation = Reservation {
                    pool: &self.inner,
                    armed: true,
                };
                let item = (self.inner.factory)()
                    .await
                    .map_err(AcquireError::Create)?;
                let pooled = self.guard(item);
                reservation.fulfil();
                return Ok(pooled);
            }

            match deadline {
                None => notified.await,
                Some(limit) => {
                    let now = Instant::now();
                    if now >= limit {
                        return Err(AcquireError::Timeout);
                    }
                    tokio::select! {
                        _ = &mut notified => {},
                        _ = sleep(limit - now) => return Err(AcquireError::Timeout),
                    }
                }
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock_idle().len()
    }

    fn guard(&self, item: T) -> AsyncPooled<T> {
        AsyncPooled {
            pool: Arc::clone(&self.inner),
            value: Some(item),
        }
    }
}

impl<T> PoolInner<T> {
    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<T>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop_idle(&self) -> Option<T> {
        self.lock_idle().pop()
    }

    fn try_reserve(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < self.max).then_some(current + 1)
            })
            .is_ok()
    }

    fn release(&self, item: T) {
        if let Some(check) = self.reusable.get() {
            if !check(&item) {
                debug!("discarding connection returned in an unusable state");
                drop(item);
                self.discard();
                return;
            }
        }
        self.lock_idle().push(item);
        self.available.notify_one();
    }

    fn discard(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.available.notify_one();
    }
}

impl<T> AsyncPooled<T> {
    /// Drop the value without returning it, freeing its slot.
    pub fn discard(mut self) {
        if self.value.take().is_some() {
            self.pool.discard();
        }
    }
}

impl<T> Deref for AsyncPooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => unreachable!("pooled value is only taken on drop or discard"),
        }
    }
}

impl<T> DerefMut for AsyncPooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pooled value is only taken on drop or discard"),
        }
    }
}

impl<T> Drop for AsyncPooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.value.take() {
            self.pool.release(item);
        }
    }
}

#[async_trait]
impl<T: Session + 'static> Session for AsyncPooled<T> {
    async fn begin_read_only(&mut self) -> Result<(), BackendError> {
        (**self).begin_read_only().await
    }

    async fn execute(&mut self, statement: &str) -> Result<(), BackendError> {
        (**self).execute(statement).await
    }

    async fn fetch(&mut self, sql: &str) -> Result<Vec<Row>, BackendError> {
        (**self).fetch(sql).await
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        (**self).commit().await
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        (**self).rollback().await
    }
}

#[async_trait]
impl<T: Session + 'static> ConnectionPool for AsyncPool<T> {
    type Session = AsyncPooled<T>;

    async fn acquire(&self) -> Result<Self::Session, BackendError> {
        Ok(self.acquire_within(self.max_wait).await?)
    }
}
