//! Connection objects for producers and extractors.
//!
//! In pooled mode a [`ConnectionPool`] keeps idle [`ConnectionObject`]s for
//! reuse and caps the number of live objects with a semaphore. Borrowers
//! wait at most the configured timeout for a permit; exhaustion is reported
//! as [`BridgeError::PoolExhausted`]. Idle objects are validated before they
//! are handed out again, and an object that fails validation is destroyed
//! instead of being returned.
//!
//! In unpooled mode every borrow opens a fresh object and releasing the
//! lease destroys it.

use std::{
    fmt,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::{
    config::PoolConfig,
    error::{BridgeError, Result, TransportError},
    shutdown::BestEffort,
    transport::TransportBackend,
};

mod object;

pub use object::ConnectionObject;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Occupancy of a [`ConnectionPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStatus {
    /// Maximum number of live objects, or `None` when unpooled.
    pub max_size: Option<usize>,
    /// Objects waiting in the idle set.
    pub idle: usize,
    /// Objects currently lent out.
    pub in_use: usize,
}

enum Mode {
    Pooled {
        idle: Mutex<Vec<Arc<ConnectionObject>>>,
        permits: Arc<Semaphore>,
        max_size: usize,
        wait: Duration,
    },
    Unpooled,
}

struct PoolInner {
    backend: Arc<dyn TransportBackend>,
    uri: String,
    mode: Mode,
    next_id: AtomicU64,
    lent: AtomicU64,
    closed: AtomicBool,
}

impl PoolInner {
    async fn create(&self, connect_timeout: Option<Duration>) -> Result<ConnectionObject> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let open = ConnectionObject::open(self.backend.as_ref(), &self.uri, id);
        let object = match connect_timeout {
            Some(limit) => tokio::time::timeout(limit, open).await.map_err(|_| {
                TransportError::Connect {
                    uri: self.uri.clone(),
                    source: format!("connect timed out after {limit:?}").into(),
                }
            })??,
            None => open.await?,
        };
        debug!(object = id, "opened connection object");
        Ok(object)
    }

    fn restore(&self, object: Arc<ConnectionObject>) {
        match &self.mode {
            Mode::Pooled { idle, .. } if !self.closed.load(Ordering::SeqCst) => lock(idle).push(object),
            _ => spawn_destroy(object),
        }
    }
}

fn spawn_destroy(object: Arc<ConnectionObject>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                let _ = object.destroy().await;
            });
        }
        Err(_) => warn!(
            object = object.id(),
            "connection object dropped outside a runtime; not closed"
        ),
    }
}

/// Source of [`ConnectionObject`]s, pooled or unpooled.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("uri", &self.inner.uri)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Build a pool of objects connected to `uri` through `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn TransportBackend>, uri: impl Into<String>, config: &PoolConfig) -> Self {
        let mode = if config.enabled {
            let max_size = config.max_size.max(1);
            Mode::Pooled {
                idle: Mutex::new(Vec::with_capacity(max_size)),
                permits: Arc::new(Semaphore::new(max_size)),
                max_size,
                wait: config.wait_timeout,
            }
        } else {
            Mode::Unpooled
        };
        Self {
            inner: Arc::new(PoolInner {
                backend,
                uri: uri.into(),
                mode,
                next_id: AtomicU64::new(0),
                lent: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns true when objects are reused across borrows.
    #[must_use]
    pub fn is_pooled(&self) -> bool { matches!(self.inner.mode, Mode::Pooled { .. }) }

    /// Borrow an object, opening a new one if none is idle.
    ///
    /// `connect_timeout` bounds the wait for a permit and the connect step.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::PoolExhausted`] when no permit frees up in
    /// time, [`BridgeError::PoolClosed`] after [`close`](Self::close), and
    /// the transport error when a new object cannot be opened.
    pub async fn borrow(&self, connect_timeout: Option<Duration>) -> Result<Lease> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::PoolClosed);
        }
        let (object, permit) = match &self.inner.mode {
            Mode::Unpooled => (Arc::new(self.inner.create(connect_timeout).await?), None),
            Mode::Pooled {
                idle,
                permits,
                wait,
                ..
            } => {
                let wait = connect_timeout.map_or(*wait, |limit| limit.min(*wait));
                let permit = tokio::time::timeout(wait, Arc::clone(permits).acquire_owned())
                    .await
                    .map_err(|_| BridgeError::PoolExhausted { waited: Some(wait) })?
                    .map_err(|_| BridgeError::PoolClosed)?;
                let object = match self.take_valid_idle(idle).await {
                    Some(object) => object,
                    None => Arc::new(self.inner.create(connect_timeout).await?),
                };
                (object, Some(permit))
            }
        };
        self.inner.lent.fetch_add(1, Ordering::SeqCst);
        Ok(Lease {
            object,
            permit,
            pool: Arc::clone(&self.inner),
            destroyed: false,
        })
    }

    async fn take_valid_idle(
        &self,
        idle: &Mutex<Vec<Arc<ConnectionObject>>>,
    ) -> Option<Arc<ConnectionObject>> {
        loop {
            let candidate = lock(idle).pop()?;
            match candidate.validate().await {
                Ok(()) => return Some(candidate),
                Err(error) => {
                    warn!(object = candidate.id(), %error, "idle connection object failed validation");
                    let _ = candidate.destroy().await;
                }
            }
        }
    }

    /// Current occupancy.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let in_use = usize::try_from(self.inner.lent.load(Ordering::SeqCst)).unwrap_or(usize::MAX);
        match &self.inner.mode {
            Mode::Pooled { idle, max_size, .. } => PoolStatus {
                max_size: Some(*max_size),
                idle: lock(idle).len(),
                in_use,
            },
            Mode::Unpooled => PoolStatus {
                max_size: None,
                idle: 0,
                in_use,
            },
        }
    }

    /// Close the pool and destroy every idle object.
    ///
    /// Objects still lent out are destroyed when their lease ends.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Shutdown`] listing objects that failed to
    /// close cleanly.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Mode::Pooled { idle, permits, .. } = &self.inner.mode else {
            return Ok(());
        };
        permits.close();
        let drained = std::mem::take(&mut *lock(idle));
        let mut shutdown = BestEffort::new("connection pool");
        for object in drained {
            if let Err(error) = object.destroy().await {
                shutdown.absorb(error);
            }
        }
        shutdown.finish()?;
        Ok(())
    }
}

/// A borrowed [`ConnectionObject`].
///
/// End a lease with [`release`](Self::release) after successful use or
/// [`invalidate`](Self::invalidate) after a failure. A lease dropped
/// without either is released.
#[must_use]
pub struct Lease {
    object: Arc<ConnectionObject>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
    destroyed: bool,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("object", &self.object).finish_non_exhaustive()
    }
}

impl Lease {
    /// The leased object.
    #[must_use]
    pub fn object(&self) -> &ConnectionObject { &self.object }

    /// End the lease. Pooled objects return to the idle set; unpooled
    /// objects are destroyed.
    pub async fn release(mut self) {
        if self.permit.is_none() || self.pool.closed.load(Ordering::SeqCst) {
            self.destroy_object().await;
        }
    }

    /// End the lease and destroy the object so that no later borrow can
    /// receive it.
    pub async fn invalidate(mut self) {
        debug!(object = self.object.id(), "invalidating connection object");
        self.destroy_object().await;
    }

    async fn destroy_object(&mut self) {
        self.destroyed = true;
        if let Err(error) = self.object.destroy().await {
            debug!(%error, "connection object closed with errors");
        }
    }
}

// The idle set takes the object back only here, after the lease's last use.
impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.lent.fetch_sub(1, Ordering::SeqCst);
        if self.destroyed {
            return;
        }
        let object = Arc::clone(&self.object);
        if self.permit.is_some() {
            self.pool.restore(object);
        } else {
            spawn_destroy(object);
        }
    }
}

#[cfg(test)]
mod tests;
