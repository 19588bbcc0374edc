use super::WarehouseGateway;
use crate::errors::GatewayError;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Fixed set of warehouse sessions shared by concurrent candidate tasks.
///
/// A session is checked out for a single operation and handed back when the
/// [`PooledSession`] guard drops, so no two tasks ever use the same session
/// at once.
pub struct GatewayPool {
    idle: Mutex<Vec<Arc<dyn WarehouseGateway>>>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl GatewayPool {
    pub fn new(sessions: Vec<Arc<dyn WarehouseGateway>>) -> Arc<Self> {
        let size = sessions.len();
        Arc::new(Self {
            idle: Mutex::new(sessions),
            permits: Arc::new(Semaphore::new(size)),
            size,
        })
    }

    /// Pool over a stateless gateway (e.g. one HTTP client per statement):
    /// `size` only bounds concurrency.
    pub fn shared(gateway: Arc<dyn WarehouseGateway>, size: usize) -> Arc<Self> {
        let size = size.max(1);
        Self::new((0..size).map(|_| gateway.clone()).collect())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn acquire(self: &Arc<Self>) -> Result<PooledSession, GatewayError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::Unreachable("session pool closed".into()))?;
        let session = self
            .idle
            .lock()
            .map_err(|_| GatewayError::Unreachable("session pool poisoned".into()))?
            .pop()
            .ok_or_else(|| GatewayError::Unreachable("session pool exhausted".into()))?;
        Ok(PooledSession {
            session,
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    pub fn close(&self) {
        self.permits.close();
    }
}

pub struct PooledSession {
    session: Arc<dyn WarehouseGateway>,
    pool: Arc<GatewayPool>,
    // Released after the session is back in `idle` (fields drop after `drop` runs).
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledSession {
    type Target = dyn WarehouseGateway;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Ok(mut idle) = self.pool.idle.lock() {
            idle.push(Arc::clone(&self.session));
        }
    }
}
