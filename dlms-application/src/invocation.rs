//! Invoke id pool
//!
//! Sixteen ids circulate through a bounded channel. Acquiring takes one out
//! (waiting while all are in use), dropping the [`InvokeId`] puts it back.

use crate::error::{DlmsError, DlmsResult};
use crate::pdu::MAX_INVOKE_ID;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Number of ids in the pool
pub const INVOKE_ID_COUNT: usize = MAX_INVOKE_ID as usize + 1;

pub struct InvocationPool {
    free: mpsc::Sender<u8>,
    queue: Mutex<mpsc::Receiver<u8>>,
}

impl InvocationPool {
    pub fn new() -> Arc<Self> {
        let (free, queue) = mpsc::channel(INVOKE_ID_COUNT);
        for id in 0..=MAX_INVOKE_ID {
            // capacity equals the number of ids
            let _ = free.try_send(id);
        }
        Arc::new(Self {
            free,
            queue: Mutex::new(queue),
        })
    }

    /// Take an id out of the pool
    ///
    /// Waits while all ids are in use; a zero `timeout` waits forever,
    /// otherwise the wait fails with [`DlmsError::Timeout`].
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> DlmsResult<InvokeId> {
        let wait = async {
            let mut queue = self.queue.lock().await;
            queue.recv().await
        };
        let id = if timeout.is_zero() {
            wait.await
        } else {
            tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| DlmsError::Timeout)?
        };
        // the pool keeps a sender alive, the channel never closes
        let id = id.ok_or(DlmsError::ConnectionClosed)?;
        Ok(InvokeId {
            id,
            pool: Arc::clone(self),
        })
    }

    /// Ids currently free
    pub fn available(&self) -> usize {
        self.free.max_capacity() - self.free.capacity()
    }
}

/// An invoke id on loan from the pool, returned on drop
pub struct InvokeId {
    id: u8,
    pool: Arc<InvocationPool>,
}

impl InvokeId {
    pub fn value(&self) -> u8 {
        self.id
    }
}

impl fmt::Debug for InvokeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InvokeId({})", self.id)
    }
}

impl Drop for InvokeId {
    fn drop(&mut self) {
        if self.pool.free.try_send(self.id).is_err() {
            log::error!("invoke id {} could not be returned to the pool", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_all_ids_distinct() {
        let pool = InvocationPool::new();
        let mut held = Vec::new();
        for _ in 0..INVOKE_ID_COUNT {
            held.push(pool.acquire(Duration::ZERO).await.unwrap());
        }
        let ids: HashSet<u8> = held.iter().map(|id| id.value()).collect();
        assert_eq!(ids, (0..=15).collect());
        assert_eq!(pool.available(), 0);

        drop(held);
        assert_eq!(pool.available(), INVOKE_ID_COUNT);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let pool = InvocationPool::new();
        let mut held = Vec::new();
        for _ in 0..INVOKE_ID_COUNT {
            held.push(pool.acquire(Duration::ZERO).await.unwrap());
        }
        let err = pool.acquire(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, DlmsError::Timeout));
    }

    #[tokio::test]
    async fn test_waiter_gets_released_id() {
        let pool = InvocationPool::new();
        let mut held = Vec::new();
        for _ in 0..INVOKE_ID_COUNT {
            held.push(pool.acquire(Duration::ZERO).await.unwrap());
        }
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await.map(|id| id.value()) })
        };
        tokio::task::yield_now().await;
        let released = held.remove(3);
        let expected = released.value();
        drop(released);
        assert_eq!(waiter.await.unwrap().unwrap(), expected);
    }
}
