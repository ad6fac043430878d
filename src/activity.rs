//! Fetch admission and activity counters
//!
//! At most `max_concurrent_fetches` archive fetches run at once; builds
//! beyond that wait in a queue. Both numbers are tracked so the server can
//! report how much work is running and waiting.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::cache::BuildCounts;
use crate::error::{Result, SymbolsError};
use crate::parser_pool::PoolStats;

/// Bounds concurrent archive fetches and counts queued and running ones
#[derive(Clone)]
pub struct FetchLimiter {
    slots: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
}

/// A running fetch; dropping it frees the slot
pub struct FetchSlot {
    _permit: OwnedSemaphorePermit,
    running: Arc<AtomicUsize>,
}

impl FetchLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
            queued: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a fetch slot
    pub async fn acquire(&self) -> Result<FetchSlot> {
        self.queued.fetch_add(1, Ordering::Relaxed);
        // Leaves the queue on success and on cancellation alike
        let queued = scopeguard::guard(Arc::clone(&self.queued), |queued| {
            queued.fetch_sub(1, Ordering::Relaxed);
        });

        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| SymbolsError::Build("fetch limiter closed".into()))?;
        drop(queued);

        self.running.fetch_add(1, Ordering::Relaxed);
        Ok(FetchSlot {
            _permit: permit,
            running: Arc::clone(&self.running),
        })
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }
}

impl Drop for FetchSlot {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of the service's work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySnapshot {
    pub fetches_queued: usize,
    pub fetches_running: usize,
    pub builds: BuildCounts,
    pub parser_capacity: usize,
    pub parsers_idle: usize,
    pub parsers_created: usize,
    pub parsers_replaced: usize,
}

impl ActivitySnapshot {
    pub fn new(fetches: &FetchLimiter, builds: BuildCounts, pool: PoolStats) -> Self {
        Self {
            fetches_queued: fetches.queued(),
            fetches_running: fetches.running(),
            builds,
            parser_capacity: pool.capacity,
            parsers_idle: pool.idle,
            parsers_created: pool.workers_created,
            parsers_replaced: pool.workers_replaced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fetches_queue_beyond_limit() {
        let limiter = FetchLimiter::new(1);

        let first = limiter.acquire().await.unwrap();
        assert_eq!(limiter.running(), 1);
        assert_eq!(limiter.queued(), 0);

        let waiting = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await.map(|_slot| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.queued(), 1);

        drop(first);
        waiting.await.unwrap().unwrap();
        assert_eq!(limiter.queued(), 0);
        assert_eq!(limiter.running(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_wait_leaves_queue() {
        let limiter = FetchLimiter::new(1);
        let _held = limiter.acquire().await.unwrap();

        let gave_up = tokio::time::timeout(Duration::from_millis(20), limiter.acquire()).await;
        assert!(gave_up.is_err());
        assert_eq!(limiter.queued(), 0);
        assert_eq!(limiter.running(), 1);
    }
}
