//! Wait group with a cap on outstanding work
//!
//! `add()` waits while `capacity` units are outstanding and hands back a
//! guard; dropping the guard marks the unit done. `wait()` resolves once every
//! outstanding unit is done.
//!
//! # Example
//!
//! ```
//! use kura::util::BoundedWaitGroup;
//!
//! # block_on(async {
//! let wg = BoundedWaitGroup::new(2);
//! for i in 0..8 {
//!     let guard = wg.add().await;
//!     tokio::spawn(async move {
//!         let _guard = guard;
//!         let _ = i * 2;
//!     });
//! }
//! wg.wait().await;
//! # });
//! # fn block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct BoundedWaitGroup {
    permits: Arc<Semaphore>,
    capacity: u32,
}

/// Marks one unit of work done when dropped
#[derive(Debug)]
pub struct WaitGroupGuard {
    _permit: Option<OwnedSemaphorePermit>,
}

impl BoundedWaitGroup {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize)) as u32;
        Self {
            permits: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Units of work currently outstanding
    pub fn outstanding(&self) -> usize {
        self.capacity as usize - self.permits.available_permits()
    }

    /// Register one unit of work, waiting for room if the group is full.
    pub async fn add(&self) -> WaitGroupGuard {
        // never closed
        let permit = Arc::clone(&self.permits).acquire_owned().await.ok();
        WaitGroupGuard { _permit: permit }
    }

    /// Wait until every outstanding unit is done.
    pub async fn wait(&self) {
        if let Ok(all) = self.permits.acquire_many(self.capacity).await {
            drop(all);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_on_empty_group_returns() {
        let wg = BoundedWaitGroup::new(3);
        wg.wait().await;
        assert_eq!(wg.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_capacity() {
        let wg = BoundedWaitGroup::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let guard = wg.add().await;
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                let _guard = guard;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }

        wg.wait().await;
        assert_eq!(finished.load(Ordering::SeqCst), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(wg.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_add_blocks_when_full() {
        let wg = BoundedWaitGroup::new(1);
        let held = wg.add().await;
        assert_eq!(wg.outstanding(), 1);

        let blocked = tokio::time::timeout(Duration::from_millis(20), wg.add()).await;
        assert!(blocked.is_err());

        drop(held);
        let guard = tokio::time::timeout(Duration::from_millis(100), wg.add()).await;
        assert!(guard.is_ok());
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        assert_eq!(BoundedWaitGroup::new(0).capacity(), 1);
    }
}
