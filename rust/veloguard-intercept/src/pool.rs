//! Bounded worker pool that drops work instead of queueing it

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::trace;

pub struct DiscardingPool {
    permits: Arc<Semaphore>,
    max_workers: usize,
    accepted: AtomicU64,
    discarded: AtomicU64,
}

impl DiscardingPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            accepted: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Run `work` if a worker is free; otherwise drop it and return false
    pub fn try_spawn<F>(&self, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(async move {
                    work.await;
                    drop(permit);
                });
                true
            }
            Err(_) => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                trace!("Worker pool full ({}), discarding work", self.max_workers);
                false
            }
        }
    }

    pub fn active(&self) -> usize {
        self.max_workers - self.permits.available_permits()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Refuse all further work
    pub fn close(&self) {
        self.permits.close();
    }
}
