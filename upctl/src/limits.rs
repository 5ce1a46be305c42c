//! Admission control for uploads.
//!
//! Bodies are buffered in memory before they are written to storage, so the number of uploads
//! in flight bounds memory use. [`UploadLimiter`] caps it with a semaphore, a bounded waiting
//! queue and a wait timeout. Requests that cannot get a slot are answered with HTTP 429 before
//! their body is read.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{FileLimitsConfig, LimitsConfig};
use crate::errors::{Error, Result};

const BUSY_MESSAGE: &str = "Too many uploads in progress. Please retry later.";

/// Container for all resource limiters
#[derive(Debug, Default, Clone)]
pub struct Limiters {
    /// Limiter for concurrent uploads. None means unlimited.
    pub uploads: Option<Arc<UploadLimiter>>,
}

impl Limiters {
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            uploads: UploadLimiter::new(&config.files).map(Arc::new),
        }
    }

    /// Acquire an upload slot, or `None` when uploads are unlimited
    pub async fn acquire_upload(&self) -> Result<Option<UploadPermit>> {
        match &self.uploads {
            Some(limiter) => limiter.acquire().await.map(Some),
            None => Ok(None),
        }
    }
}

/// Bounds concurrent uploads, with a bounded queue of waiters and a wait timeout
#[derive(Debug)]
pub struct UploadLimiter {
    semaphore: Arc<Semaphore>,
    /// Requests currently queued for a permit
    waiting_count: AtomicUsize,
    /// None = unlimited queue
    max_waiting: Option<usize>,
    max_wait: Duration,
}

impl UploadLimiter {
    /// Returns `None` when `max_concurrent_uploads` is 0 (unlimited).
    /// A `max_waiting_uploads` of 0 means the queue is unbounded.
    pub fn new(config: &FileLimitsConfig) -> Option<Self> {
        if config.max_concurrent_uploads == 0 {
            return None;
        }

        Some(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_uploads)),
            waiting_count: AtomicUsize::new(0),
            max_waiting: (config.max_waiting_uploads != 0).then_some(config.max_waiting_uploads),
            max_wait: Duration::from_secs(config.max_upload_wait_secs),
        })
    }

    /// Number of requests queued for a slot
    pub fn waiting(&self) -> usize {
        self.waiting_count.load(Ordering::SeqCst)
    }

    /// Wait for an upload slot.
    ///
    /// Fails with [`Error::TooManyRequests`] when the waiting queue is full or `max_wait`
    /// elapses first.
    pub async fn acquire(&self) -> Result<UploadPermit> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(UploadPermit { _permit: permit });
        }

        // Leaves the queue on every exit path, including cancellation of the caller
        let _queued = QueueSlot::join(self)?;

        // A permit may have been released while joining the queue
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(UploadPermit { _permit: permit });
        }

        if self.max_wait.is_zero() {
            return Err(too_busy(BUSY_MESSAGE));
        }

        match tokio::time::timeout(self.max_wait, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(UploadPermit { _permit: permit }),
            Ok(Err(_)) => Err(too_busy("Upload service temporarily unavailable.")),
            Err(_) => Err(too_busy("Timed out waiting for upload slot. Please retry later.")),
        }
    }
}

fn too_busy(message: &str) -> Error {
    Error::TooManyRequests {
        message: message.to_string(),
    }
}

/// A place in the waiting queue, given back on drop
struct QueueSlot<'a> {
    waiting_count: &'a AtomicUsize,
}

impl<'a> QueueSlot<'a> {
    fn join(limiter: &'a UploadLimiter) -> Result<Self> {
        let ahead = limiter.waiting_count.fetch_add(1, Ordering::SeqCst);
        let slot = Self {
            waiting_count: &limiter.waiting_count,
        };

        if let Some(max_waiting) = limiter.max_waiting
            && ahead >= max_waiting
        {
            return Err(too_busy(BUSY_MESSAGE));
        }
        Ok(slot)
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.waiting_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// RAII guard that releases the upload slot when dropped
#[must_use]
#[derive(Debug)]
pub struct UploadPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(max_concurrent: usize, max_waiting: usize, max_wait_secs: u64) -> FileLimitsConfig {
        FileLimitsConfig {
            max_concurrent_uploads: max_concurrent,
            max_waiting_uploads: max_waiting,
            max_upload_wait_secs: max_wait_secs,
            ..Default::default()
        }
    }

    #[test]
    fn test_unlimited_returns_none() {
        assert!(UploadLimiter::new(&test_config(0, 20, 60)).is_none());
    }

    #[tokio::test]
    async fn test_unlimited_limiters_hand_out_no_permit() {
        let limiters = Limiters::default();
        assert!(limiters.acquire_upload().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acquire_when_available() {
        let limiter = UploadLimiter::new(&test_config(2, 10, 60)).unwrap();

        let _permit1 = limiter.acquire().await.unwrap();
        let _permit2 = limiter.acquire().await.unwrap();
        assert_eq!(limiter.waiting(), 0);
    }

    #[tokio::test]
    async fn test_acquire_waits_and_succeeds() {
        let limiter = Arc::new(UploadLimiter::new(&test_config(1, 10, 5)).unwrap());
        let permit1 = limiter.acquire().await.unwrap();

        let limiter_clone = limiter.clone();
        let handle = tokio::spawn(async move { limiter_clone.acquire().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.waiting(), 1);
        drop(permit1);

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(limiter.waiting(), 0);
    }

    #[tokio::test]
    async fn test_acquire_rejects_when_queue_full() {
        let limiter = Arc::new(UploadLimiter::new(&test_config(1, 1, 60)).unwrap());
        let _permit1 = limiter.acquire().await.unwrap();

        let limiter_clone = limiter.clone();
        let _waiter = tokio::spawn(async move { limiter_clone.acquire().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        match limiter.acquire().await {
            Err(Error::TooManyRequests { message }) => assert!(message.contains("Too many uploads")),
            other => panic!("Expected TooManyRequests, got {other:?}"),
        }
        // The rejected request gave its place back
        assert_eq!(limiter.waiting(), 1);
    }

    #[tokio::test]
    async fn test_acquire_times_out() {
        let limiter = UploadLimiter::new(&test_config(1, 10, 1)).unwrap();
        let _permit1 = limiter.acquire().await.unwrap();

        let start = std::time::Instant::now();
        let result = limiter.acquire().await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_secs(1));
        match result {
            Err(Error::TooManyRequests { message }) => assert!(message.contains("Timed out")),
            other => panic!("Expected TooManyRequests, got {other:?}"),
        }
        assert_eq!(limiter.waiting(), 0);
    }

    #[tokio::test]
    async fn test_zero_wait_rejects_immediately() {
        let limiter = UploadLimiter::new(&test_config(1, 10, 0)).unwrap();
        let _permit1 = limiter.acquire().await.unwrap();

        let start = std::time::Instant::now();
        assert!(limiter.acquire().await.is_err());
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_queue() {
        let limiter = Arc::new(UploadLimiter::new(&test_config(1, 1, 60)).unwrap());
        let _permit1 = limiter.acquire().await.unwrap();

        let limiter_clone = limiter.clone();
        let waiter = tokio::spawn(async move { limiter_clone.acquire().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.waiting(), 1);

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(limiter.waiting(), 0);
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let limiter = UploadLimiter::new(&test_config(1, 10, 1)).unwrap();

        {
            let _permit = limiter.acquire().await.unwrap();
        }

        assert!(limiter.acquire().await.is_ok());
    }
}
