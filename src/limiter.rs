//! Concurrency limiters bounding outstanding native round trips.
//!
//! Queries and batched writes each run under their own limiter. Both report
//! operations that waited or ran longer than the configured threshold.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::error::AdapterResult;

/// Semaphore-backed limiter with slow-operation reporting
#[derive(Clone)]
pub struct RateLimiter {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    slow_threshold: Duration,
}

impl RateLimiter {
    pub fn new(name: &'static str, capacity: usize, slow_threshold: Duration) -> Self {
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
            capacity: capacity.max(1),
            slow_threshold,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of permits currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run `op` once a permit is available.
    pub async fn exec<T, F>(&self, label: &str, domain: &str, op: F) -> AdapterResult<T>
    where
        F: Future<Output = AdapterResult<T>>,
    {
        let queued_at = Instant::now();
        let _permit = self.semaphore.acquire().await?;
        let waited = queued_at.elapsed();
        if waited > self.slow_threshold {
            tracing::warn!(
                "{} limiter: {} on '{}' queued for {:?}",
                self.name,
                label,
                domain,
                waited
            );
        }

        let started = Instant::now();
        let result = op.await;
        let took = started.elapsed();
        if took > self.slow_threshold {
            tracing::warn!(
                "{} limiter: slow {} on '{}' took {:?}",
                self.name,
                label,
                domain,
                took
            );
        }
        result
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_exec_returns_value() {
        let limiter = RateLimiter::new("read", 2, Duration::from_secs(1));
        let v = limiter.exec("find", "task", async { Ok(7) }).await.unwrap();
        assert_eq!(v, 7);
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test]
    async fn test_bounds_concurrency() {
        let limiter = RateLimiter::new("write", 2, Duration::from_secs(1));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .exec("bulk", "task", async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let limiter = RateLimiter::new("read", 0, Duration::from_secs(1));
        assert_eq!(limiter.capacity(), 1);
    }
}
