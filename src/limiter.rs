use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Weighted semaphore gating the messages endpoints. Acquisition is bounded
/// by a timeout; rejected requests get 503 with a fixed body.
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    active: AtomicU64,
    total: AtomicU64,
    rejected: AtomicU64,
}

pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    limiter: Arc<ConcurrencyLimiter>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.limiter.active.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize, timeout: Duration) -> Arc<Self> {
        let max_concurrent = if max_concurrent == 0 { 100 } else { max_concurrent };
        let timeout = if timeout.is_zero() {
            Duration::from_secs(120)
        } else {
            timeout
        };
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            timeout,
            active: AtomicU64::new(0),
            total: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Waits up to the configured timeout for a slot. The returned permit
    /// releases on drop, so every exit path balances.
    pub async fn acquire(self: &Arc<Self>) -> Option<LimiterPermit> {
        self.total.fetch_add(1, Ordering::Relaxed);
        let acquired =
            tokio::time::timeout(self.timeout, self.semaphore.clone().acquire_owned()).await;
        match acquired {
            Ok(Ok(permit)) => {
                self.active.fetch_add(1, Ordering::Relaxed);
                Some(LimiterPermit {
                    _permit: permit,
                    limiter: self.clone(),
                })
            }
            _ => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("trellis_limiter_rejected_total").increment(1);
                None
            }
        }
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.active.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
        )
    }
}
