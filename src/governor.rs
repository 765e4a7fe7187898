use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Global rate and concurrency envelope shared by all workers: a semaphore
/// bounds in-flight calls, a monotonic token bucket bounds requests per
/// second.
pub struct RateGovernor {
    slots: Arc<Semaphore>,
    bucket: Mutex<Bucket>,
    capacity: f64,
    refill_per_sec: f64,
}

/// Scoped acquisition: dropping the permit returns the concurrency slot.
/// The rate-bucket token is spent and never returned.
pub struct RatePermit {
    _slot: OwnedSemaphorePermit,
}

impl RateGovernor {
    pub fn new(max_concurrent: usize, max_requests_per_second: u32) -> Arc<Self> {
        let capacity = f64::from(max_requests_per_second.max(1));
        Arc::new(Self {
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
            // Start nearly empty: a full bucket would allow a 2x burst in the
            // first second-long window.
            bucket: Mutex::new(Bucket {
                tokens: 1.0_f64.min(capacity),
                last_refill: Instant::now(),
            }),
            capacity,
            refill_per_sec: capacity,
        })
    }

    /// Block until both a concurrency slot and a rate token are available,
    /// or return `None` as soon as the cancel token fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<RatePermit> {
        let slot = tokio::select! {
            permit = self.slots.clone().acquire_owned() => permit.ok()?,
            _ = cancel.cancelled() => return None,
        };

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Some(RatePermit { _slot: slot });
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.refill_per_sec)
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }
}
