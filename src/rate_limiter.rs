use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

#[derive(Clone, Debug, Default)]
pub struct Limits {
    pub requests_per_min: Option<u64>,
    pub bytes_per_min: Option<u64>,
    pub concurrency: Option<u32>,
}

/// Token-bucket limiter shared by every channel worker; clones share one budget.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    limits: Limits,
    // token buckets are modeled by the time of last refill and the current tokens
    rpm_tokens: Mutex<(f64, Instant)>,
    bpm_tokens: Mutex<(f64, Instant)>,
    sem: Option<Arc<Semaphore>>,
}

/// Held for the duration of one upstream request when a concurrency limit is set.
pub struct RequestPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl RateLimiter {
    pub fn new(limits: Limits) -> Self {
        let now = Instant::now();
        let rpm_capacity = limits.requests_per_min.unwrap_or(0) as f64;
        let bpm_capacity = limits.bytes_per_min.unwrap_or(0) as f64;
        let sem = limits
            .concurrency
            .map(|c| Arc::new(Semaphore::new(c.max(1) as usize)));
        Self {
            inner: Arc::new(Inner {
                limits,
                rpm_tokens: Mutex::new((rpm_capacity, now)),
                bpm_tokens: Mutex::new((bpm_capacity, now)),
                sem,
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(Limits::default())
    }

    /// Wait for a request slot. The returned permit keeps the concurrency slot
    /// until dropped.
    pub async fn acquire(&self) -> RequestPermit {
        let permit = match &self.inner.sem {
            // The semaphore is never closed, so acquisition only fails if it were.
            Some(sem) => sem.clone().acquire_owned().await.ok(),
            None => None,
        };

        if let Some(rpm) = self.inner.limits.requests_per_min {
            if rpm > 0 {
                consume_tokens(&self.inner.rpm_tokens, rpm as f64, 60.0, 1.0).await;
            }
        }
        RequestPermit { _permit: permit }
    }

    /// Account for downloaded bytes once the payload size is known.
    pub async fn record_bytes(&self, bytes: u64) {
        if let Some(bpm) = self.inner.limits.bytes_per_min {
            if bpm > 0 {
                // A single payload larger than the bucket would never fit; cap the cost.
                let cost = (bytes as f64).min(bpm as f64);
                consume_tokens(&self.inner.bpm_tokens, bpm as f64, 60.0, cost).await;
            }
        }
    }
}

async fn consume_tokens(bucket: &Mutex<(f64, Instant)>, capacity: f64, period_secs: f64, cost: f64) {
    // Basic token bucket: refill continuously, wait until enough tokens accumulate
    loop {
        let mut guard = bucket.lock().await;
        let (ref mut tokens, ref mut last) = *guard;
        let now = Instant::now();
        let elapsed = now.duration_since(*last).as_secs_f64();
        let refill_rate = capacity / period_secs; // tokens per second
        *tokens = (*tokens + elapsed * refill_rate).min(capacity);
        *last = now;
        if *tokens >= cost {
            *tokens -= cost;
            break;
        }
        let need = cost - *tokens;
        let secs = need / refill_rate;
        drop(guard);
        tokio::time::sleep(Duration::from_secs_f64(secs.max(0.001))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_never_waits() {
        let rl = RateLimiter::unlimited();
        for _ in 0..100 {
            let _p = rl.acquire().await;
        }
        rl.record_bytes(10_000_000).await;
    }

    #[tokio::test]
    async fn concurrency_permits_are_shared_between_clones() {
        let rl = RateLimiter::new(Limits {
            concurrency: Some(1),
            ..Limits::default()
        });
        let other = rl.clone();
        let held = rl.acquire().await;
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), other.acquire()).await;
        assert!(blocked.is_err());
        drop(held);
        let granted =
            tokio::time::timeout(Duration::from_millis(50), other.acquire()).await;
        assert!(granted.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn request_bucket_throttles_after_capacity() {
        let rl = RateLimiter::new(Limits {
            requests_per_min: Some(2),
            ..Limits::default()
        });
        let start = tokio::time::Instant::now();
        rl.acquire().await;
        rl.acquire().await;
        assert!(start.elapsed() < Duration::from_secs(1));
        rl.acquire().await;
        // 2 per minute refills one token every 30 seconds
        assert!(start.elapsed() >= Duration::from_secs(29));
    }
}
