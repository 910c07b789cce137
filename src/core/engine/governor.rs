//! Per-provider request pacing.
//!
//! One token bucket per provider name, shared by every schedule and ad-hoc
//! run in the process. The bucket shape is an engine constant: 6 permits
//! per minute with capacity 1, i.e. one refill every 10 seconds and no
//! bursting.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::engine::error::ExecutionError;

pub const REQUESTS_PER_MINUTE: u32 = 6;
pub const BURST_CAPACITY: u32 = 1;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: u32,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_minute: u32, capacity: u32) -> Self {
        Self {
            tokens: capacity as f64,
            max_tokens: capacity,
            refill_rate: rate_per_minute as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate)
            .min(self.max_tokens as f64);
        self.last_refill = now;
    }
}

/// Lazily-populated map of self-synchronised buckets, one per provider name.
pub struct Governor {
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
    rate_per_minute: u32,
    capacity: u32,
}

impl Governor {
    pub fn new() -> Self {
        Self::with_rate(REQUESTS_PER_MINUTE, BURST_CAPACITY)
    }

    /// Non-default shapes are for tests; production code uses the engine
    /// constants via [`Governor::new`].
    pub fn with_rate(rate_per_minute: u32, capacity: u32) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            rate_per_minute,
            capacity,
        }
    }

    /// Block until a permit is granted for `provider`, or until the token
    /// is cancelled. Cancellation consumes no permit.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        provider: &str,
    ) -> Result<(), ExecutionError> {
        let bucket = self.bucket(provider);

        loop {
            let wait = {
                let mut bucket = bucket.lock().await;
                if bucket.try_acquire() {
                    return Ok(());
                }
                bucket.time_until_available()
            };

            debug!("Rate limited on {provider}, waiting {wait:?}");
            tokio::select! {
                _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                _ = sleep(wait.max(Duration::from_millis(10))) => {}
            }
        }
    }

    fn bucket(&self, provider: &str) -> Arc<Mutex<TokenBucket>> {
        if let Some(bucket) = self.buckets.read().unwrap().get(provider) {
            return bucket.clone();
        }

        let mut buckets = self.buckets.write().unwrap();
        buckets
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(TokenBucket::new(self.rate_per_minute, self.capacity)))
            })
            .clone()
    }
}

impl Default for Governor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn default_shape_spaces_permits_ten_seconds_apart() {
        let governor = Governor::new();
        let cancel = CancellationToken::new();
        let origin = Instant::now();

        let mut grant_offsets = Vec::new();
        for _ in 0..4 {
            governor.acquire(&cancel, "openai").await.unwrap();
            grant_offsets.push(origin.elapsed());
        }

        // First permit is immediate, each later one waits for a refill.
        assert!(grant_offsets[0] < Duration::from_secs(1));
        for pair in grant_offsets.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(9));
        }
        // Four permits never fit in one minute-window prefix shorter than 30s.
        assert!(grant_offsets[3] >= Duration::from_secs(29));
    }

    #[tokio::test(start_paused = true)]
    async fn buckets_are_per_provider() {
        let governor = Governor::new();
        let cancel = CancellationToken::new();
        let started = Instant::now();

        governor.acquire(&cancel, "openai").await.unwrap();
        governor.acquire(&cancel, "anthropic").await.unwrap();

        // Distinct providers do not contend for the same bucket.
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_waiters_without_consuming() {
        let governor = Arc::new(Governor::new());
        let cancel = CancellationToken::new();

        governor.acquire(&cancel, "openai").await.unwrap();

        let waiter = {
            let governor = governor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { governor.acquire(&cancel, "openai").await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ExecutionError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn no_bursting_after_idle_period() {
        let governor = Governor::new();
        let cancel = CancellationToken::new();

        governor.acquire(&cancel, "openai").await.unwrap();
        // A long idle period must not bank more than one token.
        tokio::time::sleep(Duration::from_secs(300)).await;

        let started = Instant::now();
        governor.acquire(&cancel, "openai").await.unwrap();
        governor.acquire(&cancel, "openai").await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(9));
    }
}
