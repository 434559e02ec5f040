//! Token bucket shared across instances through a [`BucketStore`].
//!
//! Every instance reads the bucket, applies refill and consumption locally,
//! and publishes the result with a compare-and-swap. A lost race means some
//! other instance consumed first, so the attempt starts over from a fresh read.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::bucket::{BucketConfiguration, BucketState};
use crate::clock::{Clock, SystemClock};
use crate::error::BackendError;
use crate::store::BucketStore;

/// Default number of compare-and-swap attempts per consumption.
const DEFAULT_MAX_ATTEMPTS: u32 = 8;
/// Default idle expiry of bucket state in the store.
const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(60);

/// A distributed token bucket.
pub struct DistributedTokenBucket {
    store: Arc<dyn BucketStore>,
    config: BucketConfiguration,
    idle_ttl: Duration,
    max_attempts: u32,
    clock: Arc<dyn Clock>,
}

impl DistributedTokenBucket {
    /// Create a bucket with default idle TTL and retry cap.
    pub fn new(store: Arc<dyn BucketStore>, config: BucketConfiguration) -> Self {
        Self {
            store,
            config,
            idle_ttl: DEFAULT_IDLE_TTL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl = idle_ttl;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn configuration(&self) -> &BucketConfiguration {
        &self.config
    }

    /// Try to take `cost` tokens from the bucket stored under `key`.
    ///
    /// `Ok(false)` is a denial and leaves the stored state untouched. Any
    /// backend failure, including running out of compare-and-swap attempts,
    /// is returned as an error so the caller can fall back.
    pub async fn try_consume(&self, key: &str, cost: u64) -> Result<bool, BackendError> {
        for attempt in 1..=self.max_attempts {
            let stored = self.store.load(key).await?;
            let now = self.clock.now_millis();

            let state = match stored {
                Some(state) => self.config.refill(state, now),
                None => {
                    debug!(key = %key, capacity = self.config.capacity, "Initializing token bucket");
                    BucketState::full(&self.config, now)
                }
            };

            let Some(next) = state.consume(cost) else {
                debug!(
                    key = %key,
                    tokens = state.tokens,
                    cost = cost,
                    "Distributed rate limit exceeded"
                );
                return Ok(false);
            };

            if self
                .store
                .compare_and_swap(key, stored.as_ref(), &next, self.idle_ttl)
                .await?
            {
                trace!(key = %key, remaining = next.tokens, attempt = attempt, "Consumed tokens");
                return Ok(true);
            }

            debug!(key = %key, attempt = attempt, "Token bucket update raced, retrying");
            if attempt < self.max_attempts {
                tokio::time::sleep(Self::backoff(attempt)).await;
            }
        }

        warn!(
            key = %key,
            attempts = self.max_attempts,
            "Token bucket update kept racing; giving up"
        );
        Err(BackendError::Contention {
            attempts: self.max_attempts,
        })
    }

    /// Tokens currently available under `key`, without consuming any.
    pub async fn available_tokens(&self, key: &str) -> Result<u64, BackendError> {
        let now = self.clock.now_millis();
        let state = match self.store.load(key).await? {
            Some(state) => self.config.refill(state, now),
            None => BucketState::full(&self.config, now),
        };
        Ok(state.tokens)
    }

    /// Short randomized pause so racing instances spread out.
    fn backoff(attempt: u32) -> Duration {
        let ceiling = 1u64 << attempt.min(4);
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}
