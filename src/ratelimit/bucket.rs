//! Token bucket arithmetic shared by every bucket store.

use std::fmt;
use std::time::Duration;

use crate::error::BackendError;

/// Parameters of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfiguration {
    /// Maximum tokens the bucket can hold
    pub capacity: u64,
    /// Tokens added every `refill_interval`
    pub refill_tokens: u64,
    /// How often `refill_tokens` are added
    pub refill_interval: Duration,
}

impl Default for BucketConfiguration {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_tokens: 100,
            refill_interval: Duration::from_secs(1),
        }
    }
}

impl BucketConfiguration {
    fn interval_millis(&self) -> u64 {
        u64::try_from(self.refill_interval.as_millis())
            .unwrap_or(u64::MAX)
            .max(1)
    }

    /// Apply whole refill intervals elapsed since `state.last_refill_ms`.
    ///
    /// Partial intervals are carried over by advancing the refill timestamp
    /// only by the intervals consumed. A full bucket restarts its refill clock
    /// at `now_ms`.
    pub fn refill(&self, state: BucketState, now_ms: u64) -> BucketState {
        let interval = self.interval_millis();
        let elapsed = now_ms.saturating_sub(state.last_refill_ms);
        let intervals = elapsed / interval;

        if intervals == 0 {
            return state;
        }

        let tokens = state
            .tokens
            .saturating_add(intervals.saturating_mul(self.refill_tokens))
            .min(self.capacity);

        let last_refill_ms = if tokens >= self.capacity {
            now_ms
        } else {
            state.last_refill_ms + intervals * interval
        };

        BucketState {
            tokens,
            last_refill_ms,
        }
    }
}

/// Stored state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    pub tokens: u64,
    pub last_refill_ms: u64,
}

impl BucketState {
    /// A bucket seen for the first time (or after it expired from the store).
    pub fn full(config: &BucketConfiguration, now_ms: u64) -> Self {
        Self {
            tokens: config.capacity,
            last_refill_ms: now_ms,
        }
    }

    /// Take `cost` tokens, or `None` when there are not enough.
    pub fn consume(self, cost: u64) -> Option<Self> {
        let tokens = self.tokens.checked_sub(cost)?;
        Some(Self { tokens, ..self })
    }

    /// Wire form stored under the bucket key: `"<tokens>:<last_refill_ms>"`.
    pub fn encode(&self) -> String {
        format!("{}:{}", self.tokens, self.last_refill_ms)
    }

    /// Parse the wire form.
    pub fn decode(raw: &str) -> Result<Self, BackendError> {
        let (tokens, last_refill) = raw
            .split_once(':')
            .ok_or_else(|| BackendError::Protocol(format!("malformed bucket state {:?}", raw)))?;

        let tokens = tokens
            .parse()
            .map_err(|_| BackendError::Protocol(format!("bad token count in {:?}", raw)))?;
        let last_refill_ms = last_refill
            .parse()
            .map_err(|_| BackendError::Protocol(format!("bad refill timestamp in {:?}", raw)))?;

        Ok(Self {
            tokens,
            last_refill_ms,
        })
    }
}

impl fmt::Display for BucketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
