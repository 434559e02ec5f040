//! Storage for shared token bucket state.
//!
//! The distributed bucket only needs three things from its backend: a cheap
//! liveness check, a read, and a conditional write that succeeds only if the
//! stored value is still the one that was read. Redis provides these for a
//! multi-instance deployment; the in-memory store provides them within one
//! process.

mod memory;
mod redis_store;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::BackendError;
use crate::ratelimit::BucketState;

pub use self::memory::MemoryBucketStore;
pub use self::redis_store::RedisBucketStore;

/// Backend holding bucket state keyed by limiter identity.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Round-trip to the backend.
    async fn ping(&self) -> Result<(), BackendError>;

    /// Read the state stored under `key`, `None` if absent or expired.
    async fn load(&self, key: &str) -> Result<Option<BucketState>, BackendError>;

    /// Write `new` under `key` only if the stored state still equals
    /// `expected` (`None` meaning the key must be absent).
    ///
    /// A successful write resets the key's idle expiry to `ttl`.
    /// Returns `Ok(false)` when another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        new: &BucketState,
        ttl: Duration,
    ) -> Result<bool, BackendError>;

    /// Release connections held by the store.
    async fn close(&self) {}
}
