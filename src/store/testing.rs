//! Failure-injecting stores for tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{BucketStore, MemoryBucketStore};
use crate::error::BackendError;
use crate::ratelimit::BucketState;

/// How a [`FlakyStore`] misbehaves while it is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Failure {
    Refused,
    Timeout,
    Corrupt,
    /// Hang for longer than any sane timeout
    Stall,
    Panic,
}

/// A memory store that can be switched into a failing mode.
pub(crate) struct FlakyStore {
    inner: MemoryBucketStore,
    down: AtomicBool,
    failure: parking_lot::Mutex<Failure>,
    /// Only compare-and-swap hangs; reads keep working
    stall_writes: AtomicBool,
    pings: AtomicU32,
    loads: AtomicU32,
    closes: AtomicU32,
}

impl FlakyStore {
    pub(crate) fn new(inner: MemoryBucketStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            down: AtomicBool::new(false),
            failure: parking_lot::Mutex::new(Failure::Refused),
            stall_writes: AtomicBool::new(false),
            pings: AtomicU32::new(0),
            loads: AtomicU32::new(0),
            closes: AtomicU32::new(0),
        })
    }

    pub(crate) fn fail_with(&self, failure: Failure) {
        *self.failure.lock() = failure;
        self.down.store(true, Ordering::SeqCst);
    }

    pub(crate) fn recover(&self) {
        self.down.store(false, Ordering::SeqCst);
        self.stall_writes.store(false, Ordering::SeqCst);
    }

    pub(crate) fn stall_writes(&self) {
        self.stall_writes.store(true, Ordering::SeqCst);
    }

    pub(crate) fn pings(&self) -> u32 {
        self.pings.load(Ordering::SeqCst)
    }

    pub(crate) fn loads(&self) -> u32 {
        self.loads.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    async fn check(&self) -> Result<(), BackendError> {
        if !self.down.load(Ordering::SeqCst) {
            return Ok(());
        }

        let failure = *self.failure.lock();
        match failure {
            Failure::Refused => Err(BackendError::Unreachable("connection refused".to_string())),
            Failure::Timeout => Err(BackendError::Timeout(Duration::from_secs(2))),
            Failure::Corrupt => Err(BackendError::Protocol("malformed bucket state".to_string())),
            Failure::Stall => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            Failure::Panic => panic!("store exploded"),
        }
    }
}

#[async_trait]
impl BucketStore for FlakyStore {
    async fn ping(&self) -> Result<(), BackendError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.check().await?;
        self.inner.ping().await
    }

    async fn load(&self, key: &str) -> Result<Option<BucketState>, BackendError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.check().await?;
        self.inner.load(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        new: &BucketState,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        self.check().await?;
        if self.stall_writes.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.inner.compare_and_swap(key, expected, new, ttl).await
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// A store where another writer sneaks in before the first `races`
/// compare-and-swap calls, taking one token each time.
pub(crate) struct RacingStore {
    inner: MemoryBucketStore,
    races: AtomicU32,
}

impl RacingStore {
    pub(crate) fn new(inner: MemoryBucketStore, races: u32) -> Arc<Self> {
        Arc::new(Self {
            inner,
            races: AtomicU32::new(races),
        })
    }
}

#[async_trait]
impl BucketStore for RacingStore {
    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<BucketState>, BackendError> {
        self.inner.load(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        new: &BucketState,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let race = self
            .races
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if race {
            let rival = match expected {
                Some(state) => BucketState {
                    tokens: state.tokens.saturating_sub(1),
                    ..*state
                },
                None => BucketState {
                    tokens: new.tokens,
                    last_refill_ms: new.last_refill_ms,
                },
            };
            self.inner.compare_and_swap(key, expected, &rival, ttl).await?;
        }

        self.inner.compare_and_swap(key, expected, new, ttl).await
    }
}
