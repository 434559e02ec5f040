//! In-process bucket store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use super::BucketStore;
use crate::clock::{Clock, SystemClock};
use crate::error::BackendError;
use crate::ratelimit::BucketState;

/// A `DashMap`-backed store with per-key idle expiry.
///
/// Compare-and-swap runs under the map's shard lock for the key, so it is
/// atomic for every caller sharing this instance.
#[derive(Debug, Clone)]
pub struct MemoryBucketStore {
    /// key -> (state, expires_at_ms)
    entries: Arc<DashMap<String, (BucketState, u64)>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries
            .iter()
            .filter(|entry| entry.value().1 > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expiry(&self, now: u64, ttl: Duration) -> u64 {
        now.saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<BucketState>, BackendError> {
        let now = self.clock.now_millis();
        if let Some(entry) = self.entries.get(key) {
            let (state, expires_at) = *entry.value();
            if expires_at > now {
                return Ok(Some(state));
            }
        }

        self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        Ok(None)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        new: &BucketState,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let now = self.clock.now_millis();
        let expires_at = self.expiry(now, ttl);

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let (current, current_expiry) = *occupied.get();
                let current = (current_expiry > now).then_some(current);
                if current.as_ref() != expected {
                    return Ok(false);
                }
                occupied.insert((*new, expires_at));
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert((*new, expires_at));
            }
        }

        Ok(true)
    }
}
