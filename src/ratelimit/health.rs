//! Cached reachability verdict for the distributed backend.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::store::BucketStore;

/// Tracks whether the distributed backend may be used.
///
/// The first call probes the backend once and caches the answer. Failures seen
/// on the request path flip the verdict to unavailable without a probe. An
/// unavailable backend is probed again, lazily, once `reprobe_interval` has
/// passed since the last probe or failure; with no interval it stays down for
/// the lifetime of the process.
pub struct HealthMonitor {
    /// `None` when no backend is configured
    store: Option<Arc<dyn BucketStore>>,
    probe_timeout: Duration,
    reprobe_interval: Option<Duration>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    checked: AtomicBool,
    /// Clock millis of the last probe or failure
    last_change_ms: AtomicU64,
    /// Serializes probes
    probe_lock: Mutex<()>,
}

impl HealthMonitor {
    pub fn new(
        store: Option<Arc<dyn BucketStore>>,
        probe_timeout: Duration,
        reprobe_interval: Option<Duration>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            probe_timeout,
            reprobe_interval,
            clock,
            available: AtomicBool::new(false),
            checked: AtomicBool::new(false),
            last_change_ms: AtomicU64::new(0),
            probe_lock: Mutex::new(()),
        }
    }

    /// Whether a backend is configured at all.
    pub fn is_configured(&self) -> bool {
        self.store.is_some()
    }

    /// Whether a probe has run (or a failure was recorded) yet.
    pub fn is_checked(&self) -> bool {
        self.checked.load(Ordering::Acquire)
    }

    /// Whether the distributed path should be used for the next request.
    pub async fn is_available(&self) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };

        if !self.checked.load(Ordering::Acquire) {
            // Everyone waits for the first verdict
            let _guard = self.probe_lock.lock().await;
            if self.checked.load(Ordering::Acquire) {
                return self.available.load(Ordering::Acquire);
            }
            return self.probe(store.as_ref()).await;
        }

        if self.available.load(Ordering::Acquire) {
            return true;
        }

        if !self.reprobe_due() {
            return false;
        }

        // Re-probes never hold up other requests; they keep using the fallback
        let Ok(_guard) = self.probe_lock.try_lock() else {
            return false;
        };
        if self.available.load(Ordering::Acquire) || !self.reprobe_due() {
            return self.available.load(Ordering::Acquire);
        }
        self.probe(store.as_ref()).await
    }

    /// Record a backend failure seen outside a probe.
    pub fn mark_unavailable(&self) {
        self.last_change_ms
            .store(self.clock.now_millis(), Ordering::Release);
        self.checked.store(true, Ordering::Release);

        if self.available.swap(false, Ordering::AcqRel) {
            warn!(
                reprobe_after = ?self.reprobe_interval,
                "Distributed backend marked unavailable; using local fallback"
            );
        }
    }

    fn reprobe_due(&self) -> bool {
        let Some(interval) = self.reprobe_interval else {
            return false;
        };
        let since = self
            .clock
            .now_millis()
            .saturating_sub(self.last_change_ms.load(Ordering::Acquire));
        Duration::from_millis(since) >= interval
    }

    async fn probe(&self, store: &dyn BucketStore) -> bool {
        let was_checked = self.checked.load(Ordering::Acquire);

        let available = match tokio::time::timeout(self.probe_timeout, store.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(error = %err, "Distributed backend probe failed");
                false
            }
            Err(_) => {
                warn!(timeout = ?self.probe_timeout, "Distributed backend probe timed out");
                false
            }
        };

        self.last_change_ms
            .store(self.clock.now_millis(), Ordering::Release);
        self.available.store(available, Ordering::Release);
        self.checked.store(true, Ordering::Release);

        match (was_checked, available) {
            (_, true) => info!("Distributed backend available; using shared token bucket"),
            (false, false) => info!("Distributed backend unavailable; using local fallback"),
            (true, false) => debug!("Distributed backend still unavailable"),
        }

        available
    }
}
