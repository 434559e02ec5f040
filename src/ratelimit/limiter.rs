//! Limiter façade: picks the backend for each request and never fails.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use super::counter::LocalFallbackCounter;
use super::decision::RateLimitDecision;
use super::distributed::DistributedTokenBucket;
use super::health::HealthMonitor;
use crate::clock::{Clock, SystemClock};
use crate::config::TollgateConfig;
use crate::error::{BackendError, Result};
use crate::store::{BucketStore, RedisBucketStore};

/// Tokens taken from the shared bucket per request.
const REQUEST_COST: u64 = 1;

/// The admission limiter.
///
/// Prefers the shared token bucket while the backend is healthy and decides
/// locally otherwise. Construct one per process and share it behind an `Arc`.
pub struct RateLimiter {
    /// Paths starting with any of these are never limited
    exempt_prefixes: Vec<String>,
    /// Identity of the shared bucket
    bucket_key: String,
    store: Option<Arc<dyn BucketStore>>,
    /// Upper bound on one distributed decision, retries included
    backend_timeout: Duration,
    health: HealthMonitor,
    distributed: Option<DistributedTokenBucket>,
    fallback: LocalFallbackCounter,
}

impl RateLimiter {
    /// Build a limiter from configuration, using Redis when a host is set.
    pub fn from_config(config: &TollgateConfig) -> Result<Self> {
        config.validate()?;

        let store: Option<Arc<dyn BucketStore>> = if config.backend.is_configured() {
            let store = RedisBucketStore::new(
                config.backend.host.trim(),
                config.backend.port,
                config.backend.connect_timeout(),
            )?;
            Some(Arc::new(store))
        } else {
            info!("No distributed backend configured; limiting with the local counter only");
            None
        };

        Ok(Self::with_store(config, store, Arc::new(SystemClock)))
    }

    /// Build a limiter around an explicit store (or none) and clock.
    pub fn with_store(
        config: &TollgateConfig,
        store: Option<Arc<dyn BucketStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let health = HealthMonitor::new(
            store.clone(),
            config.backend.connect_timeout(),
            config.limiter.reprobe_interval(),
            clock.clone(),
        );

        let distributed = store.clone().map(|store| {
            DistributedTokenBucket::new(store, config.bucket.configuration())
                .with_idle_ttl(config.backend.idle_ttl())
                .with_max_attempts(config.bucket.max_cas_attempts)
                .with_clock(clock.clone())
        });

        let fallback =
            LocalFallbackCounter::with_clock(config.fallback.limit, config.fallback.window(), clock);

        debug!(
            bucket = %config.bucket.key,
            capacity = config.bucket.capacity,
            refill_tokens = config.bucket.refill_tokens,
            refill_interval_ms = config.bucket.refill_interval_ms,
            local_limit = config.fallback.limit,
            distributed = store.is_some(),
            "Rate limiter created"
        );

        Self {
            exempt_prefixes: config.limiter.exempt_prefixes.clone(),
            bucket_key: config.bucket.key.clone(),
            store,
            backend_timeout: config.backend.connect_timeout(),
            health,
            distributed,
            fallback,
        }
    }

    /// Decide whether the request for `path` may proceed.
    ///
    /// Never fails: if deciding goes wrong in an unexpected way the request is
    /// admitted.
    pub async fn admit(&self, path: &str) -> RateLimitDecision {
        if self.is_exempt(path) {
            trace!(path = %path, "Exempt path, bypassing rate limit");
            return RateLimitDecision::bypassed();
        }

        match AssertUnwindSafe(self.decide()).catch_unwind().await {
            Ok(decision) => {
                if !decision.allowed {
                    debug!(path = %path, reason = %decision.reason, "Request rate limited");
                }
                decision
            }
            Err(panic) => {
                error!(
                    path = %path,
                    error = %panic_message(panic.as_ref()),
                    "Rate limit check failed; admitting request"
                );
                RateLimitDecision::fail_open()
            }
        }
    }

    async fn decide(&self) -> RateLimitDecision {
        if let Some(bucket) = &self.distributed {
            if self.health.is_available().await {
                let attempt = bucket.try_consume(&self.bucket_key, REQUEST_COST);
                let outcome = tokio::time::timeout(self.backend_timeout, attempt)
                    .await
                    .unwrap_or(Err(BackendError::Timeout(self.backend_timeout)));
                match outcome {
                    Ok(allowed) => return RateLimitDecision::distributed(allowed),
                    Err(err) => {
                        warn!(
                            error = %err,
                            "Distributed rate limit check failed; deciding locally"
                        );
                        self.health.mark_unavailable();
                    }
                }
            }
        }

        RateLimitDecision::local(self.fallback.try_consume())
    }

    fn is_exempt(&self, path: &str) -> bool {
        self.exempt_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Backend health, for observability.
    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// The process-local counter, for observability.
    pub fn fallback(&self) -> &LocalFallbackCounter {
        &self.fallback
    }

    /// Release backend connections.
    pub async fn shutdown(&self) {
        if let Some(store) = &self.store {
            store.close().await;
        }
        info!("Rate limiter shut down");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{DecisionSource, Reason};
    use crate::store::testing::{Failure, FlakyStore};
    use crate::store::MemoryBucketStore;
    use std::time::Instant;

    fn limiter_with(
        config: &TollgateConfig,
        store: Option<Arc<dyn BucketStore>>,
    ) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let limiter = RateLimiter::with_store(config, store, clock.clone());
        (limiter, clock)
    }

    fn flaky_limiter() -> (RateLimiter, Arc<FlakyStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = FlakyStore::new(MemoryBucketStore::with_clock(clock.clone()));
        let limiter =
            RateLimiter::with_store(&TollgateConfig::default(), Some(store.clone()), clock.clone());
        (limiter, store, clock)
    }

    #[tokio::test]
    async fn test_working_backend_admits_capacity() {
        let store: Arc<dyn BucketStore> = Arc::new(MemoryBucketStore::new());
        let (limiter, _clock) = limiter_with(&TollgateConfig::default(), Some(store));

        let mut decisions = Vec::new();
        for _ in 0..150 {
            decisions.push(limiter.admit("/hello").await);
        }

        assert!(decisions[..100]
            .iter()
            .all(|d| d.allowed && d.reason == Reason::Ok && d.source == DecisionSource::Distributed));
        assert!(decisions[100..]
            .iter()
            .all(|d| !d.allowed && d.reason == Reason::DistributedLimit));
    }

    #[tokio::test]
    async fn test_no_backend_uses_local_counter() {
        let config = TollgateConfig::default();
        assert!(!config.backend.is_configured());
        let limiter = RateLimiter::from_config(&config).unwrap();

        let mut decisions = Vec::new();
        for _ in 0..150 {
            decisions.push(limiter.admit("/hello").await);
        }

        assert!(decisions[..100]
            .iter()
            .all(|d| d.allowed && d.reason == Reason::Ok && d.source == DecisionSource::Local));
        assert!(decisions[100..]
            .iter()
            .all(|d| !d.allowed && d.reason == Reason::LocalLimit));
        assert!(!limiter.health().is_configured());
    }

    #[tokio::test]
    async fn test_backend_timeout_falls_back_for_same_request() {
        let (limiter, store, _clock) = flaky_limiter();

        assert_eq!(limiter.admit("/hello").await.source, DecisionSource::Distributed);

        store.fail_with(Failure::Timeout);
        let decision = limiter.admit("/hello").await;
        assert!(decision.allowed);
        assert_eq!(decision.source, DecisionSource::Local);
        assert!(!limiter.health().is_available().await);

        // Later requests skip the backend entirely
        let loads = store.loads();
        assert_eq!(limiter.admit("/hello").await.source, DecisionSource::Local);
        assert_eq!(store.loads(), loads);
    }

    #[tokio::test]
    async fn test_protocol_error_leaves_local_state_alone() {
        let (limiter, store, _clock) = flaky_limiter();

        store.fail_with(Failure::Corrupt);
        let decision = limiter.admit("/hello").await;
        assert!(decision.allowed);
        assert_eq!(decision.source, DecisionSource::Local);
        assert_eq!(limiter.fallback().current_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_at_startup_uses_local_counter() {
        let (limiter, store, _clock) = flaky_limiter();
        store.fail_with(Failure::Refused);

        for _ in 0..100 {
            assert_eq!(limiter.admit("/hello").await.reason, Reason::Ok);
        }
        assert_eq!(limiter.admit("/hello").await.reason, Reason::LocalLimit);
        assert_eq!(store.pings(), 1);
        assert_eq!(store.loads(), 0);
    }

    #[tokio::test]
    async fn test_recovered_backend_is_promoted_again() {
        let (limiter, store, clock) = flaky_limiter();

        assert_eq!(limiter.admit("/hello").await.source, DecisionSource::Distributed);
        store.fail_with(Failure::Refused);
        assert_eq!(limiter.admit("/hello").await.source, DecisionSource::Local);

        store.recover();
        assert_eq!(limiter.admit("/hello").await.source, DecisionSource::Local);

        clock.advance(Duration::from_secs(30));
        assert_eq!(limiter.admit("/hello").await.source, DecisionSource::Distributed);
    }

    #[tokio::test]
    async fn test_exempt_path_bypasses_saturated_limiter() {
        let (limiter, _store, _clock) = flaky_limiter();

        while limiter.admit("/hello").await.allowed {}

        let decision = limiter.admit("/actuator/health").await;
        assert!(decision.allowed);
        assert_eq!(decision.reason, Reason::Bypassed);
        assert!(!limiter.admit("/hello").await.allowed);
    }

    #[tokio::test]
    async fn test_exempt_path_skips_backend() {
        let (limiter, store, _clock) = flaky_limiter();

        limiter.admit("/actuator/metrics").await;
        assert_eq!(store.pings(), 0);
        assert_eq!(store.loads(), 0);
    }

    #[tokio::test]
    async fn test_unexpected_failure_fails_open() {
        let (limiter, store, _clock) = flaky_limiter();
        assert!(limiter.health().is_available().await);

        store.fail_with(Failure::Panic);
        let decision = limiter.admit("/hello").await;
        assert!(decision.allowed);
        assert_eq!(decision.reason, Reason::Ok);
        assert_eq!(decision.source, DecisionSource::FailOpen);
    }

    #[tokio::test]
    async fn test_local_window_resets() {
        let config = TollgateConfig::default();
        let (limiter, clock) = limiter_with(&config, None);

        for _ in 0..100 {
            assert!(limiter.admit("/hello").await.allowed);
        }
        assert!(!limiter.admit("/hello").await.allowed);

        clock.advance(Duration::from_secs(1));
        assert!(limiter.admit("/hello").await.allowed);
    }

    #[tokio::test]
    async fn test_custom_bucket_key_and_prefixes() {
        let yaml = r#"
bucket:
  key: checkout
  capacity: 3
  refill_tokens: 1
limiter:
  exempt_prefixes: ["/internal/"]
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();
        let memory = MemoryBucketStore::new();
        let (limiter, _clock) = limiter_with(&config, Some(Arc::new(memory.clone())));

        for _ in 0..3 {
            assert!(limiter.admit("/hello").await.allowed);
        }
        assert!(!limiter.admit("/hello").await.allowed);
        assert_eq!(limiter.admit("/internal/ping").await.reason, Reason::Bypassed);
        // Default prefix no longer applies
        assert!(!limiter.admit("/actuator/health").await.allowed);

        assert_eq!(memory.load("checkout").await.unwrap().unwrap().tokens, 0);
    }

    #[tokio::test]
    async fn test_slow_writes_bounded_by_backend_timeout() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = FlakyStore::new(MemoryBucketStore::with_clock(clock.clone()));
        let mut config = TollgateConfig::default();
        config.backend.connect_timeout_ms = 200;
        let limiter = RateLimiter::with_store(&config, Some(store.clone()), clock);

        assert_eq!(limiter.admit("/hello").await.source, DecisionSource::Distributed);

        store.stall_writes();
        let started = Instant::now();
        let decision = limiter.admit("/hello").await;
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_secs(1), "admit blocked for {:?}", elapsed);
        assert!(decision.allowed);
        assert_eq!(decision.source, DecisionSource::Local);
        assert!(!limiter.health().is_available().await);
    }

    #[tokio::test]
    async fn test_shutdown_closes_store() {
        let (limiter, store, _clock) = flaky_limiter();
        limiter.admit("/hello").await;
        assert_eq!(store.closes(), 0);

        limiter.shutdown().await;
        assert_eq!(store.closes(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_without_backend() {
        let (limiter, _clock) = limiter_with(&TollgateConfig::default(), None);
        limiter.shutdown().await;
        assert!(limiter.admit("/hello").await.allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_share_one_budget() {
        let store: Arc<dyn BucketStore> = Arc::new(MemoryBucketStore::new());
        let mut config = TollgateConfig::default();
        config.bucket.max_cas_attempts = 1_000;
        let (limiter, _clock) = limiter_with(&config, Some(store));
        let limiter = Arc::new(limiter);

        let requests = (0..150).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.admit("/hello").await })
        });

        let decisions: Vec<RateLimitDecision> = futures::future::join_all(requests)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert_eq!(decisions.iter().filter(|d| d.allowed).count(), 100);
        assert!(decisions.iter().all(|d| d.source == DecisionSource::Distributed));
    }
}
