//! Rate limiting logic and state management.

mod bucket;
mod counter;
mod decision;
mod distributed;
mod health;
mod limiter;

pub use bucket::{BucketConfiguration, BucketState};
pub use counter::LocalFallbackCounter;
pub use decision::{DecisionSource, RateLimitDecision, Reason, RejectionBody};
pub use distributed::DistributedTokenBucket;
pub use health::HealthMonitor;
pub use limiter::RateLimiter;
