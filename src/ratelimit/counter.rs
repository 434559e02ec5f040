//! Process-local fixed-window counter used while the shared backend is down.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};

/// Counter state guarded as a unit so a window reset and the increment that
/// follows it cannot interleave with another caller.
#[derive(Debug)]
struct Window {
    /// Requests seen in the current window
    count: u64,
    /// When the current window started (clock millis)
    start_ms: u64,
}

/// A fixed-window counter limited to this process.
///
/// In a deployment of N instances the aggregate limit while every instance is
/// in fallback is `limit * N`.
#[derive(Debug)]
pub struct LocalFallbackCounter {
    /// Requests admitted per window
    limit: u64,
    /// Window length
    window: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<Window>,
}

impl LocalFallbackCounter {
    /// Create a counter on the system clock.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self::with_clock(limit, window, Arc::new(SystemClock))
    }

    /// Create a counter on an explicit clock.
    pub fn with_clock(limit: u64, window: Duration, clock: Arc<dyn Clock>) -> Self {
        let start_ms = clock.now_millis();
        Self {
            limit,
            window,
            clock,
            state: Mutex::new(Window { count: 0, start_ms }),
        }
    }

    /// Count one request and report whether it is within the limit.
    ///
    /// Denied requests are counted too; the window simply runs past `limit`.
    pub fn try_consume(&self) -> bool {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        self.maybe_reset_window(&mut state, now);

        let admitted = state.count < self.limit;
        state.count = state.count.saturating_add(1);
        admitted
    }

    /// Get the current count.
    pub fn current_count(&self) -> u64 {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        self.maybe_reset_window(&mut state, now);
        state.count
    }

    /// Get the remaining quota in the current window.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.current_count())
    }

    /// Get the limit for this counter.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Get the duration until the current window resets.
    pub fn duration_until_reset(&self) -> Duration {
        let now = self.clock.now_millis();
        let state = self.state.lock();
        let elapsed = Duration::from_millis(now.saturating_sub(state.start_ms));
        self.window.saturating_sub(elapsed)
    }

    /// Reset the window if it has expired.
    fn maybe_reset_window(&self, state: &mut Window, now: u64) {
        let elapsed = Duration::from_millis(now.saturating_sub(state.start_ms));
        if elapsed >= self.window {
            state.count = 0;
            state.start_ms = now;
        }
    }
}
