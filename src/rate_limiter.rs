//! Client-side rate limiting for outbound backend calls.
//!
//! A fixed-window counter: up to `limit` acquisitions per `window`. Unlike
//! a rejecting limiter, [`RateLimiter::acquire`] suspends the caller until
//! the window rolls over, so transport code never has to handle a
//! rate-limit error locally.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Snapshot of the limiter window.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterStats {
    pub current_count: u32,
    pub window_start: Instant,
    pub limit: u32,
}

#[derive(Debug)]
struct Window {
    started_at: Instant,
    count: u32,
}

/// Fixed-window rate limiter. Default: 100 calls per 60 seconds.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    state: Mutex<Window>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        RateLimiter::new(100, Duration::from_secs(60))
    }
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        RateLimiter {
            limit,
            window,
            state: Mutex::new(Window {
                started_at: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Acquires one slot, suspending until the window rolls over when the
    /// limit is exhausted. Concurrent callers serialise on the internal
    /// lock; the lock is released while sleeping.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if now.duration_since(state.started_at) >= self.window {
                    state.started_at = now;
                    state.count = 0;
                }
                if state.count < self.limit {
                    state.count += 1;
                    return;
                }
                self.window - now.duration_since(state.started_at)
            };
            debug!(
                "Rate limit reached ({} calls), waiting {:?} for next window",
                self.limit, wait
            );
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn stats(&self) -> RateLimiterStats {
        let state = self.state.lock().await;
        RateLimiterStats {
            current_count: state.count,
            window_start: state.started_at,
            limit: self.limit,
        }
    }
}
