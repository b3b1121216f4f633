//! Circuit breaker guarding all outbound HTTP calls.
//!
//! # State machine
//!
//! ```text
//!             failures >= threshold
//!   CLOSED ──────────────────────────> OPEN
//!     ^                                  │ recovery_timeout elapsed
//!     │ probe succeeds                   v
//!     └────────────────────────────  HALF_OPEN
//!                 probe fails ──────────> OPEN (restamped)
//! ```
//!
//! While OPEN every call is rejected with [`CircuitError::Open`] without the
//! wrapped future being polled. HALF_OPEN admits at most
//! `half_open_max_calls` probes.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker state visible through [`CircuitBreaker::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Error wrapper returned by [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The breaker is OPEN; the operation was not attempted.
    #[error("circuit breaker is open")]
    Open,
    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

/// Tuning knobs for the breaker.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting probes.
    pub recovery_timeout: Duration,
    /// Probes admitted while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        CircuitBreaker::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
            }),
        }
    }

    /// Runs `operation` under breaker protection.
    ///
    /// The admission decision happens before the future is polled and the
    /// lock is not held across the `.await`.
    pub async fn call<T, E, Fut>(&self, operation: Fut) -> Result<T, CircuitError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit().await?;

        let result = operation.await;

        let mut inner = self.inner.lock().await;
        match result {
            Ok(value) => {
                if inner.state != CircuitState::Closed {
                    info!("Circuit breaker closed after successful probe");
                }
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.half_open_in_flight = 0;
                Ok(value)
            }
            Err(err) => {
                inner.consecutive_failures += 1;
                let should_open = inner.state == CircuitState::HalfOpen
                    || inner.consecutive_failures >= self.config.failure_threshold;
                if should_open {
                    if inner.state != CircuitState::Open {
                        warn!(
                            "Circuit breaker opened after {} consecutive failures",
                            inner.consecutive_failures
                        );
                    }
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.half_open_in_flight = 0;
                }
                Err(CircuitError::Inner(err))
            }
        }
    }

    async fn admit<E>(&self) -> Result<(), CircuitError<E>> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed < self.config.recovery_timeout {
                    return Err(CircuitError::Open);
                }
                info!("Circuit breaker half-open, admitting probe");
                inner.state = CircuitState::HalfOpen;
                inner.half_open_in_flight = 1;
                Ok(())
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_calls {
                    return Err(CircuitError::Open);
                }
                inner.half_open_in_flight += 1;
                Ok(())
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock().await;
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: recovery,
            half_open_max_calls: 1,
        })
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        breaker.call(async { Err::<(), _>("boom") }).await.map(|_: ()| ())
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        breaker.call(async { Ok::<_, &'static str>(()) }).await
    }

    #[tokio::test]
    async fn test_closed_failures_below_threshold() {
        let breaker = breaker(3, Duration::from_secs(60));
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_failure_counter() {
        let breaker = breaker(3, Duration::from_secs(60));
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.stats().await.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_opens_at_threshold_and_short_circuits() {
        let breaker = breaker(2, Duration::from_secs(60));
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state().await, CircuitState::Open);

        // The wrapped operation must not run while open.
        let result: Result<(), CircuitError<&'static str>> = breaker
            .call(async { panic!("operation must not be polled") })
            .await;
        assert!(matches!(result, Err(CircuitError::Open)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_admits_single_probe() {
        let breaker = breaker(1, Duration::from_millis(100));
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;

        // Exactly one probe is admitted and its success closes the circuit.
        breaker.call(async { Ok::<_, &'static str>(()) }).await.unwrap();
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_rejects_second_probe() {
        let breaker = breaker(1, Duration::from_millis(100));
        fail(&breaker).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Move to half-open and hold the probe slot without resolving it.
        breaker.admit::<&'static str>().await.unwrap();
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        let second = breaker.admit::<&'static str>().await;
        assert!(matches!(second, Err(CircuitError::Open)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens_with_fresh_stamp() {
        let breaker = breaker(5, Duration::from_millis(100));
        // Open via threshold.
        for _ in 0..5 {
            fail(&breaker).await.unwrap_err();
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state().await, CircuitState::Open);

        // Freshly restamped: still rejecting before the new timeout elapses.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let rejected = breaker
            .call(async { Ok::<_, &'static str>(()) })
            .await
            .map(|_: ()| ());
        assert!(matches!(rejected, Err(CircuitError::Open)));
    }
}
