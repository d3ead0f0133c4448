use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Too many consecutive failures; stays open until an explicit reset.
    Open,
}

// ---------------------------------------------------------------------------
// Inner state (behind Mutex)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct InnerState {
    state: CircuitState,
    consecutive_failures: u32,
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Consecutive-failure circuit breaker.
///
/// `record_failure` increments a streak counter; reaching the threshold
/// opens the circuit. There is no timed half-open probe: the circuit closes
/// only through an explicit [`reset`](CircuitBreaker::reset). A success
/// while closed clears the streak.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    inner: Arc<Mutex<InnerState>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            inner: Arc::new(Mutex::new(InnerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
            })),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.state == CircuitState::Open
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.inner.lock().await.consecutive_failures
    }

    /// Record a success; clears the failure streak while closed.
    pub async fn record_success(&self) {
        let mut guard = self.inner.lock().await;
        if guard.state == CircuitState::Closed {
            guard.consecutive_failures = 0;
        }
    }

    /// Record a failure. Returns `true` when this failure opened the circuit.
    pub async fn record_failure(&self) -> bool {
        let mut guard = self.inner.lock().await;
        guard.consecutive_failures += 1;
        if guard.state == CircuitState::Closed && guard.consecutive_failures >= self.threshold {
            warn!(
                failures = guard.consecutive_failures,
                "circuit breaker transitioning Closed -> Open"
            );
            guard.state = CircuitState::Open;
            return true;
        }
        false
    }

    /// Explicitly close the circuit and clear the streak.
    pub async fn reset(&self) {
        let mut guard = self.inner.lock().await;
        if guard.state == CircuitState::Open {
            info!("circuit breaker reset Open -> Closed");
        }
        guard.state = CircuitState::Closed;
        guard.consecutive_failures = 0;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_exactly_threshold_failures() {
        let breaker = CircuitBreaker::new(3);
        assert!(!breaker.record_failure().await);
        assert!(!breaker.record_failure().await);
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert!(breaker.record_failure().await);
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_clears_the_streak() {
        let breaker = CircuitBreaker::new(3);
        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_success().await;
        assert_eq!(breaker.consecutive_failures().await, 0);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn stays_open_until_explicit_reset() {
        let breaker = CircuitBreaker::new(1);
        breaker.record_failure().await;
        assert!(breaker.is_open().await);

        // Success does not close an open circuit.
        breaker.record_success().await;
        assert!(breaker.is_open().await);

        breaker.reset().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures().await, 0);
    }

    #[tokio::test]
    async fn opening_is_reported_once() {
        let breaker = CircuitBreaker::new(2);
        assert!(!breaker.record_failure().await);
        assert!(breaker.record_failure().await);
        // Already open; further failures do not re-report the transition.
        assert!(!breaker.record_failure().await);
    }
}
