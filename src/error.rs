//! Typed error taxonomy for the orchestration kernel.
//!
//! Every kind named in the error-handling design is a distinct variant so
//! callers can match on failure class instead of parsing strings. Leaf
//! modules define their own narrower error enums and convert into
//! [`OrchestratorError`] at the boundary where the broader context is known.

use thiserror::Error;

/// Top-level error type surfaced by the orchestrator's public API.
///
/// Operational failures that a task submitter should see as data (timeouts,
/// task failures) are carried in [`crate::task::TaskResult`], never as this
/// error type. This enum is for failures that abort a startup phase or are
/// raised to a caller as a programming/usage error.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed or incompatible configuration; aborts the process at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Insufficient agents started to satisfy `min_agents`.
    #[error("resource error: {0}")]
    Resource(String),

    /// Container runtime failure (creation, exec, snapshot, restore).
    #[error("container error: {0}")]
    Container(#[from] crate::workspace::WorkspaceError),

    /// Socket bind/connect/read/write failure.
    #[error("channel error: {0}")]
    Channel(#[from] crate::channel::ChannelError),

    /// Malformed or duplicate-id message on the broker protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    /// Invalid task descriptor submitted to `execute_task`.
    #[error("task validation error: {0}")]
    TaskValidation(#[from] crate::task::TaskValidationError),

    /// Queue at capacity.
    #[error("queue full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },
}

/// Convenience alias for fallible kernel-startup operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

pub mod resilience {
    //! Retry-with-backoff and circuit-breaker combinators shared by any
    //! component that talks to an external, occasionally-flaky dependency
    //! (chiefly the container runtime).

    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::time::{Duration, Instant};

    use rand::Rng;
    use tracing::warn;

    /// Exponential backoff parameters.
    #[derive(Debug, Clone, Copy)]
    pub struct BackoffPolicy {
        /// Delay before the first retry.
        pub base_delay: Duration,
        /// Multiplier applied to the delay after each attempt.
        pub factor: f64,
        /// Upper bound on the computed delay.
        pub max_delay: Duration,
        /// Maximum number of attempts (including the first).
        pub max_attempts: u32,
    }

    impl Default for BackoffPolicy {
        fn default() -> Self {
            Self {
                base_delay: Duration::from_millis(200),
                factor: 2.0,
                max_delay: Duration::from_secs(10),
                max_attempts: 3,
            }
        }
    }

    impl BackoffPolicy {
        /// Delay before attempt `attempt` (0-indexed), with +/-20% jitter.
        fn delay_for(&self, attempt: u32) -> Duration {
            let raw = self.base_delay.as_secs_f64() * self.factor.powi(attempt as i32);
            let capped = raw.min(self.max_delay.as_secs_f64());
            let jitter = rand::rng().random_range(0.8..1.2);
            Duration::from_secs_f64(capped * jitter)
        }
    }

    /// Retry `op` according to `policy`, returning the first success or the
    /// last error once attempts are exhausted.
    pub async fn with_backoff<T, E, F, Fut>(policy: BackoffPolicy, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(attempt, %err, delay_ms = delay.as_millis() as u64, "retrying after failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Circuit breaker state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum BreakerState {
        /// Calls pass through normally.
        Closed,
        /// Calls are rejected until the cooldown elapses.
        Open,
        /// A single probe call is allowed through to test recovery.
        HalfOpen,
    }

    /// A simple failure-count circuit breaker for repeated container-runtime
    /// failures. Thread-safe via atomics; no internal locking.
    #[derive(Debug)]
    pub struct CircuitBreaker {
        failure_threshold: u32,
        cooldown: Duration,
        consecutive_failures: AtomicU32,
        opened_at_millis: AtomicU64,
    }

    impl CircuitBreaker {
        /// Construct a breaker that opens after `failure_threshold` consecutive
        /// failures and attempts recovery after `cooldown`.
        pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
            Self {
                failure_threshold,
                cooldown,
                consecutive_failures: AtomicU32::new(0),
                opened_at_millis: AtomicU64::new(0),
            }
        }

        /// Current breaker state, resolving `Open` into `HalfOpen` once the
        /// cooldown window has elapsed.
        pub fn state(&self) -> BreakerState {
            let failures = self.consecutive_failures.load(Ordering::Acquire);
            if failures < self.failure_threshold {
                return BreakerState::Closed;
            }
            let opened_at = self.opened_at_millis.load(Ordering::Acquire);
            let elapsed = now_millis().saturating_sub(opened_at);
            if elapsed >= self.cooldown.as_millis() as u64 {
                BreakerState::HalfOpen
            } else {
                BreakerState::Open
            }
        }

        /// Record a successful call, resetting the failure count.
        pub fn record_success(&self) {
            self.consecutive_failures.store(0, Ordering::Release);
        }

        /// Record a failed call, opening the breaker once the threshold is hit.
        pub fn record_failure(&self) {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            if failures == self.failure_threshold {
                self.opened_at_millis.store(now_millis(), Ordering::Release);
            }
        }

        /// Whether a call should be allowed to proceed right now.
        pub fn allow_call(&self) -> bool {
            !matches!(self.state(), BreakerState::Open)
        }
    }

    fn now_millis() -> u64 {
        static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let epoch = EPOCH.get_or_init(Instant::now);
        epoch.elapsed().as_millis() as u64
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn with_backoff_succeeds_after_transient_failures() {
            let attempts = std::sync::atomic::AtomicU32::new(0);
            let policy = BackoffPolicy {
                base_delay: Duration::from_millis(1),
                factor: 1.0,
                max_delay: Duration::from_millis(5),
                max_attempts: 5,
            };
            let result: Result<u32, &str> = with_backoff(policy, || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
            assert_eq!(result, Ok(42));
            assert_eq!(attempts.load(Ordering::SeqCst), 3);
        }

        #[test]
        fn breaker_opens_after_threshold_and_half_opens_after_cooldown() {
            let breaker = CircuitBreaker::new(3, Duration::from_millis(20));
            assert_eq!(breaker.state(), BreakerState::Closed);
            breaker.record_failure();
            breaker.record_failure();
            assert_eq!(breaker.state(), BreakerState::Closed);
            breaker.record_failure();
            assert_eq!(breaker.state(), BreakerState::Open);
            assert!(!breaker.allow_call());
            std::thread::sleep(Duration::from_millis(25));
            assert_eq!(breaker.state(), BreakerState::HalfOpen);
            assert!(breaker.allow_call());
            breaker.record_success();
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
    }
}
