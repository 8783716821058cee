//! The fault shell: per-server circuit breakers wrapping retry with
//! bounded exponential backoff, as described in spec §4.7.
//!
//! Grounded on the teacher's `api::gateway::{CircuitBreaker, RetryPolicy,
//! ApiGateway}`, generalized from "one gateway with a handful of named
//! backends" to "one breaker keyed by chunk-server id, created lazily as
//! the membership manager discovers servers".

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;

/// Circuit breaker configuration. Values are the compiled-in defaults
/// from spec §4.7; not currently exposed as environment tunables.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub half_open_success_threshold: u32,
    pub half_open_trial_requests: u32,
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            half_open_success_threshold: 3,
            half_open_trial_requests: 3,
            open_duration: Duration::from_secs(30),
        }
    }
}

/// Retry configuration. Values are the compiled-in defaults from
/// spec §4.7.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    failures: u32,
    half_open_successes: u32,
    half_open_inflight: u32,
    opened_at: Instant,
}

/// One circuit breaker per chunk server. Own mutex, not the registry's,
/// per the teacher's design note: guard state transitions with the
/// breaker's own lock so the registry's read lock stays cheap.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<BreakerInner>,
}

impl CircuitBreaker {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                half_open_successes: 0,
                half_open_inflight: 0,
                opened_at: Instant::now(),
            }),
        }
    }

    /// Returns `true` if a call is admitted right now, transitioning
    /// Open -> HalfOpen as a side effect once the open timeout elapses.
    fn admit(&self) -> bool {
        let mut guard = self.inner.write();
        match guard.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if guard.opened_at.elapsed() >= self.config.open_duration {
                    tracing::info!("circuit breaker transitioning to half-open");
                    guard.state = CircuitState::HalfOpen;
                    guard.half_open_successes = 0;
                    guard.half_open_inflight = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if guard.half_open_inflight < self.config.half_open_trial_requests {
                    guard.half_open_inflight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        let mut guard = self.inner.write();
        match guard.state {
            CircuitState::Closed => {
                guard.failures = 0;
            }
            CircuitState::HalfOpen => {
                guard.half_open_successes += 1;
                if guard.half_open_successes >= self.config.half_open_success_threshold {
                    tracing::info!("circuit breaker transitioning to closed");
                    guard.state = CircuitState::Closed;
                    guard.failures = 0;
                    guard.half_open_successes = 0;
                    guard.half_open_inflight = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut guard = self.inner.write();
        match guard.state {
            CircuitState::Closed => {
                guard.failures += 1;
                if guard.failures >= self.config.failure_threshold {
                    tracing::warn!("circuit breaker transitioning to open");
                    guard.state = CircuitState::Open;
                    guard.opened_at = Instant::now();
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("circuit breaker re-opening after half-open failure");
                guard.state = CircuitState::Open;
                guard.opened_at = Instant::now();
                guard.half_open_successes = 0;
                guard.half_open_inflight = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Current state, for diagnostics and `/health`.
    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }
}

/// Classification of a single attempt's outcome, decided by the raw
/// per-attempt call site (the chunk-service client), not by this
/// module: only the caller knows whether a given failure came from the
/// transport or from the application layer.
#[derive(Debug)]
pub enum Attempt<T> {
    /// Retryable: connection refused/reset, broken pipe, deadline
    /// exceeded, or a service-unavailable class response.
    Retryable(CoreError),
    /// Non-retryable: validation, checksum mismatch, not-found,
    /// resource exhaustion. Surfaced to the caller immediately.
    Fatal(CoreError),
    Ok(T),
}

async fn retry<F, Fut, T>(config: RetryConfig, cancel: &CancellationToken, op: F) -> Result<T, CoreError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(CoreError::ServerUnavailable("request cancelled".into()));
        }

        match op().await {
            Attempt::Ok(value) => return Ok(value),
            Attempt::Fatal(err) => return Err(err),
            Attempt::Retryable(err) => {
                if attempt >= config.max_attempts {
                    tracing::warn!(attempts = attempt, "retries exhausted: {err}");
                    return Err(err);
                }
                tracing::warn!(attempt, max = config.max_attempts, "retrying after {err}");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(CoreError::ServerUnavailable("request cancelled".into()));
                    }
                }
                delay = (delay * 2).min(config.max_delay);
            }
        }
    }
}

/// Registry of per-server circuit breakers plus the shared retry
/// policy. One instance lives in the router, shared by the upload,
/// download, and reclamation paths.
pub struct FaultShell {
    breaker_config: CircuitBreakerConfig,
    retry_config: RetryConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Default for FaultShell {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), RetryConfig::default())
    }
}

impl FaultShell {
    pub fn new(breaker_config: CircuitBreakerConfig, retry_config: RetryConfig) -> Self {
        Self {
            breaker_config,
            retry_config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    fn breaker_for(&self, server_id: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.read().get(server_id) {
            return b.clone();
        }
        let mut guard = self.breakers.write();
        guard
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.breaker_config)))
            .clone()
    }

    /// Drop a server's breaker when it leaves the ring, so a future
    /// re-registration starts Closed instead of inheriting stale state.
    pub fn remove(&self, server_id: &str) {
        self.breakers.write().remove(server_id);
    }

    /// Current breaker state for a server, for `/health` and tests.
    pub fn breaker_state(&self, server_id: &str) -> CircuitState {
        self.breaker_for(server_id).state()
    }

    /// `breaker.execute(server, || retry(() => raw_call(server, ..)))`
    /// from spec §4.7: identical shape for upload and download.
    pub async fn call<F, Fut, T>(
        &self,
        server_id: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, CoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let breaker = self.breaker_for(server_id);
        if !breaker.admit() {
            return Err(CoreError::ServerUnavailable(format!(
                "circuit open for server {server_id}"
            )));
        }

        let result = retry(self.retry_config, cancel, op).await;
        match &result {
            Ok(_) => breaker.record_success(),
            Err(_) => breaker.record_failure(),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn breaker_starts_closed_and_admits() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.admit());
    }

    #[test]
    fn breaker_opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.admit());
    }

    #[test]
    fn breaker_half_opens_after_timeout_and_closes_on_successes() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::from_millis(1),
            half_open_success_threshold: 2,
            half_open_trial_requests: 2,
        });
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.admit());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::from_millis(1),
            ..Default::default()
        });
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.admit());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn fault_shell_retries_then_succeeds() {
        let shell = FaultShell::new(
            CircuitBreakerConfig::default(),
            RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        );
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result = shell
            .call("server-a", &cancel, || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Attempt::Retryable(CoreError::ServerUnavailable("transient".into()))
                } else {
                    Attempt::Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fault_shell_fatal_error_is_not_retried() {
        let shell = FaultShell::default();
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<(), CoreError> = shell
            .call("server-a", &cancel, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Attempt::Fatal(CoreError::DataLoss("checksum mismatch".into()))
            })
            .await;

        assert!(matches!(result, Err(CoreError::DataLoss(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fault_shell_opens_circuit_and_fails_fast() {
        let shell = FaultShell::new(
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            },
            RetryConfig {
                max_attempts: 1,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        );
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let _: Result<(), CoreError> = shell
                .call("server-a", &cancel, || async {
                    Attempt::Retryable(CoreError::ServerUnavailable("down".into()))
                })
                .await;
        }

        assert_eq!(shell.breaker_state("server-a"), CircuitState::Open);

        let attempts = AtomicU32::new(0);
        let result: Result<(), CoreError> = shell
            .call("server-a", &cancel, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Attempt::Ok(())
            })
            .await;

        assert!(matches!(result, Err(CoreError::ServerUnavailable(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 0, "breaker must fail fast");
    }

    #[tokio::test]
    async fn cancellation_aborts_retry_immediately() {
        let shell = FaultShell::new(
            CircuitBreakerConfig::default(),
            RetryConfig {
                max_attempts: 5,
                initial_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(30),
            },
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), CoreError> = shell
            .call("server-a", &cancel, || async {
                Attempt::Retryable(CoreError::ServerUnavailable("down".into()))
            })
            .await;

        assert!(result.is_err());
    }
}
