//! Circuit breaker for vector database operations

use crate::config::CircuitBreakerSettings;
use crate::error::{Result, ServiceError};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,

    /// Circuit is open, requests are rejected
    Open,

    /// Circuit is half-open, testing if service recovered
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Notification sent on every state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: usize,

    /// Consecutive half-open successes that close it again
    pub success_threshold: usize,

    /// Time spent open before a trial call is let through
    pub reset_timeout: Duration,

    /// Upper bound for a call run through `execute`
    pub call_timeout: Duration,

    /// Trial calls allowed concurrently while half-open
    pub half_open_max_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            success_threshold: settings.success_threshold,
            reset_timeout: Duration::from_millis(settings.reset_timeout_ms),
            call_timeout: Duration::from_millis(settings.call_timeout_ms),
            half_open_max_calls: settings.half_open_max_calls,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: usize,
    success_count: usize,
    opened_at: Option<Instant>,
    half_open_in_flight: usize,
    /// Bumped on every transition; trial slots belong to one half-open period
    epoch: u64,
    last_failure: Option<String>,
}

/// Circuit breaker for protecting against cascading failures
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejected: AtomicU64,
    transitions: broadcast::Sender<StateTransition>,
}

/// Admission for one call.
///
/// Settle it with `success` or `failure`. A permit dropped unsettled while it
/// holds a half-open trial slot counts as a failed trial, so a cancelled
/// caller cannot leave the breaker stuck half-open.
#[must_use = "an unsettled permit counts as an abandoned call"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    /// Half-open period this permit holds a trial slot in
    trial: Option<u64>,
    settled: bool,
}

impl CallPermit<'_> {
    /// Whether this call is a half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle(self.trial, None);
    }

    pub fn failure(mut self, reason: &str) {
        self.settled = true;
        self.breaker.total_failures.fetch_add(1, Ordering::Relaxed);
        self.breaker.settle(self.trial, Some(reason));
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(epoch) = self.trial {
            self.breaker.abandon_trial(epoch);
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                half_open_in_flight: 0,
                epoch: 0,
                last_failure: None,
            }),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            transitions,
        }
    }

    /// Receive every state change from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// Check if request should be allowed.
    ///
    /// An allowed request while half-open holds a trial slot until the caller
    /// reports the outcome through `record_success` or `record_failure`.
    /// Callers that may be cancelled should use `acquire` instead.
    pub fn allow_request(&self) -> bool {
        self.admit().is_some()
    }

    /// Like `allow_request`, but the trial slot is tied to the returned permit
    pub fn acquire(&self) -> Option<CallPermit<'_>> {
        self.admit().map(|trial| CallPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// `None` when rejected; otherwise the half-open epoch if a trial slot was taken
    fn admit(&self) -> Option<Option<u64>> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();

        let admitted = match inner.state {
            CircuitState::Closed => Some(None),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed >= self.config.reset_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_in_flight = 1;
                    Some(Some(inner.epoch))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    Some(Some(inner.epoch))
                } else {
                    None
                }
            }
        };

        if admitted.is_none() {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        let epoch = self.inner.lock().epoch;
        self.settle(Some(epoch), None);
    }

    /// Record a failed operation
    pub fn record_failure(&self, reason: &str) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let epoch = self.inner.lock().epoch;
        self.settle(Some(epoch), Some(reason));
    }

    /// Apply one outcome; `trial` frees the slot if its period is still current
    fn settle(&self, trial: Option<u64>, failure: Option<&str>) {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::HalfOpen && trial == Some(inner.epoch) {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }

        match failure {
            None => self.on_success(&mut inner),
            Some(reason) => self.on_failure(&mut inner, reason),
        }
    }

    fn on_success(&self, inner: &mut BreakerInner) {
        match inner.state {
            CircuitState::Closed => {
                // Reset failure count on success
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.failure_count = 0;
                inner.success_count += 1;

                if inner.success_count >= self.config.success_threshold {
                    self.transition(inner, CircuitState::Closed);
                    info!("Circuit breaker closed after successful recovery");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut BreakerInner, reason: &str) {
        inner.last_failure = Some(reason.to_string());

        match inner.state {
            CircuitState::Closed => {
                inner.success_count = 0;
                inner.failure_count += 1;

                if inner.failure_count >= self.config.failure_threshold {
                    let failures = inner.failure_count;
                    self.transition(inner, CircuitState::Open);
                    warn!("Circuit breaker opened after {} failures (last: {})", failures, reason);
                } else {
                    debug!(
                        "Circuit breaker failure {}/{}: {}",
                        inner.failure_count, self.config.failure_threshold, reason
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.transition(inner, CircuitState::Open);
                warn!("Circuit breaker reopened after failure in half-open state: {}", reason);
            }
            // Late results from calls started before the circuit opened
            CircuitState::Open => {}
        }
    }

    /// A trial call went away without an outcome
    fn abandon_trial(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::HalfOpen || inner.epoch != epoch {
            return;
        }
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        self.on_failure(&mut inner, "trial call abandoned");
    }

    /// Run `operation` if the circuit allows it, bounded by the call timeout.
    ///
    /// Transient errors and timeouts count as failures; any other outcome means
    /// the server answered and counts as success. Dropping the returned future
    /// mid-call counts as a failed trial when half-open.
    pub async fn execute<F, T>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let Some(permit) = self.acquire() else {
            return Err(ServiceError::CircuitOpen);
        };

        match tokio::time::timeout(self.config.call_timeout, operation).await {
            Ok(Ok(value)) => {
                permit.success();
                Ok(value)
            }
            Ok(Err(e)) => {
                if e.is_transient() {
                    permit.failure(&e.to_string());
                } else {
                    permit.success();
                }
                Err(e)
            }
            Err(_) => {
                let err = ServiceError::Timeout {
                    operation: "circuit breaker call".to_string(),
                    timeout_ms: self.config.call_timeout.as_millis() as u64,
                };
                permit.failure(&err.to_string());
                Err(err)
            }
        }
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Get statistics
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            state: inner.state,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            current_failures: inner.failure_count,
            current_successes: inner.success_count,
            last_failure: inner.last_failure.clone(),
        }
    }

    /// Reset circuit breaker
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
        debug!("Circuit breaker reset");
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_in_flight = 0;
        inner.epoch += 1;
        inner.opened_at = match to {
            CircuitState::Open => Some(Instant::now()),
            _ => None,
        };

        debug!("Circuit breaker {} -> {}", from.as_str(), to.as_str());
        // No subscribers is fine
        let _ = self.transitions.send(StateTransition { from, to });
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
    pub current_failures: usize,
    pub current_successes: usize,
    pub last_failure: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VectorDbError;

    fn test_config(reset_timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout,
            call_timeout: Duration::from_millis(50),
            half_open_max_calls: 1,
        }
    }

    fn open_breaker(cb: &CircuitBreaker) {
        for _ in 0..3 {
            cb.record_failure("boom");
        }
    }

    #[tokio::test]
    async fn test_circuit_breaker_closed() {
        let cb = CircuitBreaker::new(test_config(Duration::from_secs(1)));

        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens() {
        let cb = CircuitBreaker::new(test_config(Duration::from_secs(1)));

        open_breaker(&cb);

        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
        assert_eq!(cb.stats().total_rejected, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let cb = CircuitBreaker::new(test_config(Duration::from_secs(1)));

        cb.record_failure("a");
        cb.record_failure("b");
        cb.record_success();
        cb.record_failure("c");
        cb.record_failure("d");

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_breaker_half_open() {
        let cb = CircuitBreaker::new(test_config(Duration::from_millis(100)));

        open_breaker(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;

        // Should transition to half-open
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_limits_trial_calls() {
        let cb = CircuitBreaker::new(test_config(Duration::from_millis(50)));

        open_breaker(&cb);
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(cb.allow_request());
        // the single trial slot is taken
        assert!(!cb.allow_request());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request());
    }

    #[tokio::test]
    async fn test_circuit_breaker_recovery() {
        let cb = CircuitBreaker::new(test_config(Duration::from_millis(100)));

        open_breaker(&cb);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(cb.allow_request());
        cb.record_success();
        assert!(cb.allow_request());
        cb.record_success();

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failure_in_half_open_reopens() {
        let cb = CircuitBreaker::new(test_config(Duration::from_millis(50)));

        open_breaker(&cb);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cb.allow_request());

        cb.record_failure("still down");
        assert_eq!(cb.state(), CircuitState::Open);
        // the reset timer starts over
        assert!(!cb.allow_request());
    }

    #[tokio::test]
    async fn test_transitions_are_broadcast() {
        let cb = CircuitBreaker::new(test_config(Duration::from_millis(20)));
        let mut rx = cb.subscribe();

        open_breaker(&cb);
        tokio::time::sleep(Duration::from_millis(40)).await;
        cb.allow_request();
        cb.record_success();
        cb.allow_request();
        cb.record_success();

        let seen: Vec<CircuitState> = std::iter::from_fn(|| rx.try_recv().ok()).map(|t| t.to).collect();
        assert_eq!(
            seen,
            vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
        );
    }

    #[tokio::test]
    async fn test_execute_rejects_when_open() {
        let cb = CircuitBreaker::new(test_config(Duration::from_secs(5)));
        open_breaker(&cb);

        let result = cb.execute(async { Ok::<_, ServiceError>(1) }).await;
        assert!(matches!(result, Err(ServiceError::CircuitOpen)));
    }

    #[tokio::test]
    async fn test_execute_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new(test_config(Duration::from_secs(5)));

        let result = cb
            .execute(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, ServiceError>(())
            })
            .await;

        assert!(matches!(result, Err(ServiceError::Timeout { .. })));
        assert_eq!(cb.stats().current_failures, 1);
    }

    #[tokio::test]
    async fn test_execute_non_transient_error_is_not_a_failure() {
        let cb = CircuitBreaker::new(test_config(Duration::from_secs(5)));

        let result: Result<()> = cb
            .execute(async {
                Err(VectorDbError::RequestRejected { status: 422, message: "bad".into() }.into())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(cb.stats().total_failures, 0);
    }

    #[tokio::test]
    async fn test_cancelled_trial_call_reopens() {
        let cb = CircuitBreaker::new(test_config(Duration::from_millis(30)));
        open_breaker(&cb);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            cb.execute(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, ServiceError>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());

        // the trial counted as failed, so the breaker is open again
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_dropped_permit_frees_trial_slot() {
        let cb = CircuitBreaker::new(test_config(Duration::from_millis(30)));
        open_breaker(&cb);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let permit = cb.acquire().unwrap();
        assert!(permit.is_trial());
        assert!(cb.acquire().is_none());
        drop(permit);

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().total_failures, 4);
    }

    #[tokio::test]
    async fn test_stale_permit_leaves_new_period_alone() {
        let cb = CircuitBreaker::new(test_config(Duration::from_millis(30)));
        open_breaker(&cb);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stale = cb.acquire().unwrap();
        cb.record_failure("reopened elsewhere");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let current = cb.acquire().unwrap();

        drop(stale);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        current.success();
        assert!(cb.allow_request());
    }

    #[tokio::test]
    async fn test_settled_permit_closes_circuit() {
        let cb = CircuitBreaker::new(test_config(Duration::from_millis(30)));
        open_breaker(&cb);
        tokio::time::sleep(Duration::from_millis(50)).await;

        cb.acquire().unwrap().success();
        cb.acquire().unwrap().success();
        assert_eq!(cb.state(), CircuitState::Closed);

        // closed-state permits hold no slot; dropping one changes nothing
        let permit = cb.acquire().unwrap();
        assert!(!permit.is_trial());
        drop(permit);
        assert_eq!(cb.stats().current_failures, 0);
    }

    #[tokio::test]
    async fn test_reset() {
        let cb = CircuitBreaker::new(test_config(Duration::from_secs(5)));
        open_breaker(&cb);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }
}
