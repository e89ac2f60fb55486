//! Circuit Breaker Module
//!
//! Per-tier failure isolation. Closed passes calls through; after
//! `failure_threshold` consecutive failures inside `failure_window` the
//! breaker opens and fast-fails every call for `cooldown`. It then admits a
//! single half-open trial whose outcome closes or re-opens it.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use super::TierError;

// == Circuit State ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls fail immediately without reaching the tier
    Open,
    /// One trial call is allowed through
    HalfOpen,
}

/// How a call got past the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted while closed
    Normal,
    /// The single half-open trial
    Trial,
}

// == Configuration ==
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u64,
    /// Failures older than this no longer count toward the threshold
    pub failure_window: Duration,
    /// Time spent open before a trial is allowed
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u64,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    window_start: Instant,
    window_calls: u64,
    window_failures: u64,
}

// == Circuit Breaker ==
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                opened_at: None,
                trial_in_flight: false,
                window_start: Instant::now(),
                window_calls: 0,
                window_failures: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, moving Open to HalfOpen once the cool-down has passed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Fraction of failed calls in the current failure window.
    pub fn error_rate(&self) -> f64 {
        let mut inner = self.lock();
        self.roll_window(&mut inner);
        if inner.window_calls == 0 {
            0.0
        } else {
            inner.window_failures as f64 / inner.window_calls as f64
        }
    }

    /// Asks to send one call. In HalfOpen only the first caller is admitted,
    /// as the trial, until that trial settles.
    pub fn allow(&self) -> Option<Admission> {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    None
                } else {
                    inner.trial_in_flight = true;
                    Some(Admission::Trial)
                }
            }
        }
    }

    /// Records a healthy response. Only the trial's verdict closes a
    /// half-open circuit.
    pub fn record_success(&self, admission: Admission) {
        let mut inner = self.lock();
        self.roll_window(&mut inner);
        inner.window_calls += 1;
        inner.consecutive_failures = 0;

        if admission == Admission::Trial {
            inner.trial_in_flight = false;
            if inner.state == CircuitState::HalfOpen {
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                info!(circuit = %self.name, "circuit closed after successful trial");
            }
        }
    }

    pub fn record_failure(&self, admission: Admission) {
        let mut inner = self.lock();
        let now = Instant::now();
        self.roll_window(&mut inner);
        inner.window_calls += 1;
        inner.window_failures += 1;
        if admission == Admission::Trial {
            inner.trial_in_flight = false;
        }

        if let Some(last) = inner.last_failure {
            if now.duration_since(last) >= self.config.failure_window {
                inner.consecutive_failures = 0;
            }
        }
        inner.last_failure = Some(now);
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        circuit = %self.name,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen if admission == Admission::Trial => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                warn!(circuit = %self.name, "circuit re-opened after failed trial");
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    /// Runs `f` under the breaker. Validation rejections count as a healthy
    /// response; every other error counts as a failure. If the future is
    /// dropped mid-call, a half-open trial slot is released without a verdict.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, TierError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TierError>>,
    {
        let Some(admission) = self.allow() else {
            return Err(TierError::CircuitOpen);
        };

        let mut guard = TrialGuard {
            breaker: self,
            admission,
            settled: false,
        };
        let result = f().await;
        guard.settled = true;

        match &result {
            Ok(_) | Err(TierError::Rejected(_)) => self.record_success(admission),
            Err(_) => self.record_failure(admission),
        }
        result
    }

    fn maybe_half_open(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = inner.opened_at {
            if opened_at.elapsed() >= self.config.cooldown {
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = false;
                info!(circuit = %self.name, "circuit half-open");
            }
        }
    }

    fn roll_window(&self, inner: &mut BreakerInner) {
        if inner.window_start.elapsed() >= self.config.failure_window {
            inner.window_start = Instant::now();
            inner.window_calls = 0;
            inner.window_failures = 0;
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release_trial(&self) {
        self.lock().trial_in_flight = false;
    }
}

struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Trial {
            self.breaker.release_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "regional",
            CircuitBreakerConfig {
                failure_threshold: 3,
                failure_window: Duration::from_secs(60),
                cooldown: Duration::from_secs(30),
            },
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), TierError> {
        breaker
            .call(|| async { Err::<(), _>(TierError::Transport("down".into())) })
            .await
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = breaker();
        for _ in 0..2 {
            let _ = fail(&breaker).await;
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let result = breaker.call(|| async { Ok::<_, TierError>(1) }).await;
        assert_eq!(result, Err(TierError::CircuitOpen));
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_count() {
        let breaker = breaker();
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        breaker.call(|| async { Ok::<_, TierError>(()) }).await.unwrap();
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_rejection_does_not_trip() {
        let breaker = breaker();
        for _ in 0..5 {
            let _ = breaker
                .call(|| async { Err::<(), _>(TierError::Rejected("too large".into())) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_single_trial_then_close() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert_eq!(breaker.allow(), Some(Admission::Trial));
        assert_eq!(breaker.allow(), None);
        breaker.record_success(Admission::Trial);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_does_not_close_half_open() {
        let breaker = breaker();
        for _ in 0..2 {
            let _ = fail(&breaker).await;
        }
        // Admitted while still closed, settles after the circuit opened.
        let straggler = breaker.allow();
        assert_eq!(straggler, Some(Admission::Normal));
        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success(Admission::Normal);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_failure(Admission::Normal);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert_eq!(breaker.allow(), Some(Admission::Trial));
        breaker.record_success(Admission::Trial);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_accumulate() {
        let breaker = breaker();
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_releases_slot() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        let pending = breaker.call(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, TierError>(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(5), pending).await;
        assert!(timed_out.is_err());

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.allow(), Some(Admission::Trial));
    }

    #[tokio::test]
    async fn test_error_rate() {
        let breaker = breaker();
        breaker.call(|| async { Ok::<_, TierError>(()) }).await.unwrap();
        let _ = fail(&breaker).await;
        assert!((breaker.error_rate() - 0.5).abs() < f64::EPSILON);
    }
}
