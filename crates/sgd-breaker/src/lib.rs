// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-named-dependency circuit breaker.
//!
//! A breaker wraps any fallible async callable and transitions through
//! `closed -> open -> half_open -> closed` based on consecutive failures and
//! a sliding failure-rate window. Callers declare, per call, which error
//! values are "excluded" (never count toward tripping the breaker) — this
//! keeps e.g. client validation errors from suppressing an otherwise-healthy
//! dependency.
//!
//! # Examples
//!
//! ```
//! use sgd_breaker::{BreakerConfig, CircuitBreaker};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let breaker = CircuitBreaker::new("provider:planner", BreakerConfig::default());
//! let result: i32 = breaker
//!     .call(|| async { Ok::<_, String>(42) }, |_e: &String| true)
//!     .await
//!     .unwrap();
//! assert_eq!(result, 42);
//! # });
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Tunables for one breaker instance. Defaults match the documented
/// behavior: 5 consecutive failures (or a 50% failure rate over a 100-call
/// window with at least 10 calls observed) opens the breaker; it probes
/// again after 60s; 2 consecutive successes in `half_open` closes it.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
    pub failure_rate_threshold: f64,
    pub min_calls: usize,
    pub window_size: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            failure_rate_threshold: 0.5,
            min_calls: 10,
            window_size: 100,
        }
    }
}

/// A recorded state transition, kept for diagnostics/audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

struct Inner {
    state: BreakerState,
    consec_fail: u32,
    consec_succ: u32,
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    transitions: Vec<Transition>,
}

impl Inner {
    fn new() -> Self {
        Inner {
            state: BreakerState::Closed,
            consec_fail: 0,
            consec_succ: 0,
            window: VecDeque::new(),
            opened_at: None,
            transitions: Vec::new(),
        }
    }

    fn record_window(&mut self, window_size: usize, ok: bool) {
        self.window.push_back(ok);
        while self.window.len() > window_size {
            self.window.pop_front();
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }

    fn transition_to(&mut self, to: BreakerState, reason: &str) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        if to == BreakerState::Open {
            self.opened_at = Some(Instant::now());
        }
        if to == BreakerState::HalfOpen {
            self.consec_succ = 0;
        }
        tracing::warn!(?from, ?to, reason, "circuit breaker state transition");
        self.transitions.push(Transition {
            from,
            to,
            at: Utc::now(),
            reason: reason.to_string(),
        });
    }
}

/// Error returned by [`CircuitBreaker::call`]: either the breaker rejected
/// the call outright (`Open`), or the wrapped callable itself failed.
#[derive(Debug)]
pub enum BreakerError<E> {
    Open { name: String },
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerError::Open { name } => write!(f, "circuit breaker '{name}' is open"),
            BreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        CircuitBreaker {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker mutex poisoned").state
    }

    pub fn transitions(&self) -> Vec<Transition> {
        self.inner.lock().expect("breaker mutex poisoned").transitions.clone()
    }

    /// Attempt the `open -> half_open` transition if `reset_timeout` has
    /// elapsed, without invoking anything. Called implicitly by `call`;
    /// exposed directly for callers that drive success/failure bookkeeping
    /// through [`Self::note_success`]/[`Self::note_failure`] instead of
    /// `call` (e.g. a cache whose get/set are separate awaits, not one
    /// atomic callable) and still need the timeout-driven probe to fire.
    pub fn probe_if_ready(&self) {
        self.maybe_probe();
    }

    fn maybe_probe(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        if inner.state == BreakerState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.config.reset_timeout
        {
            inner.transition_to(BreakerState::HalfOpen, "reset_timeout elapsed");
        }
    }

    /// Invoke `f` through the breaker. `is_excluded` marks error values that
    /// must never count as a breaker failure (e.g. client-side validation).
    pub async fn call<F, Fut, T, E>(
        &self,
        f: F,
        is_excluded: impl Fn(&E) -> bool,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.maybe_probe();

        if self.state() == BreakerState::Open {
            return Err(BreakerError::Open {
                name: self.name.clone(),
            });
        }

        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                if !is_excluded(&e) {
                    self.on_failure();
                }
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Record a success without going through [`Self::call`] — for callers
    /// (like the cache layer) whose backend interaction is not a single
    /// atomic callable but still needs to feed this breaker's bookkeeping.
    pub fn note_success(&self) {
        self.on_success();
    }

    /// Record a failure without going through [`Self::call`]. See
    /// [`Self::note_success`].
    pub fn note_failure(&self) {
        self.on_failure();
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.consec_fail = 0;
        inner.record_window(self.config.window_size, true);
        match inner.state {
            BreakerState::HalfOpen => {
                inner.consec_succ += 1;
                if inner.consec_succ >= self.config.success_threshold {
                    inner.transition_to(BreakerState::Closed, "success_threshold reached");
                }
            }
            BreakerState::Closed => {}
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.record_window(self.config.window_size, false);
        match inner.state {
            BreakerState::HalfOpen => {
                inner.transition_to(BreakerState::Open, "failure while half_open");
            }
            BreakerState::Closed => {
                inner.consec_fail += 1;
                let rate_trip = inner.window.len() >= self.config.min_calls
                    && inner.failure_rate() >= self.config.failure_rate_threshold;
                if inner.consec_fail >= self.config.failure_threshold || rate_trip {
                    let reason = if rate_trip {
                        "failure_rate_threshold reached"
                    } else {
                        "failure_threshold reached"
                    };
                    inner.transition_to(BreakerState::Open, reason);
                }
            }
            BreakerState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(20),
            failure_rate_threshold: 0.5,
            min_calls: 10,
            window_size: 20,
        }
    }

    async fn fail() -> Result<(), String> {
        Err("boom".to_string())
    }

    async fn ok() -> Result<(), String> {
        Ok(())
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        for _ in 0..3 {
            let _ = breaker.call(fail, |_| false).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn rejects_without_invoking_when_open() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        for _ in 0..3 {
            let _ = breaker.call(fail, |_| false).await;
        }
        let mut invoked = false;
        let result = breaker
            .call(
                || async {
                    invoked = true;
                    Ok::<_, String>(())
                },
                |_| false,
            )
            .await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert!(!invoked);
    }

    #[tokio::test]
    async fn half_open_after_reset_timeout_then_closes_on_successes() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        for _ in 0..3 {
            let _ = breaker.call(fail, |_| false).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;

        let _ = breaker.call(ok, |_| false).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        let _ = breaker.call(ok, |_| false).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn any_failure_in_half_open_reopens() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        for _ in 0..3 {
            let _ = breaker.call(fail, |_| false).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _ = breaker.call(fail, |_| false).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn excluded_errors_never_trip_the_breaker() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        for _ in 0..10 {
            let _ = breaker.call(fail, |_| true).await;
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn failure_rate_trips_even_below_consecutive_threshold() {
        let config = BreakerConfig {
            failure_threshold: 100,
            min_calls: 4,
            window_size: 4,
            failure_rate_threshold: 0.5,
            ..fast_config()
        };
        let breaker = CircuitBreaker::new("dep", config);
        let _ = breaker.call(ok, |_| false).await;
        let _ = breaker.call(fail, |_| false).await;
        let _ = breaker.call(ok, |_| false).await;
        let _ = breaker.call(fail, |_| false).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
