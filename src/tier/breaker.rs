//! Circuit Breaker
//!
//! Protects each outbound tier call. After `failure_threshold` matching
//! failures the breaker opens and rejects calls immediately; once
//! `recovery_timeout` has elapsed the next call is allowed through
//! (implicit half-open) - success closes the breaker, failure re-opens
//! it and resets the timer.
//!
//! `failure_threshold = 0` is a fail-fast mode: the very first matching
//! failure surfaces as `breaker-open`.
//!
//! Breakers are per-repository and per-side (one for the memory tier,
//! one for the fallback tier). Only tier errors count as matching
//! failures; validation errors and not-found pass through untouched.

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Matching failures before the breaker opens. Zero fails fast.
    pub failure_threshold: u32,
    /// Time the breaker stays open before allowing a probe call.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

enum State {
    Closed { failures: u32 },
    Open { since: Instant },
}

/// Per-tier circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<State>,
    matches: fn(&Error) -> bool,
}

impl CircuitBreaker {
    /// Breaker counting tier errors, the default failure kind.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_matcher(name, config, Error::is_tier_error)
    }

    /// Breaker with a custom failure predicate.
    pub fn with_matcher(
        name: impl Into<String>,
        config: BreakerConfig,
        matches: fn(&Error) -> bool,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(State::Closed { failures: 0 }),
            matches,
        }
    }

    /// Breaker name, used in errors and logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, for observation only.
    pub fn state(&self) -> BreakerState {
        let state = self.state.lock();
        match &*state {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { since } => {
                if since.elapsed() >= self.config.recovery_timeout {
                    BreakerState::HalfOpen
                } else {
                    BreakerState::Open
                }
            }
        }
    }

    /// Run `op` under the breaker.
    ///
    /// Rejected immediately with `breaker-open` while open; otherwise
    /// the result is recorded and returned. When the threshold is zero,
    /// the failure that trips the breaker is itself surfaced as
    /// `breaker-open`.
    pub async fn call<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;

        match op.await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) if (self.matches)(&err) => {
                if self.on_failure() {
                    Err(Error::BreakerOpen {
                        name: self.name.clone(),
                    })
                } else {
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }

    fn check(&self) -> Result<()> {
        let state = self.state.lock();
        if let State::Open { since } = &*state {
            if since.elapsed() < self.config.recovery_timeout {
                return Err(Error::BreakerOpen {
                    name: self.name.clone(),
                });
            }
            // Recovery window elapsed: let the call probe (half-open).
            debug!(breaker = %self.name, "allowing half-open probe");
        }
        Ok(())
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        if matches!(&*state, State::Open { .. }) {
            warn!(breaker = %self.name, "circuit breaker closed after successful probe");
        }
        *state = State::Closed { failures: 0 };
    }

    /// Record a matching failure. Returns true when the caller should
    /// surface `breaker-open` instead of the underlying error.
    fn on_failure(&self) -> bool {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { failures } => {
                *failures += 1;
                let failures = *failures;
                if failures >= self.config.failure_threshold.max(1) {
                    warn!(
                        breaker = %self.name,
                        failures,
                        "circuit breaker opened"
                    );
                    *state = State::Open {
                        since: Instant::now(),
                    };
                    return self.config.failure_threshold == 0;
                }
                false
            }
            State::Open { since } => {
                // Half-open probe failed: re-open and reset the timer.
                warn!(breaker = %self.name, "circuit breaker re-opened after failed probe");
                *since = Instant::now();
                false
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
