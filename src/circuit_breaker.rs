// ABOUTME: Per-dependency circuit breakers gating worker calls to failing dependencies
// ABOUTME: closed -> open on consecutive failures, half-open probe after cooldown
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tollgate Authors

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;

/// Minimum gap between "skipping call, breaker open" log lines per breaker
const SKIP_LOG_THROTTLE: Duration = Duration::from_secs(30);

/// Breaker state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Calls are skipped entirely until the cooldown elapses
    Open,
    /// Cooldown elapsed; a limited probe decides recovery or re-open
    HalfOpen,
}

impl BreakerState {
    /// Stable lowercase name for health reporting
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    last_skip_log: Option<Instant>,
}

/// Circuit breaker for one dependency
///
/// Interior mutability behind a `Mutex` so workers share one instance; the
/// critical sections are a few comparisons, never I/O.
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: &'static str,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker for one dependency
    #[must_use]
    pub fn new(dependency: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            dependency,
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                last_skip_log: None,
            }),
        }
    }

    /// Whether a call may be attempted right now
    ///
    /// An open breaker flips itself half-open once the cooldown has elapsed,
    /// admitting probe traffic. A skipped call is logged at a throttled rate
    /// and must be treated by the caller as a transient failure, never a
    /// permanent one.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_some_and(|t| t.elapsed() >= self.config.cooldown);
                if cooled_down {
                    info!(dependency = self.dependency, "Circuit breaker half-open");
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_successes = 0;
                    true
                } else {
                    let should_log = inner
                        .last_skip_log
                        .is_none_or(|t| t.elapsed() >= SKIP_LOG_THROTTLE);
                    if should_log {
                        inner.last_skip_log = Some(Instant::now());
                        warn!(
                            dependency = self.dependency,
                            "Circuit breaker open, skipping call"
                        );
                    }
                    false
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.consecutive_failures = 0;

        if inner.state == BreakerState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                info!(dependency = self.dependency, "Circuit breaker closed");
                inner.state = BreakerState::Closed;
                inner.opened_at = None;
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.consecutive_successes = 0;

        match inner.state {
            BreakerState::HalfOpen => {
                // One failure during probing re-opens immediately
                warn!(dependency = self.dependency, "Circuit breaker re-opened");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_failures = 0;
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        dependency = self.dependency,
                        failures = inner.consecutive_failures,
                        "Circuit breaker opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Current state, for health reporting
    pub fn state(&self) -> BreakerState {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .state
    }
}

/// Registry of breakers, one per external dependency
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: HashMap<&'static str, CircuitBreaker>,
}

impl BreakerRegistry {
    /// Build a registry with one breaker per named dependency
    #[must_use]
    pub fn new(config: &CircuitBreakerConfig, dependencies: &[&'static str]) -> Self {
        let breakers = dependencies
            .iter()
            .map(|name| (*name, CircuitBreaker::new(name, config.clone())))
            .collect();
        Self { breakers }
    }

    /// Breaker for a dependency; panics on an unregistered name, which is a
    /// wiring bug caught by every test that touches the registry
    #[must_use]
    pub fn get(&self, dependency: &'static str) -> &CircuitBreaker {
        self.breakers.get(dependency).unwrap_or_else(|| {
            // Safe: dependency names are compile-time constants and the
            // registry is built once from the full list at startup; a miss
            // cannot occur at runtime, only from a new call site wired
            // against a name missing from ServerResources::new
            panic!("No circuit breaker registered for {dependency}")
        })
    }

    /// Snapshot of every breaker's state, for health reporting
    pub fn states(&self) -> impl Iterator<Item = (&'static str, BreakerState)> + '_ {
        self.breakers
            .iter()
            .map(|(name, breaker)| (*name, breaker.state()))
    }
}
