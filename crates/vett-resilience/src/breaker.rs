use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use vett_core::{current_unix_timestamp_ms, non_empty_env_var};

use crate::services;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Breaker lifecycle state.
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Thresholds for one breaker.
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub success_threshold: u32,
}

impl BreakerConfig {
    /// Per-service thresholds: vision trips faster and cools longer.
    /// `UNIFIED_BRAIN_FALLBACK_FAILURE_THRESHOLD` and
    /// `UNIFIED_BRAIN_FALLBACK_COOLDOWN_MS` override the defaults globally.
    pub fn for_service(service: &str) -> Self {
        let (mut failure_threshold, mut cooldown_ms) = match service {
            services::VISION_MODEL => (3, 90_000),
            _ => (5, 60_000),
        };
        if let Some(raw) = non_empty_env_var("UNIFIED_BRAIN_FALLBACK_FAILURE_THRESHOLD") {
            if let Ok(value) = raw.parse::<u32>() {
                failure_threshold = value.max(1);
            }
        }
        if let Some(raw) = non_empty_env_var("UNIFIED_BRAIN_FALLBACK_COOLDOWN_MS") {
            if let Ok(value) = raw.parse::<u64>() {
                cooldown_ms = value.max(1);
            }
        }
        Self { failure_threshold, cooldown_ms, success_threshold: 2 }
    }
}

#[derive(Debug)]
/// Consecutive-failure circuit breaker with half-open recovery.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    open_until_ms: u64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            open_until_ms: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a call may proceed. An OPEN breaker transitions to HALF_OPEN
    /// once the cooldown elapses.
    pub fn allow_at(&mut self, now_ms: u64) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if now_ms >= self.open_until_ms {
                    self.state = BreakerState::HalfOpen;
                    self.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a success; returns the new state.
    pub fn record_success(&mut self) -> BreakerState {
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.success_threshold {
                    self.state = BreakerState::Closed;
                    self.consecutive_failures = 0;
                }
            }
            BreakerState::Open => {}
        }
        self.state
    }

    /// Records a failure at `now_ms`; returns the new state.
    pub fn record_failure_at(&mut self, now_ms: u64) -> BreakerState {
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.state = BreakerState::Open;
                    self.open_until_ms = now_ms + self.config.cooldown_ms;
                }
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.open_until_ms = now_ms + self.config.cooldown_ms;
            }
            BreakerState::Open => {}
        }
        self.state
    }
}

/// Callback invoked on every breaker state transition.
pub type TransitionCallback = Arc<dyn Fn(&str, BreakerState) + Send + Sync>;

/// Process-wide breaker registry, one breaker per service key.
#[derive(Default)]
pub struct BreakerStore {
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    on_transition: Option<TransitionCallback>,
}

impl BreakerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transition_callback(mut self, callback: TransitionCallback) -> Self {
        self.on_transition = Some(callback);
        self
    }

    fn with_breaker<R>(&self, service: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let mut breakers = match self.breakers.lock() {
            Ok(breakers) => breakers,
            Err(poisoned) => poisoned.into_inner(),
        };
        let breaker = breakers
            .entry(service.to_string())
            .or_insert_with(|| CircuitBreaker::new(BreakerConfig::for_service(service)));
        f(breaker)
    }

    pub fn allow(&self, service: &str) -> bool {
        self.allow_at(service, current_unix_timestamp_ms())
    }

    pub fn allow_at(&self, service: &str, now_ms: u64) -> bool {
        let (allowed, state_before, state_after) = self.with_breaker(service, |breaker| {
            let before = breaker.state();
            let allowed = breaker.allow_at(now_ms);
            (allowed, before, breaker.state())
        });
        if state_before != state_after {
            info!(service, state = state_after.as_str(), "circuit breaker state change");
            self.publish(service, state_after);
        }
        allowed
    }

    pub fn record_success(&self, service: &str) {
        let (before, after) = self.with_breaker(service, |breaker| {
            let before = breaker.state();
            (before, breaker.record_success())
        });
        if before != after {
            info!(service, state = after.as_str(), "circuit breaker closed after recovery");
            self.publish(service, after);
        }
    }

    pub fn record_failure(&self, service: &str) {
        self.record_failure_at(service, current_unix_timestamp_ms());
    }

    pub fn record_failure_at(&self, service: &str, now_ms: u64) {
        let (before, after) = self.with_breaker(service, |breaker| {
            let before = breaker.state();
            (before, breaker.record_failure_at(now_ms))
        });
        if before != after {
            warn!(service, state = after.as_str(), "circuit breaker opened");
            self.publish(service, after);
        }
    }

    pub fn state(&self, service: &str) -> BreakerState {
        self.with_breaker(service, |breaker| breaker.state())
    }

    /// Manual reset: recreates the breaker from its service defaults.
    pub fn reset(&self, service: &str) {
        let mut breakers = match self.breakers.lock() {
            Ok(breakers) => breakers,
            Err(poisoned) => poisoned.into_inner(),
        };
        breakers.insert(
            service.to_string(),
            CircuitBreaker::new(BreakerConfig::for_service(service)),
        );
        info!(service, "circuit breaker manually reset");
    }

    fn publish(&self, service: &str, state: BreakerState) {
        if let Some(callback) = &self.on_transition {
            callback(service, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig { failure_threshold: 5, cooldown_ms: 60_000, success_threshold: 2 }
    }

    #[test]
    fn opens_at_exactly_five_consecutive_failures() {
        let mut breaker = CircuitBreaker::new(config());
        for _ in 0..4 {
            assert_eq!(breaker.record_failure_at(1_000), BreakerState::Closed);
        }
        assert_eq!(breaker.record_failure_at(1_000), BreakerState::Open);
        assert!(!breaker.allow_at(2_000));
    }

    #[test]
    fn half_opens_after_cooldown_and_closes_after_two_successes() {
        let mut breaker = CircuitBreaker::new(config());
        for _ in 0..5 {
            breaker.record_failure_at(1_000);
        }
        assert!(!breaker.allow_at(60_999));
        assert!(breaker.allow_at(61_000));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        assert_eq!(breaker.record_success(), BreakerState::HalfOpen);
        assert_eq!(breaker.record_success(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let mut breaker = CircuitBreaker::new(config());
        for _ in 0..5 {
            breaker.record_failure_at(1_000);
        }
        assert!(breaker.allow_at(61_000));
        assert_eq!(breaker.record_failure_at(61_001), BreakerState::Open);
        assert!(!breaker.allow_at(61_002));
    }

    #[test]
    fn success_resets_failure_streak() {
        let mut breaker = CircuitBreaker::new(config());
        for _ in 0..4 {
            breaker.record_failure_at(1_000);
        }
        breaker.record_success();
        for _ in 0..4 {
            assert_eq!(breaker.record_failure_at(1_000), BreakerState::Closed);
        }
    }

    #[test]
    fn store_reset_recreates_breaker() {
        let store = BreakerStore::new();
        for _ in 0..5 {
            store.record_failure_at("text-model", 1_000);
        }
        assert_eq!(store.state("text-model"), BreakerState::Open);
        store.reset("text-model");
        assert_eq!(store.state("text-model"), BreakerState::Closed);
        assert!(store.allow_at("text-model", 1_000));
    }

    #[test]
    fn store_publishes_transitions() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let transitions = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&transitions);
        let store = BreakerStore::new().with_transition_callback(Arc::new(move |_service, _state| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        for _ in 0..5 {
            store.record_failure_at("text-model", 1_000);
        }
        assert_eq!(transitions.load(Ordering::SeqCst), 1);
    }
}
