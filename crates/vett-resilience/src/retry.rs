use std::fmt::Display;
use std::future::Future;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::breaker::BreakerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Exponential retry policy applied under a breaker.
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponent: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, initial_delay_ms: 1_000, max_delay_ms: 10_000, exponent: 2 }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), capped at the max.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let factor = (self.exponent as u64).saturating_pow(attempt.min(16));
        self.initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }
}

#[derive(Debug, Error)]
/// Failure of a resilient execution.
pub enum ResilienceError<E: Display> {
    #[error("circuit for '{service}' is open")]
    CircuitOpen { service: String },
    #[error("'{service}' failed after {attempts} attempts: {source}")]
    Exhausted { service: String, attempts: u32, source: E },
}

/// Composes retry-then-breaker around an async operation.
///
/// When the breaker is OPEN the `fallback` is used if present; otherwise the
/// open circuit surfaces as an error. Each failed attempt trips the breaker's
/// failure counter, so a streak across calls opens the circuit.
pub async fn execute_with_resilience<T, E, F, Fut, FB, FutB>(
    store: &BreakerStore,
    service: &str,
    policy: &RetryPolicy,
    mut operation: F,
    fallback: Option<FB>,
) -> Result<T, ResilienceError<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    FB: FnOnce() -> FutB,
    FutB: Future<Output = T>,
{
    if !store.allow(service) {
        warn!(service, "circuit open, call rejected");
        if let Some(fallback) = fallback {
            return Ok(fallback().await);
        }
        return Err(ResilienceError::CircuitOpen { service: service.to_string() });
    }

    let mut last_error: Option<E> = None;
    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            let delay = policy.delay_ms(attempt - 1);
            debug!(service, attempt, delay_ms = delay, "retrying under breaker");
            sleep(std::time::Duration::from_millis(delay)).await;
            if !store.allow(service) {
                break;
            }
        }
        match operation().await {
            Ok(value) => {
                store.record_success(service);
                return Ok(value);
            }
            Err(error) => {
                store.record_failure(service);
                last_error = Some(error);
            }
        }
    }

    match last_error {
        Some(source) => Err(ResilienceError::Exhausted {
            service: service.to_string(),
            attempts: policy.max_attempts,
            source,
        }),
        None => {
            if let Some(fallback) = fallback {
                return Ok(fallback().await);
            }
            Err(ResilienceError::CircuitOpen { service: service.to_string() })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::breaker::BreakerState;

    #[test]
    fn delay_schedule_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_ms(0), 1_000);
        assert_eq!(policy.delay_ms(1), 2_000);
        assert_eq!(policy.delay_ms(2), 4_000);
        assert_eq!(policy.delay_ms(5), 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let store = BreakerStore::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result: Result<u32, ResilienceError<String>> = execute_with_resilience(
            &store,
            "text-model",
            &RetryPolicy::default(),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok(7_u32)
                    }
                }
            },
            None::<fn() -> std::future::Ready<u32>>,
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(store.state("text-model"), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_counts_toward_breaker() {
        let store = BreakerStore::new();
        for _ in 0..2 {
            let result: Result<u32, ResilienceError<String>> = execute_with_resilience(
                &store,
                "text-model",
                &RetryPolicy::default(),
                || async { Err("boom".to_string()) },
                None::<fn() -> std::future::Ready<u32>>,
            )
            .await;
            assert!(matches!(result, Err(ResilienceError::Exhausted { attempts: 3, .. })));
        }
        // 6 consecutive failures recorded; threshold for text-model is 5.
        assert_eq!(store.state("text-model"), BreakerState::Open);

        let fallback_used: Result<u32, ResilienceError<String>> = execute_with_resilience(
            &store,
            "text-model",
            &RetryPolicy::default(),
            || async { Ok(1_u32) },
            Some(|| async { 99_u32 }),
        )
        .await;
        assert_eq!(fallback_used.unwrap(), 99);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_without_fallback_errors() {
        let store = BreakerStore::new();
        for _ in 0..5 {
            store.record_failure("vision-model");
        }
        let result: Result<u32, ResilienceError<String>> = execute_with_resilience(
            &store,
            "vision-model",
            &RetryPolicy::default(),
            || async { Ok(1_u32) },
            None::<fn() -> std::future::Ready<u32>>,
        )
        .await;
        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
    }
}
