use std::fmt::Display;
use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::services;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// What to do when a service's primary path fails.
pub enum DegradationStrategy {
    /// Defer: surface a degraded error so the caller re-queues the work.
    Queue,
    /// Continue without the service's contribution.
    Skip,
    /// Use the alternate implementation.
    Fallback,
    /// The service has no degraded mode; fail.
    Disabled,
}

/// Static service → strategy mapping.
pub fn strategy_for_service(service: &str) -> DegradationStrategy {
    match service {
        services::TEXT_MODEL | services::VISION_MODEL => DegradationStrategy::Queue,
        services::VECTOR_INDEX => DegradationStrategy::Skip,
        services::OBJECT_STORE => DegradationStrategy::Fallback,
        _ => DegradationStrategy::Disabled,
    }
}

#[derive(Debug, Error)]
/// Failure from a degradation-wrapped call.
pub enum DegradationError<E: Display> {
    #[error("'{service}' degraded, work must be re-queued: {source}")]
    Queued { service: String, source: E },
    #[error("'{service}' is disabled under degradation: {source}")]
    Disabled { service: String, source: E },
    #[error("'{service}' failed and no skip value was provided: {source}")]
    NoSkipValue { service: String, source: E },
    #[error("'{service}' failed and no fallback was provided: {source}")]
    NoFallback { service: String, source: E },
}

/// Runs the primary path and, on failure, applies the mapped strategy
/// explicitly: queue, skip with a provided value, fall back, or fail.
pub async fn with_degradation<T, E, P, FB, FutB>(
    service: &str,
    primary: P,
    fallback: Option<FB>,
    skip_value: Option<T>,
) -> Result<T, DegradationError<E>>
where
    E: Display,
    P: Future<Output = Result<T, E>>,
    FB: FnOnce() -> FutB,
    FutB: Future<Output = T>,
{
    let error = match primary.await {
        Ok(value) => return Ok(value),
        Err(error) => error,
    };

    let strategy = strategy_for_service(service);
    warn!(service, strategy = ?strategy, error = %error, "primary path failed, degrading");
    match strategy {
        DegradationStrategy::Queue => {
            Err(DegradationError::Queued { service: service.to_string(), source: error })
        }
        DegradationStrategy::Skip => skip_value.ok_or(DegradationError::NoSkipValue {
            service: service.to_string(),
            source: error,
        }),
        DegradationStrategy::Fallback => match fallback {
            Some(fallback) => Ok(fallback().await),
            None => {
                Err(DegradationError::NoFallback { service: service.to_string(), source: error })
            }
        },
        DegradationStrategy::Disabled => {
            Err(DegradationError::Disabled { service: service.to_string(), source: error })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_mapping_matches_policy() {
        assert_eq!(strategy_for_service("text-model"), DegradationStrategy::Queue);
        assert_eq!(strategy_for_service("vision-model"), DegradationStrategy::Queue);
        assert_eq!(strategy_for_service("vector-index"), DegradationStrategy::Skip);
        assert_eq!(strategy_for_service("object-store"), DegradationStrategy::Fallback);
        assert_eq!(strategy_for_service("anything-else"), DegradationStrategy::Disabled);
    }

    #[tokio::test]
    async fn queue_strategy_surfaces_degraded_error() {
        let result: Result<u32, _> = with_degradation(
            "text-model",
            async { Err::<u32, String>("down".to_string()) },
            None::<fn() -> std::future::Ready<u32>>,
            None,
        )
        .await;
        assert!(matches!(result, Err(DegradationError::Queued { .. })));
    }

    #[tokio::test]
    async fn skip_strategy_returns_skip_value() {
        let result = with_degradation(
            "vector-index",
            async { Err::<u32, String>("down".to_string()) },
            None::<fn() -> std::future::Ready<u32>>,
            Some(0_u32),
        )
        .await;
        assert_eq!(result.unwrap(), 0);
    }

    #[tokio::test]
    async fn fallback_strategy_invokes_alternate() {
        let result = with_degradation(
            "object-store",
            async { Err::<&str, String>("down".to_string()) },
            Some(|| async { "alt-store" }),
            None,
        )
        .await;
        assert_eq!(result.unwrap(), "alt-store");
    }

    #[tokio::test]
    async fn primary_success_bypasses_strategy() {
        let result: Result<u32, DegradationError<String>> = with_degradation(
            "unknown-service",
            async { Ok::<u32, String>(5) },
            None::<fn() -> std::future::Ready<u32>>,
            None,
        )
        .await;
        assert_eq!(result.unwrap(), 5);
    }
}
