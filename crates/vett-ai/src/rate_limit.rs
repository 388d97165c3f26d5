use async_trait::async_trait;

use vett_contract::UserTier;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Verdict of a pre-call rate-limit check.
pub enum RateLimitVerdict {
    Allow,
    Reject { reason: String },
}

#[async_trait]
/// Pre-call admission control. A rejection is final for this call; the
/// client must not retry locally.
pub trait RateLimiter: Send + Sync {
    async fn check(
        &self,
        model: &str,
        user_id: &str,
        tier: UserTier,
        estimated_tokens: u64,
    ) -> RateLimitVerdict;
}

/// Limiter that admits everything.
#[derive(Debug, Default)]
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn check(
        &self,
        _model: &str,
        _user_id: &str,
        _tier: UserTier,
        _estimated_tokens: u64,
    ) -> RateLimitVerdict {
        RateLimitVerdict::Allow
    }
}
