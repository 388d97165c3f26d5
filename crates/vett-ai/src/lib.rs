//! Model client for the Vett engine.
//!
//! Wraps OpenAI-compatible text and vision providers behind the
//! [`ModelClient`] trait with a bounded retry envelope, pre-call rate-limit
//! checks, and admin-only usage metrics.

mod config;
mod metrics;
mod openai;
mod rate_limit;
mod retry;
pub mod scripted;
mod types;

pub use config::ModelConfig;
pub use metrics::{ModelMetrics, ModelMetricsSnapshot};
pub use openai::OpenAiModelClient;
pub use rate_limit::{NoopRateLimiter, RateLimitVerdict, RateLimiter};
pub use retry::{retry_delay_ms, should_retry_status, MAX_MODEL_ATTEMPTS};
pub use types::{ModelCall, ModelClient, ModelError, ModelReply, ModelUsage, VisionCall};
