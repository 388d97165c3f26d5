use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use vett_contract::ModelTask;

#[derive(Debug, Clone, PartialEq)]
/// One text-model invocation.
pub struct ModelCall {
    pub prompt: String,
    pub system: String,
    pub task: ModelTask,
    /// Request `response_format: json_object` and parse the reply.
    pub expect_json: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ModelCall {
    pub fn new(prompt: impl Into<String>, system: impl Into<String>, task: ModelTask) -> Self {
        Self {
            prompt: prompt.into(),
            system: system.into(),
            task,
            expect_json: false,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn expecting_json(mut self) -> Self {
        self.expect_json = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
/// One vision-model invocation over a PNG screenshot.
pub struct VisionCall {
    pub image_png: Vec<u8>,
    pub prompt: String,
    pub system: String,
    pub task: ModelTask,
    pub expect_json: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
/// Token usage reported by the provider.
pub struct ModelUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
/// Reply from a model call.
pub struct ModelReply {
    pub text: String,
    /// Present when JSON was expected and the reply parsed cleanly.
    pub json: Option<Value>,
    pub usage: ModelUsage,
}

#[derive(Debug, Error)]
/// Failures from the model client.
pub enum ModelError {
    #[error("missing API key")]
    MissingApiKey,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned non-success status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("rate limited: {reason}")]
    RateLimited { reason: String },
    #[error("model call exhausted {attempts} attempts: {last}")]
    AttemptsExhausted { attempts: usize, last: String },
}

impl ModelError {
    /// Permanent configuration failures that must not be retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::MissingApiKey | Self::HttpStatus { status: 400 | 401, .. }
        )
    }
}

#[async_trait]
/// Trait contract for text and vision model providers.
pub trait ModelClient: Send + Sync {
    async fn complete(&self, call: ModelCall) -> Result<ModelReply, ModelError>;
    async fn complete_with_vision(&self, call: VisionCall) -> Result<ModelReply, ModelError>;
}
