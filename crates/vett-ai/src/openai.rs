use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, warn};

use vett_contract::UserTier;

use crate::config::ModelConfig;
use crate::metrics::ModelMetrics;
use crate::rate_limit::{RateLimitVerdict, RateLimiter};
use crate::retry::{is_retryable_http_error, retry_delay_ms, should_retry_status, MAX_MODEL_ATTEMPTS};
use crate::types::{ModelCall, ModelClient, ModelError, ModelReply, ModelUsage, VisionCall};

#[derive(Clone)]
/// OpenAI-compatible chat-completions client for text and vision tasks.
pub struct OpenAiModelClient {
    client: reqwest::Client,
    config: ModelConfig,
    metrics: Arc<ModelMetrics>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    user_id: Option<String>,
    tier: Option<UserTier>,
}

impl OpenAiModelClient {
    pub fn new(config: ModelConfig) -> Result<Self, ModelError> {
        if config.api_key.trim().is_empty() {
            return Err(ModelError::MissingApiKey);
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = format!("Bearer {}", config.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer)
                .map_err(|e| ModelError::InvalidResponse(format!("invalid API key header: {e}")))?,
        );
        if let Some(org) = &config.organization {
            headers.insert(
                "OpenAI-Organization",
                HeaderValue::from_str(org).map_err(|e| {
                    ModelError::InvalidResponse(format!("invalid organization header: {e}"))
                })?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()?;

        Ok(Self {
            client,
            config,
            metrics: Arc::new(ModelMetrics::new()),
            rate_limiter: None,
            user_id: None,
            tier: None,
        })
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Binds the caller identity used by the rate limiter for this handle.
    pub fn with_user(mut self, user_id: impl Into<String>, tier: UserTier) -> Self {
        self.user_id = Some(user_id.into());
        self.tier = Some(tier);
        self
    }

    pub fn metrics(&self) -> Arc<ModelMetrics> {
        Arc::clone(&self.metrics)
    }

    fn chat_completions_url(&self, base: &str) -> String {
        let base = base.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            return base.to_string();
        }
        format!("{base}/chat/completions")
    }

    async fn admit(&self, model: &str, estimated_tokens: u64) -> Result<(), ModelError> {
        let Some(limiter) = &self.rate_limiter else {
            return Ok(());
        };
        let user_id = self.user_id.as_deref().unwrap_or("anonymous");
        let tier = self.tier.unwrap_or(UserTier::Guest);
        match limiter.check(model, user_id, tier, estimated_tokens).await {
            RateLimitVerdict::Allow => Ok(()),
            RateLimitVerdict::Reject { reason } => {
                warn!(target: "vett::ai", model, user_id, %reason, "rate limiter rejected call");
                Err(ModelError::RateLimited { reason })
            }
        }
    }

    async fn send_chat(
        &self,
        url: &str,
        body: Value,
        task: &str,
        expect_json: bool,
    ) -> Result<ModelReply, ModelError> {
        let mut last_failure = String::new();
        for attempt in 0..MAX_MODEL_ATTEMPTS {
            if attempt > 0 {
                let delay = retry_delay_ms(attempt - 1);
                debug!(target: "vett::ai", task, attempt, delay_ms = delay, "retrying model call");
                sleep(std::time::Duration::from_millis(delay)).await;
            }

            let response = match self.client.post(url).json(&body).send().await {
                Ok(response) => response,
                Err(error) => {
                    if is_retryable_http_error(&error) && attempt + 1 < MAX_MODEL_ATTEMPTS {
                        last_failure = error.to_string();
                        continue;
                    }
                    self.metrics.record_failure(task);
                    return Err(ModelError::Http(error));
                }
            };

            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            if !(200..300).contains(&status) {
                if should_retry_status(status) && attempt + 1 < MAX_MODEL_ATTEMPTS {
                    last_failure = format!("status {status}");
                    continue;
                }
                self.metrics.record_failure(task);
                return Err(ModelError::HttpStatus { status, body: text });
            }

            let parsed: Value = serde_json::from_str(&text)?;
            let content = parsed["choices"][0]["message"]["content"]
                .as_str()
                .ok_or_else(|| {
                    ModelError::InvalidResponse("reply missing choices[0].message.content".into())
                })?
                .to_string();
            let usage = ModelUsage {
                prompt_tokens: parsed["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
                completion_tokens: parsed["usage"]["completion_tokens"].as_u64().unwrap_or(0),
                total_tokens: parsed["usage"]["total_tokens"].as_u64().unwrap_or(0),
            };
            if self.config.debug_llm {
                debug!(target: "vett::ai", task, reply = %content, "model reply");
            }
            self.metrics.record_success(task, usage);
            let json_reply = if expect_json { serde_json::from_str(&content).ok() } else { None };
            return Ok(ModelReply { text: content, json: json_reply, usage });
        }

        self.metrics.record_failure(task);
        Err(ModelError::AttemptsExhausted { attempts: MAX_MODEL_ATTEMPTS, last: last_failure })
    }
}

fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

#[async_trait]
impl ModelClient for OpenAiModelClient {
    async fn complete(&self, call: ModelCall) -> Result<ModelReply, ModelError> {
        self.admit(&self.config.model, estimate_tokens(&call.prompt) + estimate_tokens(&call.system))
            .await?;
        if self.config.debug_llm {
            debug!(target: "vett::ai", task = call.task.as_str(), prompt = %call.prompt, "model call");
        }
        let mut body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": call.system },
                { "role": "user", "content": call.prompt },
            ],
            "temperature": call.temperature.unwrap_or(self.config.temperature),
            "max_tokens": call.max_tokens.unwrap_or(self.config.max_tokens),
        });
        if call.expect_json {
            body["response_format"] = json!({ "type": "json_object" });
        }
        let url = self.chat_completions_url(&self.config.api_base);
        self.send_chat(&url, body, call.task.as_str(), call.expect_json).await
    }

    async fn complete_with_vision(&self, call: VisionCall) -> Result<ModelReply, ModelError> {
        self.admit(&self.config.vision_model, estimate_tokens(&call.prompt) + 1_000).await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&call.image_png);
        let data_url = format!("data:image/png;base64,{encoded}");
        let mut body = json!({
            "model": self.config.vision_model,
            "messages": [
                { "role": "system", "content": call.system },
                { "role": "user", "content": [
                    { "type": "text", "text": call.prompt },
                    { "type": "image_url", "image_url": { "url": data_url, "detail": "high" } },
                ] },
            ],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });
        if call.expect_json {
            body["response_format"] = json!({ "type": "json_object" });
        }
        let base = self.config.vision_endpoint.as_deref().unwrap_or(&self.config.api_base);
        let url = self.chat_completions_url(base);
        self.send_chat(&url, body, call.task.as_str(), call.expect_json).await
    }
}
