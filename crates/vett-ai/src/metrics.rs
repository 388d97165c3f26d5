use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::ModelUsage;

// Rough blended per-1k-token prices used only for the admin estimate.
const PROMPT_COST_PER_1K_USD: f64 = 0.000_15;
const COMPLETION_COST_PER_1K_USD: f64 = 0.000_6;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
/// Point-in-time view of the client metrics. Admin-only surface.
pub struct ModelMetricsSnapshot {
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub success_rate: f64,
    pub estimated_cost_usd: f64,
}

#[derive(Debug, Default)]
struct MetricsState {
    total_calls: u64,
    successes: u64,
    failures: u64,
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

/// Process-wide usage accounting for the model client.
#[derive(Debug, Default)]
pub struct ModelMetrics {
    state: Mutex<MetricsState>,
}

impl ModelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, task: &str, usage: ModelUsage) {
        if let Ok(mut state) = self.state.lock() {
            state.total_calls += 1;
            state.successes += 1;
            state.prompt_tokens += usage.prompt_tokens;
            state.completion_tokens += usage.completion_tokens;
            state.total_tokens += usage.total_tokens;
        }
        debug!(
            target: "vett::ai::usage",
            task,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "model call succeeded"
        );
    }

    pub fn record_failure(&self, task: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.total_calls += 1;
            state.failures += 1;
        }
        debug!(target: "vett::ai::usage", task, "model call failed");
    }

    pub fn snapshot(&self) -> ModelMetricsSnapshot {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return ModelMetricsSnapshot::default(),
        };
        let success_rate = if state.total_calls == 0 {
            0.0
        } else {
            state.successes as f64 / state.total_calls as f64
        };
        let estimated_cost_usd = (state.prompt_tokens as f64 / 1_000.0) * PROMPT_COST_PER_1K_USD
            + (state.completion_tokens as f64 / 1_000.0) * COMPLETION_COST_PER_1K_USD;
        ModelMetricsSnapshot {
            total_calls: state.total_calls,
            successes: state.successes,
            failures: state.failures,
            prompt_tokens: state.prompt_tokens,
            completion_tokens: state.completion_tokens,
            total_tokens: state.total_tokens,
            success_rate,
            estimated_cost_usd,
        }
    }
}
