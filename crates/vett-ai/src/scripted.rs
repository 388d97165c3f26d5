//! Scripted model client used across the engine's test suites.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use vett_contract::ModelTask;

use crate::types::{ModelCall, ModelClient, ModelError, ModelReply, ModelUsage, VisionCall};

#[derive(Debug, Clone)]
/// One scripted outcome, consumed in FIFO order per task.
pub enum ScriptedReply {
    Json(Value),
    Text(String),
    Status(u16),
    RateLimited,
}

#[derive(Debug, Clone)]
/// Record of one call the scripted model served.
pub struct RecordedCall {
    pub task: ModelTask,
    pub prompt: String,
    pub is_vision: bool,
}

#[derive(Default)]
/// Deterministic [`ModelClient`] for tests: queue replies per task, inspect
/// the calls afterwards.
pub struct ScriptedModel {
    replies: Mutex<HashMap<ModelTask, VecDeque<ScriptedReply>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_reply(&self, task: ModelTask, reply: ScriptedReply) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.entry(task).or_default().push_back(reply);
        }
    }

    pub fn queue_json(&self, task: ModelTask, value: Value) {
        self.queue_reply(task, ScriptedReply::Json(value));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    pub fn vision_call_count(&self) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.iter().filter(|call| call.is_vision).count())
            .unwrap_or(0)
    }

    pub fn calls_for_task(&self, task: ModelTask) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.iter().filter(|call| call.task == task).count())
            .unwrap_or(0)
    }

    fn serve(&self, task: ModelTask, prompt: &str, is_vision: bool) -> Result<ModelReply, ModelError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall { task, prompt: prompt.to_string(), is_vision });
        }
        let reply = self
            .replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.get_mut(&task).and_then(|queue| queue.pop_front()));
        let usage = ModelUsage { prompt_tokens: 100, completion_tokens: 50, total_tokens: 150 };
        match reply {
            Some(ScriptedReply::Json(value)) => Ok(ModelReply {
                text: value.to_string(),
                json: Some(value),
                usage,
            }),
            Some(ScriptedReply::Text(text)) => Ok(ModelReply { text, json: None, usage }),
            Some(ScriptedReply::Status(status)) => {
                Err(ModelError::HttpStatus { status, body: String::new() })
            }
            Some(ScriptedReply::RateLimited) => {
                Err(ModelError::RateLimited { reason: "scripted".to_string() })
            }
            None => Ok(ModelReply { text: "{}".to_string(), json: Some(Value::Object(Default::default())), usage }),
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, call: ModelCall) -> Result<ModelReply, ModelError> {
        self.serve(call.task, &call.prompt, false)
    }

    async fn complete_with_vision(&self, call: VisionCall) -> Result<ModelReply, ModelError> {
        self.serve(call.task, &call.prompt, true)
    }
}
