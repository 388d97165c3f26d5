use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use vett_ai::{ModelCall, ModelClient, ModelError};
use vett_budget::{budget_for_task, build_bounded_prompt, limit_history, PromptContext, TokenBudgetError};
use vett_contract::{
    AlternativeSelector, ModelTask, PlannedAction, SelectorStrategy, VisionContext,
};

use crate::learned::{component_hash, LearnedActionStore};

/// Minimum reliability for a learned action to short-circuit planning.
pub const RELIABILITY_THRESHOLD: f64 = 0.75;

/// History entries included in a planning prompt.
const HISTORY_WINDOW: usize = 5;
/// Alternative selectors requested per healing attempt.
const MAX_ALTERNATIVES: usize = 5;

#[derive(Debug, Error)]
/// Planning failures.
pub enum ActionError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("planner reply was not a usable action after {attempts} attempts")]
    UnusablePlan { attempts: usize },
    #[error(transparent)]
    PromptBudget(#[from] TokenBudgetError),
}

#[derive(Debug, Clone, Default)]
/// Per-run context threaded into planning prompts.
pub struct GenerationTracking {
    pub project_id: Option<String>,
    pub visited_urls: Vec<String>,
    pub attempted_selectors: Vec<String>,
    pub browser_quirks: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
/// Structured plan parsed from natural-language instructions.
pub struct InstructionPlan {
    pub primary_goal: String,
    pub specific_actions: Vec<String>,
    pub elements_to_check: Vec<String>,
    pub expected_outcomes: Vec<String>,
    pub priority: String,
    pub from_fallback: bool,
}

/// Generates the next action for a run: heuristic lookup first, then a
/// bounded LLM plan.
pub struct ActionGenerator {
    model: Arc<dyn ModelClient>,
    learned: Option<Arc<dyn LearnedActionStore>>,
}

impl ActionGenerator {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model, learned: None }
    }

    pub fn with_learned_store(mut self, store: Arc<dyn LearnedActionStore>) -> Self {
        self.learned = Some(store);
        self
    }

    /// Returns the single next action for the page.
    pub async fn generate_action(
        &self,
        context: &VisionContext,
        history: &[String],
        goal: &str,
        tracking: &GenerationTracking,
    ) -> Result<PlannedAction, ActionError> {
        if let Some(learned) = self.lookup_learned(context, tracking).await {
            return Ok(learned);
        }
        self.plan_with_model(context, history, goal, tracking).await
    }

    async fn lookup_learned(
        &self,
        context: &VisionContext,
        tracking: &GenerationTracking,
    ) -> Option<PlannedAction> {
        let store = self.learned.as_ref()?;
        let project_id = tracking.project_id.as_deref()?;
        let first = context
            .visible_elements()
            .into_iter()
            .find(|element| !element.is_hidden)?;
        let hash = component_hash(&context.url, &first.selector);
        let learned = store.lookup(project_id, &hash).await?;
        if learned.reliability < RELIABILITY_THRESHOLD {
            debug!(
                hash,
                reliability = learned.reliability,
                "learned action below reliability threshold"
            );
            return None;
        }
        debug!(hash, reliability = learned.reliability, "reusing learned action");
        let store = Arc::clone(store);
        let project = project_id.to_string();
        tokio::spawn(async move {
            store.record_reuse(&project, &hash).await;
        });
        Some(learned.action)
    }

    async fn plan_with_model(
        &self,
        context: &VisionContext,
        history: &[String],
        goal: &str,
        tracking: &GenerationTracking,
    ) -> Result<PlannedAction, ActionError> {
        let mut elements = String::new();
        for element in context.visible_elements() {
            elements.push_str(&format!(
                "- {} \"{}\" selector={}\n",
                element.element_type, element.text, element.selector
            ));
        }
        if !tracking.visited_urls.is_empty() {
            elements.push_str(&format!("\nVisited URLs: {}\n", tracking.visited_urls.join(", ")));
        }
        if !tracking.attempted_selectors.is_empty() {
            elements.push_str(&format!(
                "Already attempted selectors: {}\n",
                tracking.attempted_selectors.join(", ")
            ));
        }
        if let Some(quirks) = &tracking.browser_quirks {
            elements.push_str(&format!("Browser quirks: {quirks}\n"));
        }

        let prompt_ctx = PromptContext {
            goal: goal.to_string(),
            elements,
            history: limit_history(history, HISTORY_WINDOW),
            dom: String::new(),
        };
        let base = "Choose the single next test action for this page. Reply as JSON: \
                    {\"action\": \"click|type|scroll|navigate|wait|assert|complete\", \
                    \"selector\": string?, \"value\": string?, \"description\": string, \
                    \"confidence\": number}.";
        let prompt =
            build_bounded_prompt(base, &prompt_ctx, budget_for_task(ModelTask::ActionGeneration))?;

        for attempt in 0..2 {
            let reply = self
                .model
                .complete(
                    ModelCall::new(prompt.clone(), planner_system(), ModelTask::ActionGeneration)
                        .expecting_json(),
                )
                .await?;
            if let Some(json) = reply.json {
                match PlannedAction::from_model_json(&json) {
                    Ok(planned) => return Ok(planned),
                    Err(error) => {
                        warn!(attempt, %error, "planner emitted an invalid action");
                    }
                }
            }
        }
        Err(ActionError::UnusablePlan { attempts: 2 })
    }

    /// Parses free-form test instructions into a structured plan.
    pub async fn parse_test_instructions(
        &self,
        instructions: &str,
        url: Option<&str>,
    ) -> Result<InstructionPlan, ActionError> {
        let base = "Parse these web-test instructions. Reply as JSON: \
                    {\"primary_goal\": string, \"specific_actions\": [string], \
                    \"elements_to_check\": [string], \"expected_outcomes\": [string], \
                    \"priority\": \"high|medium|low\"}.";
        let prompt_ctx = PromptContext {
            goal: format!(
                "Instructions: {instructions}\nTarget: {}",
                url.unwrap_or("(unspecified)")
            ),
            elements: String::new(),
            history: Vec::new(),
            dom: String::new(),
        };
        let prompt = build_bounded_prompt(base, &prompt_ctx, budget_for_task(ModelTask::Planning))?;

        for _ in 0..2 {
            let reply = self
                .model
                .complete(
                    ModelCall::new(prompt.clone(), planner_system(), ModelTask::Planning)
                        .expecting_json(),
                )
                .await?;
            if let Some(json) = reply.json {
                return Ok(InstructionPlan {
                    primary_goal: json
                        .get("primary_goal")
                        .and_then(Value::as_str)
                        .unwrap_or(instructions)
                        .to_string(),
                    specific_actions: string_list(&json, "specific_actions"),
                    elements_to_check: string_list(&json, "elements_to_check"),
                    expected_outcomes: string_list(&json, "expected_outcomes"),
                    priority: json
                        .get("priority")
                        .and_then(Value::as_str)
                        .unwrap_or("medium")
                        .to_string(),
                    from_fallback: false,
                });
            }
        }
        Ok(InstructionPlan {
            primary_goal: instructions.to_string(),
            specific_actions: Vec::new(),
            elements_to_check: Vec::new(),
            expected_outcomes: Vec::new(),
            priority: "medium".to_string(),
            from_fallback: true,
        })
    }

    /// Asks for up to five alternative selectors for a failed target,
    /// ordered by confidence.
    pub async fn find_alternative_selector(
        &self,
        failed_selector: &str,
        dom: &str,
        error: &str,
        target_text: Option<&str>,
    ) -> Result<Vec<AlternativeSelector>, ActionError> {
        let base = "A selector failed during a web test. Suggest up to 5 alternative selectors, \
                    best first. Reply as JSON: {\"alternatives\": [{\"selector\": string, \
                    \"strategy\": \"text|attribute|position|role\", \"confidence\": number}]}.";
        let prompt_ctx = PromptContext {
            goal: format!(
                "Failed selector: {failed_selector}\nError: {error}\nTarget text: {}",
                target_text.unwrap_or("(unknown)")
            ),
            elements: String::new(),
            history: Vec::new(),
            dom: dom.to_string(),
        };
        let prompt = build_bounded_prompt(base, &prompt_ctx, budget_for_task(ModelTask::Healing))?;

        let reply = self
            .model
            .complete(
                ModelCall::new(prompt, healer_system(), ModelTask::Healing).expecting_json(),
            )
            .await?;
        let Some(json) = reply.json else {
            return Ok(Vec::new());
        };
        let mut alternatives: Vec<AlternativeSelector> = json
            .get("alternatives")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let selector =
                            entry.get("selector").and_then(Value::as_str)?.trim().to_string();
                        if selector.is_empty() || selector == failed_selector {
                            return None;
                        }
                        Some(AlternativeSelector {
                            selector,
                            strategy: entry
                                .get("strategy")
                                .and_then(Value::as_str)
                                .and_then(SelectorStrategy::parse)
                                .unwrap_or(SelectorStrategy::Attribute),
                            confidence: entry
                                .get("confidence")
                                .and_then(Value::as_f64)
                                .unwrap_or(0.5)
                                .clamp(0.0, 1.0),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        alternatives
            .sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
        alternatives.truncate(MAX_ALTERNATIVES);
        Ok(alternatives)
    }
}

fn planner_system() -> String {
    "You plan actions for an autonomous web-UI test runner. Hard rules: \
     do not emit wait or complete unless nothing else is useful; prefer interacting with \
     visible elements; selectors must use locator syntax exactly as listed; never repeat a \
     selector that was already attempted. Reply with JSON only."
        .to_string()
}

fn healer_system() -> String {
    "You repair failing selectors for a web-UI test runner. Reply with JSON only.".to_string()
}

fn string_list(json: &Value, key: &str) -> Vec<String> {
    json.get(key)
        .and_then(Value::as_array)
        .map(|entries| entries.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vett_ai::scripted::{ScriptedModel, ScriptedReply};
    use vett_contract::{AccessibilitySummary, Action, InteractiveElement};

    use crate::learned::{LearnedAction, MemoryLearnedActionStore};

    fn context() -> VisionContext {
        VisionContext {
            url: "https://shop.example.com/cart".to_string(),
            elements: vec![InteractiveElement {
                element_type: "button".into(),
                role: "button".into(),
                text: "Buy now".into(),
                aria_label: None,
                name: None,
                selector: "#buy".into(),
                bounds: None,
                is_hidden: false,
                is_required: false,
                href: None,
                vision_visible: None,
                vision_interactable: None,
            }],
            accessibility: AccessibilitySummary::default(),
            total_elements_found: 1,
            vision_validated: false,
            captured_unix_ms: 0,
        }
    }

    #[tokio::test]
    async fn llm_plan_parses_into_action_adt() {
        let model = Arc::new(ScriptedModel::new());
        model.queue_json(
            ModelTask::ActionGeneration,
            json!({ "action": "click", "selector": "#buy", "description": "buy", "confidence": 0.9 }),
        );
        let generator = ActionGenerator::new(model);
        let planned = generator
            .generate_action(&context(), &[], "complete a purchase", &GenerationTracking::default())
            .await
            .expect("action");
        assert_eq!(planned.action, Action::Click { selector: "#buy".into() });
    }

    #[tokio::test]
    async fn learned_action_short_circuits_model() {
        let model = Arc::new(ScriptedModel::new());
        let store = Arc::new(MemoryLearnedActionStore::new());
        let hash = component_hash("https://shop.example.com/cart", "#buy");
        store.insert(
            "project-1",
            LearnedAction {
                component_hash: hash,
                action: PlannedAction::new(Action::Click { selector: "#buy".into() }, "learned", 0.95),
                reliability: 0.9,
                uses: 4,
            },
        );
        let generator = ActionGenerator::new(model.clone()).with_learned_store(store.clone());
        let tracking = GenerationTracking {
            project_id: Some("project-1".to_string()),
            ..GenerationTracking::default()
        };
        let planned = generator
            .generate_action(&context(), &[], "buy", &tracking)
            .await
            .expect("action");
        assert_eq!(planned.description, "learned");
        assert_eq!(model.call_count(), 0);
        tokio::task::yield_now().await;
        assert_eq!(store.reuse_count(), 1);
    }

    #[tokio::test]
    async fn low_reliability_learned_action_is_ignored() {
        let model = Arc::new(ScriptedModel::new());
        model.queue_json(
            ModelTask::ActionGeneration,
            json!({ "action": "click", "selector": "#buy", "description": "fresh", "confidence": 0.8 }),
        );
        let store = Arc::new(MemoryLearnedActionStore::new());
        let hash = component_hash("https://shop.example.com/cart", "#buy");
        store.insert(
            "project-1",
            LearnedAction {
                component_hash: hash,
                action: PlannedAction::new(Action::Click { selector: "#old".into() }, "stale", 0.5),
                reliability: 0.4,
                uses: 2,
            },
        );
        let generator = ActionGenerator::new(model.clone()).with_learned_store(store);
        let tracking = GenerationTracking {
            project_id: Some("project-1".to_string()),
            ..GenerationTracking::default()
        };
        let planned = generator.generate_action(&context(), &[], "buy", &tracking).await.expect("action");
        assert_eq!(planned.description, "fresh");
        assert_eq!(model.calls_for_task(ModelTask::ActionGeneration), 1);
    }

    #[tokio::test]
    async fn unusable_plan_after_two_attempts_errors() {
        let model = Arc::new(ScriptedModel::new());
        model.queue_reply(ModelTask::ActionGeneration, ScriptedReply::Text("not json".into()));
        model.queue_json(ModelTask::ActionGeneration, json!({ "action": "click" }));
        let generator = ActionGenerator::new(model);
        let error = generator
            .generate_action(&context(), &[], "buy", &GenerationTracking::default())
            .await
            .unwrap_err();
        assert!(matches!(error, ActionError::UnusablePlan { attempts: 2 }));
    }

    #[tokio::test]
    async fn alternatives_are_sorted_capped_and_deduped() {
        let model = Arc::new(ScriptedModel::new());
        model.queue_json(
            ModelTask::Healing,
            json!({ "alternatives": [
                { "selector": "#buy", "strategy": "attribute", "confidence": 0.99 },
                { "selector": "text=Buy now", "strategy": "text", "confidence": 0.9 },
                { "selector": "[role=button]", "strategy": "role", "confidence": 0.95 },
            ]}),
        );
        let generator = ActionGenerator::new(model);
        let alternatives = generator
            .find_alternative_selector("#buy", "<html></html>", "not found", Some("Buy now"))
            .await
            .expect("alternatives");
        // The failed selector itself is dropped; remainder sorted by confidence.
        assert_eq!(alternatives.len(), 2);
        assert_eq!(alternatives[0].selector, "[role=button]");
        assert_eq!(alternatives[0].strategy, SelectorStrategy::Role);
        assert_eq!(alternatives[1].selector, "text=Buy now");
    }

    #[tokio::test]
    async fn instruction_parsing_falls_back_to_raw_goal() {
        let model = Arc::new(ScriptedModel::new());
        model.queue_reply(ModelTask::Planning, ScriptedReply::Text("??".into()));
        model.queue_reply(ModelTask::Planning, ScriptedReply::Text("??".into()));
        let generator = ActionGenerator::new(model);
        let plan = generator
            .parse_test_instructions("log in and check the dashboard", None)
            .await
            .expect("plan");
        assert!(plan.from_fallback);
        assert_eq!(plan.primary_goal, "log in and check the dashboard");
        assert_eq!(plan.priority, "medium");
    }
}
