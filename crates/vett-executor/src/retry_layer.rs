//! The intelligent retry layer (IRL): per-action retries with vision-guided
//! target repair and LLM alternative selectors.
//!
//! Only click/type/assert actions are eligible, and the layer is forbidden
//! during preflight and in the cookie-consent action context.

use std::sync::Arc;

use tracing::{debug, info, warn};

use vett_actions::ActionGenerator;
use vett_browser::{BrowserError, BrowserSession};
use vett_contract::{
    Action, ActionContext, HealingKind, HealingRecord, InvariantViolation, PlannedAction,
    VisionContext,
};
use vett_preflight::StatusRegistry;

#[derive(Debug, Clone, Copy)]
/// Tunables for one retry run.
pub struct RetryOptions {
    pub max_retries: u32,
    pub vision_matching: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self { max_retries: 3, vision_matching: true }
    }
}

#[derive(Debug, Clone)]
/// What happened across the retry attempts.
pub struct RetryOutcome {
    pub success: bool,
    pub attempts: u32,
    pub healing: Option<HealingRecord>,
    pub alternative_action: Option<PlannedAction>,
    pub final_error: Option<String>,
}

/// Wraps single-action execution with self-healing retries.
pub struct IntelligentRetryLayer {
    generator: Arc<ActionGenerator>,
}

impl IntelligentRetryLayer {
    pub fn new(generator: Arc<ActionGenerator>) -> Self {
        Self { generator }
    }

    /// Executes one action with up to `max_retries` attempts, repairing the
    /// target between failures. Vision-guided repair is tried first, then
    /// LLM alternative selectors.
    pub async fn execute_with_retry(
        &self,
        session: &dyn BrowserSession,
        planned: &PlannedAction,
        context: &VisionContext,
        registry: &StatusRegistry,
        run_id: &str,
        options: &RetryOptions,
        action_ctx: ActionContext,
    ) -> Result<RetryOutcome, InvariantViolation> {
        registry.assert_no_irl_during_preflight(run_id, "retry_layer")?;
        if action_ctx == ActionContext::CookieConsent {
            return Err(InvariantViolation::new(
                run_id,
                "retry_layer",
                "retry layer invoked in cookie-consent context",
                registry.cookie_status(run_id),
                registry.preflight_status(run_id),
            ));
        }

        let original_selector = planned.action.selector().unwrap_or_default().to_string();
        let mut current = planned.action.clone();
        let mut attempts = 0u32;
        let mut last_error: Option<BrowserError> = None;
        let mut healing_kind: Option<HealingKind> = None;
        let mut pending_alternatives: Vec<String> = Vec::new();
        let mut vision_repair_used = false;

        while attempts < options.max_retries {
            attempts += 1;
            match perform(session, &current).await {
                Ok(()) => {
                    let healed = healing_kind.map(|kind| HealingRecord {
                        kind,
                        original_selector: original_selector.clone(),
                        healed_selector: current.selector().unwrap_or_default().to_string(),
                        attempts,
                    });
                    if healed.is_some() {
                        info!(run_id, attempts, "action healed and succeeded");
                    }
                    return Ok(RetryOutcome {
                        success: true,
                        attempts,
                        alternative_action: healing_kind.map(|_| PlannedAction::new(
                            current.clone(),
                            planned.description.clone(),
                            planned.confidence,
                        )),
                        healing: healed,
                        final_error: None,
                    });
                }
                Err(error) => {
                    debug!(run_id, attempt = attempts, %error, "action attempt failed");
                    last_error = Some(error);
                }
            }
            if attempts >= options.max_retries {
                break;
            }

            // Repair the target for the next attempt.
            if pending_alternatives.is_empty() {
                if options.vision_matching && !vision_repair_used {
                    vision_repair_used = true;
                    if let Some(selector) =
                        vision_repair_target(context, &original_selector, &planned.description)
                    {
                        healing_kind = Some(HealingKind::VisionMatch);
                        current = with_selector(&planned.action, &selector);
                        continue;
                    }
                }
                pending_alternatives =
                    self.fetch_alternatives(session, &original_selector, &last_error, planned).await;
            }
            match pending_alternatives.first().cloned() {
                Some(selector) => {
                    pending_alternatives.remove(0);
                    healing_kind = Some(HealingKind::AlternativeSelector);
                    current = with_selector(&planned.action, &selector);
                }
                None => break,
            }
        }

        let final_error = last_error.map(|error| error.to_string());
        warn!(run_id, attempts, error = ?final_error, "retry layer exhausted");
        Ok(RetryOutcome {
            success: false,
            attempts,
            healing: None,
            alternative_action: None,
            final_error,
        })
    }

    async fn fetch_alternatives(
        &self,
        session: &dyn BrowserSession,
        failed_selector: &str,
        last_error: &Option<BrowserError>,
        planned: &PlannedAction,
    ) -> Vec<String> {
        let dom = session.dom_snapshot().await.unwrap_or_default();
        let error_text =
            last_error.as_ref().map(|error| error.to_string()).unwrap_or_default();
        match self
            .generator
            .find_alternative_selector(
                failed_selector,
                &dom,
                &error_text,
                Some(&planned.description),
            )
            .await
        {
            Ok(alternatives) => {
                alternatives.into_iter().map(|alternative| alternative.selector).collect()
            }
            Err(error) => {
                debug!(%error, "alternative selector lookup failed");
                Vec::new()
            }
        }
    }
}

/// Dispatches one action against the driver.
pub(crate) async fn perform(session: &dyn BrowserSession, action: &Action) -> Result<(), BrowserError> {
    match action {
        Action::Click { selector } => session.click(selector, false).await,
        Action::Type { selector, value } => session.type_text(selector, value).await,
        Action::Assert { selector, predicate } => {
            let info = session
                .element_info(selector)
                .await?
                .ok_or_else(|| BrowserError::SelectorNotFound(selector.clone()))?;
            let holds = match predicate.as_str() {
                "visible" => info.visible,
                "enabled" => info.enabled,
                "hidden" => !info.visible,
                text => info.text.contains(text),
            };
            if holds {
                Ok(())
            } else {
                Err(BrowserError::NotInteractable(selector.clone()))
            }
        }
        Action::Scroll { delta_y } => session.scroll_by(*delta_y).await,
        Action::Navigate { url } => {
            session.navigate(url, vett_contract::timeouts::NAVIGATION_TIMEOUT_MS).await
        }
        Action::Wait { ms } => {
            tokio::time::sleep(std::time::Duration::from_millis(*ms)).await;
            Ok(())
        }
        Action::Complete => Ok(()),
    }
}

fn with_selector(action: &Action, selector: &str) -> Action {
    match action {
        Action::Click { .. } => Action::Click { selector: selector.to_string() },
        Action::Type { value, .. } => {
            Action::Type { selector: selector.to_string(), value: value.clone() }
        }
        Action::Assert { predicate, .. } => {
            Action::Assert { selector: selector.to_string(), predicate: predicate.clone() }
        }
        other => other.clone(),
    }
}

/// Looks for a visible element that plausibly matches the failed target by
/// role and wording.
fn vision_repair_target(
    context: &VisionContext,
    failed_selector: &str,
    description: &str,
) -> Option<String> {
    let words: Vec<String> = description
        .to_ascii_lowercase()
        .split_whitespace()
        .filter(|word| word.len() >= 4)
        .map(str::to_string)
        .collect();
    if words.is_empty() {
        return None;
    }
    context
        .visible_elements()
        .into_iter()
        .filter(|element| element.selector != failed_selector && !element.is_hidden)
        .find(|element| {
            let text = element.text.to_ascii_lowercase();
            !text.is_empty() && words.iter().any(|word| text.contains(word))
        })
        .map(|element| element.selector.clone())
}

pub(crate) use perform as perform_action;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vett_ai::scripted::ScriptedModel;
    use vett_browser::scripted::{ScriptedElement, ScriptedSession};
    use vett_contract::{
        AccessibilitySummary, CookieStatus, InteractiveElement, ModelTask, PreflightStatus,
    };

    fn ready_registry(run_id: &str) -> StatusRegistry {
        let registry = StatusRegistry::new();
        registry.reset(run_id);
        registry.force_statuses_for_tests(run_id, CookieStatus::Completed, PreflightStatus::Completed);
        registry
    }

    fn element(selector: &str, text: &str) -> InteractiveElement {
        InteractiveElement {
            element_type: "button".into(),
            role: "button".into(),
            text: text.into(),
            aria_label: None,
            name: None,
            selector: selector.into(),
            bounds: None,
            is_hidden: false,
            is_required: false,
            href: None,
            vision_visible: None,
            vision_interactable: None,
        }
    }

    fn context_with(elements: Vec<InteractiveElement>) -> VisionContext {
        VisionContext {
            url: "https://example.com".to_string(),
            elements,
            accessibility: AccessibilitySummary::default(),
            total_elements_found: 0,
            vision_validated: false,
            captured_unix_ms: 0,
        }
    }

    fn layer(model: Arc<ScriptedModel>) -> IntelligentRetryLayer {
        IntelligentRetryLayer::new(Arc::new(ActionGenerator::new(model)))
    }

    fn click(selector: &str, description: &str) -> PlannedAction {
        PlannedAction::new(Action::Click { selector: selector.into() }, description, 0.9)
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_success_needs_no_healing() {
        let session = ScriptedSession::new("https://example.com", "<html></html>");
        session.add_element("#buy", ScriptedElement::visible_button("Buy now"));
        let registry = ready_registry("run-1");
        let outcome = layer(Arc::new(ScriptedModel::new()))
            .execute_with_retry(
                &session,
                &click("#buy", "buy button"),
                &context_with(vec![]),
                &registry,
                "run-1",
                &RetryOptions::default(),
                ActionContext::General,
            )
            .await
            .expect("outcome");
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.healing.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn alternative_selector_heals_on_second_attempt() {
        let session = ScriptedSession::new("https://example.com", "<html></html>");
        // The original target does not exist; the alternative does.
        session.add_element("text=Buy now", ScriptedElement::visible_button("Buy now"));

        let model = Arc::new(ScriptedModel::new());
        model.queue_json(
            ModelTask::Healing,
            json!({ "alternatives": [
                { "selector": "text=Buy now", "strategy": "text", "confidence": 0.9 },
                { "selector": "[role=button]", "strategy": "role", "confidence": 0.75 },
            ]}),
        );

        let registry = ready_registry("run-1");
        let outcome = layer(model)
            .execute_with_retry(
                &session,
                &click("button#buy", "press the buy button"),
                &context_with(vec![]),
                &registry,
                "run-1",
                &RetryOptions { max_retries: 3, vision_matching: false },
                ActionContext::General,
            )
            .await
            .expect("outcome");

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);
        let healing = outcome.healing.expect("healing");
        assert_eq!(healing.kind, HealingKind::AlternativeSelector);
        assert_eq!(healing.original_selector, "button#buy");
        assert_eq!(healing.healed_selector, "text=Buy now");
        assert_eq!(healing.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn vision_match_repair_precedes_llm_alternatives() {
        let session = ScriptedSession::new("https://example.com", "<html></html>");
        session.add_element("#checkout-alt", ScriptedElement::visible_button("Checkout"));

        let model = Arc::new(ScriptedModel::new());
        let registry = ready_registry("run-1");
        let context =
            context_with(vec![element("#checkout-alt", "Checkout"), element("#other", "About")]);
        let outcome = layer(model.clone())
            .execute_with_retry(
                &session,
                &click("#checkout", "go to checkout"),
                &context,
                &registry,
                "run-1",
                &RetryOptions::default(),
                ActionContext::General,
            )
            .await
            .expect("outcome");

        assert!(outcome.success);
        let healing = outcome.healing.expect("healing");
        assert_eq!(healing.kind, HealingKind::VisionMatch);
        assert_eq!(healing.healed_selector, "#checkout-alt");
        // No model round-trip was needed.
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_final_error() {
        let session = ScriptedSession::new("https://example.com", "<html></html>");
        let model = Arc::new(ScriptedModel::new());
        model.queue_json(ModelTask::Healing, json!({ "alternatives": [] }));
        let registry = ready_registry("run-1");
        let outcome = layer(model)
            .execute_with_retry(
                &session,
                &click("#missing", "mystery button"),
                &context_with(vec![]),
                &registry,
                "run-1",
                &RetryOptions { max_retries: 3, vision_matching: false },
                ActionContext::General,
            )
            .await
            .expect("outcome");
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.final_error.expect("error").contains("#missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn irl_during_preflight_is_a_violation() {
        let session = ScriptedSession::new("https://example.com", "<html></html>");
        let registry = StatusRegistry::new();
        registry.reset("run-1");
        registry.force_statuses_for_tests(
            "run-1",
            CookieStatus::InProgress,
            PreflightStatus::InProgress,
        );
        let violation = layer(Arc::new(ScriptedModel::new()))
            .execute_with_retry(
                &session,
                &click("#a", "a"),
                &context_with(vec![]),
                &registry,
                "run-1",
                &RetryOptions::default(),
                ActionContext::General,
            )
            .await
            .unwrap_err();
        assert!(violation.detail.contains("retry layer"));
    }

    #[tokio::test(start_paused = true)]
    async fn cookie_consent_context_is_a_violation() {
        let session = ScriptedSession::new("https://example.com", "<html></html>");
        let registry = ready_registry("run-1");
        let violation = layer(Arc::new(ScriptedModel::new()))
            .execute_with_retry(
                &session,
                &click("#a", "a"),
                &context_with(vec![]),
                &registry,
                "run-1",
                &RetryOptions::default(),
                ActionContext::CookieConsent,
            )
            .await
            .unwrap_err();
        assert!(violation.detail.contains("cookie-consent"));
    }
}
