//! Single-action execution behind the phase invariants, state capture, and
//! streak-based error recovery.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use vett_browser::{BrowserError, BrowserSession};
use vett_contract::{
    timeouts, ActionContext, Bounds, HealingRecord, InvariantViolation, PlannedAction,
    StepOutcome, VisionContext,
};
use vett_preflight::StatusRegistry;

use crate::retry_layer::{perform_action, IntelligentRetryLayer, RetryOptions};

#[derive(Debug, Error)]
/// Failures surfaced by the executor.
pub enum ExecutorError {
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

#[derive(Debug, Clone)]
/// Result of dispatching one action.
pub struct ExecutionReport {
    pub outcome: StepOutcome,
    pub healing: Option<HealingRecord>,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
/// Screenshot plus DOM snapshot taken after preflight completion.
pub struct CapturedState {
    pub screenshot: Vec<u8>,
    pub dom: String,
}

#[derive(Debug, Clone, PartialEq)]
/// One element's bounds in a capture, with the target marked.
pub struct ElementBound {
    pub selector: String,
    pub bounds: Bounds,
    /// Empty for plain elements; clicked/typed/analyzed/failed/healed for
    /// the step target.
    pub mark: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What a recovery pass did for a failure streak.
pub enum RecoveryAction {
    None,
    WaitedForNetworkIdle,
    Scrolled,
    NavigatedToBase,
    Reloaded,
    ScrolledToTop,
}

/// Parameters for [`TestExecutor::execute_action`].
pub struct ExecutionParams<'a> {
    pub session: &'a dyn BrowserSession,
    pub planned: &'a PlannedAction,
    pub context: &'a VisionContext,
    pub run_id: &'a str,
    pub action_ctx: ActionContext,
    pub irl_enabled: bool,
    pub retry_options: RetryOptions,
}

/// Dispatches actions, capturing state and recovering from failure streaks.
pub struct TestExecutor {
    registry: Arc<StatusRegistry>,
    retry_layer: Arc<IntelligentRetryLayer>,
}

impl TestExecutor {
    pub fn new(registry: Arc<StatusRegistry>, retry_layer: Arc<IntelligentRetryLayer>) -> Self {
        Self { registry, retry_layer }
    }

    /// Executes one action. Retryable actions outside the cookie-consent
    /// context go through the retry layer when it is enabled; everything
    /// else is dispatched directly.
    pub async fn execute_action(
        &self,
        params: ExecutionParams<'_>,
    ) -> Result<ExecutionReport, ExecutorError> {
        self.registry.assert_no_irl_during_preflight(params.run_id, "execute_action")?;

        let use_irl = params.irl_enabled
            && params.planned.action.is_retryable()
            && params.action_ctx != ActionContext::CookieConsent;

        if use_irl {
            let outcome = self
                .retry_layer
                .execute_with_retry(
                    params.session,
                    params.planned,
                    params.context,
                    &self.registry,
                    params.run_id,
                    &params.retry_options,
                    params.action_ctx,
                )
                .await?;
            let report = ExecutionReport {
                outcome: if !outcome.success {
                    StepOutcome::Failure
                } else if outcome.healing.is_some() {
                    StepOutcome::Healed
                } else {
                    StepOutcome::Success
                },
                healing: outcome.healing,
                attempts: outcome.attempts,
                error: outcome.final_error,
            };
            return Ok(report);
        }

        match perform_action(params.session, &params.planned.action).await {
            Ok(()) => Ok(ExecutionReport {
                outcome: StepOutcome::Success,
                healing: None,
                attempts: 1,
                error: None,
            }),
            Err(error) => Ok(ExecutionReport {
                outcome: StepOutcome::Failure,
                healing: None,
                attempts: 1,
                error: Some(error.to_string()),
            }),
        }
    }

    /// Takes a screenshot and DOM snapshot. Both captures are gated on
    /// preflight completion.
    pub async fn capture_state(
        &self,
        session: &dyn BrowserSession,
        run_id: &str,
    ) -> Result<CapturedState, ExecutorError> {
        self.registry.assert_preflight_completed_before_screenshot(run_id, "capture_state")?;
        self.registry.assert_preflight_completed_before_dom_snapshot(run_id, "capture_state")?;
        let screenshot = session.screenshot().await?;
        let dom = session.dom_snapshot().await?;
        Ok(CapturedState { screenshot, dom })
    }

    /// Collects all interactive bounds plus the step target, marked with how
    /// the step used it. Desktop only; mobile runs return `None`.
    pub async fn capture_element_bounds(
        &self,
        session: &dyn BrowserSession,
        is_mobile: bool,
        context: &VisionContext,
        planned: Option<&PlannedAction>,
        outcome: Option<StepOutcome>,
        healing: Option<&HealingRecord>,
    ) -> Result<Option<Vec<ElementBound>>, ExecutorError> {
        if is_mobile {
            return Ok(None);
        }
        let target_selector = healing
            .map(|healing| healing.healed_selector.clone())
            .or_else(|| planned.and_then(|planned| planned.action.selector().map(str::to_string)));
        let mark = match (planned, outcome, healing) {
            (_, _, Some(_)) => "healed",
            (_, Some(StepOutcome::Failure), _) => "failed",
            (Some(planned), _, _) => match planned.action.kind() {
                "click" => "clicked",
                "type" => "typed",
                _ => "analyzed",
            },
            _ => "analyzed",
        };

        let mut bounds = Vec::new();
        for element in &context.elements {
            let Some(bounding_box) = session.bounding_box(&element.selector).await? else {
                continue;
            };
            let is_target = target_selector.as_deref() == Some(element.selector.as_str());
            bounds.push(ElementBound {
                selector: element.selector.clone(),
                bounds: bounding_box,
                mark: if is_target { mark.to_string() } else { String::new() },
            });
        }
        Ok(Some(bounds))
    }

    /// Escalating recovery by consecutive-failure streak. Overlay and cookie
    /// dismissal are never attempted here.
    pub async fn recover_from_errors(
        &self,
        session: &dyn BrowserSession,
        base_url: &str,
        consecutive_errors: u32,
        visible_element_count: usize,
    ) -> Result<RecoveryAction, ExecutorError> {
        if consecutive_errors >= 6 && visible_element_count == 0 {
            info!(consecutive_errors, "recovery: scrolling to top of an empty view");
            session.scroll_to_top().await?;
            return Ok(RecoveryAction::ScrolledToTop);
        }
        if consecutive_errors >= 5 {
            let current = session.current_url().await.unwrap_or_default();
            if current != base_url {
                warn!(consecutive_errors, "recovery: navigating back to base url");
                session.navigate(base_url, timeouts::NAVIGATION_TIMEOUT_MS).await?;
                return Ok(RecoveryAction::NavigatedToBase);
            }
            warn!(consecutive_errors, "recovery: reloading page");
            session.reload().await?;
            return Ok(RecoveryAction::Reloaded);
        }
        if consecutive_errors >= 3 {
            debug!(consecutive_errors, "recovery: scrolling for fresh content");
            session.scroll_by(600).await?;
            return Ok(RecoveryAction::Scrolled);
        }
        if consecutive_errors >= 2 {
            debug!(consecutive_errors, "recovery: waiting for network idle");
            session.wait_for_network_idle(5_000).await?;
            return Ok(RecoveryAction::WaitedForNetworkIdle);
        }
        Ok(RecoveryAction::None)
    }

    /// Retained for interface compatibility; overlay dismissal lives solely
    /// in the preflight orchestrator. This is a no-op by contract.
    pub async fn dismiss_overlays(&self, _session: &dyn BrowserSession) -> u32 {
        0
    }
}
