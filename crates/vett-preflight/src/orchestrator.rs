//! Preflight orchestration: cookie resolution, lingering-consent
//! verification, and non-cookie popup dismissal, exactly once per URL.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use vett_ai::ModelClient;
use vett_browser::BrowserSession;
use vett_budget::AiBudgetStore;
use vett_contract::{
    BlockingStatus, CookieOutcome, CookieResolution, CookieStatus, InvariantViolation,
    PopupDetection, PreflightResult, PreflightStatus, PreflightTraceEntry,
};
use vett_core::current_unix_timestamp_ms;
use vett_events::EventEmitter;

use crate::cookie::{CookieConsentMachine, CookieFailureReport, COOKIE_MARKER_SELECTORS};
use crate::popups::PopupScanner;
use crate::status::StatusRegistry;

/// Settle wait after a clean cookie resolution.
const RESOLVED_SETTLE_MS: u64 = 620;
/// Settle wait when the DOM lagged behind the dismissal.
const DELAYED_SETTLE_MS: u64 = 1_000;
/// Wait between popup dismissal strategies before re-checking visibility.
const DISMISS_RECHECK_MS: u64 = 300;

const CLOSE_BUTTON_SELECTORS: &[&str] =
    &[".close", "[aria-label=\"Close\"]", "button.close", ".modal-close"];
const DECLINE_TEXTS: &[&str] =
    &["No thanks", "No", "Skip", "Later", "Cancel", "Decline", "Maybe later"];

/// Owns the preflight invariants for one run.
///
/// Holds the run's sealed cookie machine and popup scanner; both statuses
/// are guaranteed to reach COMPLETED on every exit path short of an
/// invariant violation.
pub struct PreflightOrchestrator {
    registry: Arc<StatusRegistry>,
    cookie_machine: CookieConsentMachine,
    popup_scanner: PopupScanner,
    processed_urls: HashSet<String>,
    emitter: Option<EventEmitter>,
}

impl PreflightOrchestrator {
    pub fn new(
        registry: Arc<StatusRegistry>,
        model: Arc<dyn ModelClient>,
        budget: Arc<AiBudgetStore>,
        parent_run_id: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            cookie_machine: CookieConsentMachine::new(model, budget, parent_run_id),
            popup_scanner: PopupScanner::new(),
            processed_urls: HashSet::new(),
            emitter: None,
        }
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Pages the sealed machine failed to resolve, for offline improvement.
    pub fn cookie_failure_reports(&self) -> &[CookieFailureReport] {
        self.cookie_machine.failure_reports()
    }

    /// Runs the full preflight pipeline for one URL.
    pub async fn execute_preflight(
        &mut self,
        session: &dyn BrowserSession,
        url: &str,
        run_id: &str,
    ) -> Result<PreflightResult, InvariantViolation> {
        let mut trace: Vec<PreflightTraceEntry> = Vec::new();
        let mut errors: Vec<String> = Vec::new();

        if self.processed_urls.contains(url) {
            self.registry.advance_cookie_status(run_id, CookieStatus::Completed)?;
            self.registry.advance_preflight_status(run_id, PreflightStatus::Completed)?;
            push_trace(&mut trace, "FINALIZE", "url already preflight-processed");
            return Ok(PreflightResult {
                success: true,
                cookie: CookieResolution::blocked("already processed"),
                popups_detected: Vec::new(),
                popups_resolved: 0,
                popups_skipped: 0,
                trace,
                errors,
            });
        }
        self.processed_urls.insert(url.to_string());

        self.registry.advance_preflight_status(run_id, PreflightStatus::InProgress)?;
        push_trace(&mut trace, "DETECT", "preflight started");
        self.emit(run_id, "preflight", "preflight started", url);

        // Cookie resolution through the sealed machine; the machine owns the
        // cookie-status transitions.
        push_trace(&mut trace, "CLASSIFY", "invoking sealed cookie machine");
        let cookie = self.cookie_machine.resolve(session, url, run_id, &self.registry).await?;
        push_trace(
            &mut trace,
            "RESOLVE",
            format!("cookie outcome: {}", cookie.outcome.as_str()),
        );
        self.emit(run_id, "preflight", &format!("cookie {}", cookie.outcome.as_str()), url);

        match cookie.outcome {
            CookieOutcome::Resolved => sleep(Duration::from_millis(RESOLVED_SETTLE_MS)).await,
            CookieOutcome::ResolvedWithDelay => {
                sleep(Duration::from_millis(DELAYED_SETTLE_MS)).await
            }
            CookieOutcome::Blocked | CookieOutcome::NotPresent => {}
        }

        // VERIFY: warn when consent UI lingers after resolution.
        for marker in COOKIE_MARKER_SELECTORS {
            if let Ok(Some(info)) = session.element_info(marker).await {
                if info.visible {
                    warn!(run_id, marker, "cookie-related element still visible after resolution");
                    push_trace(&mut trace, "VERIFY", format!("lingering consent element {marker}"));
                }
            }
        }

        // Non-cookie popups: detect, then dismiss the blocking ones.
        let detections = match self.popup_scanner.scan(session, url, run_id, &self.registry).await {
            Ok(detections) => detections,
            Err(violation) => return Err(violation),
        };
        push_trace(&mut trace, "RESOLVE", format!("{} popups detected", detections.len()));

        let mut popups_resolved = 0u32;
        let mut popups_skipped = 0u32;
        for popup in &detections {
            if popup.blocking != BlockingStatus::BlockingUi {
                popups_skipped += 1;
                continue;
            }
            self.registry
                .assert_no_overlay_dismissal_outside_preflight(run_id, "popup_dismiss")?;
            match self.dismiss_popup(session, popup).await {
                Ok(true) => {
                    popups_resolved += 1;
                    push_trace(&mut trace, "RESOLVE", format!("dismissed popup {}", popup.selector));
                }
                Ok(false) => {
                    popups_skipped += 1;
                    push_trace(
                        &mut trace,
                        "RESOLVE",
                        format!("could not dismiss popup {}", popup.selector),
                    );
                }
                Err(error) => {
                    popups_skipped += 1;
                    errors.push(format!("popup dismissal failed for {}: {error}", popup.selector));
                }
            }
        }

        self.registry.advance_preflight_status(run_id, PreflightStatus::Completed)?;
        push_trace(&mut trace, "FINALIZE", "preflight completed");
        self.emit(run_id, "preflight", "preflight completed", url);
        info!(
            run_id,
            cookie = cookie.outcome.as_str(),
            popups_resolved,
            popups_skipped,
            "preflight finished"
        );

        Ok(PreflightResult {
            success: errors.is_empty(),
            cookie,
            popups_detected: detections,
            popups_resolved,
            popups_skipped,
            trace,
            errors,
        })
    }

    /// Ordered dismissal strategies: Escape, scoped close buttons, backdrop
    /// click, scoped decline actions. Re-checks visibility between each.
    async fn dismiss_popup(
        &self,
        session: &dyn BrowserSession,
        popup: &PopupDetection,
    ) -> Result<bool, vett_browser::BrowserError> {
        let selector = popup.selector.as_str();

        if session.press_key("Escape").await.is_ok() {
            sleep(Duration::from_millis(DISMISS_RECHECK_MS)).await;
            if !self.popup_visible(session, selector).await {
                return Ok(true);
            }
        }

        for close in CLOSE_BUTTON_SELECTORS {
            let scoped = format!("{selector} {close}");
            if session.click(&scoped, false).await.is_ok() {
                sleep(Duration::from_millis(DISMISS_RECHECK_MS)).await;
                if !self.popup_visible(session, selector).await {
                    return Ok(true);
                }
            }
        }

        if session.click_at(10.0, 10.0).await.is_ok() {
            sleep(Duration::from_millis(DISMISS_RECHECK_MS)).await;
            if !self.popup_visible(session, selector).await {
                return Ok(true);
            }
        }

        for text in DECLINE_TEXTS {
            let scoped = format!("{selector} :has-text(\"{text}\")");
            if session.click(&scoped, false).await.is_ok() {
                sleep(Duration::from_millis(DISMISS_RECHECK_MS)).await;
                if !self.popup_visible(session, selector).await {
                    return Ok(true);
                }
            }
        }

        debug!(selector, "all popup dismissal strategies exhausted");
        Ok(false)
    }

    async fn popup_visible(&self, session: &dyn BrowserSession, selector: &str) -> bool {
        matches!(session.element_info(selector).await, Ok(Some(info)) if info.visible)
    }

    fn emit(&self, run_id: &str, state: &str, message: &str, url: &str) {
        if let Some(emitter) = &self.emitter {
            emitter.emit_state(run_id, None, state, message, json!({ "url": url }));
        }
    }
}

fn push_trace(trace: &mut Vec<PreflightTraceEntry>, state: &str, message: impl Into<String>) {
    trace.push(PreflightTraceEntry {
        unix_ms: current_unix_timestamp_ms(),
        state: state.to_string(),
        message: message.into(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json as json_value;
    use vett_ai::scripted::ScriptedModel;
    use vett_browser::scripted::{ScriptedElement, ScriptedEffect, ScriptedSession};
    use vett_contract::{ModelTask, UserTier};

    fn orchestrator(model: Arc<ScriptedModel>) -> (PreflightOrchestrator, Arc<StatusRegistry>) {
        let registry = Arc::new(StatusRegistry::new());
        registry.reset("run-1");
        let budget = Arc::new(AiBudgetStore::new());
        budget.get_or_create("parent-1", UserTier::Pro, None);
        let orchestrator =
            PreflightOrchestrator::new(Arc::clone(&registry), model, budget, "parent-1");
        (orchestrator, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn heuristic_cookie_then_no_popups() {
        let session = ScriptedSession::new("https://example.de", "<html lang=\"de\"></html>");
        session.add_element(
            "#onetrust-accept-btn-handler",
            ScriptedElement::visible_button("Accept all"),
        );
        session.queue_effects(
            "#onetrust-accept-btn-handler",
            vec![ScriptedEffect::HideElement("#onetrust-accept-btn-handler".into())],
        );

        let model = Arc::new(ScriptedModel::new());
        let (mut orchestrator, registry) = orchestrator(model);
        let result = orchestrator
            .execute_preflight(&session, "https://example.de", "run-1")
            .await
            .expect("preflight");

        assert!(result.success);
        assert_eq!(result.cookie.outcome, CookieOutcome::Resolved);
        assert_eq!(result.popups_resolved, 0);
        assert_eq!(registry.preflight_status("run-1"), PreflightStatus::Completed);
        assert_eq!(registry.cookie_status("run-1"), CookieStatus::Completed);
        assert!(result.trace.iter().any(|entry| entry.state == "FINALIZE"));
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_newsletter_modal_dismissed_with_escape() {
        let session = ScriptedSession::new("https://example.com", "<html></html>");
        session.add_element(
            "[role=dialog]",
            ScriptedElement::visible_button("Subscribe to our newsletter").with_bounds(
                vett_contract::Bounds { x: 100.0, y: 100.0, width: 900.0, height: 420.0 },
            ),
        );
        session.queue_effects("Escape", vec![ScriptedEffect::HideElement("[role=dialog]".into())]);

        let model = Arc::new(ScriptedModel::new());
        model.queue_json(ModelTask::CookieBanner, json_value!({ "is_cookie_banner": false }));
        let (mut orchestrator, _) = orchestrator(model);
        let result = orchestrator
            .execute_preflight(&session, "https://example.com", "run-1")
            .await
            .expect("preflight");

        assert_eq!(result.cookie.outcome, CookieOutcome::NotPresent);
        assert_eq!(result.popups_resolved, 1);
        assert_eq!(result.popups_skipped, 0);
        assert_eq!(session.keys(), vec!["Escape"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_popup_walks_all_strategies() {
        let session = ScriptedSession::new("https://example.com", "<html></html>");
        session.add_element(
            ".modal",
            ScriptedElement::visible_button("Special offer just for you"),
        );
        // Only the scoped decline button works.
        session.add_element(".modal :has-text(\"No thanks\")", ScriptedElement::visible_button("No thanks"));
        session.queue_effects(
            ".modal :has-text(\"No thanks\")",
            vec![ScriptedEffect::HideElement(".modal".into())],
        );

        let model = Arc::new(ScriptedModel::new());
        model.queue_json(ModelTask::CookieBanner, json_value!({ "is_cookie_banner": false }));
        let (mut orchestrator, _) = orchestrator(model);
        let result = orchestrator
            .execute_preflight(&session, "https://example.com", "run-1")
            .await
            .expect("preflight");

        assert_eq!(result.popups_resolved, 1);
        assert!(!session.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_on_processed_url_is_noop_with_completed_statuses() {
        let session = ScriptedSession::new("https://example.com", "<html></html>");
        let model = Arc::new(ScriptedModel::new());
        model.queue_json(ModelTask::CookieBanner, json_value!({ "is_cookie_banner": false }));
        let (mut orchestrator, registry) = orchestrator(model);

        let first = orchestrator
            .execute_preflight(&session, "https://example.com", "run-1")
            .await
            .expect("first");
        assert!(first.success);

        let second = orchestrator
            .execute_preflight(&session, "https://example.com", "run-1")
            .await
            .expect("second");
        assert!(second.success);
        assert_eq!(second.cookie.outcome, CookieOutcome::Blocked);
        assert_eq!(registry.cookie_status("run-1"), CookieStatus::Completed);
        assert_eq!(registry.preflight_status("run-1"), PreflightStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn undismissable_popup_counts_as_skipped() {
        let session = ScriptedSession::new("https://example.com", "<html></html>");
        session.add_element("[aria-modal=true]", ScriptedElement::visible_button("Join now"));

        let model = Arc::new(ScriptedModel::new());
        model.queue_json(ModelTask::CookieBanner, json_value!({ "is_cookie_banner": false }));
        let (mut orchestrator, _) = orchestrator(model);
        let result = orchestrator
            .execute_preflight(&session, "https://example.com", "run-1")
            .await
            .expect("preflight");

        assert_eq!(result.popups_resolved, 0);
        assert_eq!(result.popups_skipped, 1);
        assert!(result.success);
    }
}
