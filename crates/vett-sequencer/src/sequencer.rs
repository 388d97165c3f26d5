//! The per-run phase state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::time::timeout;
use tracing::{error, info, warn};

use vett_actions::{ActionError, GenerationTracking};
use vett_ai::ModelError;
use vett_browser::BrowserSession;
use vett_contract::{
    timeouts, Action, ActionContext, FailureExplanation, InvariantViolation, PlannedAction,
    RunDescriptor, RunOutcome, RunState, RunSummary, StepOutcome, StepRecord, TestModeConfig,
};
use vett_core::current_unix_timestamp_ms;
use vett_executor::{ExecutionParams, ExecutorError, IntelligentRetryLayer, RetryOptions, TestExecutor};
use vett_preflight::PreflightOrchestrator;
use vett_resilience::services;

use crate::engine::{Engine, RunReport};
use crate::plan::derive_goal;

/// Cooperative cancel flag, observed at phase boundaries and before each
/// step.
pub type RunCancellation = Arc<AtomicBool>;

/// How a model failure affects the run.
enum ModelFailureKind {
    RateLimited,
    Permanent,
    Transient,
}

fn classify_action_error(error: &ActionError) -> ModelFailureKind {
    match error {
        ActionError::Model(ModelError::RateLimited { .. })
        | ActionError::Model(ModelError::HttpStatus { status: 429, .. }) => {
            ModelFailureKind::RateLimited
        }
        ActionError::Model(model_error) if model_error.is_permanent() => {
            ModelFailureKind::Permanent
        }
        _ => ModelFailureKind::Transient,
    }
}

struct RunFlow {
    steps: Vec<StepRecord>,
    summary: RunSummary,
    history: Vec<String>,
    consecutive_failures: u32,
    last_error: Option<String>,
    stopped_for_budget: bool,
    stopped_for_degradation: bool,
    completed_naturally: bool,
    cancelled: bool,
    permanent_failure: Option<String>,
}

impl RunFlow {
    fn new() -> Self {
        Self {
            steps: Vec::new(),
            summary: RunSummary::default(),
            history: Vec::new(),
            consecutive_failures: 0,
            last_error: None,
            stopped_for_budget: false,
            stopped_for_degradation: false,
            completed_naturally: false,
            cancelled: false,
            permanent_failure: None,
        }
    }
}

impl Engine {
    /// Runs one descriptor to completion.
    pub async fn run(&self, descriptor: RunDescriptor) -> RunReport {
        self.run_with_cancel(descriptor, Arc::new(AtomicBool::new(false))).await
    }

    /// Runs one descriptor, honoring a cooperative cancel flag.
    pub async fn run_with_cancel(
        &self,
        descriptor: RunDescriptor,
        cancel: RunCancellation,
    ) -> RunReport {
        let run_id = descriptor.run_id.clone();
        if let Err(validation) = descriptor.validate() {
            error!(run_id, %validation, "descriptor rejected");
            return RunReport {
                run_id,
                outcome: RunOutcome::FailedUnrecoverable,
                summary: RunSummary {
                    failure_explanation: Some(FailureExplanation {
                        root_cause: format!("invalid run descriptor: {validation}"),
                        user_impact: "The test run could not start.".to_string(),
                        suggestion: "Fix the run configuration and submit it again.".to_string(),
                    }),
                    ..RunSummary::default()
                },
                steps: Vec::new(),
                preflight: None,
            };
        }

        let config = TestModeConfig::for_mode(descriptor.test_mode);
        self.budget.get_or_create(&descriptor.parent_run_id, descriptor.user_tier, None);
        self.registry.reset(&run_id);
        self.emit_phase(&run_id, RunState::Created, "run created", &descriptor);

        // NAVIGATING: open a session from the shared browser process and
        // load the first URL. No capture of any kind happens here.
        self.emit_phase(&run_id, RunState::Navigating, "opening browser session", &descriptor);
        let session = match self
            .browser_manager
            .open_session(descriptor.browser_type, &descriptor.device)
            .await
        {
            Ok(session) => session,
            Err(browser_error) => {
                warn!(run_id, %browser_error, "browser session could not be opened");
                self.registry.clear(&run_id);
                return RunReport {
                    run_id,
                    outcome: RunOutcome::FailedRecoverable,
                    summary: RunSummary {
                        failure_explanation: Some(deterministic_explanation(&format!(
                            "browser session failed: {browser_error}"
                        ))),
                        ..RunSummary::default()
                    },
                    steps: Vec::new(),
                    preflight: None,
                };
            }
        };

        let url = descriptor.first_url().to_string();
        if let Err(navigation_error) =
            session.navigate(&url, timeouts::NAVIGATION_TIMEOUT_MS).await
        {
            warn!(run_id, %navigation_error, "initial navigation failed");
            session.close().await;
            self.registry.clear(&run_id);
            return RunReport {
                run_id,
                outcome: RunOutcome::FailedRecoverable,
                summary: RunSummary {
                    failure_explanation: Some(deterministic_explanation(&format!(
                        "navigation to {url} failed: {navigation_error}"
                    ))),
                    ..RunSummary::default()
                },
                steps: Vec::new(),
                preflight: None,
            };
        }

        // PREFLIGHT: consent and popup resolution, exactly once for the URL.
        self.emit_phase(&run_id, RunState::Preflight, "starting preflight", &descriptor);
        let mut orchestrator = PreflightOrchestrator::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.model),
            Arc::clone(&self.budget),
            descriptor.parent_run_id.clone(),
        )
        .with_emitter(self.emitter.clone());
        let preflight = match timeout(
            config.phase_timeout(),
            orchestrator.execute_preflight(session.as_ref(), &url, &run_id),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(violation)) => {
                return self
                    .finish_unrecoverable(session.as_ref(), &run_id, violation, None)
                    .await;
            }
            Err(_elapsed) => {
                warn!(run_id, timeout_ms = config.phase_timeout_ms, "preflight phase timed out");
                session.close().await;
                self.registry.clear(&run_id);
                return RunReport {
                    run_id,
                    outcome: RunOutcome::FailedRecoverable,
                    summary: RunSummary {
                        failure_explanation: Some(deterministic_explanation(&format!(
                            "preflight exceeded the {}ms phase timeout",
                            config.phase_timeout_ms
                        ))),
                        ..RunSummary::default()
                    },
                    steps: Vec::new(),
                    preflight: None,
                };
            }
        };

        let retry_layer = Arc::new(IntelligentRetryLayer::new(Arc::clone(&self.generator)));
        let executor = TestExecutor::new(Arc::clone(&self.registry), retry_layer);
        let mut flow = RunFlow::new();
        flow.summary.popups_resolved = preflight.popups_resolved;

        // DIAGNOSING: testability narrative, gated on preflight completion
        // and budget.
        if config.diagnosis_required {
            self.emit_phase(&run_id, RunState::Diagnosing, "diagnosing testability", &descriptor);
            if let Err(violation) = self
                .registry
                .assert_preflight_completed_before_diagnosis(&run_id, "sequencer")
            {
                return self
                    .finish_unrecoverable(session.as_ref(), &run_id, violation, Some(preflight))
                    .await;
            }
            self.run_diagnosis(&executor, session.as_ref(), &run_id, &descriptor, &mut flow)
                .await;
        }

        // PLANNING: parse instructions when present, derive the goal.
        self.emit_phase(&run_id, RunState::Planning, "deriving plan", &descriptor);
        let instruction_plan = match &descriptor.instructions {
            Some(instructions)
                if self.budget.can_make_llm_call(&descriptor.parent_run_id).is_ok()
                    && self.breakers.allow(services::TEXT_MODEL) =>
            {
                match self.generator.parse_test_instructions(instructions, Some(&url)).await {
                    Ok(plan) => {
                        self.record_text_success(&descriptor, &mut flow);
                        Some(plan)
                    }
                    Err(action_error) => {
                        self.record_text_failure(&run_id, &descriptor, &action_error, &mut flow);
                        None
                    }
                }
            }
            _ => None,
        };
        let goal = derive_goal(descriptor.test_mode, instruction_plan.as_ref());

        // EXECUTING: the step loop, bounded by the mode's phase timeout.
        if flow.permanent_failure.is_none() {
            match timeout(
                config.phase_timeout(),
                self.execute_steps(&executor, session.as_ref(), &descriptor, &config, &goal, &cancel, &mut flow),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(violation)) => {
                    return self
                        .finish_unrecoverable(session.as_ref(), &run_id, violation, Some(preflight))
                        .await;
                }
                Err(_elapsed) => {
                    warn!(run_id, timeout_ms = config.phase_timeout_ms, "executing phase timed out");
                    flow.last_error =
                        Some(format!("executing exceeded the {}ms phase timeout", config.phase_timeout_ms));
                }
            }
        }

        // FINALIZING: release the session (the process stays alive for
        // reuse), compute the outcome, and explain failures.
        self.emit_phase(&run_id, RunState::Finalizing, "finalizing run", &descriptor);
        session.close().await;
        self.registry.clear(&run_id);

        let outcome = if flow.permanent_failure.is_some() {
            RunOutcome::FailedUnrecoverable
        } else if flow.cancelled {
            RunOutcome::Abandoned
        } else if flow.completed_naturally {
            RunOutcome::Completed
        } else if flow.stopped_for_budget || flow.summary.steps_succeeded > 0 {
            RunOutcome::CompletedWithLimits
        } else {
            RunOutcome::FailedRecoverable
        };

        if !outcome.is_success() || flow.stopped_for_degradation {
            let cause = flow
                .permanent_failure
                .clone()
                .or_else(|| flow.last_error.clone())
                .unwrap_or_else(|| "run made no progress within its step cap".to_string());
            flow.summary.failure_explanation = Some(self.explain_failure(&descriptor, &cause).await);
        }

        self.emitter.emit_state(
            &run_id,
            None,
            RunState::Done.as_str(),
            format!("run finished: {}", outcome.as_str()),
            json!({
                "outcome": outcome.as_str(),
                "steps_attempted": flow.summary.steps_attempted,
                "steps_healed": flow.summary.steps_healed,
                "llm_calls": flow.summary.llm_calls_used,
            }),
        );
        info!(run_id, outcome = outcome.as_str(), "run finished");

        RunReport {
            run_id,
            outcome,
            summary: flow.summary,
            steps: flow.steps,
            preflight: Some(preflight),
        }
    }

    async fn run_diagnosis(
        &self,
        executor: &TestExecutor,
        session: &dyn BrowserSession,
        run_id: &str,
        descriptor: &RunDescriptor,
        flow: &mut RunFlow,
    ) {
        if self.budget.can_make_llm_call(&descriptor.parent_run_id).is_err()
            || !self.breakers.allow(services::TEXT_MODEL)
        {
            self.emitter.emit_state(
                run_id,
                None,
                RunState::Diagnosing.as_str(),
                "diagnosis skipped: no AI capacity",
                json!({}),
            );
            return;
        }
        let captured = match executor.capture_state(session, run_id).await {
            Ok(captured) => captured,
            Err(capture_error) => {
                warn!(run_id, %capture_error, "diagnosis capture failed");
                return;
            }
        };
        let context = self
            .analyzer
            .analyze_page(descriptor.first_url(), &captured.dom, None, false)
            .await;
        match self.analyzer.analyze_testability(&context).await {
            Ok(report) => {
                self.record_text_success(descriptor, flow);
                self.emitter.emit_state(
                    run_id,
                    None,
                    RunState::Diagnosing.as_str(),
                    "diagnosis complete, approved by policy",
                    json!({
                        "testable": report.testable.len(),
                        "high_risk": report.high_risk.len(),
                        "fallback": report.from_fallback,
                    }),
                );
            }
            Err(model_error) => {
                let action_error = ActionError::Model(model_error);
                self.record_text_failure(run_id, descriptor, &action_error, flow);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_steps(
        &self,
        executor: &TestExecutor,
        session: &dyn BrowserSession,
        descriptor: &RunDescriptor,
        config: &TestModeConfig,
        goal: &str,
        cancel: &RunCancellation,
        flow: &mut RunFlow,
    ) -> Result<(), InvariantViolation> {
        let run_id = descriptor.run_id.as_str();
        let base_url = descriptor.first_url().to_string();
        let mut tracking = GenerationTracking {
            project_id: descriptor.project_id.clone(),
            visited_urls: vec![base_url.clone()],
            attempted_selectors: Vec::new(),
            browser_quirks: match descriptor.browser_type {
                vett_contract::BrowserType::Webkit => {
                    Some("webkit: force-click fallbacks may be needed".to_string())
                }
                _ => None,
            },
        };

        self.emit_phase(run_id, RunState::Executing, "entering step loop", descriptor);
        for step_order in 1..=config.max_steps {
            if cancel.load(Ordering::SeqCst) {
                info!(run_id, step_order, "cancellation observed, abandoning run");
                flow.cancelled = true;
                return Ok(());
            }

            let captured = match executor.capture_state(session, run_id).await {
                Ok(captured) => captured,
                Err(ExecutorError::Invariant(violation)) => return Err(violation),
                Err(ExecutorError::Browser(capture_error)) => {
                    flow.consecutive_failures += 1;
                    flow.last_error = Some(capture_error.to_string());
                    self.recover(executor, session, &base_url, flow, 0).await;
                    continue;
                }
            };

            let vision_allowed = config.vision_enabled
                && self.budget.can_make_vision_call(&descriptor.parent_run_id, false).is_ok();
            let context = self
                .analyzer
                .analyze_page(
                    &base_url,
                    &captured.dom,
                    if vision_allowed { Some(captured.screenshot.as_slice()) } else { None },
                    config.vision_enabled,
                )
                .await;
            if context.vision_validated {
                self.budget.record_vision_call(&descriptor.parent_run_id);
                flow.summary.vision_calls_used += 1;
            }

            // Budget binding: an AI-consuming step may not start once the
            // budget is exhausted.
            if self.budget.can_make_llm_call(&descriptor.parent_run_id).is_err() {
                self.emitter.emit_state(
                    run_id,
                    Some(step_order),
                    RunState::Executing.as_str(),
                    "AI budget exhausted, stopping gracefully",
                    json!({ "parent_run": descriptor.parent_run_id }),
                );
                flow.stopped_for_budget = true;
                return Ok(());
            }
            if !self.breakers.allow(services::TEXT_MODEL) {
                self.emitter.emit_state(
                    run_id,
                    Some(step_order),
                    "service_degraded",
                    "text model circuit open, stopping",
                    json!({ "service": services::TEXT_MODEL }),
                );
                flow.stopped_for_degradation = true;
                return Ok(());
            }
            self.registry
                .assert_preflight_completed_before_ai_analysis(run_id, "planner")?;

            let planned = match self
                .generator
                .generate_action(&context, &flow.history, goal, &tracking)
                .await
            {
                Ok(planned) => {
                    self.record_text_success(descriptor, flow);
                    planned
                }
                Err(action_error) => {
                    self.record_text_failure(run_id, descriptor, &action_error, flow);
                    if flow.permanent_failure.is_some() {
                        return Ok(());
                    }
                    flow.consecutive_failures += 1;
                    self.recover(executor, session, &base_url, flow, context.elements.len())
                        .await;
                    continue;
                }
            };

            if matches!(planned.action, Action::Complete) {
                self.push_step(flow, step_order, planned, StepOutcome::Success, None, None);
                self.emitter.emit_state(
                    run_id,
                    Some(step_order),
                    RunState::Executing.as_str(),
                    "planner declared the run complete",
                    json!({}),
                );
                flow.completed_naturally = true;
                return Ok(());
            }

            if let Some(selector) = planned.action.selector() {
                tracking.attempted_selectors.push(selector.to_string());
            }

            let report = match executor
                .execute_action(ExecutionParams {
                    session,
                    planned: &planned,
                    context: &context,
                    run_id,
                    action_ctx: ActionContext::General,
                    irl_enabled: true,
                    retry_options: RetryOptions::default(),
                })
                .await
            {
                Ok(report) => report,
                Err(ExecutorError::Invariant(violation)) => return Err(violation),
                Err(ExecutorError::Browser(browser_error)) => {
                    flow.consecutive_failures += 1;
                    flow.last_error = Some(browser_error.to_string());
                    self.push_step(
                        flow,
                        step_order,
                        planned,
                        StepOutcome::Failure,
                        None,
                        Some(browser_error.to_string()),
                    );
                    self.recover(executor, session, &base_url, flow, context.elements.len())
                        .await;
                    continue;
                }
            };

            let healing = report.healing.clone();
            let error = report.error.clone();
            self.push_step(flow, step_order, planned.clone(), report.outcome, healing, error);
            self.emitter.emit_state(
                run_id,
                Some(step_order),
                RunState::Executing.as_str(),
                format!("step {}: {} -> {}", step_order, planned.action.kind(), report.outcome.as_str()),
                json!({ "attempts": report.attempts, "healed": report.outcome == StepOutcome::Healed }),
            );

            match report.outcome {
                StepOutcome::Failure => {
                    flow.consecutive_failures += 1;
                    flow.last_error = report.error;
                    self.recover(executor, session, &base_url, flow, context.elements.len())
                        .await;
                }
                StepOutcome::Success | StepOutcome::Healed => {
                    flow.consecutive_failures = 0;
                }
            }
        }
        Ok(())
    }

    async fn recover(
        &self,
        executor: &TestExecutor,
        session: &dyn BrowserSession,
        base_url: &str,
        flow: &mut RunFlow,
        visible_elements: usize,
    ) {
        if let Err(recovery_error) = executor
            .recover_from_errors(session, base_url, flow.consecutive_failures, visible_elements)
            .await
        {
            warn!(%recovery_error, "recovery pass failed");
        }
    }

    fn push_step(
        &self,
        flow: &mut RunFlow,
        order: u32,
        planned: PlannedAction,
        outcome: StepOutcome,
        healing: Option<vett_contract::HealingRecord>,
        error: Option<String>,
    ) {
        let now = current_unix_timestamp_ms();
        flow.summary.steps_attempted += 1;
        match outcome {
            StepOutcome::Success => flow.summary.steps_succeeded += 1,
            StepOutcome::Healed => {
                flow.summary.steps_succeeded += 1;
                flow.summary.steps_healed += 1;
            }
            StepOutcome::Failure => {}
        }
        flow.history.push(format!(
            "step {}: {} {} -> {}",
            order,
            planned.action.kind(),
            planned.action.selector().unwrap_or(""),
            outcome.as_str()
        ));
        flow.steps.push(StepRecord {
            order,
            action: planned,
            outcome,
            screenshot_ref: None,
            dom_ref: None,
            healing,
            error,
            started_unix_ms: now,
            finished_unix_ms: now,
        });
    }

    fn record_text_success(&self, descriptor: &RunDescriptor, flow: &mut RunFlow) {
        self.budget.record_llm_call(&descriptor.parent_run_id);
        flow.summary.llm_calls_used += 1;
        self.breakers.record_success(services::TEXT_MODEL);
    }

    fn record_text_failure(
        &self,
        run_id: &str,
        descriptor: &RunDescriptor,
        action_error: &ActionError,
        flow: &mut RunFlow,
    ) {
        self.breakers.record_failure(services::TEXT_MODEL);
        flow.last_error = Some(action_error.to_string());
        match classify_action_error(action_error) {
            ModelFailureKind::RateLimited => {
                self.budget.record_rate_limit_hit(&descriptor.parent_run_id);
                self.emitter.emit_state(
                    run_id,
                    None,
                    "rate_limited",
                    "model call was rate limited",
                    json!({ "error": action_error.to_string() }),
                );
            }
            ModelFailureKind::Permanent => {
                error!(run_id, %action_error, "permanent provider failure");
                flow.permanent_failure = Some(action_error.to_string());
            }
            ModelFailureKind::Transient => {
                self.emitter.emit_state(
                    run_id,
                    None,
                    "service_degraded",
                    "model call failed",
                    json!({ "error": action_error.to_string() }),
                );
            }
        }
    }

    async fn finish_unrecoverable(
        &self,
        session: &dyn BrowserSession,
        run_id: &str,
        violation: InvariantViolation,
        preflight: Option<vett_contract::PreflightResult>,
    ) -> RunReport {
        error!(run_id, %violation, "invariant violation, aborting run");
        session.close().await;
        self.registry.clear(run_id);
        self.emitter.emit_state(
            run_id,
            None,
            RunState::Done.as_str(),
            format!("run aborted: {violation}"),
            json!({ "outcome": RunOutcome::FailedUnrecoverable.as_str() }),
        );
        RunReport {
            run_id: run_id.to_string(),
            outcome: RunOutcome::FailedUnrecoverable,
            summary: RunSummary {
                failure_explanation: Some(FailureExplanation {
                    root_cause: violation.to_string(),
                    user_impact: "The run was aborted to protect result integrity.".to_string(),
                    suggestion: "Report this as an engine defect; a phase guard was bypassed."
                        .to_string(),
                }),
                ..RunSummary::default()
            },
            steps: Vec::new(),
            preflight,
        }
    }

    async fn explain_failure(
        &self,
        descriptor: &RunDescriptor,
        cause: &str,
    ) -> FailureExplanation {
        if self.budget.can_make_llm_call(&descriptor.parent_run_id).is_ok()
            && self.breakers.allow(services::TEXT_MODEL)
        {
            if let Ok(analysis) =
                self.analyzer.analyze_error(cause, descriptor.first_url()).await
            {
                if !analysis.from_fallback {
                    self.budget.record_llm_call(&descriptor.parent_run_id);
                }
                return FailureExplanation {
                    root_cause: analysis.root_cause,
                    user_impact: "The test could not finish what a visitor would normally do."
                        .to_string(),
                    suggestion: analysis
                        .fixes
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "Re-run the test once the page is reachable.".to_string()),
                };
            }
        }
        deterministic_explanation(cause)
    }

    fn emit_phase(
        &self,
        run_id: &str,
        state: RunState,
        message: &str,
        descriptor: &RunDescriptor,
    ) {
        self.emitter.emit_state(
            run_id,
            None,
            state.as_str(),
            message,
            json!({
                "mode": descriptor.test_mode.as_str(),
                "browser": descriptor.browser_type.as_str(),
            }),
        );
    }
}

fn deterministic_explanation(cause: &str) -> FailureExplanation {
    FailureExplanation {
        root_cause: cause.to_string(),
        user_impact: "A visitor would have been unable to complete this flow.".to_string(),
        suggestion: "Inspect the last step's error and re-run the test.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json as json_value;
    use vett_ai::scripted::{ScriptedModel, ScriptedReply};
    use vett_browser::scripted::{ScriptedBackend, ScriptedElement, ScriptedSession};
    use vett_contract::{BrowserType, DeviceProfile, ModelTask, TestMode, UserTier};
    use vett_events::MemorySink;

    fn descriptor(mode: TestMode, tier: UserTier) -> RunDescriptor {
        RunDescriptor {
            run_id: "01RUN".to_string(),
            parent_run_id: "01PARENT".to_string(),
            target_urls: vec!["https://example.com".to_string()],
            test_mode: mode,
            browser_type: BrowserType::Chromium,
            device: DeviceProfile::default(),
            user_tier: tier,
            instructions: None,
            project_id: None,
        }
    }

    fn engine_with(
        model: Arc<ScriptedModel>,
        session: Arc<ScriptedSession>,
    ) -> (Engine, Arc<MemorySink>) {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_session(session);
        let sink = MemorySink::new();
        let engine = Engine::new(model, backend, sink.clone());
        (engine, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn guest_run_completes_when_planner_says_complete() {
        let session = Arc::new(ScriptedSession::new(
            "https://example.com",
            "<html><body><button id=\"go\">Go</button></body></html>",
        ));
        session.add_element("#go", ScriptedElement::visible_button("Go"));

        let model = Arc::new(ScriptedModel::new());
        model.queue_json(ModelTask::CookieBanner, json_value!({ "is_cookie_banner": false }));
        model.queue_json(
            ModelTask::ActionGeneration,
            json_value!({ "action": "click", "selector": "#go", "description": "go", "confidence": 0.9 }),
        );
        model.queue_json(
            ModelTask::ActionGeneration,
            json_value!({ "action": "complete", "description": "done", "confidence": 0.9 }),
        );

        let (engine, sink) = engine_with(model, Arc::clone(&session));
        let report = engine.run(descriptor(TestMode::Guest, UserTier::Pro)).await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.summary.steps_attempted, 2);
        assert_eq!(report.summary.steps_succeeded, 2);
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.steps[0].outcome, StepOutcome::Success);
        assert!(matches!(report.steps[1].action.action, Action::Complete));
        assert_eq!(session.clicks().len(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let states: Vec<String> = sink.events().into_iter().map(|event| event.state).collect();
        for expected in ["created", "navigating", "preflight", "planning", "executing", "done"] {
            assert!(states.iter().any(|state| state == expected), "missing state {expected}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_guest_budget_stops_with_limits() {
        let session = Arc::new(ScriptedSession::new(
            "https://example.com",
            "<html><body><button id=\"go\">Go</button></body></html>",
        ));
        session.add_element("#go", ScriptedElement::visible_button("Go"));
        let model = Arc::new(ScriptedModel::new());

        let (engine, _) = engine_with(model.clone(), session);
        // The guest cap is 10 LLM calls; they are already spent.
        engine.budget.get_or_create("01PARENT", UserTier::Guest, None);
        for _ in 0..10 {
            engine.budget.record_llm_call("01PARENT");
        }

        let report = engine.run(descriptor(TestMode::Guest, UserTier::Guest)).await;
        assert_eq!(report.outcome, RunOutcome::CompletedWithLimits);
        assert_eq!(report.summary.steps_attempted, 0);
        // Neither the cookie classifier nor the planner was allowed to call.
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn planner_rate_limits_degrade_and_open_breaker() {
        let session = Arc::new(ScriptedSession::new(
            "https://example.com",
            "<html><body><button id=\"go\">Go</button></body></html>",
        ));
        session.add_element("#go", ScriptedElement::visible_button("Go"));

        let model = Arc::new(ScriptedModel::new());
        model.queue_json(ModelTask::CookieBanner, json_value!({ "is_cookie_banner": false }));
        for _ in 0..8 {
            model.queue_reply(ModelTask::ActionGeneration, ScriptedReply::Status(429));
        }

        let (engine, sink) = engine_with(model, session);
        let report = engine.run(descriptor(TestMode::Guest, UserTier::Pro)).await;

        // Five consecutive planner failures open the text-model breaker and
        // the run stops without a single successful step.
        assert_eq!(report.outcome, RunOutcome::FailedRecoverable);
        assert!(report.summary.failure_explanation.is_some());
        assert_eq!(
            engine.breakers.state(services::TEXT_MODEL),
            vett_resilience::BreakerState::Open
        );

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let events = sink.events();
        assert!(events.iter().any(|event| event.state == "rate_limited"));
        assert!(events.iter().any(|event| event.state == "service_degraded"));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_provider_failure_is_unrecoverable() {
        let session = Arc::new(ScriptedSession::new(
            "https://example.com",
            "<html><body><button id=\"go\">Go</button></body></html>",
        ));
        session.add_element("#go", ScriptedElement::visible_button("Go"));

        let model = Arc::new(ScriptedModel::new());
        model.queue_json(ModelTask::CookieBanner, json_value!({ "is_cookie_banner": false }));
        model.queue_reply(ModelTask::ActionGeneration, ScriptedReply::Status(401));

        let (engine, _) = engine_with(model, session);
        let report = engine.run(descriptor(TestMode::Guest, UserTier::Pro)).await;
        assert_eq!(report.outcome, RunOutcome::FailedUnrecoverable);
        let explanation = report.summary.failure_explanation.expect("explanation");
        assert!(explanation.root_cause.contains("401"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_the_run() {
        let session = Arc::new(ScriptedSession::new(
            "https://example.com",
            "<html><body><button id=\"go\">Go</button></body></html>",
        ));
        session.add_element("#go", ScriptedElement::visible_button("Go"));
        let model = Arc::new(ScriptedModel::new());
        model.queue_json(ModelTask::CookieBanner, json_value!({ "is_cookie_banner": false }));

        let (engine, _) = engine_with(model, session);
        let cancel: RunCancellation = Arc::new(AtomicBool::new(true));
        let report = engine
            .run_with_cancel(descriptor(TestMode::Guest, UserTier::Pro), cancel)
            .await;
        assert_eq!(report.outcome, RunOutcome::Abandoned);
        assert_eq!(report.summary.steps_attempted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_descriptor_fails_without_browser_work() {
        let session = Arc::new(ScriptedSession::new("https://example.com", "<html></html>"));
        let model = Arc::new(ScriptedModel::new());
        let (engine, _) = engine_with(model, Arc::clone(&session));

        let mut bad = descriptor(TestMode::Guest, UserTier::Pro);
        bad.target_urls = vec!["ftp://nope".to_string()];
        let report = engine.run(bad).await;
        assert_eq!(report.outcome, RunOutcome::FailedUnrecoverable);
        assert!(session.navigations().is_empty());
    }
}
