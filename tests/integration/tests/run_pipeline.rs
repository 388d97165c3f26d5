//! End-to-end pipeline scenarios driven through the full engine with a
//! scripted browser and a scripted model.

use std::sync::Arc;

use serde_json::json;
use vett_ai::scripted::{ScriptedModel, ScriptedReply};
use vett_browser::scripted::{ScriptedElement, ScriptedEffect, ScriptedSession};
use vett_contract::{
    CookieOutcome, CookieStrategy, HealingKind, ModelTask, RunOutcome, StepOutcome, UserTier,
};
use vett_integration_tests::{descriptor, engine_with};
use vett_resilience::{services, BreakerState};

fn queue_complete(model: &ScriptedModel) {
    model.queue_json(
        ModelTask::ActionGeneration,
        json!({ "action": "complete", "description": "nothing left to test", "confidence": 0.9 }),
    );
}

#[tokio::test(start_paused = true)]
async fn heuristic_cookie_accept_resolves_cleanly() {
    let session = Arc::new(ScriptedSession::new(
        "https://example.de",
        "<html lang=\"de\"><body><button id=\"onetrust-accept-btn-handler\">Alle akzeptieren</button></body></html>",
    ));
    session.add_element(
        "#onetrust-accept-btn-handler",
        ScriptedElement::visible_button("Alle akzeptieren"),
    );
    session.queue_effects(
        "#onetrust-accept-btn-handler",
        vec![ScriptedEffect::HideElement("#onetrust-accept-btn-handler".into())],
    );

    let model = Arc::new(ScriptedModel::new());
    queue_complete(&model);

    let (engine, _) = engine_with(model.clone(), Arc::clone(&session));
    let report = engine.run(descriptor("https://example.de", UserTier::Pro)).await;

    let preflight = report.preflight.expect("preflight result");
    assert!(preflight.success);
    assert_eq!(preflight.cookie.outcome, CookieOutcome::Resolved);
    assert_eq!(preflight.cookie.strategy, Some(CookieStrategy::AcceptAll));
    assert_eq!(preflight.cookie.selectors_attempted, vec!["#onetrust-accept-btn-handler"]);
    assert_eq!(preflight.popups_resolved, 0);
    // The heuristic path needed no model help for the banner.
    assert_eq!(model.calls_for_task(ModelTask::CookieBanner), 0);
    assert_eq!(report.outcome, RunOutcome::Completed);
}

#[tokio::test(start_paused = true)]
async fn ai_classified_banner_with_dom_ambiguity_uses_one_vision_check() {
    let session = Arc::new(ScriptedSession::new(
        "https://example.com",
        "<html><body><button class=\"cc-accept-custom\">OK</button></body></html>",
    ));
    session.add_element("button.cc-accept-custom", ScriptedElement::visible_button("OK"));
    // The marker never leaves the DOM, just the viewport: ambiguous.
    session.add_element(
        ".cookie-banner",
        ScriptedElement::visible_button("We value your privacy").out_of_viewport(),
    );

    let model = Arc::new(ScriptedModel::new());
    model.queue_json(
        ModelTask::CookieBanner,
        json!({
            "is_cookie_banner": true,
            "banner_type": "custom",
            "strategy": "accept_all",
            "primary_selectors": ["button.cc-accept-custom"],
            "fallback_selectors": [],
            "max_steps": 1,
            "confidence": 0.9,
        }),
    );
    model.queue_json(ModelTask::VisionValidation, json!({ "banner_visible": false }));
    queue_complete(&model);

    let (engine, _) = engine_with(model.clone(), session);
    let report = engine.run(descriptor("https://example.com", UserTier::Pro)).await;

    let preflight = report.preflight.expect("preflight result");
    assert_eq!(preflight.cookie.outcome, CookieOutcome::Resolved);
    assert_eq!(preflight.cookie.steps_executed, 1);
    assert_eq!(model.vision_call_count(), 1);
    assert_eq!(model.calls_for_task(ModelTask::CookieBanner), 1);
    assert_eq!(report.outcome, RunOutcome::Completed);
}

#[tokio::test(start_paused = true)]
async fn blocking_newsletter_modal_after_cookie_is_dismissed() {
    let session = Arc::new(ScriptedSession::new(
        "https://example.com",
        "<html><body><button id=\"onetrust-accept-btn-handler\">Accept</button></body></html>",
    ));
    session.add_element(
        "#onetrust-accept-btn-handler",
        ScriptedElement::visible_button("Accept"),
    );
    session.queue_effects(
        "#onetrust-accept-btn-handler",
        vec![ScriptedEffect::HideElement("#onetrust-accept-btn-handler".into())],
    );
    session.add_element(
        "[role=dialog]",
        ScriptedElement::visible_button("Subscribe to our newsletter").with_bounds(
            vett_contract::Bounds { x: 140.0, y: 90.0, width: 1_000.0, height: 380.0 },
        ),
    );
    session.queue_effects("Escape", vec![ScriptedEffect::HideElement("[role=dialog]".into())]);

    let model = Arc::new(ScriptedModel::new());
    queue_complete(&model);

    let (engine, _) = engine_with(model, Arc::clone(&session));
    let report = engine.run(descriptor("https://example.com", UserTier::Pro)).await;

    let preflight = report.preflight.expect("preflight result");
    assert_eq!(preflight.cookie.outcome, CookieOutcome::Resolved);
    assert_eq!(preflight.popups_resolved, 1);
    assert_eq!(report.summary.popups_resolved, 1);
    assert_eq!(session.keys(), vec!["Escape"]);
    assert_eq!(report.outcome, RunOutcome::Completed);
}

#[tokio::test(start_paused = true)]
async fn guest_budget_exhaustion_stops_the_run_mid_loop() {
    let session = Arc::new(ScriptedSession::new(
        "https://example.com",
        "<html><body><button id=\"go\">Go</button></body></html>",
    ));
    session.add_element("#go", ScriptedElement::visible_button("Go"));

    let model = Arc::new(ScriptedModel::new());
    model.queue_json(ModelTask::CookieBanner, json!({ "is_cookie_banner": false }));
    model.queue_json(
        ModelTask::ActionGeneration,
        json!({ "action": "click", "selector": "#go", "description": "go", "confidence": 0.9 }),
    );

    let (engine, _) = engine_with(model.clone(), session);
    // Guest cap is 10 LLM calls; 8 are already spent, the cookie classifier
    // takes the 9th and the planner the 10th.
    engine.budget().get_or_create("01JPARENT000000000000000", UserTier::Guest, None);
    for _ in 0..8 {
        engine.budget().record_llm_call("01JPARENT000000000000000");
    }

    let report = engine.run(descriptor("https://example.com", UserTier::Guest)).await;

    assert_eq!(report.outcome, RunOutcome::CompletedWithLimits);
    assert_eq!(report.summary.steps_attempted, 1);
    assert_eq!(report.summary.steps_succeeded, 1);
    assert_eq!(
        engine.budget().state("01JPARENT000000000000000"),
        Some(vett_budget::BudgetState::Exhausted)
    );
    // Step 2 never reached the model.
    assert_eq!(model.calls_for_task(ModelTask::ActionGeneration), 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_cascade_opens_the_breaker_and_fails_fast() {
    let session = Arc::new(ScriptedSession::new(
        "https://example.com",
        "<html><body><button id=\"go\">Go</button></body></html>",
    ));
    session.add_element("#go", ScriptedElement::visible_button("Go"));

    let model = Arc::new(ScriptedModel::new());
    model.queue_json(ModelTask::CookieBanner, json!({ "is_cookie_banner": false }));
    for _ in 0..10 {
        model.queue_reply(ModelTask::ActionGeneration, ScriptedReply::Status(429));
    }

    let (engine, sink) = engine_with(model.clone(), session);
    let report = engine.run(descriptor("https://example.com", UserTier::Pro)).await;

    assert_eq!(report.outcome, RunOutcome::FailedRecoverable);
    assert_eq!(engine.breakers().state(services::TEXT_MODEL), BreakerState::Open);
    // Five consecutive failures tripped the breaker; the remaining queued
    // errors were never consumed.
    assert_eq!(model.calls_for_task(ModelTask::ActionGeneration), 5);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let events = sink.events();
    assert!(events.iter().any(|event| event.state == "rate_limited"));
    assert!(events.iter().any(|event| event.state == "service_degraded"));
}

#[tokio::test(start_paused = true)]
async fn failed_click_heals_through_alternative_selector() {
    let session = Arc::new(ScriptedSession::new(
        "https://example.com",
        "<html><body><button>Buy now</button></body></html>",
    ));
    // `button#buy` does not exist; the text selector does.
    session.add_element("text=Buy now", ScriptedElement::visible_button("Buy now"));

    let model = Arc::new(ScriptedModel::new());
    model.queue_json(ModelTask::CookieBanner, json!({ "is_cookie_banner": false }));
    model.queue_json(
        ModelTask::ActionGeneration,
        json!({ "action": "click", "selector": "button#buy", "description": "press buy", "confidence": 0.9 }),
    );
    model.queue_json(
        ModelTask::Healing,
        json!({ "alternatives": [
            { "selector": "text=Buy now", "strategy": "text", "confidence": 0.9 },
            { "selector": "[role=button]", "strategy": "role", "confidence": 0.75 },
        ]}),
    );
    queue_complete(&model);

    let (engine, _) = engine_with(model, Arc::clone(&session));
    let report = engine.run(descriptor("https://example.com", UserTier::Pro)).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    let healed_step = &report.steps[0];
    assert_eq!(healed_step.outcome, StepOutcome::Healed);
    let healing = healed_step.healing.as_ref().expect("healing metadata");
    assert_eq!(healing.kind, HealingKind::AlternativeSelector);
    assert_eq!(healing.original_selector, "button#buy");
    assert_eq!(healing.healed_selector, "text=Buy now");
    assert_eq!(healing.attempts, 2);
    assert_eq!(report.summary.steps_healed, 1);
}
