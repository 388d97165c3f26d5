//! The sealed cookie consent state machine.
//!
//! All cookie logic lives here: detection, classification, resolution,
//! verification, and the retry limit. No other code may click consent UI or
//! advance cookie status; the registry's mutators are crate-private and this
//! module is the only caller on the cookie side.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use vett_ai::{ModelCall, ModelClient, VisionCall};
use vett_analyzer::{extract_interactive_elements, ExtractionLimits};
use vett_browser::BrowserSession;
use vett_budget::{budget_for_task, build_bounded_prompt, AiBudgetStore, PromptContext};
use vett_contract::{
    CookieOutcome, CookieResolution, CookieStrategy, InvariantViolation, ModelTask,
};
use vett_core::bounded_interval_ms;

use crate::status::StatusRegistry;

/// Hard cap on executed resolution attempts per page.
const MAX_RESOLUTION_ATTEMPTS: u32 = 2;
/// Elements offered to the AI classifier.
const AI_CONTEXT_ELEMENT_CAP: usize = 50;
/// Settle time after a heuristic click.
const HEURISTIC_SETTLE_MS: u64 = 500;
/// Visible cookie-element samples kept in a failure report.
const FAILURE_SAMPLE_CAP: usize = 5;

const WORDPRESS_SELECTORS: &[&str] = &[
    "#cookie_action_close_header",
    ".cli-accept-all-btn",
    "#wt-cli-accept-all-btn",
];
const SHOPIFY_SELECTORS: &[&str] = &["#shopify-pc__banner__btn-accept", ".cookie-bar__accept"];
const WEBFLOW_SELECTORS: &[&str] = &[".fs-cc-allow", "#cookie-accept"];

const EU_SELECTORS: &[&str] = &[
    "#onetrust-accept-btn-handler",
    "#didomi-notice-agree-button",
    ".qc-cmp2-summary-buttons button[mode=\"primary\"]",
    "#CybotCookiebotDialogBodyLevelButtonLevelOptinAllowAll",
    ".osano-cm-accept-all",
];
const UK_SELECTORS: &[&str] = &["#ccc-notify-accept", ".cookie-control-accept"];
const US_SELECTORS: &[&str] = &["#truste-consent-button", ".cc-allow"];

const UNIVERSAL_SELECTORS: &[&str] = &[
    "#onetrust-accept-btn-handler",
    ".cc-accept",
    ".cc-allow",
    "#accept-cookies",
    ".accept-cookies",
    "button[aria-label=\"Accept cookies\"]",
    "#cookie-accept-all",
];

/// Selectors used to judge whether consent UI is still on screen.
pub(crate) const COOKIE_MARKER_SELECTORS: &[&str] = &[
    "#onetrust-banner-sdk",
    "#onetrust-consent-sdk",
    ".cookie-banner",
    "#cookie-banner",
    ".cookie-consent",
    "#cookie-consent",
    ".cookie-notice",
    ".cc-window",
    ".cc-banner",
    "#didomi-host",
    ".qc-cmp2-container",
    "#CybotCookiebotDialog",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SitePlatform {
    WordPress,
    Shopify,
    Webflow,
    Custom,
}

impl SitePlatform {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::WordPress => "wordpress",
            Self::Shopify => "shopify",
            Self::Webflow => "webflow",
            Self::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SiteRegion {
    Eu,
    Uk,
    Us,
    Other,
}

impl SiteRegion {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Eu => "eu",
            Self::Uk => "uk",
            Self::Us => "us",
            Self::Other => "other",
        }
    }
}

pub(crate) fn detect_platform(html: &str) -> SitePlatform {
    let lowered = html.to_ascii_lowercase();
    if lowered.contains("wp-content") || lowered.contains("wp-includes") {
        return SitePlatform::WordPress;
    }
    if lowered.contains("cdn.shopify.com") || lowered.contains("shopify-section") {
        return SitePlatform::Shopify;
    }
    if lowered.contains("generator\" content=\"webflow") || lowered.contains("w-webflow") {
        return SitePlatform::Webflow;
    }
    SitePlatform::Custom
}

const EU_TLDS: &[&str] = &[
    ".de", ".fr", ".it", ".es", ".nl", ".pl", ".se", ".fi", ".pt", ".ie", ".at", ".be", ".dk",
    ".cz", ".eu",
];

pub(crate) fn detect_region(url: &str, html: &str) -> SiteRegion {
    let host = hostname(url);
    if host.ends_with(".uk") {
        return SiteRegion::Uk;
    }
    if EU_TLDS.iter().any(|tld| host.ends_with(tld)) {
        return SiteRegion::Eu;
    }
    let lowered = html.to_ascii_lowercase();
    if lowered.contains("og:locale\" content=\"en_gb") || lowered.contains("lang=\"en-gb\"") {
        return SiteRegion::Uk;
    }
    for lang in ["de", "fr", "it", "es", "nl", "pl", "sv", "fi", "pt", "da", "cs"] {
        if lowered.contains(&format!("lang=\"{lang}\"")) {
            return SiteRegion::Eu;
        }
    }
    if host.ends_with(".com") || host.ends_with(".us") {
        return SiteRegion::Us;
    }
    SiteRegion::Other
}

fn hostname(url: &str) -> String {
    url.trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
/// Record of a page the machine could not cleanly resolve, kept for offline
/// selector improvement. Only the hostname is stored, never the full URL.
pub struct CookieFailureReport {
    pub hostname: String,
    pub region: String,
    pub platform: String,
    pub selectors_attempted: Vec<String>,
    pub visible_samples: Vec<String>,
}

#[derive(Debug, Clone)]
struct CookiePlan {
    strategy: CookieStrategy,
    selectors: Vec<String>,
    max_steps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DomVerdict {
    Dismissed,
    Visible,
    Ambiguous,
}

/// Per-run sealed machine. A distinct instance per run prevents
/// attempted-selector and page-set leakage across runs.
pub(crate) struct CookieConsentMachine {
    model: Arc<dyn ModelClient>,
    budget: Arc<AiBudgetStore>,
    parent_run_id: String,
    clicked_selectors: HashSet<String>,
    pages_processed: HashSet<String>,
    ai_classified_pages: HashSet<String>,
    failure_reports: Vec<CookieFailureReport>,
}

impl CookieConsentMachine {
    pub(crate) fn new(
        model: Arc<dyn ModelClient>,
        budget: Arc<AiBudgetStore>,
        parent_run_id: impl Into<String>,
    ) -> Self {
        Self {
            model,
            budget,
            parent_run_id: parent_run_id.into(),
            clicked_selectors: HashSet::new(),
            pages_processed: HashSet::new(),
            ai_classified_pages: HashSet::new(),
            failure_reports: Vec::new(),
        }
    }

    pub(crate) fn failure_reports(&self) -> &[CookieFailureReport] {
        &self.failure_reports
    }

    /// Single entry point. Asserts the cookie status is untouched, marks it
    /// IN_PROGRESS, resolves, and marks it COMPLETED regardless of outcome.
    pub(crate) async fn resolve(
        &mut self,
        session: &dyn BrowserSession,
        url: &str,
        run_id: &str,
        registry: &StatusRegistry,
    ) -> Result<CookieResolution, InvariantViolation> {
        if self.pages_processed.contains(url) {
            return Ok(CookieResolution::blocked("already processed"));
        }
        registry.assert_cookie_handling_allowed(run_id, "cookie_machine")?;
        registry.advance_cookie_status(run_id, vett_contract::CookieStatus::InProgress)?;
        self.pages_processed.insert(url.to_string());

        let resolution = self.run_pipeline(session, url).await;
        registry.advance_cookie_status(run_id, vett_contract::CookieStatus::Completed)?;
        info!(
            run_id,
            outcome = resolution.outcome.as_str(),
            steps = resolution.steps_executed,
            "cookie machine finished"
        );
        Ok(resolution)
    }

    async fn run_pipeline(&mut self, session: &dyn BrowserSession, url: &str) -> CookieResolution {
        let html = match session.dom_snapshot().await {
            Ok(html) => html,
            Err(error) => {
                warn!(%error, "cookie machine could not snapshot the page");
                return CookieResolution::blocked(format!("dom snapshot failed: {error}"));
            }
        };
        let platform = detect_platform(&html);
        let region = detect_region(url, &html);
        debug!(platform = platform.as_str(), region = region.as_str(), "cookie detection context");

        let mut selectors_attempted: Vec<String> = Vec::new();
        let mut steps_executed = 0u32;

        // Heuristic fast path: prioritized selectors, platform first.
        if let Some(resolution) = self
            .heuristic_pass(session, platform, region, &mut selectors_attempted, &mut steps_executed)
            .await
        {
            return resolution;
        }

        // AI fallback classification, at most once per page.
        let plan = self.classify_with_ai(url, &html).await;
        let plan = match plan {
            AiClassification::NotBanner => {
                if steps_executed == 0
                    && self.dom_verify(session).await == DomVerdict::Dismissed
                {
                    return CookieResolution::not_present();
                }
                None
            }
            AiClassification::Plan(plan) => Some(plan),
            AiClassification::Unavailable => None,
        };

        if let Some(plan) = &plan {
            if let Some(resolution) = self
                .execute_plan(session, plan, &mut selectors_attempted, &mut steps_executed)
                .await
            {
                return resolution;
            }
        }

        // Nothing was clicked and no plan exists: decide on DOM evidence
        // alone rather than spend a vision call.
        if steps_executed == 0 && plan.is_none() {
            return match self.dom_verify(session).await {
                DomVerdict::Dismissed => CookieResolution::not_present(),
                _ => {
                    self.record_failure(session, url, platform, region, &selectors_attempted).await;
                    CookieResolution::blocked("banner detected but no resolution path")
                }
            };
        }

        // Final truth check: the DOM may lag behind a successful dismissal.
        match self.vision_banner_visible(session).await {
            Some(false) => {
                if steps_executed == 0 {
                    return CookieResolution::not_present();
                }
                CookieResolution {
                    outcome: CookieOutcome::Resolved,
                    strategy: plan.map(|plan| plan.strategy),
                    selectors_attempted,
                    steps_executed,
                    reason: Some("dom lagged; vision confirmed dismissal".to_string()),
                }
            }
            Some(true) => {
                self.record_failure(session, url, platform, region, &selectors_attempted).await;
                CookieResolution {
                    outcome: CookieOutcome::ResolvedWithDelay,
                    strategy: plan.map(|plan| plan.strategy),
                    selectors_attempted,
                    steps_executed,
                    reason: Some("banner still visible after all attempts".to_string()),
                }
            }
            None => match self.dom_verify(session).await {
                DomVerdict::Dismissed if steps_executed == 0 => CookieResolution::not_present(),
                DomVerdict::Dismissed => CookieResolution {
                    outcome: CookieOutcome::Resolved,
                    strategy: plan.map(|plan| plan.strategy),
                    selectors_attempted,
                    steps_executed,
                    reason: None,
                },
                _ => {
                    self.record_failure(session, url, platform, region, &selectors_attempted).await;
                    CookieResolution {
                        outcome: CookieOutcome::ResolvedWithDelay,
                        strategy: plan.map(|plan| plan.strategy),
                        selectors_attempted,
                        steps_executed,
                        reason: Some("banner state unresolved without vision budget".to_string()),
                    }
                }
            },
        }
    }

    fn candidate_selectors(platform: SitePlatform, region: SiteRegion) -> Vec<&'static str> {
        let mut candidates: Vec<&'static str> = Vec::new();
        candidates.extend(match platform {
            SitePlatform::WordPress => WORDPRESS_SELECTORS,
            SitePlatform::Shopify => SHOPIFY_SELECTORS,
            SitePlatform::Webflow => WEBFLOW_SELECTORS,
            SitePlatform::Custom => &[],
        });
        candidates.extend(match region {
            SiteRegion::Eu => EU_SELECTORS,
            SiteRegion::Uk => UK_SELECTORS,
            SiteRegion::Us => US_SELECTORS,
            SiteRegion::Other => &[],
        });
        candidates.extend(UNIVERSAL_SELECTORS);
        let mut seen = HashSet::new();
        candidates.retain(|selector| seen.insert(*selector));
        candidates
    }

    async fn heuristic_pass(
        &mut self,
        session: &dyn BrowserSession,
        platform: SitePlatform,
        region: SiteRegion,
        selectors_attempted: &mut Vec<String>,
        steps_executed: &mut u32,
    ) -> Option<CookieResolution> {
        for candidate in Self::candidate_selectors(platform, region) {
            if self.clicked_selectors.contains(candidate) {
                continue;
            }
            let Ok(Some(info)) = session.element_info(candidate).await else {
                continue;
            };
            if !info.visible || !info.enabled {
                continue;
            }

            self.clicked_selectors.insert(candidate.to_string());
            selectors_attempted.push(candidate.to_string());
            if !self.click_soft_then_force(session, candidate).await {
                continue;
            }
            *steps_executed += 1;
            sleep(Duration::from_millis(HEURISTIC_SETTLE_MS)).await;

            // Verification screenshot, then a visibility re-check.
            let _ = session.screenshot().await;
            let still_visible = matches!(
                session.element_info(candidate).await,
                Ok(Some(info)) if info.visible
            );
            if !still_visible {
                return Some(CookieResolution {
                    outcome: CookieOutcome::Resolved,
                    strategy: Some(CookieStrategy::AcceptAll),
                    selectors_attempted: selectors_attempted.clone(),
                    steps_executed: *steps_executed,
                    reason: None,
                });
            }
        }
        None
    }

    async fn click_soft_then_force(&self, session: &dyn BrowserSession, selector: &str) -> bool {
        match session.click(selector, false).await {
            Ok(()) => true,
            Err(soft_error) => match session.click(selector, true).await {
                Ok(()) => true,
                Err(force_error) => {
                    debug!(selector, %soft_error, %force_error, "cookie click failed");
                    false
                }
            },
        }
    }

    async fn classify_with_ai(&mut self, url: &str, html: &str) -> AiClassification {
        if !self.ai_classified_pages.insert(url.to_string()) {
            return AiClassification::Unavailable;
        }
        if self.budget.can_make_llm_call(&self.parent_run_id).is_err() {
            debug!("AI budget denies cookie classification");
            return AiClassification::Unavailable;
        }

        let limits = ExtractionLimits { dom_summary_limit: AI_CONTEXT_ELEMENT_CAP, accessibility_limit: 5 };
        let (elements, _, _) = extract_interactive_elements(html, limits);
        let listing = elements
            .iter()
            .map(|element| {
                format!("- {} \"{}\" selector={}", element.element_type, element.text, element.selector)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let base = "Decide whether this page shows a cookie consent banner and how to dismiss \
                    it. Reply as JSON: {\"is_cookie_banner\": bool, \"banner_type\": string, \
                    \"strategy\": \"accept_all|reject_all|preferences_flow\", \
                    \"primary_selectors\": [string], \"fallback_selectors\": [string], \
                    \"max_steps\": 1, \"confidence\": number} with at most 3 selectors per list \
                    and max_steps of 1 or 2.";
        let prompt_ctx = PromptContext {
            goal: String::new(),
            elements: listing,
            history: Vec::new(),
            dom: html.to_string(),
        };
        let Ok(prompt) = build_bounded_prompt(base, &prompt_ctx, budget_for_task(ModelTask::CookieBanner))
        else {
            return AiClassification::Unavailable;
        };

        let reply = self
            .model
            .complete(
                ModelCall::new(prompt, cookie_system(), ModelTask::CookieBanner).expecting_json(),
            )
            .await;
        self.budget.record_llm_call(&self.parent_run_id);
        let Ok(reply) = reply else {
            return AiClassification::Unavailable;
        };
        let Some(json) = reply.json else {
            return AiClassification::Unavailable;
        };

        if !json.get("is_cookie_banner").and_then(Value::as_bool).unwrap_or(false) {
            return AiClassification::NotBanner;
        }
        let mut selectors = selector_list(&json, "primary_selectors");
        selectors.extend(selector_list(&json, "fallback_selectors"));
        if selectors.is_empty() {
            return AiClassification::Unavailable;
        }
        let strategy = json
            .get("strategy")
            .and_then(Value::as_str)
            .and_then(CookieStrategy::parse)
            .unwrap_or(CookieStrategy::AcceptAll);
        let max_steps = json
            .get("max_steps")
            .and_then(Value::as_u64)
            .map(|steps| (steps as u32).clamp(1, MAX_RESOLUTION_ATTEMPTS))
            .unwrap_or(MAX_RESOLUTION_ATTEMPTS);
        AiClassification::Plan(CookiePlan { strategy, selectors, max_steps })
    }

    async fn execute_plan(
        &mut self,
        session: &dyn BrowserSession,
        plan: &CookiePlan,
        selectors_attempted: &mut Vec<String>,
        steps_executed: &mut u32,
    ) -> Option<CookieResolution> {
        let mut attempts = 0u32;
        let attempt_cap = plan.max_steps.min(MAX_RESOLUTION_ATTEMPTS);
        for selector in &plan.selectors {
            if attempts >= attempt_cap {
                break;
            }
            if self.clicked_selectors.contains(selector) {
                continue;
            }
            let Ok(Some(info)) = session.element_info(selector).await else {
                continue;
            };
            if !info.visible || !info.enabled || info.bounds.is_zero_size() || !info.in_viewport {
                continue;
            }

            self.clicked_selectors.insert(selector.clone());
            selectors_attempted.push(selector.clone());
            if !self.click_soft_then_force(session, selector).await {
                continue;
            }
            attempts += 1;
            *steps_executed += 1;
            sleep(Duration::from_millis(bounded_interval_ms(300, 800))).await;

            match self.dom_verify(session).await {
                DomVerdict::Dismissed => {
                    return Some(CookieResolution {
                        outcome: CookieOutcome::Resolved,
                        strategy: Some(plan.strategy),
                        selectors_attempted: selectors_attempted.clone(),
                        steps_executed: *steps_executed,
                        reason: None,
                    });
                }
                DomVerdict::Ambiguous => {
                    // One visual confirmation per click, never more.
                    if let Some(false) = self.vision_banner_visible(session).await {
                        return Some(CookieResolution {
                            outcome: CookieOutcome::Resolved,
                            strategy: Some(plan.strategy),
                            selectors_attempted: selectors_attempted.clone(),
                            steps_executed: *steps_executed,
                            reason: None,
                        });
                    }
                }
                DomVerdict::Visible => {}
            }
        }
        None
    }

    async fn dom_verify(&self, session: &dyn BrowserSession) -> DomVerdict {
        let mut ambiguous = false;
        for marker in COOKIE_MARKER_SELECTORS {
            let Ok(Some(info)) = session.element_info(marker).await else {
                continue;
            };
            if info.visible && !info.bounds.is_zero_size() {
                if info.in_viewport {
                    return DomVerdict::Visible;
                }
                ambiguous = true;
            }
        }
        if ambiguous {
            DomVerdict::Ambiguous
        } else {
            DomVerdict::Dismissed
        }
    }

    /// Binary "is a cookie banner visible?" vision check. Counts against the
    /// vision budget as a critical call; `None` when no budget or the check
    /// itself failed.
    async fn vision_banner_visible(&self, session: &dyn BrowserSession) -> Option<bool> {
        if self.budget.can_make_vision_call(&self.parent_run_id, true).is_err() {
            return None;
        }
        let screenshot = session.screenshot().await.ok()?;
        let reply = self
            .model
            .complete_with_vision(VisionCall {
                image_png: screenshot,
                prompt: "Is a cookie consent banner visible in this screenshot? Reply as JSON: \
                         {\"banner_visible\": true|false}."
                    .to_string(),
                system: cookie_system(),
                task: ModelTask::VisionValidation,
                expect_json: true,
            })
            .await;
        self.budget.record_vision_call(&self.parent_run_id);
        reply.ok()?.json?.get("banner_visible").and_then(Value::as_bool)
    }

    async fn record_failure(
        &mut self,
        session: &dyn BrowserSession,
        url: &str,
        platform: SitePlatform,
        region: SiteRegion,
        selectors_attempted: &[String],
    ) {
        let mut visible_samples = Vec::new();
        for marker in COOKIE_MARKER_SELECTORS {
            if visible_samples.len() >= FAILURE_SAMPLE_CAP {
                break;
            }
            if let Ok(Some(info)) = session.element_info(marker).await {
                if info.visible {
                    visible_samples.push(format!("{marker}: \"{}\"", info.text));
                }
            }
        }
        let report = CookieFailureReport {
            hostname: hostname(url),
            region: region.as_str().to_string(),
            platform: platform.as_str().to_string(),
            selectors_attempted: selectors_attempted.to_vec(),
            visible_samples,
        };
        warn!(
            hostname = %report.hostname,
            region = %report.region,
            platform = %report.platform,
            attempted = report.selectors_attempted.len(),
            "cookie resolution failed, recording for offline improvement"
        );
        self.failure_reports.push(report);
    }
}

enum AiClassification {
    Plan(CookiePlan),
    NotBanner,
    Unavailable,
}

fn cookie_system() -> String {
    "You resolve cookie consent banners for an autonomous web-UI test runner. \
     Reply with JSON only."
        .to_string()
}

fn selector_list(json: &Value, key: &str) -> Vec<String> {
    json.get(key)
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|selector| !selector.is_empty())
                .map(str::to_string)
                .take(3)
                .collect()
        })
        .unwrap_or_default()
}
