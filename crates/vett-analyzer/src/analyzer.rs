use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use vett_ai::{ModelCall, ModelClient, ModelError, VisionCall};
use vett_budget::{budget_for_task, build_bounded_prompt, PromptContext};
use vett_contract::{InteractiveElement, ModelTask, VisionContext};
use vett_core::{current_unix_timestamp_ms, env_var_bool, truncate_chars};

use crate::extract::{extract_interactive_elements, ExtractionLimits};
use crate::reports::{ContextSynthesis, ErrorAnalysis, SynthesisInput, TestabilityReport};

/// Elements included in a vision-validation prompt.
const VISION_VALIDATION_ELEMENT_CAP: usize = 30;

#[derive(Debug, Clone)]
/// Analyzer configuration, resolved once at engine start.
pub struct AnalyzerConfig {
    pub limits: ExtractionLimits,
    pub vision_validation_enabled: bool,
}

impl AnalyzerConfig {
    pub fn from_env() -> Self {
        Self {
            limits: ExtractionLimits::from_env(),
            vision_validation_enabled: env_var_bool("ENABLE_VISION_VALIDATION", true),
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self { limits: ExtractionLimits::default(), vision_validation_enabled: true }
    }
}

/// Turns DOM snapshots into vision contexts and produces the diagnosis-side
/// analyses (testability, error, synthesis).
pub struct PageAnalyzer {
    model: Arc<dyn ModelClient>,
    config: AnalyzerConfig,
}

impl PageAnalyzer {
    pub fn new(model: Arc<dyn ModelClient>, config: AnalyzerConfig) -> Self {
        Self { model, config }
    }

    /// Builds the vision context for a page. When vision validation is
    /// enabled and a screenshot is supplied, the top elements are checked
    /// for visibility and the context filtered to confirmed-visible ones.
    pub async fn analyze_page(
        &self,
        url: &str,
        html: &str,
        screenshot: Option<&[u8]>,
        vision_enabled: bool,
    ) -> VisionContext {
        let (mut elements, accessibility, total) =
            extract_interactive_elements(html, self.config.limits);

        let mut vision_validated = false;
        if vision_enabled && self.config.vision_validation_enabled && !elements.is_empty() {
            if let Some(image) = screenshot {
                match self.validate_with_vision(&mut elements, image).await {
                    Ok(validated) => vision_validated = validated,
                    Err(error) => {
                        warn!(url, %error, "vision validation failed, keeping DOM-only context");
                    }
                }
            }
        }

        if vision_validated && elements.iter().any(|element| element.vision_visible == Some(true)) {
            elements.retain(|element| element.vision_visible == Some(true));
        }

        VisionContext {
            url: url.to_string(),
            elements,
            accessibility,
            total_elements_found: total,
            vision_validated,
            captured_unix_ms: current_unix_timestamp_ms(),
        }
    }

    async fn validate_with_vision(
        &self,
        elements: &mut [InteractiveElement],
        screenshot: &[u8],
    ) -> Result<bool, ModelError> {
        let listing = elements
            .iter()
            .take(VISION_VALIDATION_ELEMENT_CAP)
            .enumerate()
            .map(|(index, element)| {
                format!(
                    "{index}: {} \"{}\" ({})",
                    element.element_type,
                    truncate_chars(&element.text, 40),
                    element.selector
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "For each listed element, report whether it is visible and interactable in the \
             screenshot. Also report overall page state.\n\nElements:\n{listing}\n\n\
             Reply as JSON: {{\"elements\":[{{\"index\":0,\"visible\":true,\"interactable\":true}}],\
             \"page_state\":{{\"overlay_visible\":false,\"modal_visible\":false,\"loaded\":true}}}}"
        );
        let reply = self
            .model
            .complete_with_vision(VisionCall {
                image_png: screenshot.to_vec(),
                prompt,
                system: "You validate web page elements against a screenshot. Reply with JSON only."
                    .to_string(),
                task: ModelTask::VisionValidation,
                expect_json: true,
            })
            .await?;

        let Some(json) = reply.json else {
            return Ok(false);
        };
        let Some(entries) = json.get("elements").and_then(Value::as_array) else {
            return Ok(false);
        };
        for entry in entries {
            let Some(index) = entry.get("index").and_then(Value::as_u64) else {
                continue;
            };
            let Some(element) = elements.get_mut(index as usize) else {
                continue;
            };
            element.vision_visible = entry.get("visible").and_then(Value::as_bool);
            element.vision_interactable = entry.get("interactable").and_then(Value::as_bool);
        }
        if let Some(state) = json.get("page_state") {
            debug!(target: "vett::analyzer", page_state = %state, "vision page state");
        }
        Ok(true)
    }

    /// Produces the testability narrative and component lists for diagnosis.
    /// A non-JSON model reply is retried once, then the deterministic
    /// fallback is used.
    pub async fn analyze_testability(
        &self,
        context: &VisionContext,
    ) -> Result<TestabilityReport, ModelError> {
        let base = "Assess how testable this page is. Reply as JSON with keys: \
                    what, how, why, result, testable, non_testable, high_risk. \
                    The first four are paragraph strings; the rest are arrays of component names.";
        let prompt_ctx = PromptContext {
            goal: format!("Diagnose testability of {}", context.url),
            elements: element_listing(context),
            history: Vec::new(),
            dom: String::new(),
        };
        let budget = budget_for_task(ModelTask::Testability);
        let prompt = match build_bounded_prompt(base, &prompt_ctx, budget) {
            Ok(prompt) => prompt,
            Err(error) => {
                warn!(%error, "testability prompt over budget, using fallback");
                return Ok(fallback_testability(context));
            }
        };

        for _ in 0..2 {
            let reply = self
                .model
                .complete(
                    ModelCall::new(prompt.clone(), analysis_system(), ModelTask::Testability)
                        .expecting_json(),
                )
                .await?;
            if let Some(json) = reply.json {
                return Ok(parse_testability(&json, context));
            }
            debug!("testability reply was not JSON, retrying once");
        }
        Ok(fallback_testability(context))
    }

    /// Root-cause + prioritized fixes for a step error.
    pub async fn analyze_error(
        &self,
        error: &str,
        context_summary: &str,
    ) -> Result<ErrorAnalysis, ModelError> {
        let base = "Analyze this web test failure. Reply as JSON: \
                    {\"root_cause\": string, \"fixes\": [string, ...]} with fixes ordered by priority.";
        let prompt_ctx = PromptContext {
            goal: error.to_string(),
            elements: context_summary.to_string(),
            history: Vec::new(),
            dom: String::new(),
        };
        let budget = budget_for_task(ModelTask::ErrorAnalysis);
        let Ok(prompt) = build_bounded_prompt(base, &prompt_ctx, budget) else {
            return Ok(fallback_error_analysis(error));
        };

        for _ in 0..2 {
            let reply = self
                .model
                .complete(
                    ModelCall::new(prompt.clone(), analysis_system(), ModelTask::ErrorAnalysis)
                        .expecting_json(),
                )
                .await?;
            if let Some(json) = reply.json {
                return Ok(ErrorAnalysis {
                    root_cause: string_field(&json, "root_cause")
                        .unwrap_or_else(|| error.to_string()),
                    fixes: string_list(&json, "fixes"),
                    from_fallback: false,
                });
            }
        }
        Ok(fallback_error_analysis(error))
    }

    /// Summarizes page state from DOM plus console/network signals.
    pub async fn synthesize_context(
        &self,
        input: SynthesisInput,
    ) -> Result<ContextSynthesis, ModelError> {
        let base = "Synthesize the current page state for a web test agent. Reply as JSON: \
                    {\"summary\": string, \"issues\": [string], \"recommendations\": [string]}.";
        let mut history = input.console_logs.clone();
        history.extend(input.network_errors.iter().map(|error| format!("network: {error}")));
        let prompt_ctx = PromptContext {
            goal: input.goal.clone(),
            elements: String::new(),
            history,
            dom: input.dom.clone(),
        };
        let budget = budget_for_task(ModelTask::Synthesis);
        let Ok(prompt) = build_bounded_prompt(base, &prompt_ctx, budget) else {
            return Ok(fallback_synthesis(&input));
        };

        for _ in 0..2 {
            let reply = self
                .model
                .complete(
                    ModelCall::new(prompt.clone(), analysis_system(), ModelTask::Synthesis)
                        .expecting_json(),
                )
                .await?;
            if let Some(json) = reply.json {
                return Ok(ContextSynthesis {
                    summary: string_field(&json, "summary").unwrap_or_default(),
                    issues: string_list(&json, "issues"),
                    recommendations: string_list(&json, "recommendations"),
                    from_fallback: false,
                });
            }
        }
        Ok(fallback_synthesis(&input))
    }
}

fn analysis_system() -> String {
    "You analyze web pages for an autonomous UI test runner. Reply with JSON only.".to_string()
}

fn element_listing(context: &VisionContext) -> String {
    context
        .elements
        .iter()
        .map(|element| {
            format!(
                "- {} \"{}\" selector={} hidden={}",
                element.element_type, element.text, element.selector, element.is_hidden
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn string_field(json: &Value, key: &str) -> Option<String> {
    json.get(key).and_then(Value::as_str).map(str::to_string)
}

fn string_list(json: &Value, key: &str) -> Vec<String> {
    json.get(key)
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_testability(json: &Value, context: &VisionContext) -> TestabilityReport {
    let section = |key: &str| string_field(json, key).unwrap_or_default();
    let narrative = format!(
        "What\n{}\n\nHow\n{}\n\nWhy\n{}\n\nResult\n{}",
        section("what"),
        section("how"),
        section("why"),
        section("result"),
    );
    let mut report = TestabilityReport {
        narrative,
        testable: string_list(json, "testable"),
        non_testable: string_list(json, "non_testable"),
        high_risk: string_list(json, "high_risk"),
        from_fallback: false,
    };
    if report.testable.is_empty() && report.non_testable.is_empty() {
        // Model omitted the structured lists; derive them from the context.
        report.testable = fallback_testability(context).testable;
    }
    report
}

fn fallback_testability(context: &VisionContext) -> TestabilityReport {
    let buttons = context
        .elements
        .iter()
        .filter(|element| element.element_type.starts_with("button"))
        .count();
    let inputs = context
        .elements
        .iter()
        .filter(|element| element.element_type.starts_with("input") && !element.is_hidden)
        .count();
    let links = context.elements.iter().filter(|element| element.element_type == "a").count();
    let narrative = format!(
        "What\nThe page at {} exposes {} interactive elements ({} buttons, {} inputs, {} links).\n\n\
         How\nElements were extracted deterministically from the DOM snapshot; no model analysis \
         was available.\n\n\
         Why\nInteractive density and labeled controls indicate which flows can be exercised \
         automatically.\n\n\
         Result\n{}",
        context.url,
        context.elements.len(),
        buttons,
        inputs,
        links,
        if context.elements.is_empty() {
            "No interactive elements were found; the page is not automatically testable."
        } else {
            "Clickable and fillable controls are present; basic interaction flows are testable."
        }
    );
    let testable: Vec<String> = context
        .elements
        .iter()
        .filter(|element| !element.is_hidden)
        .take(10)
        .map(|element| element.selector.clone())
        .collect();
    let non_testable: Vec<String> = context
        .elements
        .iter()
        .filter(|element| element.is_hidden)
        .take(10)
        .map(|element| element.selector.clone())
        .collect();
    let high_risk: Vec<String> = context
        .accessibility
        .issues
        .iter()
        .take(5)
        .map(|issue| issue.selector.clone())
        .collect();
    TestabilityReport { narrative, testable, non_testable, high_risk, from_fallback: true }
}

fn fallback_error_analysis(error: &str) -> ErrorAnalysis {
    let lowered = error.to_ascii_lowercase();
    let (root_cause, fixes) = if lowered.contains("timeout") {
        (
            "The operation timed out before the page responded.".to_string(),
            vec![
                "Increase the action timeout for slow pages".to_string(),
                "Wait for network idle before interacting".to_string(),
            ],
        )
    } else if lowered.contains("not found") || lowered.contains("no element") {
        (
            "The target selector did not match any element.".to_string(),
            vec![
                "Verify the selector against the current DOM".to_string(),
                "Use a text- or role-based selector instead".to_string(),
            ],
        )
    } else {
        (
            format!("Unclassified step failure: {}", truncate_chars(error, 160)),
            vec!["Capture a screenshot and inspect the page state".to_string()],
        )
    };
    ErrorAnalysis { root_cause, fixes, from_fallback: true }
}

fn fallback_synthesis(input: &SynthesisInput) -> ContextSynthesis {
    let mut issues = Vec::new();
    if !input.network_errors.is_empty() {
        issues.push(format!("{} network errors observed", input.network_errors.len()));
    }
    let console_errors = input
        .console_logs
        .iter()
        .filter(|line| line.to_ascii_lowercase().contains("error"))
        .count();
    if console_errors > 0 {
        issues.push(format!("{console_errors} console errors observed"));
    }
    ContextSynthesis {
        summary: format!(
            "Page snapshot of {} characters toward goal \"{}\".",
            input.dom.len(),
            truncate_chars(&input.goal, 80)
        ),
        issues,
        recommendations: vec!["Proceed with deterministic element extraction".to_string()],
        from_fallback: true,
    }
}
