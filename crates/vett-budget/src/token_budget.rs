//! Bounded-by-construction prompts.
//!
//! Every model prompt the engine builds goes through [`build_bounded_prompt`];
//! nothing concatenates DOM or history ad hoc. The 4-chars-per-token estimate
//! is treated as a conservative upper bound.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

use vett_contract::ModelTask;

/// Tokens reserved for the base prompt's framing and section headers.
const STRUCTURE_RESERVE_TOKENS: usize = 200;
/// Fail-fast margin: the base prompt must leave at least this much room.
const BASE_MARGIN_TOKENS: usize = 100;
const GOAL_CAP_TOKENS: usize = 200;
/// Truncation may cut back to this fraction of the limit to end on a tag.
const TAG_BOUNDARY_FRACTION: f64 = 0.9;

/// Per-call-type prompt budgets, in tokens.
pub fn budget_for_task(task: ModelTask) -> usize {
    match task {
        ModelTask::Planning => 3_000,
        ModelTask::Diagnosis => 3_000,
        ModelTask::Testability => 2_500,
        ModelTask::ActionGeneration => 2_000,
        ModelTask::CookieBanner => 1_500,
        ModelTask::ErrorAnalysis => 2_000,
        ModelTask::Healing => 2_000,
        ModelTask::Synthesis => 2_500,
        ModelTask::Summary => 2_000,
        ModelTask::VisionValidation => 2_000,
    }
}

/// ~4 characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

fn script_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<script\b.*?</script>").expect("script regex"))
}

fn style_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<style\b.*?</style>").expect("style regex"))
}

fn comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").expect("comment regex"))
}

/// Strips script/style/comments, collapses whitespace, and truncates to the
/// last tag boundary at or past 90% of the limit. Idempotent.
pub fn prune_dom(html: &str, max_chars: usize) -> String {
    let without_scripts = script_re().replace_all(html, " ");
    let without_styles = style_re().replace_all(&without_scripts, " ");
    let without_comments = comment_re().replace_all(&without_styles, " ");
    let collapsed = without_comments.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.len() <= max_chars {
        return collapsed;
    }

    let floor = ((max_chars as f64) * TAG_BOUNDARY_FRACTION) as usize;
    let window = &collapsed[..collapsed
        .char_indices()
        .take_while(|(index, _)| *index <= max_chars)
        .last()
        .map(|(index, c)| index + c.len_utf8())
        .unwrap_or(0)
        .min(collapsed.len())];
    match window.rfind('>') {
        Some(position) if position + 1 >= floor => window[..=position].to_string(),
        _ => window.to_string(),
    }
}

/// Keeps the last `n` entries.
pub fn limit_history<T: Clone>(entries: &[T], n: usize) -> Vec<T> {
    let start = entries.len().saturating_sub(n);
    entries[start..].to_vec()
}

#[derive(Debug, Error, PartialEq, Eq)]
/// Prompt-construction failures.
pub enum TokenBudgetError {
    #[error("base prompt ({base_tokens} tokens) exceeds budget {budget_tokens} minus margin")]
    BaseTooLarge { base_tokens: usize, budget_tokens: usize },
}

#[derive(Debug, Clone, Default)]
/// Variable sections of a bounded prompt.
pub struct PromptContext {
    pub goal: String,
    pub elements: String,
    pub history: Vec<String>,
    pub dom: String,
}

/// Builds a prompt guaranteed to estimate at or under `budget_tokens`.
///
/// Allocation after the structure reserve: goal ≤ 200 tokens, elements ≤ 50%
/// of the remainder, history ≤ 20% (tail kept for recency), DOM gets the
/// rest. Truncation is deterministic: elements keep their start, history its
/// end.
pub fn build_bounded_prompt(
    base: &str,
    ctx: &PromptContext,
    budget_tokens: usize,
) -> Result<String, TokenBudgetError> {
    let base_tokens = estimate_tokens(base);
    if base_tokens + BASE_MARGIN_TOKENS > budget_tokens {
        return Err(TokenBudgetError::BaseTooLarge { base_tokens, budget_tokens });
    }

    let available = budget_tokens
        .saturating_sub(STRUCTURE_RESERVE_TOKENS)
        .saturating_sub(base_tokens);

    let goal_tokens = available.min(GOAL_CAP_TOKENS);
    let goal = head_chars(&ctx.goal, goal_tokens * 4);
    let after_goal = available.saturating_sub(estimate_tokens(&goal));

    let elements_tokens = after_goal / 2;
    let elements = head_chars(&ctx.elements, elements_tokens * 4);
    let after_elements = after_goal.saturating_sub(estimate_tokens(&elements));

    let history_tokens = after_goal / 5;
    let history_joined = ctx.history.join("\n");
    let history = tail_chars(&history_joined, history_tokens.min(after_elements) * 4);
    let after_history = after_elements.saturating_sub(estimate_tokens(&history));

    let dom = prune_dom(&ctx.dom, after_history.saturating_mul(4));

    let mut prompt = String::with_capacity(budget_tokens * 4);
    prompt.push_str(base);
    if !goal.is_empty() {
        prompt.push_str("\n\nGoal:\n");
        prompt.push_str(&goal);
    }
    if !elements.is_empty() {
        prompt.push_str("\n\nInteractive elements:\n");
        prompt.push_str(&elements);
    }
    if !history.is_empty() {
        prompt.push_str("\n\nRecent history:\n");
        prompt.push_str(&history);
    }
    if !dom.is_empty() {
        prompt.push_str("\n\nPage DOM (pruned):\n");
        prompt.push_str(&dom);
    }
    Ok(prompt)
}

fn head_chars(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    let end = text
        .char_indices()
        .take_while(|(index, _)| *index < max_chars)
        .last()
        .map(|(index, c)| index + c.len_utf8())
        .unwrap_or(0);
    text[..end].to_string()
}

fn tail_chars(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    let start = text.len() - max_chars;
    let start = text
        .char_indices()
        .map(|(index, _)| index)
        .find(|index| *index >= start)
        .unwrap_or(text.len());
    text[start..].to_string()
}
