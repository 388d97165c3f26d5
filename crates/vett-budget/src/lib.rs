//! Budget managers for the Vett engine.
//!
//! `token_budget` bounds every model prompt by construction; `ai_budget`
//! enforces the tier-aware per-parent-run cap on LLM and vision calls.

pub mod ai_budget;
pub mod token_budget;

pub use ai_budget::{
    AiBudgetSnapshot, AiBudgetStore, BudgetDenied, BudgetState, TierCaps, AI_BUDGET_SCHEMA_VERSION,
};
pub use token_budget::{
    budget_for_task, build_bounded_prompt, estimate_tokens, limit_history, prune_dom,
    PromptContext, TokenBudgetError,
};
