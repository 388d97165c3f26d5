//! Tier-aware AI call budget, keyed by parent run and shared across the
//! sibling browser runs of that parent.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use vett_contract::UserTier;

pub const AI_BUDGET_SCHEMA_VERSION: u32 = 1;

/// LLM usage ratio at which the budget degrades.
const DEGRADE_USAGE_RATIO: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Per-tier call caps (LLM, vision).
pub struct TierCaps {
    pub max_llm_calls: u32,
    pub max_vision_calls: u32,
}

impl TierCaps {
    pub fn for_tier(tier: UserTier) -> Self {
        let (max_llm_calls, max_vision_calls) = match tier {
            UserTier::Guest => (10, 1),
            UserTier::Starter => (15, 2),
            UserTier::Indie => (20, 3),
            UserTier::Pro => (30, 5),
            UserTier::Agency => (30, 5),
        };
        Self { max_llm_calls, max_vision_calls }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
/// Budget lifecycle state, recomputed after every record.
pub enum BudgetState {
    Normal,
    Degraded,
    Exhausted,
}

impl BudgetState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Degraded => "DEGRADED",
            Self::Exhausted => "EXHAUSTED",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
/// Why a call was denied.
pub enum BudgetDenied {
    #[error("LLM budget exhausted ({used}/{max})")]
    LlmCapReached { used: u32, max: u32 },
    #[error("vision budget exhausted ({used}/{max})")]
    VisionCapReached { used: u32, max: u32 },
    #[error("budget state is EXHAUSTED")]
    StateExhausted,
    #[error("no budget exists for parent run '{0}'")]
    UnknownParentRun(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Persistable budget snapshot for worker-restart recovery.
pub struct AiBudgetSnapshot {
    pub schema_version: u32,
    pub parent_run_id: String,
    pub tier: UserTier,
    pub max_llm_calls: u32,
    pub max_vision_calls: u32,
    pub used_llm_calls: u32,
    pub used_vision_calls: u32,
    pub rate_limit_hits: u32,
    pub state: BudgetState,
}

#[derive(Debug, Clone)]
struct AiBudget {
    tier: UserTier,
    max_llm_calls: u32,
    max_vision_calls: u32,
    used_llm_calls: u32,
    used_vision_calls: u32,
    rate_limit_hits: u32,
    state: BudgetState,
}

impl AiBudget {
    fn new(tier: UserTier, overrides: Option<TierCaps>) -> Self {
        let caps = overrides.unwrap_or_else(|| TierCaps::for_tier(tier));
        Self {
            tier,
            max_llm_calls: caps.max_llm_calls,
            max_vision_calls: caps.max_vision_calls,
            used_llm_calls: 0,
            used_vision_calls: 0,
            rate_limit_hits: 0,
            state: BudgetState::Normal,
        }
    }

    fn recompute_state(&mut self) {
        self.state = if self.used_llm_calls >= self.max_llm_calls
            || self.used_vision_calls >= self.max_vision_calls
        {
            BudgetState::Exhausted
        } else if self.rate_limit_hits >= 1
            || self.used_llm_calls as f64 / self.max_llm_calls.max(1) as f64 >= DEGRADE_USAGE_RATIO
        {
            BudgetState::Degraded
        } else {
            BudgetState::Normal
        };
    }

    fn can_make_llm_call(&self) -> Result<(), BudgetDenied> {
        if self.state == BudgetState::Exhausted {
            return Err(BudgetDenied::StateExhausted);
        }
        if self.used_llm_calls >= self.max_llm_calls {
            return Err(BudgetDenied::LlmCapReached {
                used: self.used_llm_calls,
                max: self.max_llm_calls,
            });
        }
        Ok(())
    }

    fn can_make_vision_call(&self, critical: bool) -> Result<(), BudgetDenied> {
        if self.used_vision_calls >= self.max_vision_calls {
            return Err(BudgetDenied::VisionCapReached {
                used: self.used_vision_calls,
                max: self.max_vision_calls,
            });
        }
        // Critical vision calls may spend the remaining allocation even when
        // the overall state is EXHAUSTED.
        if !critical && self.state == BudgetState::Exhausted {
            return Err(BudgetDenied::StateExhausted);
        }
        Ok(())
    }
}

/// Process-wide budget registry keyed by parent-run id.
#[derive(Default)]
pub struct AiBudgetStore {
    budgets: Mutex<HashMap<String, AiBudget>>,
}

impl AiBudgetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initializes (or returns) the budget for a parent run.
    pub fn get_or_create(
        &self,
        parent_run_id: &str,
        tier: UserTier,
        overrides: Option<TierCaps>,
    ) -> BudgetState {
        let mut budgets = self.lock();
        let budget = budgets
            .entry(parent_run_id.to_string())
            .or_insert_with(|| AiBudget::new(tier, overrides));
        budget.state
    }

    pub fn can_make_llm_call(&self, parent_run_id: &str) -> Result<(), BudgetDenied> {
        let budgets = self.lock();
        let budget = budgets
            .get(parent_run_id)
            .ok_or_else(|| BudgetDenied::UnknownParentRun(parent_run_id.to_string()))?;
        budget.can_make_llm_call()
    }

    pub fn can_make_vision_call(
        &self,
        parent_run_id: &str,
        critical: bool,
    ) -> Result<(), BudgetDenied> {
        let budgets = self.lock();
        let budget = budgets
            .get(parent_run_id)
            .ok_or_else(|| BudgetDenied::UnknownParentRun(parent_run_id.to_string()))?;
        budget.can_make_vision_call(critical)
    }

    pub fn record_llm_call(&self, parent_run_id: &str) -> BudgetState {
        self.mutate(parent_run_id, |budget| {
            budget.used_llm_calls += 1;
        })
    }

    pub fn record_vision_call(&self, parent_run_id: &str) -> BudgetState {
        self.mutate(parent_run_id, |budget| {
            budget.used_vision_calls += 1;
        })
    }

    pub fn record_rate_limit_hit(&self, parent_run_id: &str) -> BudgetState {
        self.mutate(parent_run_id, |budget| {
            budget.rate_limit_hits += 1;
        })
    }

    pub fn state(&self, parent_run_id: &str) -> Option<BudgetState> {
        self.lock().get(parent_run_id).map(|budget| budget.state)
    }

    pub fn usage(&self, parent_run_id: &str) -> Option<(u32, u32)> {
        self.lock()
            .get(parent_run_id)
            .map(|budget| (budget.used_llm_calls, budget.used_vision_calls))
    }

    pub fn snapshot(&self, parent_run_id: &str) -> Option<AiBudgetSnapshot> {
        self.lock().get(parent_run_id).map(|budget| AiBudgetSnapshot {
            schema_version: AI_BUDGET_SCHEMA_VERSION,
            parent_run_id: parent_run_id.to_string(),
            tier: budget.tier,
            max_llm_calls: budget.max_llm_calls,
            max_vision_calls: budget.max_vision_calls,
            used_llm_calls: budget.used_llm_calls,
            used_vision_calls: budget.used_vision_calls,
            rate_limit_hits: budget.rate_limit_hits,
            state: budget.state,
        })
    }

    /// Restores a budget after a worker restart.
    pub fn restore(&self, snapshot: AiBudgetSnapshot) {
        let mut budget = AiBudget {
            tier: snapshot.tier,
            max_llm_calls: snapshot.max_llm_calls,
            max_vision_calls: snapshot.max_vision_calls,
            used_llm_calls: snapshot.used_llm_calls,
            used_vision_calls: snapshot.used_vision_calls,
            rate_limit_hits: snapshot.rate_limit_hits,
            state: snapshot.state,
        };
        budget.recompute_state();
        info!(
            parent_run = %snapshot.parent_run_id,
            state = budget.state.as_str(),
            "restored AI budget"
        );
        self.lock().insert(snapshot.parent_run_id, budget);
    }

    /// Drops the budget when the parent run completes.
    pub fn remove(&self, parent_run_id: &str) {
        self.lock().remove(parent_run_id);
    }

    fn mutate(&self, parent_run_id: &str, f: impl FnOnce(&mut AiBudget)) -> BudgetState {
        let mut budgets = self.lock();
        let Some(budget) = budgets.get_mut(parent_run_id) else {
            warn!(parent_run = parent_run_id, "recording against unknown AI budget");
            return BudgetState::Normal;
        };
        let before = budget.state;
        f(budget);
        budget.recompute_state();
        if before != budget.state {
            info!(
                parent_run = parent_run_id,
                from = before.as_str(),
                to = budget.state.as_str(),
                llm = budget.used_llm_calls,
                vision = budget.used_vision_calls,
                "AI budget state transition"
            );
        }
        budget.state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AiBudget>> {
        match self.budgets.lock() {
            Ok(budgets) => budgets,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest_store() -> AiBudgetStore {
        let store = AiBudgetStore::new();
        store.get_or_create("parent-1", UserTier::Guest, None);
        store
    }

    #[test]
    fn tier_defaults_match_policy() {
        assert_eq!(TierCaps::for_tier(UserTier::Guest), TierCaps { max_llm_calls: 10, max_vision_calls: 1 });
        assert_eq!(TierCaps::for_tier(UserTier::Starter), TierCaps { max_llm_calls: 15, max_vision_calls: 2 });
        assert_eq!(TierCaps::for_tier(UserTier::Indie), TierCaps { max_llm_calls: 20, max_vision_calls: 3 });
        assert_eq!(TierCaps::for_tier(UserTier::Pro), TierCaps { max_llm_calls: 30, max_vision_calls: 5 });
        assert_eq!(TierCaps::for_tier(UserTier::Agency), TierCaps { max_llm_calls: 30, max_vision_calls: 5 });
    }

    #[test]
    fn guest_eleventh_llm_call_is_rejected() {
        let store = guest_store();
        for _ in 0..10 {
            store.can_make_llm_call("parent-1").expect("allowed");
            store.record_llm_call("parent-1");
        }
        assert_eq!(store.state("parent-1"), Some(BudgetState::Exhausted));
        assert_eq!(store.can_make_llm_call("parent-1"), Err(BudgetDenied::StateExhausted));
    }

    #[test]
    fn guest_second_vision_call_is_rejected_even_critical() {
        let store = guest_store();
        store.can_make_vision_call("parent-1", false).expect("allowed");
        store.record_vision_call("parent-1");
        assert_eq!(store.state("parent-1"), Some(BudgetState::Exhausted));
        assert_eq!(
            store.can_make_vision_call("parent-1", true),
            Err(BudgetDenied::VisionCapReached { used: 1, max: 1 })
        );
    }

    #[test]
    fn critical_vision_survives_exhaustion_from_llm_cap() {
        let store = AiBudgetStore::new();
        store.get_or_create("parent-1", UserTier::Starter, None);
        for _ in 0..15 {
            store.record_llm_call("parent-1");
        }
        assert_eq!(store.state("parent-1"), Some(BudgetState::Exhausted));
        assert_eq!(
            store.can_make_vision_call("parent-1", false),
            Err(BudgetDenied::StateExhausted)
        );
        store.can_make_vision_call("parent-1", true).expect("critical vision allowed");
    }

    #[test]
    fn seventy_percent_usage_degrades() {
        let store = guest_store();
        for _ in 0..6 {
            store.record_llm_call("parent-1");
        }
        assert_eq!(store.state("parent-1"), Some(BudgetState::Normal));
        store.record_llm_call("parent-1");
        assert_eq!(store.state("parent-1"), Some(BudgetState::Degraded));
    }

    #[test]
    fn rate_limit_hit_forces_degraded() {
        let store = guest_store();
        assert_eq!(store.record_rate_limit_hit("parent-1"), BudgetState::Degraded);
        assert_eq!(store.record_rate_limit_hit("parent-1"), BudgetState::Degraded);
    }

    #[test]
    fn snapshot_restore_round_trips() {
        let store = guest_store();
        store.record_llm_call("parent-1");
        store.record_rate_limit_hit("parent-1");
        let snapshot = store.snapshot("parent-1").expect("snapshot");

        let restored = AiBudgetStore::new();
        restored.restore(snapshot.clone());
        assert_eq!(restored.state("parent-1"), Some(BudgetState::Degraded));
        assert_eq!(restored.snapshot("parent-1"), Some(snapshot));
    }

    #[test]
    fn overrides_replace_tier_caps() {
        let store = AiBudgetStore::new();
        store.get_or_create(
            "parent-2",
            UserTier::Guest,
            Some(TierCaps { max_llm_calls: 2, max_vision_calls: 0 }),
        );
        store.record_llm_call("parent-2");
        store.record_llm_call("parent-2");
        assert_eq!(store.state("parent-2"), Some(BudgetState::Exhausted));
    }
}
