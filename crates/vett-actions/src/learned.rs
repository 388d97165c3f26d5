use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use vett_contract::PlannedAction;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One remembered action keyed by its component hash.
pub struct LearnedAction {
    pub component_hash: String,
    pub action: PlannedAction,
    /// Fraction of reuses that succeeded, in [0, 1].
    pub reliability: f64,
    pub uses: u64,
}

/// Stable hash of (page host, selector) identifying a component across runs.
pub fn component_hash(page_url: &str, selector: &str) -> String {
    let host = page_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(b"::");
    hasher.update(selector.as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(8).map(|byte| format!("{byte:02x}")).collect()
}

#[async_trait]
/// Optional store of previously successful actions, consulted before the LLM.
pub trait LearnedActionStore: Send + Sync {
    async fn lookup(&self, project_id: &str, component_hash: &str) -> Option<LearnedAction>;
    async fn record_reuse(&self, project_id: &str, component_hash: &str);
    async fn record_healed(&self, project_id: &str, learned: LearnedAction);
}

/// In-memory learned-action store used by tests.
#[derive(Default)]
pub struct MemoryLearnedActionStore {
    entries: Mutex<HashMap<(String, String), LearnedAction>>,
    reuses: Mutex<u64>,
}

impl MemoryLearnedActionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, project_id: &str, learned: LearnedAction) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert((project_id.to_string(), learned.component_hash.clone()), learned);
        }
    }

    pub fn reuse_count(&self) -> u64 {
        self.reuses.lock().map(|count| *count).unwrap_or(0)
    }
}

#[async_trait]
impl LearnedActionStore for MemoryLearnedActionStore {
    async fn lookup(&self, project_id: &str, component_hash: &str) -> Option<LearnedAction> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| {
                entries.get(&(project_id.to_string(), component_hash.to_string())).cloned()
            })
    }

    async fn record_reuse(&self, _project_id: &str, _component_hash: &str) {
        if let Ok(mut count) = self.reuses.lock() {
            *count += 1;
        }
    }

    async fn record_healed(&self, project_id: &str, learned: LearnedAction) {
        self.insert(project_id, learned);
    }
}
