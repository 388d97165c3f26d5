use std::sync::Arc;

use vett_actions::{ActionGenerator, LearnedActionStore};
use vett_ai::ModelClient;
use vett_analyzer::{AnalyzerConfig, PageAnalyzer};
use vett_browser::{BrowserBackend, BrowserManager};
use vett_budget::AiBudgetStore;
use vett_contract::{PreflightResult, RunOutcome, RunSummary, StepRecord};
use vett_events::{EventEmitter, EventSink};
use vett_preflight::StatusRegistry;
use vett_resilience::BreakerStore;

/// Final artifact of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub summary: RunSummary,
    pub steps: Vec<StepRecord>,
    pub preflight: Option<PreflightResult>,
}

/// Process-wide engine: owns the shared stores and wires the per-run
/// pipeline together. Construct once at startup inside a tokio runtime.
pub struct Engine {
    pub(crate) registry: Arc<StatusRegistry>,
    pub(crate) budget: Arc<AiBudgetStore>,
    pub(crate) breakers: Arc<BreakerStore>,
    pub(crate) model: Arc<dyn ModelClient>,
    pub(crate) browser_manager: Arc<BrowserManager>,
    pub(crate) emitter: EventEmitter,
    pub(crate) analyzer: Arc<PageAnalyzer>,
    pub(crate) generator: Arc<ActionGenerator>,
}

impl Engine {
    pub fn new(
        model: Arc<dyn ModelClient>,
        backend: Arc<dyn BrowserBackend>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let emitter = EventEmitter::with_default_capacity(sink);
        Self {
            registry: Arc::new(StatusRegistry::new()),
            budget: Arc::new(AiBudgetStore::new()),
            breakers: Arc::new(BreakerStore::new()),
            analyzer: Arc::new(PageAnalyzer::new(Arc::clone(&model), AnalyzerConfig::from_env())),
            generator: Arc::new(ActionGenerator::new(Arc::clone(&model))),
            model,
            browser_manager: Arc::new(BrowserManager::new(backend)),
            emitter,
        }
    }

    /// Attaches a learned-action store consulted before the planner.
    pub fn with_learned_store(mut self, store: Arc<dyn LearnedActionStore>) -> Self {
        self.generator = Arc::new(
            ActionGenerator::new(Arc::clone(&self.model)).with_learned_store(store),
        );
        self
    }

    pub fn budget(&self) -> Arc<AiBudgetStore> {
        Arc::clone(&self.budget)
    }

    pub fn breakers(&self) -> Arc<BreakerStore> {
        Arc::clone(&self.breakers)
    }

    pub fn registry(&self) -> Arc<StatusRegistry> {
        Arc::clone(&self.registry)
    }

    /// Tears down browser processes at engine shutdown.
    pub async fn shutdown(&self) {
        self.browser_manager.shutdown().await;
    }
}
