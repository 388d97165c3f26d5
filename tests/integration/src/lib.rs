//! Shared fixtures for the end-to-end pipeline scenarios.

use std::sync::Arc;

use vett_ai::scripted::ScriptedModel;
use vett_browser::scripted::{ScriptedBackend, ScriptedSession};
use vett_contract::{BrowserType, DeviceProfile, RunDescriptor, TestMode, UserTier};
use vett_events::MemorySink;
use vett_sequencer::Engine;

/// Builds an engine over one scripted session and an inspectable sink.
pub fn engine_with(
    model: Arc<ScriptedModel>,
    session: Arc<ScriptedSession>,
) -> (Engine, Arc<MemorySink>) {
    let backend = Arc::new(ScriptedBackend::new());
    backend.push_session(session);
    let sink = MemorySink::new();
    let engine = Engine::new(model, backend, sink.clone());
    (engine, sink)
}

/// A guest-mode descriptor pointed at one URL.
pub fn descriptor(url: &str, tier: UserTier) -> RunDescriptor {
    RunDescriptor {
        run_id: "01JRUN0000000000000000000".to_string(),
        parent_run_id: "01JPARENT000000000000000".to_string(),
        target_urls: vec![url.to_string()],
        test_mode: TestMode::Guest,
        browser_type: BrowserType::Chromium,
        device: DeviceProfile::default(),
        user_tier: tier,
        instructions: None,
        project_id: None,
    }
}
