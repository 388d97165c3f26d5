use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use vett_contract::{Bounds, BrowserType, DeviceProfile};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
/// Failures surfaced by browser operations.
pub enum BrowserError {
    #[error("no element matches selector '{0}'")]
    SelectorNotFound(String),
    #[error("element '{0}' is not interactable")]
    NotInteractable(String),
    #[error("operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error("navigation to '{url}' failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("session is closed")]
    SessionClosed,
    #[error("browser backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
/// Aggregate locator information for one selector.
pub struct ElementInfo {
    pub visible: bool,
    pub enabled: bool,
    pub text: String,
    pub bounds: Bounds,
    pub z_index: Option<i64>,
    pub in_viewport: bool,
}

#[async_trait]
/// One live page owned by exactly one run.
///
/// All page-mutating calls are awaited in order by the caller; the engine
/// never interleaves two mutating calls on the same session.
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &str, timeout_ms: u64) -> Result<(), BrowserError>;
    async fn current_url(&self) -> Result<String, BrowserError>;
    async fn reload(&self) -> Result<(), BrowserError>;
    async fn wait_for_network_idle(&self, timeout_ms: u64) -> Result<(), BrowserError>;

    /// Clicks a selector; `force` bypasses visibility/occlusion checks.
    async fn click(&self, selector: &str, force: bool) -> Result<(), BrowserError>;
    /// Clicks raw viewport coordinates (backdrop dismissal).
    async fn click_at(&self, x: f64, y: f64) -> Result<(), BrowserError>;
    async fn type_text(&self, selector: &str, value: &str) -> Result<(), BrowserError>;
    async fn press_key(&self, key: &str) -> Result<(), BrowserError>;
    async fn scroll_by(&self, delta_y: i64) -> Result<(), BrowserError>;
    async fn scroll_to_top(&self) -> Result<(), BrowserError>;

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError>;
    async fn dom_snapshot(&self) -> Result<String, BrowserError>;
    async fn evaluate(&self, expression: &str) -> Result<Value, BrowserError>;

    async fn is_visible(&self, selector: &str) -> Result<bool, BrowserError>;
    async fn is_enabled(&self, selector: &str) -> Result<bool, BrowserError>;
    async fn element_text(&self, selector: &str) -> Result<String, BrowserError>;
    async fn bounding_box(&self, selector: &str) -> Result<Option<Bounds>, BrowserError>;
    /// One-shot locator summary; `None` when nothing matches.
    async fn element_info(&self, selector: &str) -> Result<Option<ElementInfo>, BrowserError>;
    /// Number of nodes matching a selector.
    async fn count_matches(&self, selector: &str) -> Result<usize, BrowserError>;

    fn viewport(&self) -> (u32, u32);
    async fn close(&self);
}

#[async_trait]
/// Factory behind the [`crate::BrowserManager`]: launches long-lived browser
/// processes and spawns per-run sessions inside them.
pub trait BrowserBackend: Send + Sync {
    /// Starts the process for a browser type. Idempotent.
    async fn launch(&self, browser: BrowserType) -> Result<(), BrowserError>;
    async fn new_session(
        &self,
        browser: BrowserType,
        device: &DeviceProfile,
    ) -> Result<Arc<dyn BrowserSession>, BrowserError>;
    async fn shutdown(&self);
}
