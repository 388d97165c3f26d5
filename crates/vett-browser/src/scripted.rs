//! Deterministic in-memory browser used by the engine's test suites.
//!
//! A scripted page is a set of selector-keyed elements plus an HTML snapshot.
//! Click and key effects are queued per selector and consumed in order, which
//! lets tests model banners that disappear, modals dismissed by Escape, and
//! selectors that fail until healed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use vett_contract::{Bounds, BrowserType, DeviceProfile};

use crate::driver::{BrowserBackend, BrowserError, BrowserSession, ElementInfo};

/// Queue key used for backdrop clicks (`click_at`).
pub const BACKDROP_TARGET: &str = "@backdrop";

#[derive(Debug, Clone)]
/// One scripted element on the page.
pub struct ScriptedElement {
    pub visible: bool,
    pub enabled: bool,
    pub text: String,
    pub bounds: Bounds,
    pub z_index: Option<i64>,
    pub in_viewport: bool,
}

impl ScriptedElement {
    pub fn visible_button(text: impl Into<String>) -> Self {
        Self {
            visible: true,
            enabled: true,
            text: text.into(),
            bounds: Bounds { x: 10.0, y: 10.0, width: 120.0, height: 40.0 },
            z_index: None,
            in_viewport: true,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_z_index(mut self, z_index: i64) -> Self {
        self.z_index = Some(z_index);
        self
    }

    pub fn out_of_viewport(mut self) -> Self {
        self.in_viewport = false;
        self
    }
}

#[derive(Debug, Clone)]
/// Effect applied when a queued interaction fires.
pub enum ScriptedEffect {
    HideElement(String),
    RevealElement(String),
    RemoveElement(String),
    SetHtml(String),
    SetUrl(String),
    Fail(BrowserError),
}

#[derive(Debug, Default)]
struct ScriptedState {
    url: String,
    html: String,
    elements: HashMap<String, ScriptedElement>,
    interaction_effects: HashMap<String, VecDeque<Vec<ScriptedEffect>>>,
    evaluate_results: HashMap<String, Value>,
    clicks: Vec<(String, bool)>,
    clicks_at: Vec<(f64, f64)>,
    typed: Vec<(String, String)>,
    keys: Vec<String>,
    scrolls: Vec<i64>,
    navigations: Vec<String>,
    reloads: usize,
    network_idle_waits: usize,
    screenshots: usize,
    dom_snapshots: usize,
    closed: bool,
}

/// Scripted implementation of [`BrowserSession`].
pub struct ScriptedSession {
    state: Mutex<ScriptedState>,
    viewport: (u32, u32),
    screenshot_bytes: Vec<u8>,
}

impl ScriptedSession {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        let state = ScriptedState {
            url: url.into(),
            html: html.into(),
            ..ScriptedState::default()
        };
        Self {
            state: Mutex::new(state),
            viewport: (1280, 720),
            // Deterministic stand-in for PNG bytes.
            screenshot_bytes: vec![0x89, b'P', b'N', b'G', 0, 0, 0, 0],
        }
    }

    pub fn with_viewport(mut self, width: u32, height: u32) -> Self {
        self.viewport = (width, height);
        self
    }

    /// Registers an element reachable by its exact selector.
    pub fn add_element(&self, selector: impl Into<String>, element: ScriptedElement) {
        if let Ok(mut state) = self.state.lock() {
            state.elements.insert(selector.into(), element);
        }
    }

    /// Queues one batch of effects for the next interaction with `target`
    /// (a selector, a key name, or [`BACKDROP_TARGET`]).
    pub fn queue_effects(&self, target: impl Into<String>, effects: Vec<ScriptedEffect>) {
        if let Ok(mut state) = self.state.lock() {
            state
                .interaction_effects
                .entry(target.into())
                .or_default()
                .push_back(effects);
        }
    }

    pub fn set_evaluate_result(&self, expression: impl Into<String>, value: Value) {
        if let Ok(mut state) = self.state.lock() {
            state.evaluate_results.insert(expression.into(), value);
        }
    }

    pub fn set_html(&self, html: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.html = html.into();
        }
    }

    pub fn clicks(&self) -> Vec<(String, bool)> {
        self.state.lock().map(|state| state.clicks.clone()).unwrap_or_default()
    }

    pub fn typed(&self) -> Vec<(String, String)> {
        self.state.lock().map(|state| state.typed.clone()).unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().map(|state| state.keys.clone()).unwrap_or_default()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state.lock().map(|state| state.navigations.clone()).unwrap_or_default()
    }

    pub fn screenshot_count(&self) -> usize {
        self.state.lock().map(|state| state.screenshots).unwrap_or(0)
    }

    pub fn dom_snapshot_count(&self) -> usize {
        self.state.lock().map(|state| state.dom_snapshots).unwrap_or(0)
    }

    pub fn scroll_count(&self) -> usize {
        self.state.lock().map(|state| state.scrolls.len()).unwrap_or(0)
    }

    pub fn reload_count(&self) -> usize {
        self.state.lock().map(|state| state.reloads).unwrap_or(0)
    }

    pub fn network_idle_waits(&self) -> usize {
        self.state.lock().map(|state| state.network_idle_waits).unwrap_or(0)
    }

    fn apply_effects(state: &mut ScriptedState, target: &str) -> Result<(), BrowserError> {
        let batch = state
            .interaction_effects
            .get_mut(target)
            .and_then(|queue| queue.pop_front());
        let Some(effects) = batch else {
            return Ok(());
        };
        for effect in effects {
            match effect {
                ScriptedEffect::HideElement(selector) => {
                    if let Some(element) = state.elements.get_mut(&selector) {
                        element.visible = false;
                    }
                }
                ScriptedEffect::RevealElement(selector) => {
                    if let Some(element) = state.elements.get_mut(&selector) {
                        element.visible = true;
                    }
                }
                ScriptedEffect::RemoveElement(selector) => {
                    state.elements.remove(&selector);
                }
                ScriptedEffect::SetHtml(html) => state.html = html,
                ScriptedEffect::SetUrl(url) => state.url = url,
                ScriptedEffect::Fail(error) => return Err(error),
            }
        }
        Ok(())
    }

    fn guard_open(state: &ScriptedState) -> Result<(), BrowserError> {
        if state.closed {
            return Err(BrowserError::SessionClosed);
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ScriptedState>, BrowserError> {
        self.state
            .lock()
            .map_err(|_| BrowserError::Backend("scripted state poisoned".to_string()))
    }
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn navigate(&self, url: &str, _timeout_ms: u64) -> Result<(), BrowserError> {
        let mut state = self.lock()?;
        Self::guard_open(&state)?;
        state.url = url.to_string();
        state.navigations.push(url.to_string());
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        let state = self.lock()?;
        Self::guard_open(&state)?;
        Ok(state.url.clone())
    }

    async fn reload(&self) -> Result<(), BrowserError> {
        let mut state = self.lock()?;
        Self::guard_open(&state)?;
        state.reloads += 1;
        Ok(())
    }

    async fn wait_for_network_idle(&self, _timeout_ms: u64) -> Result<(), BrowserError> {
        let mut state = self.lock()?;
        Self::guard_open(&state)?;
        state.network_idle_waits += 1;
        Ok(())
    }

    async fn click(&self, selector: &str, force: bool) -> Result<(), BrowserError> {
        let mut state = self.lock()?;
        Self::guard_open(&state)?;
        let Some(element) = state.elements.get(selector) else {
            return Err(BrowserError::SelectorNotFound(selector.to_string()));
        };
        if !force && (!element.visible || !element.enabled) {
            return Err(BrowserError::NotInteractable(selector.to_string()));
        }
        state.clicks.push((selector.to_string(), force));
        Self::apply_effects(&mut state, selector)
    }

    async fn click_at(&self, x: f64, y: f64) -> Result<(), BrowserError> {
        let mut state = self.lock()?;
        Self::guard_open(&state)?;
        state.clicks_at.push((x, y));
        Self::apply_effects(&mut state, BACKDROP_TARGET)
    }

    async fn type_text(&self, selector: &str, value: &str) -> Result<(), BrowserError> {
        let mut state = self.lock()?;
        Self::guard_open(&state)?;
        let Some(element) = state.elements.get(selector) else {
            return Err(BrowserError::SelectorNotFound(selector.to_string()));
        };
        if !element.visible || !element.enabled {
            return Err(BrowserError::NotInteractable(selector.to_string()));
        }
        state.typed.push((selector.to_string(), value.to_string()));
        Self::apply_effects(&mut state, selector)
    }

    async fn press_key(&self, key: &str) -> Result<(), BrowserError> {
        let mut state = self.lock()?;
        Self::guard_open(&state)?;
        state.keys.push(key.to_string());
        Self::apply_effects(&mut state, key)
    }

    async fn scroll_by(&self, delta_y: i64) -> Result<(), BrowserError> {
        let mut state = self.lock()?;
        Self::guard_open(&state)?;
        state.scrolls.push(delta_y);
        Ok(())
    }

    async fn scroll_to_top(&self) -> Result<(), BrowserError> {
        let mut state = self.lock()?;
        Self::guard_open(&state)?;
        state.scrolls.push(0);
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
        let mut state = self.lock()?;
        Self::guard_open(&state)?;
        state.screenshots += 1;
        Ok(self.screenshot_bytes.clone())
    }

    async fn dom_snapshot(&self) -> Result<String, BrowserError> {
        let mut state = self.lock()?;
        Self::guard_open(&state)?;
        state.dom_snapshots += 1;
        Ok(state.html.clone())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, BrowserError> {
        let state = self.lock()?;
        Self::guard_open(&state)?;
        Ok(state.evaluate_results.get(expression).cloned().unwrap_or(Value::Null))
    }

    async fn is_visible(&self, selector: &str) -> Result<bool, BrowserError> {
        let state = self.lock()?;
        Self::guard_open(&state)?;
        Ok(state.elements.get(selector).map(|element| element.visible).unwrap_or(false))
    }

    async fn is_enabled(&self, selector: &str) -> Result<bool, BrowserError> {
        let state = self.lock()?;
        Self::guard_open(&state)?;
        Ok(state.elements.get(selector).map(|element| element.enabled).unwrap_or(false))
    }

    async fn element_text(&self, selector: &str) -> Result<String, BrowserError> {
        let state = self.lock()?;
        Self::guard_open(&state)?;
        state
            .elements
            .get(selector)
            .map(|element| element.text.clone())
            .ok_or_else(|| BrowserError::SelectorNotFound(selector.to_string()))
    }

    async fn bounding_box(&self, selector: &str) -> Result<Option<Bounds>, BrowserError> {
        let state = self.lock()?;
        Self::guard_open(&state)?;
        Ok(state.elements.get(selector).map(|element| element.bounds))
    }

    async fn element_info(&self, selector: &str) -> Result<Option<ElementInfo>, BrowserError> {
        let state = self.lock()?;
        Self::guard_open(&state)?;
        Ok(state.elements.get(selector).map(|element| ElementInfo {
            visible: element.visible,
            enabled: element.enabled,
            text: element.text.clone(),
            bounds: element.bounds,
            z_index: element.z_index,
            in_viewport: element.in_viewport,
        }))
    }

    async fn count_matches(&self, selector: &str) -> Result<usize, BrowserError> {
        let state = self.lock()?;
        Self::guard_open(&state)?;
        Ok(usize::from(state.elements.contains_key(selector)))
    }

    fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    async fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
    }
}

/// Backend handing out pre-built scripted sessions, newest first.
#[derive(Default)]
pub struct ScriptedBackend {
    sessions: Mutex<VecDeque<Arc<ScriptedSession>>>,
    launches: Mutex<usize>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_session(&self, session: Arc<ScriptedSession>) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.push_back(session);
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().map(|count| *count).unwrap_or(0)
    }
}

#[async_trait]
impl BrowserBackend for ScriptedBackend {
    async fn launch(&self, _browser: BrowserType) -> Result<(), BrowserError> {
        if let Ok(mut count) = self.launches.lock() {
            *count += 1;
        }
        Ok(())
    }

    async fn new_session(
        &self,
        _browser: BrowserType,
        _device: &DeviceProfile,
    ) -> Result<Arc<dyn BrowserSession>, BrowserError> {
        let session = self
            .sessions
            .lock()
            .ok()
            .and_then(|mut sessions| sessions.pop_front())
            .ok_or_else(|| BrowserError::Backend("no scripted session queued".to_string()))?;
        Ok(session)
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn click_applies_queued_effects_in_order() {
        let session = ScriptedSession::new("https://example.com", "<html></html>");
        session.add_element("#accept", ScriptedElement::visible_button("Accept"));
        session.queue_effects("#accept", vec![ScriptedEffect::HideElement("#accept".into())]);

        assert!(session.is_visible("#accept").await.expect("visible"));
        session.click("#accept", false).await.expect("click");
        assert!(!session.is_visible("#accept").await.expect("visible"));
        assert_eq!(session.clicks().len(), 1);
    }

    #[tokio::test]
    async fn click_rejects_missing_and_disabled_targets() {
        let session = ScriptedSession::new("https://example.com", "<html></html>");
        session.add_element("#off", ScriptedElement::visible_button("Off").disabled());

        let missing = session.click("#nope", false).await.unwrap_err();
        assert_eq!(missing, BrowserError::SelectorNotFound("#nope".to_string()));
        let disabled = session.click("#off", false).await.unwrap_err();
        assert_eq!(disabled, BrowserError::NotInteractable("#off".to_string()));
        // Force click bypasses interactability.
        session.click("#off", true).await.expect("force click");
    }

    #[tokio::test]
    async fn fail_effect_surfaces_after_logging() {
        let session = ScriptedSession::new("https://example.com", "<html></html>");
        session.add_element("#flaky", ScriptedElement::visible_button("Flaky"));
        session.queue_effects(
            "#flaky",
            vec![ScriptedEffect::Fail(BrowserError::Timeout {
                operation: "click".to_string(),
                timeout_ms: 30_000,
            })],
        );
        let error = session.click("#flaky", false).await.unwrap_err();
        assert!(matches!(error, BrowserError::Timeout { .. }));
        assert_eq!(session.clicks().len(), 1);
        // Next click succeeds: the failure batch was consumed.
        session.click("#flaky", false).await.expect("second click");
    }

    #[tokio::test]
    async fn closed_session_refuses_operations() {
        let session = ScriptedSession::new("https://example.com", "<html></html>");
        session.close().await;
        let error = session.dom_snapshot().await.unwrap_err();
        assert_eq!(error, BrowserError::SessionClosed);
    }

    #[tokio::test]
    async fn escape_key_effects_dismiss_modals() {
        let session = ScriptedSession::new("https://example.com", "<html></html>");
        session.add_element("[role=dialog]", ScriptedElement::visible_button("Subscribe!"));
        session.queue_effects("Escape", vec![ScriptedEffect::HideElement("[role=dialog]".into())]);
        session.press_key("Escape").await.expect("press");
        assert!(!session.is_visible("[role=dialog]").await.expect("visible"));
    }
}
