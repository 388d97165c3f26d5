//! Non-cookie popup detection.
//!
//! Detection only: the scanner classifies overlays and reports whether they
//! block the UI. Dismissal is the preflight orchestrator's decision, and
//! never happens outside preflight.

use std::collections::HashSet;

use tracing::debug;

use vett_browser::BrowserSession;
use vett_contract::{BlockingStatus, InvariantViolation, PopupDetection, PopupKind};

use crate::status::StatusRegistry;

/// Fixed list of overlay indicator selectors, scanned in order.
pub const POPUP_INDICATOR_SELECTORS: &[&str] = &[
    "[role=dialog]",
    "[aria-modal=true]",
    ".modal",
    ".popup",
    ".overlay",
    ".newsletter-signup",
    ".newsletter-modal",
    "#newsletter",
    ".subscribe-modal",
    "#intercom-container",
    ".intercom-messenger",
    ".chat-widget",
    ".drift-widget",
    ".promo-banner",
    ".promo-modal",
];

/// Z-index at or above which an overlay counts as blocking.
const BLOCKING_Z_INDEX: i64 = 1_000;
/// Viewport coverage above which an overlay counts as blocking.
const BLOCKING_COVERAGE_PERCENT: f64 = 15.0;

const COOKIE_TEXT_MARKERS: &[&str] = &["cookie", "consent", "gdpr"];

/// Scans a page once for non-cookie popups.
pub(crate) struct PopupScanner {
    scanned_pages: HashSet<String>,
}

impl PopupScanner {
    pub(crate) fn new() -> Self {
        Self { scanned_pages: HashSet::new() }
    }

    /// One pass per page. Requires cookie handling to be finished; asserts it.
    pub(crate) async fn scan(
        &mut self,
        session: &dyn BrowserSession,
        url: &str,
        run_id: &str,
        registry: &StatusRegistry,
    ) -> Result<Vec<PopupDetection>, InvariantViolation> {
        registry.assert_cookie_completed(run_id, "popup_scanner")?;
        if !self.scanned_pages.insert(url.to_string()) {
            debug!(url, "popup scan already ran for this page");
            return Ok(Vec::new());
        }

        let (viewport_width, viewport_height) = session.viewport();
        let viewport_area = f64::from(viewport_width) * f64::from(viewport_height);
        let mut detections = Vec::new();

        for indicator in POPUP_INDICATOR_SELECTORS {
            let Ok(Some(info)) = session.element_info(indicator).await else {
                continue;
            };
            if !info.visible {
                continue;
            }
            let text_lowered = info.text.to_ascii_lowercase();
            if COOKIE_TEXT_MARKERS.iter().any(|marker| text_lowered.contains(marker)) {
                // Cookie UI belongs to the sealed machine, never to this pass.
                continue;
            }

            let coverage_percent = if viewport_area > 0.0 {
                (info.bounds.area() / viewport_area) * 100.0
            } else {
                0.0
            };
            let is_modal_indicator = matches!(
                *indicator,
                "[role=dialog]" | "[aria-modal=true]" | ".modal"
            );
            let blocking = if info.z_index.map(|z| z >= BLOCKING_Z_INDEX).unwrap_or(false)
                || coverage_percent > BLOCKING_COVERAGE_PERCENT
                || is_modal_indicator
            {
                BlockingStatus::BlockingUi
            } else {
                BlockingStatus::NonBlocking
            };

            detections.push(PopupDetection {
                selector: indicator.to_string(),
                kind: classify_kind(indicator, &text_lowered),
                blocking,
                text_sample: info.text.chars().take(120).collect(),
                coverage_percent,
                z_index: info.z_index,
            });
        }
        Ok(detections)
    }
}

fn classify_kind(indicator: &str, text_lowered: &str) -> PopupKind {
    let haystack = format!("{indicator} {text_lowered}");
    if ["newsletter", "subscribe", "sign up", "signup"].iter().any(|kw| haystack.contains(kw)) {
        return PopupKind::Newsletter;
    }
    if ["chat", "intercom", "drift", "messenger"].iter().any(|kw| haystack.contains(kw)) {
        return PopupKind::Chat;
    }
    if ["promo", "sale", "discount", "% off", "offer"].iter().any(|kw| haystack.contains(kw)) {
        return PopupKind::Promo;
    }
    PopupKind::Unknown
}
