use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Terminal outcome of the sealed cookie state machine.
pub enum CookieOutcome {
    Resolved,
    ResolvedWithDelay,
    Blocked,
    NotPresent,
}

impl CookieOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::ResolvedWithDelay => "resolved_with_delay",
            Self::Blocked => "blocked",
            Self::NotPresent => "not_present",
        }
    }

    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Resolved | Self::ResolvedWithDelay)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Strategy the cookie machine used (or planned) to resolve a banner.
pub enum CookieStrategy {
    AcceptAll,
    RejectAll,
    PreferencesFlow,
}

impl CookieStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AcceptAll => "accept_all",
            Self::RejectAll => "reject_all",
            Self::PreferencesFlow => "preferences_flow",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "accept_all" | "accept" => Some(Self::AcceptAll),
            "reject_all" | "reject" => Some(Self::RejectAll),
            "preferences_flow" | "preferences" => Some(Self::PreferencesFlow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Result of one sealed cookie-machine invocation for a page.
pub struct CookieResolution {
    pub outcome: CookieOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<CookieStrategy>,
    pub selectors_attempted: Vec<String>,
    pub steps_executed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CookieResolution {
    pub fn not_present() -> Self {
        Self {
            outcome: CookieOutcome::NotPresent,
            strategy: None,
            selectors_attempted: Vec::new(),
            steps_executed: 0,
            reason: None,
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            outcome: CookieOutcome::Blocked,
            strategy: None,
            selectors_attempted: Vec::new(),
            steps_executed: 0,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Classified kind of a non-cookie popup.
pub enum PopupKind {
    Newsletter,
    Chat,
    Promo,
    Unknown,
}

impl PopupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Newsletter => "newsletter",
            Self::Chat => "chat",
            Self::Promo => "promo",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Whether a detected popup obstructs the page under test.
pub enum BlockingStatus {
    BlockingUi,
    NonBlocking,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One popup detection produced by the scanner. Detection only; dismissal is
/// the preflight orchestrator's decision.
pub struct PopupDetection {
    pub selector: String,
    pub kind: PopupKind,
    pub blocking: BlockingStatus,
    pub text_sample: String,
    pub coverage_percent: f64,
    pub z_index: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One timestamped entry in the preflight execution trace.
pub struct PreflightTraceEntry {
    pub unix_ms: u64,
    pub state: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Aggregate result of preflight for one URL.
pub struct PreflightResult {
    pub success: bool,
    pub cookie: CookieResolution,
    pub popups_detected: Vec<PopupDetection>,
    pub popups_resolved: u32,
    pub popups_skipped: u32,
    pub trace: Vec<PreflightTraceEntry>,
    pub errors: Vec<String>,
}
