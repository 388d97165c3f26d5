use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported test modes.
pub enum TestMode {
    Single,
    Multi,
    All,
    Monkey,
    Guest,
    Behavior,
}

impl TestMode {
    /// Stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Multi => "multi",
            Self::All => "all",
            Self::Monkey => "monkey",
            Self::Guest => "guest",
            Self::Behavior => "behavior",
        }
    }

    /// Parses a test-mode token.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "single" => Some(Self::Single),
            "multi" => Some(Self::Multi),
            "all" => Some(Self::All),
            "monkey" => Some(Self::Monkey),
            "guest" => Some(Self::Guest),
            "behavior" => Some(Self::Behavior),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported browser engines.
pub enum BrowserType {
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chromium => "chromium",
            Self::Firefox => "firefox",
            Self::Webkit => "webkit",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "chromium" | "chrome" => Some(Self::Chromium),
            "firefox" => Some(Self::Firefox),
            "webkit" | "safari" => Some(Self::Webkit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
/// Enumerates billing tiers that bound the per-parent-run AI budget.
pub enum UserTier {
    Guest,
    Starter,
    Indie,
    Pro,
    Agency,
}

impl UserTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Guest => "guest",
            Self::Starter => "starter",
            Self::Indie => "indie",
            Self::Pro => "pro",
            Self::Agency => "agency",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "guest" => Some(Self::Guest),
            "starter" => Some(Self::Starter),
            "indie" => Some(Self::Indie),
            "pro" => Some(Self::Pro),
            "agency" => Some(Self::Agency),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Viewport/device description for a run.
pub struct DeviceProfile {
    pub name: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    #[serde(default)]
    pub is_mobile: bool,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            name: "desktop".to_string(),
            viewport_width: 1280,
            viewport_height: 720,
            is_mobile: false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
/// Validation failures for incoming run descriptors.
pub enum DescriptorError {
    #[error("run id cannot be empty")]
    EmptyRunId,
    #[error("parent run id cannot be empty")]
    EmptyParentRunId,
    #[error("descriptor must name at least one target url")]
    NoTargetUrls,
    #[error("target url '{0}' is not http(s)")]
    InvalidTargetUrl(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Immutable input describing one run of the pipeline.
///
/// Run and parent-run ids are ULIDs minted by the API collaborator; the
/// engine treats them as opaque non-empty strings.
pub struct RunDescriptor {
    pub run_id: String,
    pub parent_run_id: String,
    pub target_urls: Vec<String>,
    pub test_mode: TestMode,
    pub browser_type: BrowserType,
    #[serde(default)]
    pub device: DeviceProfile,
    pub user_tier: UserTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl RunDescriptor {
    /// Validates the descriptor invariants the engine relies on.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.run_id.trim().is_empty() {
            return Err(DescriptorError::EmptyRunId);
        }
        if self.parent_run_id.trim().is_empty() {
            return Err(DescriptorError::EmptyParentRunId);
        }
        if self.target_urls.is_empty() {
            return Err(DescriptorError::NoTargetUrls);
        }
        for url in &self.target_urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(DescriptorError::InvalidTargetUrl(url.clone()));
            }
        }
        Ok(())
    }

    pub fn first_url(&self) -> &str {
        self.target_urls
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }
}
