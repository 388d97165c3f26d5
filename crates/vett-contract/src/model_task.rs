use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
/// The model call types the engine issues. Token budgets and metrics are
/// keyed by this.
pub enum ModelTask {
    Planning,
    Diagnosis,
    Testability,
    ActionGeneration,
    CookieBanner,
    ErrorAnalysis,
    Healing,
    Synthesis,
    Summary,
    VisionValidation,
}

impl ModelTask {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Diagnosis => "diagnosis",
            Self::Testability => "testability",
            Self::ActionGeneration => "action_generation",
            Self::CookieBanner => "cookie_banner",
            Self::ErrorAnalysis => "error_analysis",
            Self::Healing => "healing",
            Self::Synthesis => "synthesis",
            Self::Summary => "summary",
            Self::VisionValidation => "vision_validation",
        }
    }
}
