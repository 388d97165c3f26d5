use serde::{Deserialize, Serialize};

use crate::action::PlannedAction;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Outcome of one executed step.
pub enum StepOutcome {
    Success,
    Failure,
    Healed,
}

impl StepOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Healed => "healed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// How a healed step found its working target.
pub enum HealingKind {
    AlternativeSelector,
    VisionMatch,
}

impl HealingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlternativeSelector => "alternative_selector",
            Self::VisionMatch => "vision_match",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Metadata recorded when the retry layer repaired a failing action.
pub struct HealingRecord {
    pub kind: HealingKind,
    pub original_selector: String,
    pub healed_selector: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Persistable record of one pipeline step; owned by exactly one run.
pub struct StepRecord {
    pub order: u32,
    pub action: PlannedAction,
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healing: Option<HealingRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_unix_ms: u64,
    pub finished_unix_ms: u64,
}
