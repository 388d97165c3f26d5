use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Phase-sequencer states for one run.
pub enum RunState {
    Created,
    Navigating,
    Preflight,
    Diagnosing,
    Planning,
    Executing,
    Finalizing,
    Done,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Navigating => "navigating",
            Self::Preflight => "preflight",
            Self::Diagnosing => "diagnosing",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Terminal outcome of a run.
pub enum RunOutcome {
    Completed,
    CompletedWithLimits,
    PausedResumable,
    FailedRecoverable,
    FailedUnrecoverable,
    Abandoned,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::CompletedWithLimits => "completed_with_limits",
            Self::PausedResumable => "paused_resumable",
            Self::FailedRecoverable => "failed_recoverable",
            Self::FailedUnrecoverable => "failed_unrecoverable",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWithLimits)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
/// Counters reported alongside the terminal outcome.
pub struct RunSummary {
    pub steps_attempted: u32,
    pub steps_succeeded: u32,
    pub steps_healed: u32,
    pub llm_calls_used: u32,
    pub vision_calls_used: u32,
    pub popups_resolved: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_explanation: Option<FailureExplanation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Human-readable failure narrative attached to failed outcomes.
pub struct FailureExplanation {
    pub root_cause: String,
    pub user_impact: String,
    pub suggestion: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_labels_are_stable() {
        assert_eq!(RunOutcome::CompletedWithLimits.as_str(), "completed_with_limits");
        assert_eq!(RunOutcome::FailedUnrecoverable.as_str(), "failed_unrecoverable");
        assert!(RunOutcome::Completed.is_success());
        assert!(!RunOutcome::Abandoned.is_success());
    }
}
