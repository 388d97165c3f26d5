use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
/// Per-run cookie handling status. Transitions are strictly monotonic.
pub enum CookieStatus {
    NotStarted,
    InProgress,
    Completed,
}

impl CookieStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
/// Per-run preflight status. Transitions are strictly monotonic.
pub enum PreflightStatus {
    NotStarted,
    InProgress,
    Completed,
}

impl PreflightStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
/// Fatal phase-ordering violation. Raising one of these means a bypass path
/// reached a guarded entry point; the run must abort as unrecoverable.
#[error(
    "invariant violation in {context} (run {run_id}): {detail} \
     [cookie={cookie_status:?}, preflight={preflight_status:?}]"
)]
pub struct InvariantViolation {
    pub run_id: String,
    pub context: String,
    pub detail: String,
    pub cookie_status: CookieStatus,
    pub preflight_status: PreflightStatus,
}

impl InvariantViolation {
    pub fn new(
        run_id: impl Into<String>,
        context: impl Into<String>,
        detail: impl Into<String>,
        cookie_status: CookieStatus,
        preflight_status: PreflightStatus,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            context: context.into(),
            detail: detail.into(),
            cookie_status,
            preflight_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_order_monotonically() {
        assert!(CookieStatus::NotStarted < CookieStatus::InProgress);
        assert!(CookieStatus::InProgress < CookieStatus::Completed);
        assert!(PreflightStatus::NotStarted < PreflightStatus::Completed);
    }

    #[test]
    fn violation_message_carries_run_and_context() {
        let violation = InvariantViolation::new(
            "run-1",
            "capture_state",
            "screenshot before preflight completion",
            CookieStatus::NotStarted,
            PreflightStatus::InProgress,
        );
        let message = violation.to_string();
        assert!(message.contains("run-1"));
        assert!(message.contains("capture_state"));
        assert!(message.contains("in_progress") || message.contains("InProgress"));
    }
}
