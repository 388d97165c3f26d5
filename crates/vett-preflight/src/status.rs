use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use vett_contract::{CookieStatus, InvariantViolation, PreflightStatus};
use vett_core::current_unix_timestamp_ms;

#[derive(Debug, Clone, Copy)]
struct RunStatusEntry {
    cookie: CookieStatus,
    preflight: PreflightStatus,
    completed_unix_ms: Option<u64>,
}

impl Default for RunStatusEntry {
    fn default() -> Self {
        Self {
            cookie: CookieStatus::NotStarted,
            preflight: PreflightStatus::NotStarted,
            completed_unix_ms: None,
        }
    }
}

/// Process-local registry of per-run cookie/preflight status.
///
/// These are runtime guards, not logging: every guarded entry point
/// (screenshot, DOM capture, AI analysis, diagnosis, IRL, overlay
/// dismissal) calls the matching assert and aborts the run on violation.
/// Status mutators are crate-private; only the sealed cookie machine and
/// the preflight orchestrator advance them.
#[derive(Default)]
pub struct StatusRegistry {
    entries: Mutex<HashMap<String, RunStatusEntry>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a fresh entry at run start.
    pub fn reset(&self, run_id: &str) {
        self.lock().insert(run_id.to_string(), RunStatusEntry::default());
        debug!(run_id, "status registry reset");
    }

    /// Drops the entry at run exit.
    pub fn clear(&self, run_id: &str) {
        self.lock().remove(run_id);
    }

    pub fn cookie_status(&self, run_id: &str) -> CookieStatus {
        self.lock().get(run_id).map(|entry| entry.cookie).unwrap_or(CookieStatus::NotStarted)
    }

    pub fn preflight_status(&self, run_id: &str) -> PreflightStatus {
        self.lock()
            .get(run_id)
            .map(|entry| entry.preflight)
            .unwrap_or(PreflightStatus::NotStarted)
    }

    /// Monotonic cookie-status advance; regressions fail loudly. Sealed to
    /// this crate.
    pub(crate) fn advance_cookie_status(
        &self,
        run_id: &str,
        status: CookieStatus,
    ) -> Result<(), InvariantViolation> {
        let mut entries = self.lock();
        let entry = entries.entry(run_id.to_string()).or_default();
        if status < entry.cookie {
            return Err(self.violation_for(
                entry,
                run_id,
                "advance_cookie_status",
                format!("cookie status regression {:?} -> {:?}", entry.cookie, status),
            ));
        }
        entry.cookie = status;
        Ok(())
    }

    /// Monotonic preflight-status advance; regressions fail loudly. Sealed
    /// to this crate.
    pub(crate) fn advance_preflight_status(
        &self,
        run_id: &str,
        status: PreflightStatus,
    ) -> Result<(), InvariantViolation> {
        let mut entries = self.lock();
        let entry = entries.entry(run_id.to_string()).or_default();
        if status < entry.preflight {
            return Err(self.violation_for(
                entry,
                run_id,
                "advance_preflight_status",
                format!("preflight status regression {:?} -> {:?}", entry.preflight, status),
            ));
        }
        entry.preflight = status;
        if status == PreflightStatus::Completed && entry.completed_unix_ms.is_none() {
            entry.completed_unix_ms = Some(current_unix_timestamp_ms());
        }
        Ok(())
    }

    /// Cookie handling may begin only when the status is untouched.
    pub fn assert_cookie_handling_allowed(
        &self,
        run_id: &str,
        context: &str,
    ) -> Result<(), InvariantViolation> {
        self.assert_with(run_id, context, |entry| {
            (entry.cookie == CookieStatus::NotStarted)
                .then_some(())
                .ok_or_else(|| "cookie handling attempted after it already ran".to_string())
        })
    }

    /// Shared gate for everything forbidden before preflight completion.
    fn assert_preflight_completed(
        &self,
        run_id: &str,
        context: &str,
    ) -> Result<(), InvariantViolation> {
        self.assert_with(run_id, context, |entry| {
            (entry.preflight == PreflightStatus::Completed)
                .then_some(())
                .ok_or_else(|| "operation requires completed preflight".to_string())
        })
    }

    pub fn assert_preflight_completed_before_screenshot(
        &self,
        run_id: &str,
        context: &str,
    ) -> Result<(), InvariantViolation> {
        self.assert_preflight_completed(run_id, &format!("screenshot:{context}"))
    }

    pub fn assert_preflight_completed_before_dom_snapshot(
        &self,
        run_id: &str,
        context: &str,
    ) -> Result<(), InvariantViolation> {
        self.assert_preflight_completed(run_id, &format!("dom_snapshot:{context}"))
    }

    pub fn assert_preflight_completed_before_ai_analysis(
        &self,
        run_id: &str,
        context: &str,
    ) -> Result<(), InvariantViolation> {
        self.assert_preflight_completed(run_id, &format!("ai_analysis:{context}"))
    }

    pub fn assert_preflight_completed_before_diagnosis(
        &self,
        run_id: &str,
        context: &str,
    ) -> Result<(), InvariantViolation> {
        self.assert_preflight_completed(run_id, &format!("diagnosis:{context}"))
    }

    /// IRL/self-healing is forbidden while preflight is running.
    pub fn assert_no_irl_during_preflight(
        &self,
        run_id: &str,
        context: &str,
    ) -> Result<(), InvariantViolation> {
        self.assert_with(run_id, context, |entry| {
            (entry.preflight != PreflightStatus::InProgress)
                .then_some(())
                .ok_or_else(|| "retry layer invoked during preflight".to_string())
        })
    }

    /// Overlay dismissal belongs to preflight; after completion it is a
    /// bypass path.
    pub fn assert_no_overlay_dismissal_outside_preflight(
        &self,
        run_id: &str,
        context: &str,
    ) -> Result<(), InvariantViolation> {
        self.assert_with(run_id, context, |entry| {
            (entry.preflight != PreflightStatus::Completed)
                .then_some(())
                .ok_or_else(|| "overlay dismissal attempted after preflight completed".to_string())
        })
    }

    /// Non-cookie popup handling requires cookie handling to have finished.
    pub(crate) fn assert_cookie_completed(
        &self,
        run_id: &str,
        context: &str,
    ) -> Result<(), InvariantViolation> {
        self.assert_with(run_id, context, |entry| {
            (entry.cookie == CookieStatus::Completed)
                .then_some(())
                .ok_or_else(|| "popup handling before cookie resolution finished".to_string())
        })
    }

    fn assert_with(
        &self,
        run_id: &str,
        context: &str,
        check: impl FnOnce(&RunStatusEntry) -> Result<(), String>,
    ) -> Result<(), InvariantViolation> {
        let entries = self.lock();
        let entry = entries.get(run_id).copied().unwrap_or_default();
        check(&entry).map_err(|detail| self.violation_for(&entry, run_id, context, detail))
    }

    fn violation_for(
        &self,
        entry: &RunStatusEntry,
        run_id: &str,
        context: &str,
        detail: String,
    ) -> InvariantViolation {
        InvariantViolation::new(run_id, context, detail, entry.cookie, entry.preflight)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunStatusEntry>> {
        match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
impl StatusRegistry {
    /// Test-only: place a run in an arbitrary status pair, bypassing the
    /// sealed mutators.
    pub fn force_statuses_for_tests(
        &self,
        run_id: &str,
        cookie: CookieStatus,
        preflight: PreflightStatus,
    ) {
        let mut entries = self.lock();
        let entry = entries.entry(run_id.to_string()).or_default();
        entry.cookie = cookie;
        entry.preflight = preflight;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_start_not_started_and_advance_monotonically() {
        let registry = StatusRegistry::new();
        registry.reset("run-1");
        assert_eq!(registry.cookie_status("run-1"), CookieStatus::NotStarted);

        registry.advance_cookie_status("run-1", CookieStatus::InProgress).expect("advance");
        registry.advance_cookie_status("run-1", CookieStatus::Completed).expect("advance");
        let regression = registry.advance_cookie_status("run-1", CookieStatus::InProgress);
        assert!(regression.is_err());
        assert_eq!(registry.cookie_status("run-1"), CookieStatus::Completed);
    }

    #[test]
    fn same_status_advance_is_idempotent() {
        let registry = StatusRegistry::new();
        registry.reset("run-1");
        registry.advance_preflight_status("run-1", PreflightStatus::Completed).expect("advance");
        registry.advance_preflight_status("run-1", PreflightStatus::Completed).expect("idempotent");
    }

    #[test]
    fn cookie_handling_allowed_only_before_start() {
        let registry = StatusRegistry::new();
        registry.reset("run-1");
        registry.assert_cookie_handling_allowed("run-1", "cookie_machine").expect("allowed");
        registry.advance_cookie_status("run-1", CookieStatus::InProgress).expect("advance");
        let violation =
            registry.assert_cookie_handling_allowed("run-1", "cookie_machine").unwrap_err();
        assert_eq!(violation.run_id, "run-1");
        assert_eq!(violation.cookie_status, CookieStatus::InProgress);
    }

    #[test]
    fn capture_guards_require_completed_preflight() {
        let registry = StatusRegistry::new();
        registry.reset("run-1");
        assert!(registry
            .assert_preflight_completed_before_screenshot("run-1", "capture_state")
            .is_err());
        assert!(registry
            .assert_preflight_completed_before_dom_snapshot("run-1", "capture_state")
            .is_err());
        assert!(registry
            .assert_preflight_completed_before_ai_analysis("run-1", "planner")
            .is_err());
        assert!(registry
            .assert_preflight_completed_before_diagnosis("run-1", "diagnosis")
            .is_err());

        registry.advance_preflight_status("run-1", PreflightStatus::Completed).expect("advance");
        registry
            .assert_preflight_completed_before_screenshot("run-1", "capture_state")
            .expect("allowed");
    }

    #[test]
    fn irl_is_forbidden_only_while_preflight_runs() {
        let registry = StatusRegistry::new();
        registry.reset("run-1");
        registry.assert_no_irl_during_preflight("run-1", "irl").expect("before preflight");
        registry.advance_preflight_status("run-1", PreflightStatus::InProgress).expect("advance");
        assert!(registry.assert_no_irl_during_preflight("run-1", "irl").is_err());
        registry.advance_preflight_status("run-1", PreflightStatus::Completed).expect("advance");
        registry.assert_no_irl_during_preflight("run-1", "irl").expect("after preflight");
    }

    #[test]
    fn overlay_dismissal_forbidden_after_preflight() {
        let registry = StatusRegistry::new();
        registry.reset("run-1");
        registry
            .assert_no_overlay_dismissal_outside_preflight("run-1", "popup_dismiss")
            .expect("during preflight");
        registry.advance_preflight_status("run-1", PreflightStatus::Completed).expect("advance");
        assert!(registry
            .assert_no_overlay_dismissal_outside_preflight("run-1", "popup_dismiss")
            .is_err());
    }

    #[test]
    fn reset_restores_fresh_entry() {
        let registry = StatusRegistry::new();
        registry.reset("run-1");
        registry.advance_cookie_status("run-1", CookieStatus::Completed).expect("advance");
        registry.reset("run-1");
        assert_eq!(registry.cookie_status("run-1"), CookieStatus::NotStarted);
    }
}
