use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::run::TestMode;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Per-mode constants. Every call site reads this table; defaults are never
/// re-declared elsewhere.
pub struct TestModeConfig {
    pub mode: TestMode,
    pub max_steps: u32,
    pub phase_timeout_ms: u64,
    pub diagnosis_required: bool,
    pub requires_auth: bool,
    pub default_model: String,
    pub temperature: f32,
    pub vision_enabled: bool,
}

impl TestModeConfig {
    /// Resolves the constant configuration for a test mode.
    pub fn for_mode(mode: TestMode) -> Self {
        let (max_steps, phase_timeout_ms, diagnosis_required, requires_auth, vision_enabled) =
            match mode {
                TestMode::Single => (50, 120_000, true, false, true),
                TestMode::Multi => (75, 180_000, true, false, true),
                TestMode::All => (100, 300_000, true, false, true),
                TestMode::Monkey => (50, 120_000, false, false, false),
                TestMode::Guest => (25, 60_000, false, false, false),
                TestMode::Behavior => (100, 300_000, true, true, true),
            };
        Self {
            mode,
            max_steps,
            phase_timeout_ms,
            diagnosis_required,
            requires_auth,
            default_model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            vision_enabled,
        }
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_caps_match_mode_table() {
        assert_eq!(TestModeConfig::for_mode(TestMode::Single).max_steps, 50);
        assert_eq!(TestModeConfig::for_mode(TestMode::Multi).max_steps, 75);
        assert_eq!(TestModeConfig::for_mode(TestMode::All).max_steps, 100);
        assert_eq!(TestModeConfig::for_mode(TestMode::Monkey).max_steps, 50);
        assert_eq!(TestModeConfig::for_mode(TestMode::Guest).max_steps, 25);
        assert_eq!(TestModeConfig::for_mode(TestMode::Behavior).max_steps, 100);
    }

    #[test]
    fn guest_mode_is_fast_and_vision_free() {
        let config = TestModeConfig::for_mode(TestMode::Guest);
        assert_eq!(config.phase_timeout_ms, 60_000);
        assert!(!config.vision_enabled);
        assert!(!config.diagnosis_required);
    }

    #[test]
    fn behavior_mode_requires_auth_and_diagnosis() {
        let config = TestModeConfig::for_mode(TestMode::Behavior);
        assert!(config.requires_auth);
        assert!(config.diagnosis_required);
        assert_eq!(config.phase_timeout_ms, 300_000);
    }
}
