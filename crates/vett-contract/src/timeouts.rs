//! Per-action timeout constants, in milliseconds.

pub const DEFAULT_ACTION_TIMEOUT_MS: u64 = 30_000;
pub const NAVIGATION_TIMEOUT_MS: u64 = 60_000;
pub const INPUT_TIMEOUT_MS: u64 = 10_000;
pub const SCREENSHOT_TIMEOUT_MS: u64 = 5_000;
pub const SCREENSHOT_UPLOAD_TIMEOUT_MS: u64 = 15_000;
pub const AI_CALL_TIMEOUT_MS: u64 = 30_000;
pub const VISION_CALL_TIMEOUT_MS: u64 = 45_000;
