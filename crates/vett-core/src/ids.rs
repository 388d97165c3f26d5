use std::sync::atomic::{AtomicU64, Ordering};

use crate::time_utils::current_unix_timestamp_ms;

static EVENT_COUNTER: AtomicU64 = AtomicU64::new(1);
static STEP_COUNTER: AtomicU64 = AtomicU64::new(1);
static INTERVAL_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Mints a process-unique event id.
pub fn new_event_id() -> String {
    let count = EVENT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("evt-{}-{count}", current_unix_timestamp_ms())
}

/// Mints a process-unique step id.
pub fn new_step_id() -> String {
    let count = STEP_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("step-{}-{count}", current_unix_timestamp_ms())
}

/// Picks a value in `[low_ms, high_ms]` without a PRNG dependency.
///
/// Uses a counter-mix construction so successive picks spread across the
/// interval while remaining reproducible under test.
pub fn bounded_interval_ms(low_ms: u64, high_ms: u64) -> u64 {
    if high_ms <= low_ms {
        return low_ms;
    }
    let width = high_ms - low_ms;
    let seed = INTERVAL_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mixed = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(17) ^ 0xA24B_AED4_963E_E407;
    low_ms + (mixed % width.saturating_add(1))
}
