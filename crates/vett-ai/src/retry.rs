use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum attempts per model call, including the first.
pub const MAX_MODEL_ATTEMPTS: usize = 3;

/// Base delay before the first retry.
pub const BASE_RETRY_DELAY_MS: u64 = 1_000;

/// Jitter width as a fraction of the deterministic delay.
const JITTER_FRACTION: u64 = 10;

static JITTER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Statuses worth retrying: rate limits and server-side failures.
pub fn should_retry_status(status: u16) -> bool {
    status == 429 || status >= 500
}

/// Deterministic exponential delay: 1s, 2s, 4s for attempts 0, 1, 2.
pub fn base_delay_ms(attempt: usize) -> u64 {
    let shift = attempt.min(6) as u32;
    BASE_RETRY_DELAY_MS.saturating_mul(1_u64 << shift)
}

/// Delay with bounded ±10% jitter. Uses a counter-mix construction instead
/// of a PRNG so tests can assert the bounds.
pub fn retry_delay_ms(attempt: usize) -> u64 {
    let base = base_delay_ms(attempt);
    let width = base / JITTER_FRACTION;
    if width == 0 {
        return base;
    }
    let seed = JITTER_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mixed = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(17) ^ 0xA24B_AED4_963E_E407;
    let offset = mixed % (2 * width + 1);
    base - width + offset
}

/// Transport-level failures worth retrying.
pub fn is_retryable_http_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}
