use tracing_subscriber::{fmt, EnvFilter};

use crate::env::non_empty_env_var;

/// Initializes the global tracing subscriber for the engine process.
///
/// Filter resolution order: `LOG_LEVEL`, then `RUST_LOG`, then `info`.
/// Safe to call more than once; subsequent calls are no-ops.
pub fn init_telemetry() {
    let directive = non_empty_env_var("LOG_LEVEL")
        .or_else(|| non_empty_env_var("RUST_LOG"))
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
