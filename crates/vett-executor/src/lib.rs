//! Per-action execution for the Vett engine: the intelligent retry layer
//! with self-healing, and the test executor that gates it behind the phase
//! invariants.

mod executor;
mod retry_layer;

pub use executor::{
    CapturedState, ElementBound, ExecutionParams, ExecutionReport, ExecutorError, RecoveryAction,
    TestExecutor,
};
pub use retry_layer::{IntelligentRetryLayer, RetryOptions, RetryOutcome};
