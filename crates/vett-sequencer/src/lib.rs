//! The phase sequencer: drives one run through navigation, preflight,
//! diagnosis, planning, execution, and finalization while binding the AI
//! budget and the phase invariants.

mod engine;
mod plan;
mod sequencer;

pub use engine::{Engine, RunReport};
pub use plan::derive_goal;
pub use sequencer::RunCancellation;
