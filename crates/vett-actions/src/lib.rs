//! Action generation: learned-action lookup first, then LLM planning, plus
//! alternative-selector healing and natural-language instruction parsing.

mod generator;
mod learned;

pub use generator::{
    ActionError, ActionGenerator, GenerationTracking, InstructionPlan, RELIABILITY_THRESHOLD,
};
pub use learned::{component_hash, LearnedAction, LearnedActionStore, MemoryLearnedActionStore};
