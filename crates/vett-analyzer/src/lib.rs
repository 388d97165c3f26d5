//! Page analyzer: turns a DOM snapshot (and optionally a screenshot) into the
//! structured vision context the planner and diagnosis phases consume.

mod analyzer;
mod extract;
mod reports;

pub use analyzer::{AnalyzerConfig, PageAnalyzer};
pub use extract::{extract_interactive_elements, ExtractionLimits};
pub use reports::{ContextSynthesis, ErrorAnalysis, SynthesisInput, TestabilityReport};
