use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Diagnosis output: a four-section narrative plus structured component
/// lists.
pub struct TestabilityReport {
    /// Narrative with What/How/Why/Result sections.
    pub narrative: String,
    pub testable: Vec<String>,
    pub non_testable: Vec<String>,
    pub high_risk: Vec<String>,
    /// True when the deterministic fallback produced this report.
    pub from_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Root-cause analysis for a step error.
pub struct ErrorAnalysis {
    pub root_cause: String,
    /// Fixes ordered by priority, most urgent first.
    pub fixes: Vec<String>,
    pub from_fallback: bool,
}

#[derive(Debug, Clone, Default)]
/// Inputs to context synthesis.
pub struct SynthesisInput {
    pub dom: String,
    pub console_logs: Vec<String>,
    pub network_errors: Vec<String>,
    pub goal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Condensed page-state synthesis.
pub struct ContextSynthesis {
    pub summary: String,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub from_fallback: bool,
}
