use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
/// Element bounds in CSS pixels.
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn is_zero_size(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One interactive element extracted from the DOM, optionally annotated by
/// the vision model.
pub struct InteractiveElement {
    pub element_type: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aria_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_visible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_interactable: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One flagged accessibility problem.
pub struct AccessibilityIssue {
    pub selector: String,
    pub issue: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
/// Flagged nodes from the accessibility pass, capped by configuration.
pub struct AccessibilitySummary {
    pub issues: Vec<AccessibilityIssue>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Structured per-page artifact consumed by planning and diagnosis.
pub struct VisionContext {
    pub url: String,
    pub elements: Vec<InteractiveElement>,
    pub accessibility: AccessibilitySummary,
    pub total_elements_found: usize,
    pub vision_validated: bool,
    pub captured_unix_ms: u64,
}

impl VisionContext {
    /// Elements the vision model confirmed visible, or all elements when no
    /// validation ran.
    pub fn visible_elements(&self) -> Vec<&InteractiveElement> {
        if !self.vision_validated {
            return self.elements.iter().collect();
        }
        let visible: Vec<&InteractiveElement> = self
            .elements
            .iter()
            .filter(|element| element.vision_visible == Some(true))
            .collect();
        if visible.is_empty() {
            self.elements.iter().collect()
        } else {
            visible
        }
    }
}
