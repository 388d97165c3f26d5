use std::collections::HashMap;

use scraper::{ElementRef, Html, Selector};

use vett_contract::{AccessibilityIssue, AccessibilitySummary, InteractiveElement};
use vett_core::{collapse_whitespace, env_var_usize_with_floor, truncate_chars};

const ELEMENT_TEXT_CAP: usize = 80;

#[derive(Debug, Clone, Copy)]
/// Caps applied during extraction.
pub struct ExtractionLimits {
    pub dom_summary_limit: usize,
    pub accessibility_limit: usize,
}

impl ExtractionLimits {
    /// Reads `DOM_SUMMARY_LIMIT` (default 200, min 20) and
    /// `ACCESSIBILITY_SUMMARY_LIMIT` (default 40, min 5).
    pub fn from_env() -> Self {
        Self {
            dom_summary_limit: env_var_usize_with_floor("DOM_SUMMARY_LIMIT", 200, 20),
            accessibility_limit: env_var_usize_with_floor("ACCESSIBILITY_SUMMARY_LIMIT", 40, 5),
        }
    }
}

impl Default for ExtractionLimits {
    fn default() -> Self {
        Self { dom_summary_limit: 200, accessibility_limit: 40 }
    }
}

/// Deterministically extracts interactive elements from an HTML snapshot.
///
/// Returns the capped element list, the accessibility summary, and the total
/// number of interactive elements found before capping.
pub fn extract_interactive_elements(
    html: &str,
    limits: ExtractionLimits,
) -> (Vec<InteractiveElement>, AccessibilitySummary, usize) {
    let document = Html::parse_document(html);
    let selector = Selector::parse("button, input, a, select, textarea")
        .expect("static selector list parses");

    let mut elements = Vec::new();
    let mut nth_counters: HashMap<String, usize> = HashMap::new();
    let mut total = 0usize;

    for node in document.select(&selector) {
        total += 1;
        let tag = node.value().name().to_string();
        let nth = {
            let counter = nth_counters.entry(tag.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        if elements.len() >= limits.dom_summary_limit {
            continue;
        }
        elements.push(build_element(&node, &tag, nth));
    }

    let accessibility = summarize_accessibility(&elements, limits.accessibility_limit);
    (elements, accessibility, total)
}

fn build_element(node: &ElementRef<'_>, tag: &str, nth: usize) -> InteractiveElement {
    let value = node.value();
    let text = truncate_chars(&collapse_whitespace(&node.text().collect::<String>()), ELEMENT_TEXT_CAP);
    let aria_label = value.attr("aria-label").map(str::to_string);
    let name = value.attr("name").map(str::to_string);
    let href = (tag == "a").then(|| value.attr("href").map(str::to_string)).flatten();
    let input_type = value.attr("type").unwrap_or_default();
    let is_hidden = input_type.eq_ignore_ascii_case("hidden")
        || value.attr("hidden").is_some()
        || value
            .attr("style")
            .map(|style| style.contains("display:none") || style.contains("display: none"))
            .unwrap_or(false);

    InteractiveElement {
        element_type: if tag == "input" && !input_type.is_empty() {
            format!("input[{input_type}]")
        } else {
            tag.to_string()
        },
        role: value.attr("role").map(str::to_string).unwrap_or_else(|| implied_role(tag)),
        text: text.clone(),
        aria_label: aria_label.clone(),
        name: name.clone(),
        selector: best_selector(node, tag, &text, nth),
        bounds: None,
        is_hidden,
        is_required: value.attr("required").is_some(),
        href,
        vision_visible: None,
        vision_interactable: None,
    }
}

fn implied_role(tag: &str) -> String {
    match tag {
        "button" => "button",
        "a" => "link",
        "input" | "textarea" => "textbox",
        "select" => "combobox",
        _ => "",
    }
    .to_string()
}

/// Attribute values containing quotes would need escaping; skip those
/// candidates rather than emit a broken selector.
fn attr_candidate(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.is_empty() && !value.contains('"') && !value.contains('\''))
}

/// Best-effort CSS selector, in priority order: `#id`, `[data-testid]`,
/// `[data-id]`, href for links, `[name]`, `[placeholder]`, input `type`,
/// button `[aria-label]`, `:has-text(...)`, then `nth-of-type`.
fn best_selector(node: &ElementRef<'_>, tag: &str, text: &str, nth: usize) -> String {
    let value = node.value();
    if let Some(id) = attr_candidate(value.attr("id")) {
        return format!("#{id}");
    }
    if let Some(testid) = attr_candidate(value.attr("data-testid")) {
        return format!("[data-testid=\"{testid}\"]");
    }
    if let Some(data_id) = attr_candidate(value.attr("data-id")) {
        return format!("[data-id=\"{data_id}\"]");
    }
    if tag == "a" {
        if let Some(href) = attr_candidate(value.attr("href")) {
            return format!("a[href=\"{href}\"]");
        }
    }
    if let Some(name) = attr_candidate(value.attr("name")) {
        return format!("{tag}[name=\"{name}\"]");
    }
    if let Some(placeholder) = attr_candidate(value.attr("placeholder")) {
        return format!("{tag}[placeholder=\"{placeholder}\"]");
    }
    if tag == "input" {
        if let Some(input_type) = attr_candidate(value.attr("type")) {
            return format!("input[type=\"{input_type}\"]");
        }
    }
    if tag == "button" {
        if let Some(label) = attr_candidate(value.attr("aria-label")) {
            return format!("button[aria-label=\"{label}\"]");
        }
    }
    if !text.is_empty() && !text.contains('"') {
        return format!("{tag}:has-text(\"{}\")", truncate_chars(text, 40));
    }
    format!("{tag}:nth-of-type({nth})")
}

fn summarize_accessibility(
    elements: &[InteractiveElement],
    cap: usize,
) -> AccessibilitySummary {
    let mut issues = Vec::new();
    let mut truncated = false;
    for element in elements {
        let mut push = |issue: &str, selector: &str| {
            if issues.len() >= cap {
                truncated = true;
                return;
            }
            issues.push(AccessibilityIssue { selector: selector.to_string(), issue: issue.to_string() });
        };
        let unlabeled = element.text.is_empty()
            && element.aria_label.as_deref().unwrap_or_default().is_empty()
            && element.name.as_deref().unwrap_or_default().is_empty();
        if unlabeled && !element.is_hidden {
            push("interactive element has no accessible label", &element.selector);
        }
        if element.is_hidden && element.element_type != "input[hidden]" {
            push("interactive element is hidden", &element.selector);
        }
    }
    AccessibilitySummary { issues, truncated }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        <html><body>
          <button id="buy-now">Buy now</button>
          <button data-testid="cart-open">Cart</button>
          <a href="/pricing">Pricing</a>
          <input type="email" name="email" placeholder="Email" required>
          <input type="hidden" name="csrf" value="tok">
          <select name="plan"><option>Free</option></select>
          <textarea placeholder="Feedback"></textarea>
          <button aria-label="Close dialog"></button>
          <button></button>
        </body></html>
    "#;

    #[test]
    fn selector_priority_prefers_id_then_testid() {
        let (elements, _, total) =
            extract_interactive_elements(SAMPLE, ExtractionLimits::default());
        assert_eq!(total, 9);
        let selectors: Vec<&str> =
            elements.iter().map(|element| element.selector.as_str()).collect();
        assert!(selectors.contains(&"#buy-now"));
        assert!(selectors.contains(&"[data-testid=\"cart-open\"]"));
        assert!(selectors.contains(&"a[href=\"/pricing\"]"));
        assert!(selectors.contains(&"input[name=\"email\"]"));
        assert!(selectors.contains(&"select[name=\"plan\"]"));
        assert!(selectors.contains(&"textarea[placeholder=\"Feedback\"]"));
        assert!(selectors.contains(&"button[aria-label=\"Close dialog\"]"));
    }

    #[test]
    fn unlabeled_button_falls_back_to_nth_of_type() {
        let (elements, _, _) = extract_interactive_elements(SAMPLE, ExtractionLimits::default());
        let last_button = elements
            .iter()
            .filter(|element| element.element_type == "button")
            .next_back()
            .expect("button");
        assert_eq!(last_button.selector, "button:nth-of-type(4)");
    }

    #[test]
    fn hidden_inputs_are_captured_and_flagged() {
        let (elements, _, _) = extract_interactive_elements(SAMPLE, ExtractionLimits::default());
        let hidden = elements
            .iter()
            .find(|element| element.element_type == "input[hidden]")
            .expect("hidden input");
        assert!(hidden.is_hidden);
        assert_eq!(hidden.name.as_deref(), Some("csrf"));
    }

    #[test]
    fn required_and_href_metadata_survive() {
        let (elements, _, _) = extract_interactive_elements(SAMPLE, ExtractionLimits::default());
        let email = elements.iter().find(|element| element.selector == "input[name=\"email\"]").expect("email");
        assert!(email.is_required);
        let link = elements.iter().find(|element| element.element_type == "a").expect("link");
        assert_eq!(link.href.as_deref(), Some("/pricing"));
    }

    #[test]
    fn dom_summary_limit_caps_but_counts_total() {
        let many = format!(
            "<html><body>{}</body></html>",
            "<button>Go</button>".repeat(50)
        );
        let limits = ExtractionLimits { dom_summary_limit: 20, accessibility_limit: 40 };
        let (elements, _, total) = extract_interactive_elements(&many, limits);
        assert_eq!(elements.len(), 20);
        assert_eq!(total, 50);
    }

    #[test]
    fn accessibility_summary_flags_and_truncates() {
        let many = format!(
            "<html><body>{}</body></html>",
            "<button></button>".repeat(10)
        );
        let limits = ExtractionLimits { dom_summary_limit: 200, accessibility_limit: 5 };
        let (_, summary, _) = extract_interactive_elements(&many, limits);
        assert_eq!(summary.issues.len(), 5);
        assert!(summary.truncated);
        assert!(summary.issues[0].issue.contains("no accessible label"));
    }
}
