use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
/// Typed action ADT. The model boundary parses loose `{action, selector,
/// value}` JSON into this union; selector preconditions are checked there.
pub enum Action {
    Click { selector: String },
    Type { selector: String, value: String },
    Scroll { delta_y: i64 },
    Navigate { url: String },
    Wait { ms: u64 },
    Assert { selector: String, predicate: String },
    Complete,
}

impl Action {
    /// Stable label used in step records and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Click { .. } => "click",
            Self::Type { .. } => "type",
            Self::Scroll { .. } => "scroll",
            Self::Navigate { .. } => "navigate",
            Self::Wait { .. } => "wait",
            Self::Assert { .. } => "assert",
            Self::Complete => "complete",
        }
    }

    /// Selector the action targets, when it has one.
    pub fn selector(&self) -> Option<&str> {
        match self {
            Self::Click { selector }
            | Self::Type { selector, .. }
            | Self::Assert { selector, .. } => Some(selector),
            _ => None,
        }
    }

    /// True for the action kinds the intelligent retry layer may wrap.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Click { .. } | Self::Type { .. } | Self::Assert { .. })
    }

    /// True when dispatching this action consults a model.
    pub fn requires_ai(&self) -> bool {
        // Every planned step is model-generated; wait/complete are the only
        // kinds the sequencer can emit without consulting the planner.
        !matches!(self, Self::Wait { .. } | Self::Complete)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
/// JSON-boundary failures when parsing a model-produced action.
pub enum ActionParseError {
    #[error("action payload is not a JSON object")]
    NotAnObject,
    #[error("missing or empty 'action' field")]
    MissingKind,
    #[error("unknown action kind '{0}'")]
    UnknownKind(String),
    #[error("action '{0}' requires a selector")]
    MissingSelector(String),
    #[error("action 'type' requires a value")]
    MissingValue,
    #[error("action 'navigate' requires a url")]
    MissingUrl,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// An action plus the planner metadata carried alongside it.
pub struct PlannedAction {
    #[serde(flatten)]
    pub action: Action,
    pub description: String,
    pub confidence: f64,
}

impl PlannedAction {
    pub fn new(action: Action, description: impl Into<String>, confidence: f64) -> Self {
        Self {
            action,
            description: description.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Parses a loose model JSON payload into a validated planned action.
    pub fn from_model_json(value: &Value) -> Result<Self, ActionParseError> {
        let object = value.as_object().ok_or(ActionParseError::NotAnObject)?;
        let kind = object
            .get("action")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|kind| !kind.is_empty())
            .ok_or(ActionParseError::MissingKind)?
            .to_ascii_lowercase();

        let selector = object
            .get("selector")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|selector| !selector.is_empty())
            .map(str::to_string);
        let text_value = object
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string);

        let action = match kind.as_str() {
            "click" => Action::Click {
                selector: selector.ok_or_else(|| ActionParseError::MissingSelector(kind.clone()))?,
            },
            "type" | "fill" => Action::Type {
                selector: selector.ok_or_else(|| ActionParseError::MissingSelector(kind.clone()))?,
                value: text_value.ok_or(ActionParseError::MissingValue)?,
            },
            "assert" => Action::Assert {
                selector: selector.ok_or_else(|| ActionParseError::MissingSelector(kind.clone()))?,
                predicate: text_value.unwrap_or_else(|| "visible".to_string()),
            },
            "scroll" => Action::Scroll {
                delta_y: object.get("delta_y").and_then(Value::as_i64).unwrap_or(600),
            },
            "navigate" => Action::Navigate {
                url: object
                    .get("url")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or(text_value)
                    .ok_or(ActionParseError::MissingUrl)?,
            },
            "wait" => Action::Wait {
                ms: object.get("ms").and_then(Value::as_u64).unwrap_or(1_000),
            },
            "complete" | "done" => Action::Complete,
            other => return Err(ActionParseError::UnknownKind(other.to_string())),
        };

        let description = object
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let confidence = object
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5);
        Ok(Self::new(action, description, confidence))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Execution context an action is dispatched under. The cookie-consent
/// context forbids the intelligent retry layer.
pub enum ActionContext {
    General,
    CookieConsent,
    Recovery,
}

impl ActionContext {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::CookieConsent => "cookie_consent",
            Self::Recovery => "recovery",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Strategy behind an alternative selector suggestion.
pub enum SelectorStrategy {
    Text,
    Attribute,
    Position,
    Role,
}

impl SelectorStrategy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "attribute" => Some(Self::Attribute),
            "position" => Some(Self::Position),
            "role" => Some(Self::Role),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One healing candidate produced for a failed selector.
pub struct AlternativeSelector {
    pub selector: String,
    pub strategy: SelectorStrategy,
    pub confidence: f64,
}
