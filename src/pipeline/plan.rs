use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

pub const DEFAULT_CONFIDENCE: f64 = 0.5;
pub const DEFAULT_REASONING: &str = "No reasoning provided";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    RemoveBackground,
    ReplaceBackground,
    SetBackgroundColor,
    /// Anything else the model produced, kept verbatim for the execution log.
    Unknown(String),
}

impl ActionKind {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "remove_background" => Self::RemoveBackground,
            "replace_background" => Self::ReplaceBackground,
            "set_background_color" => Self::SetBackgroundColor,
            _ => Self::Unknown(value.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::RemoveBackground => "remove_background",
            Self::ReplaceBackground => "replace_background",
            Self::SetBackgroundColor => "set_background_color",
            Self::Unknown(raw) if raw.is_empty() => "unknown",
            Self::Unknown(raw) => raw.as_str(),
        }
    }
}

impl Serialize for ActionKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

impl Action {
    pub fn new(kind: ActionKind, confidence: f64) -> Self {
        Self {
            kind,
            confidence: clamp_confidence(confidence),
            params: None,
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), Value::String(value.into()));
        self
    }

    pub fn remove_background(confidence: f64) -> Self {
        Self::new(ActionKind::RemoveBackground, confidence)
    }

    pub fn replace_background(source: impl Into<String>, confidence: f64) -> Self {
        Self::new(ActionKind::ReplaceBackground, confidence).with_param("source", source)
    }

    pub fn set_background_color(color: impl Into<String>, confidence: f64) -> Self {
        Self::new(ActionKind::SetBackgroundColor, confidence).with_param("color", color)
    }

    /// Non-empty string parameter, trimmed.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params
            .as_ref()?
            .get(key)?
            .as_str()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(kind) => Self::new(ActionKind::parse(kind), DEFAULT_CONFIDENCE),
            Value::Object(obj) => {
                let kind = obj
                    .get("type")
                    .or_else(|| obj.get("kind"))
                    .and_then(Value::as_str)
                    .map(ActionKind::parse)
                    .unwrap_or_else(|| ActionKind::Unknown(String::from("unknown")));
                let confidence = obj
                    .get("confidence")
                    .and_then(confidence_from_value)
                    .unwrap_or(DEFAULT_CONFIDENCE);
                let params = obj.get("params").and_then(Value::as_object).cloned();
                Self {
                    kind,
                    confidence: clamp_confidence(confidence),
                    params,
                }
            }
            _ => Self::new(ActionKind::Unknown(String::from("unknown")), DEFAULT_CONFIDENCE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub actions: Vec<Action>,
    pub reasoning: String,
    pub warnings: Vec<String>,
}

impl Plan {
    pub fn new(actions: Vec<Action>, reasoning: impl Into<String>) -> Self {
        Self {
            actions,
            reasoning: reasoning.into(),
            warnings: Vec::new(),
        }
    }

    /// Validates a parsed model reply, backfilling whatever top-level keys
    /// are missing instead of rejecting the reply.
    pub fn from_object(mut obj: Map<String, Value>) -> Self {
        let raw_actions = match obj.remove("actions") {
            Some(Value::Array(items)) => items,
            Some(Value::Object(single)) => vec![Value::Object(single)],
            Some(Value::String(kind)) => vec![Value::String(kind)],
            _ => Vec::new(),
        };

        let mut actions = Vec::with_capacity(raw_actions.len());
        let mut nested_reasoning = None;
        let mut nested_warnings = None;
        for item in raw_actions {
            if let Some(entry) = item.as_object() {
                let has_kind = entry.contains_key("type") || entry.contains_key("kind");
                let misplaced = entry.contains_key("reasoning") || entry.contains_key("warnings");
                if !has_kind && misplaced {
                    if nested_reasoning.is_none() {
                        nested_reasoning = entry.get("reasoning").cloned();
                    }
                    if nested_warnings.is_none() {
                        nested_warnings = entry.get("warnings").cloned();
                    }
                    continue;
                }
            }
            actions.push(Action::from_value(&item));
        }

        let reasoning = obj
            .remove("reasoning")
            .filter(|v| !v.is_null())
            .or(nested_reasoning)
            .and_then(reasoning_from_value)
            .unwrap_or_else(|| DEFAULT_REASONING.to_string());
        let warnings = obj
            .remove("warnings")
            .filter(|v| !v.is_null())
            .or(nested_warnings)
            .map(warnings_from_value)
            .unwrap_or_default();

        Self {
            actions,
            reasoning,
            warnings,
        }
    }
}

pub fn is_plan_shaped(obj: &Map<String, Value>) -> bool {
    ["actions", "reasoning", "warnings"]
        .iter()
        .any(|key| obj.contains_key(*key))
}

pub fn format_confidence(confidence: f64) -> String {
    format!("{:.1}%", confidence * 100.0)
}

fn confidence_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok().map(|v| {
            if s.trim().ends_with('%') {
                v / 100.0
            } else {
                v
            }
        }),
        _ => None,
    }
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        DEFAULT_CONFIDENCE
    }
}

fn reasoning_from_value(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Array(parts) => Some(
            parts
                .iter()
                .map(value_to_text)
                .collect::<Vec<_>>()
                .join(" "),
        ),
        other => Some(other.to_string()),
    }
}

fn warnings_from_value(value: Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter(|v| !v.is_null())
            .map(value_to_text)
            .collect(),
        Value::String(s) if s.trim().is_empty() => Vec::new(),
        Value::String(s) => vec![s],
        Value::Null => Vec::new(),
        other => vec![other.to_string()],
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
