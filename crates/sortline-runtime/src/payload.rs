//! Classification payload decoding.
//!
//! Producers in different deployments name the label field differently: a
//! direction decision (`decisao_direcao` / `decision`) or an object class
//! (`category` / `class` / `objeto_detectado`).  Decoding is a small tagged
//! step: look for a decision first, then a class, then fall back to the
//! configured default label.  A field that is absent, `null`, empty, or not a
//! string counts as absent.

use serde_json::{Map, Value};
use sortline_types::{ClassificationResult, LabelSource, SortError};

/// Decision field names, in lookup order.
pub const DECISION_FIELDS: &[&str] = &["decisao_direcao", "decision"];

/// Class field names, in lookup order.
pub const CATEGORY_FIELDS: &[&str] = &["category", "class", "objeto_detectado"];

/// The label-bearing field found in a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelField<'a> {
    Decision(&'a str),
    Category(&'a str),
    Missing,
}

impl<'a> LabelField<'a> {
    /// Pick the label field out of a decoded JSON object.
    pub fn pick(fields: &'a Map<String, Value>) -> Self {
        if let Some(label) = first_string(fields, DECISION_FIELDS) {
            LabelField::Decision(label)
        } else if let Some(label) = first_string(fields, CATEGORY_FIELDS) {
            LabelField::Category(label)
        } else {
            LabelField::Missing
        }
    }
}

fn first_string<'a>(fields: &'a Map<String, Value>, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .filter_map(|name| fields.get(*name).and_then(Value::as_str))
        .map(str::trim)
        .find(|label| !label.is_empty())
}

/// Decode a raw message body into a [`ClassificationResult`].
///
/// # Errors
///
/// Returns [`SortError::PayloadParse`] when `bytes` is not JSON or is JSON
/// but not an object.
pub fn decode_payload(bytes: &[u8], fallback_label: &str) -> Result<ClassificationResult, SortError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| SortError::PayloadParse(e.to_string()))?;
    let fields = match value {
        Value::Object(fields) => fields,
        other => {
            return Err(SortError::PayloadParse(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            )));
        }
    };

    let (label, source) = match LabelField::pick(&fields) {
        LabelField::Decision(label) => (label, LabelSource::Decision),
        LabelField::Category(label) => (label, LabelSource::Category),
        LabelField::Missing => (fallback_label, LabelSource::Fallback),
    };

    Ok(ClassificationResult {
        label: label.to_lowercase(),
        source,
        confidence: fields.get("confidence").and_then(Value::as_f64),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
