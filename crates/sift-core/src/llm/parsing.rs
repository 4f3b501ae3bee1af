//! Parsing of LLM batch responses
//!
//! Models wrap JSON in markdown fences, add prose around it, return ids as strings,
//! name categories instead of numbering them and report confidences outside [0, 1].
//! Each entry is parsed on its own so one bad entry never sinks the batch.

use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use super::LlmCategorization;
use crate::error::{Error, Result};
use crate::models::{clamp_confidence, Category, CategoryId};

/// Strip markdown code fences from a response
pub fn strip_code_fences(response: &str) -> &str {
    let trimmed = response.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the info string ("json") on the opening fence line
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end().trim_end_matches("```").trim()
}

/// Locate the JSON array in a response
pub fn extract_json_array(response: &str) -> Result<&str> {
    let body = strip_code_fences(response);
    match (body.find('['), body.rfind(']')) {
        (Some(start), Some(end)) if start < end => Ok(&body[start..=end]),
        _ => Err(Error::Llm(format!(
            "No JSON array found in LLM response | Raw: {}",
            truncate(body, 200)
        ))),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Parse a batch response into per-transaction categorizations.
///
/// Entries without a usable transaction id are dropped (the classifier reports those
/// transactions as missing). Everything else yields one entry, possibly with an error.
pub fn parse_batch_response(response: &str, categories: &[Category]) -> Result<Vec<LlmCategorization>> {
    let json = extract_json_array(response)?;
    let values: Vec<Value> = serde_json::from_str(json)
        .map_err(|e| Error::Llm(format!("Invalid JSON from LLM: {} | Raw: {}", e, truncate(json, 200))))?;

    let mut parsed = Vec::with_capacity(values.len());
    for value in &values {
        match parse_entry(value, categories) {
            Some(entry) => parsed.push(entry),
            None => warn!(entry = %truncate(&value.to_string(), 120), "Dropping LLM entry without transaction id"),
        }
    }
    Ok(parsed)
}

fn parse_entry(value: &Value, categories: &[Category]) -> Option<LlmCategorization> {
    let object = value.as_object()?;
    let transaction_id = object
        .get("transaction_id")
        .or_else(|| object.get("id"))
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s.trim()).ok())?;

    let rationale = ["rationale", "reasoning", "explanation"]
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();

    let mut entry = LlmCategorization {
        transaction_id,
        category_id: None,
        confidence: 0.0,
        rationale,
        error: None,
        flagged: false,
    };

    match object.get("confidence").and_then(number) {
        Some(raw) => {
            let clamped = clamp_confidence(raw);
            entry.flagged = clamped != raw;
            entry.confidence = clamped;
        }
        None => {
            entry.error = Some("missing or malformed confidence".to_string());
            return Some(entry);
        }
    }

    entry.category_id = resolve_category(object, categories);
    if entry.category_id.is_none() {
        entry.confidence = 0.0;
        entry.rationale = "no matching category".to_string();
    }
    Some(entry)
}

/// Numbers, or strings holding numbers
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A category id present in `categories`, or a case-insensitive name match
fn resolve_category(object: &serde_json::Map<String, Value>, categories: &[Category]) -> Option<CategoryId> {
    let by_id = object.get("category_id").and_then(|v| match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    });
    if let Some(id) = by_id {
        if categories.iter().any(|c| c.id == id) {
            return Some(id);
        }
    }

    ["category_name", "category", "category_id"]
        .iter()
        .filter_map(|key| object.get(*key).and_then(Value::as_str))
        .find_map(|name| {
            categories
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(name.trim()))
                .map(|c| c.id)
        })
}
