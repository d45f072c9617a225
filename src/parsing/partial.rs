//! Best-effort field scraping for responses no repair could parse.
//!
//! This is pattern matching, not parsing. Anything it returns is marked
//! with `"is_partial": true`.

use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::OnceLock;

/// Length of the raw-text preview kept in the minimal structure.
pub const PREVIEW_CHARS: usize = 500;

const SCRAPED_STRING_FIELDS: [&str; 2] = ["executive_summary", "target_keyword"];

fn complete_string_field(field: &str) -> Regex {
    Regex::new(&format!(r#""{field}"\s*:\s*"((?:[^"\\]|\\.)*)""#)).expect("valid regex")
}

fn truncated_string_field(field: &str) -> Regex {
    Regex::new(&format!(r#""{field}"\s*:\s*"((?:[^"\\]|\\.)*)\\?$"#)).expect("valid regex")
}

fn field_patterns() -> &'static Vec<(&'static str, Regex, Regex)> {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        SCRAPED_STRING_FIELDS
            .iter()
            .map(|field| {
                (
                    *field,
                    complete_string_field(field),
                    truncated_string_field(field),
                )
            })
            .collect()
    })
}

fn unescape(raw: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{raw}\"")).unwrap_or_else(|_| {
        raw.replace("\\\"", "\"")
            .replace("\\n", "\n")
            .replace("\\\\", "\\")
    })
}

fn scrape_string(text: &str, complete: &Regex, truncated: &Regex) -> Option<String> {
    let captured = complete
        .captures(text)
        .or_else(|| truncated.captures(text.trim_end()))?
        .get(1)?
        .as_str();
    let value = unescape(captured);
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn mentions(text: &str, key: &str) -> bool {
    text.contains(&format!("\"{key}\""))
}

/// Pull whatever recognisable report fields exist out of `text`.
///
/// Returns `None` when nothing was found.
pub fn extract_best_effort(text: &str) -> Option<Map<String, Value>> {
    let mut result = Map::new();

    for (field, complete, truncated) in field_patterns() {
        if let Some(value) = scrape_string(text, complete, truncated) {
            result.insert((*field).to_string(), Value::String(value));
        }
    }

    if mentions(text, "key_findings") {
        result.insert(
            "key_findings".to_string(),
            json!({
                "primary_insights": ["Key findings were present but could not be parsed."],
                "quantitative_metrics": {}
            }),
        );
    }
    if mentions(text, "detailed_analysis") {
        result.insert(
            "detailed_analysis".to_string(),
            json!({
                "insights": {"note": "The response was incomplete; only part of it was extracted."}
            }),
        );
    }
    if mentions(text, "strategic_recommendations") {
        result.insert(
            "strategic_recommendations".to_string(),
            json!({
                "immediate_actions": ["Recommendations were present but could not be parsed."]
            }),
        );
    }

    if result.is_empty() {
        return None;
    }
    result.insert("is_partial".to_string(), Value::Bool(true));
    Some(result)
}

pub fn preview(text: &str) -> String {
    let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        preview.push('…');
    }
    preview
}

/// Synthetic object returned when nothing could be recovered.
pub fn minimal_report(raw: &str) -> Map<String, Value> {
    let summary = if raw.trim().is_empty() {
        "The model returned an empty response."
    } else {
        "A response was received but could not be parsed as JSON."
    };
    let value = json!({
        "executive_summary": summary,
        "key_findings": {
            "primary_insights": [],
            "quantitative_metrics": {}
        },
        "error": "json_parse_failed",
        "raw_response_preview": preview(raw)
    });
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
