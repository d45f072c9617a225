use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::partial::{extract_best_effort, minimal_report};
use super::ParseRecoveryExhausted;

type JsonObject = Map<String, Value>;

/// The stage at which a JSON object was recovered, in the order tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStage {
    Direct,
    FenceStripped,
    BraceExtracted,
    TrailingCommas,
    BalancedBrackets,
    ClosedString,
    TrimmedTail,
    Partial,
    Minimal,
}

impl RepairStage {
    /// True when the object came from a real JSON parse rather than
    /// pattern scraping or the synthetic fallback.
    pub fn is_structural(&self) -> bool {
        *self <= Self::TrimmedTail
    }
}

#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub value: JsonObject,
    pub stage: RepairStage,
}

impl ParseOutcome {
    pub fn is_partial(&self) -> bool {
        !self.stage.is_structural()
    }
}

pub fn parse(text: &str) -> JsonObject {
    parse_with_outcome(text).value
}

pub fn parse_with_outcome(text: &str) -> ParseOutcome {
    if text.trim().is_empty() {
        warn!("empty model response, returning minimal structure");
        return ParseOutcome {
            value: minimal_report(""),
            stage: RepairStage::Minimal,
        };
    }

    match recover_object(text) {
        Ok((value, stage)) => {
            if stage != RepairStage::Direct {
                debug!(?stage, "recovered JSON object from model response");
            }
            ParseOutcome { value, stage }
        }
        Err(err) => {
            let cleaned = strip_fences(text).unwrap_or_else(|| text.trim().to_string());
            match extract_best_effort(&cleaned) {
                Some(value) => {
                    warn!(%err, "falling back to partial field extraction");
                    ParseOutcome {
                        value,
                        stage: RepairStage::Partial,
                    }
                }
                None => {
                    warn!(%err, "no recoverable fields, returning minimal structure");
                    ParseOutcome {
                        value: minimal_report(&cleaned),
                        stage: RepairStage::Minimal,
                    }
                }
            }
        }
    }
}

fn parse_object(text: &str) -> Option<JsonObject> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn recover_object(text: &str) -> Result<(JsonObject, RepairStage), ParseRecoveryExhausted> {
    if let Some(map) = parse_object(text) {
        return Ok((map, RepairStage::Direct));
    }

    let stripped = strip_fences(text);
    if let Some(map) = stripped.as_deref().and_then(parse_object) {
        return Ok((map, RepairStage::FenceStripped));
    }

    let body = stripped.as_deref().unwrap_or(text);
    let start = body
        .find('{')
        .ok_or_else(|| ParseRecoveryExhausted::new("no opening brace"))?;

    let candidate = match balanced_block(body, start) {
        Some(block) => {
            if let Some(map) = parse_object(block) {
                return Ok((map, RepairStage::BraceExtracted));
            }
            block
        }
        // Truncated: everything after the first brace is all we have.
        None => &body[start..],
    };

    let without_commas = remove_trailing_commas(candidate);
    if let Some(map) = parse_object(&without_commas) {
        return Ok((map, RepairStage::TrailingCommas));
    }

    let balanced = remove_trailing_commas(&balance_brackets(&without_commas));
    if let Some(map) = parse_object(&balanced) {
        return Ok((map, RepairStage::BalancedBrackets));
    }

    let closed = close_unterminated_string(&without_commas);
    let closed_balanced = remove_trailing_commas(&balance_brackets(&closed));
    if let Some(map) = parse_object(&closed_balanced) {
        return Ok((map, RepairStage::ClosedString));
    }

    let trimmed = remove_trailing_commas(&balance_brackets(&trim_dangling_member(&closed)));
    if let Some(map) = parse_object(&trimmed) {
        return Ok((map, RepairStage::TrimmedTail));
    }

    Err(ParseRecoveryExhausted::new(
        "structural repair did not produce valid JSON",
    ))
}

/// Remove a leading ```` ``` ```` fence (with optional language tag) and a
/// trailing fence. Returns `None` when there is no fence.
pub fn strip_fences(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let mut body = trimmed;
    let mut changed = false;

    if let Some(rest) = body.strip_prefix("```") {
        let tag_len = rest
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '-' && c != '_')
            .unwrap_or(rest.len());
        body = &rest[tag_len..];
        changed = true;
    }
    if let Some(rest) = body.trim_end().strip_suffix("```") {
        body = rest;
        changed = true;
    }

    changed.then(|| body.trim().to_string())
}

/// Slice from the `{` at `start` to its matching `}`, ignoring braces
/// inside string literals.
fn balanced_block(text: &str, start: usize) -> Option<&str> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                if stack.is_empty() {
                    let end = start + offset + ch.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Drop commas that directly precede `}` or `]`, outside string literals.
pub fn remove_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            continue;
        }

        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(ch);
                }
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Append the closers missing from `text`, innermost first.
pub fn balance_brackets(text: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut out = text.trim_end().to_string();
    out.extend(stack.iter().rev());
    out
}

/// Close a string literal left open at the end of `text`.
pub fn close_unterminated_string(text: &str) -> String {
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            _ => {}
        }
    }

    if !in_string {
        return text.to_string();
    }
    let mut out = text.to_string();
    if escaped {
        // A dangling backslash would escape the quote we add.
        out.pop();
    }
    out.push('"');
    out
}

/// Cut a truncated trailing member (`"key"`, `"key":`, `"key": tru`) back
/// to the last complete separator.
fn trim_dangling_member(text: &str) -> String {
    let mut in_string = false;
    let mut escaped = false;
    let mut last_separator: Option<(usize, char)> = None;

    for (idx, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            ',' | '{' | '[' => last_separator = Some((idx, ch)),
            '}' | ']' => last_separator = None,
            _ => {}
        }
    }

    match last_separator {
        Some((idx, ',')) => text[..idx].to_string(),
        Some((idx, opener)) => text[..idx + opener.len_utf8()].to_string(),
        None => text.to_string(),
    }
}
