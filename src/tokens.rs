use regex::Regex;
use std::sync::OnceLock;

/// Tokens reserved between the prompt and the model's context limit.
const SAFETY_MARGIN: i64 = 1_000;
const MIN_OUTPUT_TOKENS: i64 = 2_000;
const MAX_OUTPUT_TOKENS: i64 = 8_000;

static MODEL_CONTEXT_WINDOWS: &[(&str, u32)] = &[
    ("gpt-4o-mini", 128_000),
    ("gpt-4o", 128_000),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo", 16_385),
    ("gemini-2.5-flash", 1_000_000),
    ("gemini-2.0-flash", 1_000_000),
    ("gemini-2.0-flash-exp", 1_000_000),
    ("gemini-1.5-pro", 2_000_000),
    ("gemini-1.5-flash", 1_000_000),
];

const SENTENCE_TERMINALS: [char; 6] = ['.', '!', '?', '。', '！', '？'];

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0xAC00..=0xD7A3   // Hangul syllables
        | 0x1100..=0x11FF // Hangul jamo
        | 0x3130..=0x318F // Hangul compatibility jamo
        | 0x3040..=0x30FF // Hiragana, Katakana
        | 0x3400..=0x4DBF
        | 0x4E00..=0x9FFF)
}

fn is_terminal(c: char) -> bool {
    SENTENCE_TERMINALS.contains(&c)
}

fn is_full_width_terminal(c: char) -> bool {
    matches!(c, '。' | '！' | '？')
}

pub fn estimate_tokens(text: &str) -> usize {
    let total = text.chars().count();
    if total == 0 {
        return 0;
    }
    let cjk = text.chars().filter(|c| is_cjk(*c)).count();
    let other = total - cjk;
    let estimated = (cjk as f64 / 1.5 + other as f64 / 4.0) as usize;
    estimated.max(total / 4)
}

/// Context window for `model`; unknown models get the smallest known window.
pub fn context_window(model: &str) -> u32 {
    let name = model.trim().trim_start_matches("models/");
    MODEL_CONTEXT_WINDOWS
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, window)| *window)
        .unwrap_or_else(smallest_context_window)
}

fn smallest_context_window() -> u32 {
    MODEL_CONTEXT_WINDOWS
        .iter()
        .map(|(_, window)| *window)
        .min()
        .unwrap_or(8_192)
}

pub fn max_output_tokens(model: &str, prompt_tokens: usize) -> u32 {
    let window = context_window(model) as i64;
    let prompt = i64::try_from(prompt_tokens).unwrap_or(i64::MAX);
    let available = window.saturating_sub(prompt).saturating_sub(SAFETY_MARGIN);
    available.clamp(MIN_OUTPUT_TOKENS, MAX_OUTPUT_TOKENS) as u32
}

fn ends_with_punctuation(text: &str) -> bool {
    text.chars().last().is_some_and(is_terminal)
}

/// Cut `text` to at most `max_chars` characters on sentence boundaries.
pub fn trim_to_length(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }

    let mut kept: Vec<&str> = Vec::new();
    let mut used = 0usize;
    for sentence in text.split(". ") {
        let len = sentence.chars().count();
        if used + len + 2 > max_chars {
            break;
        }
        kept.push(sentence);
        used += len + 2;
    }

    let mut result = kept.join(". ");
    if result.trim().is_empty() {
        return cut_on_word_boundary(text, max_chars);
    }
    if !ends_with_punctuation(&result) {
        result.push('.');
    }
    result
}

fn cut_on_word_boundary(text: &str, max_chars: usize) -> String {
    // Leave room for the closing period.
    let budget = max_chars.saturating_sub(1);
    let prefix: String = text.chars().take(budget).collect();
    let cut = match prefix.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => prefix[..idx].trim_end().to_string(),
        _ => prefix,
    };
    let mut cut = cut.trim_end().to_string();
    if !cut.is_empty() && !ends_with_punctuation(&cut) && cut.chars().count() < max_chars {
        cut.push('.');
    }
    cut
}

fn space_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r" {2,}").expect("valid regex"))
}

fn newline_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").expect("valid regex"))
}

pub fn optimize_prompt(prompt: &str, max_chars: Option<usize>) -> String {
    let collapsed = space_runs().replace_all(prompt, " ");
    let collapsed = newline_runs().replace_all(&collapsed, "\n\n");
    let optimized = match max_chars {
        Some(limit) => trim_to_length(&collapsed, limit),
        None => collapsed.into_owned(),
    };
    optimized.trim().to_string()
}

pub fn optimize_additional_context(context: Option<&str>, max_chars: usize) -> Option<String> {
    let context = context?.trim();
    if context.is_empty() {
        return None;
    }
    Some(trim_to_length(context, max_chars))
}

/// Byte offsets just past each sentence end in `text`.
///
/// A sentence ends at a terminal character followed by whitespace,
/// immediately after a full-width terminal, or at a blank line. A terminal
/// at the very end of `text` only counts when `at_end` is set; streaming
/// callers leave it unset because the next fragment may continue the number
/// or abbreviation.
pub fn sentence_ends(text: &str, at_end: bool) -> Vec<usize> {
    let mut ends = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        let boundary = if is_full_width_terminal(c) {
            true
        } else if is_terminal(c) {
            chars
                .peek()
                .map_or(at_end, |(_, next)| next.is_whitespace())
        } else if c == '\n' {
            matches!(chars.peek(), Some((_, '\n')))
        } else {
            false
        };
        if boundary {
            ends.push(idx + c.len_utf8());
        }
    }
    ends
}

pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for end in sentence_ends(text, true) {
        let sentence = text[start..end].trim();
        if !sentence.is_empty() {
            sentences.push(sentence.to_string());
        }
        start = end;
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

pub fn has_sentence_boundary(text: &str) -> bool {
    text.contains("\n\n") || text.chars().any(is_terminal)
}
