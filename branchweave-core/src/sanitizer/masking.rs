//! Text transforms used by sanitizable rules. Every transform here is minimal
//! (touches only what it must) and idempotent on its own output.

use branchweave_rules::Span;

use super::report::SanitizationDiff;

/// Replace each span with `placeholder`. Spans refer to `text` and may arrive unsorted.
pub fn redact(text: &str, spans: &[Span], placeholder: &str, rule_id: &str) -> (String, Vec<SanitizationDiff>) {
    let mut sorted: Vec<Span> = spans
        .iter()
        .copied()
        .filter(|s| s.start < s.end && s.end <= text.len())
        .collect();
    sorted.sort();

    let mut out = text.to_string();
    let mut diffs = Vec::with_capacity(sorted.len());
    // Replace from the end to keep indices stable.
    for s in sorted.iter().rev() {
        out.replace_range(s.start..s.end, placeholder);
    }
    for s in &sorted {
        diffs.push(SanitizationDiff {
            rule_id: rule_id.to_string(),
            offset: s.start,
            before: text[s.start..s.end].to_string(),
            after: placeholder.to_string(),
        });
    }
    (out, diffs)
}

/// CRLF/CR → LF, strip trailing blanks per line, strip trailing whitespace at the end.
pub fn normalize_whitespace(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<&str> = unified
        .split('\n')
        .map(|l| l.trim_end_matches([' ', '\t']))
        .collect();
    lines.join("\n").trim_end().to_string()
}

/// Cut `text` down to at most `max_chars` characters, preferring the last sentence end,
/// then the last whitespace, then a hard cut. Returns `None` if nothing would remain.
pub fn truncate_to_budget(text: &str, max_chars: usize) -> Option<String> {
    if text.chars().count() <= max_chars {
        return Some(text.to_string());
    }
    let hard_end = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let window = &text[..hard_end];

    let sentence_end = window
        .char_indices()
        .filter(|(_, c)| matches!(c, '.' | '!' | '?'))
        .map(|(i, c)| i + c.len_utf8())
        .filter(|&end| end == window.len() || window[end..].starts_with(char::is_whitespace))
        .last();

    let cut = match sentence_end {
        Some(end) => &window[..end],
        None => match window.rfind(char::is_whitespace) {
            Some(ws) => &window[..ws],
            None => window,
        },
    };
    let cut = cut.trim_end();
    if cut.trim().is_empty() {
        None
    } else {
        Some(cut.to_string())
    }
}
