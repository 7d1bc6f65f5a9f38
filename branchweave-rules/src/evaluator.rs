use crate::normalize::{for_rules, normalized_chars_with_spans};
use crate::types::{LexiconRule, RuleBook, Severity};
use anyhow::{Context, Result};
use serde::Serialize;
use std::{fs, path::Path};

// ----------------- Result -----------------

/// Byte range into the ORIGINAL (un-normalized) text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleMatch {
    pub rule_id: String,
    pub severity: Severity,
    pub sanitizable: bool,
    pub spans: Vec<Span>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResult {
    pub passed: bool,
    pub matches: Vec<RuleMatch>,
    pub reason: String,
    pub primary_rule: Option<String>,
    pub suggestion: Option<String>,
}

// ----------------- I/O -----------------

pub fn load_rulebook_from_file(path: &Path) -> Result<RuleBook> {
    let content = fs::read_to_string(path).with_context(|| format!("read rulebook {:?}", path))?;
    toml::from_str(&content).with_context(|| format!("parse rulebook {:?}", path))
}

// ----------------- Matching -----------------

/// Find every occurrence of `pattern` in `text`. With `word_bounded`, a hit must not
/// be glued to neighbouring alphanumerics ("hell" does not fire inside "shell").
pub fn find_pattern(text: &str, pattern: &str, word_bounded: bool) -> Vec<Span> {
    let pat: Vec<char> = for_rules(pattern).chars().collect();
    if pat.is_empty() {
        return Vec::new();
    }
    let (chars, spans) = normalized_chars_with_spans(text);
    if pat.len() > chars.len() {
        return Vec::new();
    }

    let plen = pat.len();
    let mut out = Vec::new();
    let mut i = 0usize;
    while i + plen <= chars.len() {
        let hit = (0..plen).all(|j| chars[i + j] == pat[j]);
        let bounded = !word_bounded
            || ((i == 0 || !chars[i - 1].is_alphanumeric())
                && (i + plen == chars.len() || !chars[i + plen].is_alphanumeric()));
        if hit && bounded {
            out.push(Span { start: spans[i].0, end: spans[i + plen - 1].1 });
            i += plen;
        } else {
            i += 1;
        }
    }
    out
}

/// Spans shielded by allow (idiom) rules.
pub fn allow_spans(text: &str, book: &RuleBook) -> Vec<Span> {
    let mut out = Vec::new();
    for rule in book.allow_rules() {
        for p in &rule.phrases {
            out.extend(find_pattern(text, p, false));
        }
        for t in &rule.terms {
            out.extend(find_pattern(text, t, true));
        }
    }
    out
}

/// Spans where `rule` fires in `text`, after removing allowlisted hits.
/// Result is sorted and merged so callers can redact back-to-front.
pub fn rule_spans(text: &str, rule: &LexiconRule, shields: &[Span]) -> Vec<Span> {
    let mut ranges: Vec<Span> = Vec::new();
    for p in &rule.phrases {
        if !p.trim().is_empty() {
            ranges.extend(find_pattern(text, p, false));
        }
    }
    for t in &rule.terms {
        if !t.trim().is_empty() {
            ranges.extend(find_pattern(text, t, true));
        }
    }
    ranges.retain(|r| !shields.iter().any(|s| s.contains(r)));
    merge(ranges)
}

fn merge(mut ranges: Vec<Span>) -> Vec<Span> {
    ranges.sort();
    let mut merged: Vec<Span> = Vec::new();
    for r in ranges {
        if let Some(last) = merged.last_mut() {
            if r.start <= last.end {
                last.end = last.end.max(r.end);
                continue;
            }
        }
        merged.push(r);
    }
    merged
}

// ----------------- Core -----------------

/// Evaluate every enforcement rule (critical first) against `input`.
pub fn evaluate_input_against_rules(input: &str, book: &RuleBook) -> EvaluationResult {
    let shields = allow_spans(input, book);
    let mut matches = Vec::new();

    for rule in book.enforcement_rules() {
        let spans = rule_spans(input, rule, &shields);
        if !spans.is_empty() {
            matches.push(RuleMatch {
                rule_id: rule.id.clone(),
                severity: rule.severity,
                sanitizable: rule.sanitizable,
                spans,
            });
        }
    }

    if matches.is_empty() {
        return EvaluationResult {
            passed: true,
            matches,
            reason: "No violations detected.".into(),
            primary_rule: None,
            suggestion: None,
        };
    }

    // enforcement_rules() is already critical-first, so the first match is the primary.
    let primary_id = matches[0].rule_id.clone();
    let suggestion = book
        .rules
        .iter()
        .find(|r| r.id == primary_id)
        .and_then(|r| r.suggestion.clone());

    EvaluationResult {
        passed: false,
        reason: format!("Violated {} rule(s).", matches.len()),
        primary_rule: Some(primary_id),
        suggestion,
        matches,
    }
}
