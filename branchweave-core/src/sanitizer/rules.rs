//! The closed set of rule kinds the validation pipeline knows how to run.
//!
//! Each kind has a fixed id, severity and stage; `RuleSet::standard` is the only
//! way to build an ordered rule list, so stage order cannot be rearranged per call.

use std::borrow::Cow;

use branchweave_rules::evaluator::{allow_spans, find_pattern, rule_spans};
use branchweave_rules::{LexiconRule, RuleBook, Severity, Span};

use super::context::{NodeKind, ValidationContext};
use super::markup;
use super::masking;
use super::report::{RuleOutcome, Stage};
use crate::config::PhaseTarget;

#[derive(Debug, Clone, PartialEq)]
pub enum RuleKind {
    EncodingValidity,
    MarkupSyntax,
    Lexicon(LexiconRule),
    LoreContinuity,
    CharacterVoice,
    ThematicDrift,
    PacingFit,
    ReturnPathReachability,
    ReturnPathPlausibility,
    MarkupFilter,
    WhitespaceNormalization,
    LengthBudget,
}

/// Everything a rule may read besides the text under test.
pub struct RuleEnv<'a> {
    pub ctx: &'a ValidationContext,
    pub book: &'a RuleBook,
    pub return_path: &'a str,
    pub placeholder: &'a str,
    pub allowed_markup: &'a [String],
    pub theme_drift_tolerance: usize,
    pub target: PhaseTarget,
}

/// What a single rule saw. `rewrite` is a proposed sanitized text; the pipeline
/// applies it and re-runs the rule to confirm.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub outcome: RuleOutcome,
    pub severity: Severity,
    pub spans: Vec<Span>,
    pub rewrite: Option<String>,
    pub note: Option<String>,
}

impl Evaluation {
    fn passed(severity: Severity) -> Self {
        Self { outcome: RuleOutcome::Passed, severity, spans: vec![], rewrite: None, note: None }
    }

    fn with(outcome: RuleOutcome, severity: Severity, spans: Vec<Span>, note: impl Into<String>) -> Self {
        Self { outcome, severity, spans, rewrite: None, note: Some(note.into()) }
    }

    pub fn is_passed(&self) -> bool {
        self.outcome == RuleOutcome::Passed
    }
}

impl RuleKind {
    pub fn id(&self) -> Cow<'_, str> {
        match self {
            RuleKind::EncodingValidity => "encoding_validity_check".into(),
            RuleKind::MarkupSyntax => "markup_syntax_check".into(),
            RuleKind::Lexicon(rule) => format!("lexicon:{}", rule.id).into(),
            RuleKind::LoreContinuity => "lore_continuity_check".into(),
            RuleKind::CharacterVoice => "character_voice_check".into(),
            RuleKind::ThematicDrift => "thematic_drift_check".into(),
            RuleKind::PacingFit => "pacing_fit_check".into(),
            RuleKind::ReturnPathReachability => "return_path_reachability_check".into(),
            RuleKind::ReturnPathPlausibility => "return_path_plausibility_check".into(),
            RuleKind::MarkupFilter => "markup_filter_check".into(),
            RuleKind::WhitespaceNormalization => "whitespace_normalization_check".into(),
            RuleKind::LengthBudget => "length_budget_check".into(),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            RuleKind::EncodingValidity | RuleKind::MarkupSyntax => Severity::Critical,
            RuleKind::Lexicon(rule) => rule.severity,
            RuleKind::LoreContinuity | RuleKind::CharacterVoice => Severity::High,
            RuleKind::ReturnPathReachability => Severity::High,
            RuleKind::ThematicDrift | RuleKind::PacingFit | RuleKind::ReturnPathPlausibility => {
                Severity::Medium
            }
            RuleKind::MarkupFilter | RuleKind::WhitespaceNormalization | RuleKind::LengthBudget => {
                Severity::Low
            }
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            RuleKind::EncodingValidity | RuleKind::MarkupSyntax => Stage::Structural,
            RuleKind::Lexicon(_) => Stage::Safety,
            RuleKind::LoreContinuity
            | RuleKind::CharacterVoice
            | RuleKind::ThematicDrift
            | RuleKind::PacingFit => Stage::Coherence,
            RuleKind::ReturnPathReachability | RuleKind::ReturnPathPlausibility => Stage::ReturnPath,
            RuleKind::MarkupFilter | RuleKind::WhitespaceNormalization | RuleKind::LengthBudget => {
                Stage::Format
            }
        }
    }

    /// Run the rule against `text`. Pure: same inputs, same evaluation.
    pub fn evaluate(&self, text: &str, env: &RuleEnv<'_>) -> Evaluation {
        let sev = self.severity();
        match self {
            RuleKind::EncodingValidity => {
                if text.trim().is_empty() {
                    return Evaluation::with(RuleOutcome::Failed, sev, vec![], "empty payload");
                }
                let bad: Vec<Span> = text
                    .char_indices()
                    .filter(|(_, c)| {
                        *c == '\u{FFFD}' || (c.is_control() && !matches!(c, '\n' | '\t' | '\r'))
                    })
                    .map(|(i, c)| Span { start: i, end: i + c.len_utf8() })
                    .collect();
                if bad.is_empty() {
                    Evaluation::passed(sev)
                } else {
                    Evaluation::with(RuleOutcome::Failed, sev, bad, "control or replacement characters")
                }
            }
            RuleKind::MarkupSyntax => match markup::check_syntax(text) {
                Ok(()) => Evaluation::passed(sev),
                Err(e) => Evaluation::with(
                    RuleOutcome::Failed,
                    sev,
                    vec![Span { start: e.offset, end: (e.offset + 1).min(text.len()) }],
                    e.reason,
                ),
            },
            RuleKind::Lexicon(rule) => {
                let shields = allow_spans(text, env.book);
                let spans = rule_spans(text, rule, &shields);
                if spans.is_empty() {
                    return Evaluation::passed(sev);
                }
                let mut eval = Evaluation::with(
                    RuleOutcome::Failed,
                    sev,
                    spans.clone(),
                    rule.suggestion.clone().unwrap_or_else(|| format!("{:?} lexicon hit", rule.category)),
                );
                if rule.sanitizable {
                    let (rewritten, _) = masking::redact(text, &spans, env.placeholder, &rule.id);
                    eval.rewrite = Some(rewritten);
                }
                eval
            }
            RuleKind::LoreContinuity => {
                let mut spans = Vec::new();
                let mut facts = Vec::new();
                for fact in &env.ctx.lore.facts {
                    let before = spans.len();
                    for phrase in &fact.contradicted_by {
                        spans.extend(find_pattern(text, phrase, false));
                    }
                    if spans.len() > before {
                        facts.push(fact.id.as_str());
                    }
                }
                if spans.is_empty() {
                    Evaluation::passed(sev)
                } else {
                    spans.sort();
                    let note = format!("contradicts lore: {}", facts.join(", "));
                    Evaluation::with(RuleOutcome::Failed, sev, spans, note)
                }
            }
            RuleKind::CharacterVoice => {
                let mut spans = Vec::new();
                let mut speakers = Vec::new();
                let mut line_start = 0usize;
                for line in text.split('\n') {
                    if let Some((speaker, _)) = line.split_once(':') {
                        let speaker = speaker.trim();
                        if let Some(voice) = env
                            .ctx
                            .voices
                            .iter()
                            .find(|v| v.name.eq_ignore_ascii_case(speaker))
                        {
                            let before = spans.len();
                            for phrase in &voice.off_voice {
                                spans.extend(find_pattern(line, phrase, false).into_iter().map(|s| Span {
                                    start: s.start + line_start,
                                    end: s.end + line_start,
                                }));
                            }
                            if spans.len() > before && !speakers.contains(&voice.name.as_str()) {
                                speakers.push(voice.name.as_str());
                            }
                        }
                    }
                    line_start += line.len() + 1;
                }
                if spans.is_empty() {
                    Evaluation::passed(sev)
                } else {
                    let note = format!("voice drift: {}", speakers.join(", "));
                    Evaluation::with(RuleOutcome::Failed, sev, spans, note)
                }
            }
            RuleKind::ThematicDrift => {
                let mut spans: Vec<Span> = Vec::new();
                for term in &env.ctx.theme.off_theme {
                    spans.extend(find_pattern(text, term, true));
                }
                spans.sort();
                let hits = spans.len();
                if hits == 0 {
                    Evaluation::passed(sev)
                } else if hits <= env.theme_drift_tolerance {
                    Evaluation::with(RuleOutcome::Warning, sev, spans, format!("{hits} off-theme term(s)"))
                } else {
                    Evaluation::with(
                        RuleOutcome::Failed,
                        Severity::High,
                        spans,
                        format!("{hits} off-theme term(s), tolerance {}", env.theme_drift_tolerance),
                    )
                }
            }
            RuleKind::PacingFit => {
                let len = text.chars().count();
                let t = env.target;
                if len < t.min_chars {
                    Evaluation::with(RuleOutcome::Warning, sev, vec![], format!("{len} chars, phase wants at least {}", t.min_chars))
                } else if len > t.max_chars {
                    Evaluation::with(RuleOutcome::Warning, sev, vec![], format!("{len} chars, phase allows {}", t.max_chars))
                } else {
                    Evaluation::passed(sev)
                }
            }
            RuleKind::ReturnPathReachability => {
                if env.ctx.story_graph.kind_of(env.return_path).is_some() {
                    Evaluation::passed(sev)
                } else {
                    Evaluation::with(
                        RuleOutcome::Failed,
                        sev,
                        vec![],
                        format!("return path '{}' is not in the story graph", env.return_path),
                    )
                }
            }
            RuleKind::ReturnPathPlausibility => match env.ctx.story_graph.kind_of(env.return_path) {
                Some(NodeKind::Monologue) => Evaluation::with(
                    RuleOutcome::Warning,
                    sev,
                    vec![],
                    "return path rejoins mid-monologue",
                ),
                Some(_) => Evaluation::passed(sev),
                None => Evaluation {
                    note: Some("skipped: return path unreachable".into()),
                    ..Evaluation::passed(sev)
                },
            },
            RuleKind::MarkupFilter => {
                let stripped = markup::strip_disallowed(text, env.allowed_markup);
                rewrite_eval(text, stripped, sev, "disallowed markup removed")
            }
            RuleKind::WhitespaceNormalization => {
                let normalized = masking::normalize_whitespace(text);
                rewrite_eval(text, normalized, sev, "whitespace normalized")
            }
            RuleKind::LengthBudget => match masking::truncate_to_budget(text, env.target.max_chars) {
                Some(cut) => rewrite_eval(text, cut, sev, "truncated to phase budget"),
                None => Evaluation::with(
                    RuleOutcome::Failed,
                    Severity::Critical,
                    vec![],
                    "truncation would remove the entire payload",
                ),
            },
        }
    }
}

fn rewrite_eval(text: &str, rewritten: String, sev: Severity, note: &str) -> Evaluation {
    if rewritten == text {
        Evaluation::passed(sev)
    } else {
        Evaluation {
            rewrite: Some(rewritten),
            ..Evaluation::with(RuleOutcome::Failed, sev, vec![], note)
        }
    }
}

/// An ordered, versioned rule list.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub version: String,
    pub digest: String,
    rules: Vec<RuleKind>,
}

impl RuleSet {
    /// Structural → safety (critical first) → coherence → return path → format.
    pub fn standard(book: &RuleBook) -> Result<Self, toml::ser::Error> {
        let mut rules = vec![RuleKind::EncodingValidity, RuleKind::MarkupSyntax];
        rules.extend(book.enforcement_rules().into_iter().cloned().map(RuleKind::Lexicon));
        rules.extend([
            RuleKind::LoreContinuity,
            RuleKind::CharacterVoice,
            RuleKind::ThematicDrift,
            RuleKind::PacingFit,
            RuleKind::ReturnPathReachability,
            RuleKind::ReturnPathPlausibility,
            RuleKind::MarkupFilter,
            RuleKind::WhitespaceNormalization,
            RuleKind::LengthBudget,
        ]);
        debug_assert!(rules.windows(2).all(|w| w[0].stage() <= w[1].stage()));
        Ok(Self {
            version: book.version.clone(),
            digest: book.digest()?,
            rules,
        })
    }

    pub fn stage(&self, stage: Stage) -> impl Iterator<Item = &RuleKind> {
        self.rules.iter().filter(move |r| r.stage() == stage)
    }
}
