use branchweave_rules::{Severity, Span};
use serde::Serialize;

use crate::candidate::{BranchRevision, CandidateBranch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Structural,
    Safety,
    Coherence,
    ReturnPath,
    Format,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOutcome {
    Passed,
    Warning,
    Failed,
    Sanitized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Content,
    Fragment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    AutoReject,
    AutoAccept,
    ManualReview,
}

/// One applied transform. `offset` is a byte offset into the text the transform ran on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SanitizationDiff {
    pub rule_id: String,
    pub offset: usize,
    pub before: String,
    pub after: String,
}

impl SanitizationDiff {
    /// Smallest single-window diff between two texts (common prefix/suffix trimmed).
    pub fn minimal(rule_id: &str, before: &str, after: &str) -> Self {
        let prefix = before
            .char_indices()
            .zip(after.chars())
            .find(|((_, a), b)| a != b)
            .map(|((i, _), _)| i)
            .unwrap_or_else(|| before.len().min(after.len()));
        let prefix = floor_char_boundary(after, prefix);

        let b_rest = &before[prefix..];
        let a_rest = &after[prefix..];
        let suffix = b_rest
            .chars()
            .rev()
            .zip(a_rest.chars().rev())
            .take_while(|(x, y)| x == y)
            .map(|(x, _)| x.len_utf8())
            .sum::<usize>();

        Self {
            rule_id: rule_id.to_string(),
            offset: prefix,
            before: b_rest[..b_rest.len() - suffix].to_string(),
            after: a_rest[..a_rest.len() - suffix].to_string(),
        }
    }
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleResult {
    pub rule_id: String,
    pub stage: Stage,
    pub target: Target,
    pub severity: Severity,
    pub result: RuleOutcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub spans: Vec<Span>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diffs: Vec<SanitizationDiff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl RuleResult {
    fn weight(&self) -> f64 {
        let base = match self.severity {
            Severity::Critical => 1.0,
            Severity::High => 0.5,
            Severity::Medium => 0.25,
            Severity::Low => 0.1,
        };
        match self.result {
            RuleOutcome::Passed => 0.0,
            RuleOutcome::Failed => base,
            RuleOutcome::Warning => base * 0.5,
            RuleOutcome::Sanitized => base * 0.1,
        }
    }
}

/// Produced once per candidate by the validation pipeline; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub branch_id: String,
    pub ruleset_version: String,
    pub ruleset_digest: String,
    pub results: Vec<RuleResult>,
    pub risk_score: f64,
    pub recommendation: Recommendation,
    /// Present only when a transform rewrote the candidate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<BranchRevision>,
}

impl ValidationReport {
    /// `1 - Π(1 - wᵢ)` over all results; stays within [0, 1].
    pub fn aggregate_risk(results: &[RuleResult]) -> f64 {
        let keep = results
            .iter()
            .fold(1.0_f64, |acc, r| acc * (1.0 - r.weight().clamp(0.0, 1.0)));
        (1.0 - keep).clamp(0.0, 1.0)
    }

    pub fn result(&self, rule_id: &str) -> Option<&RuleResult> {
        self.results.iter().find(|r| r.rule_id == rule_id)
    }

    pub fn failed(&self, rule_id: &str) -> bool {
        self.result(rule_id)
            .map(|r| r.result == RuleOutcome::Failed)
            .unwrap_or(false)
    }

    /// A critical safety violation that survived (or could not be given) sanitization.
    pub fn has_unsanitized_critical(&self) -> bool {
        self.results.iter().any(|r| {
            r.severity == Severity::Critical && r.result == RuleOutcome::Failed
        })
    }

    /// The revision to inject: the sanitized one if any, else the original.
    pub fn effective_revision(&self, candidate: &CandidateBranch) -> BranchRevision {
        self.revision
            .clone()
            .unwrap_or_else(|| candidate.original_revision())
    }

    pub fn to_canonical_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_diff_isolates_changed_window() {
        let d = SanitizationDiff::minimal("r", "a damn door", "a [redacted] door");
        assert_eq!(d.offset, 2);
        assert_eq!(d.before, "damn");
        assert_eq!(d.after, "[redacted]");
    }

    #[test]
    fn minimal_diff_handles_truncation() {
        let d = SanitizationDiff::minimal("r", "One. Two.", "One.");
        assert_eq!(d.offset, 4);
        assert_eq!(d.before, " Two.");
        assert_eq!(d.after, "");
    }

    #[test]
    fn aggregate_risk_is_bounded() {
        let mk = |sev, result| RuleResult {
            rule_id: "x".into(),
            stage: Stage::Safety,
            target: Target::Content,
            severity: sev,
            result,
            spans: vec![],
            diffs: vec![],
            note: None,
        };
        let rs = vec![
            mk(Severity::Critical, RuleOutcome::Failed),
            mk(Severity::High, RuleOutcome::Failed),
        ];
        assert_eq!(ValidationReport::aggregate_risk(&rs), 1.0);
        assert_eq!(ValidationReport::aggregate_risk(&[]), 0.0);
        let one = ValidationReport::aggregate_risk(&[mk(Severity::High, RuleOutcome::Warning)]);
        assert!((one - 0.25).abs() < 1e-12);
    }
}
