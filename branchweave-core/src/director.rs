//! director.rs
//! Decision Engine: turns a validation report plus narrative signals into a bounded
//! risk score and an accept / reject / manual-review decision.

use serde::Serialize;

use crate::config::{DecisionConfig, RiskWeights};
use crate::sanitizer::{Recommendation, ValidationReport};

/// Pluggable thematic/lore/voice closeness measure. Returns similarity in [0, 1].
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, a: &str, b: &str) -> f64;
}

/// Default capability: contributes nothing and never suspends.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSimilarity;

impl SimilarityScorer for NoSimilarity {
    fn score(&self, _a: &str, _b: &str) -> f64 {
        1.0
    }
}

/// Contextual signals supplied by the story runtime for one decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionContext {
    /// How well the branch fits the current narrative beat, 1.0 = perfect.
    pub pacing_fit: f64,
    /// Confidence the declared return path can be rejoined cleanly, 1.0 = certain.
    pub return_path_confidence: f64,
    /// Reference text for the optional similarity term (lore summary, recent beats).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_text: Option<String>,
}

impl Default for DecisionContext {
    fn default() -> Self {
        Self {
            pacing_fit: 1.0,
            return_path_confidence: 1.0,
            reference_text: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Reject,
    ManualReview,
}

/// What an unattended runtime actually does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Accept,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub decision: Decision,
    pub resolution: Resolution,
    pub risk_score: f64,
    pub reason: String,
}

impl Verdict {
    pub fn accepted(&self) -> bool {
        self.resolution == Resolution::Accept
    }
}

pub struct Director {
    config: DecisionConfig,
    similarity: Box<dyn SimilarityScorer>,
}

impl Director {
    pub fn new(config: DecisionConfig) -> Self {
        Self {
            config,
            similarity: Box::new(NoSimilarity),
        }
    }

    /// Install a similarity capability. Only consulted when `similarity_enabled`.
    pub fn with_similarity(mut self, scorer: Box<dyn SimilarityScorer>) -> Self {
        self.similarity = scorer;
        self
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// Weighted mean of the risk terms, clamped to [0, 1].
    pub fn risk_score(&self, report: &ValidationReport, ctx: &DecisionContext, content: &str) -> f64 {
        let RiskWeights { validation, pacing, return_path, similarity } = self.config.weights;
        let mut terms = vec![
            (validation, report.risk_score),
            (pacing, 1.0 - ctx.pacing_fit.clamp(0.0, 1.0)),
            (return_path, 1.0 - ctx.return_path_confidence.clamp(0.0, 1.0)),
        ];
        if self.config.similarity_enabled {
            if let Some(reference) = &ctx.reference_text {
                let sim = self.similarity.score(content, reference).clamp(0.0, 1.0);
                terms.push((similarity, 1.0 - sim));
            }
        }
        let total: f64 = terms.iter().map(|(w, _)| w.max(0.0)).sum();
        if total <= 0.0 {
            return report.risk_score.clamp(0.0, 1.0);
        }
        let weighted: f64 = terms.iter().map(|(w, v)| w.max(0.0) * v).sum();
        (weighted / total).clamp(0.0, 1.0)
    }

    /// Deterministic: same report, context and thresholds give the same verdict.
    pub fn decide(&self, report: &ValidationReport, ctx: &DecisionContext, content: &str) -> Verdict {
        let risk_score = self.risk_score(report, ctx, content);
        let threshold = self.config.risk_threshold;

        let (decision, reason) = if report.has_unsanitized_critical()
            || report.recommendation == Recommendation::AutoReject
        {
            (Decision::Reject, "critical violation remains".to_string())
        } else if risk_score > threshold {
            (Decision::Reject, format!("risk {risk_score:.3} exceeds threshold {threshold:.3}"))
        } else if report.recommendation == Recommendation::ManualReview {
            (Decision::ManualReview, "validation requested manual review".to_string())
        } else {
            (Decision::Accept, format!("risk {risk_score:.3} within threshold {threshold:.3}"))
        };

        let resolution = match decision {
            Decision::Accept => Resolution::Accept,
            Decision::Reject => Resolution::Reject,
            Decision::ManualReview => match self.config.auto_approve_below {
                Some(bar) if risk_score < bar => Resolution::Accept,
                _ => Resolution::Reject,
            },
        };

        Verdict { decision, resolution, risk_score, reason }
    }
}
