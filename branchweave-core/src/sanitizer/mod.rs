//! Validation pipeline (Sanitizer / Rule Engine).
//!
//! `validate` runs five stages in a fixed order:
//! structural → safety → coherence → return path → format.
//! It is deterministic: no clock, no randomness, no I/O. Running it twice on the
//! same candidate and rule-set yields byte-identical reports.

pub mod context;
pub mod markup;
pub mod masking;
pub mod report;
pub mod rules;

use anyhow::{Context, Result};
use branchweave_rules::evaluator::{allow_spans, rule_spans};
use branchweave_rules::{RuleBook, RulebookSource, Severity, Span, read_verified_or_embedded};
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::candidate::CandidateBranch;
use crate::config::{CoreConfig, PacingConfig};
use crate::error::{WeaveError, WeaveResult};

pub use context::{CharacterVoice, LoreFact, LoreSnapshot, NodeKind, StoryGraph, ThemeProfile, ValidationContext};
pub use report::{Recommendation, RuleOutcome, RuleResult, SanitizationDiff, Stage, Target, ValidationReport};
pub use rules::{Evaluation, RuleEnv, RuleKind, RuleSet};

pub const OVERLAP_REVALIDATION_ID: &str = "safety_overlap_revalidation";

#[derive(Debug, Clone)]
pub struct SanitizerSettings {
    pub placeholder: String,
    pub allowed_markup: Vec<String>,
    pub theme_drift_tolerance: usize,
    pub pacing: PacingConfig,
}

impl SanitizerSettings {
    pub fn from_config(cfg: &CoreConfig) -> Self {
        Self {
            placeholder: cfg.rules.placeholder.clone(),
            allowed_markup: cfg.rules.allowed_markup.clone(),
            theme_drift_tolerance: cfg.rules.theme_drift_tolerance,
            pacing: cfg.pacing.clone(),
        }
    }
}

impl Default for SanitizerSettings {
    fn default() -> Self {
        Self::from_config(&CoreConfig::default())
    }
}

pub struct Sanitizer {
    book: RuleBook,
    rules: RuleSet,
    settings: SanitizerSettings,
}

/// Per-call accumulator.
#[derive(Default)]
struct Run {
    results: Vec<RuleResult>,
    rejected: bool,
    review: bool,
    applied: Vec<String>,
}

impl Run {
    fn push(&mut self, result: RuleResult) {
        if result.result == RuleOutcome::Failed {
            match result.severity {
                Severity::Critical => self.rejected = true,
                Severity::High => self.review = true,
                _ => {}
            }
        }
        self.results.push(result);
    }
}

impl Sanitizer {
    pub fn new(book: RuleBook, settings: SanitizerSettings) -> Result<Self> {
        let rules = RuleSet::standard(&book).context("digesting rulebook")?;
        Ok(Self { book, rules, settings })
    }

    /// Embedded default rulebook with default settings.
    pub fn with_defaults() -> Result<Self> {
        Self::new(default_book()?.clone(), SanitizerSettings::default())
    }

    /// Load the configured rulebook (verified against the embedded copy when locked).
    pub fn from_config(cfg: &CoreConfig) -> Result<Self> {
        let path = cfg.rules.path.join(&cfg.rules.rulebook);
        let loaded = read_verified_or_embedded(&path, &cfg.rules.rulebook, cfg.rules.locked)
            .with_context(|| format!("loading rulebook {}", path.display()))?;
        match loaded.source {
            RulebookSource::Restored => warn!(path = %path.display(), "rulebook drifted, embedded copy restored"),
            RulebookSource::LocalEdit => info!(path = %path.display(), "using locally edited rulebook"),
            _ => debug!(path = %path.display(), source = ?loaded.source, "rulebook loaded"),
        }
        let book = RuleBook::from_toml_str(&loaded.text)
            .with_context(|| format!("parsing rulebook {}", path.display()))?;
        Self::new(book, SanitizerSettings::from_config(cfg))
    }

    pub fn ruleset_version(&self) -> &str {
        &self.rules.version
    }

    pub fn rulebook(&self) -> &RuleBook {
        &self.book
    }

    pub fn validate(&self, candidate: &CandidateBranch, ctx: &ValidationContext) -> ValidationReport {
        let env = RuleEnv {
            ctx,
            book: &self.book,
            return_path: &candidate.return_path,
            placeholder: &self.settings.placeholder,
            allowed_markup: &self.settings.allowed_markup,
            theme_drift_tolerance: self.settings.theme_drift_tolerance,
            target: self.settings.pacing.target_for(&ctx.phase),
        };
        let mut run = Run::default();
        let mut content = candidate.content.clone();
        let mut fragment = candidate.fragment.clone();

        // 1. structural: fail fast
        for rule in self.rules.stage(Stage::Structural) {
            self.check(rule, &content, Target::Content, &env, &mut run);
            if let Some(f) = &fragment {
                self.check(rule, f, Target::Fragment, &env, &mut run);
            }
        }
        if run.rejected {
            debug!(branch = %candidate.id, "structural failure, skipping later stages");
            return self.finish(candidate, run, content, fragment);
        }

        // 2. safety: critical first, sanitizable hits rewritten in place
        content = self.safety(content, Target::Content, &env, &mut run);
        if !run.rejected {
            if let Some(f) = fragment.take() {
                fragment = Some(self.safety(f, Target::Fragment, &env, &mut run));
            }
        }
        if run.rejected {
            debug!(branch = %candidate.id, "unsanitizable critical violation");
            return self.finish(candidate, run, content, fragment);
        }

        // 3. coherence and 4. return path never reject on their own
        for rule in self.rules.stage(Stage::Coherence).chain(self.rules.stage(Stage::ReturnPath)) {
            self.check(rule, &content, Target::Content, &env, &mut run);
        }

        // 5. format
        for rule in self.rules.stage(Stage::Format) {
            content = self.apply(rule, content, Target::Content, &env, &mut run);
            if run.rejected {
                break;
            }
            if matches!(rule, RuleKind::LengthBudget) {
                continue;
            }
            if let Some(f) = fragment.take() {
                fragment = Some(self.apply(rule, f, Target::Fragment, &env, &mut run));
            }
        }

        self.finish(candidate, run, content, fragment)
    }

    /// Like [`Sanitizer::validate`], but a failed coherence rule is an error
    /// instead of a downgraded recommendation.
    pub fn validate_strict(&self, candidate: &CandidateBranch, ctx: &ValidationContext) -> WeaveResult<ValidationReport> {
        let report = self.validate(candidate, ctx);
        let failed = report
            .results
            .iter()
            .find(|r| r.stage == Stage::Coherence && r.result == RuleOutcome::Failed);
        if let Some(r) = failed {
            return Err(WeaveError::CoherenceWarning {
                branch_id: candidate.id.clone(),
                reason: match &r.note {
                    Some(note) => format!("{}: {note}", r.rule_id),
                    None => r.rule_id.clone(),
                },
            });
        }
        Ok(report)
    }

    /// Run only the rewriting stages and return the resulting text.
    /// Text with no violations comes back unchanged.
    pub fn sanitize(&self, text: &str, ctx: &ValidationContext) -> String {
        let scratch = CandidateBranch::new("sanitize", text, "", "");
        self.validate(&scratch, ctx)
            .revision
            .map(|r| r.content)
            .unwrap_or_else(|| text.to_string())
    }

    fn check(&self, rule: &RuleKind, text: &str, target: Target, env: &RuleEnv<'_>, run: &mut Run) {
        let eval = rule.evaluate(text, env);
        run.push(to_result(rule, target, eval, Vec::new()));
    }

    /// Evaluate a possibly-sanitizable rule; apply its rewrite and confirm once.
    fn apply(&self, rule: &RuleKind, text: String, target: Target, env: &RuleEnv<'_>, run: &mut Run) -> String {
        let eval = rule.evaluate(&text, env);
        let Some(rewritten) = eval.rewrite.clone() else {
            run.push(to_result(rule, target, eval, Vec::new()));
            return text;
        };

        let id = rule.id();
        let confirm = rule.evaluate(&rewritten, env);
        if !confirm.is_passed() {
            run.push(to_result(rule, target, eval, Vec::new()));
            return text;
        }

        let diffs = match rule {
            RuleKind::Lexicon(_) => masking::redact(&text, &eval.spans, env.placeholder, &id).1,
            _ => vec![SanitizationDiff::minimal(&id, &text, &rewritten)],
        };
        let mut result = to_result(rule, target, eval, diffs);
        result.result = RuleOutcome::Sanitized;
        run.push(result);
        run.applied.push(id.into_owned());
        rewritten
    }

    fn safety(&self, text: String, target: Target, env: &RuleEnv<'_>, run: &mut Run) -> String {
        let rules: Vec<&RuleKind> = self.rules.stage(Stage::Safety).collect();

        // Would two transforms touch the same bytes of the stage input?
        let shields = allow_spans(&text, env.book);
        let mut claimed: Vec<Span> = Vec::new();
        let mut overlap = false;
        for rule in &rules {
            if let RuleKind::Lexicon(l) = rule {
                if l.sanitizable {
                    let spans = rule_spans(&text, l, &shields);
                    overlap |= spans.iter().any(|s| claimed.iter().any(|c| c.overlaps(s)));
                    claimed.extend(spans);
                }
            }
        }

        let mut current = text;
        for rule in &rules {
            current = self.apply(rule, current, target, env, run);
            if run.rejected {
                return current;
            }
        }

        if overlap {
            // Re-validate exactly once; a residual hit goes to manual review, not another loop.
            let residual: Vec<String> = rules
                .iter()
                .filter(|r| !r.evaluate(&current, env).is_passed())
                .map(|r| r.id().into_owned())
                .collect();
            let (outcome, note) = if residual.is_empty() {
                (RuleOutcome::Passed, "overlapping transforms re-validated".to_string())
            } else {
                run.review = true;
                (RuleOutcome::Failed, format!("still failing after overlap: {}", residual.join(", ")))
            };
            run.push(RuleResult {
                rule_id: OVERLAP_REVALIDATION_ID.to_string(),
                stage: Stage::Safety,
                target,
                severity: Severity::High,
                result: outcome,
                spans: Vec::new(),
                diffs: Vec::new(),
                note: Some(note),
            });
        }
        current
    }

    fn finish(
        &self,
        candidate: &CandidateBranch,
        run: Run,
        content: String,
        fragment: Option<String>,
    ) -> ValidationReport {
        let recommendation = if run.rejected {
            Recommendation::AutoReject
        } else if run.review {
            Recommendation::ManualReview
        } else {
            Recommendation::AutoAccept
        };
        let changed = content != candidate.content || fragment != candidate.fragment;
        let revision = (changed && !run.rejected).then(|| candidate.derive(content, fragment, run.applied));
        let risk_score = ValidationReport::aggregate_risk(&run.results);

        info!(
            branch = %candidate.id,
            ?recommendation,
            risk_score,
            sanitized = revision.is_some(),
            "validation finished"
        );
        ValidationReport {
            branch_id: candidate.id.clone(),
            ruleset_version: self.rules.version.clone(),
            ruleset_digest: self.rules.digest.clone(),
            results: run.results,
            risk_score,
            recommendation,
            revision,
        }
    }
}

/// The rulebook compiled into `branchweave-rules`, parsed once per process.
pub fn default_book() -> Result<&'static RuleBook> {
    static CELL: OnceCell<RuleBook> = OnceCell::new();
    CELL.get_or_try_init(branchweave_rules::default_rulebook)
        .context("parsing embedded rulebook")
}

fn to_result(rule: &RuleKind, target: Target, eval: Evaluation, diffs: Vec<SanitizationDiff>) -> RuleResult {
    RuleResult {
        rule_id: rule.id().into_owned(),
        stage: rule.stage(),
        target,
        severity: eval.severity,
        result: eval.outcome,
        spans: eval.spans,
        diffs,
        note: eval.note,
    }
}
