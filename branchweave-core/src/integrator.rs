//! Drives one branch attempt through validation, decision and the integration
//! state machine, with checkpointing and rollback.
//!
//! Every step takes the session explicitly. Step errors leave the session where
//! it is; `integrate` turns them into a rollback, callers of the step API call
//! [`Integrator::rollback`] themselves.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::audit::{AuditLog, redact_preview, validation_details};
use crate::candidate::{BranchRevision, CandidateBranch};
use crate::checkpoint::{self, CheckpointStore, Incompatibility, IncompatibleAction};
use crate::config::CoreConfig;
use crate::director::{DecisionContext, Director, SimilarityScorer, Verdict};
use crate::error::{WeaveError, WeaveResult};
use crate::hooks::{HookBus, HookEvent, HookPayload};
use crate::runtime::{ExecutionSignal, StoryRuntime};
use crate::sanitizer::{Recommendation, RuleOutcome, Sanitizer, Stage, ValidationContext, ValidationReport};
use crate::session::{IntegrationSession, IntegrationState, SessionRegistry, TransitionRecord};

use IntegrationState::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Integrated,
    Declined,
    Reverted,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Integrated => "integrated",
            Outcome::Declined => "declined",
            Outcome::Reverted => "reverted",
        }
    }
}

/// Enough to reproduce a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
    pub branch_id: String,
    pub session_id: String,
    pub last_good_checkpoint: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptOutcome {
    pub outcome: Outcome,
    pub report: ValidationReport,
    pub verdict: Verdict,
    pub session_id: Option<String>,
    pub final_state: Option<IntegrationState>,
    pub transitions: Vec<TransitionRecord>,
    pub failure: Option<FailureReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackReason {
    /// The player turned the branch down; a clean rollback ends in success.
    Declined,
    Error(String),
}

impl RollbackReason {
    fn describe(&self) -> String {
        match self {
            RollbackReason::Declined => "declined".to_string(),
            RollbackReason::Error(e) => e.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackReport {
    pub outcome: Outcome,
    pub restored: bool,
    /// Fields that differed from the checkpoint before restore.
    pub diff: Vec<String>,
    pub failure: Option<FailureReport>,
}

type IncompatibleHandler = Box<dyn Fn(&Incompatibility) -> IncompatibleAction + Send + Sync>;

pub struct Integrator {
    config: CoreConfig,
    sanitizer: Sanitizer,
    director: Director,
    bus: HookBus,
    store: CheckpointStore,
    audit: Arc<AuditLog>,
    registry: SessionRegistry,
    on_incompatible: IncompatibleHandler,
}

impl Integrator {
    pub fn new(config: CoreConfig) -> Result<Self> {
        let sanitizer = Sanitizer::from_config(&config)?;
        Self::with_sanitizer(config, sanitizer)
    }

    pub fn with_sanitizer(config: CoreConfig, sanitizer: Sanitizer) -> Result<Self> {
        let store = CheckpointStore::open(&config.checkpoints.path, config.checkpoints.schema_version)?;
        let audit = Arc::new(AuditLog::new(&config.audit));
        let bus = HookBus::new(Duration::from_millis(config.hooks.gate_timeout_ms));
        if config.audit.enabled {
            bus.on_arc(HookEvent::Audit, "audit_log", audit.subscriber());
        }
        info!(
            ruleset = sanitizer.ruleset_version(),
            checkpoints = %store.dir().display(),
            audit = %audit.path().display(),
            "integrator ready"
        );
        Ok(Self {
            director: Director::new(config.decision.clone()),
            config,
            sanitizer,
            bus,
            store,
            audit,
            registry: SessionRegistry::new(),
            on_incompatible: Box::new(|_: &Incompatibility| IncompatibleAction::Rollback),
        })
    }

    pub fn with_similarity(mut self, scorer: Box<dyn SimilarityScorer>) -> Self {
        self.director = Director::new(self.config.decision.clone()).with_similarity(scorer);
        self
    }

    /// Caller decision for checkpoints with a foreign schema or bad checksum.
    pub fn with_incompatible_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Incompatibility) -> IncompatibleAction + Send + Sync + 'static,
    {
        self.on_incompatible = Box::new(handler);
        self
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn bus(&self) -> &HookBus {
        &self.bus
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn sanitizer(&self) -> &Sanitizer {
        &self.sanitizer
    }

    /// Validate and decide without opening a session.
    pub fn evaluate(
        &self,
        candidate: &CandidateBranch,
        ctx: &ValidationContext,
        decision_ctx: &DecisionContext,
    ) -> (ValidationReport, Verdict) {
        let report = self.sanitizer.validate(candidate, ctx);
        let content = report
            .revision
            .as_ref()
            .map(|r| r.content.as_str())
            .unwrap_or(candidate.content.as_str());
        let verdict = self.director.decide(&report, decision_ctx, content);
        let decision = serde_json::to_value(verdict.decision).unwrap_or(Value::Null);
        let recommendation = serde_json::to_value(report.recommendation).unwrap_or(Value::Null);
        let mut details = validation_details(
            content,
            recommendation.as_str().unwrap_or_default(),
            verdict.risk_score,
            decision.as_str().unwrap_or_default(),
            &report.ruleset_version,
        );
        details["resolution"] = serde_json::to_value(verdict.resolution).unwrap_or(Value::Null);
        let mut payload = HookPayload::new(HookEvent::Audit, details);
        payload.branch_id = Some(candidate.id.clone());
        self.bus.emit(&payload);
        (report, verdict)
    }

    /// Claim the story session and open an integration session for an accepted branch.
    pub fn begin(
        &self,
        story_session: &str,
        candidate: &CandidateBranch,
        report: &ValidationReport,
        verdict: &Verdict,
    ) -> WeaveResult<IntegrationSession> {
        if !verdict.accepted() {
            return Err(rejection_error(candidate, report, verdict));
        }
        let id = IntegrationSession::new_id();
        self.registry.claim(story_session, &id)?;
        let meta = json!({
            "revision": report.revision.as_ref().map(|r| r.revision).unwrap_or(0),
            "risk_score": verdict.risk_score,
            "ruleset_version": report.ruleset_version,
        });
        match IntegrationSession::open(id.clone(), story_session, &candidate.id, self.audit.as_ref(), meta) {
            Ok(session) => {
                info!(session = %id, story_session, branch = %candidate.id, "integration session opened");
                Ok(session)
            }
            Err(e) => {
                self.registry.release(story_session, &id);
                Err(e)
            }
        }
    }

    /// ProposalAccepted -> PreInjectCheckpoint, then persist the pre-injection snapshot.
    pub fn checkpoint(&self, session: &mut IntegrationSession, runtime: &dyn StoryRuntime) -> WeaveResult<()> {
        self.advance(session, PreInjectCheckpoint, json!({}))?;
        self.emit(session, HookEvent::PreCheckpoint, json!({}));
        let snapshot = runtime.snapshot()?;
        let handle = self.store.write(session, &snapshot)?;
        self.emit(
            session,
            HookEvent::PostCheckpoint,
            json!({ "checkpoint_id": handle.checkpoint_id, "position": snapshot.position }),
        );
        session.snapshot = Some(snapshot);
        session.checkpoint = Some(handle);
        Ok(())
    }

    /// PreInjectCheckpoint -> Injecting. Refused outside a runtime hook point.
    pub fn inject(
        &self,
        session: &mut IntegrationSession,
        runtime: &mut dyn StoryRuntime,
        revision: &BranchRevision,
    ) -> WeaveResult<()> {
        if session.state() != PreInjectCheckpoint || session.checkpoint.is_none() {
            return Err(WeaveError::StateGuard { operation: "inject", state: session.state() });
        }
        if !runtime.is_hook_point() {
            return Err(WeaveError::NotAtHookPoint);
        }
        let gate = self.bus.emit_gated(&self.payload(session, HookEvent::PreInject, revision_details(revision)));
        if let Some(err) = gate.to_error() {
            return Err(err);
        }
        self.advance(session, Injecting, json!({ "revision": revision.branch_id }))?;
        runtime.inject(revision)?;
        self.emit(session, HookEvent::PostInject, revision_details(revision));
        Ok(())
    }

    /// Injecting -> Executing. A completed run that leaves the runtime
    /// inconsistent is reported as an error signal.
    pub fn execute(&self, session: &mut IntegrationSession, runtime: &mut dyn StoryRuntime) -> WeaveResult<ExecutionSignal> {
        self.advance(session, Executing, json!({}))?;
        let signal = runtime.execute();
        if signal == ExecutionSignal::Completed {
            if let Err(reason) = runtime.verify() {
                return Ok(ExecutionSignal::Error(reason));
            }
        }
        Ok(signal)
    }

    /// Executing -> CheckpointOnBeat once the branch reached its narrative beat.
    pub fn checkpoint_beat(&self, session: &mut IntegrationSession, runtime: &dyn StoryRuntime) -> WeaveResult<()> {
        runtime.verify().map_err(WeaveError::Runtime)?;
        let position = runtime.snapshot()?.position;
        self.advance(session, CheckpointOnBeat, json!({ "position": position }))
    }

    /// CheckpointOnBeat -> CommitPending -> Committed.
    pub fn commit(
        &self,
        session: &mut IntegrationSession,
        runtime: &mut dyn StoryRuntime,
        revision: &BranchRevision,
    ) -> WeaveResult<()> {
        self.advance(session, CommitPending, json!({}))?;
        let gate = self.bus.emit_gated(&self.payload(session, HookEvent::PreCommit, revision_details(revision)));
        if let Some(err) = gate.to_error() {
            return Err(err);
        }
        runtime.commit(revision)?;
        self.advance(session, Committed, json!({}))?;
        self.emit(session, HookEvent::PostCommit, revision_details(revision));
        Ok(())
    }

    /// Committed -> TerminalSuccess. Checkpoints of the session are no longer needed.
    pub fn finish(&self, session: &mut IntegrationSession) -> WeaveResult<()> {
        self.advance(session, TerminalSuccess, json!({ "outcome": Outcome::Integrated.as_str() }))?;
        if let Err(e) = self.store.prune(session.id()) {
            warn!(session = %session.id(), error = %e, "checkpoint prune failed");
        }
        Ok(())
    }

    /// Abandon an attempt before anything player-visible happened.
    pub fn cancel(&self, session: &mut IntegrationSession, runtime: &mut dyn StoryRuntime) -> WeaveResult<RollbackReport> {
        match session.state() {
            ProposalAccepted => {
                self.advance(
                    session,
                    TerminalFailure,
                    json!({ "outcome": Outcome::Declined.as_str(), "reason": "cancelled" }),
                )?;
                Ok(RollbackReport { outcome: Outcome::Declined, restored: false, diff: Vec::new(), failure: None })
            }
            PreInjectCheckpoint => self.rollback(session, runtime, RollbackReason::Declined),
            state => Err(WeaveError::StateGuard { operation: "cancel", state }),
        }
    }

    /// Take the escape path to a terminal state. Calling it again on a session
    /// that already rolled back changes nothing and restores nothing twice.
    pub fn rollback(
        &self,
        session: &mut IntegrationSession,
        runtime: &mut dyn StoryRuntime,
        reason: RollbackReason,
    ) -> WeaveResult<RollbackReport> {
        let state = session.state();
        if state.is_terminal() {
            info!(session = %session.id(), ?state, "session already terminal, rollback is a no-op");
            return Ok(RollbackReport {
                outcome: recorded_outcome(session),
                restored: session.restore_applied,
                diff: Vec::new(),
                failure: None,
            });
        }
        if state == RolledBack {
            let clean = session.clean_decline && session.restore_applied;
            self.conclude(session, clean, None)?;
            return Ok(RollbackReport {
                outcome: recorded_outcome(session),
                restored: session.restore_applied,
                diff: Vec::new(),
                failure: None,
            });
        }
        if state == ProposalAccepted {
            // nothing checkpointed or injected yet
            let outcome = match reason {
                RollbackReason::Declined => Outcome::Declined,
                RollbackReason::Error(_) => Outcome::Reverted,
            };
            self.advance(
                session,
                TerminalFailure,
                json!({ "outcome": outcome.as_str(), "reason": reason.describe() }),
            )?;
            return Ok(RollbackReport { outcome, restored: false, diff: Vec::new(), failure: None });
        }

        if state != RollbackPending && state != RollingBack {
            session.clean_decline = reason == RollbackReason::Declined;
            warn!(session = %session.id(), ?state, reason = %reason.describe(), "rolling back");
            self.advance(session, RollbackPending, json!({ "reason": reason.describe() }))?;
        }
        if session.state() == RollbackPending {
            self.advance(session, RollingBack, json!({}))?;
        }

        let mut diff = Vec::new();
        let mut failure = None;
        if !session.restore_applied {
            match self.restore_checkpoint(session, runtime) {
                Ok(d) => {
                    diff = d;
                    session.restore_applied = true;
                }
                Err(e) => {
                    error!(session = %session.id(), error = %e, "rollback could not restore state");
                    failure = Some(failure_report(session, e.to_string()));
                }
            }
        }

        let restored = session.restore_applied;
        self.advance(
            session,
            RolledBack,
            json!({ "restored": restored, "error": failure.as_ref().map(|f| f.reason.clone()) }),
        )?;
        let clean = session.clean_decline && restored;
        self.conclude(session, clean, failure.as_ref())?;

        Ok(RollbackReport {
            outcome: if clean { Outcome::Declined } else { Outcome::Reverted },
            restored,
            diff,
            failure,
        })
    }

    /// Run the whole attempt: evaluate, then either integrate or roll back.
    pub fn integrate(
        &self,
        story_session: &str,
        candidate: &CandidateBranch,
        ctx: &ValidationContext,
        decision_ctx: &DecisionContext,
        runtime: &mut dyn StoryRuntime,
    ) -> WeaveResult<AttemptOutcome> {
        let (report, verdict) = self.evaluate(candidate, ctx, decision_ctx);
        if !verdict.accepted() {
            info!(branch = %candidate.id, reason = %verdict.reason, "branch not accepted");
            return Ok(AttemptOutcome {
                outcome: Outcome::Declined,
                report,
                verdict,
                session_id: None,
                final_state: None,
                transitions: Vec::new(),
                failure: None,
            });
        }

        let revision = report.effective_revision(candidate);
        let mut session = self.begin(story_session, candidate, &report, &verdict)?;
        let result = self.run_steps(&mut session, runtime, &revision);

        let (outcome, failure) = match result {
            Ok(None) => (Outcome::Integrated, None),
            Ok(Some(reason)) => self.escape(&mut session, runtime, reason),
            Err(e @ WeaveError::StateTransition { .. }) => {
                self.registry.release(story_session, session.id());
                return Err(e);
            }
            Err(e) => {
                let (outcome, failure) = self.escape(&mut session, runtime, RollbackReason::Error(e.to_string()));
                (outcome, failure.or_else(|| Some(failure_report(&session, e.to_string()))))
            }
        };

        Ok(AttemptOutcome {
            outcome,
            report,
            verdict,
            session_id: Some(session.id().to_string()),
            final_state: Some(session.state()),
            transitions: session.log().to_vec(),
            failure,
        })
    }

    /// Happy path. `Ok(Some(_))` asks for a rollback without an error.
    fn run_steps(
        &self,
        session: &mut IntegrationSession,
        runtime: &mut dyn StoryRuntime,
        revision: &BranchRevision,
    ) -> WeaveResult<Option<RollbackReason>> {
        self.checkpoint(session, runtime)?;
        self.inject(session, runtime, revision)?;
        match self.execute(session, runtime)? {
            ExecutionSignal::Completed => {}
            ExecutionSignal::Declined => return Ok(Some(RollbackReason::Declined)),
            ExecutionSignal::Error(e) => return Ok(Some(RollbackReason::Error(e))),
        }
        self.checkpoint_beat(session, runtime)?;
        self.commit(session, runtime, revision)?;
        self.finish(session)?;
        Ok(None)
    }

    /// Rollback on behalf of `integrate`. When the escape path itself fails
    /// (a journal that no longer accepts writes, say) the runtime is put back
    /// from the in-memory snapshot and the story session is freed regardless.
    fn escape(
        &self,
        session: &mut IntegrationSession,
        runtime: &mut dyn StoryRuntime,
        reason: RollbackReason,
    ) -> (Outcome, Option<FailureReport>) {
        let err = match self.rollback(session, runtime, reason) {
            Ok(r) => return (r.outcome, r.failure),
            Err(e) => e,
        };
        error!(session = %session.id(), state = ?session.state(), error = %err, "rollback path failed");
        let mut reason = format!("rollback failed: {err}");
        if !session.restore_applied && !session.is_terminal() {
            if let Some(snapshot) = session.snapshot.clone() {
                match runtime.restore(&snapshot).and_then(|_| runtime.verify().map_err(WeaveError::Runtime)) {
                    Ok(()) => {
                        session.restore_applied = true;
                        warn!(session = %session.id(), position = %snapshot.position, "restored from in-memory snapshot");
                    }
                    Err(e) => reason.push_str(&format!("; in-memory restore failed: {e}")),
                }
            }
        }
        self.registry.release(session.story_session(), session.id());
        (Outcome::Reverted, Some(failure_report(session, reason)))
    }

    /// Read the pre-injection checkpoint, diff for audit, restore wholesale, re-verify.
    fn restore_checkpoint(&self, session: &IntegrationSession, runtime: &mut dyn StoryRuntime) -> WeaveResult<Vec<String>> {
        let Some(handle) = session.checkpoint().cloned() else {
            // Nothing was written, so nothing was injected either.
            return Ok(Vec::new());
        };
        let snapshot = self.store.load_compatible(session, &handle, self.on_incompatible.as_ref())?;
        let diff = match runtime.snapshot() {
            Ok(current) => checkpoint::diff_snapshots(&current, &snapshot),
            Err(_) => Vec::new(),
        };
        self.emit(
            session,
            HookEvent::OnRollback,
            json!({ "checkpoint_id": handle.checkpoint_id, "diff": diff }),
        );
        checkpoint::restore(runtime, &handle, &snapshot)?;
        Ok(diff)
    }

    fn conclude(&self, session: &mut IntegrationSession, clean: bool, failure: Option<&FailureReport>) -> WeaveResult<()> {
        if clean {
            self.advance(session, TerminalSuccess, json!({ "outcome": Outcome::Declined.as_str() }))?;
            if let Err(e) = self.store.prune(session.id()) {
                warn!(session = %session.id(), error = %e, "checkpoint prune failed");
            }
        } else {
            self.advance(session, TerminalFailure, json!({ "outcome": Outcome::Reverted.as_str() }))?;
            if let Some(f) = failure {
                let mut payload = self.payload(session, HookEvent::Audit, json!({}));
                payload.data = serde_json::to_value(f).unwrap_or(Value::Null);
                self.bus.emit(&payload);
            }
        }
        Ok(())
    }

    /// Write-ahead transition, then `state_change`; frees the story session on terminal states.
    fn advance(&self, session: &mut IntegrationSession, to: IntegrationState, metadata: Value) -> WeaveResult<()> {
        let from = session.state();
        session.transition(to, metadata, self.audit.as_ref())?;
        self.emit(session, HookEvent::StateChange, json!({ "from": from.as_str(), "to": to.as_str() }));
        if to.is_terminal() {
            self.registry.release(session.story_session(), session.id());
            info!(session = %session.id(), state = to.as_str(), "integration session finished");
        }
        Ok(())
    }

    fn payload(&self, session: &IntegrationSession, event: HookEvent, data: Value) -> HookPayload {
        HookPayload::new(event, data).for_session(session.id(), session.branch_id())
    }

    fn emit(&self, session: &IntegrationSession, event: HookEvent, data: Value) {
        self.bus.emit(&self.payload(session, event, data));
    }
}

/// Outcome stamped on the session's last transition.
fn recorded_outcome(session: &IntegrationSession) -> Outcome {
    match session
        .log()
        .last()
        .and_then(|r| r.metadata.get("outcome"))
        .and_then(Value::as_str)
    {
        Some("integrated") => Outcome::Integrated,
        Some("declined") => Outcome::Declined,
        _ => Outcome::Reverted,
    }
}

fn failure_report(session: &IntegrationSession, reason: String) -> FailureReport {
    FailureReport {
        branch_id: session.branch_id().to_string(),
        session_id: session.id().to_string(),
        last_good_checkpoint: session.checkpoint().map(|h| h.checkpoint_id.clone()),
        reason,
    }
}

fn revision_details(revision: &BranchRevision) -> Value {
    json!({
        "revision_id": revision.branch_id,
        "revision": revision.revision,
        "return_path": revision.return_path,
        "preview": redact_preview(&revision.content, 80),
    })
}

fn rejection_error(candidate: &CandidateBranch, report: &ValidationReport, verdict: &Verdict) -> WeaveError {
    let failed_in = |stage: Stage| {
        report
            .results
            .iter()
            .find(|r| r.stage == stage && r.result == RuleOutcome::Failed)
    };
    if report.recommendation == Recommendation::AutoReject {
        if let Some(r) = failed_in(Stage::Structural) {
            return WeaveError::Structural {
                branch_id: candidate.id.clone(),
                reason: r.note.clone().unwrap_or_else(|| r.rule_id.clone()),
            };
        }
        if let Some(r) = failed_in(Stage::Safety) {
            return WeaveError::PolicyViolation {
                branch_id: candidate.id.clone(),
                rule_id: r.rule_id.clone(),
            };
        }
    }
    WeaveError::Rejected {
        branch_id: candidate.id.clone(),
        reason: verdict.reason.clone(),
    }
}
