//! Integration sessions: the twelve-state lifecycle of one branch attempt.
//!
//! Transitions are write-ahead: the journal must accept the record before the
//! new state becomes visible on the session. Anything outside the table is a
//! `StateTransition` error and leaves the session untouched.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::checkpoint::CheckpointHandle;
use crate::error::{WeaveError, WeaveResult};
use crate::runtime::StorySnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationState {
    ProposalAccepted,
    PreInjectCheckpoint,
    Injecting,
    Executing,
    CheckpointOnBeat,
    CommitPending,
    Committed,
    TerminalSuccess,
    RollbackPending,
    RollingBack,
    RolledBack,
    TerminalFailure,
}

use IntegrationState::*;

impl IntegrationState {
    pub fn allowed_next(self) -> &'static [IntegrationState] {
        match self {
            ProposalAccepted => &[PreInjectCheckpoint, TerminalFailure],
            PreInjectCheckpoint => &[Injecting, RollbackPending],
            Injecting => &[Executing, RollbackPending],
            Executing => &[CheckpointOnBeat, RollbackPending, TerminalFailure],
            CheckpointOnBeat => &[CommitPending, RollbackPending],
            CommitPending => &[Committed, RollbackPending],
            Committed => &[TerminalSuccess, RollbackPending],
            RollbackPending => &[RollingBack],
            RollingBack => &[RolledBack],
            RolledBack => &[TerminalFailure, TerminalSuccess],
            TerminalSuccess | TerminalFailure => &[],
        }
    }

    pub fn can_transition_to(self, to: IntegrationState) -> bool {
        self.allowed_next().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TerminalSuccess | TerminalFailure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProposalAccepted => "proposal_accepted",
            PreInjectCheckpoint => "pre_inject_checkpoint",
            Injecting => "injecting",
            Executing => "executing",
            CheckpointOnBeat => "checkpoint_on_beat",
            CommitPending => "commit_pending",
            Committed => "committed",
            TerminalSuccess => "terminal_success",
            RollbackPending => "rollback_pending",
            RollingBack => "rolling_back",
            RolledBack => "rolled_back",
            TerminalFailure => "terminal_failure",
        }
    }

    /// States from which the rollback path is entered via `RollbackPending`.
    pub fn can_request_rollback(self) -> bool {
        self.can_transition_to(RollbackPending)
    }

    /// Nothing player-visible has happened yet.
    pub fn is_cancellable(self) -> bool {
        matches!(self, ProposalAccepted | PreInjectCheckpoint)
    }
}

/// One line of the write-ahead transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub story_session: String,
    pub branch_id: String,
    /// `None` only for the record that creates the session.
    pub from: Option<IntegrationState>,
    pub to: IntegrationState,
    #[serde(default)]
    pub metadata: Value,
}

/// Durable sink for transition records. Must persist before returning `Ok`.
pub trait TransitionJournal {
    fn record(&self, record: &TransitionRecord) -> WeaveResult<()>;
}

/// Journal that keeps records in memory; useful when durability is provided elsewhere.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<TransitionRecord>>,
}

impl MemoryJournal {
    pub fn records(&self) -> Vec<TransitionRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl TransitionJournal for MemoryJournal {
    fn record(&self, record: &TransitionRecord) -> WeaveResult<()> {
        match self.records.lock() {
            Ok(mut r) => {
                r.push(record.clone());
                Ok(())
            }
            Err(_) => Err(WeaveError::Runtime("memory journal poisoned".into())),
        }
    }
}

/// One in-flight branch attempt. Passed explicitly to every operation.
#[derive(Debug, Clone)]
pub struct IntegrationSession {
    id: String,
    story_session: String,
    branch_id: String,
    state: IntegrationState,
    log: Vec<TransitionRecord>,
    pub(crate) snapshot: Option<StorySnapshot>,
    pub(crate) checkpoint: Option<CheckpointHandle>,
    /// Set once a checkpoint restore has been applied; guards against double restore.
    pub(crate) restore_applied: bool,
    /// Whether the rollback represents an intentional decline rather than an error.
    pub(crate) clean_decline: bool,
}

impl IntegrationSession {
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Create a session in `ProposalAccepted`, journaling the creation first.
    pub fn open(
        id: impl Into<String>,
        story_session: &str,
        branch_id: &str,
        journal: &dyn TransitionJournal,
        metadata: Value,
    ) -> WeaveResult<Self> {
        let id = id.into();
        let record = TransitionRecord {
            seq: 0,
            timestamp: Utc::now(),
            session_id: id.clone(),
            story_session: story_session.to_string(),
            branch_id: branch_id.to_string(),
            from: None,
            to: ProposalAccepted,
            metadata,
        };
        journal.record(&record)?;
        Ok(Self {
            id,
            story_session: story_session.to_string(),
            branch_id: branch_id.to_string(),
            state: ProposalAccepted,
            log: vec![record],
            snapshot: None,
            checkpoint: None,
            restore_applied: false,
            clean_decline: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn story_session(&self) -> &str {
        &self.story_session
    }

    pub fn branch_id(&self) -> &str {
        &self.branch_id
    }

    pub fn state(&self) -> IntegrationState {
        self.state
    }

    pub fn log(&self) -> &[TransitionRecord] {
        &self.log
    }

    pub fn checkpoint(&self) -> Option<&CheckpointHandle> {
        self.checkpoint.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `to`. The journal sees the record before the session does.
    pub fn transition(
        &mut self,
        to: IntegrationState,
        metadata: Value,
        journal: &dyn TransitionJournal,
    ) -> WeaveResult<&TransitionRecord> {
        let from = self.state;
        if !from.can_transition_to(to) {
            warn!(session = %self.id, ?from, ?to, "rejected invalid transition");
            return Err(WeaveError::StateTransition {
                session_id: self.id.clone(),
                from,
                to,
            });
        }
        let record = TransitionRecord {
            seq: self.log.len() as u64,
            timestamp: Utc::now(),
            session_id: self.id.clone(),
            story_session: self.story_session.clone(),
            branch_id: self.branch_id.clone(),
            from: Some(from),
            to,
            metadata,
        };
        journal.record(&record)?;
        debug!(session = %self.id, ?from, ?to, seq = record.seq, "transition");
        self.log.push(record);
        self.state = to;
        Ok(&self.log[self.log.len() - 1])
    }
}

/// Enforces "at most one active integration per story session".
#[derive(Debug, Default)]
pub struct SessionRegistry {
    active: Mutex<HashMap<String, String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the story session's slot. A second attempt is rejected, never queued.
    pub fn claim(&self, story_session: &str, session_id: &str) -> WeaveResult<()> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| WeaveError::Runtime("session registry poisoned".into()))?;
        if let Some(existing) = active.get(story_session) {
            return Err(WeaveError::SessionActive {
                story_session: story_session.to_string(),
                session_id: existing.clone(),
            });
        }
        active.insert(story_session.to_string(), session_id.to_string());
        Ok(())
    }

    /// Free the slot, but only if `session_id` is the one holding it.
    pub fn release(&self, story_session: &str, session_id: &str) {
        if let Ok(mut active) = self.active.lock() {
            if active.get(story_session).map(|s| s == session_id).unwrap_or(false) {
                active.remove(story_session);
            }
        }
    }

    pub fn active_for(&self, story_session: &str) -> Option<String> {
        self.active.lock().ok().and_then(|a| a.get(story_session).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALL: [IntegrationState; 12] = [
        ProposalAccepted,
        PreInjectCheckpoint,
        Injecting,
        Executing,
        CheckpointOnBeat,
        CommitPending,
        Committed,
        TerminalSuccess,
        RollbackPending,
        RollingBack,
        RolledBack,
        TerminalFailure,
    ];

    #[test]
    fn every_non_terminal_state_reaches_rollback_or_failure() {
        for s in ALL {
            if s.is_terminal() || matches!(s, RollbackPending | RollingBack | RolledBack) {
                continue;
            }
            assert!(
                s.can_transition_to(RollbackPending) || s.can_transition_to(TerminalFailure),
                "{s:?} has no escape path"
            );
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for s in ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(s.allowed_next().is_empty());
        }
    }

    #[test]
    fn invalid_transition_is_rejected_and_state_unchanged() {
        let journal = MemoryJournal::default();
        let mut s = IntegrationSession::open("s1", "story", "b1", &journal, json!({})).unwrap();
        for to in [PreInjectCheckpoint, Injecting, Executing, CheckpointOnBeat, CommitPending, Committed] {
            s.transition(to, json!({}), &journal).unwrap();
        }
        let err = s.transition(Injecting, json!({}), &journal).unwrap_err();
        assert!(matches!(err, WeaveError::StateTransition { from: Committed, to: Injecting, .. }));
        assert_eq!(s.state(), Committed);
        assert_eq!(journal.records().len(), 7);
    }

    struct FailingJournal;
    impl TransitionJournal for FailingJournal {
        fn record(&self, _r: &TransitionRecord) -> WeaveResult<()> {
            Err(WeaveError::Io(std::io::Error::other("disk full")))
        }
    }

    #[test]
    fn journal_failure_keeps_previous_state() {
        let journal = MemoryJournal::default();
        let mut s = IntegrationSession::open("s1", "story", "b1", &journal, json!({})).unwrap();
        assert!(s.transition(PreInjectCheckpoint, json!({}), &FailingJournal).is_err());
        assert_eq!(s.state(), ProposalAccepted);
        assert_eq!(s.log().len(), 1);
    }

    #[test]
    fn registry_rejects_second_claim() {
        let reg = SessionRegistry::new();
        reg.claim("story", "s1").unwrap();
        assert!(matches!(reg.claim("story", "s2"), Err(WeaveError::SessionActive { .. })));
        reg.claim("other", "s3").unwrap();
        reg.release("story", "s2");
        assert_eq!(reg.active_for("story").as_deref(), Some("s1"));
        reg.release("story", "s1");
        reg.claim("story", "s2").unwrap();
    }
}
