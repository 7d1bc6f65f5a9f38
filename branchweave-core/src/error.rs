//! Error taxonomy for the integration core.
//!
//! Rule-local and subscriber-local failures are contained where they happen and
//! only show up here when a caller asks for them explicitly. Everything that
//! threatens state consistency (`Corruption`, `StateTransition`) propagates.

use thiserror::Error;

use crate::session::IntegrationState;

pub type WeaveResult<T> = std::result::Result<T, WeaveError>;

#[derive(Debug, Error)]
pub enum WeaveError {
    #[error("structural error in branch {branch_id}: {reason}")]
    Structural { branch_id: String, reason: String },

    #[error("policy violation in branch {branch_id}: rule {rule_id}")]
    PolicyViolation { branch_id: String, rule_id: String },

    #[error("coherence warning in branch {branch_id}: {reason}")]
    CoherenceWarning { branch_id: String, reason: String },

    #[error("checkpoint {checkpoint_id} is corrupt: {reason}")]
    Corruption { checkpoint_id: String, reason: String },

    #[error("invalid transition {from:?} -> {to:?} for session {session_id}")]
    StateTransition {
        session_id: String,
        from: IntegrationState,
        to: IntegrationState,
    },

    #[error("{operation} is not permitted in state {state:?}")]
    StateGuard {
        operation: &'static str,
        state: IntegrationState,
    },

    #[error("subscriber {handler} failed on {event}: {reason}")]
    Subscriber {
        event: String,
        handler: String,
        reason: String,
    },

    #[error("story session {story_session} already has an active integration ({session_id})")]
    SessionActive {
        story_session: String,
        session_id: String,
    },

    #[error("story runtime is not at a hook point")]
    NotAtHookPoint,

    #[error("restored state from checkpoint {checkpoint_id} failed verification: {reason}")]
    Verification { checkpoint_id: String, reason: String },

    #[error("branch {branch_id} was not accepted: {reason}")]
    Rejected { branch_id: String, reason: String },

    #[error("checkpoint {checkpoint_id} incompatible: {reason}")]
    Incompatible { checkpoint_id: String, reason: String },

    #[error("story runtime error: {0}")]
    Runtime(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl WeaveError {
    /// Errors after which no trustworthy rollback exists for the session.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            WeaveError::Corruption { .. }
                | WeaveError::Incompatible { .. }
                | WeaveError::Verification { .. }
        )
    }
}
