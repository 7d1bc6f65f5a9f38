pub mod audit;
pub mod candidate;
pub mod checkpoint;
pub mod config;
pub mod director;
pub mod error;
pub mod hooks;
pub mod integrator;
pub mod runtime;
pub mod sanitizer;
pub mod session;

pub use candidate::{BranchRevision, CandidateBranch, GenerationMeta, Provenance, context_hash_for};
pub use checkpoint::{CheckpointHandle, CheckpointStore, Incompatibility, IncompatibleAction};
pub use config::CoreConfig;
pub use director::{Decision, DecisionContext, Director, Resolution, SimilarityScorer, Verdict};
pub use error::{WeaveError, WeaveResult};
pub use hooks::{HookBus, HookEvent, HookPayload};
pub use integrator::{AttemptOutcome, FailureReport, Integrator, Outcome, RollbackReason, RollbackReport};
pub use runtime::{ExecutionSignal, SandboxRuntime, StoryRuntime, StorySnapshot};
pub use sanitizer::{Recommendation, Sanitizer, ValidationContext, ValidationReport};
pub use session::{IntegrationSession, IntegrationState, SessionRegistry};
