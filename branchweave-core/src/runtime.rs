//! The story runtime as seen from the integration core, plus an in-memory
//! sandbox implementation used by tests and offline dry runs.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::candidate::BranchRevision;
use crate::error::{WeaveError, WeaveResult};

/// Externally visible narrative state. Restored wholesale, compared structurally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorySnapshot {
    /// Node the player is currently at.
    pub position: String,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub inventory: BTreeMap<String, i64>,
    /// Branch ids currently spliced into the story.
    #[serde(default)]
    pub branches: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionSignal {
    Completed,
    /// The player turned the branch down. Not an error.
    Declined,
    Error(String),
}

pub trait StoryRuntime {
    fn snapshot(&self) -> WeaveResult<StorySnapshot>;

    /// Replace the whole narrative state with `snapshot`.
    fn restore(&mut self, snapshot: &StorySnapshot) -> WeaveResult<()>;

    /// Consistency check: position is a real node, no dangling references.
    fn verify(&self) -> Result<(), String>;

    /// True when the runtime sits at a declared safe point for integration.
    fn is_hook_point(&self) -> bool;

    fn inject(&mut self, revision: &BranchRevision) -> WeaveResult<()>;

    fn execute(&mut self) -> ExecutionSignal;

    /// Make the injected branch a permanent part of the story.
    fn commit(&mut self, revision: &BranchRevision) -> WeaveResult<()>;
}

/// In-memory runtime with a fixed node set and scripted execution signals.
#[derive(Debug, Clone, Default)]
pub struct SandboxRuntime {
    nodes: BTreeSet<String>,
    state: StorySnapshot,
    hook_point: bool,
    script: VecDeque<ExecutionSignal>,
    active: Option<BranchRevision>,
    committed: BTreeSet<String>,
    corrupt_next_restore: bool,
}

impl SandboxRuntime {
    pub fn new<I, S>(nodes: I, position: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: nodes.into_iter().map(Into::into).collect(),
            state: StorySnapshot {
                position: position.to_string(),
                ..StorySnapshot::default()
            },
            hook_point: true,
            ..Self::default()
        }
    }

    pub fn with_variable(mut self, key: &str, value: Value) -> Self {
        self.state.variables.insert(key.to_string(), value);
        self
    }

    pub fn with_item(mut self, item: &str, count: i64) -> Self {
        self.state.inventory.insert(item.to_string(), count);
        self
    }

    pub fn set_hook_point(&mut self, at_hook_point: bool) {
        self.hook_point = at_hook_point;
    }

    /// Queue the signal the next `execute` call returns. Defaults to `Completed`.
    pub fn script(&mut self, signal: ExecutionSignal) {
        self.script.push_back(signal);
    }

    /// Make the next `restore` leave the position on a node that does not exist,
    /// so the post-restore verification fails. Used to rehearse fatal rollbacks.
    pub fn fail_next_restore(&mut self) {
        self.corrupt_next_restore = true;
    }

    pub fn state(&self) -> &StorySnapshot {
        &self.state
    }

    pub fn is_committed(&self, branch_id: &str) -> bool {
        self.committed.contains(branch_id)
    }

    fn branch_node(id: &str) -> String {
        format!("branch:{id}")
    }
}

impl StoryRuntime for SandboxRuntime {
    fn snapshot(&self) -> WeaveResult<StorySnapshot> {
        Ok(self.state.clone())
    }

    fn restore(&mut self, snapshot: &StorySnapshot) -> WeaveResult<()> {
        self.state = snapshot.clone();
        self.active = None;
        if std::mem::take(&mut self.corrupt_next_restore) {
            self.state.position = "nowhere".to_string();
        }
        Ok(())
    }

    fn verify(&self) -> Result<(), String> {
        let pos = &self.state.position;
        let in_branch = self
            .active
            .as_ref()
            .map(|b| &Self::branch_node(&b.branch_id) == pos)
            .unwrap_or(false);
        if !self.nodes.contains(pos) && !in_branch {
            return Err(format!("position '{pos}' is not a known node"));
        }
        for id in &self.state.branches {
            let live = self.active.as_ref().map(|b| &b.branch_id == id).unwrap_or(false);
            if !live && !self.committed.contains(id) {
                return Err(format!("dangling branch reference '{id}'"));
            }
        }
        Ok(())
    }

    fn is_hook_point(&self) -> bool {
        self.hook_point
    }

    fn inject(&mut self, revision: &BranchRevision) -> WeaveResult<()> {
        if self.active.is_some() {
            return Err(WeaveError::Runtime("a branch is already injected".into()));
        }
        self.state.branches.push(revision.branch_id.clone());
        self.state.position = Self::branch_node(&revision.branch_id);
        self.state
            .variables
            .insert("last_branch".to_string(), Value::String(revision.branch_id.clone()));
        self.active = Some(revision.clone());
        Ok(())
    }

    fn execute(&mut self) -> ExecutionSignal {
        let signal = self.script.pop_front().unwrap_or(ExecutionSignal::Completed);
        match (&signal, &self.active) {
            (ExecutionSignal::Completed, Some(branch)) => {
                self.state.position = branch.return_path.clone();
            }
            (ExecutionSignal::Error(_), Some(branch)) => {
                // half-applied side effects the rollback has to undo
                *self.state.inventory.entry("torch".to_string()).or_insert(0) -= 1;
                self.state.position = format!("{}/broken", Self::branch_node(&branch.branch_id));
            }
            _ => {}
        }
        signal
    }

    fn commit(&mut self, revision: &BranchRevision) -> WeaveResult<()> {
        match &self.active {
            Some(b) if b.branch_id == revision.branch_id => {
                self.committed.insert(revision.branch_id.clone());
                self.active = None;
                Ok(())
            }
            _ => Err(WeaveError::Runtime(format!(
                "branch {} is not the injected branch",
                revision.branch_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::CandidateBranch;

    #[test]
    fn completed_branch_rejoins_return_path() {
        let mut rt = SandboxRuntime::new(["gate", "hall"], "gate");
        let rev = CandidateBranch::new("b1", "text", "hall", "h").original_revision();
        rt.inject(&rev).unwrap();
        assert!(rt.verify().is_ok());
        assert_eq!(rt.execute(), ExecutionSignal::Completed);
        assert_eq!(rt.state().position, "hall");
        rt.commit(&rev).unwrap();
        assert!(rt.verify().is_ok());
    }

    #[test]
    fn failed_execution_leaves_inconsistent_state() {
        let mut rt = SandboxRuntime::new(["gate", "hall"], "gate");
        rt.script(ExecutionSignal::Error("bad reference".into()));
        let rev = CandidateBranch::new("b1", "text", "hall", "h").original_revision();
        rt.inject(&rev).unwrap();
        assert!(matches!(rt.execute(), ExecutionSignal::Error(_)));
        assert!(rt.verify().is_err());
    }

    #[test]
    fn failed_restore_is_one_shot() {
        let mut rt = SandboxRuntime::new(["gate"], "gate");
        let snap = rt.snapshot().unwrap();
        rt.fail_next_restore();
        rt.restore(&snap).unwrap();
        assert!(rt.verify().is_err());
        rt.restore(&snap).unwrap();
        assert!(rt.verify().is_ok());
    }
}
