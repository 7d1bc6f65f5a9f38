//! Narrative context (LORE) the coherence and return-path checks read from.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationContext {
    /// Current narrative phase; selects the pacing target.
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub story_graph: StoryGraph,
    #[serde(default)]
    pub lore: LoreSnapshot,
    #[serde(default)]
    pub voices: Vec<CharacterVoice>,
    #[serde(default)]
    pub theme: ThemeProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Decision,
    Narration,
    Monologue,
    Ending,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryGraph {
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeKind>,
}

impl StoryGraph {
    pub fn with_node(mut self, id: impl Into<String>, kind: NodeKind) -> Self {
        self.nodes.insert(id.into(), kind);
        self
    }

    pub fn kind_of(&self, id: &str) -> Option<NodeKind> {
        self.nodes.get(id).copied()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoreSnapshot {
    #[serde(default)]
    pub facts: Vec<LoreFact>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoreFact {
    pub id: String,
    pub statement: String,
    /// Phrases that would contradict this fact if they appeared in a branch.
    #[serde(default)]
    pub contradicted_by: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterVoice {
    pub name: String,
    /// Phrases this character never says.
    #[serde(default)]
    pub off_voice: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeProfile {
    /// Terms signalling tonal drift away from the story's register.
    #[serde(default)]
    pub off_theme: Vec<String>,
}
