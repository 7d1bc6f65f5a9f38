//! Candidate branches as handed over by the Writer, and the immutable revisions
//! derived from them when sanitization rewrites text.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A story fragment proposed for insertion. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateBranch {
    pub id: String,
    pub content: String,
    /// Optional structured script/markup that accompanies the prose.
    #[serde(default)]
    pub fragment: Option<String>,
    /// Node the story should rejoin once the branch concludes.
    pub return_path: String,
    /// Digest of the narrative context the Writer generated against.
    pub context_hash: String,
    #[serde(default)]
    pub meta: GenerationMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationMeta {
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub generator: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

/// Where a revision came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub original_id: String,
    /// Rules whose transforms produced this revision, in application order.
    pub rule_ids: Vec<String>,
}

/// The text that actually gets injected. Revision 0 is the Writer's original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRevision {
    pub branch_id: String,
    pub revision: u32,
    pub content: String,
    pub fragment: Option<String>,
    pub return_path: String,
    pub provenance: Provenance,
}

impl CandidateBranch {
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        return_path: impl Into<String>,
        context_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            fragment: None,
            return_path: return_path.into(),
            context_hash: context_hash.into(),
            meta: GenerationMeta::default(),
        }
    }

    pub fn with_fragment(mut self, fragment: impl Into<String>) -> Self {
        self.fragment = Some(fragment.into());
        self
    }

    pub fn original_revision(&self) -> BranchRevision {
        BranchRevision {
            branch_id: self.id.clone(),
            revision: 0,
            content: self.content.clone(),
            fragment: self.fragment.clone(),
            return_path: self.return_path.clone(),
            provenance: Provenance {
                original_id: self.id.clone(),
                rule_ids: Vec::new(),
            },
        }
    }

    /// Derive a sanitized revision. The original is left untouched.
    pub fn derive(&self, content: String, fragment: Option<String>, rule_ids: Vec<String>) -> BranchRevision {
        BranchRevision {
            branch_id: format!("{}@r1", self.id),
            revision: 1,
            content,
            fragment,
            return_path: self.return_path.clone(),
            provenance: Provenance {
                original_id: self.id.clone(),
                rule_ids,
            },
        }
    }
}

/// Deterministic digest of any serializable context (keys sorted recursively, then blake3).
pub fn context_hash_for<T: Serialize>(context: &T) -> Result<String, serde_json::Error> {
    let v = serde_json::to_value(context)?;
    let bytes = serde_json::to_vec(&canonicalize(&v))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

fn canonicalize(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize).collect()),
        _ => v.clone(),
    }
}
