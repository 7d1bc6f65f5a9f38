//! checkpoint.rs
//! Durable, checksummed snapshots of narrative state.
//!
//! Layout: `<dir>/<session_id>/<checkpoint_id>.json`, each file an envelope
//! `{ schema_version, sequence, checksum, timestamp, session_id, checkpoint_id, payload }`.
//! Writes stage to `<checkpoint_id>.tmp` and rename into place, so `read`
//! never observes a half-written file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{WeaveError, WeaveResult};
use crate::runtime::{StoryRuntime, StorySnapshot};
use crate::session::{IntegrationSession, IntegrationState};

const EXT: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointHandle {
    pub checkpoint_id: String,
    pub session_id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    schema_version: u32,
    sequence: u64,
    checksum: String,
    timestamp: DateTime<Utc>,
    session_id: String,
    checkpoint_id: String,
    payload: Value,
}

/// Why a checkpoint could not be loaded as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IncompatibilityKind {
    SchemaMismatch { found: u32, expected: u32 },
    ChecksumMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Incompatibility {
    pub checkpoint_id: String,
    pub session_id: String,
    #[serde(flatten)]
    pub kind: IncompatibilityKind,
}

/// The only two answers a caller may give to an incompatible checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncompatibleAction {
    /// Use the payload anyway. Honoured only when that is deterministically safe.
    Resume,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedSnapshot {
    pub checkpoint_id: String,
    pub restored_at: DateTime<Utc>,
    pub position: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckpointStatus {
    Ok,
    ChecksumMismatch,
    SchemaMismatch { found: u32 },
    Unreadable { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointInfo {
    pub path: PathBuf,
    pub checkpoint_id: Option<String>,
    pub session_id: Option<String>,
    pub sequence: Option<u64>,
    #[serde(flatten)]
    pub status: CheckpointStatus,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    schema_version: u32,
}

impl CheckpointStore {
    pub fn open(dir: impl Into<PathBuf>, schema_version: u32) -> WeaveResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, schema_version })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Persist a snapshot for the session. Only legal in `PreInjectCheckpoint`.
    pub fn write(&self, session: &IntegrationSession, snapshot: &StorySnapshot) -> WeaveResult<CheckpointHandle> {
        if session.state() != IntegrationState::PreInjectCheckpoint {
            return Err(WeaveError::StateGuard {
                operation: "checkpoint write",
                state: session.state(),
            });
        }
        let session_dir = self.session_dir(session.id());
        let sequence = self.handles(session.id())?.len() as u64 + 1;
        let checkpoint_id = uuid::Uuid::new_v4().to_string();
        let payload = serde_json::to_value(snapshot)?;
        let envelope = Envelope {
            schema_version: self.schema_version,
            sequence,
            checksum: checksum(&payload)?,
            timestamp: Utc::now(),
            session_id: session.id().to_string(),
            checkpoint_id: checkpoint_id.clone(),
            payload,
        };
        let path = session_dir.join(format!("{checkpoint_id}.{EXT}"));
        write_atomic(&path, &serde_json::to_vec_pretty(&envelope)?)?;
        info!(session = %session.id(), checkpoint = %checkpoint_id, sequence, "checkpoint written");
        Ok(CheckpointHandle {
            checkpoint_id,
            session_id: session.id().to_string(),
            path,
        })
    }

    /// Read a checkpoint for restore. Only legal in `RollingBack`.
    /// A checksum or schema mismatch is `Corruption`; use `load_compatible` to arbitrate.
    pub fn read(&self, session: &IntegrationSession, handle: &CheckpointHandle) -> WeaveResult<StorySnapshot> {
        self.load_compatible(session, handle, &|_: &Incompatibility| IncompatibleAction::Rollback)
    }

    /// Read a checkpoint, asking `on_incompatible` what to do when it does not load cleanly.
    pub fn load_compatible(
        &self,
        session: &IntegrationSession,
        handle: &CheckpointHandle,
        on_incompatible: &dyn Fn(&Incompatibility) -> IncompatibleAction,
    ) -> WeaveResult<StorySnapshot> {
        if session.state() != IntegrationState::RollingBack {
            return Err(WeaveError::StateGuard {
                operation: "checkpoint read",
                state: session.state(),
            });
        }
        let envelope = read_envelope(&handle.path).map_err(|e| WeaveError::Corruption {
            checkpoint_id: handle.checkpoint_id.clone(),
            reason: e,
        })?;

        if checksum(&envelope.payload)? != envelope.checksum {
            let issue = Incompatibility {
                checkpoint_id: handle.checkpoint_id.clone(),
                session_id: handle.session_id.clone(),
                kind: IncompatibilityKind::ChecksumMismatch,
            };
            if on_incompatible(&issue) == IncompatibleAction::Resume {
                warn!(checkpoint = %handle.checkpoint_id, "resume refused for corrupt checkpoint");
            }
            return Err(WeaveError::Corruption {
                checkpoint_id: handle.checkpoint_id.clone(),
                reason: "checksum mismatch".to_string(),
            });
        }

        if envelope.schema_version != self.schema_version {
            let issue = Incompatibility {
                checkpoint_id: handle.checkpoint_id.clone(),
                session_id: handle.session_id.clone(),
                kind: IncompatibilityKind::SchemaMismatch {
                    found: envelope.schema_version,
                    expected: self.schema_version,
                },
            };
            let reason = format!(
                "schema version {} (expected {})",
                envelope.schema_version, self.schema_version
            );
            match on_incompatible(&issue) {
                IncompatibleAction::Rollback => {
                    return Err(WeaveError::Incompatible {
                        checkpoint_id: handle.checkpoint_id.clone(),
                        reason,
                    });
                }
                // Safe only if the payload still parses strictly into the current shape.
                IncompatibleAction::Resume => {
                    warn!(checkpoint = %handle.checkpoint_id, %reason, "resuming from older schema");
                }
            }
        }

        let snapshot = serde_json::from_value(envelope.payload).map_err(|e| WeaveError::Incompatible {
            checkpoint_id: handle.checkpoint_id.clone(),
            reason: format!("payload does not match snapshot shape: {e}"),
        })?;
        debug!(checkpoint = %handle.checkpoint_id, "checkpoint read");
        Ok(snapshot)
    }

    /// Newest checkpoint of a session by write sequence.
    pub fn latest(&self, session_id: &str) -> WeaveResult<Option<CheckpointHandle>> {
        Ok(self.handles(session_id)?.into_iter().last())
    }

    /// Remove every checkpoint of a session. Returns how many files were deleted.
    pub fn prune(&self, session_id: &str) -> WeaveResult<usize> {
        let dir = self.session_dir(session_id);
        if !dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        fs::remove_dir(&dir)?;
        debug!(session = %session_id, removed, "checkpoints pruned");
        Ok(removed)
    }

    /// Every checkpoint file in the store with its integrity status.
    pub fn list(&self) -> WeaveResult<Vec<CheckpointInfo>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let session_dir = entry?.path();
            if !session_dir.is_dir() {
                continue;
            }
            for file in fs::read_dir(&session_dir)? {
                let path = file?.path();
                if is_checkpoint_file(&path) {
                    out.push(inspect(&path, self.schema_version));
                }
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.dir.join(session_id)
    }

    fn handles(&self, session_id: &str) -> WeaveResult<Vec<CheckpointHandle>> {
        let dir = self.session_dir(session_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if !is_checkpoint_file(&path) {
                continue;
            }
            if let Ok(env) = read_envelope(&path) {
                found.push((
                    env.sequence,
                    CheckpointHandle {
                        checkpoint_id: env.checkpoint_id,
                        session_id: env.session_id,
                        path,
                    },
                ));
            }
        }
        found.sort_by_key(|(seq, _)| *seq);
        Ok(found.into_iter().map(|(_, h)| h).collect())
    }
}

/// Integrity status of one checkpoint file, without restoring it.
pub fn inspect(path: &Path, expected_schema: u32) -> CheckpointInfo {
    let envelope = match read_envelope(path) {
        Ok(env) => env,
        Err(reason) => {
            return CheckpointInfo {
                path: path.to_path_buf(),
                checkpoint_id: None,
                session_id: None,
                sequence: None,
                status: CheckpointStatus::Unreadable { reason },
            };
        }
    };
    let status = match checksum(&envelope.payload) {
        Ok(sum) if sum != envelope.checksum => CheckpointStatus::ChecksumMismatch,
        Err(e) => CheckpointStatus::Unreadable { reason: e.to_string() },
        Ok(_) if envelope.schema_version != expected_schema => CheckpointStatus::SchemaMismatch {
            found: envelope.schema_version,
        },
        Ok(_) => CheckpointStatus::Ok,
    };
    CheckpointInfo {
        path: path.to_path_buf(),
        checkpoint_id: Some(envelope.checkpoint_id),
        session_id: Some(envelope.session_id),
        sequence: Some(envelope.sequence),
        status,
    }
}

/// Overwrite the runtime's state wholesale, then re-run its consistency check.
pub fn restore(
    runtime: &mut dyn StoryRuntime,
    handle: &CheckpointHandle,
    snapshot: &StorySnapshot,
) -> WeaveResult<AppliedSnapshot> {
    runtime.restore(snapshot)?;
    runtime.verify().map_err(|reason| WeaveError::Verification {
        checkpoint_id: handle.checkpoint_id.clone(),
        reason,
    })?;
    info!(checkpoint = %handle.checkpoint_id, position = %snapshot.position, "snapshot restored");
    Ok(AppliedSnapshot {
        checkpoint_id: handle.checkpoint_id.clone(),
        restored_at: Utc::now(),
        position: snapshot.position.clone(),
    })
}

/// Top-level fields (and variable/inventory keys) that differ. Audit telemetry only.
pub fn diff_snapshots(current: &StorySnapshot, checkpoint: &StorySnapshot) -> Vec<String> {
    let mut fields = Vec::new();
    if current.position != checkpoint.position {
        fields.push("position".to_string());
    }
    for key in current.variables.keys().chain(checkpoint.variables.keys()) {
        let field = format!("variables.{key}");
        if current.variables.get(key) != checkpoint.variables.get(key) && !fields.contains(&field) {
            fields.push(field);
        }
    }
    for key in current.inventory.keys().chain(checkpoint.inventory.keys()) {
        let field = format!("inventory.{key}");
        if current.inventory.get(key) != checkpoint.inventory.get(key) && !fields.contains(&field) {
            fields.push(field);
        }
    }
    if current.branches != checkpoint.branches {
        fields.push("branches".to_string());
    }
    fields
}

fn checksum(payload: &Value) -> WeaveResult<String> {
    let bytes = serde_json::to_vec(payload)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

fn read_envelope(path: &Path) -> Result<Envelope, String> {
    let text = fs::read_to_string(path).map_err(|e| format!("reading {}: {e}", path.display()))?;
    serde_json::from_str(&text).map_err(|e| format!("parsing {}: {e}", path.display()))
}

fn is_checkpoint_file(path: &Path) -> bool {
    path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(EXT)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> WeaveResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn diff_names_changed_fields_only() {
        let mut a = StorySnapshot { position: "gate".into(), ..StorySnapshot::default() };
        a.inventory.insert("torch".into(), 2);
        a.variables.insert("met".into(), json!(true));
        let mut b = a.clone();
        assert!(diff_snapshots(&a, &b).is_empty());
        b.position = "hall".into();
        b.inventory.insert("torch".into(), 1);
        assert_eq!(diff_snapshots(&a, &b), vec!["position", "inventory.torch"]);
    }

    #[test]
    fn checksum_is_stable_across_reserialization() {
        let snap = StorySnapshot { position: "gate".into(), ..StorySnapshot::default() };
        let v = serde_json::to_value(&snap).unwrap();
        let text = serde_json::to_string_pretty(&v).unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(checksum(&v).unwrap(), checksum(&back).unwrap());
    }
}
