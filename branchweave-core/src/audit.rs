//! audit.rs
//! Append-only JSONL audit log.
//!
//! - One JSON object per line; transitions and hook events share the file.
//! - Doubles as the write-ahead transition journal: a transition line is flushed
//!   to disk before the session is allowed to observe its new state.
//! - Content previews are redacted to `preview_len` before they are written.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::AuditConfig;
use crate::error::{WeaveError, WeaveResult};
use crate::hooks::{Handler, HookPayload};
use crate::session::{IntegrationState, TransitionJournal, TransitionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Transition,
    Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<IntegrationState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<IntegrationState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default)]
    pub details: Value,
}

impl AuditEntry {
    fn from_transition(r: &TransitionRecord) -> Self {
        Self {
            timestamp: r.timestamp,
            kind: EntryKind::Transition,
            session_id: Some(r.session_id.clone()),
            story_session: Some(r.story_session.clone()),
            branch_id: Some(r.branch_id.clone()),
            seq: Some(r.seq),
            from: r.from,
            to: Some(r.to),
            event: None,
            outcome: r.metadata.get("outcome").and_then(Value::as_str).map(String::from),
            details: r.metadata.clone(),
        }
    }
}

pub struct AuditLog {
    path: PathBuf,
    enabled: bool,
    preview_len: usize,
    file: Mutex<()>,
}

impl AuditLog {
    pub fn new(cfg: &AuditConfig) -> Self {
        Self {
            path: cfg.log_path.clone(),
            enabled: cfg.enabled,
            preview_len: cfg.preview_len,
            file: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line and fsync it. Transition lines are written even when
    /// `enabled` is off, since the journal depends on them.
    pub fn append(&self, entry: &AuditEntry) -> WeaveResult<()> {
        let line = serde_json::to_string(entry)?;
        let _guard = self
            .file
            .lock()
            .map_err(|_| WeaveError::Runtime("audit log lock poisoned".into()))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(f, "{line}")?;
        f.sync_data()?;
        Ok(())
    }

    /// Record a free-form event. Failures are logged, not returned.
    pub fn record_event(&self, event: &str, session_id: Option<&str>, branch_id: Option<&str>, details: Value) {
        if !self.enabled {
            return;
        }
        let entry = AuditEntry {
            timestamp: Utc::now(),
            kind: EntryKind::Event,
            session_id: session_id.map(String::from),
            story_session: None,
            branch_id: branch_id.map(String::from),
            seq: None,
            from: None,
            to: None,
            event: Some(event.to_string()),
            outcome: details.get("outcome").and_then(Value::as_str).map(String::from),
            details: self.redact(details),
        };
        if let Err(e) = self.append(&entry) {
            tracing::warn!(error = %e, event, "audit append failed");
        }
    }

    /// Handler that persists every payload it receives as an event line.
    pub fn subscriber(self: &Arc<Self>) -> Handler {
        let log = Arc::clone(self);
        Arc::new(move |payload: &HookPayload| {
            log.record_event(
                payload.event.as_str(),
                payload.session_id.as_deref(),
                payload.branch_id.as_deref(),
                payload.data.clone(),
            );
            Ok(())
        })
    }

    /// Shorten any `preview` string field to the configured length.
    fn redact(&self, mut details: Value) -> Value {
        if let Some(Value::String(text)) = details.get_mut("preview") {
            *text = redact_preview(text, self.preview_len);
        }
        details
    }
}

impl TransitionJournal for AuditLog {
    fn record(&self, record: &TransitionRecord) -> WeaveResult<()> {
        self.append(&AuditEntry::from_transition(record))
    }
}

/// Single-line preview truncated on a char boundary, with an ellipsis.
pub fn redact_preview(s: &str, max_len: usize) -> String {
    let t = s.replace(['\n', '\r'], " ");
    if t.chars().count() <= max_len {
        return t;
    }
    let mut out: String = t.chars().take(max_len).collect();
    out.push('…');
    out
}

pub fn read_entries(path: &Path) -> Result<Vec<AuditEntry>> {
    let f = File::open(path).with_context(|| format!("opening audit log {}", path.display()))?;
    let mut out = Vec::new();
    for (i, line) in BufReader::new(f).lines().enumerate() {
        let line = line.with_context(|| format!("reading audit log {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry = serde_json::from_str(&line)
            .with_context(|| format!("parsing line {} of {}", i + 1, path.display()))?;
        out.push(entry);
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainReport {
    pub session_id: String,
    pub transitions: usize,
    pub terminal: Option<IntegrationState>,
    pub problems: Vec<String>,
}

impl ChainReport {
    /// Contiguous, gap-free and ending in a terminal state.
    pub fn is_complete(&self) -> bool {
        self.problems.is_empty() && self.terminal.is_some()
    }
}

/// Check that a session's transitions form one unbroken chain from `ProposalAccepted`.
pub fn verify_chain(entries: &[AuditEntry], session_id: &str) -> ChainReport {
    let chain: Vec<&AuditEntry> = entries
        .iter()
        .filter(|e| e.kind == EntryKind::Transition && e.session_id.as_deref() == Some(session_id))
        .collect();
    let mut problems = Vec::new();
    let mut prev: Option<IntegrationState> = None;

    for (i, e) in chain.iter().enumerate() {
        if e.seq != Some(i as u64) {
            problems.push(format!("expected seq {i}, found {:?}", e.seq));
        }
        let Some(to) = e.to else {
            problems.push(format!("seq {i}: missing target state"));
            continue;
        };
        match (i, prev, e.from) {
            (0, _, None) if to == IntegrationState::ProposalAccepted => {}
            (0, _, _) => problems.push(format!("chain starts with {:?} -> {:?}", e.from, to)),
            (_, Some(p), Some(from)) if p == from => {
                if !from.can_transition_to(to) {
                    problems.push(format!("seq {i}: {from:?} -> {to:?} is not allowed"));
                }
            }
            (_, p, from) => problems.push(format!("seq {i}: from {from:?} does not follow {p:?}")),
        }
        prev = Some(to);
    }
    if chain.is_empty() {
        problems.push("no transitions recorded".to_string());
    }

    ChainReport {
        session_id: session_id.to_string(),
        transitions: chain.len(),
        terminal: prev.filter(|s| s.is_terminal()),
        problems,
    }
}

/// Summary line for the `audit` hook.
pub fn validation_details(
    preview: &str,
    recommendation: &str,
    risk_score: f64,
    decision: &str,
    ruleset_version: &str,
) -> Value {
    json!({
        "preview": preview,
        "recommendation": recommendation,
        "risk_score": risk_score,
        "decision": decision,
        "ruleset_version": ruleset_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_is_single_line_and_bounded() {
        assert_eq!(redact_preview("a\nb", 10), "a b");
        assert_eq!(redact_preview("héllo world", 5), "héllo…");
    }

    #[test]
    fn disabled_log_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AuditConfig {
            log_path: dir.path().join("audit.jsonl"),
            enabled: false,
            preview_len: 10,
        };
        let log = AuditLog::new(&cfg);
        log.record_event("audit", None, None, json!({}));
        assert!(!cfg.log_path.exists());
    }

    #[test]
    fn event_preview_is_redacted() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AuditConfig {
            log_path: dir.path().join("audit.jsonl"),
            enabled: true,
            preview_len: 4,
        };
        let log = AuditLog::new(&cfg);
        log.record_event("audit", Some("s"), Some("b"), json!({ "preview": "long text here" }));
        let entries = read_entries(&cfg.log_path).unwrap();
        assert_eq!(entries[0].details["preview"], "long…");
        assert_eq!(entries[0].event.as_deref(), Some("audit"));
    }

    #[test]
    fn gap_in_chain_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AuditConfig {
            log_path: dir.path().join("audit.jsonl"),
            enabled: true,
            preview_len: 10,
        };
        let log = AuditLog::new(&cfg);
        let mk = |seq, from, to| TransitionRecord {
            seq,
            timestamp: Utc::now(),
            session_id: "s".into(),
            story_session: "story".into(),
            branch_id: "b".into(),
            from,
            to,
            metadata: json!({}),
        };
        log.record(&mk(0, None, IntegrationState::ProposalAccepted)).unwrap();
        log.record(&mk(2, Some(IntegrationState::PreInjectCheckpoint), IntegrationState::Injecting))
            .unwrap();
        let report = verify_chain(&read_entries(&cfg.log_path).unwrap(), "s");
        assert!(!report.is_complete());
        assert_eq!(report.problems.len(), 2);
    }
}
