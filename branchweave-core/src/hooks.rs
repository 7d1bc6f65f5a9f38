//! Hook / event bus.
//!
//! Two emission modes:
//! - [`HookBus::emit`]: parallel fan-out, every handler runs, order not guaranteed.
//! - [`HookBus::emit_gated`]: sequential, stops at the first failure or timeout.
//!
//! Handlers return `Result<(), String>`. Panics are caught. Neither mode ever
//! propagates a handler failure to the emitter; failures come back as data.
//! Both modes wait at most `timeout` per emission step: a handler still running
//! at the deadline is reported as timed out and left to finish on its own thread.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::WeaveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    PreInject,
    PostInject,
    PreCheckpoint,
    PostCheckpoint,
    PreCommit,
    PostCommit,
    OnRollback,
    StateChange,
    Audit,
}

impl HookEvent {
    pub const ALL: [HookEvent; 9] = [
        HookEvent::PreInject,
        HookEvent::PostInject,
        HookEvent::PreCheckpoint,
        HookEvent::PostCheckpoint,
        HookEvent::PreCommit,
        HookEvent::PostCommit,
        HookEvent::OnRollback,
        HookEvent::StateChange,
        HookEvent::Audit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HookEvent::PreInject => "pre_inject",
            HookEvent::PostInject => "post_inject",
            HookEvent::PreCheckpoint => "pre_checkpoint",
            HookEvent::PostCheckpoint => "post_checkpoint",
            HookEvent::PreCommit => "pre_commit",
            HookEvent::PostCommit => "post_commit",
            HookEvent::OnRollback => "on_rollback",
            HookEvent::StateChange => "state_change",
            HookEvent::Audit => "audit",
        }
    }

    pub fn parse(name: &str) -> Option<HookEvent> {
        Self::ALL.into_iter().find(|e| e.as_str() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookPayload {
    pub event: HookEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl HookPayload {
    pub fn new(event: HookEvent, data: Value) -> Self {
        Self { event, session_id: None, branch_id: None, data }
    }

    pub fn for_session(mut self, session_id: &str, branch_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self.branch_id = Some(branch_id.to_string());
        self
    }
}

pub type Handler = Arc<dyn Fn(&HookPayload) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerReport {
    pub handler: String,
    pub outcome: Result<(), String>,
}

impl HandlerReport {
    pub fn failed(&self) -> bool {
        self.outcome.is_err()
    }

    pub fn to_error(&self, event: HookEvent) -> Option<WeaveError> {
        self.outcome.as_ref().err().map(|reason| WeaveError::Subscriber {
            event: event.as_str().to_string(),
            handler: self.handler.clone(),
            reason: reason.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmitReport {
    pub event: HookEvent,
    /// In registration order, regardless of completion order.
    pub handlers: Vec<HandlerReport>,
}

impl EmitReport {
    pub fn failures(&self) -> impl Iterator<Item = &HandlerReport> {
        self.handlers.iter().filter(|h| h.failed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateReport {
    pub event: HookEvent,
    /// Handlers that ran, up to and including the one that stopped the gate.
    pub handlers: Vec<HandlerReport>,
    pub stopped_by: Option<String>,
}

impl GateReport {
    pub fn passed(&self) -> bool {
        self.stopped_by.is_none()
    }

    pub fn to_error(&self) -> Option<WeaveError> {
        self.handlers.last().and_then(|h| h.to_error(self.event))
    }
}

pub struct HookBus {
    handlers: RwLock<HashMap<HookEvent, Vec<(String, Handler)>>>,
    timeout: Duration,
}

impl HookBus {
    /// `timeout` bounds a whole fan-out and each gated handler.
    pub fn new(timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    pub fn on<F>(&self, event: HookEvent, name: impl Into<String>, handler: F)
    where
        F: Fn(&HookPayload) -> Result<(), String> + Send + Sync + 'static,
    {
        self.on_arc(event, name, Arc::new(handler));
    }

    pub fn on_arc(&self, event: HookEvent, name: impl Into<String>, handler: Handler) {
        if let Ok(mut map) = self.handlers.write() {
            map.entry(event).or_default().push((name.into(), handler));
        }
    }

    pub fn subscriber_count(&self, event: HookEvent) -> usize {
        self.handlers
            .read()
            .map(|m| m.get(&event).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    fn snapshot(&self, event: HookEvent) -> Vec<(String, Handler)> {
        self.handlers
            .read()
            .ok()
            .and_then(|m| m.get(&event).cloned())
            .unwrap_or_default()
    }

    /// Fan out to every subscriber of `payload.event` concurrently. All handlers
    /// share one deadline.
    pub fn emit(&self, payload: &HookPayload) -> EmitReport {
        let handlers = self.snapshot(payload.event);
        let shared = Arc::new(payload.clone());
        let running: Vec<_> = handlers
            .into_iter()
            .map(|(name, h)| (name, spawn_handler(h, Arc::clone(&shared))))
            .collect();
        let deadline = Instant::now() + self.timeout;
        let reports: Vec<HandlerReport> = running
            .into_iter()
            .map(|(handler, rx)| HandlerReport { handler, outcome: self.wait(&rx, deadline) })
            .collect();
        for r in reports.iter().filter(|r| r.failed()) {
            warn!(event = payload.event.as_str(), handler = %r.handler, outcome = ?r.outcome, "subscriber failed");
        }
        EmitReport { event: payload.event, handlers: reports }
    }

    /// Run subscribers one at a time; the first failure or timeout stops the gate.
    pub fn emit_gated(&self, payload: &HookPayload) -> GateReport {
        let shared = Arc::new(payload.clone());
        let mut reports = Vec::new();
        for (name, handler) in self.snapshot(payload.event) {
            let rx = spawn_handler(handler, Arc::clone(&shared));
            let outcome = self.wait(&rx, Instant::now() + self.timeout);
            let failed = outcome.is_err();
            if let Err(reason) = &outcome {
                warn!(event = payload.event.as_str(), handler = %name, %reason, "gate subscriber stopped emission");
            }
            reports.push(HandlerReport { handler: name.clone(), outcome });
            if failed {
                return GateReport { event: payload.event, handlers: reports, stopped_by: Some(name) };
            }
        }
        GateReport { event: payload.event, handlers: reports, stopped_by: None }
    }

    fn wait(&self, rx: &Receiver<Result<(), String>>, deadline: Instant) -> Result<(), String> {
        match rx.recv_deadline(deadline) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(format!("timed out after {} ms", self.timeout.as_millis())),
            Err(RecvTimeoutError::Disconnected) => Err("handler thread vanished".to_string()),
        }
    }
}

impl Default for HookBus {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

/// Run `handler` on a detached thread; its outcome arrives on the returned channel.
fn spawn_handler(handler: Handler, payload: Arc<HookPayload>) -> Receiver<Result<(), String>> {
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let _ = tx.send(invoke(&handler, &payload));
    });
    rx
}

fn invoke(handler: &Handler, payload: &HookPayload) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
        Ok(outcome) => outcome,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("panicked: {msg}"))
        }
    }
}
