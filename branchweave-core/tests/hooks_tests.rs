use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use branchweave_core::hooks::{HookBus, HookEvent, HookPayload};
use branchweave_core::WeaveError;
use serde_json::json;

fn payload(event: HookEvent) -> HookPayload {
    HookPayload::new(event, json!({ "note": "test" })).for_session("s1", "b1")
}

#[test]
fn failing_and_panicking_handlers_do_not_stop_others() {
    let bus = HookBus::default();
    let ran = Arc::new(AtomicUsize::new(0));

    let r = Arc::clone(&ran);
    bus.on(HookEvent::Audit, "counter", move |_| {
        r.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    bus.on(HookEvent::Audit, "exploder", |_| panic!("telemetry sink down"));
    bus.on(HookEvent::Audit, "refuser", |_| Err("disk full".to_string()));
    let r = Arc::clone(&ran);
    bus.on(HookEvent::Audit, "late_counter", move |_| {
        r.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let report = bus.emit(&payload(HookEvent::Audit));
    assert_eq!(ran.load(Ordering::SeqCst), 2);
    let names: Vec<&str> = report.handlers.iter().map(|h| h.handler.as_str()).collect();
    assert_eq!(names, ["counter", "exploder", "refuser", "late_counter"]);

    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 2);
    assert!(failures[0].outcome.as_ref().unwrap_err().contains("telemetry sink down"));
    let err = failures[1].to_error(HookEvent::Audit).expect("subscriber error");
    assert!(matches!(err, WeaveError::Subscriber { ref handler, .. } if handler == "refuser"));
}

#[test]
fn fan_out_runs_subscribers_concurrently() {
    let bus = HookBus::default();
    let barrier = Arc::new(Barrier::new(2));
    for name in ["left", "right"] {
        let b = Arc::clone(&barrier);
        // each handler waits for the other; only concurrent dispatch gets past this
        bus.on(HookEvent::PostCommit, name, move |_| {
            b.wait();
            Ok(())
        });
    }
    let report = bus.emit(&payload(HookEvent::PostCommit));
    assert_eq!(report.failures().count(), 0);
}

#[test]
fn gated_emission_stops_at_first_failure() {
    let bus = HookBus::default();
    let later = Arc::new(AtomicUsize::new(0));
    bus.on(HookEvent::PreInject, "schema", |_| Ok(()));
    bus.on(HookEvent::PreInject, "continuity", |_| Err("keeper is dead in act 2".to_string()));
    let l = Arc::clone(&later);
    bus.on(HookEvent::PreInject, "never", move |_| {
        l.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let gate = bus.emit_gated(&payload(HookEvent::PreInject));
    assert!(!gate.passed());
    assert_eq!(gate.stopped_by.as_deref(), Some("continuity"));
    assert_eq!(gate.handlers.len(), 2);
    assert_eq!(later.load(Ordering::SeqCst), 0);
    assert!(matches!(gate.to_error(), Some(WeaveError::Subscriber { .. })));
}

#[test]
fn hung_gate_subscriber_times_out_as_failure() {
    let bus = HookBus::new(Duration::from_millis(50));
    bus.on(HookEvent::PreCommit, "sleeper", |_| {
        thread::sleep(Duration::from_millis(500));
        Ok(())
    });
    let started = Instant::now();
    let gate = bus.emit_gated(&payload(HookEvent::PreCommit));
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(gate.stopped_by.as_deref(), Some("sleeper"));
    assert!(gate.handlers[0].outcome.as_ref().unwrap_err().contains("timed out"));
}

#[test]
fn panicking_gate_subscriber_is_a_failure_not_a_crash() {
    let bus = HookBus::default();
    bus.on(HookEvent::PreCommit, "exploder", |_| panic!("boom"));
    let gate = bus.emit_gated(&payload(HookEvent::PreCommit));
    assert_eq!(gate.stopped_by.as_deref(), Some("exploder"));
}

#[test]
fn handlers_only_see_their_event() {
    let bus = HookBus::default();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    bus.on(HookEvent::OnRollback, "rollback_only", move |p| {
        assert_eq!(p.event, HookEvent::OnRollback);
        h.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    bus.emit(&payload(HookEvent::StateChange));
    bus.emit(&payload(HookEvent::OnRollback));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(bus.subscriber_count(HookEvent::OnRollback), 1);
    assert_eq!(bus.subscriber_count(HookEvent::Audit), 0);
}

#[test]
fn hung_fan_out_subscriber_does_not_hold_up_emission() {
    let bus = HookBus::new(Duration::from_millis(50));
    bus.on(HookEvent::StateChange, "slow_telemetry", |_| {
        thread::sleep(Duration::from_millis(500));
        Ok(())
    });
    bus.on(HookEvent::StateChange, "metrics", |_| Ok(()));

    let started = Instant::now();
    let report = bus.emit(&payload(HookEvent::StateChange));
    assert!(started.elapsed() < Duration::from_millis(400));

    assert_eq!(report.handlers.len(), 2);
    assert!(report.handlers[0].outcome.as_ref().unwrap_err().contains("timed out"));
    assert_eq!(report.handlers[1].outcome, Ok(()));
    assert_eq!(report.failures().count(), 1);
}
