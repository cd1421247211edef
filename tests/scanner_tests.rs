//! Integration tests for the idle, busy, error and zombie scanners

mod common;

use common::harness;
use fcgid_pool::scanner::{ScanReport, Scanner};
use fcgid_pool::{Outcome, WorkerState};
use std::time::Duration;
use tokio::sync::watch;

fn states(h: &common::Harness) -> Vec<WorkerState> {
    let mut entries = h.pool.registry().snapshot().unwrap();
    entries.sort_by_key(|e| e.id);
    entries.into_iter().map(|e| e.state).collect()
}

// ============================================================================
// Idle scan
// ============================================================================

#[tokio::test]
async fn test_idle_worker_evicted_after_timeout_then_reaped() {
    let h = harness(|c| c.idle_timeout_secs = 300);
    let scanner = Scanner::new(h.pool.clone());

    let lease = h.pool.checkout(h.host(), &h.script).await.unwrap();
    let pid = lease.handle().pid;
    let socket = lease.handle().socket_path.clone();
    lease.finish(Outcome::Success);

    h.clock.advance(Duration::from_secs(300));
    assert_eq!(scanner.idle_scan(), ScanReport::default());
    assert_eq!(states(&h), vec![WorkerState::Idle]);

    h.clock.advance(Duration::from_secs(1));
    assert_eq!(scanner.idle_scan().retired, 1);
    assert_eq!(states(&h), vec![WorkerState::Terminating]);
    assert_eq!(h.launcher.signals_for(pid), vec![false]);

    assert_eq!(scanner.zombie_scan().reaped, 1);
    assert!(h.pool.registry().snapshot().unwrap().is_empty());
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_idle_eviction_respects_class_floor() {
    let h = harness(|c| {
        c.min_class_process_count = 1;
        c.proc_lifetime_secs = 86_400;
    });
    let scanner = Scanner::new(h.pool.clone());

    let (a, b) = tokio::join!(
        h.pool.checkout(h.host(), &h.script),
        h.pool.checkout(h.host(), &h.script)
    );
    a.unwrap().finish(Outcome::Success);
    b.unwrap().finish(Outcome::Success);

    h.clock.advance(Duration::from_secs(3000));
    let report = scanner.idle_scan();
    assert_eq!(report.retired, 1);
    assert_eq!(report.spawned, 0);

    // The floor holds on later passes
    h.clock.advance(Duration::from_secs(3000));
    assert_eq!(scanner.idle_scan().retired, 0);
    let idle = states(&h).into_iter().filter(|s| *s == WorkerState::Idle).count();
    assert_eq!(idle, 1);
}

#[tokio::test]
async fn test_idle_scan_replenishes_floor() {
    let h = harness(|c| c.min_class_process_count = 2);
    let scanner = Scanner::new(h.pool.clone());
    h.pool.resolve_class(h.host(), &h.script).unwrap();

    let report = scanner.idle_scan();
    assert_eq!(report.spawned, 2);
    assert_eq!(states(&h), vec![WorkerState::Idle, WorkerState::Idle]);

    assert_eq!(scanner.idle_scan().spawned, 0);
    assert_eq!(h.launcher.launches(), 2);
}

#[tokio::test]
async fn test_lifetime_retirement_ignores_floor_and_replenishes() {
    let h = harness(|c| {
        c.min_class_process_count = 1;
        c.proc_lifetime_secs = 60;
    });
    let scanner = Scanner::new(h.pool.clone());

    let lease = h.pool.checkout(h.host(), &h.script).await.unwrap();
    let old_pid = lease.handle().pid;
    lease.finish(Outcome::Success);

    h.clock.advance(Duration::from_secs(60));
    let report = scanner.idle_scan();
    assert_eq!(report.retired, 1);
    assert_eq!(report.spawned, 1);
    assert_eq!(h.launcher.signals_for(old_pid), vec![false]);
    assert_eq!(states(&h), vec![WorkerState::Terminating, WorkerState::Idle]);
}

#[tokio::test]
async fn test_demand_does_not_hold_idle_worker_past_timeout() {
    let h = harness(|c| {
        c.idle_timeout_secs = 10;
        c.spawn_score = 100;
        c.spawnscore_uplimit = 1000;
    });
    let scanner = Scanner::new(h.pool.clone());

    let lease = h.pool.checkout(h.host(), &h.script).await.unwrap();
    lease.finish(Outcome::Success);

    h.clock.advance(Duration::from_secs(11));
    assert_eq!(scanner.idle_scan().retired, 1);
    assert_eq!(states(&h), vec![WorkerState::Terminating]);
}

#[tokio::test]
async fn test_idle_eviction_without_time_weighting() {
    let h = harness(|c| {
        c.idle_timeout_secs = 10;
        c.time_score = 0;
        c.proc_lifetime_secs = 86_400;
    });
    let scanner = Scanner::new(h.pool.clone());

    let lease = h.pool.checkout(h.host(), &h.script).await.unwrap();
    lease.finish(Outcome::Success);

    h.clock.advance(Duration::from_secs(1000));
    assert_eq!(scanner.idle_scan().retired, 1);
    assert_eq!(states(&h), vec![WorkerState::Terminating]);
}

#[tokio::test]
async fn test_idle_eviction_with_high_termination_score() {
    let h = harness(|c| {
        c.idle_timeout_secs = 10;
        c.termination_score = 60;
    });
    let scanner = Scanner::new(h.pool.clone());

    let lease = h.pool.checkout(h.host(), &h.script).await.unwrap();
    lease.finish(Outcome::Success);

    h.clock.advance(Duration::from_secs(11));
    assert_eq!(scanner.idle_scan().retired, 1);
    assert_eq!(states(&h), vec![WorkerState::Terminating]);
}

#[tokio::test]
async fn test_floor_keeps_most_recently_used_worker() {
    let h = harness(|c| {
        c.min_class_process_count = 1;
        c.proc_lifetime_secs = 86_400;
    });
    let scanner = Scanner::new(h.pool.clone());

    let (a, b) = tokio::join!(
        h.pool.checkout(h.host(), &h.script),
        h.pool.checkout(h.host(), &h.script)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    let (older, newer) = (a.handle().pid, b.handle().pid);
    a.finish(Outcome::Success);
    h.clock.advance(Duration::from_secs(100));
    b.finish(Outcome::Success);

    h.clock.advance(Duration::from_secs(3000));
    assert_eq!(scanner.idle_scan().retired, 1);
    assert_eq!(h.launcher.signals_for(older), vec![false]);
    assert!(h.launcher.signals_for(newer).is_empty());
}

// ============================================================================
// Busy scan
// ============================================================================

#[tokio::test]
async fn test_busy_scan_kills_hung_worker() {
    let h = harness(|c| c.busy_timeout_secs = 10);
    let scanner = Scanner::new(h.pool.clone());

    let lease = h.pool.checkout(h.host(), &h.script).await.unwrap();
    let pid = lease.handle().pid;

    h.clock.advance(Duration::from_secs(10));
    assert_eq!(scanner.busy_scan().retired, 0);

    h.clock.advance(Duration::from_secs(1));
    assert_eq!(scanner.busy_scan().retired, 1);
    assert_eq!(h.launcher.signals_for(pid).first(), Some(&true));
    assert!(!h.launcher.is_running(pid));

    // The late release finds the worker already retired
    assert_eq!(lease.finish(Outcome::Success), WorkerState::Terminating);
    assert_eq!(scanner.zombie_scan().reaped, 1);
}

// ============================================================================
// Error scan
// ============================================================================

#[tokio::test]
async fn test_error_scan_detects_exited_workers() {
    let h = harness(|_| {});
    let scanner = Scanner::new(h.pool.clone());
    let spec = h.pool.resolve_class(h.host(), &h.script).unwrap();

    // One worker that served a request, one that never did
    let lease = h.pool.checkout_class(&spec).await.unwrap();
    let served_pid = lease.handle().pid;
    lease.finish(Outcome::Success);
    let fresh = h.pool.prespawn(&spec).unwrap();
    let fresh_pid = h.pool.registry().get(fresh).unwrap().unwrap().pid;

    h.launcher.crash(served_pid);
    assert_eq!(scanner.error_scan().retired, 1);
    assert_eq!(h.pool.errors().failures(&spec.key()), 0);

    h.launcher.crash(fresh_pid);
    assert_eq!(scanner.error_scan().retired, 1);
    assert_eq!(h.pool.errors().failures(&spec.key()), 1);

    assert_eq!(states(&h), vec![WorkerState::Zombie, WorkerState::Zombie]);
    assert_eq!(scanner.zombie_scan().reaped, 2);
    assert!(h.pool.registry().snapshot().unwrap().is_empty());
}

#[tokio::test]
async fn test_error_scan_clears_expired_backoff() {
    let h = harness(|c| {
        c.spawn_failure_threshold = 1;
        c.error_scan_interval_secs = 3;
    });
    let scanner = Scanner::new(h.pool.clone());
    h.launcher.set_failing(true);

    assert!(h.pool.checkout(h.host(), &h.script).await.is_err());
    let status = h.pool.status().unwrap();
    assert!(status.classes.is_empty());
    let spec = h.pool.resolve_class(h.host(), &h.script).unwrap();
    assert!(h.pool.errors().is_suppressed(&spec.key(), &spec.config));

    h.clock.advance(Duration::from_secs(3));
    scanner.error_scan();
    assert_eq!(h.pool.errors().failures(&spec.key()), 0);
    assert!(!h.pool.errors().is_suppressed(&spec.key(), &spec.config));
}

// ============================================================================
// Zombie scan
// ============================================================================

#[tokio::test]
async fn test_zombie_scan_escalates_to_kill() {
    let h = harness(|c| c.zombie_scan_interval_secs = 3);
    let scanner = Scanner::new(h.pool.clone());
    h.launcher.set_ignore_term(true);

    let lease = h.pool.checkout(h.host(), &h.script).await.unwrap();
    let pid = lease.handle().pid;
    assert_eq!(lease.finish(Outcome::Error), WorkerState::Terminating);
    assert!(h.launcher.is_running(pid));

    assert_eq!(scanner.zombie_scan().reaped, 0);
    assert_eq!(h.launcher.signals_for(pid), vec![false]);

    h.clock.advance(Duration::from_secs(3));
    assert_eq!(scanner.zombie_scan().reaped, 0);
    assert_eq!(h.launcher.signals_for(pid), vec![false, true]);
    assert!(!h.launcher.is_running(pid));

    assert_eq!(scanner.zombie_scan().reaped, 1);
    assert!(h.pool.registry().snapshot().unwrap().is_empty());
}

#[tokio::test]
async fn test_zombie_scan_leaves_live_workers_alone() {
    let h = harness(|_| {});
    let scanner = Scanner::new(h.pool.clone());

    let busy = h.pool.checkout(h.host(), &h.script).await.unwrap();
    let idle = h.pool.checkout(h.host(), &h.script).await.unwrap();
    idle.finish(Outcome::Success);

    h.clock.advance(Duration::from_secs(60));
    assert_eq!(scanner.zombie_scan(), ScanReport::default());
    assert_eq!(h.pool.registry().snapshot().unwrap().len(), 2);
    drop(busy);
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let h = harness(|_| {});
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(Scanner::new(h.pool.clone()).run(rx));

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), task).await;
    assert!(result.is_ok(), "scanner did not stop");
}
