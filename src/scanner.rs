//! Periodic registry scanners
//!
//! Each scan takes a registry snapshot, decides per entry, and applies its change
//! with a single compare-and-set on that entry. Signalling and waiting happen
//! after the entry is already Terminating, so two scans never act on one worker.

use crate::clock::{self, Clock};
use crate::config::ServerPoolConfig;
use crate::identity::ClassKey;
use crate::pool::WorkerPool;
use crate::process::ProcessStatus;
use crate::registry::{WorkerEntry, WorkerState};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
struct FailureWindow {
    started_at: i64,
    failures: u32,
    window: Duration,
}

/// Recent spawn failures per class
///
/// Once `spawn_failure_threshold` failures land within one error-scan interval,
/// spawning for that class is suppressed until the interval runs out.
pub struct ErrorTracker {
    windows: DashMap<ClassKey, FailureWindow>,
    clock: Arc<dyn Clock>,
}

impl ErrorTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    /// Record a failed spawn; returns true if the class is now suppressed
    pub fn record_failure(&self, class: &ClassKey, config: &ServerPoolConfig) -> bool {
        let now = self.clock.now_millis();
        let window = config.error_scan_interval();
        let mut entry = self.windows.entry(*class).or_insert(FailureWindow {
            started_at: now,
            failures: 0,
            window,
        });
        if clock::elapsed(now, entry.started_at) >= entry.window {
            *entry = FailureWindow {
                started_at: now,
                failures: 0,
                window,
            };
        }
        entry.failures += 1;

        let suppressed = entry.failures >= config.spawn_failure_threshold;
        if suppressed && entry.failures == config.spawn_failure_threshold {
            warn!(
                class = %class,
                failures = entry.failures,
                backoff_secs = window.as_secs(),
                "Spawn failures over threshold, backing off"
            );
        }
        suppressed
    }

    /// Whether spawning for `class` is currently backed off
    pub fn is_suppressed(&self, class: &ClassKey, config: &ServerPoolConfig) -> bool {
        let now = self.clock.now_millis();
        match self.windows.get(class) {
            Some(w) => {
                clock::elapsed(now, w.started_at) < w.window
                    && w.failures >= config.spawn_failure_threshold
            }
            None => false,
        }
    }

    pub fn failures(&self, class: &ClassKey) -> u32 {
        self.windows.get(class).map(|w| w.failures).unwrap_or(0)
    }

    /// Drop expired windows, returning the classes whose backoff ended
    pub fn sweep(&self) -> Vec<ClassKey> {
        let now = self.clock.now_millis();
        let expired: Vec<ClassKey> = self
            .windows
            .iter()
            .filter(|w| clock::elapsed(now, w.started_at) >= w.window)
            .map(|w| *w.key())
            .collect();
        for class in &expired {
            self.windows.remove(class);
        }
        expired
    }
}

/// What one scan pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub retired: usize,
    pub spawned: usize,
    pub reaped: usize,
}

/// Runs the idle, busy, error and zombie scans against a pool
#[derive(Clone)]
pub struct Scanner {
    pool: WorkerPool,
}

impl Scanner {
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool }
    }

    fn now(&self) -> i64 {
        self.pool.registry().now()
    }

    fn snapshot(&self) -> Vec<WorkerEntry> {
        match self.pool.registry().snapshot() {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "Failed to snapshot registry");
                Vec::new()
            }
        }
    }

    fn by_class(entries: Vec<WorkerEntry>) -> BTreeMap<ClassKey, Vec<WorkerEntry>> {
        let mut grouped: BTreeMap<ClassKey, Vec<WorkerEntry>> = BTreeMap::new();
        for entry in entries {
            grouped.entry(entry.class.key()).or_default().push(entry);
        }
        grouped
    }

    fn retire(&self, entry: &WorkerEntry, from: WorkerState, force: bool) -> bool {
        match self.pool.retire(entry, &[from], force) {
            Ok(acted) => acted,
            Err(e) => {
                error!(worker = %entry.id, error = %e, "Failed to retire worker");
                false
            }
        }
    }

    /// Evict idle workers, retire over-age ones, then top classes back up to their floor
    pub fn idle_scan(&self) -> ScanReport {
        let mut report = ScanReport::default();
        let now = self.now();

        for (key, entries) in Self::by_class(self.snapshot()) {
            let config = self.pool.class_config(&key);
            let lifetime = config.proc_lifetime();

            // Over-age idle workers go regardless of the floor
            let (expired, remaining): (Vec<_>, Vec<_>) = entries
                .into_iter()
                .partition(|e| e.state == WorkerState::Idle && e.age(now) >= lifetime);
            for entry in &expired {
                if self.retire(entry, WorkerState::Idle, false) {
                    info!(
                        class = %key,
                        worker = %entry.id,
                        pid = entry.pid,
                        age_secs = entry.age(now).as_secs(),
                        "Worker reached process lifetime"
                    );
                    report.retired += 1;
                }
            }

            for entry in self.pool.scoring().select_evictions(&remaining, &config, now) {
                if self.retire(&entry, WorkerState::Idle, false) {
                    info!(
                        class = %key,
                        worker = %entry.id,
                        pid = entry.pid,
                        idle_secs = entry.idle_for(now).as_secs(),
                        "Idle worker evicted"
                    );
                    report.retired += 1;
                }
            }
        }

        report.spawned = self.maintain_floor();
        report
    }

    /// Prespawn idle workers for known classes below `min_class_process_count`
    fn maintain_floor(&self) -> usize {
        let mut spawned = 0;
        for spec in self.pool.classes() {
            let floor = spec.config.min_class_process_count;
            if floor == 0 {
                continue;
            }
            let live = match self.pool.registry().live_counts(&spec.key()) {
                Ok((live, _)) => live,
                Err(e) => {
                    error!(class = %spec.key(), error = %e, "Failed to count workers");
                    continue;
                }
            };
            for _ in live..floor {
                match self.pool.prespawn(&spec) {
                    Ok(_) => spawned += 1,
                    Err(e) => {
                        debug!(class = %spec.key(), error = %e, "Floor spawn skipped");
                        break;
                    }
                }
            }
        }
        spawned
    }

    /// Kill workers stuck on one request longer than `busy_timeout`
    pub fn busy_scan(&self) -> ScanReport {
        let mut report = ScanReport::default();
        let now = self.now();

        for entry in self.snapshot() {
            if entry.state != WorkerState::Busy {
                continue;
            }
            let busy_timeout = self.pool.class_config(&entry.class.key()).busy_timeout();
            let busy_for = entry.idle_for(now);
            if busy_for > busy_timeout && self.retire(&entry, WorkerState::Busy, true) {
                warn!(
                    class = %entry.class.key(),
                    worker = %entry.id,
                    pid = entry.pid,
                    busy_secs = busy_for.as_secs(),
                    "Busy timeout exceeded, worker killed"
                );
                report.retired += 1;
            }
        }
        report
    }

    /// Expire backoff windows and catch workers that exited on their own
    pub fn error_scan(&self) -> ScanReport {
        let mut report = ScanReport::default();

        for class in self.pool.errors().sweep() {
            info!(class = %class, "Spawn backoff cleared");
        }

        for entry in self.snapshot() {
            if !matches!(entry.state, WorkerState::Idle | WorkerState::Busy) {
                continue;
            }
            let ProcessStatus::Exited(code) = self.pool.launcher().poll(entry.pid) else {
                continue;
            };
            match self.pool.registry().mark_zombie(entry.id) {
                Ok(Some(_)) => {
                    warn!(
                        class = %entry.class.key(),
                        worker = %entry.id,
                        pid = entry.pid,
                        ?code,
                        requests = entry.requests_served,
                        "Worker exited unexpectedly"
                    );
                    if entry.requests_served == 0 {
                        let config = self.pool.class_config(&entry.class.key());
                        self.pool.errors().record_failure(&entry.class.key(), &config);
                    }
                    report.retired += 1;
                }
                Ok(None) => {}
                Err(e) => error!(worker = %entry.id, error = %e, "Failed to mark worker exited"),
            }
        }
        report
    }

    /// Reap exited workers and force-kill those that ignored their termination signal
    pub fn zombie_scan(&self) -> ScanReport {
        let mut report = ScanReport::default();
        let now = self.now();

        for entry in self.snapshot() {
            match entry.state {
                WorkerState::Terminating => {
                    // pid 0: retired before its process was ever launched
                    let exited = entry.pid == 0
                        || matches!(self.pool.launcher().poll(entry.pid), ProcessStatus::Exited(_));
                    if !exited {
                        let grace = self.pool.class_config(&entry.class.key()).zombie_scan_interval();
                        let retired_for = clock::elapsed(now, entry.retired_at.unwrap_or(now));
                        if retired_for >= grace {
                            debug!(worker = %entry.id, pid = entry.pid, "Worker ignored SIGTERM, killing");
                            self.pool.launcher().signal(entry.pid, true);
                        }
                        continue;
                    }
                }
                WorkerState::Zombie => {
                    // Collect the exit status if this process owns it
                    self.pool.launcher().poll(entry.pid);
                }
                WorkerState::Spawning => {
                    // Left behind by a server process that died mid-spawn
                    if self.pool.launcher().poll(entry.owner_pid) != ProcessStatus::Exited(None) {
                        continue;
                    }
                }
                WorkerState::Idle | WorkerState::Busy => continue,
            }

            match self.pool.reap(&entry) {
                Ok(()) => report.reaped += 1,
                Err(e) => error!(worker = %entry.id, error = %e, "Failed to reap worker"),
            }
        }
        report
    }

    /// Run all four scans on their own intervals until shutdown is signalled
    ///
    /// Intervals come from the main server; vhosts cannot change scan cadence.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let config = self.pool.settings().main_server();
        info!(
            idle_secs = config.idle_scan_interval_secs,
            busy_secs = config.busy_scan_interval_secs,
            error_secs = config.error_scan_interval_secs,
            zombie_secs = config.zombie_scan_interval_secs,
            "Scanners started"
        );

        let mut idle = tokio::time::interval(config.idle_scan_interval());
        let mut busy = tokio::time::interval(config.busy_scan_interval());
        let mut errors = tokio::time::interval(config.error_scan_interval());
        let mut zombies = tokio::time::interval(config.zombie_scan_interval());
        for interval in [&mut idle, &mut busy, &mut errors, &mut zombies] {
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = idle.tick() => {
                    let report = self.idle_scan();
                    if report != ScanReport::default() {
                        debug!(?report, "Idle scan");
                    }
                }
                _ = busy.tick() => {
                    self.busy_scan();
                }
                _ = errors.tick() => {
                    self.error_scan();
                }
                _ = zombies.tick() => {
                    self.zombie_scan();
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Scanners shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn key(inode: u64) -> ClassKey {
        ClassKey {
            inode,
            device_id: 1,
            share_group_id: 0,
        }
    }

    fn config(threshold: u32, window_secs: u64) -> ServerPoolConfig {
        ServerPoolConfig {
            spawn_failure_threshold: threshold,
            error_scan_interval_secs: window_secs,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_after_threshold() {
        let clock = Arc::new(ManualClock::default());
        let tracker = ErrorTracker::new(clock.clone());
        let c = config(3, 10);

        assert!(!tracker.record_failure(&key(1), &c));
        assert!(!tracker.record_failure(&key(1), &c));
        assert!(!tracker.is_suppressed(&key(1), &c));
        assert!(tracker.record_failure(&key(1), &c));
        assert!(tracker.is_suppressed(&key(1), &c));

        // Other classes are unaffected
        assert!(!tracker.is_suppressed(&key(2), &c));
    }

    #[test]
    fn test_backoff_holds_until_window_ends() {
        let clock = Arc::new(ManualClock::default());
        let tracker = ErrorTracker::new(clock.clone());
        let c = config(2, 10);

        tracker.record_failure(&key(1), &c);
        tracker.record_failure(&key(1), &c);
        clock.advance(Duration::from_secs(9));
        assert!(tracker.is_suppressed(&key(1), &c));
        assert!(tracker.sweep().is_empty());

        clock.advance(Duration::from_secs(1));
        assert!(!tracker.is_suppressed(&key(1), &c));
        assert_eq!(tracker.sweep(), vec![key(1)]);
        assert_eq!(tracker.failures(&key(1)), 0);
    }

    #[test]
    fn test_failures_in_separate_windows_do_not_accumulate() {
        let clock = Arc::new(ManualClock::default());
        let tracker = ErrorTracker::new(clock.clone());
        let c = config(2, 5);

        tracker.record_failure(&key(1), &c);
        clock.advance(Duration::from_secs(6));
        assert!(!tracker.record_failure(&key(1), &c));
        assert_eq!(tracker.failures(&key(1)), 1);
    }
}
