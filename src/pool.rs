//! Worker pool: request checkout and worker lifecycle
//!
//! [`WorkerPool`] ties the registry, scoring engine, error tracker and launcher
//! together. A request checks out a [`WorkerLease`], which owns the claimed worker
//! and its channel until it is finished or dropped; either way the worker goes
//! back to the registry exactly once.

use crate::clock::Clock;
use crate::config::{ServerPoolConfig, Settings};
use crate::env;
use crate::error::PoolError;
use crate::identity::{ClassKey, IdentityResolver, ProcessClassIdentity};
use crate::ipc::{self, Channel};
use crate::process::{self, LaunchSpec, Launcher};
use crate::registry::{
    Acquire, Outcome, Registry, RegistryStore, RetirePolicy, SlotLimits, WorkerEntry, WorkerHandle,
    WorkerId, WorkerState,
};
use crate::scanner::ErrorTracker;
use crate::scoring::Scoring;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A process class as first seen by this pool, with its launch command
#[derive(Debug, Clone)]
pub struct ClassSpec {
    pub identity: ProcessClassIdentity,
    pub launch_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Effective server configuration of the scope the class was first reached from
    pub config: Arc<ServerPoolConfig>,
}

impl ClassSpec {
    pub fn key(&self) -> ClassKey {
        self.identity.key()
    }
}

/// Counters for pool activity
#[derive(Debug, Default)]
pub struct PoolStats {
    pub checkouts: AtomicU64,
    pub spawns: AtomicU64,
    pub spawn_failures: AtomicU64,
    pub exhausted: AtomicU64,
    pub timeouts: AtomicU64,
}

impl PoolStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            checkouts: self.checkouts.load(Ordering::Relaxed),
            spawns: self.spawns.load(Ordering::Relaxed),
            spawn_failures: self.spawn_failures.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub checkouts: u64,
    pub spawns: u64,
    pub spawn_failures: u64,
    pub exhausted: u64,
    pub timeouts: u64,
}

/// Per-class worker counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassStatus {
    pub class: String,
    pub path: PathBuf,
    pub spawning: usize,
    pub idle: usize,
    pub busy: usize,
    pub terminating: usize,
    pub zombie: usize,
    pub spawn_score: u64,
    pub suppressed: bool,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStatus {
    pub live: usize,
    pub classes: Vec<ClassStatus>,
    pub stats: StatsSnapshot,
}

struct PoolInner {
    settings: Arc<Settings>,
    registry: Registry,
    scoring: Scoring,
    errors: ErrorTracker,
    launcher: Arc<dyn Launcher>,
    classes: DashMap<ClassKey, Arc<ClassSpec>>,
    stats: PoolStats,
}

/// The process pool manager
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn RegistryStore>,
        launcher: Arc<dyn Launcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                settings,
                registry: Registry::new(store, Arc::clone(&clock)),
                scoring: Scoring::new(Arc::clone(&clock)),
                errors: ErrorTracker::new(clock),
                launcher,
                classes: DashMap::new(),
                stats: PoolStats::default(),
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn scoring(&self) -> &Scoring {
        &self.inner.scoring
    }

    pub fn errors(&self) -> &ErrorTracker {
        &self.inner.errors
    }

    pub fn launcher(&self) -> &dyn Launcher {
        self.inner.launcher.as_ref()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Class specs seen so far
    pub fn classes(&self) -> Vec<Arc<ClassSpec>> {
        self.inner
            .classes
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect()
    }

    pub fn class(&self, key: &ClassKey) -> Option<Arc<ClassSpec>> {
        self.inner.classes.get(key).map(|c| Arc::clone(c.value()))
    }

    /// Configuration governing a class; the main server's for classes not seen here
    pub fn class_config(&self, key: &ClassKey) -> Arc<ServerPoolConfig> {
        self.class(key)
            .map(|c| Arc::clone(&c.config))
            .unwrap_or_else(|| self.inner.settings.main_server())
    }

    /// Register a class spec, keeping the first one seen for its identity
    pub fn register_class(&self, spec: ClassSpec) -> Arc<ClassSpec> {
        let key = spec.key();
        Arc::clone(
            self.inner
                .classes
                .entry(key)
                .or_insert_with(|| {
                    debug!(class = %key, path = %spec.identity.path.display(), "New process class");
                    Arc::new(spec)
                })
                .value(),
        )
    }

    /// Resolve the class serving `script` on virtual host `host`
    ///
    /// A wrapper mapped to the script's extension takes precedence; otherwise the
    /// script itself is the worker executable.
    pub fn resolve_class(&self, host: &str, script: &Path) -> Result<Arc<ClassSpec>, PoolError> {
        let settings = &self.inner.settings;
        let config = settings.server(host);
        let directory = settings.directory(script);

        let (identity, launch_args) = match directory.resolve_wrapper(script) {
            Some(wrapper) => (wrapper.identity(), wrapper.launch_args.clone()),
            None => {
                let identity = IdentityResolver.resolve(script, directory.share_group_id)?;
                let program = identity.path.to_string_lossy().into_owned();
                (identity, vec![program])
            }
        };

        Ok(self.register_class(ClassSpec {
            identity,
            launch_args,
            working_dir: script.parent().map(Path::to_path_buf),
            config,
        }))
    }

    /// Check a request body against the host's admission limits
    pub fn admit_request_body(&self, host: &str, len: u64) -> Result<env::BodyBuffer, PoolError> {
        env::admit_request_body(&self.inner.settings.server(host), len)
    }

    /// Check out a worker for a request on `host` targeting `script`
    pub async fn checkout(&self, host: &str, script: &Path) -> Result<WorkerLease, PoolError> {
        let spec = self.resolve_class(host, script)?;
        self.checkout_class(&spec).await
    }

    /// Check out a worker of an already resolved class
    pub async fn checkout_class(&self, spec: &Arc<ClassSpec>) -> Result<WorkerLease, PoolError> {
        let inner = &self.inner;
        let config = &spec.config;
        let key = spec.key();
        PoolStats::bump(&inner.stats.checkouts);

        let (handle, fresh) = match inner
            .registry
            .acquire(&spec.identity, SlotLimits::from_config(config))?
        {
            Acquire::Worker(handle) => (handle, false),
            Acquire::NeedsSpawn => {
                inner.scoring.record_miss(&key, config);
                (self.spawn_for_request(spec)?, true)
            }
            Acquire::PoolExhausted => {
                PoolStats::bump(&inner.stats.exhausted);
                debug!(class = %key, "Process pool exhausted");
                return Err(PoolError::PoolExhausted {
                    class: key.to_string(),
                });
            }
        };
        let policy = RetirePolicy::from_config(config);
        let claim = Claim::new(self.clone(), handle, policy);

        if inner.scoring.should_prespawn(&key, config) {
            if let Err(e) = self.prespawn(spec) {
                debug!(class = %key, error = %e, "Proactive spawn skipped");
            }
        }

        let channel = match ipc::connect(
            &claim.handle().socket_path,
            config.ipc_connect_timeout(),
            config.ipc_comm_timeout(),
            config.output_buffer_size,
        )
        .await
        {
            Ok(channel) => channel,
            Err(e) => {
                let handle = claim.handle();
                warn!(class = %key, worker = %handle.id, pid = handle.pid, error = %e, "Worker connect failed");
                if e.is_transport() {
                    PoolStats::bump(&inner.stats.timeouts);
                }
                if fresh {
                    // A worker that never accepts is as broken as one that fails to exec
                    self.record_spawn_failure(spec);
                }
                let outcome = if e.is_transport() {
                    Outcome::Timeout
                } else {
                    Outcome::Error
                };
                claim.release(outcome);
                return Err(e);
            }
        };

        Ok(WorkerLease {
            pool: self.clone(),
            handle: claim.into_handle(),
            policy,
            channel,
            outcome: Outcome::Error,
            timed_out: false,
            released: false,
        })
    }

    fn record_spawn_failure(&self, spec: &ClassSpec) {
        PoolStats::bump(&self.inner.stats.spawn_failures);
        self.inner.errors.record_failure(&spec.key(), &spec.config);
    }

    /// Launch a worker for a reserved slot and register it in `state`
    fn spawn(&self, spec: &ClassSpec, state: WorkerState) -> Result<WorkerHandle, PoolError> {
        let inner = &self.inner;
        let key = spec.key();
        let config = &spec.config;

        if inner.errors.is_suppressed(&key, config) {
            return Err(PoolError::Spawn(format!(
                "spawning for class {} is backed off after repeated failures",
                key
            )));
        }

        let reservation = inner
            .registry
            .reserve(&spec.identity, SlotLimits::from_config(config))?;
        let socket_path = process::socket_path(
            &config.socket_prefix,
            inner.registry.owner_pid(),
            reservation.id().0,
        );
        let launch = LaunchSpec {
            class: spec.identity.clone(),
            args: spec.launch_args.clone(),
            env: env::worker_environment(config),
            socket_path: socket_path.clone(),
            working_dir: spec.working_dir.clone(),
        };

        let pid = match inner.launcher.launch(&launch) {
            Ok(pid) => pid,
            Err(e) => {
                warn!(class = %key, error = %e, "Worker launch failed");
                inner.registry.abandon(reservation)?;
                self.record_spawn_failure(spec);
                return Err(e);
            }
        };

        match inner
            .registry
            .register_spawned(reservation, pid, socket_path.clone(), state)
        {
            Ok(handle) => {
                PoolStats::bump(&inner.stats.spawns);
                Ok(handle)
            }
            Err(e) => {
                inner.launcher.signal(pid, true);
                remove_socket(&socket_path);
                Err(e)
            }
        }
    }

    fn spawn_for_request(&self, spec: &ClassSpec) -> Result<WorkerHandle, PoolError> {
        self.spawn(spec, WorkerState::Busy)
    }

    /// Spawn an idle worker ahead of demand
    pub fn prespawn(&self, spec: &ClassSpec) -> Result<WorkerId, PoolError> {
        let handle = self.spawn(spec, WorkerState::Idle)?;
        info!(class = %spec.key(), worker = %handle.id, pid = handle.pid, "Prespawned idle worker");
        Ok(handle.id)
    }

    /// Return a worker to the registry, signalling it if it was retired
    pub fn release(&self, handle: &WorkerHandle, outcome: Outcome, policy: RetirePolicy) -> WorkerState {
        match self.inner.registry.release(handle, outcome, policy) {
            Ok(WorkerState::Terminating) => {
                info!(worker = %handle.id, pid = handle.pid, ?outcome, "Worker retired");
                self.inner.launcher.signal(handle.pid, false);
                WorkerState::Terminating
            }
            Ok(state) => state,
            Err(e) => {
                // Registry unusable; do not leave a process nobody tracks
                warn!(worker = %handle.id, error = %e, "Release failed, terminating worker");
                self.inner.launcher.signal(handle.pid, true);
                WorkerState::Terminating
            }
        }
    }

    /// Move an entry to Terminating and signal its process outside the registry
    ///
    /// Returns false if the entry was no longer in one of `from`.
    pub fn retire(&self, entry: &WorkerEntry, from: &[WorkerState], force: bool) -> Result<bool, PoolError> {
        if self.inner.registry.mark_terminating(entry.id, from)?.is_none() {
            return Ok(false);
        }
        self.inner.launcher.signal(entry.pid, force);
        Ok(true)
    }

    /// Remove an entry whose process is gone, along with its socket file
    pub fn reap(&self, entry: &WorkerEntry) -> Result<(), PoolError> {
        self.inner.registry.mark_zombie(entry.id)?;
        if let Some(removed) = self.inner.registry.reap(entry.id)? {
            remove_socket(&removed.socket_path);
            debug!(worker = %removed.id, pid = removed.pid, "Worker reaped");
        }
        Ok(())
    }

    /// Counts per class, from a registry snapshot
    pub fn status(&self) -> Result<PoolStatus, PoolError> {
        let entries = self.inner.registry.snapshot()?;
        let mut by_class: BTreeMap<ClassKey, ClassStatus> = BTreeMap::new();
        let mut live = 0;

        for entry in &entries {
            let key = entry.class.key();
            let status = by_class.entry(key).or_insert_with(|| ClassStatus {
                class: key.to_string(),
                path: entry.class.path.clone(),
                ..Default::default()
            });
            match entry.state {
                WorkerState::Spawning => status.spawning += 1,
                WorkerState::Idle => status.idle += 1,
                WorkerState::Busy => status.busy += 1,
                WorkerState::Terminating => status.terminating += 1,
                WorkerState::Zombie => status.zombie += 1,
            }
            if entry.state.is_live() {
                live += 1;
            }
        }

        for (key, status) in by_class.iter_mut() {
            let config = self.class_config(key);
            status.spawn_score = self.inner.scoring.spawn_score(key, &config);
            status.suppressed = self.inner.errors.is_suppressed(key, &config);
        }

        Ok(PoolStatus {
            live,
            classes: by_class.into_values().collect(),
            stats: self.stats(),
        })
    }

    /// Retire and reap every worker this server process launched
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        let owner = self.inner.registry.owner_pid();
        let entries: Vec<WorkerEntry> = self
            .inner
            .registry
            .snapshot()?
            .into_iter()
            .filter(|e| e.owner_pid == owner)
            .collect();
        info!(workers = entries.len(), "Shutting down worker pool");

        for entry in entries {
            self.inner.registry.mark_terminating(
                entry.id,
                &[WorkerState::Spawning, WorkerState::Idle, WorkerState::Busy],
            )?;
            let grace = self.class_config(&entry.class.key()).zombie_scan_interval();
            if entry.pid != 0 {
                process::stop(self.inner.launcher.as_ref(), entry.pid, grace).await;
            }
            self.reap(&entry)?;
        }
        Ok(())
    }
}

pub(crate) fn remove_socket(path: &Path) {
    if path.as_os_str().is_empty() {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(socket = %path.display(), error = %e, "Failed to remove worker socket"),
    }
}

/// A claimed worker not yet handed out in a lease
///
/// Covers the connect wait: if the checkout is abandoned there, the worker is
/// released as failed instead of staying Busy.
struct Claim {
    pool: WorkerPool,
    handle: WorkerHandle,
    policy: RetirePolicy,
    armed: bool,
}

impl Claim {
    fn new(pool: WorkerPool, handle: WorkerHandle, policy: RetirePolicy) -> Self {
        Self {
            pool,
            handle,
            policy,
            armed: true,
        }
    }

    fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    fn release(mut self, outcome: Outcome) {
        self.armed = false;
        self.pool.release(&self.handle, outcome, self.policy);
    }

    /// Hand the worker to a lease, which takes over releasing it
    fn into_handle(mut self) -> WorkerHandle {
        self.armed = false;
        self.handle.clone()
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if self.armed {
            debug!(worker = %self.handle.id, "Checkout abandoned before the worker was connected");
            self.pool.release(&self.handle, Outcome::Error, self.policy);
        }
    }
}

/// A worker exclusively held by one request
///
/// Dropping a lease without calling [`finish`](WorkerLease::finish) releases the
/// worker as failed, so it is retired rather than reused.
pub struct WorkerLease {
    pool: WorkerPool,
    handle: WorkerHandle,
    policy: RetirePolicy,
    channel: Channel,
    outcome: Outcome,
    timed_out: bool,
    released: bool,
}

impl WorkerLease {
    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    pub fn channel(&mut self) -> &mut Channel {
        &mut self.channel
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<(), PoolError> {
        let result = self.channel.send(data).await;
        if let Err(ref e) = result {
            self.timed_out |= e.is_transport();
        }
        result
    }

    pub async fn receive(&mut self) -> Result<&[u8], PoolError> {
        let result = self.channel.receive().await;
        if let Err(ref e) = result {
            self.timed_out |= e.is_transport();
        }
        result
    }

    /// Close the request side and read the whole response
    pub async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, PoolError> {
        self.send(request).await?;
        let result = match self.channel.finish_sending().await {
            Ok(()) => self.channel.receive_to_end().await,
            Err(e) => Err(e),
        };
        if let Err(ref e) = result {
            self.timed_out |= e.is_transport();
        }
        result
    }

    /// Release the worker with the request's outcome
    pub fn finish(mut self, outcome: Outcome) -> WorkerState {
        self.outcome = outcome;
        self.release_once()
    }

    fn release_once(&mut self) -> WorkerState {
        if self.released {
            return WorkerState::Busy;
        }
        self.released = true;
        if self.timed_out && self.outcome == Outcome::Success {
            self.outcome = Outcome::Timeout;
        }
        self.pool.release(&self.handle, self.outcome, self.policy)
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if !self.released {
            if self.timed_out {
                self.outcome = Outcome::Timeout;
            }
            debug!(worker = %self.handle.id, outcome = ?self.outcome, "Lease dropped without finish");
            self.release_once();
        }
    }
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("handle", &self.handle)
            .field("outcome", &self.outcome)
            .field("released", &self.released)
            .finish()
    }
}
