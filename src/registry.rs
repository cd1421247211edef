//! Process registry
//!
//! One entry per live or recently-live worker, keyed by process class plus a slot
//! id. The entries live in a [`RegistryStore`]: [`MemoryStore`](crate::store::MemoryStore)
//! for a single server process, or [`SqliteStore`](crate::db::SqliteStore) when
//! several server processes share one pool.
//!
//! Lifecycle:
//!
//! ```text
//! reserve ──► Spawning ──► Busy ◄──► Idle
//!                 │          │        │
//!                 ▼          ▼        ▼
//!             (abandon)    Terminating ──► Zombie ──► (reaped)
//! ```
//!
//! Claiming an idle entry is a single compare-and-set of its state; no lock is held
//! for the lifetime of a request.

use crate::clock::{self, Clock};
use crate::config::ServerPoolConfig;
use crate::error::PoolError;
use crate::identity::{ClassKey, ProcessClassIdentity};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Slot id of a registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Slot reserved, process being launched
    Spawning,
    /// Running and available for dispatch
    Idle,
    /// Running and exclusively claimed by one request
    Busy,
    /// Chosen for termination; no longer dispatchable
    Terminating,
    /// OS process has exited but has not been reaped
    Zombie,
}

impl WorkerState {
    /// States counted against the class and global process limits
    pub const LIVE: [WorkerState; 3] = [WorkerState::Spawning, WorkerState::Idle, WorkerState::Busy];

    pub fn is_live(&self) -> bool {
        Self::LIVE.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Spawning => "spawning",
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Terminating => "terminating",
            WorkerState::Zombie => "zombie",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spawning" => Some(WorkerState::Spawning),
            "idle" => Some(WorkerState::Idle),
            "busy" => Some(WorkerState::Busy),
            "terminating" => Some(WorkerState::Terminating),
            "zombie" => Some(WorkerState::Zombie),
            _ => None,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one registry entry
#[derive(Debug, Clone, Serialize)]
pub struct WorkerEntry {
    pub id: WorkerId,
    pub class: ProcessClassIdentity,
    /// OS process id; 0 while the entry is still Spawning
    pub pid: u32,
    pub socket_path: PathBuf,
    pub state: WorkerState,
    /// Unix millis
    pub created_at: i64,
    /// Unix millis of the last claim or release
    pub last_active_at: i64,
    /// Unix millis at which the entry became Terminating
    pub retired_at: Option<i64>,
    pub requests_served: u64,
    /// Server process that launched (and can reap) the worker
    pub owner_pid: u32,
}

impl WorkerEntry {
    pub fn idle_for(&self, now: i64) -> Duration {
        clock::elapsed(now, self.last_active_at)
    }

    pub fn age(&self, now: i64) -> Duration {
        clock::elapsed(now, self.created_at)
    }
}

/// How a request on a worker ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Error,
    Timeout,
}

/// Process-count limits checked when reserving a spawn slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLimits {
    pub max_class: usize,
    pub max_total: usize,
}

impl SlotLimits {
    pub fn from_config(config: &ServerPoolConfig) -> Self {
        Self {
            max_class: config.max_class_process_count,
            max_total: config.max_process_count,
        }
    }
}

/// Retirement thresholds applied on release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetirePolicy {
    /// 0 disables the request cap
    pub max_requests: u64,
    pub lifetime: Duration,
}

impl RetirePolicy {
    pub fn from_config(config: &ServerPoolConfig) -> Self {
        Self {
            max_requests: config.max_requests_per_process,
            lifetime: config.proc_lifetime(),
        }
    }

    /// State a worker moves to after serving one more request
    pub fn next_state(&self, entry: &WorkerEntry, outcome: Outcome, now: i64) -> WorkerState {
        if outcome != Outcome::Success {
            return WorkerState::Terminating;
        }
        if self.max_requests > 0 && entry.requests_served + 1 >= self.max_requests {
            return WorkerState::Terminating;
        }
        if entry.age(now) >= self.lifetime {
            return WorkerState::Terminating;
        }
        WorkerState::Idle
    }
}

/// Result of a store-level slot reservation
#[derive(Debug)]
pub enum ReserveResult {
    Reserved(WorkerEntry),
    ClassFull,
    PoolFull,
}

/// Storage backend of the registry
///
/// Every method is a single atomic step with respect to other callers, including
/// callers in other OS processes for shared backends.
pub trait RegistryStore: Send + Sync {
    /// Claim the first Idle entry of `class` (Idle -> Busy)
    fn claim_idle(&self, class: &ClassKey, now: i64) -> Result<Option<WorkerEntry>, PoolError>;

    /// Insert a Spawning entry if the live counts allow it
    fn reserve(
        &self,
        class: &ProcessClassIdentity,
        limits: SlotLimits,
        owner_pid: u32,
        now: i64,
    ) -> Result<ReserveResult, PoolError>;

    /// Record the launched process (Spawning -> `to`)
    fn activate(
        &self,
        id: WorkerId,
        pid: u32,
        socket_path: &std::path::Path,
        to: WorkerState,
        now: i64,
    ) -> Result<Option<WorkerEntry>, PoolError>;

    /// Finish a request (Busy -> `to`), counting it and touching the entry
    fn finish(&self, id: WorkerId, to: WorkerState, now: i64) -> Result<Option<WorkerEntry>, PoolError>;

    /// Compare-and-set from any of `from` to `to`
    fn transition(
        &self,
        id: WorkerId,
        from: &[WorkerState],
        to: WorkerState,
        now: i64,
    ) -> Result<Option<WorkerEntry>, PoolError>;

    fn get(&self, id: WorkerId) -> Result<Option<WorkerEntry>, PoolError>;

    fn remove(&self, id: WorkerId) -> Result<Option<WorkerEntry>, PoolError>;

    fn snapshot(&self) -> Result<Vec<WorkerEntry>, PoolError>;

    /// Live entries of `class` and live entries overall
    fn live_counts(&self, class: &ClassKey) -> Result<(usize, usize), PoolError>;
}

/// A worker exclusively claimed by one request
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub class: ProcessClassIdentity,
    pub pid: u32,
    pub socket_path: PathBuf,
    pub requests_served: u64,
}

impl From<WorkerEntry> for WorkerHandle {
    fn from(entry: WorkerEntry) -> Self {
        Self {
            id: entry.id,
            class: entry.class,
            pid: entry.pid,
            socket_path: entry.socket_path,
            requests_served: entry.requests_served,
        }
    }
}

/// A reserved spawn slot; consume with `register_spawned` or `abandon`
#[derive(Debug)]
pub struct Reservation {
    id: WorkerId,
    class: ProcessClassIdentity,
}

impl Reservation {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn class(&self) -> &ProcessClassIdentity {
        &self.class
    }
}

/// Outcome of [`Registry::acquire`]
#[derive(Debug)]
pub enum Acquire {
    Worker(WorkerHandle),
    NeedsSpawn,
    PoolExhausted,
}

/// The shared process registry
pub struct Registry {
    store: Arc<dyn RegistryStore>,
    clock: Arc<dyn Clock>,
    owner_pid: u32,
}

impl Registry {
    pub fn new(store: Arc<dyn RegistryStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            owner_pid: std::process::id(),
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    /// Claim an idle worker of `class`, or report whether a spawn could be admitted
    pub fn acquire(
        &self,
        class: &ProcessClassIdentity,
        limits: SlotLimits,
    ) -> Result<Acquire, PoolError> {
        let key = class.key();
        if let Some(entry) = self.store.claim_idle(&key, self.now())? {
            debug!(class = %key, worker = %entry.id, pid = entry.pid, "Claimed idle worker");
            return Ok(Acquire::Worker(entry.into()));
        }

        let (class_count, total) = self.store.live_counts(&key)?;
        if class_count >= limits.max_class || total >= limits.max_total {
            return Ok(Acquire::PoolExhausted);
        }
        Ok(Acquire::NeedsSpawn)
    }

    /// Reserve a spawn slot, enforcing class and global limits atomically
    pub fn reserve(
        &self,
        class: &ProcessClassIdentity,
        limits: SlotLimits,
    ) -> Result<Reservation, PoolError> {
        match self.store.reserve(class, limits, self.owner_pid, self.now())? {
            ReserveResult::Reserved(entry) => Ok(Reservation {
                id: entry.id,
                class: class.clone(),
            }),
            ReserveResult::ClassFull | ReserveResult::PoolFull => Err(PoolError::PoolExhausted {
                class: class.key().to_string(),
            }),
        }
    }

    /// Record a launched worker; `state` is Busy for the requester or Idle for a prespawn
    pub fn register_spawned(
        &self,
        reservation: Reservation,
        pid: u32,
        socket_path: PathBuf,
        state: WorkerState,
    ) -> Result<WorkerHandle, PoolError> {
        let entry = self
            .store
            .activate(reservation.id, pid, &socket_path, state, self.now())?
            .ok_or_else(|| {
                PoolError::Store(format!("worker slot {} vanished while spawning", reservation.id))
            })?;
        info!(
            class = %reservation.class.key(),
            worker = %entry.id,
            pid,
            state = %state,
            "Worker registered"
        );
        Ok(entry.into())
    }

    /// Drop a reservation whose launch failed
    pub fn abandon(&self, reservation: Reservation) -> Result<(), PoolError> {
        self.store.remove(reservation.id)?;
        debug!(class = %reservation.class.key(), worker = %reservation.id, "Spawn slot abandoned");
        Ok(())
    }

    /// Return a claimed worker, retiring it when the outcome or policy says so
    pub fn release(
        &self,
        handle: &WorkerHandle,
        outcome: Outcome,
        policy: RetirePolicy,
    ) -> Result<WorkerState, PoolError> {
        let now = self.now();
        let Some(entry) = self.store.get(handle.id)? else {
            return Ok(WorkerState::Zombie);
        };
        if entry.state != WorkerState::Busy {
            // A scanner already took it over
            return Ok(entry.state);
        }

        let next = policy.next_state(&entry, outcome, now);
        match self.store.finish(handle.id, next, now)? {
            Some(updated) => {
                debug!(
                    worker = %handle.id,
                    ?outcome,
                    requests = updated.requests_served,
                    state = %updated.state,
                    "Worker released"
                );
                Ok(updated.state)
            }
            None => Ok(self
                .store
                .get(handle.id)?
                .map(|e| e.state)
                .unwrap_or(WorkerState::Zombie)),
        }
    }

    /// Move an entry to Terminating if it is currently in one of `from`
    pub fn mark_terminating(
        &self,
        id: WorkerId,
        from: &[WorkerState],
    ) -> Result<Option<WorkerEntry>, PoolError> {
        self.store
            .transition(id, from, WorkerState::Terminating, self.now())
    }

    /// Record that the OS process behind an entry has exited
    pub fn mark_zombie(&self, id: WorkerId) -> Result<Option<WorkerEntry>, PoolError> {
        self.store.transition(
            id,
            &[
                WorkerState::Spawning,
                WorkerState::Idle,
                WorkerState::Busy,
                WorkerState::Terminating,
            ],
            WorkerState::Zombie,
            self.now(),
        )
    }

    /// Remove a reaped entry, freeing its slot
    pub fn reap(&self, id: WorkerId) -> Result<Option<WorkerEntry>, PoolError> {
        self.store.remove(id)
    }

    pub fn get(&self, id: WorkerId) -> Result<Option<WorkerEntry>, PoolError> {
        self.store.get(id)
    }

    pub fn snapshot(&self) -> Result<Vec<WorkerEntry>, PoolError> {
        self.store.snapshot()
    }

    pub fn live_counts(&self, class: &ClassKey) -> Result<(usize, usize), PoolError> {
        self.store.live_counts(class)
    }
}
