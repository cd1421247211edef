//! In-process registry store
//!
//! Each slot's state is an `AtomicU8`, so claiming an idle worker is one
//! `compare_exchange`. The metadata next to it sits behind a short-lived mutex and
//! is never held across I/O.

use crate::error::PoolError;
use crate::identity::{ClassKey, ProcessClassIdentity};
use crate::registry::{RegistryStore, ReserveResult, SlotLimits, WorkerEntry, WorkerId, WorkerState};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

fn encode(state: WorkerState) -> u8 {
    match state {
        WorkerState::Spawning => 0,
        WorkerState::Idle => 1,
        WorkerState::Busy => 2,
        WorkerState::Terminating => 3,
        WorkerState::Zombie => 4,
    }
}

fn decode(value: u8) -> WorkerState {
    match value {
        0 => WorkerState::Spawning,
        1 => WorkerState::Idle,
        2 => WorkerState::Busy,
        3 => WorkerState::Terminating,
        _ => WorkerState::Zombie,
    }
}

#[derive(Debug)]
struct SlotData {
    pid: u32,
    socket_path: PathBuf,
    created_at: i64,
    last_active_at: i64,
    retired_at: Option<i64>,
    requests_served: u64,
    owner_pid: u32,
}

#[derive(Debug)]
struct Slot {
    id: WorkerId,
    class: ProcessClassIdentity,
    state: AtomicU8,
    data: Mutex<SlotData>,
}

impl Slot {
    fn state(&self) -> WorkerState {
        decode(self.state.load(Ordering::Acquire))
    }

    fn cas(&self, from: WorkerState, to: WorkerState) -> bool {
        self.state
            .compare_exchange(encode(from), encode(to), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `to` from whichever of `from` the slot is in
    fn cas_any(&self, from: &[WorkerState], to: WorkerState) -> bool {
        loop {
            let current = self.state();
            if !from.contains(&current) {
                return false;
            }
            if self.cas(current, to) {
                return true;
            }
        }
    }

    fn entry(&self) -> WorkerEntry {
        let data = self.data.lock();
        WorkerEntry {
            id: self.id,
            class: self.class.clone(),
            pid: data.pid,
            socket_path: data.socket_path.clone(),
            state: self.state(),
            created_at: data.created_at,
            last_active_at: data.last_active_at,
            retired_at: data.retired_at,
            requests_served: data.requests_served,
            owner_pid: data.owner_pid,
        }
    }
}

/// Registry store private to one server process
#[derive(Debug)]
pub struct MemoryStore {
    slots: DashMap<WorkerId, Arc<Slot>>,
    next_id: AtomicU64,
    /// Serializes count-then-insert in `reserve`
    reserve_lock: Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next_id: AtomicU64::new(1),
            reserve_lock: Mutex::new(()),
        }
    }

    fn slot(&self, id: WorkerId) -> Option<Arc<Slot>> {
        self.slots.get(&id).map(|s| Arc::clone(s.value()))
    }

    fn count_live(&self, class: &ClassKey) -> (usize, usize) {
        let mut in_class = 0;
        let mut total = 0;
        for slot in self.slots.iter() {
            if slot.state().is_live() {
                total += 1;
                if slot.class.key() == *class {
                    in_class += 1;
                }
            }
        }
        (in_class, total)
    }
}

impl RegistryStore for MemoryStore {
    fn claim_idle(&self, class: &ClassKey, now: i64) -> Result<Option<WorkerEntry>, PoolError> {
        let mut candidates: Vec<Arc<Slot>> = self
            .slots
            .iter()
            .filter(|s| s.class.key() == *class && s.state() == WorkerState::Idle)
            .map(|s| Arc::clone(s.value()))
            .collect();
        candidates.sort_by_key(|s| s.id);

        for slot in candidates {
            {
                // Readers take the same lock, so Busy is never seen with a stale timestamp
                let mut data = slot.data.lock();
                if !slot.cas(WorkerState::Idle, WorkerState::Busy) {
                    continue;
                }
                data.last_active_at = now;
            }
            return Ok(Some(slot.entry()));
        }
        Ok(None)
    }

    fn reserve(
        &self,
        class: &ProcessClassIdentity,
        limits: SlotLimits,
        owner_pid: u32,
        now: i64,
    ) -> Result<ReserveResult, PoolError> {
        let _guard = self.reserve_lock.lock();

        let (in_class, total) = self.count_live(&class.key());
        if in_class >= limits.max_class {
            return Ok(ReserveResult::ClassFull);
        }
        if total >= limits.max_total {
            return Ok(ReserveResult::PoolFull);
        }

        let id = WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(Slot {
            id,
            class: class.clone(),
            state: AtomicU8::new(encode(WorkerState::Spawning)),
            data: Mutex::new(SlotData {
                pid: 0,
                socket_path: PathBuf::new(),
                created_at: now,
                last_active_at: now,
                retired_at: None,
                requests_served: 0,
                owner_pid,
            }),
        });
        let entry = slot.entry();
        self.slots.insert(id, slot);
        Ok(ReserveResult::Reserved(entry))
    }

    fn activate(
        &self,
        id: WorkerId,
        pid: u32,
        socket_path: &Path,
        to: WorkerState,
        now: i64,
    ) -> Result<Option<WorkerEntry>, PoolError> {
        let Some(slot) = self.slot(id) else {
            return Ok(None);
        };
        {
            // Metadata first so a concurrent claimer never sees an Idle slot without a pid
            let mut data = slot.data.lock();
            data.pid = pid;
            data.socket_path = socket_path.to_path_buf();
            data.last_active_at = now;
        }
        if !slot.cas(WorkerState::Spawning, to) {
            return Ok(None);
        }
        Ok(Some(slot.entry()))
    }

    fn finish(&self, id: WorkerId, to: WorkerState, now: i64) -> Result<Option<WorkerEntry>, PoolError> {
        let Some(slot) = self.slot(id) else {
            return Ok(None);
        };
        {
            let mut data = slot.data.lock();
            if !slot.cas(WorkerState::Busy, to) {
                return Ok(None);
            }
            data.requests_served += 1;
            data.last_active_at = now;
            if to == WorkerState::Terminating {
                data.retired_at = Some(now);
            }
        }
        Ok(Some(slot.entry()))
    }

    fn transition(
        &self,
        id: WorkerId,
        from: &[WorkerState],
        to: WorkerState,
        now: i64,
    ) -> Result<Option<WorkerEntry>, PoolError> {
        let Some(slot) = self.slot(id) else {
            return Ok(None);
        };
        {
            let mut data = slot.data.lock();
            if !slot.cas_any(from, to) {
                return Ok(None);
            }
            if to == WorkerState::Terminating && data.retired_at.is_none() {
                data.retired_at = Some(now);
            }
        }
        Ok(Some(slot.entry()))
    }

    fn get(&self, id: WorkerId) -> Result<Option<WorkerEntry>, PoolError> {
        Ok(self.slot(id).map(|s| s.entry()))
    }

    fn remove(&self, id: WorkerId) -> Result<Option<WorkerEntry>, PoolError> {
        Ok(self.slots.remove(&id).map(|(_, s)| s.entry()))
    }

    fn snapshot(&self) -> Result<Vec<WorkerEntry>, PoolError> {
        let slots: Vec<Arc<Slot>> = self.slots.iter().map(|s| Arc::clone(s.value())).collect();
        let mut entries: Vec<WorkerEntry> = slots.iter().map(|s| s.entry()).collect();
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }

    fn live_counts(&self, class: &ClassKey) -> Result<(usize, usize), PoolError> {
        Ok(self.count_live(class))
    }
}
