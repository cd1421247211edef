//! Spawn and termination scoring
//!
//! Spawn pressure is per class: every acquire miss adds `spawn_score`, and the
//! total decays by `time_score` per elapsed second. Crossing `spawnscore_uplimit`
//! asks for one worker ahead of demand and pays the uplimit back.
//!
//! Termination pressure is per entry: `time_score` per idle second, minus the
//! class's current spawn pressure. It orders eviction only; every Idle entry past
//! `idle_timeout` goes once the class floor allows it.

use crate::clock::Clock;
use crate::config::ServerPoolConfig;
use crate::identity::ClassKey;
use crate::registry::{WorkerEntry, WorkerState};
use dashmap::DashMap;
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
struct ClassScore {
    score: u64,
    /// Unix millis up to which decay has been applied
    decayed_to: i64,
}

impl ClassScore {
    fn decay(&mut self, time_score: u32, now: i64) {
        if self.decayed_to == 0 || now <= self.decayed_to {
            self.decayed_to = self.decayed_to.max(now);
            return;
        }
        let secs = (now - self.decayed_to) / 1000;
        if secs > 0 {
            self.score = self
                .score
                .saturating_sub(time_score as u64 * secs as u64);
            self.decayed_to += secs * 1000;
        }
    }
}

/// Scoring engine state shared by the pool and the scanners
pub struct Scoring {
    classes: DashMap<ClassKey, ClassScore>,
    clock: Arc<dyn Clock>,
}

impl Scoring {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            classes: DashMap::new(),
            clock,
        }
    }

    /// Record an acquire that found no idle worker; returns the new spawn score
    pub fn record_miss(&self, class: &ClassKey, config: &ServerPoolConfig) -> u64 {
        let now = self.clock.now_millis();
        let mut entry = self.classes.entry(*class).or_default();
        entry.decay(config.time_score, now);
        entry.score = entry.score.saturating_add(config.spawn_score as u64);
        entry.score
    }

    /// Current (decayed) spawn score of a class
    pub fn spawn_score(&self, class: &ClassKey, config: &ServerPoolConfig) -> u64 {
        let now = self.clock.now_millis();
        match self.classes.get_mut(class) {
            Some(mut entry) => {
                entry.decay(config.time_score, now);
                entry.score
            }
            None => 0,
        }
    }

    /// Whether demand warrants a spawn ahead of need
    ///
    /// Consumes `spawnscore_uplimit` from the score when it fires, so one crossing
    /// yields one proactive spawn.
    pub fn should_prespawn(&self, class: &ClassKey, config: &ServerPoolConfig) -> bool {
        let now = self.clock.now_millis();
        let Some(mut entry) = self.classes.get_mut(class) else {
            return false;
        };
        entry.decay(config.time_score, now);

        let uplimit = config.spawnscore_uplimit as u64;
        if uplimit == 0 || entry.score < uplimit {
            return false;
        }
        entry.score -= uplimit;
        debug!(class = %class, remaining = entry.score, "Spawn score crossed uplimit");
        true
    }

    /// Termination score of one entry
    pub fn termination_score(&self, entry: &WorkerEntry, config: &ServerPoolConfig, now: i64) -> i64 {
        let idle_secs = entry.idle_for(now).as_secs() as i64;
        let pressure = self.spawn_score(&entry.class.key(), config) as i64;
        (config.time_score as i64).saturating_mul(idle_secs) - pressure
    }

    /// Entries ordered most-evictable first
    ///
    /// Entries scoring above `termination_score` lead, fewest requests served first.
    /// The rest follow by highest score, then fewest requests served.
    pub fn rank_for_termination(
        &self,
        entries: Vec<WorkerEntry>,
        config: &ServerPoolConfig,
        now: i64,
    ) -> Vec<(WorkerEntry, i64)> {
        let mut scored: Vec<(WorkerEntry, i64)> = entries
            .into_iter()
            .map(|e| {
                let score = self.termination_score(&e, config, now);
                (e, score)
            })
            .collect();
        let threshold = config.termination_score as i64;
        scored.sort_by_key(|(e, score)| {
            let above = *score > threshold;
            let lead = if above { e.requests_served } else { 0 };
            (!above, lead, Reverse(*score), e.requests_served, e.id)
        });
        scored
    }

    /// Idle entries of one class to evict this pass
    ///
    /// `entries` is every entry of the class. Every Idle entry past `idle_timeout`
    /// qualifies; when the `min_class_process_count` floor leaves room for fewer,
    /// the ranking decides which go.
    pub fn select_evictions(
        &self,
        entries: &[WorkerEntry],
        config: &ServerPoolConfig,
        now: i64,
    ) -> Vec<WorkerEntry> {
        let live = entries.iter().filter(|e| e.state.is_live()).count();
        let budget = live.saturating_sub(config.min_class_process_count);
        if budget == 0 {
            return Vec::new();
        }

        let idle_timeout = config.idle_timeout();
        let candidates: Vec<WorkerEntry> = entries
            .iter()
            .filter(|e| e.state == WorkerState::Idle && e.idle_for(now) > idle_timeout)
            .cloned()
            .collect();

        self.rank_for_termination(candidates, config, now)
            .into_iter()
            .take(budget)
            .map(|(e, _)| e)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::ProcessClassIdentity;
    use crate::registry::WorkerId;
    use std::path::PathBuf;
    use std::time::Duration;

    fn setup() -> (Scoring, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (Scoring::new(clock.clone()), clock)
    }

    fn key() -> ClassKey {
        ProcessClassIdentity::new("/srv/a", 1, 1, 0).key()
    }

    fn entry(id: u64, state: WorkerState, last_active_at: i64, served: u64) -> WorkerEntry {
        WorkerEntry {
            id: WorkerId(id),
            class: ProcessClassIdentity::new("/srv/a", 1, 1, 0),
            pid: 100 + id as u32,
            socket_path: PathBuf::new(),
            state,
            created_at: 0,
            last_active_at,
            retired_at: None,
            requests_served: served,
            owner_pid: 1,
        }
    }

    #[test]
    fn test_misses_accumulate_and_decay() {
        let (scoring, clock) = setup();
        let config = ServerPoolConfig {
            spawn_score: 3,
            time_score: 1,
            ..Default::default()
        };

        assert_eq!(scoring.spawn_score(&key(), &config), 0);
        scoring.record_miss(&key(), &config);
        assert_eq!(scoring.record_miss(&key(), &config), 6);

        clock.advance(Duration::from_secs(4));
        assert_eq!(scoring.spawn_score(&key(), &config), 2);
        clock.advance(Duration::from_secs(10));
        assert_eq!(scoring.spawn_score(&key(), &config), 0);
    }

    #[test]
    fn test_partial_seconds_are_not_lost() {
        let (scoring, clock) = setup();
        let config = ServerPoolConfig {
            spawn_score: 10,
            time_score: 1,
            ..Default::default()
        };
        scoring.record_miss(&key(), &config);
        for _ in 0..4 {
            clock.advance(Duration::from_millis(500));
            scoring.spawn_score(&key(), &config);
        }
        assert_eq!(scoring.spawn_score(&key(), &config), 8);
    }

    #[test]
    fn test_prespawn_fires_once_per_crossing() {
        let (scoring, _) = setup();
        let config = ServerPoolConfig {
            spawn_score: 1,
            spawnscore_uplimit: 3,
            ..Default::default()
        };

        assert!(!scoring.should_prespawn(&key(), &config));
        for _ in 0..3 {
            scoring.record_miss(&key(), &config);
        }
        assert!(scoring.should_prespawn(&key(), &config));
        assert!(!scoring.should_prespawn(&key(), &config));
        assert_eq!(scoring.spawn_score(&key(), &config), 0);
    }

    #[test]
    fn test_termination_score_discounted_by_demand() {
        let (scoring, clock) = setup();
        let config = ServerPoolConfig {
            spawn_score: 5,
            time_score: 2,
            ..Default::default()
        };
        let now = clock.now_millis();
        let e = entry(1, WorkerState::Idle, now - 30_000, 0);
        assert_eq!(scoring.termination_score(&e, &config, now), 60);

        scoring.record_miss(&key(), &config);
        assert_eq!(scoring.termination_score(&e, &config, now), 55);
    }

    #[test]
    fn test_rank_highest_score_then_least_used() {
        let (scoring, clock) = setup();
        let config = ServerPoolConfig {
            termination_score: 20,
            ..Default::default()
        };
        let now = clock.now_millis();
        let ranked = scoring.rank_for_termination(
            vec![
                entry(1, WorkerState::Idle, now - 10_000, 5),
                entry(2, WorkerState::Idle, now - 50_000, 9),
                entry(3, WorkerState::Idle, now - 10_000, 1),
            ],
            &config,
            now,
        );
        let ids: Vec<u64> = ranked.iter().map(|(e, _)| e.id.0).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_rank_above_threshold_least_used_first() {
        let (scoring, clock) = setup();
        let config = ServerPoolConfig {
            termination_score: 20,
            ..Default::default()
        };
        let now = clock.now_millis();
        let ranked = scoring.rank_for_termination(
            vec![
                entry(1, WorkerState::Idle, now - 90_000, 40),
                entry(2, WorkerState::Idle, now - 30_000, 2),
                entry(3, WorkerState::Idle, now - 15_000, 0),
            ],
            &config,
            now,
        );
        let ids: Vec<u64> = ranked.iter().map(|(e, _)| e.id.0).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn test_select_evictions_respects_timeout_and_floor() {
        let (scoring, clock) = setup();
        let config = ServerPoolConfig {
            idle_timeout_secs: 60,
            min_class_process_count: 1,
            ..Default::default()
        };
        let now = clock.now_millis();
        let entries = vec![
            entry(1, WorkerState::Idle, now - 61_000, 0),
            entry(2, WorkerState::Idle, now - 120_000, 0),
            entry(3, WorkerState::Idle, now - 10_000, 0),
            entry(4, WorkerState::Terminating, now - 500_000, 0),
        ];

        let evicted = scoring.select_evictions(&entries, &config, now);
        let ids: Vec<u64> = evicted.iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![2, 1]);

        // Floor of 3 live leaves room for no eviction
        let config = ServerPoolConfig {
            min_class_process_count: 3,
            ..config
        };
        assert!(scoring.select_evictions(&entries, &config, now).is_empty());
    }

    #[test]
    fn test_select_evictions_ignores_score_past_timeout() {
        let (scoring, clock) = setup();
        let config = ServerPoolConfig {
            idle_timeout_secs: 10,
            min_class_process_count: 0,
            termination_score: 60,
            time_score: 1,
            ..Default::default()
        };
        let now = clock.now_millis();
        let entries = vec![entry(1, WorkerState::Idle, now - 11_000, 0)];
        assert_eq!(scoring.select_evictions(&entries, &config, now).len(), 1);

        // No idle weighting at all
        let config = ServerPoolConfig {
            time_score: 0,
            ..config
        };
        let entries = vec![entry(1, WorkerState::Idle, now - 1_000_000, 0)];
        assert_eq!(scoring.select_evictions(&entries, &config, now).len(), 1);

        // Demand does not hold back a worker past its timeout
        let busy_class = ServerPoolConfig {
            spawn_score: 500,
            ..config.clone()
        };
        scoring.record_miss(&key(), &busy_class);
        assert_eq!(scoring.select_evictions(&entries, &config, now).len(), 1);
    }
}
