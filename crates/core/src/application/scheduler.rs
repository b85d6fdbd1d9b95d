// Worker Scheduler
//
// Workers sit in buckets indexed by free capacity (level 0..=capacity).
// Allocation always takes the most recently placed worker from the
// highest non-empty bucket, so load concentrates on few workers and the
// rest go idle (and eventually idle-shutdown).

use crate::domain::WorkerId;
use std::collections::{BTreeMap, HashMap};

use super::constants::DEFAULT_WORKER_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Working,
    Retired,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    level: usize,
    seq: u64,
    state: SlotState,
}

/// Capacity-level scheduler over worker ids
///
/// Invariants:
/// - each known worker is in exactly one bucket
/// - retired workers are always at level 0 and never allocated
/// - `busy` counts working (non-retired) workers at level 0
#[derive(Debug)]
pub struct WorkerScheduler {
    // Bucket per level; keys are insertion sequence numbers
    levels: Vec<BTreeMap<u64, WorkerId>>,
    slots: HashMap<WorkerId, Slot>,
    next_seq: u64,
    working: usize,
    busy: usize,
    retired: usize,
}

impl Default for WorkerScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_CAPACITY)
    }
}

impl WorkerScheduler {
    /// Create a scheduler where every worker accepts `capacity` concurrent messages
    ///
    /// A capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            levels: vec![BTreeMap::new(); capacity.max(1) + 1],
            slots: HashMap::new(),
            next_seq: 0,
            working: 0,
            busy: 0,
            retired: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.levels.len() - 1
    }

    /// Register a worker at full capacity (or one below if it is being allocated right away)
    ///
    /// Adding a known worker is a no-op.
    pub fn add(&mut self, worker_id: &WorkerId, allocated: bool) {
        if self.slots.contains_key(worker_id) {
            return;
        }
        let top = self.capacity();
        let level = if allocated { top - 1 } else { top };
        self.insert(worker_id.clone(), level, SlotState::Working);
        self.working += 1;
        if level == 0 {
            self.busy += 1;
        }
    }

    /// Forget a worker entirely
    pub fn remove(&mut self, worker_id: &WorkerId) {
        let Some(slot) = self.slots.remove(worker_id) else {
            return;
        };
        self.levels[slot.level].remove(&slot.seq);
        match slot.state {
            SlotState::Retired => self.retired -= 1,
            SlotState::Working => {
                self.working -= 1;
                if slot.level == 0 {
                    self.busy -= 1;
                }
            }
        }
    }

    /// Mark a worker as no longer schedulable
    pub fn retire(&mut self, worker_id: &WorkerId) {
        let Some(slot) = self.slots.get(worker_id).copied() else {
            return;
        };
        if slot.state == SlotState::Retired {
            return;
        }
        self.relocate(worker_id, slot, 0, SlotState::Retired);
        self.retired += 1;
        self.working -= 1;
        if slot.level == 0 {
            self.busy -= 1;
        }
    }

    /// Take one unit of capacity from the best candidate, if any
    pub fn allocate(&mut self) -> Option<WorkerId> {
        for level in (1..self.levels.len()).rev() {
            let Some((_, worker_id)) = self.levels[level].iter().next_back() else {
                continue;
            };
            let worker_id = worker_id.clone();
            let Some(slot) = self.slots.get(&worker_id).copied() else {
                continue;
            };
            debug_assert_eq!(slot.state, SlotState::Working);

            self.relocate(&worker_id, slot, level - 1, SlotState::Working);
            if level == 1 {
                self.busy += 1;
            }
            return Some(worker_id);
        }
        None
    }

    /// Give one unit of capacity back; no-op for retired or unknown workers
    pub fn release(&mut self, worker_id: &WorkerId) {
        let Some(slot) = self.slots.get(worker_id).copied() else {
            return;
        };
        if slot.state == SlotState::Retired {
            return;
        }
        let level = (slot.level + 1).min(self.capacity());
        if level == slot.level {
            return;
        }
        self.relocate(worker_id, slot, level, SlotState::Working);
        if slot.level == 0 {
            self.busy -= 1;
        }
    }

    /// Change per-worker capacity, shifting every working worker by the difference
    ///
    /// Zero or an unchanged capacity is a no-op. Retired workers stay at level 0.
    pub fn change_levels(&mut self, capacity: usize) {
        if capacity == 0 || capacity == self.capacity() {
            return;
        }
        let old_capacity = self.capacity();
        let old_levels = std::mem::replace(&mut self.levels, vec![BTreeMap::new(); capacity + 1]);

        for bucket in old_levels {
            for worker_id in bucket.into_values() {
                let Some(slot) = self.slots.get(&worker_id).copied() else {
                    continue;
                };
                match slot.state {
                    SlotState::Retired => self.insert(worker_id, 0, SlotState::Retired),
                    SlotState::Working => {
                        let level = if capacity > old_capacity {
                            (slot.level + (capacity - old_capacity)).min(capacity)
                        } else {
                            slot.level.saturating_sub(old_capacity - capacity)
                        };
                        if slot.level > 0 && level == 0 {
                            self.busy += 1;
                        } else if slot.level == 0 && level > 0 {
                            self.busy -= 1;
                        }
                        self.insert(worker_id, level, SlotState::Working);
                    }
                }
            }
        }
    }

    pub fn contains(&self, worker_id: &WorkerId) -> bool {
        self.slots.contains_key(worker_id)
    }

    /// Remaining capacity of a worker
    pub fn level_of(&self, worker_id: &WorkerId) -> Option<usize> {
        self.slots.get(worker_id).map(|slot| slot.level)
    }

    pub fn is_retired(&self, worker_id: &WorkerId) -> bool {
        self.slots
            .get(worker_id)
            .is_some_and(|slot| slot.state == SlotState::Retired)
    }

    pub fn count_working(&self) -> usize {
        self.working
    }

    pub fn count_busy(&self) -> usize {
        self.busy
    }

    pub fn count_retired(&self) -> usize {
        self.retired
    }

    /// Working workers with at least one free unit of capacity
    pub fn count_schedulable(&self) -> usize {
        self.working - self.busy
    }

    fn relocate(&mut self, worker_id: &WorkerId, slot: Slot, level: usize, state: SlotState) {
        self.levels[slot.level].remove(&slot.seq);
        self.insert(worker_id.clone(), level, state);
    }

    fn insert(&mut self, worker_id: WorkerId, level: usize, state: SlotState) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.levels[level].insert(seq, worker_id.clone());
        self.slots.insert(worker_id, Slot { level, seq, state });
    }
}
