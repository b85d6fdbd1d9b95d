// Worker table: per-worker bookkeeping

use std::collections::HashMap;

use crate::domain::{Pid, WorkerId};
use crate::port::WorkerLink;

#[derive(Debug)]
pub struct WorkerEntry {
    pub pid: Pid,
    pub link: WorkerLink,
    /// Messages dispatched to this worker
    pub sent: u64,
    /// PROCESSED / CUSTOM_MESSAGE_PROCESSED replies received
    pub processed: u64,
}

#[derive(Debug, Default)]
pub struct WorkerTable {
    entries: HashMap<WorkerId, WorkerEntry>,
}

impl WorkerTable {
    pub fn insert(&mut self, worker_id: WorkerId, pid: Pid, link: WorkerLink) {
        self.entries.insert(
            worker_id,
            WorkerEntry {
                pid,
                link,
                sent: 0,
                processed: 0,
            },
        );
    }

    pub fn remove(&mut self, worker_id: &WorkerId) -> Option<WorkerEntry> {
        self.entries.remove(worker_id)
    }

    pub fn get(&self, worker_id: &WorkerId) -> Option<&WorkerEntry> {
        self.entries.get(worker_id)
    }

    pub fn get_mut(&mut self, worker_id: &WorkerId) -> Option<&mut WorkerEntry> {
        self.entries.get_mut(worker_id)
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
