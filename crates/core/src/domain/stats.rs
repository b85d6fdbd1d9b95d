// Dispatcher Statistics

use serde::Serialize;

/// Counters collected by the dispatcher since start (or the last clear)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherStats {
    /// Queue messages handed to a worker
    pub consumed: u64,
    /// PROCESSED replies received
    pub processed: u64,
    /// Longest queue message body seen, in bytes
    pub max_message_length: usize,
    pub peak_num_workers: usize,
    pub peak_num_cached: usize,
}

impl DispatcherStats {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn observe_message_length(&mut self, len: usize) {
        self.max_message_length = self.max_message_length.max(len);
    }

    pub fn observe_workers(&mut self, count: usize) {
        self.peak_num_workers = self.peak_num_workers.max(count);
    }

    pub fn observe_cached(&mut self, count: usize) {
        self.peak_num_cached = self.peak_num_cached.max(count);
    }
}
