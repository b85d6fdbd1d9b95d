// Dispatcher configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::application::constants::{
    DEFAULT_DISPATCHER_PATROL_PERIOD, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_WORKER_CAPACITY,
};

/// What happens to a delivery whose dispatch failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryGuarantee {
    /// Ack every delivery once the dispatcher has looked at it
    #[default]
    AtMostOnce,
    /// Reject with requeue when the message could not be handed to a worker
    AtLeastOnce,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// None = unlimited
    pub max_workers: Option<usize>,
    /// Cached messages tolerated before the feed is paused
    pub cache_limit: usize,
    pub patrol_period: Duration,
    pub shutdown_timeout: Duration,
    /// Concurrent messages per worker
    pub worker_capacity: usize,
    pub delivery_guarantee: DeliveryGuarantee,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            cache_limit: 0,
            patrol_period: DEFAULT_DISPATCHER_PATROL_PERIOD,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            worker_capacity: DEFAULT_WORKER_CAPACITY,
            delivery_guarantee: DeliveryGuarantee::default(),
        }
    }
}

impl DispatcherConfig {
    /// `-1` means unlimited; other non-positive values are ignored
    pub fn set_max_workers(&mut self, n: i64) -> bool {
        match n {
            -1 => self.max_workers = None,
            n if n > 0 => self.max_workers = Some(n as usize),
            _ => return false,
        }
        true
    }

    pub fn set_cache_limit(&mut self, n: i64) -> bool {
        if n < 0 {
            return false;
        }
        self.cache_limit = n as usize;
        true
    }

    pub fn set_patrol_period(&mut self, seconds: u64) -> bool {
        if seconds == 0 {
            return false;
        }
        self.patrol_period = Duration::from_secs(seconds);
        true
    }

    /// Zero is allowed and means "do not wait for workers at all"
    pub fn set_shutdown_timeout(&mut self, seconds: i64) -> bool {
        if seconds < 0 {
            return false;
        }
        self.shutdown_timeout = Duration::from_secs(seconds as u64);
        true
    }

    pub fn set_worker_capacity(&mut self, capacity: usize) -> bool {
        if capacity == 0 {
            return false;
        }
        self.worker_capacity = capacity;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.max_workers, None);
        assert_eq!(config.cache_limit, 0);
        assert_eq!(config.patrol_period, Duration::from_secs(300));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.worker_capacity, 1);
        assert_eq!(config.delivery_guarantee, DeliveryGuarantee::AtMostOnce);
    }

    #[test]
    fn test_invalid_values_are_ignored() {
        let mut config = DispatcherConfig::default();
        assert!(config.set_max_workers(4));
        assert!(!config.set_max_workers(0));
        assert!(!config.set_max_workers(-5));
        assert_eq!(config.max_workers, Some(4));
        assert!(config.set_max_workers(-1));
        assert_eq!(config.max_workers, None);

        assert!(!config.set_cache_limit(-1));
        assert!(config.set_cache_limit(0));
        assert!(!config.set_patrol_period(0));
        assert!(!config.set_shutdown_timeout(-1));
        assert!(config.set_shutdown_timeout(0));
        assert!(!config.set_worker_capacity(0));
        assert_eq!(config.patrol_period, Duration::from_secs(300));
        assert_eq!(config.shutdown_timeout, Duration::ZERO);
    }
}
