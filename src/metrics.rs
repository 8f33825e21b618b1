//! Metrics sinks.
//!
//! The connection cleaner reports into a [`MetricsSink`] handed to it at construction; nothing
//! is registered in global state.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};

/// Timing histogram recorded for every cleaner run.
pub const CLEANER_TIME: &str = "connection-cleaner-time";

/// Counter incremented for every failed cleaner run.
pub const CLEANER_FAILURE: &str = "connection-cleaner-failure";

/// Receiver of named timings and counters.
pub trait MetricsSink: Send + Sync {
    fn record_timing(&self, name: &str, elapsed: Duration);

    fn increment_counter(&self, name: &str);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_timing(&self, _: &str, _: Duration) {}

    fn increment_counter(&self, _: &str) {}
}

/// Keeps every recorded value in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    timings: Mutex<HashMap<String, Vec<Duration>>>,
    counters: Mutex<HashMap<String, u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timings recorded under `name`, oldest first.
    pub fn timings(&self, name: &str) -> Vec<Duration> {
        self.timings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_timing(&self, name: &str, elapsed: Duration) {
        self.timings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_owned())
            .or_default()
            .push(elapsed);
    }

    fn increment_counter(&self, name: &str) {
        *self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_owned())
            .or_default() += 1;
    }
}
