// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide scheduler counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters and gauges maintained by the scheduler tasks.
/// Callers bump fields directly; `snapshot` produces the serializable
/// view used by the status dump and the metrics task.
#[derive(Debug, Default)]
pub struct Counters {
    pub nr_builds_read: AtomicU64,
    pub nr_builds_done: AtomicU64,
    pub nr_steps_started: AtomicU64,
    pub nr_steps_done: AtomicU64,
    pub nr_steps_failed: AtomicU64,
    /// Gauges: currently copying inputs / building on a remote.
    pub nr_steps_copying_to: AtomicU64,
    pub nr_steps_building: AtomicU64,
    pub nr_retries: AtomicU64,
    pub max_nr_retries: AtomicU64,
    pub nr_unsupported_steps: AtomicU64,
    pub nr_dispatcher_wakeups: AtomicU64,
    pub nr_queue_wakeups: AtomicU64,
    /// Total time spent inside dispatcher passes, milliseconds.
    pub dispatch_time_ms: AtomicU64,
    /// Total remote execution time of finished steps, seconds.
    pub total_step_time: AtomicU64,
}

impl Counters {
    pub fn incr(field: &AtomicU64) {
        field.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(field: &AtomicU64, value: u64) {
        field.fetch_add(value, Ordering::Relaxed);
    }

    pub fn decr(field: &AtomicU64) {
        field.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn raise(field: &AtomicU64, value: u64) {
        field.fetch_max(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let get = |field: &AtomicU64| field.load(Ordering::Relaxed);
        CountersSnapshot {
            nr_builds_read: get(&self.nr_builds_read),
            nr_builds_done: get(&self.nr_builds_done),
            nr_steps_started: get(&self.nr_steps_started),
            nr_steps_done: get(&self.nr_steps_done),
            nr_steps_failed: get(&self.nr_steps_failed),
            nr_steps_copying_to: get(&self.nr_steps_copying_to),
            nr_steps_building: get(&self.nr_steps_building),
            nr_retries: get(&self.nr_retries),
            max_nr_retries: get(&self.max_nr_retries),
            nr_unsupported_steps: get(&self.nr_unsupported_steps),
            nr_dispatcher_wakeups: get(&self.nr_dispatcher_wakeups),
            nr_queue_wakeups: get(&self.nr_queue_wakeups),
            dispatch_time_ms: get(&self.dispatch_time_ms),
            total_step_time: get(&self.total_step_time),
        }
    }
}

/// RAII increment of a gauge field; decrements on drop, covering every
/// exit path of the guarded section.
pub struct GaugeGuard<'a> {
    field: &'a AtomicU64,
}

impl<'a> GaugeGuard<'a> {
    pub fn new(field: &'a AtomicU64) -> Self {
        field.fetch_add(1, Ordering::Relaxed);
        Self { field }
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.field.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of [`Counters`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    pub nr_builds_read: u64,
    pub nr_builds_done: u64,
    pub nr_steps_started: u64,
    pub nr_steps_done: u64,
    pub nr_steps_failed: u64,
    pub nr_steps_copying_to: u64,
    pub nr_steps_building: u64,
    pub nr_retries: u64,
    pub max_nr_retries: u64,
    pub nr_unsupported_steps: u64,
    pub nr_dispatcher_wakeups: u64,
    pub nr_queue_wakeups: u64,
    pub dispatch_time_ms: u64,
    pub total_step_time: u64,
}

#[cfg(test)]
#[path = "counters_tests.rs"]
mod tests;
