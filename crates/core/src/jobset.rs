// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Jobset fair-share accounting.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Length of the rolling window over which step execution time counts
/// towards a jobset's share usage.
pub const SCHEDULING_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Identity of a jobset: `(project, jobset)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobsetName {
    pub project: String,
    pub jobset: String,
}

impl JobsetName {
    pub fn new(project: impl Into<String>, jobset: impl Into<String>) -> Self {
        Self { project: project.into(), jobset: jobset.into() }
    }
}

impl fmt::Display for JobsetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project, self.jobset)
    }
}

/// A named group of builds sharing a fair-share account.
///
/// `seconds` is the sum of step durations recorded inside the scheduling
/// window; `shares` the configured weight. The scheduler prefers steps
/// from the jobset with the lowest `seconds / shares`.
pub struct Jobset {
    pub name: JobsetName,
    seconds: AtomicU64,
    shares: AtomicU32,
    /// Step start time (epoch seconds) to accumulated duration, for
    /// pruning entries that age out of the window.
    steps: Mutex<BTreeMap<i64, u64>>,
}

impl Jobset {
    pub fn new(name: JobsetName, shares: u32) -> Self {
        Self {
            name,
            seconds: AtomicU64::new(0),
            shares: AtomicU32::new(shares.max(1)),
            steps: Mutex::new(BTreeMap::new()),
        }
    }

    /// Fair-share key: seconds of execution per share.
    pub fn share_used(&self) -> f64 {
        self.seconds.load(Ordering::Relaxed) as f64 / self.shares.load(Ordering::Relaxed) as f64
    }

    pub fn shares(&self) -> u32 {
        self.shares.load(Ordering::Relaxed)
    }

    pub fn seconds(&self) -> u64 {
        self.seconds.load(Ordering::Relaxed)
    }

    /// Update the configured share weight; zero is clamped to one.
    pub fn set_shares(&self, shares: u32) {
        self.shares.store(shares.max(1), Ordering::Relaxed);
    }

    /// Record `duration` seconds of step execution that started at
    /// `start` (epoch seconds).
    pub fn add_step(&self, start: i64, duration: u64) {
        let mut steps = self.steps.lock();
        *steps.entry(start).or_insert(0) += duration;
        self.seconds.fetch_add(duration, Ordering::Relaxed);
    }

    /// Drop entries that started before `horizon` (epoch seconds),
    /// subtracting their durations from `seconds`.
    pub fn prune_steps(&self, horizon: i64) {
        let mut steps = self.steps.lock();
        let keep = steps.split_off(&horizon);
        let dropped: u64 = steps.values().sum();
        *steps = keep;
        if dropped > 0 {
            self.seconds.fetch_sub(dropped, Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for Jobset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Jobset")
            .field("name", &self.name)
            .field("seconds", &self.seconds())
            .field("shares", &self.shares())
            .finish()
    }
}

#[cfg(test)]
#[path = "jobset_tests.rs"]
mod tests;
