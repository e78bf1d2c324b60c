// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Build entity: an externally-created unit of work.

use crate::jobset::Jobset;
use crate::path::StorePath;
use crate::step::Step;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// Numeric build identifier, assigned by the database.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BuildId(pub u64);

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BuildId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// The immutable fields of a build as read from the queue.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub id: BuildId,
    pub drv_path: StorePath,
    /// Output name to destination store path.
    pub outputs: BTreeMap<String, StorePath>,
    pub project: String,
    pub jobset: String,
    pub job: String,
    /// Submission time, epoch seconds.
    pub timestamp: i64,
    /// Ordering within a project.
    pub local_priority: i32,
    /// Cross-project bump; mutable via `builds_bumped`.
    pub global_priority: i32,
    /// Maximum build silence before the step times out, seconds.
    pub max_silent_time: i32,
    /// Wall-clock limit for the step, seconds.
    pub build_timeout: i32,
}

/// An externally-created build: one top-level derivation to realize,
/// attributed to a jobset for fair-share accounting.
pub struct Build {
    pub id: BuildId,
    pub drv_path: StorePath,
    pub outputs: BTreeMap<String, StorePath>,
    pub project: String,
    pub jobset_name: String,
    pub job: String,
    pub jobset: Arc<Jobset>,
    pub timestamp: i64,
    pub local_priority: i32,
    global_priority: AtomicI32,
    pub max_silent_time: i32,
    pub build_timeout: i32,
    /// The root of this build's step graph; `None` once the build is
    /// finished or when all outputs were already valid at expansion.
    pub toplevel: Mutex<Option<Arc<Step>>>,
    /// Latch for the one `build_started` notification.
    started: AtomicBool,
    /// Latch guarding idempotent completion (transitions false→true once).
    finished_in_db: AtomicBool,
}

impl Build {
    pub fn new(spec: BuildSpec, jobset: Arc<Jobset>) -> Self {
        Self {
            id: spec.id,
            drv_path: spec.drv_path,
            outputs: spec.outputs,
            project: spec.project,
            jobset_name: spec.jobset,
            job: spec.job,
            jobset,
            timestamp: spec.timestamp,
            local_priority: spec.local_priority,
            global_priority: AtomicI32::new(spec.global_priority),
            max_silent_time: spec.max_silent_time,
            build_timeout: spec.build_timeout,
            toplevel: Mutex::new(None),
            started: AtomicBool::new(false),
            finished_in_db: AtomicBool::new(false),
        }
    }

    /// Textual identity, `project:jobset:job`.
    pub fn full_job_name(&self) -> String {
        format!("{}:{}:{}", self.project, self.jobset_name, self.job)
    }

    pub fn global_priority(&self) -> i32 {
        self.global_priority.load(Ordering::Relaxed)
    }

    /// Raise the global priority (monotone; lower values are ignored).
    pub fn bump_global_priority(&self, priority: i32) -> bool {
        self.global_priority.fetch_max(priority, Ordering::Relaxed) < priority
    }

    /// Claim the one `build_started` notification. Returns true exactly
    /// once, when the build's first step starts executing.
    pub fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    pub fn finished_in_db(&self) -> bool {
        self.finished_in_db.load(Ordering::Acquire)
    }

    /// Claim the completion latch. Returns true exactly once; callers
    /// must only write the final database row when this returns true.
    pub fn mark_finished_in_db(&self) -> bool {
        !self.finished_in_db.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for Build {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Build")
            .field("id", &self.id)
            .field("job", &self.full_job_name())
            .field("drv_path", &self.drv_path)
            .field("global_priority", &self.global_priority())
            .field("finished_in_db", &self.finished_in_db())
            .finish()
    }
}

#[cfg(test)]
#[path = "build_tests.rs"]
mod tests;
