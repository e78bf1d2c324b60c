// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Step entity: the scheduling atom, one derivation to realize.
//!
//! Forward edges (`deps`) own their targets; reverse edges (`rdeps`) and
//! build references are weak. A step stays alive exactly as long as a
//! build or a running worker holds it.

use crate::build::{Build, BuildId};
use crate::derivation::Derivation;
use crate::jobset::Jobset;
use crate::path::StorePath;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// One derivation to realize on some machine.
pub struct Step {
    pub drv_path: StorePath,
    pub drv: Derivation,
    /// Precomputed capability-matching key: platform ⊕ required features.
    pub system_type: String,
    finished: AtomicBool,
    pub state: Mutex<StepState>,
}

/// Mutable scheduling state of a step.
pub struct StepState {
    /// Steps this step is waiting on (owning).
    pub deps: Vec<Arc<Step>>,
    /// Steps waiting on this step (non-owning back edges).
    pub rdeps: Vec<Weak<Step>>,
    /// Builds directly rooted at this step (non-owning).
    pub builds: Vec<Weak<Build>>,
    /// Jobsets contributing to this step's fair-share key.
    pub jobsets: Vec<Arc<Jobset>>,
    /// Failed attempts so far.
    pub tries: u32,
    /// Earliest next attempt, set by the retry policy.
    pub after: Option<Instant>,
    /// Aggregates over every build that transitively needs this step.
    /// The priorities only ever increase, the build id only decreases.
    pub highest_global_priority: i32,
    pub highest_local_priority: i32,
    pub lowest_build_id: Option<BuildId>,
    /// When the step entered the runnable set.
    pub runnable_since: Option<Instant>,
    /// Last time a capable machine existed, for aging out unsupported steps.
    pub last_supported: Instant,
}

impl Step {
    pub fn new(drv_path: StorePath, drv: Derivation, this_system: &str, now: Instant) -> Self {
        let system_type = drv.system_type(this_system);
        Self {
            drv_path,
            drv,
            system_type,
            finished: AtomicBool::new(false),
            state: Mutex::new(StepState {
                deps: Vec::new(),
                rdeps: Vec::new(),
                builds: Vec::new(),
                jobsets: Vec::new(),
                tries: 0,
                after: None,
                highest_global_priority: 0,
                highest_local_priority: 0,
                lowest_build_id: None,
                runnable_since: None,
                last_supported: now,
            }),
        }
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// Wire a dependency edge `parent → child`, maintaining the
    /// `deps`/`rdeps` mirror invariant.
    pub fn link(parent: &Arc<Step>, child: &Arc<Step>) {
        {
            let mut state = parent.state.lock();
            if state.deps.iter().any(|d| Arc::ptr_eq(d, child)) {
                return;
            }
            state.deps.push(child.clone());
        }
        child.state.lock().rdeps.push(Arc::downgrade(parent));
    }

    /// Attach a build directly to this step (its top level), folding the
    /// build's priorities and jobset into the step's aggregates.
    pub fn attach_build(step: &Arc<Step>, build: &Arc<Build>) {
        let mut state = step.state.lock();
        if !state.builds.iter().any(|b| b.upgrade().is_some_and(|b| b.id == build.id)) {
            state.builds.push(Arc::downgrade(build));
        }
        state.absorb_build(build);
    }
}

impl StepState {
    /// Fold one build's priorities and jobset into the aggregates.
    /// Monotone: priorities only rise, the lowest build id only falls.
    pub fn absorb_build(&mut self, build: &Build) {
        self.highest_global_priority = self.highest_global_priority.max(build.global_priority());
        self.highest_local_priority = self.highest_local_priority.max(build.local_priority);
        self.lowest_build_id = Some(match self.lowest_build_id {
            Some(id) => id.min(build.id),
            None => build.id,
        });
        if !self.jobsets.iter().any(|j| Arc::ptr_eq(j, &build.jobset)) {
            self.jobsets.push(build.jobset.clone());
        }
    }

    /// Live builds directly rooted at this step, pruning dead references.
    pub fn live_builds(&mut self) -> Vec<Arc<Build>> {
        let mut live = Vec::new();
        self.builds.retain(|weak| match weak.upgrade() {
            Some(build) => {
                live.push(build);
                true
            }
            None => false,
        });
        live
    }

    /// Live reverse dependencies, pruning dead references.
    pub fn live_rdeps(&mut self) -> Vec<Arc<Step>> {
        let mut live = Vec::new();
        self.rdeps.retain(|weak| match weak.upgrade() {
            Some(step) => {
                live.push(step);
                true
            }
            None => false,
        });
        live
    }

    /// The lowest share usage among this step's jobsets; steps without a
    /// jobset sort last.
    pub fn lowest_share_used(&self) -> f64 {
        self.jobsets.iter().map(|j| j.share_used()).fold(f64::INFINITY, f64::min)
    }
}

/// Push priority aggregates down the dependency closure of `toplevel`.
///
/// Every descendant ends up with at least the priorities and jobsets of
/// each build rooted at any of its ancestors. Re-run after a bump.
pub fn propagate_priorities(toplevel: &Arc<Step>) {
    let mut seen: HashSet<StorePath> = HashSet::new();
    let mut queue: VecDeque<Arc<Step>> = VecDeque::new();
    queue.push_back(toplevel.clone());

    while let Some(step) = queue.pop_front() {
        if !seen.insert(step.drv_path.clone()) {
            continue;
        }
        let (global, local, lowest, jobsets, deps) = {
            let mut state = step.state.lock();
            for build in state.live_builds() {
                state.absorb_build(&build);
            }
            (
                state.highest_global_priority,
                state.highest_local_priority,
                state.lowest_build_id,
                state.jobsets.clone(),
                state.deps.clone(),
            )
        };
        for dep in deps {
            {
                let mut state = dep.state.lock();
                state.highest_global_priority = state.highest_global_priority.max(global);
                state.highest_local_priority = state.highest_local_priority.max(local);
                state.lowest_build_id = match (state.lowest_build_id, lowest) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                for jobset in &jobsets {
                    if !state.jobsets.iter().any(|j| Arc::ptr_eq(j, jobset)) {
                        state.jobsets.push(jobset.clone());
                    }
                }
            }
            queue.push_back(dep);
        }
    }
}

/// Every live build that transitively requires `step`: the builds rooted
/// at the step itself plus those rooted at any step reachable over
/// reverse edges.
pub fn dependent_builds(step: &Arc<Step>) -> Vec<Arc<Build>> {
    let mut seen_steps: HashSet<StorePath> = HashSet::new();
    let mut seen_builds: HashSet<BuildId> = HashSet::new();
    let mut builds = Vec::new();
    let mut queue: VecDeque<Arc<Step>> = VecDeque::new();
    queue.push_back(step.clone());

    while let Some(step) = queue.pop_front() {
        if !seen_steps.insert(step.drv_path.clone()) {
            continue;
        }
        let (step_builds, rdeps) = {
            let mut state = step.state.lock();
            (state.live_builds(), state.live_rdeps())
        };
        for build in step_builds {
            if seen_builds.insert(build.id) {
                builds.push(build);
            }
        }
        for rdep in rdeps {
            queue.push_back(rdep);
        }
    }
    builds
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("drv_path", &self.drv_path)
            .field("system_type", &self.system_type)
            .field("finished", &self.finished())
            .finish()
    }
}

#[cfg(test)]
#[path = "step_tests.rs"]
mod tests;
