// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The in-memory scheduling engine.
//!
//! One `Scheduler` value owns every registry and is shared (`Arc`) by
//! the queue monitor, the dispatcher, the machine reloader, the metrics
//! task and the builder workers. Registries are independently locked;
//! when several must be held, acquire in the order
//! `builds < steps < jobsets < machines < runnable`.

mod builder;
mod dispatch;
mod machines;
mod queue;
mod status;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use dispatch::{DispatchOutcome, MachineReservation};
pub use machines::{parse_machines, MachineFileError};
pub use status::StatusDump;

use crate::config::Config;
use kiln_core::{
    Build, BuildId, BuildStatus, Clock, Counters, Jobset, JobsetName, Machine, Step, StorePath,
    WakeChannel,
};
use kiln_db::{Database, DbError};
use kiln_store::{Hosts, Store, StoreError};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Scheduler errors. All of these are transient from the monitor's
/// point of view: the failing pass is abandoned and retried with
/// backoff.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("machine file error: {0}")]
    MachineFile(#[from] MachineFileError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A step currently held by a builder worker, registered so that
/// cancellations can reach it.
pub struct ActiveStep {
    pub step: Arc<Step>,
    pub cancelled: CancellationToken,
    phase: Mutex<kiln_core::StepPhase>,
}

impl ActiveStep {
    pub(crate) fn new(step: Arc<Step>) -> Self {
        Self {
            step,
            cancelled: CancellationToken::new(),
            phase: Mutex::new(kiln_core::StepPhase::Preparing),
        }
    }

    pub fn phase(&self) -> kiln_core::StepPhase {
        *self.phase.lock()
    }

    pub(crate) fn set_phase(&self, phase: kiln_core::StepPhase) {
        *self.phase.lock() = phase;
    }
}

/// Per-system-type dispatch statistics.
#[derive(Debug, Clone, Default)]
pub struct SystemTypeInfo {
    pub runnable: u64,
    pub running: i64,
    /// Epoch seconds of the last dispatch for this system type.
    pub last_active: i64,
    /// Accumulated runnable→dispatched wait, milliseconds.
    pub wait_time_ms: u64,
}

/// The queue runner's scheduling engine.
pub struct Scheduler<D, S, H, C> {
    pub(crate) config: Config,
    pub(crate) clock: C,
    pub(crate) db: D,
    pub(crate) store: S,
    pub(crate) hosts: H,

    pub(crate) builds: Mutex<HashMap<BuildId, Arc<Build>>>,
    pub(crate) steps: Mutex<HashMap<StorePath, Weak<Step>>>,
    pub(crate) jobsets: Mutex<HashMap<JobsetName, Arc<Jobset>>>,
    pub(crate) machines: Mutex<HashMap<String, Arc<Machine>>>,
    pub(crate) runnable: Mutex<Vec<Weak<Step>>>,
    pub(crate) active_steps: Mutex<Vec<Arc<ActiveStep>>>,
    pub(crate) machine_types: Mutex<HashMap<String, SystemTypeInfo>>,
    /// `(build_id, step_nr)` rows left busy by database failures,
    /// rewritten on the next successful monitor pass.
    pub(crate) orphaned_steps: Mutex<BTreeSet<(BuildId, i32)>>,

    pub(crate) dispatcher_wake: Arc<WakeChannel>,
    pub(crate) queue_wake: Arc<WakeChannel>,
    /// Throttles CPU-bound local work (closure walks, archive handling).
    pub(crate) local_work: Semaphore,
    /// Bounds closure uploads in flight across all machines.
    pub(crate) copy_closure: Semaphore,

    pub(crate) counters: Counters,
    shutdown: CancellationToken,
    start_time: Instant,
    /// Terminal status of the `--build-one` build, once known.
    build_one_status: Mutex<Option<BuildStatus>>,
}

impl<D, S, H, C> Scheduler<D, S, H, C>
where
    D: Database,
    S: Store,
    H: Hosts,
    C: Clock,
{
    pub fn new(config: Config, db: D, store: S, hosts: H, clock: C) -> Arc<Self> {
        let local_permits = config.local_worker_permits();
        let copy_permits = config.max_parallel_copy_closure.max(1);
        let start_time = clock.now();
        Arc::new(Self {
            config,
            db,
            store,
            hosts,
            builds: Mutex::new(HashMap::new()),
            steps: Mutex::new(HashMap::new()),
            jobsets: Mutex::new(HashMap::new()),
            machines: Mutex::new(HashMap::new()),
            runnable: Mutex::new(Vec::new()),
            active_steps: Mutex::new(Vec::new()),
            machine_types: Mutex::new(HashMap::new()),
            orphaned_steps: Mutex::new(BTreeSet::new()),
            dispatcher_wake: Arc::new(WakeChannel::new()),
            queue_wake: Arc::new(WakeChannel::new()),
            local_work: Semaphore::new(local_permits),
            copy_closure: Semaphore::new(copy_permits),
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
            start_time,
            build_one_status: Mutex::new(None),
            clock,
        })
    }

    /// Run every scheduler task until shutdown.
    pub async fn run(self: &Arc<Self>) -> Result<(), SchedulerError> {
        tracing::info!(system = %self.config.this_system, "queue runner starting");
        if let Err(e) = self.reload_machines().await {
            tracing::warn!(error = %e, "initial machine list load failed");
        }

        let tasks = vec![
            tokio::spawn(self.clone().queue_monitor_loop()),
            tokio::spawn(self.clone().dispatcher_loop()),
            tokio::spawn(self.clone().machines_reload_loop()),
            tokio::spawn(self.clone().metrics_loop()),
        ];

        self.shutdown.cancelled().await;
        tracing::info!("queue runner shutting down");

        // Give in-flight builders a grace period to finish their steps.
        let deadline = Instant::now() + Duration::from_secs(30);
        while self.active_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        self.dump_status();
        Ok(())
    }

    /// Request shutdown; `run` returns once tasks have stopped.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn active_count(&self) -> usize {
        self.active_steps.lock().len()
    }

    pub fn runnable_count(&self) -> usize {
        self.runnable.lock().iter().filter(|w| w.upgrade().is_some()).count()
    }

    pub fn uptime(&self) -> Duration {
        self.clock.now() - self.start_time
    }

    /// Terminal status of the `--build-one` build, once finished.
    pub fn build_one_status(&self) -> Option<BuildStatus> {
        *self.build_one_status.lock()
    }

    /// Record a finished build; in `--build-one` mode, finishing the
    /// watched build requests shutdown.
    pub(crate) fn note_build_done(&self, id: BuildId, status: BuildStatus) {
        Counters::incr(&self.counters.nr_builds_done);
        if self.config.build_one == Some(id.0) {
            *self.build_one_status.lock() = Some(status);
            self.shutdown.cancel();
        }
    }

    /// Put a step (back) on the runnable list and wake the dispatcher.
    /// A step may sit here with `after` in the future; the dispatcher
    /// skips it until the retry time arrives.
    pub(crate) fn make_runnable(&self, step: &Arc<Step>) {
        {
            let mut state = step.state.lock();
            debug_assert!(state.deps.is_empty(), "runnable step with unfinished deps");
            if state.runnable_since.is_none() {
                state.runnable_since = Some(self.clock.now());
            }
        }
        {
            let mut runnable = self.runnable.lock();
            let already = runnable
                .iter()
                .any(|weak| weak.upgrade().is_some_and(|s| Arc::ptr_eq(&s, step)));
            if !already {
                runnable.push(Arc::downgrade(step));
            }
        }
        self.dispatcher_wake.wake();
    }

    /// Remove one step from the runnable list. Returns false when some
    /// other task got there first.
    pub(crate) fn take_runnable(&self, step: &Arc<Step>) -> bool {
        let mut runnable = self.runnable.lock();
        let before = runnable.len();
        runnable.retain(|weak| !weak.upgrade().is_some_and(|s| Arc::ptr_eq(&s, step)));
        runnable.len() != before
    }

    /// Periodic metrics logging and fair-share window pruning.
    pub(crate) async fn metrics_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.metrics_interval()) => {}
            }
            self.prune_jobsets();
            let snap = self.counters.snapshot();
            tracing::info!(
                builds_done = snap.nr_builds_done,
                steps_done = snap.nr_steps_done,
                steps_failed = snap.nr_steps_failed,
                retries = snap.nr_retries,
                runnable = self.runnable_count(),
                active = self.active_count(),
                "scheduler counters"
            );
        }
    }

    /// Drop fair-share entries that aged out of the scheduling window.
    pub(crate) fn prune_jobsets(&self) {
        let horizon = self.clock.epoch_secs() - self.config.scheduling_window_secs as i64;
        let jobsets: Vec<Arc<Jobset>> = self.jobsets.lock().values().cloned().collect();
        for jobset in jobsets {
            jobset.prune_steps(horizon);
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
