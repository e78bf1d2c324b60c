// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Builder worker: executes one step on one machine.
//!
//! A worker is a straight-line async task. Cancellation is cooperative:
//! every remote call races the active step's token, and an in-flight
//! transfer is torn down by dropping the connection.

use super::{ActiveStep, MachineReservation, Scheduler};
use kiln_core::step::dependent_builds;
use kiln_core::{
    Build, BuildId, BuildStatus, Clock, Counters, GaugeGuard, Machine, Step, StepPhase, StorePath,
};
use kiln_db::{Database, DbError, StepRowUpdate};
use kiln_store::{BuildHost, BuildOptions, BuildOutcome, HostError, Hosts, Store, StoreError};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::SemaphorePermit;
use tokio_util::sync::CancellationToken;

/// How a builder worker left its step behind.
enum StepResult {
    /// The step reached a terminal state (success or permanent/retried
    /// failure); all bookkeeping is done.
    Done,
    /// The step must go straight back on the runnable list.
    Restart,
    /// The step was (probably) cancelled; destroy it unless some build
    /// still needs it.
    MaybeCancelled,
}

/// Why a step stopped before producing a remote outcome.
enum StepInterrupt {
    Cancelled,
    SendLockTimeout,
    Transport(String),
    Db(DbError),
    Store(StoreError),
}

impl From<HostError> for StepInterrupt {
    fn from(e: HostError) -> Self {
        StepInterrupt::Transport(e.to_string())
    }
}

impl From<DbError> for StepInterrupt {
    fn from(e: DbError) -> Self {
        StepInterrupt::Db(e)
    }
}

impl From<StoreError> for StepInterrupt {
    fn from(e: StoreError) -> Self {
        StepInterrupt::Store(e)
    }
}

/// Race a remote operation against the cancellation token.
async fn with_cancel<T>(
    token: &CancellationToken,
    operation: impl Future<Output = Result<T, HostError>>,
) -> Result<T, StepInterrupt> {
    tokio::select! {
        _ = token.cancelled() => Err(StepInterrupt::Cancelled),
        result = operation => result.map_err(StepInterrupt::from),
    }
}

impl<D, S, H, C> Scheduler<D, S, H, C>
where
    D: Database,
    S: Store,
    H: Hosts,
    C: Clock,
{
    /// One task per reservation: run the step, then feed the result back
    /// into the graph. Dropping the reservation releases the machine
    /// slot and wakes the dispatcher.
    pub(crate) async fn run_builder(self: Arc<Self>, reservation: MachineReservation<C>) {
        let step = reservation.step.clone();
        let active = Arc::new(ActiveStep::new(step.clone()));
        self.active_steps.lock().push(active.clone());

        let result = self.do_build_step(&reservation, &active).await;

        self.active_steps.lock().retain(|a| !Arc::ptr_eq(a, &active));
        self.note_step_stopped(&step.system_type);
        match result {
            StepResult::Done => {}
            StepResult::Restart => self.make_runnable(&step),
            StepResult::MaybeCancelled => self.finish_cancelled_step(&step),
        }
    }

    async fn do_build_step(
        self: &Arc<Self>,
        reservation: &MachineReservation<C>,
        active: &Arc<ActiveStep>,
    ) -> StepResult {
        let step = &reservation.step;
        let machine = &reservation.machine;
        let machine_uri = machine.spec.store_uri.clone();

        // Timeouts and the step row hang off the oldest build that
        // still needs this step.
        let dependents = dependent_builds(step);
        let Some(build) = dependents.iter().min_by_key(|b| b.id).cloned() else {
            return StepResult::MaybeCancelled;
        };

        Counters::incr(&self.counters.nr_steps_started);
        let options = BuildOptions {
            max_silent_time: build.max_silent_time,
            build_timeout: build.build_timeout,
            max_log_size: self.config.max_log_size,
            repeats: self.config.repeats_for(&build.jobset.name),
        };
        let log_file = self.log_path(step);
        let started_epoch = self.clock.epoch_secs();
        tracing::info!(
            step = %step.drv_path,
            build = %build.id,
            machine = %machine_uri,
            "performing step"
        );

        let step_nr = match self
            .db
            .create_build_step(
                build.id,
                &step.drv_path,
                BuildStatus::Busy,
                &machine_uri,
                started_epoch,
                None,
            )
            .await
        {
            Ok(step_nr) => step_nr,
            Err(e) => {
                tracing::warn!(error = %e, step = %step.drv_path, "could not create step row");
                return StepResult::Restart;
            }
        };
        for dependent in &dependents {
            if dependent.mark_started() {
                let _ = self.db.notify_build_started(dependent.id).await;
            }
        }

        match self.execute_step(step, machine, &options, active).await {
            Ok(mut outcome) => {
                if outcome.is_non_deterministic && outcome.status.is_success() {
                    outcome.status = BuildStatus::NotDeterministic;
                    outcome.error_msg = "builds produced differing outputs".to_string();
                }
                if outcome.status.is_success() {
                    match self
                        .succeed_step(step, machine, &outcome, step_nr, &build, &log_file)
                        .await
                    {
                        Ok(()) => StepResult::Done,
                        Err(e) => {
                            tracing::error!(
                                error = %e,
                                build = %build.id,
                                step_nr,
                                "database error finishing step; orphaning row"
                            );
                            self.orphaned_steps.lock().insert((build.id, step_nr));
                            self.queue_wake.wake();
                            StepResult::Restart
                        }
                    }
                } else {
                    let can_retry = matches!(outcome.status, BuildStatus::Aborted);
                    self.handle_failed_outcome(
                        step,
                        &machine_uri,
                        outcome,
                        step_nr,
                        build.id,
                        &log_file,
                        can_retry,
                    )
                    .await;
                    StepResult::Done
                }
            }
            Err(StepInterrupt::Cancelled) => {
                tracing::info!(step = %step.drv_path, "step cancelled");
                let now = self.clock.epoch_secs();
                let _ = self
                    .db
                    .finish_build_step(StepRowUpdate {
                        build_id: build.id,
                        step_nr,
                        status: BuildStatus::Cancelled,
                        start_time: started_epoch,
                        stop_time: now,
                        machine: machine_uri,
                        error_msg: Some("step cancelled".to_string()),
                        log_file: Some(log_file),
                    })
                    .await;
                StepResult::MaybeCancelled
            }
            Err(StepInterrupt::SendLockTimeout) => {
                tracing::warn!(
                    step = %step.drv_path,
                    machine = %machine_uri,
                    "timed out waiting for send lock; requeueing"
                );
                let now = self.clock.epoch_secs();
                let _ = self
                    .db
                    .finish_build_step(StepRowUpdate {
                        build_id: build.id,
                        step_nr,
                        status: BuildStatus::Aborted,
                        start_time: started_epoch,
                        stop_time: now,
                        machine: machine_uri,
                        error_msg: Some(
                            "timed out waiting for the machine's send lock".to_string(),
                        ),
                        log_file: Some(log_file),
                    })
                    .await;
                StepResult::Restart
            }
            Err(StepInterrupt::Transport(reason)) => {
                let cooldown =
                    machine.note_failure(self.clock.now(), self.config.machine_cooldown());
                tracing::warn!(
                    machine = %machine_uri,
                    error = %reason,
                    cooldown_secs = cooldown.as_secs(),
                    "machine failure"
                );
                let outcome = BuildOutcome {
                    status: BuildStatus::Aborted,
                    error_msg: reason,
                    times_built: 0,
                    is_non_deterministic: false,
                    start_time: started_epoch,
                    stop_time: self.clock.epoch_secs(),
                };
                self.handle_failed_outcome(
                    step,
                    &machine_uri,
                    outcome,
                    step_nr,
                    build.id,
                    &log_file,
                    true,
                )
                .await;
                StepResult::Done
            }
            Err(StepInterrupt::Store(e)) => {
                // Local store trouble is infrastructure, not the build.
                let outcome = BuildOutcome {
                    status: BuildStatus::Aborted,
                    error_msg: e.to_string(),
                    times_built: 0,
                    is_non_deterministic: false,
                    start_time: started_epoch,
                    stop_time: self.clock.epoch_secs(),
                };
                self.handle_failed_outcome(
                    step,
                    &machine_uri,
                    outcome,
                    step_nr,
                    build.id,
                    &log_file,
                    true,
                )
                .await;
                StepResult::Done
            }
            Err(StepInterrupt::Db(e)) => {
                tracing::error!(
                    error = %e,
                    build = %build.id,
                    step_nr,
                    "database error during step; orphaning row"
                );
                self.orphaned_steps.lock().insert((build.id, step_nr));
                self.queue_wake.wake();
                StepResult::Restart
            }
        }
    }

    /// The remote protocol of one step: connect, send missing inputs,
    /// build, receive outputs, post-process.
    async fn execute_step(
        &self,
        step: &Arc<Step>,
        machine: &Arc<Machine>,
        options: &BuildOptions,
        active: &Arc<ActiveStep>,
    ) -> Result<BuildOutcome, StepInterrupt> {
        let token = active.cancelled.clone();

        active.set_phase(StepPhase::Connecting);
        let host = with_cancel(&token, self.hosts.connect(&machine.spec)).await?;

        active.set_phase(StepPhase::SendingInputs);
        let mut inputs: BTreeSet<StorePath> = step.drv.input_srcs.clone();
        for (dep_drv, wanted_outputs) in &step.drv.input_drvs {
            let dep = self.store.read_derivation(dep_drv).await?;
            for (name, path) in &dep.outputs {
                if wanted_outputs.is_empty() || wanted_outputs.contains(name) {
                    inputs.insert(path.clone());
                }
            }
        }
        let closure = {
            let _local = self.local_permit().await;
            self.store.compute_closure(&inputs).await?
        };

        // The send lock serializes uploads to this machine; the wait is
        // bounded so a wedged transfer cannot strand the reservation.
        let send_guard = tokio::select! {
            _ = token.cancelled() => return Err(StepInterrupt::Cancelled),
            acquired = tokio::time::timeout(
                self.config.send_lock_timeout(),
                machine.send_lock.clone().lock_owned(),
            ) => match acquired {
                Ok(guard) => guard,
                Err(_) => return Err(StepInterrupt::SendLockTimeout),
            },
        };

        let valid = with_cancel(&token, host.query_valid_paths(&closure)).await?;
        let missing: BTreeSet<StorePath> = closure.difference(&valid).cloned().collect();
        if !missing.is_empty() {
            let _copying = GaugeGuard::new(&self.counters.nr_steps_copying_to);
            let _slot = self.copy_closure.acquire().await.ok();
            tracing::debug!(
                paths = missing.len(),
                machine = %machine.spec.store_uri,
                "copying inputs"
            );
            let nars = {
                let _local = self.local_permit().await;
                self.store.export_paths(&missing).await?
            };
            with_cancel(&token, host.import_paths(nars)).await?;
        }
        drop(send_guard);

        active.set_phase(StepPhase::Building);
        let outcome = {
            let _building = GaugeGuard::new(&self.counters.nr_steps_building);
            with_cancel(&token, host.build_derivation(&step.drv_path, &step.drv, options))
                .await?
        };
        if !outcome.status.is_success() {
            return Ok(outcome);
        }

        active.set_phase(StepPhase::ReceivingOutputs);
        let outputs = step.drv.output_paths();
        let valid_local = self.store.query_valid_paths(&outputs).await?;
        let missing_local: BTreeSet<StorePath> =
            outputs.difference(&valid_local).cloned().collect();
        if !missing_local.is_empty() {
            let nars = with_cancel(&token, host.export_paths(&missing_local)).await?;
            let _local = self.local_permit().await;
            self.store.import_paths(nars).await?;
        }

        active.set_phase(StepPhase::PostProcessing);
        {
            let _local = self.local_permit().await;
            for output in &outputs {
                self.store.add_root(output).await?;
            }
        }
        Ok(outcome)
    }

    /// A step finished with a non-success status: record the attempt,
    /// then either reschedule with backoff or fail permanently.
    #[allow(clippy::too_many_arguments)]
    async fn handle_failed_outcome(
        self: &Arc<Self>,
        step: &Arc<Step>,
        machine_uri: &str,
        outcome: BuildOutcome,
        step_nr: i32,
        build_id: BuildId,
        log_file: &str,
        can_retry: bool,
    ) {
        Counters::incr(&self.counters.nr_steps_failed);
        let update = StepRowUpdate {
            build_id,
            step_nr,
            status: outcome.status,
            start_time: outcome.start_time,
            stop_time: outcome.stop_time,
            machine: machine_uri.to_string(),
            error_msg: (!outcome.error_msg.is_empty()).then(|| outcome.error_msg.clone()),
            log_file: Some(log_file.to_string()),
        };
        if let Err(e) = self.db.finish_build_step(update).await {
            tracing::error!(error = %e, build = %build_id, step_nr, "orphaning step row");
            self.orphaned_steps.lock().insert((build_id, step_nr));
            self.queue_wake.wake();
        }
        let _ = self.db.notify_step_finished(build_id, step_nr, log_file).await;

        if can_retry {
            let tries = {
                let mut state = step.state.lock();
                state.tries += 1;
                state.tries
            };
            if tries <= self.config.max_tries {
                Counters::incr(&self.counters.nr_retries);
                Counters::raise(&self.counters.max_nr_retries, tries as u64);
                let delay = self.config.retry_delay(tries);
                tracing::info!(
                    step = %step.drv_path,
                    tries,
                    delay_secs = delay.as_secs(),
                    "will retry step"
                );
                step.state.lock().after = Some(self.clock.now() + delay);
                self.make_runnable(step);
                return;
            }
        }
        self.fail_step(step, outcome.status, outcome.error_msg).await;
    }

    /// Permanently fail a step and every build that transitively needs
    /// it. The builds' never-run top-level steps get `DepFailed` rows
    /// pointing at the step that actually failed.
    pub(crate) async fn fail_step(
        self: &Arc<Self>,
        step: &Arc<Step>,
        status: BuildStatus,
        error_msg: String,
    ) {
        if self.config.cache_failures
            && matches!(status, BuildStatus::Failed | BuildStatus::NotDeterministic)
        {
            if let Err(e) = self.db.cache_failure(&step.drv_path).await {
                tracing::warn!(error = %e, "could not record cached failure");
            }
        }

        step.mark_finished();
        self.steps.lock().remove(&step.drv_path);

        let dependents = dependent_builds(step);
        let build_status = status.at_build_level();
        let now = self.clock.epoch_secs();
        let batch: Vec<BuildId> = dependents.iter().map(|b| b.id).collect();
        tracing::warn!(
            step = %step.drv_path,
            status = %status,
            error = %error_msg,
            builds = batch.len(),
            "step failed permanently"
        );

        for build in &dependents {
            if !build.mark_finished_in_db() {
                continue;
            }
            let toplevel = build.toplevel.lock().clone();
            if let Some(toplevel) = &toplevel {
                if !Arc::ptr_eq(toplevel, step) {
                    let _ = self
                        .db
                        .create_build_step(
                            build.id,
                            &toplevel.drv_path,
                            BuildStatus::DepFailed,
                            "",
                            now,
                            Some(&step.drv_path),
                        )
                        .await;
                }
            }
            if let Err(e) = self.db.mark_build_finished(build.id, build_status, now, now).await {
                tracing::error!(error = %e, build = %build.id, "could not mark build finished");
                continue;
            }
            let others: Vec<BuildId> =
                batch.iter().copied().filter(|id| *id != build.id).collect();
            let _ = self.db.notify_build_finished(build.id, &others).await;
            tracing::info!(build = %build.id, status = %build_status, "build failed");
            self.note_build_done(build.id, build_status);
        }

        {
            let mut builds = self.builds.lock();
            for build in &dependents {
                builds.remove(&build.id);
            }
        }
        for build in &dependents {
            *build.toplevel.lock() = None;
        }
    }

    /// Terminal success: record the row, account the jobsets, release
    /// reverse dependencies, finish builds rooted here.
    async fn succeed_step(
        self: &Arc<Self>,
        step: &Arc<Step>,
        machine: &Arc<Machine>,
        outcome: &BuildOutcome,
        step_nr: i32,
        referring: &Arc<Build>,
        log_file: &str,
    ) -> Result<(), DbError> {
        let duration = outcome.duration_secs();
        machine.note_success();
        Counters::incr(&machine.state.nr_steps_done);
        Counters::add(&machine.state.total_step_time, duration);
        Counters::incr(&self.counters.nr_steps_done);
        Counters::add(&self.counters.total_step_time, duration);

        self.db
            .finish_build_step(StepRowUpdate {
                build_id: referring.id,
                step_nr,
                status: BuildStatus::Success,
                start_time: outcome.start_time,
                stop_time: outcome.stop_time,
                machine: machine.spec.store_uri.clone(),
                error_msg: None,
                log_file: Some(log_file.to_string()),
            })
            .await?;
        let _ = self.db.notify_step_finished(referring.id, step_nr, log_file).await;

        // Charge the execution to every jobset needing this step and
        // decay entries that left the scheduling window.
        let jobsets = step.state.lock().jobsets.clone();
        let horizon = self.clock.epoch_secs() - self.config.scheduling_window_secs as i64;
        for jobset in jobsets {
            jobset.add_step(outcome.start_time, duration);
            jobset.prune_steps(horizon);
        }

        step.mark_finished();
        self.steps.lock().remove(&step.drv_path);
        let (rdeps, direct_builds) = {
            let mut state = step.state.lock();
            (state.live_rdeps(), state.live_builds())
        };
        for rdep in rdeps {
            let now_runnable = {
                let mut state = rdep.state.lock();
                state.deps.retain(|dep| !Arc::ptr_eq(dep, step));
                state.deps.is_empty()
            };
            if now_runnable && !rdep.finished() {
                self.make_runnable(&rdep);
            }
        }

        let finished: Vec<Arc<Build>> = direct_builds
            .into_iter()
            .filter(|b| b.toplevel.lock().as_ref().is_some_and(|t| Arc::ptr_eq(t, step)))
            .collect();
        let batch: Vec<BuildId> = finished.iter().map(|b| b.id).collect();
        for build in &finished {
            if build.finished_in_db() {
                continue;
            }
            match self
                .db
                .mark_build_succeeded(
                    build.id,
                    &build.outputs,
                    outcome.start_time,
                    outcome.stop_time,
                    false,
                )
                .await
            {
                Ok(()) => {
                    build.mark_finished_in_db();
                    let others: Vec<BuildId> =
                        batch.iter().copied().filter(|id| *id != build.id).collect();
                    let _ = self.db.notify_build_finished(build.id, &others).await;
                    tracing::info!(build = %build.id, "build succeeded");
                    self.note_build_done(build.id, BuildStatus::Success);
                }
                Err(e) => {
                    // Leave the row pending: the next monitor pass sees
                    // valid outputs and finishes the build as cached.
                    tracing::error!(error = %e, build = %build.id, "could not mark build succeeded");
                }
            }
        }
        {
            let mut builds = self.builds.lock();
            for build in &finished {
                builds.remove(&build.id);
            }
        }
        for build in &finished {
            *build.toplevel.lock() = None;
        }
        Ok(())
    }

    /// A worker came back from a (possible) cancellation: destroy the
    /// step unless some build attached to it in the meantime.
    fn finish_cancelled_step(&self, step: &Arc<Step>) {
        if dependent_builds(step).is_empty() {
            tracing::info!(step = %step.drv_path, "destroying cancelled step");
            step.mark_finished();
            self.steps.lock().remove(&step.drv_path);
        } else {
            self.make_runnable(step);
        }
    }

    async fn local_permit(&self) -> Option<SemaphorePermit<'_>> {
        self.local_work.acquire().await.ok()
    }

    fn log_path(&self, step: &Arc<Step>) -> String {
        let name = step.drv_path.base_name().trim_end_matches(".drv");
        self.config.logs_dir().join(name).display().to_string()
    }
}

#[cfg(test)]
#[path = "builder_tests.rs"]
mod tests;
