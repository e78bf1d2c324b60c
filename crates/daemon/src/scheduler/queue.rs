// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Queue monitor: reconciles the database's pending builds into the
//! in-memory step graph.

use super::{Scheduler, SchedulerError};
use kiln_core::step::{dependent_builds, propagate_priorities};
use kiln_core::{Build, BuildStatus, Clock, Counters, Jobset, JobsetName, Step, StorePath};
use kiln_db::{BuildRow, Database, Notification, StepRowUpdate};
use kiln_store::Store;
use kiln_store::Hosts;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Jobsets without a configured share count get this weight.
const DEFAULT_SHARES: u32 = 100;

/// Monitor backoff bounds after a failed pass.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(600);

/// Result of expanding one derivation.
enum Expansion {
    /// All outputs already valid; nothing to schedule.
    AlreadyValid,
    /// The failure cache says this derivation cannot build.
    CachedFailure(StorePath),
    Step(Arc<Step>),
}

impl<D, S, H, C> Scheduler<D, S, H, C>
where
    D: Database,
    S: Store,
    H: Hosts,
    C: Clock,
{
    /// Single logical queue-monitor task: process notifications, reload
    /// pending builds, back off on database trouble.
    pub(crate) async fn queue_monitor_loop(self: Arc<Self>) {
        let shutdown = self.shutdown_token();
        let mut backoff = BACKOFF_INITIAL;
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.queue_pass().await {
                Ok(()) => backoff = BACKOFF_INITIAL,
                Err(e) => {
                    tracing::error!(error = %e, delay = ?backoff, "queue monitor pass failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                    continue;
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.queue_wake.wait() => {}
                notification = self.db.next_notification(self.config.queue_poll_interval()) => {
                    match notification {
                        Ok(Some(notification)) => {
                            if let Err(e) = self.handle_notification(notification).await {
                                tracing::warn!(error = %e, %notification, "notification handling failed");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "notification listener failed");
                            tokio::select! {
                                _ = shutdown.cancelled() => break,
                                _ = tokio::time::sleep(backoff) => {}
                            }
                            backoff = (backoff * 2).min(BACKOFF_MAX);
                        }
                    }
                }
            }
        }
    }

    /// One monitor iteration: clear orphaned step rows, then pull any
    /// pending builds we do not have in memory yet.
    pub async fn queue_pass(self: &Arc<Self>) -> Result<(), SchedulerError> {
        Counters::incr(&self.counters.nr_queue_wakeups);
        self.recover_orphans().await?;
        self.load_queued_builds().await?;
        Ok(())
    }

    /// Queue-change notifications that need more than a reload.
    pub(crate) async fn handle_notification(
        self: &Arc<Self>,
        notification: Notification,
    ) -> Result<(), SchedulerError> {
        match notification {
            Notification::BuildsAdded | Notification::BuildsRestarted => {
                // The follow-up queue pass picks the new rows up.
            }
            Notification::BuildsCancelled
            | Notification::BuildsDeleted
            | Notification::BuildsBumped => {
                self.process_queue_change().await?;
            }
            Notification::JobsetSharesChanged => self.refresh_jobset_shares().await?,
            Notification::DumpStatus => self.dump_status(),
        }
        Ok(())
    }

    /// Rewrite step rows orphaned by earlier database failures.
    async fn recover_orphans(&self) -> Result<(), SchedulerError> {
        let orphans: Vec<_> = {
            let mut orphaned = self.orphaned_steps.lock();
            std::mem::take(&mut *orphaned).into_iter().collect()
        };
        for (build_id, step_nr) in &orphans {
            let now = self.clock.epoch_secs();
            let result = self
                .db
                .finish_build_step(StepRowUpdate {
                    build_id: *build_id,
                    step_nr: *step_nr,
                    status: BuildStatus::Aborted,
                    start_time: now,
                    stop_time: now,
                    machine: String::new(),
                    error_msg: Some("step orphaned by a database error".to_string()),
                    log_file: None,
                })
                .await;
            if let Err(e) = result {
                // Put the rest back and let the backoff logic retry.
                let mut orphaned = self.orphaned_steps.lock();
                orphaned.extend(orphans.iter().copied());
                return Err(e.into());
            }
            tracing::info!(build = %build_id, step = step_nr, "recovered orphaned step row");
        }
        Ok(())
    }

    /// Load all pending builds not yet in memory and expand them.
    async fn load_queued_builds(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let rows = self.db.queued_builds().await?;
        let known: BTreeSet<_> = self.builds.lock().keys().copied().collect();
        for row in rows {
            if known.contains(&row.id) {
                continue;
            }
            if let Some(only) = self.config.build_one {
                if row.id.0 != only {
                    continue;
                }
            }
            Counters::incr(&self.counters.nr_builds_read);
            self.create_build(row).await?;
        }
        Ok(())
    }

    /// Reflect one database row into the graph (§ queue monitor).
    async fn create_build(self: &Arc<Self>, row: BuildRow) -> Result<(), SchedulerError> {
        let build_id = row.id;
        tracing::info!(build = %build_id, job = %row.job, "loading build");

        let jobset = self.jobset_for(&row.jobset_name()).await?;
        let drv = match self.store.read_derivation(&row.drv_path).await {
            Ok(drv) => drv,
            Err(e) => {
                // A build whose derivation cannot even be read is
                // aborted directly; nothing was scheduled for it.
                tracing::warn!(build = %build_id, error = %e, "unreadable derivation");
                let now = self.clock.epoch_secs();
                self.db.mark_build_finished(build_id, BuildStatus::Aborted, now, now).await?;
                self.db.notify_build_finished(build_id, &[]).await?;
                self.note_build_done(build_id, BuildStatus::Aborted);
                return Ok(());
            }
        };

        let build = Arc::new(Build::new(row.into_spec(drv.outputs.clone()), jobset));
        let mut finished_drvs = BTreeSet::new();
        match self.create_step(build.drv_path.clone(), &mut finished_drvs).await? {
            Expansion::AlreadyValid => {
                // Round trip: every output is in the destination store,
                // so the build succeeds without any dispatch.
                let now = self.clock.epoch_secs();
                self.db
                    .mark_build_succeeded(build.id, &build.outputs, now, now, true)
                    .await?;
                self.db.notify_build_finished(build.id, &[]).await?;
                build.mark_finished_in_db();
                tracing::info!(build = %build_id, "marked cached build as succeeded");
                self.note_build_done(build_id, BuildStatus::Success);
            }
            Expansion::CachedFailure(failed_drv) => {
                let now = self.clock.epoch_secs();
                self.db
                    .create_build_step(
                        build.id,
                        &failed_drv,
                        BuildStatus::CachedFailure,
                        "",
                        now,
                        None,
                    )
                    .await?;
                self.db
                    .mark_build_finished(
                        build.id,
                        BuildStatus::CachedFailure.at_build_level(),
                        now,
                        now,
                    )
                    .await?;
                self.db.notify_build_finished(build.id, &[]).await?;
                build.mark_finished_in_db();
                tracing::info!(build = %build_id, drv = %failed_drv, "failing build from failure cache");
                self.note_build_done(build_id, BuildStatus::Failed);
            }
            Expansion::Step(toplevel) => {
                *build.toplevel.lock() = Some(toplevel.clone());
                Step::attach_build(&toplevel, &build);
                self.builds.lock().insert(build.id, build.clone());
                propagate_priorities(&toplevel);
                self.dispatcher_wake.wake();
            }
        }
        Ok(())
    }

    /// Recursively expand one derivation into the step graph, reusing
    /// live steps so concurrent builds share in-flight work.
    fn create_step<'a>(
        self: &'a Arc<Self>,
        drv_path: StorePath,
        finished_drvs: &'a mut BTreeSet<StorePath>,
    ) -> Pin<Box<dyn Future<Output = Result<Expansion, SchedulerError>> + Send + 'a>> {
        Box::pin(async move {
            if finished_drvs.contains(&drv_path) {
                return Ok(Expansion::AlreadyValid);
            }

            if let Some(existing) =
                self.steps.lock().get(&drv_path).and_then(|weak| weak.upgrade())
            {
                if !existing.finished() {
                    return Ok(Expansion::Step(existing));
                }
            }

            let drv = self.store.read_derivation(&drv_path).await?;

            // Outputs already valid in the destination store need no step.
            let outputs = drv.output_paths();
            let valid = self.store.query_valid_paths(&outputs).await?;
            if !outputs.is_empty() && valid.len() == outputs.len() {
                finished_drvs.insert(drv_path);
                return Ok(Expansion::AlreadyValid);
            }

            if self.db.check_cached_failure(&drv_path).await? {
                return Ok(Expansion::CachedFailure(drv_path));
            }

            let input_drvs: Vec<StorePath> = drv.input_drvs.keys().cloned().collect();
            let step = Arc::new(Step::new(
                drv_path.clone(),
                drv,
                &self.config.this_system,
                self.clock.now(),
            ));
            self.steps.lock().insert(drv_path, Arc::downgrade(&step));

            for input in input_drvs {
                match self.create_step(input, finished_drvs).await? {
                    Expansion::AlreadyValid => {}
                    Expansion::CachedFailure(failed) => {
                        return Ok(Expansion::CachedFailure(failed))
                    }
                    Expansion::Step(dep) => Step::link(&step, &dep),
                }
            }

            if step.state.lock().deps.is_empty() {
                self.make_runnable(&step);
            }
            Ok(Expansion::Step(step))
        })
    }

    /// Look up or create the jobset, seeding shares from the database.
    async fn jobset_for(&self, name: &JobsetName) -> Result<Arc<Jobset>, SchedulerError> {
        if let Some(jobset) = self.jobsets.lock().get(name) {
            return Ok(jobset.clone());
        }
        let shares = self.db.jobset_shares(name).await?.unwrap_or(DEFAULT_SHARES);
        let jobset = Arc::new(Jobset::new(name.clone(), shares));
        Ok(self.jobsets.lock().entry(name.clone()).or_insert(jobset).clone())
    }

    /// Re-read `scheduling_shares` for every known jobset.
    pub(crate) async fn refresh_jobset_shares(&self) -> Result<(), SchedulerError> {
        let jobsets: Vec<Arc<Jobset>> = self.jobsets.lock().values().cloned().collect();
        for jobset in jobsets {
            if let Some(shares) = self.db.jobset_shares(&jobset.name).await? {
                jobset.set_shares(shares);
            }
        }
        self.dispatcher_wake.wake();
        Ok(())
    }

    /// Compare the in-memory builds against the database's pending set:
    /// builds that disappeared are cancelled, raised global priorities
    /// are re-propagated.
    pub(crate) async fn process_queue_change(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let current: HashMap<_, _> =
            self.db.queued_build_priorities().await?.into_iter().collect();
        let in_memory: Vec<Arc<Build>> = self.builds.lock().values().cloned().collect();

        let mut bumped = false;
        for build in in_memory {
            match current.get(&build.id) {
                None => self.remove_cancelled_build(&build),
                Some(&priority) if priority > build.global_priority() => {
                    tracing::info!(build = %build.id, priority, "priority of build raised");
                    build.bump_global_priority(priority);
                    if let Some(toplevel) = build.toplevel.lock().clone() {
                        propagate_priorities(&toplevel);
                    }
                    bumped = true;
                }
                Some(_) => {}
            }
        }
        if bumped {
            self.dispatcher_wake.wake();
        }
        Ok(())
    }

    /// Drop a build that is no longer pending in the database and
    /// cancel any active step nothing else depends on.
    fn remove_cancelled_build(&self, build: &Arc<Build>) {
        tracing::info!(build = %build.id, "build cancelled or deleted, dropping");
        build.mark_finished_in_db();
        self.builds.lock().remove(&build.id);
        *build.toplevel.lock() = None;

        let actives: Vec<Arc<super::ActiveStep>> = self.active_steps.lock().clone();
        for active in actives {
            if dependent_builds(&active.step).is_empty() {
                tracing::info!(step = %active.step.drv_path, "cancelling orphaned active step");
                active.cancelled.cancel();
            }
        }
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
