// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory database for tests.

use crate::database::{Database, DbError};
use crate::types::{BuildRow, Notification, StepRowUpdate};
use async_trait::async_trait;
use kiln_core::{BuildId, BuildStatus, JobsetName, StorePath};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// A materialized `build_steps` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRow {
    pub build_id: BuildId,
    pub step_nr: i32,
    pub drv_path: StorePath,
    pub status: BuildStatus,
    pub machine: String,
    pub start_time: i64,
    pub stop_time: Option<i64>,
    pub error_msg: Option<String>,
    pub propagated_from: Option<StorePath>,
    pub log_file: Option<String>,
}

/// A notification emitted by the scheduler, recorded for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyRecord {
    BuildStarted(BuildId),
    BuildFinished(BuildId, Vec<BuildId>),
    StepFinished(BuildId, i32, String),
    DumpStatus,
}

#[derive(Debug, Clone)]
struct BuildRec {
    row: BuildRow,
    pending: bool,
    status: Option<BuildStatus>,
    start_time: i64,
    stop_time: i64,
    outputs: BTreeMap<String, StorePath>,
    cached: bool,
}

#[derive(Default)]
struct MemoryDbState {
    builds: BTreeMap<BuildId, BuildRec>,
    steps: Vec<StepRow>,
    jobset_shares: HashMap<JobsetName, u32>,
    failed_paths: BTreeSet<StorePath>,
    notifications: VecDeque<Notification>,
    emitted: Vec<NotifyRecord>,
    /// Operations to let through before injecting failures.
    skip_ops: u32,
    /// Remaining operations to fail, for error-path tests.
    fail_ops: u32,
}

/// In-memory [`Database`].
#[derive(Clone, Default)]
pub struct MemoryDb {
    inner: Arc<Mutex<MemoryDbState>>,
    signal: Arc<Notify>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pending build and emit `builds_added`.
    pub fn insert_build(&self, row: BuildRow) {
        {
            let mut state = self.inner.lock();
            state.builds.insert(
                row.id,
                BuildRec {
                    row,
                    pending: true,
                    status: None,
                    start_time: 0,
                    stop_time: 0,
                    outputs: BTreeMap::new(),
                    cached: false,
                },
            );
        }
        self.push_notification(Notification::BuildsAdded);
    }

    /// Raise a build's global priority and emit `builds_bumped`.
    pub fn bump_build(&self, id: BuildId, global_priority: i32) {
        {
            let mut state = self.inner.lock();
            if let Some(rec) = state.builds.get_mut(&id) {
                rec.row.global_priority = global_priority;
            }
        }
        self.push_notification(Notification::BuildsBumped);
    }

    /// Mark a build cancelled (as the web frontend would) and emit
    /// `builds_cancelled`.
    pub fn cancel_build(&self, id: BuildId) {
        {
            let mut state = self.inner.lock();
            if let Some(rec) = state.builds.get_mut(&id) {
                rec.pending = false;
                rec.status = Some(BuildStatus::Cancelled);
            }
        }
        self.push_notification(Notification::BuildsCancelled);
    }

    /// Remove a build row entirely and emit `builds_deleted`.
    pub fn delete_build(&self, id: BuildId) {
        self.inner.lock().builds.remove(&id);
        self.push_notification(Notification::BuildsDeleted);
    }

    /// Re-queue a finished build and emit `builds_restarted`.
    pub fn restart_build(&self, id: BuildId) {
        {
            let mut state = self.inner.lock();
            if let Some(rec) = state.builds.get_mut(&id) {
                rec.pending = true;
                rec.status = None;
            }
        }
        self.push_notification(Notification::BuildsRestarted);
    }

    /// Set a jobset's scheduling shares and emit `jobset_shares_changed`.
    pub fn set_jobset_shares(&self, name: JobsetName, shares: u32) {
        self.inner.lock().jobset_shares.insert(name, shares);
        self.push_notification(Notification::JobsetSharesChanged);
    }

    /// Enqueue a raw notification.
    pub fn push_notification(&self, notification: Notification) {
        self.inner.lock().notifications.push_back(notification);
        self.signal.notify_one();
    }

    /// Fail the next `n` database operations with a query error.
    pub fn fail_next_ops(&self, n: u32) {
        let mut state = self.inner.lock();
        state.skip_ops = 0;
        state.fail_ops = n;
    }

    /// Let `skip` operations through, then fail the following `n`.
    pub fn fail_ops_after(&self, skip: u32, n: u32) {
        let mut state = self.inner.lock();
        state.skip_ops = skip;
        state.fail_ops = n;
    }

    pub fn build_status(&self, id: BuildId) -> Option<BuildStatus> {
        self.inner.lock().builds.get(&id).and_then(|rec| rec.status)
    }

    pub fn is_pending(&self, id: BuildId) -> bool {
        self.inner.lock().builds.get(&id).is_some_and(|rec| rec.pending)
    }

    pub fn build_outputs(&self, id: BuildId) -> BTreeMap<String, StorePath> {
        self.inner.lock().builds.get(&id).map(|rec| rec.outputs.clone()).unwrap_or_default()
    }

    pub fn build_was_cached(&self, id: BuildId) -> bool {
        self.inner.lock().builds.get(&id).is_some_and(|rec| rec.cached)
    }

    pub fn step_rows(&self, id: BuildId) -> Vec<StepRow> {
        self.inner.lock().steps.iter().filter(|s| s.build_id == id).cloned().collect()
    }

    pub fn emitted(&self) -> Vec<NotifyRecord> {
        self.inner.lock().emitted.clone()
    }

    fn gate(&self) -> Result<(), DbError> {
        let mut state = self.inner.lock();
        if state.skip_ops > 0 {
            state.skip_ops -= 1;
            return Ok(());
        }
        if state.fail_ops > 0 {
            state.fail_ops -= 1;
            return Err(DbError::Query("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Database for MemoryDb {
    async fn queued_builds(&self) -> Result<Vec<BuildRow>, DbError> {
        self.gate()?;
        let state = self.inner.lock();
        Ok(state.builds.values().filter(|rec| rec.pending).map(|rec| rec.row.clone()).collect())
    }

    async fn queued_build_priorities(&self) -> Result<Vec<(BuildId, i32)>, DbError> {
        self.gate()?;
        let state = self.inner.lock();
        Ok(state
            .builds
            .values()
            .filter(|rec| rec.pending)
            .map(|rec| (rec.row.id, rec.row.global_priority))
            .collect())
    }

    async fn jobset_shares(&self, name: &JobsetName) -> Result<Option<u32>, DbError> {
        self.gate()?;
        Ok(self.inner.lock().jobset_shares.get(name).copied())
    }

    async fn check_cached_failure(&self, drv_path: &StorePath) -> Result<bool, DbError> {
        self.gate()?;
        Ok(self.inner.lock().failed_paths.contains(drv_path))
    }

    async fn cache_failure(&self, drv_path: &StorePath) -> Result<(), DbError> {
        self.gate()?;
        self.inner.lock().failed_paths.insert(drv_path.clone());
        Ok(())
    }

    async fn create_build_step(
        &self,
        build_id: BuildId,
        drv_path: &StorePath,
        status: BuildStatus,
        machine: &str,
        start_time: i64,
        propagated_from: Option<&StorePath>,
    ) -> Result<i32, DbError> {
        self.gate()?;
        let mut state = self.inner.lock();
        let step_nr = state
            .steps
            .iter()
            .filter(|s| s.build_id == build_id)
            .map(|s| s.step_nr)
            .max()
            .unwrap_or(0)
            + 1;
        state.steps.push(StepRow {
            build_id,
            step_nr,
            drv_path: drv_path.clone(),
            status,
            machine: machine.to_string(),
            start_time,
            stop_time: None,
            error_msg: None,
            propagated_from: propagated_from.cloned(),
            log_file: None,
        });
        Ok(step_nr)
    }

    async fn finish_build_step(&self, update: StepRowUpdate) -> Result<(), DbError> {
        self.gate()?;
        let mut state = self.inner.lock();
        let row = state
            .steps
            .iter_mut()
            .find(|s| s.build_id == update.build_id && s.step_nr == update.step_nr)
            .ok_or_else(|| {
                DbError::Query(format!(
                    "no step row ({}, {})",
                    update.build_id, update.step_nr
                ))
            })?;
        row.status = update.status;
        row.start_time = update.start_time;
        row.stop_time = Some(update.stop_time);
        row.machine = update.machine;
        row.error_msg = update.error_msg;
        row.log_file = update.log_file;
        Ok(())
    }

    async fn mark_build_finished(
        &self,
        build_id: BuildId,
        status: BuildStatus,
        start_time: i64,
        stop_time: i64,
    ) -> Result<(), DbError> {
        self.gate()?;
        let mut state = self.inner.lock();
        if let Some(rec) = state.builds.get_mut(&build_id) {
            rec.pending = false;
            rec.status = Some(status);
            rec.start_time = start_time;
            rec.stop_time = stop_time;
        }
        Ok(())
    }

    async fn mark_build_succeeded(
        &self,
        build_id: BuildId,
        outputs: &BTreeMap<String, StorePath>,
        start_time: i64,
        stop_time: i64,
        cached: bool,
    ) -> Result<(), DbError> {
        self.gate()?;
        let mut state = self.inner.lock();
        if let Some(rec) = state.builds.get_mut(&build_id) {
            rec.pending = false;
            rec.status = Some(BuildStatus::Success);
            rec.start_time = start_time;
            rec.stop_time = stop_time;
            rec.outputs = outputs.clone();
            rec.cached = cached;
        }
        Ok(())
    }

    async fn notify_build_started(&self, build_id: BuildId) -> Result<(), DbError> {
        self.gate()?;
        self.inner.lock().emitted.push(NotifyRecord::BuildStarted(build_id));
        Ok(())
    }

    async fn notify_build_finished(
        &self,
        build_id: BuildId,
        dependents: &[BuildId],
    ) -> Result<(), DbError> {
        self.gate()?;
        self.inner.lock().emitted.push(NotifyRecord::BuildFinished(build_id, dependents.to_vec()));
        Ok(())
    }

    async fn notify_step_finished(
        &self,
        build_id: BuildId,
        step_nr: i32,
        log_file: &str,
    ) -> Result<(), DbError> {
        self.gate()?;
        self.inner.lock().emitted.push(NotifyRecord::StepFinished(
            build_id,
            step_nr,
            log_file.to_string(),
        ));
        Ok(())
    }

    async fn notify_dump_status(&self) -> Result<(), DbError> {
        self.push_notification(Notification::DumpStatus);
        self.inner.lock().emitted.push(NotifyRecord::DumpStatus);
        Ok(())
    }

    async fn next_notification(
        &self,
        timeout: Duration,
    ) -> Result<Option<Notification>, DbError> {
        if let Some(notification) = self.inner.lock().notifications.pop_front() {
            return Ok(Some(notification));
        }
        if timeout.is_zero() {
            return Ok(None);
        }
        match tokio::time::timeout(timeout, self.signal.notified()).await {
            Ok(()) => Ok(self.inner.lock().notifications.pop_front()),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
