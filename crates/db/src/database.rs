// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The database operations the scheduler depends on.

use crate::types::{BuildRow, Notification, StepRowUpdate};
use async_trait::async_trait;
use kiln_core::{BuildId, BuildStatus, JobsetName, StorePath};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Errors from database operations.
///
/// All variants are treated as transient by the scheduler: the queue
/// monitor retries with backoff, workers park their step row in the
/// orphaned set.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("database query error: {0}")]
    Query(String),

    #[error("notification listener error: {0}")]
    Listen(String),
}

/// Logical contract with the relational database (§ external interfaces).
///
/// Implementations must make [`Database::mark_build_succeeded`] and
/// [`Database::mark_build_finished`] atomic with respect to readers.
#[async_trait]
pub trait Database: Clone + Send + Sync + 'static {
    /// All builds in status pending, ascending by id.
    async fn queued_builds(&self) -> Result<Vec<BuildRow>, DbError>;

    /// `(id, global_priority)` for every pending build. Used to detect
    /// cancellations, deletions and priority bumps without reloading
    /// whole rows.
    async fn queued_build_priorities(&self) -> Result<Vec<(BuildId, i32)>, DbError>;

    /// Configured scheduling shares of a jobset; `None` if unknown.
    async fn jobset_shares(&self, name: &JobsetName) -> Result<Option<u32>, DbError>;

    /// Whether a failure for this derivation is cached.
    async fn check_cached_failure(&self, drv_path: &StorePath) -> Result<bool, DbError>;

    /// Record a derivation failure in the failure cache.
    async fn cache_failure(&self, drv_path: &StorePath) -> Result<(), DbError>;

    /// Insert a `build_steps` row, allocating the next step number for
    /// `build_id`.
    async fn create_build_step(
        &self,
        build_id: BuildId,
        drv_path: &StorePath,
        status: BuildStatus,
        machine: &str,
        start_time: i64,
        propagated_from: Option<&StorePath>,
    ) -> Result<i32, DbError>;

    /// Finish a previously-created step row.
    async fn finish_build_step(&self, update: StepRowUpdate) -> Result<(), DbError>;

    /// Terminally mark a build with a non-success status.
    async fn mark_build_finished(
        &self,
        build_id: BuildId,
        status: BuildStatus,
        start_time: i64,
        stop_time: i64,
    ) -> Result<(), DbError>;

    /// Terminally mark a build succeeded, recording its outputs.
    /// `cached` is set when the outputs were already valid at expansion
    /// and nothing was dispatched.
    async fn mark_build_succeeded(
        &self,
        build_id: BuildId,
        outputs: &BTreeMap<String, StorePath>,
        start_time: i64,
        stop_time: i64,
        cached: bool,
    ) -> Result<(), DbError>;

    async fn notify_build_started(&self, build_id: BuildId) -> Result<(), DbError>;

    /// `dependents` are further builds finished by the same step.
    async fn notify_build_finished(
        &self,
        build_id: BuildId,
        dependents: &[BuildId],
    ) -> Result<(), DbError>;

    async fn notify_step_finished(
        &self,
        build_id: BuildId,
        step_nr: i32,
        log_file: &str,
    ) -> Result<(), DbError>;

    async fn notify_dump_status(&self) -> Result<(), DbError>;

    /// Wait up to `timeout` for the next queue-change notification.
    async fn next_notification(
        &self,
        timeout: Duration,
    ) -> Result<Option<Notification>, DbError>;
}
