// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Row and notification types of the logical database contract.

use kiln_core::{BuildId, BuildSpec, BuildStatus, JobsetName, StorePath};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One pending row of the `builds` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRow {
    pub id: BuildId,
    pub drv_path: StorePath,
    pub project: String,
    pub jobset: String,
    pub job: String,
    /// Submission time, epoch seconds.
    pub timestamp: i64,
    pub max_silent_time: i32,
    pub build_timeout: i32,
    pub local_priority: i32,
    pub global_priority: i32,
}

impl BuildRow {
    pub fn jobset_name(&self) -> JobsetName {
        JobsetName::new(self.project.clone(), self.jobset.clone())
    }

    /// Lift the row into the in-memory entity spec, attaching the
    /// top-level derivation's outputs.
    pub fn into_spec(self, outputs: BTreeMap<String, StorePath>) -> BuildSpec {
        BuildSpec {
            id: self.id,
            drv_path: self.drv_path,
            outputs,
            project: self.project,
            jobset: self.jobset,
            job: self.job,
            timestamp: self.timestamp,
            local_priority: self.local_priority,
            global_priority: self.global_priority,
            max_silent_time: self.max_silent_time,
            build_timeout: self.build_timeout,
        }
    }
}

/// Finishing update for a `build_steps` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRowUpdate {
    pub build_id: BuildId,
    pub step_nr: i32,
    pub status: BuildStatus,
    /// Remote-reported execution interval, epoch seconds.
    pub start_time: i64,
    pub stop_time: i64,
    pub machine: String,
    pub error_msg: Option<String>,
    pub log_file: Option<String>,
}

/// Queue-change notifications consumed by the queue monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Notification {
    BuildsAdded,
    BuildsRestarted,
    BuildsCancelled,
    BuildsDeleted,
    BuildsBumped,
    JobsetSharesChanged,
    DumpStatus,
}

impl Notification {
    /// Every channel the monitor listens on.
    pub const ALL: [Notification; 7] = [
        Notification::BuildsAdded,
        Notification::BuildsRestarted,
        Notification::BuildsCancelled,
        Notification::BuildsDeleted,
        Notification::BuildsBumped,
        Notification::JobsetSharesChanged,
        Notification::DumpStatus,
    ];

    pub fn channel(self) -> &'static str {
        match self {
            Notification::BuildsAdded => "builds_added",
            Notification::BuildsRestarted => "builds_restarted",
            Notification::BuildsCancelled => "builds_cancelled",
            Notification::BuildsDeleted => "builds_deleted",
            Notification::BuildsBumped => "builds_bumped",
            Notification::JobsetSharesChanged => "jobset_shares_changed",
            Notification::DumpStatus => "dump_status",
        }
    }

    pub fn from_channel(channel: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|n| n.channel() == channel)
    }

    /// Whether this notification can change the set of pending builds
    /// or their priorities.
    pub fn changes_queue(self) -> bool {
        !matches!(self, Notification::DumpStatus | Notification::JobsetSharesChanged)
    }
}

kiln_core::simple_display! {
    Notification {
        BuildsAdded => "builds_added",
        BuildsRestarted => "builds_restarted",
        BuildsCancelled => "builds_cancelled",
        BuildsDeleted => "builds_deleted",
        BuildsBumped => "builds_bumped",
        JobsetSharesChanged => "jobset_shares_changed",
        DumpStatus => "dump_status",
    }
}

#[cfg(test)]
#[path = "types_tests.rs"]
mod tests;
