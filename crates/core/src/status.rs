// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Build and step status taxonomy.

use serde::{Deserialize, Serialize};

/// Terminal (and one transient) status of a build or build step.
///
/// The numeric codes are the values persisted in the `Builds` and
/// `BuildSteps` tables; [`BuildStatus::Busy`] marks an in-flight step row
/// and is never a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// Build ran and produced its outputs
    Success,
    /// Build ran and exited non-zero
    Failed,
    /// A dependency failed; this step never ran
    DepFailed,
    /// Transport or infrastructure failure, may be retried
    Aborted,
    /// Cancelled by the user
    Cancelled,
    /// Failed but produced (partial) output
    FailedWithOutput,
    /// Exceeded the silent or wall-clock timeout
    TimedOut,
    /// A previous failure for the same derivation was cached
    CachedFailure,
    /// No live machine supports the step's system type
    Unsupported,
    /// Build log exceeded the configured limit
    LogLimitExceeded,
    /// An output NAR exceeded the configured size limit
    NarSizeLimitExceeded,
    /// Repeated builds produced differing outputs
    NotDeterministic,
    /// In flight; transient, never a terminal status
    Busy,
}

crate::simple_display! {
    BuildStatus {
        Success => "success",
        Failed => "failed",
        DepFailed => "dependency failed",
        Aborted => "aborted",
        Cancelled => "cancelled",
        FailedWithOutput => "failed with output",
        TimedOut => "timed out",
        CachedFailure => "cached failure",
        Unsupported => "unsupported system type",
        LogLimitExceeded => "log limit exceeded",
        NarSizeLimitExceeded => "NAR size limit exceeded",
        NotDeterministic => "not deterministic",
        Busy => "busy",
    }
}

impl BuildStatus {
    /// Numeric code stored in the database.
    pub fn db_code(self) -> i32 {
        match self {
            BuildStatus::Success => 0,
            BuildStatus::Failed => 1,
            BuildStatus::DepFailed => 2,
            BuildStatus::Aborted => 3,
            BuildStatus::Cancelled => 4,
            BuildStatus::FailedWithOutput => 6,
            BuildStatus::TimedOut => 7,
            BuildStatus::CachedFailure => 8,
            BuildStatus::Unsupported => 9,
            BuildStatus::LogLimitExceeded => 10,
            BuildStatus::NarSizeLimitExceeded => 11,
            BuildStatus::NotDeterministic => 12,
            BuildStatus::Busy => 100,
        }
    }

    /// Parse a database status code.
    pub fn from_db_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => BuildStatus::Success,
            1 => BuildStatus::Failed,
            2 => BuildStatus::DepFailed,
            3 => BuildStatus::Aborted,
            4 => BuildStatus::Cancelled,
            6 => BuildStatus::FailedWithOutput,
            7 => BuildStatus::TimedOut,
            8 => BuildStatus::CachedFailure,
            9 => BuildStatus::Unsupported,
            10 => BuildStatus::LogLimitExceeded,
            11 => BuildStatus::NarSizeLimitExceeded,
            12 => BuildStatus::NotDeterministic,
            100 => BuildStatus::Busy,
            _ => return None,
        })
    }

    /// The status recorded on a *build* when one of its steps finishes
    /// with this status. Step-level cached failures surface as plain
    /// failures at build level.
    pub fn at_build_level(self) -> Self {
        match self {
            BuildStatus::CachedFailure => BuildStatus::Failed,
            other => other,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, BuildStatus::Success)
    }
}

/// Phase of an in-flight build step, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Preparing,
    Connecting,
    SendingInputs,
    Building,
    ReceivingOutputs,
    PostProcessing,
}

crate::simple_display! {
    StepPhase {
        Preparing => "preparing",
        Connecting => "connecting",
        SendingInputs => "sending inputs",
        Building => "building",
        ReceivingOutputs => "receiving outputs",
        PostProcessing => "post-processing",
    }
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
