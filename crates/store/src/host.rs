// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote build machine interface.

use crate::store::Nar;
use async_trait::async_trait;
use kiln_core::{BuildStatus, Derivation, MachineSpec, StorePath};
use std::collections::BTreeSet;
use thiserror::Error;

/// Transport-level failures. These are always retryable: the step is
/// rescheduled and the machine put into backoff.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("connecting to {uri} failed: {reason}")]
    Connect { uri: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Options passed along with a `build_derivation` request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Maximum silence on the build log before the remote aborts, seconds.
    pub max_silent_time: i32,
    /// Wall-clock limit, seconds.
    pub build_timeout: i32,
    /// Truncate the build log beyond this many bytes.
    pub max_log_size: u64,
    /// Number of extra builds used to detect non-determinism.
    pub repeats: u32,
}

/// Result of a remote `build_derivation` call that reached the builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub status: BuildStatus,
    pub error_msg: String,
    pub times_built: u32,
    pub is_non_deterministic: bool,
    /// Remote-reported execution interval, epoch seconds.
    pub start_time: i64,
    pub stop_time: i64,
}

impl BuildOutcome {
    pub fn duration_secs(&self) -> u64 {
        (self.stop_time - self.start_time).max(0) as u64
    }
}

/// One connection to a build machine.
///
/// Imports are serialized per machine by the caller (the machine's send
/// lock); builds and exports may overlap across distinct machines.
#[async_trait]
pub trait BuildHost: Send + Sync {
    /// The subset of `paths` already valid on the remote.
    async fn query_valid_paths(
        &self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeSet<StorePath>, HostError>;

    /// Upload serialized paths into the remote store.
    async fn import_paths(&self, nars: Vec<Nar>) -> Result<(), HostError>;

    /// Realize one derivation on the remote.
    async fn build_derivation(
        &self,
        drv_path: &StorePath,
        drv: &Derivation,
        options: &BuildOptions,
    ) -> Result<BuildOutcome, HostError>;

    /// Download the given paths from the remote store.
    async fn export_paths(&self, paths: &BTreeSet<StorePath>) -> Result<Vec<Nar>, HostError>;
}

/// Factory opening connections to build machines.
#[async_trait]
pub trait Hosts: Clone + Send + Sync + 'static {
    type Host: BuildHost;

    async fn connect(&self, machine: &MachineSpec) -> Result<Self::Host, HostError>;
}
