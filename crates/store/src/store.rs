// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Destination store interface.

use async_trait::async_trait;
use kiln_core::{Derivation, StorePath};
use std::collections::BTreeSet;
use thiserror::Error;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("path not found in store: {0}")]
    NotFound(StorePath),

    #[error("invalid derivation {0}: {1}")]
    InvalidDerivation(StorePath, String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Other(String),
}

/// A serialized store path: archive bytes plus registration metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nar {
    pub path: StorePath,
    pub references: BTreeSet<StorePath>,
    pub nar_size: u64,
    pub data: Vec<u8>,
}

/// The destination store the queue runner realizes outputs into.
///
/// Selected at construction; the scheduling core holds one value of an
/// implementing type for the whole process.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    /// The subset of `paths` that is present and valid.
    async fn query_valid_paths(
        &self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeSet<StorePath>, StoreError>;

    /// Parse the derivation at `drv_path`.
    async fn read_derivation(&self, drv_path: &StorePath) -> Result<Derivation, StoreError>;

    /// The transitive closure of `paths` under store references.
    async fn compute_closure(
        &self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeSet<StorePath>, StoreError>;

    /// Serialize `paths` for transfer to a remote machine.
    async fn export_paths(&self, paths: &BTreeSet<StorePath>) -> Result<Vec<Nar>, StoreError>;

    /// Register imported paths as valid.
    async fn import_paths(&self, nars: Vec<Nar>) -> Result<(), StoreError>;

    /// Register a garbage-collection root keeping `path` alive.
    async fn add_root(&self, path: &StorePath) -> Result<(), StoreError>;
}
