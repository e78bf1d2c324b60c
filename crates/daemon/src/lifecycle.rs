// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon lifecycle: state directories and the global advisory lock.

use crate::config::Config;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("another queue runner holds the lock at {0}")]
    Contended(PathBuf),

    #[error("failed to acquire lock at {0}: {1}")]
    Lock(PathBuf, std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exclusive advisory lock held for the daemon's lifetime; only one
/// queue runner may drain a given database.
#[derive(Debug)]
pub struct GlobalLock {
    path: PathBuf,
    // NOTE(lifetime): held to maintain the exclusive flock; released on drop
    #[allow(dead_code)]
    file: File,
}

impl GlobalLock {
    /// Acquire the lock, writing our pid into the lock file.
    pub fn acquire(path: &Path) -> Result<Self, LifecycleError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| LifecycleError::Lock(path.to_path_buf(), e))?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(LifecycleError::Contended(path.to_path_buf()));
            }
            Err(e) => return Err(LifecycleError::Lock(path.to_path_buf(), e)),
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { path: path.to_path_buf(), file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for GlobalLock {
    fn drop(&mut self) {
        // Lock releases with the descriptor; removing the file keeps
        // stale-pid confusion out of `--unlock`.
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Force-release a lock left behind by a crashed daemon (`--unlock`).
pub fn force_unlock(path: &Path) -> Result<bool, LifecycleError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Create the on-disk directories the daemon writes into.
pub fn prepare_dirs(config: &Config) -> Result<(), LifecycleError> {
    std::fs::create_dir_all(&config.state_dir)?;
    std::fs::create_dir_all(config.roots_dir())?;
    std::fs::create_dir_all(config.logs_dir())?;
    Ok(())
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
