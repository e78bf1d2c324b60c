// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! kiln-daemon: the queue runner of the kiln build cluster.
//!
//! The daemon drains pending builds from the database, expands them
//! into dependency graphs of steps, dispatches runnable steps to build
//! machines under fair-share and priority policy, and records results
//! back into the database.

pub mod config;
pub mod lifecycle;
pub mod scheduler;

pub use config::{Config, ConfigError};
pub use lifecycle::{force_unlock, prepare_dirs, GlobalLock, LifecycleError};
pub use scheduler::{
    parse_machines, ActiveStep, DispatchOutcome, MachineFileError, MachineReservation, Scheduler,
    SchedulerError, StatusDump, SystemTypeInfo,
};

#[cfg(any(test, feature = "test-support"))]
pub use scheduler::test_support::TestScheduler;
