// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! kiln-db: the logical database contract of the queue runner.
//!
//! The SQL schema and its migrations live outside this workspace; this
//! crate defines the operations the scheduler needs ([`Database`]), the
//! row and notification types, an in-memory implementation for tests,
//! and a Postgres adapter behind the `postgres` feature.

mod database;
mod types;

#[cfg(any(test, feature = "test-support"))]
mod memory;

#[cfg(feature = "postgres")]
mod postgres;

pub use database::{Database, DbError};
pub use types::{BuildRow, Notification, StepRowUpdate};

#[cfg(any(test, feature = "test-support"))]
pub use memory::{MemoryDb, NotifyRecord, StepRow};

#[cfg(feature = "postgres")]
pub use postgres::PgDatabase;
