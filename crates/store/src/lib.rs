// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! kiln-store: store and build-host interfaces.
//!
//! The scheduling core never names a concrete backend; it talks to the
//! destination store through [`Store`] and to remote build machines
//! through [`Hosts`]/[`BuildHost`]. In-memory implementations for tests
//! live behind the `test-support` feature.

mod host;
mod store;

#[cfg(any(test, feature = "test-support"))]
mod memory;

pub use host::{BuildHost, BuildOptions, BuildOutcome, HostError, Hosts};
pub use store::{Nar, Store, StoreError};

#[cfg(any(test, feature = "test-support"))]
pub use memory::{FakeBuild, FakeHost, FakeHosts, MemoryStore, ScriptedBuild};
