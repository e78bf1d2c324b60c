// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! kiln-adapters: concrete store and host backends.
//!
//! The scheduling core only sees the `Store`/`Hosts` traits; these
//! implementations reach a real Nix installation through the `nix-store`
//! command line, locally and over ssh. The native binary wire protocol
//! is intentionally not spoken here.

mod cli_store;
mod process;
mod ssh;

pub use cli_store::CliStore;
pub use ssh::{SshHost, SshHosts};
