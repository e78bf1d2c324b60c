// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Named wake channels for cross-task signalling.
//!
//! A `WakeChannel` carries no data: wakes issued while nobody is waiting
//! coalesce into a single stored wakeup, consumed by the next wait. One
//! task waits per channel (the dispatcher on `dispatcher_wake`, the queue
//! monitor on `queue_wake`); any task may wake.

use std::time::Duration;
use tokio::sync::Notify;

/// Outcome of a timed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Woken,
    TimedOut,
}

#[derive(Debug, Default)]
pub struct WakeChannel {
    notify: Notify,
}

impl WakeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the waiter. Multiple wakes between waits collapse to one.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Wait until woken.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Wait until woken or until `timeout` elapses.
    pub async fn wait_for(&self, timeout: Duration) -> Wait {
        match tokio::time::timeout(timeout, self.notify.notified()).await {
            Ok(()) => Wait::Woken,
            Err(_) => Wait::TimedOut,
        }
    }
}

#[cfg(test)]
#[path = "wake_tests.rs"]
mod tests;
