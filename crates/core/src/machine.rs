// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Build machine: immutable identity plus shared mutable health state.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identity of a machine as parsed from the machine-list file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub store_uri: String,
    pub system_types: BTreeSet<String>,
    pub ssh_key: Option<String>,
    pub max_jobs: u32,
    /// Relative speed used to break ties between equally-loaded machines.
    /// Stored ×1000 to stay `Eq`-comparable across reload diffs.
    pub speed_factor_milli: u32,
    pub supported_features: BTreeSet<String>,
    pub mandatory_features: BTreeSet<String>,
    pub public_host_key: Option<String>,
}

/// Transport health of a machine.
#[derive(Debug, Clone, Default)]
pub struct ConnectInfo {
    pub last_failure: Option<Instant>,
    pub disabled_until: Option<Instant>,
    pub consecutive_failures: u32,
}

/// Mutable per-machine scheduling state. Shared by `Arc` so a reloaded
/// machine list carries health and job counts over.
#[derive(Debug)]
pub struct MachineState {
    /// Cleared when the machine disappears from the machine list; a
    /// disabled machine is dropped once its last job finishes.
    enabled: AtomicBool,
    current_jobs: AtomicU32,
    pub nr_steps_done: AtomicU64,
    pub total_step_time: AtomicU64,
    idle_since: Mutex<Instant>,
    connect_info: Mutex<ConnectInfo>,
}

/// A remote build machine.
#[derive(Debug)]
pub struct Machine {
    pub spec: MachineSpec,
    pub state: Arc<MachineState>,
    /// Serializes closure uploads to this machine; at most one
    /// `import_paths` per machine at a time.
    pub send_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Machine {
    pub fn new(spec: MachineSpec, now: Instant) -> Self {
        Self {
            spec,
            state: Arc::new(MachineState {
                enabled: AtomicBool::new(true),
                current_jobs: AtomicU32::new(0),
                nr_steps_done: AtomicU64::new(0),
                total_step_time: AtomicU64::new(0),
                idle_since: Mutex::new(now),
                connect_info: Mutex::new(ConnectInfo::default()),
            }),
            send_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Rebuild a machine from a reloaded spec, keeping the existing
    /// state and send lock.
    pub fn with_state(
        spec: MachineSpec,
        state: Arc<MachineState>,
        send_lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        state.enabled.store(true, Ordering::Release);
        Self { spec, state, send_lock }
    }

    pub fn speed_factor(&self) -> f64 {
        self.spec.speed_factor_milli as f64 / 1000.0
    }

    pub fn enabled(&self) -> bool {
        self.state.enabled.load(Ordering::Acquire)
    }

    pub fn disable(&self) {
        self.state.enabled.store(false, Ordering::Release);
    }

    pub fn current_jobs(&self) -> u32 {
        self.state.current_jobs.load(Ordering::Acquire)
    }

    /// Free job slots.
    pub fn free_slots(&self) -> u32 {
        self.spec.max_jobs.saturating_sub(self.current_jobs())
    }

    /// Load ratio in `[0, 1]` for machine choice.
    pub fn load(&self) -> f64 {
        self.current_jobs() as f64 / self.spec.max_jobs.max(1) as f64
    }

    pub fn idle_since(&self) -> Instant {
        *self.state.idle_since.lock()
    }

    /// Atomically claim a job slot; never exceeds `max_jobs`.
    pub fn try_reserve_slot(&self) -> bool {
        self.state
            .current_jobs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |jobs| {
                (jobs < self.spec.max_jobs).then_some(jobs + 1)
            })
            .is_ok()
    }

    /// Release a job slot, stamping `idle_since` when the machine drains.
    pub fn release_slot(&self, now: Instant) {
        let before = self.state.current_jobs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "slot release without reservation");
        if before <= 1 {
            *self.state.idle_since.lock() = now;
        }
    }

    /// Capability match (§ capability matching): platform, feature sets,
    /// and the `local` sentinel. Does not consider load or backoff.
    pub fn supports(
        &self,
        platform: &str,
        required_features: &BTreeSet<String>,
        prefer_local_build: bool,
    ) -> bool {
        if !self.spec.system_types.contains(platform) {
            return false;
        }
        for feature in &self.spec.mandatory_features {
            let satisfied = required_features.contains(feature)
                || (feature == "local" && prefer_local_build);
            if !satisfied {
                return false;
            }
        }
        required_features.iter().all(|f| self.spec.supported_features.contains(f))
    }

    /// Whether the machine is currently cooling down after failures.
    pub fn in_backoff(&self, now: Instant) -> bool {
        match self.state.connect_info.lock().disabled_until {
            Some(until) => now < until,
            None => false,
        }
    }

    /// Full eligibility for dispatch: capabilities plus health.
    pub fn available_for(
        &self,
        platform: &str,
        required_features: &BTreeSet<String>,
        prefer_local_build: bool,
        now: Instant,
    ) -> bool {
        self.enabled()
            && !self.in_backoff(now)
            && self.supports(platform, required_features, prefer_local_build)
    }

    /// Record a transport-level failure: doubles the cooldown per
    /// consecutive failure, capped. Returns the cooldown applied.
    pub fn note_failure(&self, now: Instant, base_cooldown: Duration) -> Duration {
        let mut info = self.state.connect_info.lock();
        let exponent = info.consecutive_failures.min(6);
        let cooldown = base_cooldown * 2u32.saturating_pow(exponent);
        info.consecutive_failures += 1;
        info.last_failure = Some(now);
        info.disabled_until = Some(now + cooldown);
        cooldown
    }

    /// Record a successful connection, clearing the backoff.
    pub fn note_success(&self) {
        let mut info = self.state.connect_info.lock();
        info.consecutive_failures = 0;
        info.disabled_until = None;
    }

    pub fn connect_info(&self) -> ConnectInfo {
        self.state.connect_info.lock().clone()
    }
}

#[cfg(test)]
#[path = "machine_tests.rs"]
mod tests;
