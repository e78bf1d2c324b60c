// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dispatcher: pairs runnable steps with eligible machines.

use super::{Scheduler, SystemTypeInfo};
use kiln_core::{BuildStatus, Clock, Counters, Machine, Step, WakeChannel};
use kiln_db::Database;
use kiln_store::{Hosts, Store};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// A paired claim on a step and one machine slot, held for the duration
/// of a builder worker. The slot is claimed before construction
/// (`Machine::try_reserve_slot`) and released on drop, on every exit
/// path, waking the dispatcher.
pub struct MachineReservation<C: Clock> {
    pub step: Arc<Step>,
    pub machine: Arc<Machine>,
    clock: C,
    wake: Arc<WakeChannel>,
}

impl<C: Clock> MachineReservation<C> {
    fn new(step: Arc<Step>, machine: Arc<Machine>, clock: C, wake: Arc<WakeChannel>) -> Self {
        Self { step, machine, clock, wake }
    }
}

impl<C: Clock> Drop for MachineReservation<C> {
    fn drop(&mut self) {
        self.machine.release_slot(self.clock.now());
        self.wake.wake();
    }
}

/// Result of one dispatcher pass.
pub struct DispatchOutcome {
    pub dispatched: usize,
    /// How long the dispatcher may sleep: until the earliest deferred
    /// retry, or the idle interval.
    pub sleep: Duration,
    /// Builder tasks launched by this pass.
    pub started: Vec<JoinHandle<()>>,
}

struct Candidate {
    step: Arc<Step>,
    share_used: f64,
    global_priority: i32,
    local_priority: i32,
    lowest_build_id: u64,
    runnable_since: Option<Instant>,
}

impl<D, S, H, C> Scheduler<D, S, H, C>
where
    D: Database,
    S: Store,
    H: Hosts,
    C: Clock,
{
    pub(crate) async fn dispatcher_loop(self: Arc<Self>) {
        let shutdown = self.shutdown_token();
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let outcome = self.dispatch_pass().await;
            // Builders run detached; completion wakes us through the
            // reservation drop.
            drop(outcome.started);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.dispatcher_wake.wait_for(outcome.sleep) => {}
            }
        }
    }

    /// One dispatcher iteration: select `(step, machine)` pairs under
    /// the scheduling policy and launch a builder per reservation.
    pub async fn dispatch_pass(self: &Arc<Self>) -> DispatchOutcome {
        Counters::incr(&self.counters.nr_dispatcher_wakeups);
        let now = self.clock.now();
        let machines: Vec<Arc<Machine>> = self.machines.lock().values().cloned().collect();

        let live: Vec<Arc<Step>> = {
            let mut runnable = self.runnable.lock();
            runnable.retain(|weak| weak.upgrade().is_some_and(|s| !s.finished()));
            runnable.iter().filter_map(Weak::upgrade).collect()
        };

        let mut sleep = self.config.dispatch_idle_interval();
        let mut candidates = Vec::new();
        let mut unsupported = Vec::new();
        let mut type_runnable: HashMap<String, u64> = HashMap::new();

        for step in live {
            let platform = step.drv.effective_platform(&self.config.this_system);
            let capable_machine_exists = machines.iter().any(|m| {
                m.enabled()
                    && m.supports(
                        platform,
                        &step.drv.required_system_features,
                        step.drv.prefer_local_build,
                    )
            });

            let mut state = step.state.lock();
            if capable_machine_exists {
                state.last_supported = now;
            } else if let Some(max_unsupported) = self.config.max_unsupported_time() {
                if now.duration_since(state.last_supported) > max_unsupported {
                    drop(state);
                    unsupported.push(step);
                    continue;
                }
            }

            *type_runnable.entry(step.system_type.clone()).or_default() += 1;

            if let Some(after) = state.after {
                if after > now {
                    sleep = sleep.min(after - now);
                    continue;
                }
            }

            candidates.push(Candidate {
                share_used: state.lowest_share_used(),
                global_priority: state.highest_global_priority,
                local_priority: state.highest_local_priority,
                lowest_build_id: state.lowest_build_id.map(|id| id.0).unwrap_or(u64::MAX),
                runnable_since: state.runnable_since,
                step: step.clone(),
            });
        }

        // Selection policy: fair share, then priorities, then age.
        candidates.sort_by(|a, b| {
            a.share_used
                .total_cmp(&b.share_used)
                .then(b.global_priority.cmp(&a.global_priority))
                .then(b.local_priority.cmp(&a.local_priority))
                .then(a.lowest_build_id.cmp(&b.lowest_build_id))
        });

        let mut started = Vec::new();
        for candidate in candidates {
            let step = &candidate.step;
            let platform = step.drv.effective_platform(&self.config.this_system);
            let Some(machine) = pick_machine(
                &machines,
                platform,
                &step.drv.required_system_features,
                step.drv.prefer_local_build,
                now,
            ) else {
                continue;
            };
            if !machine.try_reserve_slot() {
                continue;
            }
            if !self.take_runnable(step) {
                // Someone else claimed the step between snapshot and now.
                machine.release_slot(now);
                continue;
            }
            {
                let mut state = step.state.lock();
                state.runnable_since = None;
                state.after = None;
            }
            self.note_step_dispatched(&step.system_type, candidate.runnable_since, now);
            tracing::info!(
                step = %step.drv_path,
                machine = %machine.spec.store_uri,
                "dispatching step"
            );
            let reservation = MachineReservation::new(
                step.clone(),
                machine,
                self.clock.clone(),
                self.dispatcher_wake.clone(),
            );
            started.push(tokio::spawn(self.clone().run_builder(reservation)));
        }

        for step in unsupported {
            Counters::incr(&self.counters.nr_unsupported_steps);
            self.take_runnable(&step);
            tracing::warn!(
                step = %step.drv_path,
                system = %step.system_type,
                "no machine has supported this step's system type for too long"
            );
            let epoch = self.clock.epoch_secs();
            if let Some(build) =
                kiln_core::step::dependent_builds(&step).iter().min_by_key(|b| b.id)
            {
                let _ = self
                    .db
                    .create_build_step(
                        build.id,
                        &step.drv_path,
                        BuildStatus::Unsupported,
                        "",
                        epoch,
                        None,
                    )
                    .await;
            }
            self.fail_step(
                &step,
                BuildStatus::Unsupported,
                format!("machine type '{}' is not supported", step.system_type),
            )
            .await;
        }

        {
            let mut types = self.machine_types.lock();
            for info in types.values_mut() {
                info.runnable = 0;
            }
            for (system_type, runnable) in type_runnable {
                types.entry(system_type).or_default().runnable = runnable;
            }
        }

        let elapsed = self.clock.now().duration_since(now);
        Counters::add(&self.counters.dispatch_time_ms, elapsed.as_millis() as u64);
        DispatchOutcome { dispatched: started.len(), sleep, started }
    }

    fn note_step_dispatched(
        &self,
        system_type: &str,
        runnable_since: Option<Instant>,
        now: Instant,
    ) {
        let mut types = self.machine_types.lock();
        let info: &mut SystemTypeInfo = types.entry(system_type.to_string()).or_default();
        info.running += 1;
        info.last_active = self.clock.epoch_secs();
        if let Some(since) = runnable_since {
            info.wait_time_ms += now.duration_since(since).as_millis() as u64;
        }
    }

    pub(crate) fn note_step_stopped(&self, system_type: &str) {
        let mut types = self.machine_types.lock();
        types.entry(system_type.to_string()).or_default().running -= 1;
    }
}

/// Machine choice for a chosen step: lowest load ratio, then highest
/// speed factor, then longest idle.
fn pick_machine(
    machines: &[Arc<Machine>],
    platform: &str,
    required_features: &BTreeSet<String>,
    prefer_local_build: bool,
    now: Instant,
) -> Option<Arc<Machine>> {
    machines
        .iter()
        .filter(|m| {
            m.free_slots() > 0
                && m.available_for(platform, required_features, prefer_local_build, now)
        })
        .min_by(|a, b| {
            a.load()
                .total_cmp(&b.load())
                .then(b.speed_factor().total_cmp(&a.speed_factor()))
                .then(a.idle_since().cmp(&b.idle_since()))
        })
        .cloned()
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
