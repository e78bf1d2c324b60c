// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Status dump: a JSON snapshot of the scheduler, written on the
//! `dump_status` notification and at shutdown.

use super::Scheduler;
use kiln_core::{Clock, CountersSnapshot};
use kiln_db::Database;
use kiln_store::{Hosts, Store};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineStatus {
    pub store_uri: String,
    pub enabled: bool,
    pub current_jobs: u32,
    pub max_jobs: u32,
    pub consecutive_failures: u32,
    pub nr_steps_done: u64,
    pub total_step_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsetStatus {
    pub project: String,
    pub jobset: String,
    pub shares: u32,
    pub seconds: u64,
    pub share_used: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemTypeStatus {
    pub system_type: String,
    pub runnable: u64,
    pub running: i64,
    pub last_active: i64,
    pub wait_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveStepStatus {
    pub drv_path: String,
    pub phase: String,
}

/// Everything `--status` shows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDump {
    pub time: i64,
    pub uptime_secs: u64,
    pub nr_builds: usize,
    pub nr_steps: usize,
    pub nr_runnable: usize,
    pub nr_active: usize,
    pub counters: CountersSnapshot,
    pub machines: Vec<MachineStatus>,
    pub jobsets: Vec<JobsetStatus>,
    pub machine_types: Vec<SystemTypeStatus>,
    pub active_steps: Vec<ActiveStepStatus>,
}

impl<D, S, H, C> Scheduler<D, S, H, C>
where
    D: Database,
    S: Store,
    H: Hosts,
    C: Clock,
{
    /// Assemble the status snapshot.
    pub fn status(&self) -> StatusDump {
        let machines = {
            let machines = self.machines.lock();
            let mut list: Vec<MachineStatus> = machines
                .values()
                .map(|m| MachineStatus {
                    store_uri: m.spec.store_uri.clone(),
                    enabled: m.enabled(),
                    current_jobs: m.current_jobs(),
                    max_jobs: m.spec.max_jobs,
                    consecutive_failures: m.connect_info().consecutive_failures,
                    nr_steps_done: m.state.nr_steps_done.load(std::sync::atomic::Ordering::Relaxed),
                    total_step_time: m
                        .state
                        .total_step_time
                        .load(std::sync::atomic::Ordering::Relaxed),
                })
                .collect();
            list.sort_by(|a, b| a.store_uri.cmp(&b.store_uri));
            list
        };

        let jobsets = {
            let jobsets = self.jobsets.lock();
            let mut list: Vec<JobsetStatus> = jobsets
                .values()
                .map(|j| JobsetStatus {
                    project: j.name.project.clone(),
                    jobset: j.name.jobset.clone(),
                    shares: j.shares(),
                    seconds: j.seconds(),
                    share_used: j.share_used(),
                })
                .collect();
            list.sort_by(|a, b| (&a.project, &a.jobset).cmp(&(&b.project, &b.jobset)));
            list
        };

        let machine_types = {
            let types = self.machine_types.lock();
            let mut list: Vec<SystemTypeStatus> = types
                .iter()
                .map(|(system_type, info)| SystemTypeStatus {
                    system_type: system_type.clone(),
                    runnable: info.runnable,
                    running: info.running,
                    last_active: info.last_active,
                    wait_time_ms: info.wait_time_ms,
                })
                .collect();
            list.sort_by(|a, b| a.system_type.cmp(&b.system_type));
            list
        };

        let active_steps: Vec<ActiveStepStatus> = self
            .active_steps
            .lock()
            .iter()
            .map(|active| ActiveStepStatus {
                drv_path: active.step.drv_path.to_string(),
                phase: active.phase().to_string(),
            })
            .collect();

        StatusDump {
            time: self.clock.epoch_secs(),
            uptime_secs: self.uptime().as_secs(),
            nr_builds: self.builds.lock().len(),
            nr_steps: self.steps.lock().values().filter(|w| w.upgrade().is_some()).count(),
            nr_runnable: self.runnable_count(),
            nr_active: self.active_count(),
            counters: self.counters.snapshot(),
            machines,
            jobsets,
            machine_types,
            active_steps,
        }
    }

    /// Write the status snapshot next to the daemon state and log it.
    pub(crate) fn dump_status(&self) {
        let status = self.status();
        tracing::info!(
            builds = status.nr_builds,
            steps = status.nr_steps,
            runnable = status.nr_runnable,
            active = status.nr_active,
            machines = status.machines.len(),
            "status dump"
        );
        let path = self.config.status_file();
        match serde_json::to_vec_pretty(&status) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!(error = %e, path = %path.display(), "could not write status file");
                }
            }
            Err(e) => tracing::warn!(error = %e, "could not serialize status"),
        }
    }
}
