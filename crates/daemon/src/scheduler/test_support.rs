// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness: a scheduler over the in-memory database, store and
//! hosts, driven pass by pass under a fake clock.

use super::Scheduler;
use crate::config::Config;
use kiln_core::{BuildId, Clock, Derivation, FakeClock, MachineSpec, StorePath};
use kiln_db::{BuildRow, Database, MemoryDb};
use kiln_store::{FakeHosts, MemoryStore};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// A fully-faked scheduler plus handles to its collaborators.
pub struct TestScheduler {
    pub scheduler: Arc<Scheduler<MemoryDb, MemoryStore, FakeHosts, FakeClock>>,
    pub db: MemoryDb,
    pub store: MemoryStore,
    pub hosts: FakeHosts,
    pub clock: FakeClock,
}

impl TestScheduler {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(customize: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config {
            state_dir: std::env::temp_dir().join("kiln-test"),
            this_system: "x86_64-linux".to_string(),
            ..Config::default()
        };
        customize(&mut config);
        let db = MemoryDb::new();
        let store = MemoryStore::new();
        let hosts = FakeHosts::new();
        let clock = FakeClock::new();
        let scheduler =
            Scheduler::new(config, db.clone(), store.clone(), hosts.clone(), clock.clone());
        Self { scheduler, db, store, hosts, clock }
    }

    /// Install machines directly, replacing the current list.
    pub fn set_machines(&self, specs: Vec<MachineSpec>) {
        self.scheduler.install_machines(specs);
    }

    /// Drive the monitor and dispatcher until nothing moves: drain
    /// notifications, run a queue pass, dispatch, and wait for every
    /// launched builder. Deferred retries stay parked until the fake
    /// clock is advanced.
    pub async fn settle(&self) -> Result<(), super::SchedulerError> {
        loop {
            while let Ok(Some(notification)) = self.db.next_notification(Duration::ZERO).await {
                self.scheduler.handle_notification(notification).await?;
            }
            self.scheduler.queue_pass().await?;
            let outcome = self.scheduler.dispatch_pass().await;
            let dispatched = outcome.dispatched;
            for handle in outcome.started {
                let _ = handle.await;
            }
            if dispatched == 0 {
                return Ok(());
            }
        }
    }

    /// Like [`TestScheduler::settle`] but swallowing pass errors, for
    /// tests that inject database failures.
    pub async fn settle_lossy(&self) {
        loop {
            while let Ok(Some(notification)) = self.db.next_notification(Duration::ZERO).await {
                let _ = self.scheduler.handle_notification(notification).await;
            }
            let _ = self.scheduler.queue_pass().await;
            let outcome = self.scheduler.dispatch_pass().await;
            let dispatched = outcome.dispatched;
            for handle in outcome.started {
                let _ = handle.await;
            }
            if dispatched == 0 {
                return;
            }
        }
    }

    /// Apply every queued notification without running a pass.
    pub async fn drain_notifications(&self) -> Result<(), super::SchedulerError> {
        while let Ok(Some(notification)) = self.db.next_notification(Duration::ZERO).await {
            self.scheduler.handle_notification(notification).await?;
        }
        Ok(())
    }

    /// Advance the fake clock.
    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// A pending build row over the given derivation.
    pub fn build_row(&self, id: u64, drv_path: &StorePath) -> BuildRow {
        BuildRow {
            id: BuildId(id),
            drv_path: drv_path.clone(),
            project: "tests".to_string(),
            jobset: "trunk".to_string(),
            job: format!("job-{id}"),
            timestamp: self.clock.epoch_secs(),
            max_silent_time: 0,
            build_timeout: 0,
            local_priority: 0,
            global_priority: 0,
        }
    }

    /// Register a derivation with one `out` output and the given
    /// dependency derivations; returns its path.
    pub fn add_drv(&self, name: &str, deps: &[&StorePath]) -> StorePath {
        let drv_path = StorePath::new(format!("/nix/store/{name}.drv"));
        let mut input_drvs = BTreeMap::new();
        for dep in deps {
            input_drvs.insert((*dep).clone(), BTreeSet::from(["out".to_string()]));
        }
        let drv = Derivation {
            platform: "x86_64-linux".to_string(),
            builder: "/bin/sh".to_string(),
            outputs: BTreeMap::from([(
                "out".to_string(),
                StorePath::new(format!("/nix/store/{name}-out")),
            )]),
            input_drvs,
            ..Derivation::default()
        };
        self.store.add_derivation(drv_path.clone(), drv);
        drv_path
    }

    /// One-slot `x86_64-linux` machine spec.
    pub fn machine(uri: &str, max_jobs: u32) -> MachineSpec {
        MachineSpec {
            store_uri: uri.to_string(),
            system_types: BTreeSet::from(["x86_64-linux".to_string()]),
            ssh_key: None,
            max_jobs,
            speed_factor_milli: 1000,
            supported_features: BTreeSet::new(),
            mandatory_features: BTreeSet::new(),
            public_host_key: None,
        }
    }
}

impl Default for TestScheduler {
    fn default() -> Self {
        Self::new()
    }
}
