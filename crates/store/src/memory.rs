// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory store and build hosts for tests.

use crate::host::{BuildHost, BuildOptions, BuildOutcome, HostError, Hosts};
use crate::store::{Nar, Store, StoreError};
use async_trait::async_trait;
use kiln_core::{BuildStatus, Derivation, MachineSpec, StorePath};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

#[derive(Default)]
struct MemoryStoreState {
    /// Valid path to its references.
    valid: BTreeMap<StorePath, BTreeSet<StorePath>>,
    derivations: BTreeMap<StorePath, Derivation>,
    roots: Vec<StorePath>,
}

/// In-memory [`Store`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parseable derivation.
    pub fn add_derivation(&self, drv_path: impl Into<StorePath>, drv: Derivation) {
        self.inner.lock().derivations.insert(drv_path.into(), drv);
    }

    /// Register a valid path with its references.
    pub fn add_valid_path(
        &self,
        path: impl Into<StorePath>,
        references: impl IntoIterator<Item = StorePath>,
    ) {
        self.inner.lock().valid.insert(path.into(), references.into_iter().collect());
    }

    pub fn is_valid(&self, path: &StorePath) -> bool {
        self.inner.lock().valid.contains_key(path)
    }

    /// GC roots registered via [`Store::add_root`].
    pub fn roots(&self) -> Vec<StorePath> {
        self.inner.lock().roots.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn query_valid_paths(
        &self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeSet<StorePath>, StoreError> {
        let state = self.inner.lock();
        Ok(paths.iter().filter(|p| state.valid.contains_key(*p)).cloned().collect())
    }

    async fn read_derivation(&self, drv_path: &StorePath) -> Result<Derivation, StoreError> {
        self.inner
            .lock()
            .derivations
            .get(drv_path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(drv_path.clone()))
    }

    async fn compute_closure(
        &self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeSet<StorePath>, StoreError> {
        let state = self.inner.lock();
        let mut closure = BTreeSet::new();
        let mut queue: VecDeque<StorePath> = paths.iter().cloned().collect();
        while let Some(path) = queue.pop_front() {
            if !closure.insert(path.clone()) {
                continue;
            }
            if let Some(references) = state.valid.get(&path) {
                queue.extend(references.iter().cloned());
            }
        }
        Ok(closure)
    }

    async fn export_paths(&self, paths: &BTreeSet<StorePath>) -> Result<Vec<Nar>, StoreError> {
        let state = self.inner.lock();
        paths
            .iter()
            .map(|path| {
                let references = state
                    .valid
                    .get(path)
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(path.clone()))?;
                Ok(Nar {
                    path: path.clone(),
                    nar_size: 1,
                    data: path.as_str().as_bytes().to_vec(),
                    references,
                })
            })
            .collect()
    }

    async fn import_paths(&self, nars: Vec<Nar>) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        for nar in nars {
            state.valid.insert(nar.path, nar.references);
        }
        Ok(())
    }

    async fn add_root(&self, path: &StorePath) -> Result<(), StoreError> {
        self.inner.lock().roots.push(path.clone());
        Ok(())
    }
}

/// A scripted outcome for one `build_derivation` call.
#[derive(Debug, Clone)]
pub struct ScriptedBuild {
    pub status: BuildStatus,
    pub error_msg: String,
    pub times_built: u32,
    pub is_non_deterministic: bool,
    pub duration_secs: u64,
}

impl Default for ScriptedBuild {
    fn default() -> Self {
        Self {
            status: BuildStatus::Success,
            error_msg: String::new(),
            times_built: 1,
            is_non_deterministic: false,
            duration_secs: 60,
        }
    }
}

impl ScriptedBuild {
    pub fn failed(error_msg: impl Into<String>) -> Self {
        Self { status: BuildStatus::Failed, error_msg: error_msg.into(), ..Self::default() }
    }

    pub fn with_duration(duration_secs: u64) -> Self {
        Self { duration_secs, ..Self::default() }
    }
}

/// Behavior of one scripted `build_derivation` call.
#[derive(Debug, Clone)]
pub enum FakeBuild {
    Outcome(ScriptedBuild),
    /// Fail at the transport level before the build starts.
    Transport(String),
    /// Never return; used to exercise cancellation.
    Hang,
}

struct FakeHostsState {
    stores: HashMap<String, MemoryStore>,
    builds: HashMap<StorePath, VecDeque<FakeBuild>>,
    connect_failures: HashMap<String, u32>,
    import_failures: HashMap<String, u32>,
    /// `(drv_path, store_uri)` per completed build call, in order.
    runs: Vec<(StorePath, String)>,
    next_epoch: i64,
}

impl Default for FakeHostsState {
    fn default() -> Self {
        Self {
            stores: HashMap::new(),
            builds: HashMap::new(),
            connect_failures: HashMap::new(),
            import_failures: HashMap::new(),
            runs: Vec::new(),
            next_epoch: 1_000_000,
        }
    }
}

/// Fake build-host factory with scriptable failures.
#[derive(Clone, Default)]
pub struct FakeHosts {
    inner: Arc<Mutex<FakeHostsState>>,
}

impl FakeHosts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a scripted behavior for the next build of `drv_path`.
    /// Unscripted builds succeed with [`ScriptedBuild::default`].
    pub fn script_build(&self, drv_path: impl Into<StorePath>, build: FakeBuild) {
        self.inner.lock().builds.entry(drv_path.into()).or_default().push_back(build);
    }

    /// Make the next `n` connections to `uri` fail.
    pub fn fail_connects(&self, uri: impl Into<String>, n: u32) {
        self.inner.lock().connect_failures.insert(uri.into(), n);
    }

    /// Make the next `n` imports into `uri` fail mid-transfer.
    pub fn fail_imports(&self, uri: impl Into<String>, n: u32) {
        self.inner.lock().import_failures.insert(uri.into(), n);
    }

    /// Completed build calls as `(drv_path, store_uri)`, in order.
    pub fn runs(&self) -> Vec<(StorePath, String)> {
        self.inner.lock().runs.clone()
    }

    /// The remote store of one machine, created on first use.
    pub fn store_for(&self, uri: &str) -> MemoryStore {
        self.inner.lock().stores.entry(uri.to_string()).or_default().clone()
    }

    fn next_interval(&self, duration_secs: u64) -> (i64, i64) {
        let mut state = self.inner.lock();
        let start = state.next_epoch;
        let stop = start + duration_secs as i64;
        state.next_epoch = stop;
        (start, stop)
    }

    fn take_scripted(&self, drv_path: &StorePath) -> FakeBuild {
        self.inner
            .lock()
            .builds
            .get_mut(drv_path)
            .and_then(VecDeque::pop_front)
            .unwrap_or(FakeBuild::Outcome(ScriptedBuild::default()))
    }
}

#[async_trait]
impl Hosts for FakeHosts {
    type Host = FakeHost;

    async fn connect(&self, machine: &MachineSpec) -> Result<FakeHost, HostError> {
        {
            let mut state = self.inner.lock();
            if let Some(left) = state.connect_failures.get_mut(&machine.store_uri) {
                if *left > 0 {
                    *left -= 1;
                    return Err(HostError::Connect {
                        uri: machine.store_uri.clone(),
                        reason: "connection refused".to_string(),
                    });
                }
            }
        }
        Ok(FakeHost { uri: machine.store_uri.clone(), hosts: self.clone() })
    }
}

/// One fake connection, backed by the shared [`FakeHosts`] state.
pub struct FakeHost {
    uri: String,
    hosts: FakeHosts,
}

impl FakeHost {
    fn store(&self) -> MemoryStore {
        self.hosts.store_for(&self.uri)
    }
}

fn transport(e: StoreError) -> HostError {
    HostError::Transport(e.to_string())
}

#[async_trait]
impl BuildHost for FakeHost {
    async fn query_valid_paths(
        &self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeSet<StorePath>, HostError> {
        self.store().query_valid_paths(paths).await.map_err(transport)
    }

    async fn import_paths(&self, nars: Vec<Nar>) -> Result<(), HostError> {
        {
            let mut state = self.hosts.inner.lock();
            if let Some(left) = state.import_failures.get_mut(&self.uri) {
                if *left > 0 {
                    *left -= 1;
                    return Err(HostError::Transport(
                        "connection reset during import".to_string(),
                    ));
                }
            }
        }
        self.store().import_paths(nars).await.map_err(transport)
    }

    async fn build_derivation(
        &self,
        drv_path: &StorePath,
        drv: &Derivation,
        _options: &BuildOptions,
    ) -> Result<BuildOutcome, HostError> {
        let scripted = match self.hosts.take_scripted(drv_path) {
            FakeBuild::Outcome(scripted) => scripted,
            FakeBuild::Transport(reason) => return Err(HostError::Transport(reason)),
            FakeBuild::Hang => loop {
                std::future::pending::<()>().await;
            },
        };

        let (start_time, stop_time) = self.hosts.next_interval(scripted.duration_secs);
        self.hosts.inner.lock().runs.push((drv_path.clone(), self.uri.clone()));

        if scripted.status.is_success() {
            let store = self.store();
            for output in drv.outputs.values() {
                store.add_valid_path(output.clone(), []);
            }
        }

        Ok(BuildOutcome {
            status: scripted.status,
            error_msg: scripted.error_msg,
            times_built: scripted.times_built,
            is_non_deterministic: scripted.is_non_deterministic,
            start_time,
            stop_time,
        })
    }

    async fn export_paths(&self, paths: &BTreeSet<StorePath>) -> Result<Vec<Nar>, HostError> {
        self.store().export_paths(paths).await.map_err(transport)
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
