// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Machine registry: the machine-list file and its periodic reload.

use super::{Scheduler, SchedulerError};
use kiln_core::{Clock, Machine, MachineSpec};
use kiln_db::Database;
use kiln_store::{Hosts, Store};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MachineFileError {
    #[error("machine file line {line}: missing store URI")]
    MissingUri { line: usize },

    #[error("machine file line {line}: invalid {field}: {value:?}")]
    InvalidField { line: usize, field: &'static str, value: String },
}

/// Parse the machine-list file.
///
/// One machine per non-empty, non-comment line:
/// `storeURI systemTypes sshKey maxJobs speedFactor supportedFeatures
/// mandatoryFeatures publicHostKey`, comma-separated within list
/// fields. `-` or a missing trailing field means empty; `maxJobs` and
/// `speedFactor` default to 1. Empty system types default to
/// `default_system`.
pub fn parse_machines(
    content: &str,
    default_system: &str,
) -> Result<Vec<MachineSpec>, MachineFileError> {
    let mut specs = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = index + 1;
        let text = raw.split('#').next().unwrap_or("").trim();
        if text.is_empty() {
            continue;
        }
        let mut fields = text.split_whitespace();
        let store_uri = fields
            .next()
            .ok_or(MachineFileError::MissingUri { line })?
            .to_string();

        let system_types = match fields.next() {
            None | Some("-") | Some("") => BTreeSet::from([default_system.to_string()]),
            Some(list) => split_list(list),
        };
        let ssh_key = optional_field(fields.next());
        let max_jobs = match fields.next() {
            None | Some("-") => 1,
            Some(value) => value.parse::<u32>().map_err(|_| MachineFileError::InvalidField {
                line,
                field: "maxJobs",
                value: value.to_string(),
            })?,
        };
        let speed_factor_milli = match fields.next() {
            None | Some("-") => 1000,
            Some(value) => {
                let factor: f64 =
                    value.parse().map_err(|_| MachineFileError::InvalidField {
                        line,
                        field: "speedFactor",
                        value: value.to_string(),
                    })?;
                if factor <= 0.0 {
                    return Err(MachineFileError::InvalidField {
                        line,
                        field: "speedFactor",
                        value: value.to_string(),
                    });
                }
                (factor * 1000.0) as u32
            }
        };
        let supported_features = match fields.next() {
            None | Some("-") => BTreeSet::new(),
            Some(list) => split_list(list),
        };
        let mandatory_features = match fields.next() {
            None | Some("-") => BTreeSet::new(),
            Some(list) => split_list(list),
        };
        let public_host_key = optional_field(fields.next());

        // Mandatory features are implicitly supported.
        let supported_features =
            supported_features.union(&mandatory_features).cloned().collect();

        specs.push(MachineSpec {
            store_uri,
            system_types,
            ssh_key,
            max_jobs,
            speed_factor_milli,
            supported_features,
            mandatory_features,
            public_host_key,
        });
    }
    Ok(specs)
}

fn split_list(list: &str) -> BTreeSet<String> {
    list.split(',').filter(|item| !item.is_empty()).map(str::to_string).collect()
}

fn optional_field(field: Option<&str>) -> Option<String> {
    match field {
        None | Some("-") | Some("") => None,
        Some(value) => Some(value.to_string()),
    }
}

impl<D, S, H, C> Scheduler<D, S, H, C>
where
    D: Database,
    S: Store,
    H: Hosts,
    C: Clock,
{
    /// Periodically re-read the machine list.
    pub(crate) async fn machines_reload_loop(self: Arc<Self>) {
        let shutdown = self.shutdown_token();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.machines_reload_interval()) => {}
            }
            if let Err(e) = self.reload_machines().await {
                tracing::warn!(error = %e, "machine list reload failed; keeping previous list");
            }
        }
    }

    /// Re-read the machine file and install the diff.
    pub async fn reload_machines(&self) -> Result<(), SchedulerError> {
        let path = &self.config.machines_file;
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "machine file missing; no machines");
                String::new()
            }
            Err(e) => return Err(e.into()),
        };
        let specs = parse_machines(&content, &self.config.this_system)?;
        self.install_machines(specs);
        Ok(())
    }

    /// Diff a parsed machine list against the registry. Existing
    /// machines keep their state (health, job counts, send lock);
    /// removed machines are disabled and dropped once drained.
    pub fn install_machines(&self, specs: Vec<MachineSpec>) {
        let now = self.clock.now();
        let mut machines = self.machines.lock();
        let mut next: HashMap<String, Arc<Machine>> = HashMap::new();

        for spec in specs {
            let uri = spec.store_uri.clone();
            let machine = match machines.get(&uri) {
                Some(existing) if existing.spec == spec => existing.clone(),
                Some(existing) => {
                    tracing::info!(machine = %uri, "machine configuration changed");
                    Arc::new(Machine::with_state(
                        spec,
                        existing.state.clone(),
                        existing.send_lock.clone(),
                    ))
                }
                None => {
                    tracing::info!(machine = %uri, "adding machine");
                    Arc::new(Machine::new(spec, now))
                }
            };
            next.insert(uri, machine);
        }

        for (uri, old) in machines.iter() {
            if next.contains_key(uri) {
                continue;
            }
            old.disable();
            if old.current_jobs() > 0 {
                tracing::info!(machine = %uri, jobs = old.current_jobs(), "draining removed machine");
                next.insert(uri.clone(), old.clone());
            } else {
                tracing::info!(machine = %uri, "removing machine");
            }
        }

        *machines = next;
        drop(machines);
        self.dispatcher_wake.wake();
    }
}

#[cfg(test)]
#[path = "machines_tests.rs"]
mod tests;
