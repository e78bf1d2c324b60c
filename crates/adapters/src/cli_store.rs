// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Destination store driven through the local `nix-store`/`nix` CLI.

use crate::process::run;
use async_trait::async_trait;
use kiln_core::{Derivation, StorePath};
use kiln_store::{Nar, Store, StoreError};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// [`Store`] implementation shelling out to the Nix command line on the
/// machine the daemon runs on.
#[derive(Clone)]
pub struct CliStore {
    /// Directory the GC root symlinks are created under.
    roots_dir: PathBuf,
}

impl CliStore {
    pub fn new(roots_dir: PathBuf) -> Self {
        Self { roots_dir }
    }

    async fn nix_store(
        &self,
        args: Vec<String>,
        stdin: Option<&[u8]>,
    ) -> Result<crate::process::CommandOutput, StoreError> {
        let output = run("nix-store", &args, stdin).await?;
        if !output.success() {
            return Err(StoreError::Other(format!(
                "nix-store {} failed with code {}: {}",
                args.first().map(String::as_str).unwrap_or(""),
                output.exit_code,
                output.stderr
            )));
        }
        Ok(output)
    }

    async fn references(&self, path: &StorePath) -> Result<BTreeSet<StorePath>, StoreError> {
        let output = self
            .nix_store(
                vec!["--query".to_string(), "--references".to_string(), path.0.clone()],
                None,
            )
            .await?;
        Ok(output.stdout_lines().into_iter().map(StorePath::new).collect())
    }
}

#[async_trait]
impl Store for CliStore {
    async fn query_valid_paths(
        &self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeSet<StorePath>, StoreError> {
        if paths.is_empty() {
            return Ok(BTreeSet::new());
        }
        let mut args =
            vec!["--check-validity".to_string(), "--print-invalid".to_string()];
        args.extend(paths.iter().map(|p| p.0.clone()));
        let output = self.nix_store(args, None).await?;
        let invalid: BTreeSet<StorePath> =
            output.stdout_lines().into_iter().map(StorePath::new).collect();
        Ok(paths.iter().filter(|p| !invalid.contains(*p)).cloned().collect())
    }

    async fn read_derivation(&self, drv_path: &StorePath) -> Result<Derivation, StoreError> {
        let args: Vec<String> =
            ["derivation", "show", drv_path.as_str()].iter().map(|s| s.to_string()).collect();
        let output = run("nix", &args, None).await?;
        if !output.success() {
            return Err(StoreError::InvalidDerivation(drv_path.clone(), output.stderr));
        }
        let json: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| StoreError::InvalidDerivation(drv_path.clone(), e.to_string()))?;
        parse_derivation_json(drv_path, &json)
    }

    async fn compute_closure(
        &self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeSet<StorePath>, StoreError> {
        if paths.is_empty() {
            return Ok(BTreeSet::new());
        }
        let mut args = vec!["--query".to_string(), "--requisites".to_string()];
        args.extend(paths.iter().map(|p| p.0.clone()));
        let output = self.nix_store(args, None).await?;
        Ok(output.stdout_lines().into_iter().map(StorePath::new).collect())
    }

    async fn export_paths(&self, paths: &BTreeSet<StorePath>) -> Result<Vec<Nar>, StoreError> {
        let mut nars = Vec::with_capacity(paths.len());
        for path in paths {
            let output = self
                .nix_store(vec!["--export".to_string(), path.0.clone()], None)
                .await?;
            let references = self.references(path).await?;
            nars.push(Nar {
                path: path.clone(),
                nar_size: output.stdout.len() as u64,
                data: output.stdout,
                references,
            });
        }
        Ok(nars)
    }

    async fn import_paths(&self, nars: Vec<Nar>) -> Result<(), StoreError> {
        for nar in nars {
            self.nix_store(vec!["--import".to_string()], Some(&nar.data)).await?;
        }
        Ok(())
    }

    async fn add_root(&self, path: &StorePath) -> Result<(), StoreError> {
        let root = self.roots_dir.join(path.base_name());
        self.nix_store(
            vec![
                "--add-root".to_string(),
                root.display().to_string(),
                "--realise".to_string(),
                path.0.clone(),
            ],
            None,
        )
        .await?;
        Ok(())
    }
}

/// Parse the `nix derivation show` JSON for one derivation.
///
/// Accepts both the old (`"inputDrvs": {"…": ["out"]}`) and new
/// (`"inputDrvs": {"…": {"outputs": ["out"]}}`) encodings.
pub(crate) fn parse_derivation_json(
    drv_path: &StorePath,
    json: &serde_json::Value,
) -> Result<Derivation, StoreError> {
    let invalid = |msg: &str| StoreError::InvalidDerivation(drv_path.clone(), msg.to_string());

    let entry = json
        .get(drv_path.as_str())
        .or_else(|| json.as_object().and_then(|o| o.values().next()))
        .ok_or_else(|| invalid("no derivation entry in output"))?;

    let mut outputs = BTreeMap::new();
    if let Some(map) = entry.get("outputs").and_then(|v| v.as_object()) {
        for (name, value) in map {
            let path = value
                .get("path")
                .and_then(|p| p.as_str())
                .ok_or_else(|| invalid("output without path"))?;
            outputs.insert(name.clone(), StorePath::new(path));
        }
    }

    let mut input_drvs = BTreeMap::new();
    if let Some(map) = entry.get("inputDrvs").and_then(|v| v.as_object()) {
        for (path, value) in map {
            let names = value
                .as_array()
                .or_else(|| value.get("outputs").and_then(|o| o.as_array()))
                .ok_or_else(|| invalid("unrecognized inputDrvs encoding"))?;
            let names: BTreeSet<String> =
                names.iter().filter_map(|n| n.as_str().map(str::to_string)).collect();
            input_drvs.insert(StorePath::new(path.as_str()), names);
        }
    }

    let input_srcs: BTreeSet<StorePath> = entry
        .get("inputSrcs")
        .and_then(|v| v.as_array())
        .map(|srcs| {
            srcs.iter().filter_map(|s| s.as_str().map(StorePath::new)).collect()
        })
        .unwrap_or_default();

    let env = entry.get("env");
    let env_str = |key: &str| -> Option<String> {
        env.and_then(|e| e.get(key)).and_then(|v| v.as_str()).map(str::to_string)
    };

    let required_system_features = env_str("requiredSystemFeatures")
        .map(|features| features.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    let prefer_local_build =
        matches!(env_str("preferLocalBuild").as_deref(), Some("1") | Some("true"));

    Ok(Derivation {
        platform: entry
            .get("system")
            .and_then(|v| v.as_str())
            .ok_or_else(|| invalid("missing system"))?
            .to_string(),
        builder: entry.get("builder").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        outputs,
        input_drvs,
        input_srcs,
        required_system_features,
        prefer_local_build,
    })
}

#[cfg(test)]
#[path = "cli_store_tests.rs"]
mod tests;
