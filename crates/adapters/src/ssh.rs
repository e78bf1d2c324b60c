// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Build hosts reached over ssh.
//!
//! Each operation of the remote protocol is bridged onto a `nix-store`
//! invocation on the far side. An ssh exit code of 255 is a transport
//! failure; everything else reached the remote tool.

use crate::process::{run, CommandOutput};
use async_trait::async_trait;
use kiln_core::{BuildStatus, Derivation, MachineSpec, StorePath};
use kiln_store::{BuildHost, BuildOptions, BuildOutcome, HostError, Hosts, Nar};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

const SSH_EXIT_TRANSPORT: i32 = 255;

/// Factory opening [`SshHost`] connections.
#[derive(Clone, Default)]
pub struct SshHosts {
    /// Seconds ssh waits for the TCP connection.
    pub connect_timeout: u32,
}

impl SshHosts {
    pub fn new() -> Self {
        Self { connect_timeout: 20 }
    }
}

#[async_trait]
impl Hosts for SshHosts {
    type Host = SshHost;

    async fn connect(&self, machine: &MachineSpec) -> Result<SshHost, HostError> {
        let host = SshHost {
            target: strip_uri_scheme(&machine.store_uri).to_string(),
            uri: machine.store_uri.clone(),
            ssh_key: machine.ssh_key.clone(),
            connect_timeout: if self.connect_timeout == 0 { 20 } else { self.connect_timeout },
        };
        // Cheap probe so connection refusals surface as connect errors
        // rather than mid-operation transport failures.
        let output = host.run_remote(&["true".to_string()], None).await?;
        if !output.success() {
            return Err(HostError::Connect { uri: host.uri.clone(), reason: output.stderr });
        }
        Ok(host)
    }
}

/// One ssh-reachable build machine.
pub struct SshHost {
    target: String,
    uri: String,
    ssh_key: Option<String>,
    connect_timeout: u32,
}

impl SshHost {
    fn ssh_args(&self, remote: &[String]) -> Vec<String> {
        let mut args = vec![
            "-x".to_string(),
            "-a".to_string(),
            "-oBatchMode=yes".to_string(),
            format!("-oConnectTimeout={}", self.connect_timeout),
        ];
        if let Some(key) = &self.ssh_key {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args.push(self.target.clone());
        args.push("--".to_string());
        args.extend(remote.iter().cloned());
        args
    }

    async fn run_remote(
        &self,
        remote: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, HostError> {
        let output = run("ssh", &self.ssh_args(remote), stdin).await?;
        if output.exit_code == SSH_EXIT_TRANSPORT {
            return Err(HostError::Transport(format!("ssh to {}: {}", self.uri, output.stderr)));
        }
        Ok(output)
    }

    async fn remote_references(
        &self,
        path: &StorePath,
    ) -> Result<BTreeSet<StorePath>, HostError> {
        let cmd = vec![
            "nix-store".to_string(),
            "--query".to_string(),
            "--references".to_string(),
            path.0.clone(),
        ];
        let output = self.run_remote(&cmd, None).await?;
        Ok(output.stdout_lines().into_iter().map(StorePath::new).collect())
    }
}

#[async_trait]
impl BuildHost for SshHost {
    async fn query_valid_paths(
        &self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeSet<StorePath>, HostError> {
        if paths.is_empty() {
            return Ok(BTreeSet::new());
        }
        let mut cmd = vec![
            "nix-store".to_string(),
            "--check-validity".to_string(),
            "--print-invalid".to_string(),
        ];
        cmd.extend(paths.iter().map(|p| p.0.clone()));
        let output = self.run_remote(&cmd, None).await?;
        let invalid: BTreeSet<StorePath> =
            output.stdout_lines().into_iter().map(StorePath::new).collect();
        Ok(paths.iter().filter(|p| !invalid.contains(*p)).cloned().collect())
    }

    async fn import_paths(&self, nars: Vec<Nar>) -> Result<(), HostError> {
        for nar in nars {
            let cmd = vec!["nix-store".to_string(), "--import".to_string()];
            let output = self.run_remote(&cmd, Some(&nar.data)).await?;
            if !output.success() {
                return Err(HostError::Transport(format!(
                    "import of {} failed: {}",
                    nar.path, output.stderr
                )));
            }
        }
        Ok(())
    }

    async fn build_derivation(
        &self,
        drv_path: &StorePath,
        _drv: &Derivation,
        options: &BuildOptions,
    ) -> Result<BuildOutcome, HostError> {
        let mut cmd = vec![
            "nix-store".to_string(),
            "--realise".to_string(),
            drv_path.0.clone(),
            "--quiet".to_string(),
        ];
        if options.max_silent_time > 0 {
            cmd.push("--max-silent-time".to_string());
            cmd.push(options.max_silent_time.to_string());
        }
        if options.build_timeout > 0 {
            cmd.push("--timeout".to_string());
            cmd.push(options.build_timeout.to_string());
        }

        let start_time = epoch_now();
        let output = self.run_remote(&cmd, None).await?;
        let mut status = classify_build_exit(output.exit_code);
        let mut times_built = 1;
        let mut is_non_deterministic = false;

        // Determinism repeats: rebuild with --check and compare outputs.
        if status.is_success() && options.repeats > 0 {
            for _ in 0..options.repeats {
                let check = vec![
                    "nix-store".to_string(),
                    "--realise".to_string(),
                    drv_path.0.clone(),
                    "--check".to_string(),
                ];
                let check_output = self.run_remote(&check, None).await?;
                times_built += 1;
                if check_output.exit_code == NIX_EXIT_CHECK_MISMATCH {
                    is_non_deterministic = true;
                    status = BuildStatus::NotDeterministic;
                    break;
                }
            }
        }
        let stop_time = epoch_now();

        Ok(BuildOutcome {
            status,
            error_msg: if status.is_success() { String::new() } else { output.stderr },
            times_built,
            is_non_deterministic,
            start_time,
            stop_time,
        })
    }

    async fn export_paths(&self, paths: &BTreeSet<StorePath>) -> Result<Vec<Nar>, HostError> {
        let mut nars = Vec::with_capacity(paths.len());
        for path in paths {
            let cmd = vec!["nix-store".to_string(), "--export".to_string(), path.0.clone()];
            let output = self.run_remote(&cmd, None).await?;
            if !output.success() {
                return Err(HostError::Transport(format!(
                    "export of {} failed: {}",
                    path, output.stderr
                )));
            }
            let references = self.remote_references(path).await?;
            nars.push(Nar {
                path: path.clone(),
                nar_size: output.stdout.len() as u64,
                data: output.stdout,
                references,
            });
        }
        Ok(nars)
    }
}

const NIX_EXIT_BUILD_FAILED: i32 = 100;
const NIX_EXIT_TIMED_OUT: i32 = 101;
const NIX_EXIT_CHECK_MISMATCH: i32 = 102;

/// Map a remote `nix-store --realise` exit code onto a step status.
fn classify_build_exit(exit_code: i32) -> BuildStatus {
    match exit_code {
        0 => BuildStatus::Success,
        NIX_EXIT_BUILD_FAILED => BuildStatus::Failed,
        NIX_EXIT_TIMED_OUT => BuildStatus::TimedOut,
        NIX_EXIT_CHECK_MISMATCH => BuildStatus::NotDeterministic,
        _ => BuildStatus::Aborted,
    }
}

/// `ssh://user@host` or bare `user@host` to the ssh target.
fn strip_uri_scheme(uri: &str) -> &str {
    uri.strip_prefix("ssh-ng://").or_else(|| uri.strip_prefix("ssh://")).unwrap_or(uri)
}

fn epoch_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

#[cfg(test)]
#[path = "ssh_tests.rs"]
mod tests;
