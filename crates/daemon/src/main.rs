// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! kilnd: the kiln queue runner daemon.

use anyhow::Context;
use clap::Parser;
use kiln_adapters::{CliStore, SshHosts};
use kiln_daemon::{force_unlock, prepare_dirs, Config, GlobalLock, LifecycleError, Scheduler};
use kiln_db::{Database, PgDatabase};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const EXIT_OK: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_LOCK_CONTENTION: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "kilnd", about = "Queue runner for the kiln build cluster")]
struct Args {
    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Build only the given build id, then exit (testing aid).
    #[arg(long, value_name = "ID")]
    build_one: Option<u64>,

    /// Ask a running instance to dump its status and print it.
    #[arg(long)]
    status: bool,

    /// Force-release the global lock left by a crashed instance.
    #[arg(long)]
    unlock: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("kilnd: {e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<u8> {
    let mut config = Config::load(args.config.as_deref())?;
    config.build_one = args.build_one;

    if args.unlock {
        return unlock(&config);
    }
    if args.status {
        return status(&config).await;
    }

    // The guard flushes the file appender when the daemon exits.
    let _log_guard = init_tracing(&config)?;

    let lock = match GlobalLock::acquire(&config.lock_file()) {
        Ok(lock) => lock,
        Err(LifecycleError::Contended(path)) => {
            eprintln!("kilnd: another instance holds the lock at {}", path.display());
            return Ok(EXIT_LOCK_CONTENTION);
        }
        Err(e) => return Err(e.into()),
    };
    prepare_dirs(&config)?;

    let db = PgDatabase::connect(&config.db_url, config.max_db_connections)
        .await
        .context("connecting to the database")?;
    let store = CliStore::new(config.roots_dir());
    let hosts = SshHosts::new();
    let scheduler =
        Scheduler::new(config, db, store, hosts, kiln_core::SystemClock);

    // Shut down cleanly on SIGINT/SIGTERM.
    {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::error!(error = %e, "could not install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            tracing::info!("termination signal received");
            scheduler.shutdown();
        });
    }

    scheduler.run().await?;
    drop(lock);

    if args.build_one.is_some() {
        return Ok(match scheduler.build_one_status() {
            Some(status) if status.is_success() => EXIT_OK,
            _ => EXIT_FAILURE,
        });
    }
    Ok(EXIT_OK)
}

fn unlock(config: &Config) -> anyhow::Result<u8> {
    if force_unlock(&config.lock_file())? {
        println!("released lock at {}", config.lock_file().display());
    } else {
        println!("no lock to release");
    }
    Ok(EXIT_OK)
}

/// Ask the running daemon (through the database notification channel)
/// for a status dump, then print the freshly-written status file.
async fn status(config: &Config) -> anyhow::Result<u8> {
    let db = PgDatabase::connect(&config.db_url, 1)
        .await
        .context("connecting to the database")?;
    db.notify_dump_status().await.context("requesting status dump")?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let path = config.status_file();
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    println!("{content}");
    Ok(EXIT_OK)
}

fn init_tracing(config: &Config) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&config.state_dir)?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.log_file())?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .ok();
    Ok(guard)
}
