// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A machine dropping the connection mid-upload: the step is requeued
//! with a delay, the machine cools down, and the retry succeeds.

use kiln_core::{BuildId, BuildStatus, Derivation, StorePath};
use kiln_daemon::TestScheduler;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

fn drv_with_source(harness: &TestScheduler, name: &str, src: &StorePath) -> StorePath {
    let drv_path = StorePath::new(format!("/nix/store/{name}.drv"));
    harness.store.add_derivation(
        drv_path.clone(),
        Derivation {
            platform: "x86_64-linux".to_string(),
            builder: "/bin/sh".to_string(),
            outputs: BTreeMap::from([(
                "out".to_string(),
                StorePath::new(format!("/nix/store/{name}-out")),
            )]),
            input_srcs: BTreeSet::from([src.clone()]),
            ..Derivation::default()
        },
    );
    drv_path
}

#[tokio::test]
async fn dropped_upload_is_retried_after_cooldown() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);

    let src = StorePath::new("/nix/store/sources");
    harness.store.add_valid_path(src.clone(), []);
    let drv = drv_with_source(&harness, "uploads", &src);
    harness.hosts.fail_imports("ssh://m1", 1);
    harness.db.insert_build(harness.build_row(1, &drv));

    harness.settle().await.unwrap();

    // Requeued, not failed; the machine is cooling down.
    assert_eq!(harness.db.build_status(BuildId(1)), None);
    assert_eq!(harness.scheduler.runnable_count(), 1);
    let status = harness.scheduler.status();
    assert_eq!(status.counters.nr_retries, 1);
    assert_eq!(status.machines[0].consecutive_failures, 1);
    assert_eq!(status.machines[0].current_jobs, 0);
    let rows = harness.db.step_rows(BuildId(1));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, BuildStatus::Aborted);

    // Nothing moves before the retry interval elapses.
    let outcome = harness.scheduler.dispatch_pass().await;
    assert_eq!(outcome.dispatched, 0);

    // After the delay and the cooldown the step runs and succeeds.
    harness.advance(Duration::from_secs(120));
    harness.settle().await.unwrap();

    assert_eq!(harness.db.build_status(BuildId(1)), Some(BuildStatus::Success));
    let status = harness.scheduler.status();
    assert_eq!(status.counters.nr_retries, 1);
    assert_eq!(status.machines[0].consecutive_failures, 0);
    assert_eq!(harness.hosts.runs().len(), 1);
    assert!(harness.hosts.store_for("ssh://m1").is_valid(&src));
}

#[tokio::test]
async fn refused_connections_back_the_machine_off_exponentially() {
    let harness = TestScheduler::with_config(|c| {
        c.retry_interval_secs = 10;
        c.retry_backoff = 1.0;
        c.machine_cooldown_secs = 30;
    });
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);
    let drv = harness.add_drv("hello", &[]);
    harness.hosts.fail_connects("ssh://m1", 2);
    harness.db.insert_build(harness.build_row(1, &drv));

    // First failure: thirty-second cooldown.
    harness.settle().await.unwrap();
    assert_eq!(harness.scheduler.status().machines[0].consecutive_failures, 1);

    // Second failure: the cooldown doubles.
    harness.advance(Duration::from_secs(31));
    harness.settle().await.unwrap();
    assert_eq!(harness.scheduler.status().machines[0].consecutive_failures, 2);

    // Thirty seconds is not enough any more.
    harness.advance(Duration::from_secs(31));
    let outcome = harness.scheduler.dispatch_pass().await;
    assert_eq!(outcome.dispatched, 0);

    // Sixty is.
    harness.advance(Duration::from_secs(30));
    harness.settle().await.unwrap();
    assert_eq!(harness.db.build_status(BuildId(1)), Some(BuildStatus::Success));
}
