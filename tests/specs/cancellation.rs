// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cancelling a build interrupts its running step and frees the slot.

use kiln_core::{BuildId, BuildStatus};
use kiln_daemon::TestScheduler;
use kiln_store::FakeBuild;

#[tokio::test]
async fn cancellation_interrupts_the_running_step() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);

    let drv = harness.add_drv("endless", &[]);
    harness.hosts.script_build(drv.clone(), FakeBuild::Hang);
    harness.db.insert_build(harness.build_row(1, &drv));

    harness.scheduler.queue_pass().await.unwrap();
    let outcome = harness.scheduler.dispatch_pass().await;
    assert_eq!(outcome.dispatched, 1);
    tokio::task::yield_now().await;
    assert_eq!(harness.scheduler.active_count(), 1);

    // The frontend cancels the build; the monitor notices on the next
    // notification.
    harness.db.cancel_build(BuildId(1));
    harness.drain_notifications().await.unwrap();

    // The worker observes the cancellation and returns.
    for handle in outcome.started {
        let _ = handle.await;
    }

    assert_eq!(harness.scheduler.active_count(), 0);
    assert_eq!(harness.db.build_status(BuildId(1)), Some(BuildStatus::Cancelled));

    // Its outputs were never recorded.
    assert!(harness.db.build_outputs(BuildId(1)).is_empty());
    let rows = harness.db.step_rows(BuildId(1));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, BuildStatus::Cancelled);

    // The machine slot came back.
    let status = harness.scheduler.status();
    assert_eq!(status.machines[0].current_jobs, 0);
    assert_eq!(status.nr_builds, 0);
    assert_eq!(status.nr_active, 0);
}

#[tokio::test]
async fn cancelling_one_of_two_builds_keeps_the_shared_step() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);

    let drv = harness.add_drv("wanted", &[]);
    harness.hosts.script_build(drv.clone(), FakeBuild::Hang);
    harness.db.insert_build(harness.build_row(1, &drv));
    harness.db.insert_build(harness.build_row(2, &drv));

    harness.scheduler.queue_pass().await.unwrap();
    let outcome = harness.scheduler.dispatch_pass().await;
    assert_eq!(outcome.dispatched, 1);
    tokio::task::yield_now().await;

    // Cancel only build 1. Build 2 still needs the step, so the worker
    // keeps running.
    harness.db.cancel_build(BuildId(1));
    harness.drain_notifications().await.unwrap();
    tokio::task::yield_now().await;
    assert_eq!(harness.scheduler.active_count(), 1);

    // Cancelling the second build tears the step down.
    harness.db.cancel_build(BuildId(2));
    harness.drain_notifications().await.unwrap();
    for handle in outcome.started {
        let _ = handle.await;
    }
    assert_eq!(harness.scheduler.active_count(), 0);
}
