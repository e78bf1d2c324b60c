// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A `builds_bumped` notification reorders the queue.

use kiln_core::{BuildId, StorePath};
use kiln_daemon::TestScheduler;

async fn run_one_round(harness: &TestScheduler) -> Vec<(StorePath, String)> {
    let outcome = harness.scheduler.dispatch_pass().await;
    for handle in outcome.started {
        let _ = handle.await;
    }
    harness.hosts.runs()
}

#[tokio::test]
async fn bumped_build_jumps_the_queue() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);

    // Build 1 sits behind a hundred higher-priority builds.
    let low = harness.add_drv("low", &[]);
    let mut low_row = harness.build_row(1, &low);
    low_row.local_priority = 0;
    harness.db.insert_build(low_row);
    for i in 2..=101u64 {
        let drv = harness.add_drv(&format!("bulk{i}"), &[]);
        let mut row = harness.build_row(i, &drv);
        row.local_priority = 10;
        harness.db.insert_build(row);
    }
    harness.scheduler.queue_pass().await.unwrap();

    // Without the bump the bulk builds win the slot.
    let runs = run_one_round(&harness).await;
    assert_eq!(runs.len(), 1);
    assert_ne!(runs[0].0, low);

    // Raise build 1's global priority; the monitor re-propagates.
    harness.db.bump_build(BuildId(1), 100);
    harness.drain_notifications().await.unwrap();

    // The very next dispatch picks build 1's step.
    let runs = run_one_round(&harness).await;
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].0, low);
}

#[tokio::test]
async fn priorities_order_steps_within_a_jobset() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);

    let first = harness.add_drv("first", &[]);
    let second = harness.add_drv("second", &[]);
    let third = harness.add_drv("third", &[]);

    let mut row_second = harness.build_row(5, &second);
    row_second.local_priority = 5;
    let mut row_first = harness.build_row(9, &first);
    row_first.global_priority = 1;
    let row_third = harness.build_row(3, &third);

    harness.db.insert_build(row_second);
    harness.db.insert_build(row_first);
    harness.db.insert_build(row_third);
    harness.scheduler.queue_pass().await.unwrap();

    // Global priority first, then local priority, then lowest id.
    let mut order = Vec::new();
    for _ in 0..3 {
        let runs = run_one_round(&harness).await;
        order = runs.into_iter().map(|(drv, _)| drv).collect();
    }
    assert_eq!(order, vec![first, second, third]);
}
