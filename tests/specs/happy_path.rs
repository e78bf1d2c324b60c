// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A two-step build runs both steps in dependency order on one machine.

use kiln_core::{BuildId, BuildStatus};
use kiln_daemon::TestScheduler;

#[tokio::test]
async fn two_step_build_completes_in_order() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);

    let d2 = harness.add_drv("d2", &[]);
    let d1 = harness.add_drv("d1", &[&d2]);
    harness.db.insert_build(harness.build_row(1, &d1));

    harness.settle().await.unwrap();

    // D2 ran first, then D1, both on M1.
    let runs = harness.hosts.runs();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0], (d2.clone(), "ssh://m1".to_string()));
    assert_eq!(runs[1], (d1.clone(), "ssh://m1".to_string()));

    assert_eq!(harness.db.build_status(BuildId(1)), Some(BuildStatus::Success));

    let status = harness.scheduler.status();
    assert_eq!(status.counters.nr_builds_done, 1);
    assert_eq!(status.counters.nr_steps_done, 2);
    assert_eq!(status.nr_builds, 0);
    assert_eq!(status.nr_runnable, 0);
    assert_eq!(status.nr_active, 0);

    // Both step rows are recorded against the build.
    let rows = harness.db.step_rows(BuildId(1));
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.status == BuildStatus::Success));
}

#[tokio::test]
async fn a_step_shared_by_two_builds_runs_once() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 2)]);

    // Two builds of the same derivation share the in-flight step.
    let drv = harness.add_drv("shared", &[]);
    harness.db.insert_build(harness.build_row(1, &drv));
    harness.db.insert_build(harness.build_row(2, &drv));

    harness.settle().await.unwrap();

    assert_eq!(harness.hosts.runs().len(), 1);
    assert_eq!(harness.db.build_status(BuildId(1)), Some(BuildStatus::Success));
    assert_eq!(harness.db.build_status(BuildId(2)), Some(BuildStatus::Success));

    // Each completion notification names the other finished build.
    use kiln_db::NotifyRecord;
    let emitted = harness.db.emitted();
    assert!(emitted.contains(&NotifyRecord::BuildFinished(BuildId(1), vec![BuildId(2)])));
    assert!(emitted.contains(&NotifyRecord::BuildFinished(BuildId(2), vec![BuildId(1)])));
}
