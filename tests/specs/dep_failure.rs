// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A permanently failing dependency fails the build; the dependent step
//! never runs.

use kiln_core::{BuildId, BuildStatus};
use kiln_daemon::TestScheduler;
use kiln_store::{FakeBuild, ScriptedBuild};

#[tokio::test]
async fn dependency_failure_propagates_to_the_build() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);

    let d2 = harness.add_drv("d2", &[]);
    let d1 = harness.add_drv("d1", &[&d2]);
    harness.hosts.script_build(d2.clone(), FakeBuild::Outcome(ScriptedBuild::failed("exit 1")));
    harness.db.insert_build(harness.build_row(1, &d1));

    harness.settle().await.unwrap();

    // D1 was never dispatched.
    let runs = harness.hosts.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].0, d2);

    assert_eq!(harness.db.build_status(BuildId(1)), Some(BuildStatus::Failed));

    let rows = harness.db.step_rows(BuildId(1));
    let failed = rows.iter().find(|r| r.drv_path == d2).unwrap();
    assert_eq!(failed.status, BuildStatus::Failed);
    assert_eq!(failed.error_msg.as_deref(), Some("exit 1"));

    // The never-run step records where the failure came from.
    let dep_failed = rows.iter().find(|r| r.drv_path == d1).unwrap();
    assert_eq!(dep_failed.status, BuildStatus::DepFailed);
    assert_eq!(dep_failed.propagated_from.as_ref(), Some(&d2));

    // The whole graph was torn down.
    let status = harness.scheduler.status();
    assert_eq!(status.nr_builds, 0);
    assert_eq!(status.nr_steps, 0);
    assert_eq!(status.nr_runnable, 0);
}

#[tokio::test]
async fn failure_of_a_shared_dep_fails_every_dependent_build() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);

    let lib = harness.add_drv("lib", &[]);
    let app_a = harness.add_drv("app-a", &[&lib]);
    let app_b = harness.add_drv("app-b", &[&lib]);
    harness.hosts.script_build(lib.clone(), FakeBuild::Outcome(ScriptedBuild::failed("boom")));
    harness.db.insert_build(harness.build_row(1, &app_a));
    harness.db.insert_build(harness.build_row(2, &app_b));

    harness.settle().await.unwrap();

    assert_eq!(harness.hosts.runs().len(), 1);
    assert_eq!(harness.db.build_status(BuildId(1)), Some(BuildStatus::Failed));
    assert_eq!(harness.db.build_status(BuildId(2)), Some(BuildStatus::Failed));

    // Both builds carry a DepFailed row for their own top level.
    for id in [1, 2] {
        let rows = harness.db.step_rows(BuildId(id));
        assert!(rows
            .iter()
            .any(|r| r.status == BuildStatus::DepFailed
                && r.propagated_from.as_ref() == Some(&lib)));
    }
}
