// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::super::test_support::TestScheduler;
use kiln_core::{BuildId, BuildStatus, Clock, StorePath};
use kiln_db::NotifyRecord;
use kiln_store::{FakeBuild, ScriptedBuild};
use std::time::Duration;

#[tokio::test]
async fn single_step_build_succeeds_end_to_end() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);
    let drv = harness.add_drv("hello", &[]);
    harness.db.insert_build(harness.build_row(1, &drv));

    harness.settle().await.unwrap();

    assert_eq!(harness.db.build_status(BuildId(1)), Some(BuildStatus::Success));
    assert!(!harness.db.build_was_cached(BuildId(1)));

    // Outputs were copied back and rooted in the destination store.
    let out = StorePath::new("/nix/store/hello-out");
    assert!(harness.store.is_valid(&out));
    assert_eq!(harness.store.roots(), vec![out]);

    let rows = harness.db.step_rows(BuildId(1));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, BuildStatus::Success);
    assert_eq!(rows[0].machine, "ssh://m1");
    assert!(rows[0].log_file.as_deref().unwrap_or("").ends_with("hello"));

    // Notifications: started, step finished, build finished.
    let emitted = harness.db.emitted();
    assert!(emitted.contains(&NotifyRecord::BuildStarted(BuildId(1))));
    assert!(emitted.iter().any(|n| matches!(n, NotifyRecord::StepFinished(BuildId(1), _, _))));
    assert!(emitted.contains(&NotifyRecord::BuildFinished(BuildId(1), vec![])));

    // The graph is empty again and the machine drained.
    assert_eq!(harness.scheduler.builds.lock().len(), 0);
    assert_eq!(harness.scheduler.active_count(), 0);
    let machines = harness.scheduler.machines.lock();
    assert_eq!(machines.get("ssh://m1").unwrap().current_jobs(), 0);
}

#[tokio::test]
async fn failed_step_fails_dependent_build_with_propagation() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);
    let dep = harness.add_drv("dep", &[]);
    let top = harness.add_drv("top", &[&dep]);
    harness.hosts.script_build(dep.clone(), FakeBuild::Outcome(ScriptedBuild::failed("boom")));
    harness.db.insert_build(harness.build_row(1, &top));

    harness.settle().await.unwrap();

    assert_eq!(harness.db.build_status(BuildId(1)), Some(BuildStatus::Failed));
    // The top-level step never ran.
    assert_eq!(harness.hosts.runs().len(), 1);

    let rows = harness.db.step_rows(BuildId(1));
    let failed = rows.iter().find(|r| r.drv_path == dep).unwrap();
    assert_eq!(failed.status, BuildStatus::Failed);
    assert_eq!(failed.error_msg.as_deref(), Some("boom"));
    let dep_failed = rows.iter().find(|r| r.drv_path == top).unwrap();
    assert_eq!(dep_failed.status, BuildStatus::DepFailed);
    assert_eq!(dep_failed.propagated_from.as_ref(), Some(&dep));
}

#[tokio::test]
async fn transport_failure_schedules_retry_and_cools_machine() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);
    let drv = harness.add_drv("flaky", &[]);
    harness.hosts.script_build(drv.clone(), FakeBuild::Transport("connection reset".into()));
    harness.db.insert_build(harness.build_row(1, &drv));

    harness.settle().await.unwrap();

    // Not failed: parked for a retry, machine in backoff.
    assert_eq!(harness.db.build_status(BuildId(1)), None);
    assert_eq!(harness.scheduler.counters.snapshot().nr_retries, 1);
    {
        let machines = harness.scheduler.machines.lock();
        let machine = machines.get("ssh://m1").unwrap();
        assert!(machine.in_backoff(harness.clock.now()));
        assert_eq!(machine.current_jobs(), 0);
    }
    let rows = harness.db.step_rows(BuildId(1));
    assert_eq!(rows[0].status, BuildStatus::Aborted);

    // After the retry delay and machine cooldown, the step succeeds.
    harness.advance(Duration::from_secs(120));
    harness.settle().await.unwrap();
    assert_eq!(harness.db.build_status(BuildId(1)), Some(BuildStatus::Success));
    let rows = harness.db.step_rows(BuildId(1));
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].status, BuildStatus::Success);
}

#[tokio::test]
async fn retries_exhaust_into_permanent_failure() {
    let harness = TestScheduler::with_config(|c| {
        c.max_tries = 2;
        c.retry_interval_secs = 10;
        c.retry_backoff = 1.0;
        c.machine_cooldown_secs = 1;
    });
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);
    let drv = harness.add_drv("flaky", &[]);
    for _ in 0..3 {
        harness.hosts.script_build(drv.clone(), FakeBuild::Transport("reset".into()));
    }
    harness.db.insert_build(harness.build_row(1, &drv));

    // First attempt plus max_tries retries, each after advancing time.
    harness.settle().await.unwrap();
    harness.advance(Duration::from_secs(30));
    harness.settle().await.unwrap();
    harness.advance(Duration::from_secs(30));
    harness.settle().await.unwrap();

    assert_eq!(harness.db.build_status(BuildId(1)), Some(BuildStatus::Aborted));
    assert_eq!(harness.db.step_rows(BuildId(1)).len(), 3);
    assert_eq!(harness.scheduler.counters.snapshot().nr_retries, 2);
}

#[tokio::test]
async fn upload_failure_counts_as_transport() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);

    // A derivation with a source input that must be shipped to the
    // machine; the first upload drops the connection.
    let src = StorePath::new("/nix/store/src-tarball");
    harness.store.add_valid_path(src.clone(), []);
    let drv = {
        use kiln_core::Derivation;
        use std::collections::{BTreeMap, BTreeSet};
        let drv_path = StorePath::new("/nix/store/uploads.drv");
        harness.store.add_derivation(
            drv_path.clone(),
            Derivation {
                platform: "x86_64-linux".to_string(),
                builder: "/bin/sh".to_string(),
                outputs: BTreeMap::from([(
                    "out".to_string(),
                    StorePath::new("/nix/store/uploads-out"),
                )]),
                input_srcs: BTreeSet::from([src.clone()]),
                ..Derivation::default()
            },
        );
        drv_path
    };
    harness.hosts.fail_imports("ssh://m1", 1);
    harness.db.insert_build(harness.build_row(1, &drv));

    harness.settle().await.unwrap();
    assert_eq!(harness.db.build_status(BuildId(1)), None);
    assert_eq!(harness.scheduler.counters.snapshot().nr_retries, 1);

    harness.advance(Duration::from_secs(120));
    harness.settle().await.unwrap();

    assert_eq!(harness.db.build_status(BuildId(1)), Some(BuildStatus::Success));
    // The retry shipped the source before building.
    assert!(harness.hosts.store_for("ssh://m1").is_valid(&src));
}

#[tokio::test]
async fn non_deterministic_build_fails_permanently() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);
    let drv = harness.add_drv("wobbly", &[]);
    harness.hosts.script_build(
        drv.clone(),
        FakeBuild::Outcome(ScriptedBuild {
            is_non_deterministic: true,
            times_built: 2,
            ..ScriptedBuild::default()
        }),
    );
    harness.db.insert_build(harness.build_row(1, &drv));

    harness.settle().await.unwrap();

    assert_eq!(harness.db.build_status(BuildId(1)), Some(BuildStatus::NotDeterministic));
    let rows = harness.db.step_rows(BuildId(1));
    assert_eq!(rows[0].status, BuildStatus::NotDeterministic);
}

#[tokio::test]
async fn successful_step_charges_the_jobset() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);
    let drv = harness.add_drv("hello", &[]);
    harness.db.insert_build(harness.build_row(1, &drv));

    harness.settle().await.unwrap();

    let jobsets = harness.scheduler.jobsets.lock();
    let jobset = jobsets.get(&kiln_core::JobsetName::new("tests", "trunk")).unwrap();
    // The fake host reports sixty seconds per build.
    assert_eq!(jobset.seconds(), 60);
}

#[tokio::test]
async fn db_failure_during_finish_orphans_the_row() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);
    let drv = harness.add_drv("hello", &[]);
    harness.db.insert_build(harness.build_row(1, &drv));
    harness.scheduler.queue_pass().await.unwrap();

    let outcome = harness.scheduler.dispatch_pass().await;
    assert_eq!(outcome.dispatched, 1);
    // Let the step-row insert and started-notification through, then
    // fail the finishing write.
    harness.db.fail_ops_after(2, 1);
    for handle in outcome.started {
        let _ = handle.await;
    }

    assert_eq!(harness.scheduler.orphaned_steps.lock().len(), 1);
    // The next monitor pass repairs the row.
    harness.settle().await.unwrap();
    assert!(harness.scheduler.orphaned_steps.lock().is_empty());
}

#[tokio::test]
async fn cancelled_step_releases_machine_and_row() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);
    let drv = harness.add_drv("sleepy", &[]);
    harness.hosts.script_build(drv.clone(), FakeBuild::Hang);
    harness.db.insert_build(harness.build_row(1, &drv));

    harness.scheduler.queue_pass().await.unwrap();
    let outcome = harness.scheduler.dispatch_pass().await;
    assert_eq!(outcome.dispatched, 1);
    tokio::task::yield_now().await;
    assert_eq!(harness.scheduler.active_count(), 1);

    // The frontend cancels the build; the monitor reacts.
    harness.db.cancel_build(BuildId(1));
    harness.drain_notifications().await.unwrap();

    for handle in outcome.started {
        let _ = handle.await;
    }

    assert_eq!(harness.scheduler.active_count(), 0);
    assert_eq!(harness.db.build_status(BuildId(1)), Some(BuildStatus::Cancelled));
    let rows = harness.db.step_rows(BuildId(1));
    assert_eq!(rows[0].status, BuildStatus::Cancelled);
    let machines = harness.scheduler.machines.lock();
    assert_eq!(machines.get("ssh://m1").unwrap().current_jobs(), 0);
}

#[tokio::test]
async fn send_lock_timeout_requeues_the_step() {
    let harness = TestScheduler::with_config(|c| c.send_lock_timeout_secs = 1);
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 2)]);
    let drv = harness.add_drv("blocked", &[]);
    harness.db.insert_build(harness.build_row(1, &drv));

    // Hold the machine's send lock so the builder cannot acquire it.
    let lock = {
        let machines = harness.scheduler.machines.lock();
        machines.get("ssh://m1").unwrap().send_lock.clone()
    };
    let guard = lock.clone().lock_owned().await;

    harness.scheduler.queue_pass().await.unwrap();
    let outcome = harness.scheduler.dispatch_pass().await;
    assert_eq!(outcome.dispatched, 1);
    for handle in outcome.started {
        let _ = handle.await;
    }

    // Requeued, not failed; the attempt row records the aborted send.
    assert_eq!(harness.db.build_status(BuildId(1)), None);
    assert_eq!(harness.scheduler.runnable_count(), 1);
    let rows = harness.db.step_rows(BuildId(1));
    assert_eq!(rows[0].status, BuildStatus::Aborted);

    drop(guard);
    harness.settle().await.unwrap();
    assert_eq!(harness.db.build_status(BuildId(1)), Some(BuildStatus::Success));
}
