// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::super::test_support::TestScheduler;
use kiln_core::{BuildId, BuildStatus, Clock, JobsetName};
use std::collections::BTreeSet;
use std::time::Duration;

async fn run_one_round(harness: &TestScheduler) -> usize {
    harness.scheduler.queue_pass().await.unwrap();
    let outcome = harness.scheduler.dispatch_pass().await;
    let dispatched = outcome.dispatched;
    for handle in outcome.started {
        let _ = handle.await;
    }
    dispatched
}

#[tokio::test]
async fn fair_share_prefers_lowest_share_used() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);

    // Jobset "busy" has burned time; "idle" has not.
    let busy = JobsetName::new("tests", "busy");
    let idle = JobsetName::new("tests", "idle");
    harness.db.set_jobset_shares(busy.clone(), 1);
    harness.db.set_jobset_shares(idle.clone(), 1);

    let drv_busy = harness.add_drv("busy-job", &[]);
    let drv_idle = harness.add_drv("idle-job", &[]);
    let mut row_busy = harness.build_row(1, &drv_busy);
    row_busy.jobset = "busy".to_string();
    let mut row_idle = harness.build_row(2, &drv_idle);
    row_idle.jobset = "idle".to_string();
    harness.db.insert_build(row_busy);
    harness.db.insert_build(row_idle);

    // Expand without dispatching, then charge the busy jobset.
    harness.scheduler.queue_pass().await.unwrap();
    {
        let jobsets = harness.scheduler.jobsets.lock();
        jobsets.get(&busy).unwrap().add_step(0, 1_000);
    }

    let outcome = harness.scheduler.dispatch_pass().await;
    for handle in outcome.started {
        let _ = handle.await;
    }
    // One slot: the idle jobset's step must have won it.
    let runs = harness.hosts.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].0, drv_idle);
}

#[tokio::test]
async fn global_priority_beats_local_priority_and_age() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);

    let drv_old = harness.add_drv("old", &[]);
    let drv_local = harness.add_drv("local", &[]);
    let drv_global = harness.add_drv("global", &[]);

    let row_old = harness.build_row(1, &drv_old);
    let mut row_local = harness.build_row(2, &drv_local);
    row_local.local_priority = 50;
    let mut row_global = harness.build_row(3, &drv_global);
    row_global.global_priority = 10;

    harness.db.insert_build(row_old);
    harness.db.insert_build(row_local);
    harness.db.insert_build(row_global);

    assert_eq!(run_one_round(&harness).await, 1);
    assert_eq!(harness.hosts.runs()[0].0, drv_global);

    assert_eq!(run_one_round(&harness).await, 1);
    assert_eq!(harness.hosts.runs()[1].0, drv_local);

    assert_eq!(run_one_round(&harness).await, 1);
    assert_eq!(harness.hosts.runs()[2].0, drv_old);
}

#[tokio::test]
async fn machine_choice_prefers_lowest_load_then_speed() {
    let harness = TestScheduler::new();
    let slow = TestScheduler::machine("ssh://slow", 2);
    let mut fast = TestScheduler::machine("ssh://fast", 2);
    fast.speed_factor_milli = 3000;
    harness.set_machines(vec![slow, fast]);

    let drv_a = harness.add_drv("a", &[]);
    let drv_b = harness.add_drv("b", &[]);
    let drv_c = harness.add_drv("c", &[]);
    harness.db.insert_build(harness.build_row(1, &drv_a));
    harness.db.insert_build(harness.build_row(2, &drv_b));
    harness.db.insert_build(harness.build_row(3, &drv_c));

    harness.settle().await.unwrap();

    let runs = harness.hosts.runs();
    assert_eq!(runs.len(), 3);
    // Both idle: the faster machine wins the first step. Builders are
    // awaited between passes here, so every dispatch sees idle machines
    // again and keeps picking the fast one.
    assert!(runs.iter().all(|(_, uri)| uri == "ssh://fast"));
}

#[tokio::test]
async fn load_ratio_spreads_work_within_one_pass() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![
        TestScheduler::machine("ssh://m1", 1),
        TestScheduler::machine("ssh://m2", 1),
    ]);

    let drv_a = harness.add_drv("a", &[]);
    let drv_b = harness.add_drv("b", &[]);
    harness.db.insert_build(harness.build_row(1, &drv_a));
    harness.db.insert_build(harness.build_row(2, &drv_b));

    harness.scheduler.queue_pass().await.unwrap();
    let outcome = harness.scheduler.dispatch_pass().await;
    assert_eq!(outcome.dispatched, 2);
    for handle in outcome.started {
        let _ = handle.await;
    }
    let machines: BTreeSet<String> =
        harness.hosts.runs().into_iter().map(|(_, uri)| uri).collect();
    assert_eq!(machines.len(), 2);
}

#[tokio::test]
async fn reservations_never_exceed_max_jobs() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 2)]);

    for i in 1..=5 {
        let drv = harness.add_drv(&format!("job-{i}"), &[]);
        harness.db.insert_build(harness.build_row(i, &drv));
    }

    harness.scheduler.queue_pass().await.unwrap();
    let outcome = harness.scheduler.dispatch_pass().await;
    // Only two slots exist, so only two steps may dispatch in one pass.
    assert_eq!(outcome.dispatched, 2);
    for handle in outcome.started {
        let _ = handle.await;
    }
}

#[tokio::test]
async fn deferred_steps_wait_for_their_retry_time() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);
    let drv = harness.add_drv("deferred", &[]);
    harness.db.insert_build(harness.build_row(1, &drv));
    harness.scheduler.queue_pass().await.unwrap();

    // Park the step ninety seconds into the future.
    {
        let steps = harness.scheduler.steps.lock();
        let step = steps.get(&drv).and_then(|w| w.upgrade()).unwrap();
        step.state.lock().after = Some(harness.clock.now() + Duration::from_secs(90));
    }

    let outcome = harness.scheduler.dispatch_pass().await;
    assert_eq!(outcome.dispatched, 0);
    assert!(outcome.sleep <= Duration::from_secs(90));

    harness.advance(Duration::from_secs(91));
    assert_eq!(run_one_round(&harness).await, 1);
}

#[tokio::test]
async fn unsupported_steps_age_out() {
    let harness = TestScheduler::with_config(|c| c.max_unsupported_secs = 120);
    // Only an aarch64 machine exists; the step needs x86_64-linux.
    let mut machine = TestScheduler::machine("ssh://arm", 1);
    machine.system_types = BTreeSet::from(["aarch64-linux".to_string()]);
    harness.set_machines(vec![machine]);

    let drv = harness.add_drv("hello", &[]);
    harness.db.insert_build(harness.build_row(1, &drv));
    harness.settle().await.unwrap();
    assert_eq!(harness.scheduler.runnable_count(), 1);
    assert_eq!(harness.db.build_status(BuildId(1)), None);

    harness.advance(Duration::from_secs(121));
    harness.settle().await.unwrap();

    assert_eq!(harness.db.build_status(BuildId(1)), Some(BuildStatus::Unsupported));
    let rows = harness.db.step_rows(BuildId(1));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, BuildStatus::Unsupported);
    assert_eq!(harness.scheduler.runnable_count(), 0);
}

#[tokio::test]
async fn unsupported_rule_disabled_when_zero() {
    let harness = TestScheduler::with_config(|c| c.max_unsupported_secs = 0);
    harness.set_machines(vec![]);
    let drv = harness.add_drv("hello", &[]);
    harness.db.insert_build(harness.build_row(1, &drv));
    harness.settle().await.unwrap();

    harness.advance(Duration::from_secs(100_000));
    harness.settle().await.unwrap();

    // The step waits forever instead of failing.
    assert_eq!(harness.scheduler.runnable_count(), 1);
    assert_eq!(harness.db.build_status(BuildId(1)), None);
}

#[tokio::test]
async fn machines_in_backoff_are_skipped() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);
    {
        let machines = harness.scheduler.machines.lock();
        machines.get("ssh://m1").unwrap().note_failure(
            harness.clock.now(),
            Duration::from_secs(30),
        );
    }

    let drv = harness.add_drv("hello", &[]);
    harness.db.insert_build(harness.build_row(1, &drv));
    assert_eq!(run_one_round(&harness).await, 0);

    harness.advance(Duration::from_secs(31));
    assert_eq!(run_one_round(&harness).await, 1);
}

#[tokio::test]
async fn feature_requirements_partition_machines() {
    let harness = TestScheduler::new();
    let mut kvm = TestScheduler::machine("ssh://kvm", 1);
    kvm.supported_features = BTreeSet::from(["kvm".to_string()]);
    let plain = TestScheduler::machine("ssh://plain", 1);
    harness.set_machines(vec![kvm, plain]);

    let drv_path = {
        use kiln_core::{Derivation, StorePath};
        use std::collections::BTreeMap;
        let drv_path = StorePath::new("/nix/store/vm-test.drv");
        let drv = Derivation {
            platform: "x86_64-linux".to_string(),
            builder: "/bin/sh".to_string(),
            outputs: BTreeMap::from([(
                "out".to_string(),
                StorePath::new("/nix/store/vm-test-out"),
            )]),
            required_system_features: BTreeSet::from(["kvm".to_string()]),
            ..Derivation::default()
        };
        harness.store.add_derivation(drv_path.clone(), drv);
        drv_path
    };
    harness.db.insert_build(harness.build_row(1, &drv_path));
    harness.settle().await.unwrap();

    let runs = harness.hosts.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].1, "ssh://kvm");
}

#[tokio::test]
async fn dispatch_updates_system_type_stats() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);
    let drv = harness.add_drv("hello", &[]);
    harness.db.insert_build(harness.build_row(1, &drv));

    harness.settle().await.unwrap();

    let types = harness.scheduler.machine_types.lock();
    let info = types.get("x86_64-linux").unwrap();
    assert_eq!(info.running, 0);
    assert!(info.last_active > 0);
}
