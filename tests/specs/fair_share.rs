// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fair-share scheduling between jobsets with unequal shares.

use kiln_core::JobsetName;
use kiln_daemon::TestScheduler;

#[tokio::test]
async fn shares_govern_dispatch_ratio() {
    let harness = TestScheduler::new();
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 1)]);

    harness.db.set_jobset_shares(JobsetName::new("tests", "a"), 1);
    harness.db.set_jobset_shares(JobsetName::new("tests", "b"), 3);

    // Ten independent builds per jobset, jobset A holding the lower ids.
    for i in 1..=10u64 {
        let drv = harness.add_drv(&format!("a{i}"), &[]);
        let mut row = harness.build_row(i, &drv);
        row.jobset = "a".to_string();
        harness.db.insert_build(row);
    }
    for i in 11..=20u64 {
        let drv = harness.add_drv(&format!("b{i}"), &[]);
        let mut row = harness.build_row(i, &drv);
        row.jobset = "b".to_string();
        harness.db.insert_build(row);
    }
    harness.scheduler.queue_pass().await.unwrap();

    // Four sequential dispatches on the single slot; every step runs
    // for the same sixty seconds.
    for _ in 0..4 {
        let outcome = harness.scheduler.dispatch_pass().await;
        assert_eq!(outcome.dispatched, 1);
        for handle in outcome.started {
            let _ = handle.await;
        }
    }

    let runs = harness.hosts.runs();
    assert_eq!(runs.len(), 4);
    let a_runs = runs.iter().filter(|(drv, _)| drv.name().starts_with('a')).count();
    let b_runs = runs.iter().filter(|(drv, _)| drv.name().starts_with('b')).count();
    // One share against three: jobset A gets one of the first four
    // slots, jobset B the other three.
    assert_eq!(a_runs, 1);
    assert_eq!(b_runs, 3);

    // Share usage reflects the weights.
    let status = harness.scheduler.status();
    let share = |jobset: &str| {
        status
            .jobsets
            .iter()
            .find(|j| j.jobset == jobset)
            .map(|j| j.share_used)
            .unwrap_or_default()
    };
    assert!(share("a") >= share("b"));
}
