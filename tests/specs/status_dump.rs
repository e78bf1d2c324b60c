// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `dump_status` notification writes a JSON snapshot of the
//! scheduler next to the daemon state.

use kiln_core::BuildId;
use kiln_daemon::TestScheduler;
use kiln_db::Database;

#[tokio::test]
async fn dump_status_writes_a_json_snapshot() {
    let state_dir = tempfile::tempdir().unwrap();
    let harness = TestScheduler::with_config(|c| c.state_dir = state_dir.path().to_path_buf());
    harness.set_machines(vec![TestScheduler::machine("ssh://m1", 4)]);

    let drv = harness.add_drv("hello", &[]);
    harness.db.insert_build(harness.build_row(1, &drv));
    harness.settle().await.unwrap();

    harness.db.notify_dump_status().await.unwrap();
    harness.drain_notifications().await.unwrap();

    let content = std::fs::read_to_string(state_dir.path().join("status.json")).unwrap();
    let status: serde_json::Value = serde_json::from_str(&content).unwrap();

    assert_eq!(status["counters"]["nr_builds_done"], 1);
    assert_eq!(status["counters"]["nr_steps_done"], 1);
    assert_eq!(status["machines"][0]["store_uri"], "ssh://m1");
    assert_eq!(status["machines"][0]["max_jobs"], 4);
    assert_eq!(status["jobsets"][0]["project"], "tests");

    // The same snapshot round-trips through the typed form.
    let typed: kiln_daemon::StatusDump = serde_json::from_str(&content).unwrap();
    assert_eq!(typed.counters.nr_builds_done, 1);
    assert_eq!(harness.db.build_status(BuildId(1)).map(|s| s.is_success()), Some(true));
}
