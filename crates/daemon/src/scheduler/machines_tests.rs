// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

const SYSTEM: &str = "x86_64-linux";

#[test]
fn full_line_parses_every_field() {
    let specs = parse_machines(
        "ssh://mac aarch64-darwin,x86_64-darwin /etc/keys/mac 4 2.5 kvm,benchmark benchmark c3NoLWtleQ==\n",
        SYSTEM,
    )
    .unwrap();
    assert_eq!(specs.len(), 1);
    let spec = &specs[0];
    assert_eq!(spec.store_uri, "ssh://mac");
    assert_eq!(
        spec.system_types,
        BTreeSet::from(["aarch64-darwin".to_string(), "x86_64-darwin".to_string()])
    );
    assert_eq!(spec.ssh_key.as_deref(), Some("/etc/keys/mac"));
    assert_eq!(spec.max_jobs, 4);
    assert_eq!(spec.speed_factor_milli, 2500);
    assert_eq!(
        spec.supported_features,
        BTreeSet::from(["kvm".to_string(), "benchmark".to_string()])
    );
    assert_eq!(spec.mandatory_features, BTreeSet::from(["benchmark".to_string()]));
    assert_eq!(spec.public_host_key.as_deref(), Some("c3NoLWtleQ=="));
}

#[test]
fn comments_and_blank_lines_are_skipped() {
    let content = "\n# fleet of one\nssh://a - - 2\n   # trailing comment line\nssh://b # inline comment\n";
    let specs = parse_machines(content, SYSTEM).unwrap();
    assert_eq!(specs.len(), 2);
    assert_eq!(specs[0].store_uri, "ssh://a");
    assert_eq!(specs[0].max_jobs, 2);
    assert_eq!(specs[1].store_uri, "ssh://b");
}

#[test]
fn missing_fields_get_defaults() {
    let specs = parse_machines("ssh://minimal\n", SYSTEM).unwrap();
    let spec = &specs[0];
    assert_eq!(spec.system_types, BTreeSet::from([SYSTEM.to_string()]));
    assert_eq!(spec.ssh_key, None);
    assert_eq!(spec.max_jobs, 1);
    assert_eq!(spec.speed_factor_milli, 1000);
    assert!(spec.supported_features.is_empty());
    assert!(spec.mandatory_features.is_empty());
    assert_eq!(spec.public_host_key, None);
}

#[test]
fn mandatory_features_are_implicitly_supported() {
    let specs = parse_machines("ssh://a - - 1 1 - benchmark\n", SYSTEM).unwrap();
    assert!(specs[0].supported_features.contains("benchmark"));
}

#[parameterized(
    bad_max_jobs = { "ssh://a - - many" },
    negative_speed = { "ssh://a - - 1 -2.0" },
    zero_speed = { "ssh://a - - 1 0" },
    bad_speed = { "ssh://a - - 1 fast" },
)]
fn invalid_numeric_fields_error(content: &str) {
    assert!(matches!(
        parse_machines(content, SYSTEM),
        Err(MachineFileError::InvalidField { line: 1, .. })
    ));
}

#[test]
fn error_reports_correct_line() {
    let content = "ssh://ok\n# comment\nssh://bad - - x\n";
    match parse_machines(content, SYSTEM) {
        Err(MachineFileError::InvalidField { line, field, .. }) => {
            assert_eq!(line, 3);
            assert_eq!(field, "maxJobs");
        }
        other => panic!("unexpected result: {:?}", other.map(|s| s.len())),
    }
}
