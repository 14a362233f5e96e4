//! Golden-file tests for the `ipsec.conf` patcher
//!
//! Each case pairs `golden/<name>.conf` with `golden/<name>.<version>.conf`,
//! the expected result of patching it for that Libreswan version.

use std::fs;
use std::path::PathBuf;

use ikev2kit_common::patch::{patch_config, patch_file};
use ikev2kit_common::{Capabilities, SwanVersion};

const CASES: &[(&str, &str, usize)] = &[
    ("ipsec_legacy", "5.2", 5),
    ("ikev2_fragment_legacy", "4.12", 3),
    ("dns_apart", "4.5", 5),
];

fn golden(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/golden")
        .join(format!("{}.conf", name));
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("{}: {}", path.display(), e))
}

fn caps(version: &str) -> Capabilities {
    Capabilities::for_version(version.parse::<SwanVersion>().unwrap())
}

#[test]
fn test_golden_cases() {
    for (name, version, changes) in CASES {
        let input = golden(name);
        let expected = golden(&format!("{}.{}", name, version));

        let patched = patch_config(&input, &caps(version));
        assert_eq!(patched.text, expected, "case {} -> {}", name, version);
        assert_eq!(patched.changes, *changes, "case {} -> {}", name, version);
    }
}

#[test]
fn test_golden_outputs_are_stable() {
    for (name, version, _) in CASES {
        let expected = golden(&format!("{}.{}", name, version));
        let again = patch_config(&expected, &caps(version));
        assert_eq!(again.changes, 0, "case {} -> {}", name, version);
        assert_eq!(again.text, expected);
    }
}

#[test]
fn test_patch_file_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ipsec.conf");
    fs::write(&path, golden("ipsec_legacy")).unwrap();

    assert!(patch_file(&path, &caps("5.2")).unwrap());
    assert_eq!(fs::read_to_string(&path).unwrap(), golden("ipsec_legacy.5.2"));
    assert!(!patch_file(&path, &caps("5.2")).unwrap());
}
