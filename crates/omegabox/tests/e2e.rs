//! End-to-end runs of the supervisor binary.
//!
//! These exercise the full fork/supervise/meta pipeline through
//! `--disable-sandboxing`, which needs no privileges: the meta record
//! grammar and verdict reconciliation are identical to the sandboxed path.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

fn omegabox() -> Command {
    Command::new(env!("CARGO_BIN_EXE_omegabox"))
}

/// Parse a meta record, asserting the fixed key order.
fn parse_meta(path: &Path) -> HashMap<String, String> {
    let text = std::fs::read_to_string(path).expect("meta file should exist");
    let lines: Vec<&str> = text.lines().collect();
    assert!(
        lines.len() >= 5,
        "meta record should have 4 accounting keys and a verdict: {text:?}"
    );
    for (i, key) in ["time", "time-sys", "time-wall", "mem"].iter().enumerate() {
        let (k, _) = lines[i].split_once(':').expect("key:value line");
        assert_eq!(&k, key, "accounting keys must be in fixed order: {text:?}");
    }

    let mut map = HashMap::new();
    for line in &lines {
        let (k, v) = line.split_once(':').expect("key:value line");
        map.insert(k.to_string(), v.to_string());
    }
    map
}

#[test]
fn true_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let meta_path = dir.path().join("meta");

    let status = omegabox()
        .args(["--disable-sandboxing", "--meta"])
        .arg(&meta_path)
        .args(["--", "/bin/true"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(0));

    let meta = parse_meta(&meta_path);
    assert_eq!(meta.get("status").map(String::as_str), Some("0"));
    assert!(!meta.contains_key("signal"));
}

#[test]
fn exit_code_is_propagated() {
    let dir = tempfile::tempdir().unwrap();
    let meta_path = dir.path().join("meta");

    let status = omegabox()
        .args(["--disable-sandboxing", "--meta"])
        .arg(&meta_path)
        .args(["--", "/bin/sh", "-c", "exit 7"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(7));

    let meta = parse_meta(&meta_path);
    assert_eq!(meta.get("status").map(String::as_str), Some("7"));
}

#[test]
fn wall_clock_deadline_reports_sigxcpu() {
    let dir = tempfile::tempdir().unwrap();
    let meta_path = dir.path().join("meta");

    let status = omegabox()
        .args(["--disable-sandboxing", "--wall-time-limit", "300", "--meta"])
        .arg(&meta_path)
        .args(["--", "/bin/sh", "-c", "while :; do :; done"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(libc::SIGXCPU));

    let meta = parse_meta(&meta_path);
    assert_eq!(meta.get("signal").map(String::as_str), Some("SIGXCPU"));
    assert!(!meta.contains_key("status"));
}

#[test]
fn file_size_limit_reports_sigxfsz() {
    let dir = tempfile::tempdir().unwrap();
    let meta_path = dir.path().join("meta");
    let out_path = dir.path().join("out");

    let status = omegabox()
        .args(["--disable-sandboxing", "--rlimit", "FSIZE=65536"])
        .args(["--wall-time-limit", "10000"])
        .arg("--meta")
        .arg(&meta_path)
        .arg("--stdout")
        .arg(&out_path)
        .args(["--", "/bin/sh", "-c", "while :; do echo xxxxxxxxxxxxxxxx; done"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(libc::SIGXFSZ));

    let meta = parse_meta(&meta_path);
    assert_eq!(meta.get("signal").map(String::as_str), Some("SIGXFSZ"));
    // The kernel stopped the file at the limit.
    assert!(std::fs::metadata(&out_path).unwrap().len() <= 65536);
}

#[test]
fn stdout_redirection_is_byte_exact() {
    let dir = tempfile::tempdir().unwrap();
    let meta_path = dir.path().join("meta");
    let out_path = dir.path().join("out");

    let status = omegabox()
        .args(["--disable-sandboxing", "--meta"])
        .arg(&meta_path)
        .arg("--stdout")
        .arg(&out_path)
        .args(["--", "/bin/sh", "-c", "head -c 4096 /dev/zero"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(0));
    assert_eq!(std::fs::metadata(&out_path).unwrap().len(), 4096);
}

#[test]
fn stdout_redirection_truncates_stale_content() {
    let dir = tempfile::tempdir().unwrap();
    let meta_path = dir.path().join("meta");
    let out_path = dir.path().join("out");
    std::fs::write(&out_path, "stale content that must disappear").unwrap();

    let status = omegabox()
        .args(["--disable-sandboxing", "--meta"])
        .arg(&meta_path)
        .arg("--stdout")
        .arg(&out_path)
        .args(["--", "/bin/sh", "-c", "printf hi"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(0));
    assert_eq!(std::fs::read_to_string(&out_path).unwrap(), "hi");
}

#[test]
fn stdin_redirection_feeds_the_target() {
    let dir = tempfile::tempdir().unwrap();
    let meta_path = dir.path().join("meta");
    let in_path = dir.path().join("in");
    let out_path = dir.path().join("out");
    std::fs::write(&in_path, "41\n").unwrap();

    let status = omegabox()
        .args(["--disable-sandboxing", "--meta"])
        .arg(&meta_path)
        .arg("--stdin")
        .arg(&in_path)
        .arg("--stdout")
        .arg(&out_path)
        .args(["--", "/bin/sh", "-c", "read x; echo $((x + 1))"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(0));
    assert_eq!(std::fs::read_to_string(&out_path).unwrap(), "42\n");
}

#[test]
fn fatal_signal_is_reported_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let meta_path = dir.path().join("meta");

    let status = omegabox()
        .args(["--disable-sandboxing", "--meta"])
        .arg(&meta_path)
        .args(["--", "/bin/sh", "-c", "kill -s SEGV $$"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(libc::SIGSEGV));

    let meta = parse_meta(&meta_path);
    assert_eq!(meta.get("signal").map(String::as_str), Some("SIGSEGV"));
}

#[test]
fn missing_target_is_a_setup_failure() {
    let status = omegabox()
        .args(["--disable-sandboxing"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn meta_timing_keys_are_numeric() {
    let dir = tempfile::tempdir().unwrap();
    let meta_path = dir.path().join("meta");

    omegabox()
        .args(["--disable-sandboxing", "--meta"])
        .arg(&meta_path)
        .args(["--", "/bin/true"])
        .status()
        .unwrap();

    let meta = parse_meta(&meta_path);
    for key in ["time", "time-sys", "time-wall", "mem"] {
        let value: i64 = meta[key].parse().expect("numeric accounting value");
        assert!(value >= 0, "{key} must be non-negative");
    }
}
