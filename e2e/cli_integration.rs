//! E2E Suite 12: tdbtool as a black box
//!
//! Drives the binary through std::process::Command: argument parsing,
//! subcommand dispatch, exit codes, and output formats.

use std::path::PathBuf;
use std::process::Command;

use tempfile::TempDir;

/// Locate the `tdbtool` binary produced by Cargo.
fn tdbtool_bin() -> PathBuf {
    if let Ok(p) = std::env::var("CARGO_BIN_EXE_tdbtool") {
        return PathBuf::from(p);
    }
    let mut p = std::env::current_exe().unwrap();
    p.pop();
    if p.ends_with("deps") {
        p.pop();
    }
    p.push("tdbtool");
    p
}

fn run(db: &std::path::Path, args: &[&str]) -> std::process::Output {
    Command::new(tdbtool_bin())
        .arg(db)
        .args(args)
        .output()
        .expect("spawn tdbtool")
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: create, store, fetch, delete round trip
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_cli_round_trip() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("cli.tdb");

    assert!(run(&db, &["create"]).status.success());
    // Creating again must fail: create is exclusive.
    assert!(!run(&db, &["create"]).status.success());

    assert!(run(&db, &["store", "greeting", "hello world"]).status.success());
    let out = run(&db, &["fetch", "greeting"]);
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hello world");

    // Insert mode refuses an existing key; exit code 1.
    let out = run(&db, &["store", "greeting", "other", "--mode", "insert"]);
    assert_eq!(out.status.code(), Some(1));

    assert!(run(&db, &["exists", "greeting"]).status.success());
    assert!(run(&db, &["delete", "greeting"]).status.success());
    assert_eq!(run(&db, &["exists", "greeting"]).status.code(), Some(1));
    assert_eq!(run(&db, &["fetch", "greeting"]).status.code(), Some(1));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: dump and keys formats
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_cli_dump_and_keys() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("dump.tdb");
    for i in 0..5 {
        assert!(run(&db, &["store", &format!("key{i}"), &format!("value{i}")])
            .status
            .success());
    }
    let out = run(&db, &["dump"]);
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    for i in 0..5 {
        assert!(text.contains(&format!("key(4) = \"key{i}\"")), "dump:\n{text}");
        assert!(text.contains(&format!("data(6) = \"value{i}\"")), "dump:\n{text}");
    }

    let out = run(&db, &["keys"]);
    let text = String::from_utf8_lossy(&out.stdout);
    assert_eq!(text.lines().count(), 5);
    assert!(text.contains("\"key3\""));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: check, summary, repack, wipe, seqnum
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_cli_maintenance() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("maint.tdb");
    for i in 0..50 {
        assert!(run(&db, &["store", &format!("m{i}"), "payload"]).status.success());
    }
    let out = run(&db, &["check"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let out = run(&db, &["summary"]);
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("Number of records: 50"));

    let out = run(&db, &["seqnum"]);
    assert!(out.status.success());
    let n: u64 = String::from_utf8_lossy(&out.stdout).trim().parse().unwrap();
    assert!(n >= 50, "seqnum was {n}");

    assert!(run(&db, &["repack"]).status.success());
    assert!(run(&db, &["check"]).status.success());
    let out = run(&db, &["fetch", "m49"]);
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "payload");

    assert!(run(&db, &["wipe"]).status.success());
    let out = run(&db, &["keys"]);
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: the --tdb1 family of options
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_cli_v1_options() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("v1.tdb");
    assert!(run(&db, &["--tdb1", "--hash-size", "17", "create"]).status.success());
    assert!(run(&db, &["store", "legacy", "works"]).status.success());
    let out = run(&db, &["summary"]);
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("Hash size: 17"), "summary:\n{text}");
    assert!(run(&db, &["check"]).status.success());
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: usage errors exit 2
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_cli_usage_errors() {
    let out = Command::new(tdbtool_bin())
        .arg("--definitely-not-an-option")
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(2));
    let out = Command::new(tdbtool_bin()).output().unwrap();
    assert_eq!(out.status.code(), Some(2));
}
