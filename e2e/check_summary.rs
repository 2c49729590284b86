//! E2E Suite 09: check and summary
//!
//! `check` must pass after arbitrary operation sequences, feed every live
//! pair to its callback, propagate a callback abort, and catch deliberate
//! on-disk damage.  `summary` must describe what is actually there.

use std::collections::BTreeMap;
use std::os::unix::fs::FileExt;

use tdb::{Error, Flags, OpenFlags, StoreMode, Tdb};
use tempfile::TempDir;

fn open_at(path: &std::path::Path) -> Tdb {
    Tdb::open(
        path,
        Flags::DEFAULT,
        OpenFlags::RDWR | OpenFlags::CREAT,
        0o600,
        vec![],
    )
    .expect("open")
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: check passes across an operation mix and sees every pair
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_check_callback_sees_all_pairs() {
    let dir = TempDir::new().unwrap();
    let mut db = open_at(&dir.path().join("cb.tdb"));
    let mut expect = BTreeMap::new();
    for i in 0..300u32 {
        let k = format!("cb-{i}");
        let v = format!("val-{i}").repeat(i as usize % 4 + 1);
        db.store(k.as_bytes(), v.as_bytes(), StoreMode::Insert).unwrap();
        expect.insert(k.into_bytes(), v.into_bytes());
    }
    for i in (0..300u32).step_by(7) {
        let k = format!("cb-{i}");
        db.delete(k.as_bytes()).unwrap();
        expect.remove(k.as_bytes());
    }
    db.append(b"cb-1", b"-suffix").unwrap();
    expect.get_mut(b"cb-1".as_slice()).unwrap().extend_from_slice(b"-suffix");

    let mut seen = BTreeMap::new();
    let mut cb = |k: &[u8], v: &[u8]| -> tdb::Result<()> {
        seen.insert(k.to_vec(), v.to_vec());
        Ok(())
    };
    db.check(Some(&mut cb)).unwrap();
    assert_eq!(seen, expect);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: callback error aborts the check
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_check_callback_abort() {
    let dir = TempDir::new().unwrap();
    let mut db = open_at(&dir.path().join("abort.tdb"));
    for i in 0..50u32 {
        db.store(&i.to_le_bytes(), b"v", StoreMode::Insert).unwrap();
    }
    let mut calls = 0;
    let mut cb = |_: &[u8], _: &[u8]| -> tdb::Result<()> {
        calls += 1;
        if calls >= 10 {
            Err(Error::Io)
        } else {
            Ok(())
        }
    };
    assert_eq!(db.check(Some(&mut cb)), Err(Error::Io));
    assert_eq!(calls, 10);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: deliberate corruption is caught
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_check_catches_corruption() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("corrupt.tdb");
    {
        let mut db = open_at(&path);
        for i in 0..100u32 {
            db.store(&i.to_le_bytes(), &[9u8; 64], StoreMode::Insert).unwrap();
        }
        db.check(None).unwrap();
    }
    // Smash a run of bytes early in the record area while nothing has it
    // open: the run is longer than any one record here, so at least one
    // record header is destroyed.
    let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    f.write_all_at(&[0xffu8; 256], 9500).unwrap();
    drop(f);

    let mut db = open_at(&path);
    assert_eq!(db.check(None), Err(Error::Corrupt));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: summary reflects the database
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_summary_contents() {
    let dir = TempDir::new().unwrap();
    let mut db = open_at(&dir.path().join("summary.tdb"));
    for i in 0..123u32 {
        let k = format!("summary-key-{i}");
        db.store(k.as_bytes(), &vec![1u8; 50], StoreMode::Insert).unwrap();
    }
    let text = db.summary().unwrap();
    assert!(text.contains("Number of records: 123"), "summary:\n{text}");
    assert!(text.contains("Size of file/data:"), "summary:\n{text}");
    assert!(text.contains("Smallest/average/largest data: 50/50/50"), "summary:\n{text}");
    assert!(text.contains("Toplevel hash used:"), "summary:\n{text}");
    // An empty database reports zero records.
    db.wipe_all().unwrap();
    let text = db.summary().unwrap();
    assert!(text.contains("Number of records: 0"), "summary:\n{text}");
}
