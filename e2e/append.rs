//! E2E Suite 02: append
//!
//! `append` must behave exactly like fetch + concatenate + replace, while
//! exploiting tail padding to avoid relocation (the relocation bound
//! itself is asserted by the engine's unit tests, which can observe
//! record offsets).

use tdb::{Flags, OpenFlags, StoreMode, Tdb};
use tempfile::TempDir;

fn open_fresh(dir: &TempDir, name: &str, flags: Flags) -> Tdb {
    Tdb::open(
        dir.path().join(name),
        flags,
        OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::TRUNC,
        0o600,
        vec![],
    )
    .expect("open")
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: append equals concatenation
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_append_is_concatenation() {
    let dir = TempDir::new().unwrap();
    for (i, flags) in [
        Flags::INTERNAL,
        Flags::DEFAULT,
        Flags::NOMMAP,
        Flags::CONVERT,
    ]
    .into_iter()
    .enumerate()
    {
        let mut db = open_fresh(&dir, &format!("append-{i}.tdb"), flags);
        db.store(b"key", b"first", StoreMode::Insert).unwrap();
        db.append(b"key", b"-second").unwrap();
        assert_eq!(db.fetch(b"key").unwrap(), b"first-second");
        db.append(b"key", b"").unwrap();
        assert_eq!(db.fetch(b"key").unwrap(), b"first-second");
        db.check(None).unwrap();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: append to an absent key behaves like a store
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_append_creates_missing_key() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "append-create.tdb", Flags::DEFAULT);
    db.append(b"fresh", b"created by append").unwrap();
    assert_eq!(db.fetch(b"fresh").unwrap(), b"created by append");
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: incremental growth reconstructs the whole buffer
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_incremental_growth() {
    const MAX_SIZE: usize = 13100;
    const STEP: usize = 131;
    let buffer: Vec<u8> = (0..MAX_SIZE).map(|i| (i % 251) as u8).collect();

    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "append-grow.tdb", Flags::DEFAULT);
    let mut prev = 0;
    for j in (STEP..=MAX_SIZE).step_by(STEP) {
        db.append(b"key", &buffer[prev..j]).unwrap();
        prev = j;
        assert_eq!(db.fetch(b"key").unwrap(), &buffer[..j]);
        db.check(None).unwrap();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: one huge append after many records exist
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_huge_append_amid_other_records() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "append-huge.tdb", Flags::DEFAULT);
    for i in 0..100u32 {
        db.store(format!("filler-{i}").as_bytes(), b"x", StoreMode::Insert)
            .unwrap();
    }
    let big = vec![0xabu8; 100_000];
    db.append(b"big", &big).unwrap();
    db.append(b"big", &big).unwrap();
    let got = db.fetch(b"big").unwrap();
    assert_eq!(got.len(), 200_000);
    assert!(got.iter().all(|&b| b == 0xab));
    for i in 0..100u32 {
        assert!(db.exists(format!("filler-{i}").as_bytes()));
    }
    db.check(None).unwrap();
}
