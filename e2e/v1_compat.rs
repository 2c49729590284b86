//! E2E Suite 11: legacy version-1 format
//!
//! Databases created with `Flags::VERSION1` use the old chain-per-bucket
//! layout.  Reopening one without the flag must auto-detect the format,
//! report it, and keep full read-write service going through the same
//! API, including transactions.

use tdb::{Attribute, Error, Flags, OpenFlags, StoreMode, Tdb};
use tempfile::TempDir;

fn open_v1(path: &std::path::Path, hashsize: Option<u32>) -> Tdb {
    let mut attrs = Vec::new();
    if let Some(n) = hashsize {
        attrs.push(Attribute::Tdb1Hashsize(n));
    }
    Tdb::open(
        path,
        Flags::VERSION1,
        OpenFlags::RDWR | OpenFlags::CREAT,
        0o600,
        attrs,
    )
    .expect("open v1")
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: create as v1, reopen plain, keep working (scenario 6)
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_v1_round_trip_and_autodetect() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("legacy.tdb");
    {
        let mut db = open_v1(&path, None);
        assert!(db.get_flags().contains(Flags::VERSION1));
        for i in 0..200u32 {
            let k = format!("v1-key-{i}");
            db.store(k.as_bytes(), format!("v1-val-{i}").as_bytes(), StoreMode::Insert)
                .unwrap();
        }
        db.check(None).unwrap();
    }
    // Reopen WITHOUT the flag: format detected from the file.
    let mut db = Tdb::open(&path, Flags::DEFAULT, OpenFlags::RDWR, 0o600, vec![]).unwrap();
    assert!(
        db.get_flags().contains(Flags::VERSION1),
        "v1 must be reported on auto-detected files"
    );
    for i in 0..200u32 {
        let k = format!("v1-key-{i}");
        assert_eq!(db.fetch(k.as_bytes()).unwrap(), format!("v1-val-{i}").as_bytes());
    }
    // Writes still land in the v1 layout.
    db.store(b"post-reopen", b"write", StoreMode::Insert).unwrap();
    db.delete(b"v1-key-0").unwrap();
    db.append(b"post-reopen", b"-more").unwrap();
    assert_eq!(db.fetch(b"post-reopen").unwrap(), b"write-more");
    assert_eq!(db.fetch(b"v1-key-0"), Err(Error::Noexist));
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: the hash-size attribute shapes new databases
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_v1_hashsize_attribute() {
    let dir = TempDir::new().unwrap();
    let mut db = open_v1(&dir.path().join("small.tdb"), Some(7));
    // Seven buckets, many keys: long chains, still correct.
    for i in 0..500u32 {
        db.store(&i.to_le_bytes(), &(!i).to_le_bytes(), StoreMode::Insert)
            .unwrap();
    }
    for i in 0..500u32 {
        assert_eq!(db.fetch(&i.to_le_bytes()).unwrap(), &(!i).to_le_bytes());
    }
    assert_eq!(db.traverse(|_, _, _| true).unwrap(), 500);
    db.check(None).unwrap();
    let summary = db.summary().unwrap();
    assert!(summary.contains("Hash size: 7"), "summary:\n{summary}");
    assert!(summary.contains("version 1"), "summary:\n{summary}");

    // Hash size zero is malformed.
    match Tdb::open(
        dir.path().join("zero.tdb"),
        Flags::VERSION1,
        OpenFlags::RDWR | OpenFlags::CREAT,
        0o600,
        vec![Attribute::Tdb1Hashsize(0)],
    ) {
        Err(Error::Einval) => {}
        other => panic!("hashsize 0: {:?}", other.map(|_| ())),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: v1 store modes, wipe, cursor
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_v1_semantics() {
    let dir = TempDir::new().unwrap();
    let mut db = open_v1(&dir.path().join("sem.tdb"), None);
    assert_eq!(db.store(b"k", b"v", StoreMode::Modify), Err(Error::Noexist));
    db.store(b"k", b"v", StoreMode::Insert).unwrap();
    assert_eq!(db.store(b"k", b"w", StoreMode::Insert), Err(Error::Exists));
    db.store(b"k", b"longer value", StoreMode::Replace).unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), b"longer value");
    assert!(db.exists(b"k"));
    assert_eq!(db.parse_record(b"k", |d| d.len()).unwrap(), 12);

    for i in 0..50u32 {
        db.store(&i.to_le_bytes(), b"x", StoreMode::Insert).unwrap();
    }
    // Cursor enumerates everything exactly once.
    let mut seen = std::collections::BTreeSet::new();
    let mut cur = db.firstkey().unwrap();
    while let Some(k) = cur {
        assert!(seen.insert(k.clone()));
        cur = db.nextkey(&k).unwrap();
    }
    assert_eq!(seen.len(), 51);

    db.wipe_all().unwrap();
    assert_eq!(db.traverse(|_, _, _| true).unwrap(), 0);
    db.check(None).unwrap();
    // Still writable after a wipe.
    db.store(b"fresh", b"start", StoreMode::Insert).unwrap();
    assert_eq!(db.fetch(b"fresh").unwrap(), b"start");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: v1 sequence numbers wrap at 32 bits
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_v1_seqnum_wraps() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("wrap.tdb");
    let mut db = Tdb::open(
        &path,
        Flags::VERSION1 | Flags::SEQNUM,
        OpenFlags::RDWR | OpenFlags::CREAT,
        0o600,
        vec![],
    )
    .unwrap();
    db.store(b"k", b"v", StoreMode::Insert).unwrap();
    assert!(db.seqnum() > 0);
    // A v1 traversal counts as a modification, like it always has.
    let before = db.seqnum();
    db.traverse(|_, _, _| true).unwrap();
    assert!(db.seqnum() > before);
    // The counter lives in 32 bits and wraps there.
    assert!(db.seqnum() <= u32::MAX as u64);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: v1 transactions commit and cancel through the shared overlay
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_v1_transactions() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("txn1.tdb");
    {
        let mut db = open_v1(&path, None);
        db.store(b"base", b"kept", StoreMode::Insert).unwrap();
        db.transaction_start().unwrap();
        db.store(b"committed", b"yes", StoreMode::Insert).unwrap();
        db.transaction_commit().unwrap();
        db.transaction_start().unwrap();
        db.store(b"cancelled", b"no", StoreMode::Insert).unwrap();
        db.delete(b"base").unwrap();
        db.transaction_cancel().unwrap();
        db.check(None).unwrap();
    }
    let mut db = Tdb::open(&path, Flags::DEFAULT, OpenFlags::RDWR, 0o600, vec![]).unwrap();
    assert_eq!(db.fetch(b"committed").unwrap(), b"yes");
    assert_eq!(db.fetch(b"base").unwrap(), b"kept");
    assert_eq!(db.fetch(b"cancelled"), Err(Error::Noexist));
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: crash between prepare and commit rolls back on reopen
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_v1_crash_recovery() {
    let dir = TempDir::new().unwrap();
    let live = dir.path().join("live1.tdb");
    let crashed = dir.path().join("crashed1.tdb");
    let snapshot = {
        let mut db = open_v1(&live, None);
        db.store(b"stable", b"value", StoreMode::Insert).unwrap();
        db.transaction_start().unwrap();
        for i in 0..100u32 {
            db.store(&i.to_le_bytes(), &[3u8; 200], StoreMode::Insert).unwrap();
        }
        db.transaction_prepare_commit().unwrap();
        let snap = std::fs::read(&live).unwrap();
        db.transaction_commit().unwrap();
        snap
    };
    std::fs::write(&crashed, snapshot).unwrap();
    let mut db = Tdb::open(&crashed, Flags::DEFAULT, OpenFlags::RDWR, 0o600, vec![]).unwrap();
    assert_eq!(db.fetch(b"stable").unwrap(), b"value");
    for i in 0..100u32 {
        assert_eq!(db.fetch(&i.to_le_bytes()), Err(Error::Noexist));
    }
    db.check(None).unwrap();
}
