//! E2E Suite 10: open-time attributes and handle metadata
//!
//! Seeds, hash overrides and their check value, the open hook, the log
//! hook, statistics collection, the sequence number, and flag toggling.

use std::sync::{Arc, Mutex};

use tdb::{Attribute, Error, Flags, LogLevel, OpenFlags, StoreMode, Tdb};
use tempfile::TempDir;

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: a fixed seed is honoured; the wrong hash is refused (P7)
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_seed_and_hash_check() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hash.tdb");

    // Create with a custom hash function.
    let custom = |k: &[u8], s: u64| -> u64 {
        k.iter()
            .fold(s ^ 0x9e37_79b9_7f4a_7c15, |a, &b| {
                (a ^ b as u64).wrapping_mul(0x100_0000_01b3)
            })
    };
    {
        let mut db = Tdb::open(
            &path,
            Flags::DEFAULT,
            OpenFlags::RDWR | OpenFlags::CREAT,
            0o600,
            vec![Attribute::Hash(Box::new(custom)), Attribute::Seed(42)],
        )
        .unwrap();
        db.store(b"k", b"v", StoreMode::Insert).unwrap();
    }

    // Reopening with the default hash must fail before trusting a bucket.
    match Tdb::open(&path, Flags::DEFAULT, OpenFlags::RDWR, 0o600, vec![]) {
        Err(Error::Io) => {}
        other => panic!("open with wrong hash: {:?}", other.map(|_| ())),
    }

    // Reopening with the right hash works.
    let mut db = Tdb::open(
        &path,
        Flags::DEFAULT,
        OpenFlags::RDWR,
        0o600,
        vec![Attribute::Hash(Box::new(custom))],
    )
    .unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), b"v");
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: duplicate attributes are rejected
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_duplicate_attributes() {
    let dir = TempDir::new().unwrap();
    match Tdb::open(
        dir.path().join("dup.tdb"),
        Flags::DEFAULT,
        OpenFlags::RDWR | OpenFlags::CREAT,
        0o600,
        vec![Attribute::Seed(1), Attribute::Seed(2)],
    ) {
        Err(Error::Einval) => {}
        other => panic!("duplicate seed attributes: {:?}", other.map(|_| ())),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: the log hook receives failure diagnostics
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_log_attribute() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log.tdb");
    {
        let mut db = Tdb::open(
            &path,
            Flags::DEFAULT,
            OpenFlags::RDWR | OpenFlags::CREAT,
            0o600,
            vec![],
        )
        .unwrap();
        db.store(b"k", b"v", StoreMode::Insert).unwrap();
    }
    // Open with a foreign hash and a log capture: the refusal must be
    // explained through the hook.
    let messages: Arc<Mutex<Vec<(LogLevel, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = messages.clone();
    let res = Tdb::open(
        &path,
        Flags::DEFAULT,
        OpenFlags::RDWR,
        0o600,
        vec![
            Attribute::Hash(Box::new(|_, _| 7)),
            Attribute::Log(Box::new(move |level, msg| {
                sink.lock().unwrap().push((level, msg.to_string()));
            })),
        ],
    );
    assert!(res.is_err());
    let logged = messages.lock().unwrap();
    assert!(
        logged
            .iter()
            .any(|(lvl, m)| *lvl <= LogLevel::Error && m.contains("hash")),
        "captured: {logged:?}"
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: the open hook runs under the open lock and may reset the file
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_open_hook_truncates() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hook.tdb");
    {
        let mut db = Tdb::open(
            &path,
            Flags::DEFAULT,
            OpenFlags::RDWR | OpenFlags::CREAT,
            0o600,
            vec![],
        )
        .unwrap();
        db.store(b"old", b"data", StoreMode::Insert).unwrap();
    }
    let mut db = Tdb::open(
        &path,
        Flags::DEFAULT,
        OpenFlags::RDWR | OpenFlags::CREAT,
        0o600,
        vec![Attribute::OpenHook(Box::new(|fd| {
            // Truncating here is safe: the open lock serializes us
            // against every other opener.
            let rc = unsafe { libc::ftruncate(fd, 0) };
            if rc == 0 {
                Ok(())
            } else {
                Err(std::io::Error::last_os_error())
            }
        }))],
    )
    .unwrap();
    // The hook wiped the file; open recreated a fresh database.
    assert_eq!(db.fetch(b"old"), Err(Error::Noexist));
    db.store(b"new", b"database", StoreMode::Insert).unwrap();
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: sequence number moves on writes, never on reads
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_seqnum_progression() {
    let dir = TempDir::new().unwrap();
    let mut db = Tdb::open(
        dir.path().join("seq.tdb"),
        Flags::SEQNUM,
        OpenFlags::RDWR | OpenFlags::CREAT,
        0o600,
        vec![],
    )
    .unwrap();
    let s0 = db.seqnum();
    db.store(b"a", b"1", StoreMode::Insert).unwrap();
    let s1 = db.seqnum();
    assert!(s1 > s0);
    db.fetch(b"a").unwrap();
    assert_eq!(db.seqnum(), s1, "fetch must not bump the seqnum");
    db.append(b"a", b"2").unwrap();
    let s2 = db.seqnum();
    assert!(s2 > s1);
    db.delete(b"a").unwrap();
    assert!(db.seqnum() > s2);

    // A committed transaction carries its bumps.
    let before = db.seqnum();
    db.transaction_start().unwrap();
    db.store(b"t", b"x", StoreMode::Insert).unwrap();
    db.store(b"u", b"y", StoreMode::Insert).unwrap();
    db.transaction_commit().unwrap();
    assert!(db.seqnum() > before);

    // A cancelled one does not.
    let before = db.seqnum();
    db.transaction_start().unwrap();
    db.store(b"v", b"z", StoreMode::Insert).unwrap();
    db.transaction_cancel().unwrap();
    assert_eq!(db.seqnum(), before);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: statistics counters move when asked for
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_stats_attribute() {
    let dir = TempDir::new().unwrap();
    let mut db = Tdb::open(
        dir.path().join("stats.tdb"),
        Flags::DEFAULT,
        OpenFlags::RDWR | OpenFlags::CREAT,
        0o600,
        vec![Attribute::Stats],
    )
    .unwrap();
    for i in 0..100u32 {
        db.store(&i.to_le_bytes(), &[0u8; 100], StoreMode::Insert).unwrap();
    }
    db.traverse(|_, _, _| true).unwrap();
    let stats = db.stats().expect("stats were requested").clone();
    assert!(stats.allocs >= 100);
    assert!(stats.locks > 0);
    assert_eq!(stats.traverses, 1);
    assert!(stats.frees == 0 || stats.expands > 0);

    // Counters are monotone.
    db.delete(&0u32.to_le_bytes()).unwrap();
    let later = db.stats().unwrap();
    assert!(later.frees > stats.frees);

    // Without the attribute there are no counters.
    let db2 = Tdb::open(
        dir.path().join("nostats.tdb"),
        Flags::DEFAULT,
        OpenFlags::RDWR | OpenFlags::CREAT,
        0o600,
        vec![],
    )
    .unwrap();
    assert!(db2.stats().is_none());
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 7: internal databases need no file at all
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_internal_database() {
    let mut db = Tdb::open(
        "no-such-directory/ignored.tdb",
        Flags::INTERNAL,
        OpenFlags::RDWR,
        0o600,
        vec![],
    )
    .unwrap();
    assert!(db.fd().is_none());
    db.store(b"k", b"v", StoreMode::Insert).unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), b"v");
    db.transaction_start().unwrap();
    db.store(b"t", b"x", StoreMode::Insert).unwrap();
    db.transaction_commit().unwrap();
    assert_eq!(db.fetch(b"t").unwrap(), b"x");
    db.check(None).unwrap();
}
