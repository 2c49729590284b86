//! E2E Suite 06: crash recovery
//!
//! A crash is simulated by snapshotting the file bytes at a chosen point
//! and writing them to a fresh path: that file is exactly what a process
//! death at that moment would have left behind.  Reopening it must give
//! back the last consistent pre-transaction state.

use std::fs;

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

fn seed_database(db: &mut Tdb, n: u32) {
    for i in 0..n {
        let key = format!("stable-{i}");
        db.store(key.as_bytes(), format!("value-{i}").as_bytes(), StoreMode::Insert)
            .unwrap();
    }
}

fn assert_seed_intact(db: &mut Tdb, n: u32) {
    for i in 0..n {
        let key = format!("stable-{i}");
        assert_eq!(
            db.fetch(key.as_bytes()).unwrap(),
            format!("value-{i}").as_bytes()
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: crash after prepare, before commit — full rollback
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_crash_between_prepare_and_commit() {
    let dir = TempDir::new().unwrap();
    let live = dir.path().join("live.tdb");
    let crashed = dir.path().join("crashed.tdb");

    let snapshot = {
        let mut db = open_at(&live);
        seed_database(&mut db, 50);
        db.transaction_start().unwrap();
        for i in 0..500u32 {
            let key = format!("doomed-{i}");
            db.store(key.as_bytes(), &vec![i as u8; 1000], StoreMode::Insert)
                .unwrap();
        }
        db.transaction_prepare_commit().unwrap();
        // The recovery record and pointer are on disk now; this is the
        // crash point.
        let snap = fs::read(&live).unwrap();
        db.transaction_commit().unwrap();
        snap
    };

    fs::write(&crashed, snapshot).unwrap();
    let mut db = open_at(&crashed);
    // None of the transaction is visible.
    for i in 0..500u32 {
        let key = format!("doomed-{i}");
        assert_eq!(db.fetch(key.as_bytes()), Err(Error::Noexist), "doomed-{i} survived");
    }
    assert_seed_intact(&mut db, 50);
    db.check(None).unwrap();

    // Meanwhile the uncrashed database committed normally.
    let mut db = open_at(&live);
    for i in 0..500u32 {
        let key = format!("doomed-{i}");
        assert_eq!(db.fetch(key.as_bytes()).unwrap(), vec![i as u8; 1000]);
    }
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: crash before prepare — nothing ever reached the file
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_crash_before_prepare() {
    let dir = TempDir::new().unwrap();
    let live = dir.path().join("live2.tdb");
    let crashed = dir.path().join("crashed2.tdb");

    let snapshot = {
        let mut db = open_at(&live);
        seed_database(&mut db, 30);
        db.transaction_start().unwrap();
        for i in 0..100u32 {
            db.store(&i.to_le_bytes(), b"overlay only", StoreMode::Replace)
                .unwrap();
        }
        // No prepare: every write is still process-local.
        let snap = fs::read(&live).unwrap();
        db.transaction_cancel().unwrap();
        snap
    };

    fs::write(&crashed, snapshot).unwrap();
    let mut db = open_at(&crashed);
    assert_seed_intact(&mut db, 30);
    for i in 0..100u32 {
        assert_eq!(db.fetch(&i.to_le_bytes()), Err(Error::Noexist));
    }
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: crash after commit — the transaction is durable
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_crash_after_commit() {
    let dir = TempDir::new().unwrap();
    let live = dir.path().join("live3.tdb");
    let crashed = dir.path().join("crashed3.tdb");

    let snapshot = {
        let mut db = open_at(&live);
        seed_database(&mut db, 10);
        db.transaction_start().unwrap();
        db.store(b"durable", b"committed bytes", StoreMode::Insert).unwrap();
        db.transaction_commit().unwrap();
        fs::read(&live).unwrap()
    };

    fs::write(&crashed, snapshot).unwrap();
    let mut db = open_at(&crashed);
    assert_eq!(db.fetch(b"durable").unwrap(), b"committed bytes");
    assert_seed_intact(&mut db, 10);
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: recovery happens once; later openers see a clean file
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_recovery_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let live = dir.path().join("live4.tdb");
    let crashed = dir.path().join("crashed4.tdb");

    let snapshot = {
        let mut db = open_at(&live);
        seed_database(&mut db, 20);
        db.transaction_start().unwrap();
        for i in 0..20u32 {
            let key = format!("stable-{i}");
            db.store(key.as_bytes(), b"mutated", StoreMode::Replace).unwrap();
        }
        db.transaction_prepare_commit().unwrap();
        let snap = fs::read(&live).unwrap();
        db.transaction_cancel().unwrap();
        snap
    };

    fs::write(&crashed, snapshot).unwrap();
    for round in 0..3 {
        let mut db = open_at(&crashed);
        assert_seed_intact(&mut db, 20);
        db.check(None).unwrap();
        drop(db);
        let _ = round;
    }
}
