//! E2E Suite 05: transactions
//!
//! Commit makes every write visible; cancel makes none visible; nesting
//! merges inner commits into the outer overlay; and an inner cancel
//! poisons the outer transaction so its commit fails — that propagation
//! is documented behaviour, surprising as it is.

use tdb::{Error, Flags, OpenFlags, StoreMode, Tdb};
use tempfile::TempDir;

fn open_at(path: &std::path::Path, flags: Flags) -> Tdb {
    Tdb::open(
        path,
        flags,
        OpenFlags::RDWR | OpenFlags::CREAT,
        0o600,
        vec![],
    )
    .expect("open")
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: committed writes persist, cancelled writes vanish
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_commit_and_cancel_visibility() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("txn.tdb");
    {
        let mut db = open_at(&path, Flags::DEFAULT);
        db.store(b"base", b"pre-transaction", StoreMode::Insert).unwrap();

        db.transaction_start().unwrap();
        db.store(b"committed", b"yes", StoreMode::Insert).unwrap();
        db.store(b"base", b"updated", StoreMode::Replace).unwrap();
        db.transaction_commit().unwrap();

        db.transaction_start().unwrap();
        db.store(b"cancelled", b"no", StoreMode::Insert).unwrap();
        db.delete(b"base").unwrap();
        db.transaction_cancel().unwrap();
        db.check(None).unwrap();
    }
    // A fresh open sees only the committed state.
    let mut db = open_at(&path, Flags::DEFAULT);
    assert_eq!(db.fetch(b"committed").unwrap(), b"yes");
    assert_eq!(db.fetch(b"base").unwrap(), b"updated");
    assert_eq!(db.fetch(b"cancelled"), Err(Error::Noexist));
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: reads inside a transaction see the overlay
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_read_through_overlay() {
    let dir = TempDir::new().unwrap();
    let mut db = open_at(&dir.path().join("overlay.tdb"), Flags::DEFAULT);
    db.store(b"k", b"old", StoreMode::Insert).unwrap();

    db.transaction_start().unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), b"old");
    db.store(b"k", b"new", StoreMode::Replace).unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), b"new");
    db.delete(b"k").unwrap();
    assert_eq!(db.fetch(b"k"), Err(Error::Noexist));
    db.transaction_cancel().unwrap();

    // Cancelled: the old value is untouched.
    assert_eq!(db.fetch(b"k").unwrap(), b"old");
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: start-inside-start needs ALLOW_NESTING
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_nesting_requires_flag() {
    let dir = TempDir::new().unwrap();
    let mut db = open_at(&dir.path().join("nest-off.tdb"), Flags::DEFAULT);
    db.transaction_start().unwrap();
    assert_eq!(db.transaction_start(), Err(Error::Nesting));
    db.transaction_cancel().unwrap();

    let mut db = open_at(&dir.path().join("nest-on.tdb"), Flags::ALLOW_NESTING);
    db.transaction_start().unwrap();
    db.transaction_start().unwrap();
    db.store(b"inner", b"write", StoreMode::Insert).unwrap();
    // Inner commit merges into the outer overlay; nothing on disk yet.
    db.transaction_commit().unwrap();
    db.transaction_commit().unwrap();
    assert_eq!(db.fetch(b"inner").unwrap(), b"write");
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: inner cancel poisons the outer transaction
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_inner_cancel_poisons_outer() {
    let dir = TempDir::new().unwrap();
    let mut db = open_at(&dir.path().join("poison.tdb"), Flags::ALLOW_NESTING);
    db.store(b"base", b"value", StoreMode::Insert).unwrap();

    db.transaction_start().unwrap();
    db.store(b"outer", b"write", StoreMode::Insert).unwrap();
    db.transaction_start().unwrap();
    db.store(b"inner", b"write", StoreMode::Insert).unwrap();
    db.transaction_cancel().unwrap();

    // The documented propagation: the outer commit now fails, and the
    // whole transaction is gone.
    assert_eq!(db.transaction_commit(), Err(Error::Nesting));
    let _ = db.transaction_cancel();
    assert_eq!(db.fetch(b"outer"), Err(Error::Noexist));
    assert_eq!(db.fetch(b"inner"), Err(Error::Noexist));
    assert_eq!(db.fetch(b"base").unwrap(), b"value");
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: many records and growth inside one transaction
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_bulk_transaction_with_growth() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bulk.tdb");
    {
        let mut db = open_at(&path, Flags::DEFAULT);
        db.transaction_start().unwrap();
        for i in 0..500u32 {
            let key = format!("bulk-{i}");
            db.store(key.as_bytes(), &vec![i as u8; 1000], StoreMode::Insert)
                .unwrap();
        }
        db.transaction_commit().unwrap();
        db.check(None).unwrap();
    }
    let mut db = open_at(&path, Flags::DEFAULT);
    for i in 0..500u32 {
        let key = format!("bulk-{i}");
        assert_eq!(db.fetch(key.as_bytes()).unwrap(), vec![i as u8; 1000]);
    }
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: traverse and wipe inside a transaction
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_traverse_and_wipe_in_transaction() {
    let dir = TempDir::new().unwrap();
    let mut db = open_at(&dir.path().join("travtx.tdb"), Flags::DEFAULT);
    for i in 0..50u32 {
        db.store(&i.to_le_bytes(), b"v", StoreMode::Insert).unwrap();
    }
    db.transaction_start().unwrap();
    assert_eq!(db.traverse(|_, _, _| true).unwrap(), 50);
    db.wipe_all().unwrap();
    assert_eq!(db.traverse(|_, _, _| true).unwrap(), 0);
    db.transaction_cancel().unwrap();
    // The wipe was part of the cancelled overlay.
    assert_eq!(db.traverse(|_, _, _| true).unwrap(), 50);
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 7: explicit prepare then commit
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_prepare_then_commit() {
    let dir = TempDir::new().unwrap();
    let mut db = open_at(&dir.path().join("prepare.tdb"), Flags::DEFAULT);
    db.store(b"seed", b"x", StoreMode::Insert).unwrap();
    db.transaction_start().unwrap();
    db.store(b"staged", b"y", StoreMode::Insert).unwrap();
    db.transaction_prepare_commit().unwrap();
    // Double prepare is misuse.
    assert_eq!(db.transaction_prepare_commit(), Err(Error::Einval));
    db.transaction_commit().unwrap();
    assert_eq!(db.fetch(b"staged").unwrap(), b"y");
    db.check(None).unwrap();
}
