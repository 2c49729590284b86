//! E2E Suite 07: traversal and the firstkey/nextkey cursor
//!
//! Traversal must visit every record present at the start exactly once
//! when nothing changes underneath it, stay safe when the callback
//! deletes the record it was handed, and stop early on request.

use std::collections::BTreeSet;

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

fn fill(db: &mut Tdb, n: u32) -> BTreeSet<Vec<u8>> {
    let mut keys = BTreeSet::new();
    for i in 0..n {
        let key = i.to_le_bytes().to_vec();
        db.store(&key, &i.to_le_bytes(), StoreMode::Insert).unwrap();
        keys.insert(key);
    }
    keys
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: every record exactly once
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_visits_each_exactly_once() {
    let dir = TempDir::new().unwrap();
    for (i, flags) in [Flags::INTERNAL, Flags::DEFAULT, Flags::NOMMAP]
        .into_iter()
        .enumerate()
    {
        let mut db = open_fresh(&dir, &format!("visit-{i}.tdb"), flags);
        let keys = fill(&mut db, 1000);
        let mut seen = BTreeSet::new();
        let count = db
            .traverse(|_, k, v| {
                assert_eq!(k, v, "value mirrors key in this fixture");
                assert!(seen.insert(k.to_vec()), "revisited {k:?}");
                true
            })
            .unwrap();
        assert_eq!(count, 1000);
        assert_eq!(seen, keys);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: deleting the visited record mid-traverse (scenario from the
// original suite: the store drains to empty, every record seen once)
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_delete_current_during_traverse() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "drain.tdb", Flags::DEFAULT);
    fill(&mut db, 1000);
    let mut seen = BTreeSet::new();
    let count = db
        .traverse(|db, k, _| {
            assert!(seen.insert(k.to_vec()));
            db.delete(k).expect("delete current");
            true
        })
        .unwrap();
    assert_eq!(count, 1000);
    assert_eq!(seen.len(), 1000);
    assert_eq!(db.traverse(|_, _, _| true).unwrap(), 0);
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: early stop
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_early_stop() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "stop.tdb", Flags::DEFAULT);
    fill(&mut db, 100);
    let mut visited = 0u64;
    let count = db
        .traverse(|_, _, _| {
            visited += 1;
            visited < 10
        })
        .unwrap();
    assert_eq!(visited, 10);
    assert_eq!(count, 10);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: firstkey/nextkey enumerates the same set
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_firstkey_nextkey_enumeration() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "cursor.tdb", Flags::DEFAULT);
    let keys = fill(&mut db, 500);

    let mut seen = BTreeSet::new();
    let mut cur = db.firstkey().unwrap();
    while let Some(k) = cur {
        assert!(seen.insert(k.clone()), "cursor revisited {k:?}");
        cur = db.nextkey(&k).unwrap();
    }
    assert_eq!(seen, keys);

    // An empty database has no first key.
    let mut empty = open_fresh(&dir, "cursor-empty.tdb", Flags::DEFAULT);
    assert_eq!(empty.firstkey().unwrap(), None);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: cursor survives deleting the current key
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_cursor_with_delete_current() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "cursor-del.tdb", Flags::DEFAULT);
    fill(&mut db, 300);

    let mut seen = BTreeSet::new();
    let mut cur = db.firstkey().unwrap();
    while let Some(k) = cur {
        assert!(seen.insert(k.clone()));
        db.delete(&k).unwrap();
        cur = db.nextkey(&k).unwrap();
    }
    assert_eq!(seen.len(), 300);
    assert_eq!(db.traverse(|_, _, _| true).unwrap(), 0);
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: callback may store other records
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_insert_during_traverse_is_tolerated() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "insert-during.tdb", Flags::DEFAULT);
    fill(&mut db, 100);
    let mut extra = 0u32;
    db.traverse(|db, k, _| {
        if k.len() == 4 && extra < 20 {
            // New keys may or may not be visited; they must not break
            // the walk or the structure.
            let nk = format!("during-{extra}");
            db.store(nk.as_bytes(), b"inserted mid-walk", StoreMode::Replace)
                .unwrap();
            extra += 1;
        }
        true
    })
    .unwrap();
    for i in 0..20u32 {
        let nk = format!("during-{i}");
        assert_eq!(db.fetch(nk.as_bytes()).unwrap(), b"inserted mid-walk");
    }
    db.check(None).unwrap();
}
