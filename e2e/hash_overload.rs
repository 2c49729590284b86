//! E2E Suite 03: hash collisions, group promotion and chains
//!
//! An adversarial hash that maps every key to the same value forces the
//! index through its entire escalation ladder: linear probing inside one
//! group, promotion into sublevels as each group saturates, and finally
//! chain pages once every hash bit is spent.  The database must stay
//! correct (and checkable) the whole way down, and collapse back as
//! records are deleted.

use tdb::{Attribute, Flags, OpenFlags, StoreMode, Tdb};
use tempfile::TempDir;

fn open_clash(dir: &TempDir, name: &str) -> Tdb {
    Tdb::open(
        dir.path().join(name),
        Flags::DEFAULT,
        OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::TRUNC,
        0o600,
        vec![Attribute::Hash(Box::new(|_, _| 0))],
    )
    .expect("open with clashing hash")
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: one more key than a group holds promotes a sublevel
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_group_overflow_promotes_sublevel() {
    let dir = TempDir::new().unwrap();
    let mut db = open_clash(&dir, "promote.tdb");
    let group_size = 1u32 << tdb::HASH_GROUP_BITS;

    // Fill one group exactly, then push one more.
    for i in 0..=group_size {
        db.store(&i.to_le_bytes(), &i.to_le_bytes(), StoreMode::Insert)
            .unwrap();
        db.check(None).unwrap();
    }
    for i in 0..=group_size {
        assert_eq!(db.fetch(&i.to_le_bytes()).unwrap(), &i.to_le_bytes());
    }
    // All records visible exactly once through traversal.
    let mut seen = 0;
    db.traverse(|_, _, _| {
        seen += 1;
        true
    })
    .unwrap();
    assert_eq!(seen, group_size as u64 + 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: drive the index all the way into chains
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_hash_exhaustion_reaches_chains() {
    let dir = TempDir::new().unwrap();
    let mut db = open_clash(&dir, "chains.tdb");

    // Far more colliding keys than sublevels can spread: the tail must
    // land in chain pages.
    const N: u32 = 120;
    for i in 0..N {
        db.store(&i.to_le_bytes(), &(!i).to_le_bytes(), StoreMode::Insert)
            .unwrap();
    }
    db.check(None).unwrap();
    for i in 0..N {
        assert_eq!(db.fetch(&i.to_le_bytes()).unwrap(), &(!i).to_le_bytes());
    }
    let count = db.traverse(|_, _, _| true).unwrap();
    assert_eq!(count, N as u64);

    // Updating keys in place still works down there.
    for i in 0..N {
        db.store(&i.to_le_bytes(), &i.to_le_bytes(), StoreMode::Replace)
            .unwrap();
    }
    db.check(None).unwrap();
    for i in 0..N {
        assert_eq!(db.fetch(&i.to_le_bytes()).unwrap(), &i.to_le_bytes());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: deletion unwinds sublevels and chains
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_delete_collapses_structures() {
    let dir = TempDir::new().unwrap();
    let mut db = open_clash(&dir, "collapse.tdb");
    const N: u32 = 120;
    for i in 0..N {
        db.store(&i.to_le_bytes(), b"v", StoreMode::Insert).unwrap();
    }
    // Delete in an order that empties deep structures first.
    for i in (0..N).rev() {
        db.delete(&i.to_le_bytes()).unwrap();
        db.check(None).unwrap();
    }
    assert_eq!(db.traverse(|_, _, _| true).unwrap(), 0);

    // The summary of an emptied database reports no sub-tables left.
    let summary = db.summary().unwrap();
    assert!(
        summary.contains("Number of records: 0"),
        "summary was:\n{summary}"
    );

    // And the space is reusable.
    for i in 0..N {
        db.store(&i.to_le_bytes(), b"again", StoreMode::Insert).unwrap();
    }
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: mixed adversarial and normal keys coexist
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_normal_hash_unaffected_by_depth() {
    let dir = TempDir::new().unwrap();
    // Default hash, realistic keys, large count: sublevels appear only
    // where load demands and everything stays reachable.
    let mut db = Tdb::open(
        dir.path().join("load.tdb"),
        Flags::DEFAULT,
        OpenFlags::RDWR | OpenFlags::CREAT,
        0o600,
        vec![],
    )
    .unwrap();
    const N: u32 = 5000;
    for i in 0..N {
        let k = format!("load-key-{i}");
        db.store(k.as_bytes(), &i.to_le_bytes(), StoreMode::Insert)
            .unwrap();
    }
    db.check(None).unwrap();
    for i in 0..N {
        let k = format!("load-key-{i}");
        assert_eq!(db.fetch(k.as_bytes()).unwrap(), &i.to_le_bytes());
    }
    assert_eq!(db.traverse(|_, _, _| true).unwrap(), N as u64);
}
