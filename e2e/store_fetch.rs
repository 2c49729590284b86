//! E2E Suite 01: store / fetch / delete / exists
//!
//! Exercises the core key-value operations against a reference
//! `BTreeMap` across the flag matrix (in-memory, file-backed, no-mmap,
//! byte-swapped, and combinations), mirroring how the engine is expected
//! to behave regardless of backing.  Every sequence ends with a full
//! structural check.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tdb::{Error, Flags, OpenFlags, StoreMode, Tdb};
use tempfile::TempDir;

fn flag_matrix() -> Vec<Flags> {
    vec![
        Flags::INTERNAL,
        Flags::DEFAULT,
        Flags::NOMMAP,
        Flags::CONVERT,
        Flags::INTERNAL | Flags::CONVERT,
        Flags::NOMMAP | Flags::CONVERT,
    ]
}

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
// Test 1: insert / replace / modify semantics
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_store_mode_semantics() {
    let dir = TempDir::new().unwrap();
    for (i, flags) in flag_matrix().into_iter().enumerate() {
        let mut db = open_fresh(&dir, &format!("modes-{i}.tdb"), flags);

        // Modify on an absent key fails.
        assert_eq!(
            db.store(b"key", b"value", StoreMode::Modify),
            Err(Error::Noexist)
        );
        // Insert works once.
        db.store(b"key", b"value", StoreMode::Insert).unwrap();
        assert_eq!(
            db.store(b"key", b"other", StoreMode::Insert),
            Err(Error::Exists)
        );
        assert_eq!(db.fetch(b"key").unwrap(), b"value");
        // Modify now succeeds.
        db.store(b"key", b"changed", StoreMode::Modify).unwrap();
        assert_eq!(db.fetch(b"key").unwrap(), b"changed");
        // Replace always succeeds.
        db.store(b"key", b"replaced", StoreMode::Replace).unwrap();
        assert_eq!(db.fetch(b"key").unwrap(), b"replaced");
        db.check(None).unwrap();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: randomized sequences against a reference map
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_matches_reference_map() {
    let dir = TempDir::new().unwrap();
    for (i, flags) in flag_matrix().into_iter().enumerate() {
        let mut db = open_fresh(&dir, &format!("ref-{i}.tdb"), flags);
        let mut reference: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(0x7db2 + i as u64);

        for step in 0..2000u32 {
            let key = format!("key-{}", rng.gen_range(0..200)).into_bytes();
            match rng.gen_range(0..10) {
                0..=4 => {
                    let val = vec![rng.gen::<u8>(); rng.gen_range(0..512)];
                    db.store(&key, &val, StoreMode::Replace).unwrap();
                    reference.insert(key, val);
                }
                5..=6 => match (db.delete(&key), reference.remove(&key)) {
                    (Ok(()), Some(_)) => {}
                    (Err(Error::Noexist), None) => {}
                    (got, want) => panic!("step {step}: delete {got:?} vs reference {want:?}"),
                },
                7 => {
                    assert_eq!(db.exists(&key), reference.contains_key(&key), "step {step}");
                }
                _ => match (db.fetch(&key), reference.get(&key)) {
                    (Ok(v), Some(want)) => assert_eq!(&v, want, "step {step}"),
                    (Err(Error::Noexist), None) => {}
                    (got, want) => panic!("step {step}: fetch {got:?} vs reference {want:?}"),
                },
            }
        }

        // Everything the reference holds must be present, and vice versa.
        for (k, v) in &reference {
            assert_eq!(&db.fetch(k).unwrap(), v);
        }
        let mut seen = 0u64;
        db.traverse(|_, k, v| {
            assert_eq!(reference.get(k).map(|x| &x[..]), Some(v));
            seen += 1;
            true
        })
        .unwrap();
        assert_eq!(seen as usize, reference.len());
        db.check(None).unwrap();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: empty keys, empty values, binary bytes
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_degenerate_keys_and_values() {
    let dir = TempDir::new().unwrap();
    let mut db = open_fresh(&dir, "degen.tdb", Flags::DEFAULT);

    // Empty value.
    db.store(b"empty-value", b"", StoreMode::Insert).unwrap();
    assert_eq!(db.fetch(b"empty-value").unwrap(), b"");
    // Empty key is a valid key.
    db.store(b"", b"value of empty key", StoreMode::Insert).unwrap();
    assert_eq!(db.fetch(b"").unwrap(), b"value of empty key");
    // Embedded NULs and high bytes survive.
    let key = [0u8, 255, 1, 0, 128];
    let val = [0u8, 0, 0, 7, 255, 254];
    db.store(&key, &val, StoreMode::Insert).unwrap();
    assert_eq!(db.fetch(&key).unwrap(), val);
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: values survive close and reopen
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_persistence_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("persist.tdb");
    {
        let mut db = Tdb::open(
            &path,
            Flags::DEFAULT,
            OpenFlags::RDWR | OpenFlags::CREAT,
            0o600,
            vec![],
        )
        .unwrap();
        for i in 0..500u32 {
            let k = format!("persist-{i}");
            let v = format!("value-{i}").repeat(i as usize % 7 + 1);
            db.store(k.as_bytes(), v.as_bytes(), StoreMode::Insert).unwrap();
        }
    }
    let mut db = Tdb::open(&path, Flags::DEFAULT, OpenFlags::RDWR, 0o600, vec![]).unwrap();
    for i in 0..500u32 {
        let k = format!("persist-{i}");
        let v = format!("value-{i}").repeat(i as usize % 7 + 1);
        assert_eq!(db.fetch(k.as_bytes()).unwrap(), v.as_bytes());
    }
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: read-only handles refuse mutation
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_read_only_refuses_writes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rdonly.tdb");
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
    let mut db = Tdb::open(&path, Flags::DEFAULT, OpenFlags::RDONLY, 0o600, vec![]).unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), b"v");
    assert_eq!(db.store(b"k", b"x", StoreMode::Replace), Err(Error::Rdonly));
    assert_eq!(db.delete(b"k"), Err(Error::Rdonly));
    assert_eq!(db.append(b"k", b"x"), Err(Error::Rdonly));
    assert_eq!(db.transaction_start(), Err(Error::Rdonly));
    // Reads are unaffected.
    assert!(db.exists(b"k"));
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: parse_record sees the bytes in place
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_parse_record() {
    let dir = TempDir::new().unwrap();
    for (i, flags) in flag_matrix().into_iter().enumerate() {
        let mut db = open_fresh(&dir, &format!("parse-{i}.tdb"), flags);
        db.store(b"key", b"some value bytes", StoreMode::Insert).unwrap();
        let len = db.parse_record(b"key", |data| {
            assert_eq!(data, b"some value bytes");
            data.len()
        });
        assert_eq!(len.unwrap(), 16);
        assert_eq!(
            db.parse_record(b"missing", |_| ()).unwrap_err(),
            Error::Noexist
        );
    }
}
