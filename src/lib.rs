// TDB2 — Rust port of the trivial database

//! An embedded key-value store in a single file.
//!
//! Keys and values are opaque byte strings.  The store supports concurrent
//! access from multiple processes through advisory byte-range locks,
//! atomic multi-record transactions with crash recovery, iteration over
//! all live records, and a legacy version-1 on-disk format read and
//! written through the same API.  There is no server, no network and no
//! query language — just a library over a file.
//!
//! ```no_run
//! use tdb::{Flags, OpenFlags, StoreMode, Tdb};
//!
//! let mut db = tdb::Tdb::open(
//!     "app.tdb",
//!     Flags::DEFAULT,
//!     OpenFlags::RDWR | OpenFlags::CREAT,
//!     0o600,
//!     vec![],
//! )?;
//! db.store(b"hello", b"world", StoreMode::Replace)?;
//! assert_eq!(db.fetch(b"hello")?, b"world");
//! # Ok::<(), tdb::Error>(())
//! ```

pub mod attr;
pub mod check;
pub mod db;
pub mod error;
pub mod flags;
pub mod free;
pub mod hash;
pub mod hashing;
pub mod io;
pub mod layout;
pub mod lock;
pub mod open;
pub mod record;
pub mod summary;
pub mod tdb1;
pub mod transaction;
pub mod traverse;

// ─────────────────────────────────────────────────────────────────────────────
// Primary API re-exports
// ─────────────────────────────────────────────────────────────────────────────

/// The database handle; every operation is a method on it.
pub use db::Tdb;

/// Error codes returned by every operation.
pub use error::{Error, LogLevel, Result};

/// Open-time behaviour flags (`INTERNAL`, `NOMMAP`, `SEQNUM`, ...).
pub use flags::Flags;

/// `open(2)`-style access and creation bits.
pub use flags::OpenFlags;

/// Disposition for [`Tdb::store`]: insert, replace or modify.
pub use flags::StoreMode;

/// Open-time attributes: logging, hash override, seed, lock
/// interposition, open hook, v1 bucket count, statistics.
pub use attr::{Attribute, LockKind, LockOps, Stats};

/// Fork support: clear the inherited double-open registry in a child.
pub use open::registry_reset_after_fork;

// ─────────────────────────────────────────────────────────────────────────────
// Format constants occasionally useful to tooling
// ─────────────────────────────────────────────────────────────────────────────

/// v2 magic string, version stamp and lock plan.
pub use layout::{HASH_GROUP_BITS, MAGIC_FOOD, TOPLEVEL_HASH_BITS, VERSION};

/// Default hash (xxh64) and the seed-check constant.
pub use hashing::{default_hash, HASH_MAGIC_CHECK};

/// Default bucket count for newly created v1 databases.
pub use tdb1::DEFAULT_HASH_SIZE;
