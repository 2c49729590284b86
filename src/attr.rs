//! Open-time attributes: logging, hash override, seed, lock interposition,
//! open hook, v1 hash size and statistics collection.
//!
//! Attributes form a closed set; there is no escape hatch for unknown
//! kinds.  Passing two attributes of the same kind to `open` is rejected
//! with `Einval`.

use std::os::unix::io::RawFd;

use crate::error::LogLevel;

/// Logging hook: receives the severity and a formatted message.
///
/// Called with no store locks guaranteed; the callback must not re-enter
/// the handle (it has no access to it, by construction).
pub type LogFn = Box<dyn Fn(LogLevel, &str)>;

/// Seeded 64-bit hash over a byte string.  Must be pure: equal inputs give
/// equal outputs for the lifetime of the database file.
pub type HashFn = Box<dyn Fn(&[u8], u64) -> u64>;

/// Open hook: runs while the open lock is held, before the header is read,
/// so it may truncate or pre-populate the file.  Receives the raw fd.
pub type OpenHookFn = Box<dyn FnMut(RawFd) -> std::io::Result<()>>;

/// Byte-range lock interposition.  The default implementation issues
/// `fcntl(F_SETLK/F_SETLKW)`; tests substitute failure injectors and
/// timeout wrappers through this trait.
///
/// No store lock is held when these methods run.
pub trait LockOps {
    /// Acquire `len` bytes at `off` (len 0 = to end of file).  `rw` selects
    /// read or write; `wait` selects blocking mode.  Return
    /// `WouldBlock`-kinded errors for contention in non-blocking mode.
    fn lock(&mut self, fd: RawFd, rw: LockKind, off: u64, len: u64, wait: bool)
        -> std::io::Result<()>;
    /// Release `len` bytes at `off`.
    fn unlock(&mut self, fd: RawFd, off: u64, len: u64) -> std::io::Result<()>;
}

/// Read or write lock, for [`LockOps`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

/// One open-time attribute.
pub enum Attribute {
    /// Receive log messages instead of the `log` facade.
    Log(LogFn),
    /// Replace the built-in xxh64 hash.  The file records a check value,
    /// so reopening with a different hash fails.
    Hash(HashFn),
    /// Fix the hash seed instead of drawing a random one (new files only).
    Seed(u64),
    /// Interpose on every byte-range lock call.
    Flock(Box<dyn LockOps>),
    /// Run under the open lock before the header is read.
    OpenHook(OpenHookFn),
    /// Bucket count for newly created version-1 databases.
    Tdb1Hashsize(u32),
    /// Collect operation counters, readable via [`Tdb::stats`].
    ///
    /// [`Tdb::stats`]: crate::Tdb::stats
    Stats,
}

impl Attribute {
    /// Discriminant index used for duplicate detection.
    pub(crate) fn kind(&self) -> usize {
        match self {
            Attribute::Log(_) => 0,
            Attribute::Hash(_) => 1,
            Attribute::Seed(_) => 2,
            Attribute::Flock(_) => 3,
            Attribute::OpenHook(_) => 4,
            Attribute::Tdb1Hashsize(_) => 5,
            Attribute::Stats => 6,
        }
    }
}

/// Operation counters, collected when the [`Attribute::Stats`] attribute
/// was given at open.  All counters are monotone.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Calls into the allocator.
    pub allocs: u64,
    /// Allocations satisfied from the first bucket probed.
    pub alloc_bucket_exact: u64,
    /// Allocations that fell through to the last bucket.
    pub alloc_bucket_max: u64,
    /// Free-list coalesce operations performed.
    pub alloc_coalesce_tried: u64,
    /// Coalesces that actually merged a neighbour.
    pub alloc_coalesce_succeeded: u64,
    /// Records handed back to the free lists.
    pub frees: u64,
    /// File expansions.
    pub expands: u64,
    /// Hash group promotions into a sublevel.
    pub subhashes: u64,
    /// Chain records appended after hash exhaustion.
    pub chains: u64,
    /// Key comparisons that went to the key bytes.
    pub compares: u64,
    /// Comparisons rejected early by cached hash bits.
    pub compare_wrong_rec_hash: u64,
    /// fcntl lock acquisitions (lowlevel, after nesting collapse).
    pub locks: u64,
    /// Non-blocking lock attempts that failed.
    pub lock_nonblocking_fail: u64,
    /// Transactions committed.
    pub transactions: u64,
    /// Transactions cancelled.
    pub transaction_cancels: u64,
    /// Traversals started.
    pub traverses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_kinds_distinct() {
        let attrs: Vec<Attribute> = vec![
            Attribute::Log(Box::new(|_, _| {})),
            Attribute::Hash(Box::new(|_, s| s)),
            Attribute::Seed(7),
            Attribute::OpenHook(Box::new(|_| Ok(()))),
            Attribute::Tdb1Hashsize(131),
            Attribute::Stats,
        ];
        let mut seen = std::collections::HashSet::new();
        for a in &attrs {
            assert!(seen.insert(a.kind()), "duplicate kind {}", a.kind());
        }
    }
}
