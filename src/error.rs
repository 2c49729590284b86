//! Error codes surfaced by every database operation.
//!
//! All failures are reported by return value as a fieldless [`Error`];
//! diagnostic detail (offsets, errno text, corrupt field values) goes to the
//! logging hook instead of riding inside the error, so codes stay `Copy` and
//! trivially comparable in tests.

use core::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Error codes returned by database operations.
///
/// The discriminants are stable and mirror the traditional `TDB_ERR_*`
/// numbering (negative when crossing a C boundary; here they are simply
/// enum variants).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Structural damage detected: bad magic, broken free list, an
    /// unreachable record, or a header that fails validation.
    Corrupt,
    /// An OS-level read, write, truncate, map or sync failed, or the file
    /// is not a database this library understands.
    Io,
    /// A non-blocking lock request found the range held elsewhere, or lock
    /// state was misused (unlock without lock, wrong order).
    Lock,
    /// No free region large enough, even after growing the file, or an
    /// in-memory allocation for the overlay failed.
    Oom,
    /// `store` with [`StoreMode::Insert`] found the key already present.
    ///
    /// [`StoreMode::Insert`]: crate::flags::StoreMode::Insert
    Exists,
    /// The key is not in the database.
    Noexist,
    /// Malformed argument: duplicate attribute, unknown flag bit, an
    /// immutable flag passed to `add_flag`/`remove_flag`, and similar misuse.
    Einval,
    /// A mutating operation was issued on a read-only handle.
    Rdonly,
    /// The same device/inode is already open in this process.  fcntl locks
    /// do not nest across handles, so a second open would self-deadlock.
    Busy,
    /// `transaction_start` inside a live transaction without
    /// `Flags::ALLOW_NESTING`, or an inner cancel poisoned the outer commit.
    Nesting,
}

impl Error {
    /// Stable identifier string, usable in logs and CLI output.
    pub fn name(self) -> &'static str {
        match self {
            Error::Corrupt => "ERR_CORRUPT",
            Error::Io => "ERR_IO",
            Error::Lock => "ERR_LOCK",
            Error::Oom => "ERR_OOM",
            Error::Exists => "ERR_EXISTS",
            Error::Noexist => "ERR_NOEXIST",
            Error::Einval => "ERR_EINVAL",
            Error::Rdonly => "ERR_RDONLY",
            Error::Busy => "ERR_BUSY",
            Error::Nesting => "ERR_NESTING",
        }
    }

    /// Human-readable description.
    pub fn message(self) -> &'static str {
        match self {
            Error::Corrupt => "corrupt database",
            Error::Io => "I/O error",
            Error::Lock => "locking error",
            Error::Oom => "out of memory",
            Error::Exists => "record exists",
            Error::Noexist => "record does not exist",
            Error::Einval => "invalid parameter",
            Error::Rdonly => "read-only database",
            Error::Busy => "database is busy",
            Error::Nesting => "transaction nesting error",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for Error {}

/// Severity passed to the logging hook.  Order matters: `Fatal` is the
/// most severe and `Trace` the least, so filters can compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Fatal,
    Error,
    Warning,
    Trace,
}

impl LogLevel {
    /// Map onto the `log` facade's levels for the default sink.
    pub(crate) fn to_log(self) -> log::Level {
        match self {
            LogLevel::Fatal | LogLevel::Error => log::Level::Error,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_display() {
        let all = [
            Error::Corrupt,
            Error::Io,
            Error::Lock,
            Error::Oom,
            Error::Exists,
            Error::Noexist,
            Error::Einval,
            Error::Rdonly,
            Error::Busy,
            Error::Nesting,
        ];
        for e in all {
            assert!(e.name().starts_with("ERR_"));
            assert!(!e.message().is_empty());
            assert_eq!(format!("{e}"), e.message());
        }
    }

    #[test]
    fn level_order() {
        assert!(LogLevel::Fatal < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Trace);
    }
}
