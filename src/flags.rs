//! Open-time flags, `open(2)`-style mode bits and store modes.

use crate::error::{Error, Result};

/// Database behaviour flags, combined with `|`.
///
/// A subset may be toggled after open via [`Tdb::add_flag`] /
/// [`Tdb::remove_flag`]; the structural ones (`INTERNAL`, `CONVERT`,
/// `VERSION1`) are fixed for the lifetime of the handle.
///
/// [`Tdb::add_flag`]: crate::Tdb::add_flag
/// [`Tdb::remove_flag`]: crate::Tdb::remove_flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags(pub u32);

impl Flags {
    /// No special behaviour.
    pub const DEFAULT: Flags = Flags(0);
    /// Memory-only database: no file, no locks, no mapping.
    pub const INTERNAL: Flags = Flags(1 << 0);
    /// Skip all fcntl locking.  The caller promises external serialization.
    pub const NOLOCK: Flags = Flags(1 << 1);
    /// Use pread/pwrite instead of mmap.
    pub const NOMMAP: Flags = Flags(1 << 2);
    /// The file is opposite-endian; convert every integer field on I/O.
    /// Set automatically when an opposite-endian file is opened; set it
    /// explicitly at creation to build a foreign-endian database.
    pub const CONVERT: Flags = Flags(1 << 3);
    /// Skip fsync/msync.  Faster, but a crash may lose the last commits.
    pub const NOSYNC: Flags = Flags(1 << 4);
    /// Maintain the header sequence number on every modifying operation.
    pub const SEQNUM: Flags = Flags(1 << 5);
    /// Permit nested `transaction_start`.
    pub const ALLOW_NESTING: Flags = Flags(1 << 6);
    /// Create (or require) the legacy version-1 format.
    pub const VERSION1: Flags = Flags(1 << 7);

    const ALL: u32 = (1 << 8) - 1;
    /// Flags that may not change after open.
    const IMMUTABLE: u32 = Self::INTERNAL.0 | Self::CONVERT.0 | Self::VERSION1.0;

    /// True if every bit of `other` is set in `self`.
    #[inline]
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }

    /// Reject unknown bits at open time.
    pub(crate) fn validate(self) -> Result<()> {
        if self.0 & !Self::ALL != 0 {
            return Err(Error::Einval);
        }
        Ok(())
    }

    /// True when `other` is a single, runtime-mutable flag.
    pub(crate) fn mutable(other: Flags) -> bool {
        other.0 != 0 && other.0 & !Self::ALL == 0 && other.0 & Self::IMMUTABLE == 0
    }
}

impl core::ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

/// How the file is opened, mirroring the `open(2)` access and creation
/// bits the store cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags(0);
    pub const RDWR: OpenFlags = OpenFlags(1 << 0);
    pub const CREAT: OpenFlags = OpenFlags(1 << 1);
    pub const TRUNC: OpenFlags = OpenFlags(1 << 2);
    pub const EXCL: OpenFlags = OpenFlags(1 << 3);

    #[inline]
    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for OpenFlags {
    type Output = OpenFlags;
    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

/// Store disposition for [`Tdb::store`].
///
/// [`Tdb::store`]: crate::Tdb::store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Fail with [`Error::Exists`] if the key is present.
    Insert,
    /// Unconditionally set the key.
    Replace,
    /// Fail with [`Error::Noexist`] if the key is absent.
    Modify,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_algebra() {
        let f = Flags::NOMMAP | Flags::SEQNUM;
        assert!(f.contains(Flags::NOMMAP));
        assert!(f.contains(Flags::SEQNUM));
        assert!(!f.contains(Flags::NOLOCK));
        assert!(f.validate().is_ok());
        assert!(Flags(1 << 20).validate().is_err());
    }

    #[test]
    fn mutability_classes() {
        assert!(Flags::mutable(Flags::NOSYNC));
        assert!(Flags::mutable(Flags::SEQNUM));
        assert!(!Flags::mutable(Flags::INTERNAL));
        assert!(!Flags::mutable(Flags::CONVERT));
        assert!(!Flags::mutable(Flags::VERSION1));
        assert!(!Flags::mutable(Flags::DEFAULT));
    }
}
