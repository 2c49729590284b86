//! Advisory byte-range locking: the fixed address plan, nesting, and the
//! allrecord lock with shared-to-exclusive upgrade.
//!
//! Every lock is an fcntl range on the database file (or a call into the
//! caller's `Flock` attribute).  Lock bytes are plain addresses; they are
//! not required to be backed by file bytes.  Acquisition order is fixed —
//! open, active, transaction, allrecord, free buckets, chains, ascending
//! within each array — and nested acquisition of one byte by one handle is
//! counted rather than re-issued, because fcntl locks do not stack.
//!
//! When the allrecord lock is held, fine-grained locks inside its range are
//! satisfied by a compatibility check alone; taking them again through
//! fcntl would be redundant and, for an exclusive holder, self-deadlocking
//! in spirit.

use std::os::unix::io::{AsRawFd, RawFd};

use nix::errno::Errno;

use crate::attr::LockKind;
use crate::db::Tdb;
use crate::error::{Error, LogLevel, Result};
use crate::layout::{
    ACTIVE_LOCK, FREE_LOCK_START, HASH_GROUP_BITS, HASH_LOCK_START, OPEN_LOCK, SEQNUM_LOCK,
    TOPLEVEL_HASH_BITS, TRANSACTION_LOCK,
};

/// Blocking mode for an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Block,
    NonBlock,
}

/// One held fine-grained lock byte, with its nesting count.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LockRec {
    pub off: u64,
    pub ltype: LockKind,
    pub count: u32,
}

/// State of the database-wide lock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AllrecordLock {
    pub ltype: LockKind,
    pub count: u32,
    /// A shared holder that may later upgrade (transactions do this).
    pub upgradable: bool,
}

/// Issue one fcntl byte-range call, retrying on EINTR.
fn fcntl_lock(fd: RawFd, kind: LockKind, off: u64, len: u64, wait: Wait) -> std::io::Result<()> {
    let mut fl = libc::flock {
        l_type: match kind {
            LockKind::Read => libc::F_RDLCK as libc::c_short,
            LockKind::Write => libc::F_WRLCK as libc::c_short,
        },
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: off as libc::off_t,
        l_len: len as libc::off_t,
        l_pid: 0,
    };
    let cmd = match wait {
        Wait::Block => libc::F_SETLKW,
        Wait::NonBlock => libc::F_SETLK,
    };
    loop {
        // Safety: fl is a valid flock for the duration of the call.
        let rc = unsafe { libc::fcntl(fd, cmd, &mut fl) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match Errno::last() {
            Errno::EINTR => continue,
            Errno::EAGAIN | Errno::EACCES => {
                return Err(std::io::Error::from(std::io::ErrorKind::WouldBlock))
            }
            _ => return Err(err),
        }
    }
}

fn fcntl_unlock(fd: RawFd, off: u64, len: u64) -> std::io::Result<()> {
    let mut fl = libc::flock {
        l_type: libc::F_UNLCK as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: off as libc::off_t,
        l_len: len as libc::off_t,
        l_pid: 0,
    };
    let rc = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut fl) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Lock byte for a top-level hash group.
#[inline]
pub(crate) fn chain_lock_off(group: u64) -> u64 {
    HASH_LOCK_START + group
}

/// Top-level group index for a full hash value.
#[inline]
pub(crate) fn hash_to_group(hash: u64) -> u64 {
    hash >> (64 - (TOPLEVEL_HASH_BITS - HASH_GROUP_BITS))
}

/// Lock byte for a free-list bucket, addressed by the bucket head's file
/// offset so every bucket of every table gets a distinct byte.
#[inline]
pub(crate) fn free_lock_off(bucket_off: u64) -> u64 {
    FREE_LOCK_START + bucket_off / 8
}

impl Tdb {
    fn raw_fd(&self) -> Option<RawFd> {
        self.file.file().map(|f| f.as_raw_fd())
    }

    /// Lowest-level acquire.  Honours NOLOCK, read-only handles, and the
    /// `Flock` attribute.
    pub(crate) fn brlock(&mut self, kind: LockKind, off: u64, len: u64, wait: Wait) -> Result<()> {
        if self.nolock() {
            return Ok(());
        }
        if kind == LockKind::Write && self.read_only {
            self.log(
                LogLevel::Error,
                Error::Rdonly,
                &format!("brlock: write lock at {off} on read-only handle"),
            );
            return Err(Error::Rdonly);
        }
        let fd = match self.raw_fd() {
            Some(fd) => fd,
            None => return Ok(()),
        };
        self.bump(|s| s.locks += 1);
        let res = match &mut self.lock_ops {
            Some(ops) => ops.lock(fd, kind, off, len, wait == Wait::Block),
            None => fcntl_lock(fd, kind, off, len, wait),
        };
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.bump(|s| s.lock_nonblocking_fail += 1);
                Err(Error::Lock)
            }
            Err(e) => {
                self.log(
                    LogLevel::Error,
                    Error::Lock,
                    &format!("brlock: lock at {off} len {len} failed: {e}"),
                );
                Err(Error::Lock)
            }
        }
    }

    /// Lowest-level release.
    pub(crate) fn brunlock(&mut self, off: u64, len: u64) -> Result<()> {
        if self.nolock() {
            return Ok(());
        }
        let fd = match self.raw_fd() {
            Some(fd) => fd,
            None => return Ok(()),
        };
        let res = match &mut self.lock_ops {
            Some(ops) => ops.unlock(fd, off, len),
            None => fcntl_unlock(fd, off, len),
        };
        res.map_err(|e| {
            self.log(
                LogLevel::Error,
                Error::Lock,
                &format!("brunlock: unlock at {off} len {len} failed: {e}"),
            );
            Error::Lock
        })
    }

    /// Counted acquire of one lock byte.  Under the allrecord lock the
    /// request is satisfied by a compatibility check alone.
    pub(crate) fn nest_lock(&mut self, off: u64, kind: LockKind, wait: Wait) -> Result<()> {
        if let Some(ar) = &self.allrecord {
            if kind == LockKind::Write && ar.ltype == LockKind::Read && !ar.upgradable {
                self.log(
                    LogLevel::Error,
                    Error::Lock,
                    "nest_lock: write lock under shared allrecord lock",
                );
                return Err(Error::Lock);
            }
            return Ok(());
        }
        if let Some(rec) = self.lockrecs.iter_mut().find(|r| r.off == off) {
            if kind == LockKind::Write && rec.ltype == LockKind::Read {
                self.log(
                    LogLevel::Error,
                    Error::Lock,
                    &format!("nest_lock: upgrade of nested lock at {off} not supported"),
                );
                return Err(Error::Lock);
            }
            rec.count += 1;
            return Ok(());
        }
        self.brlock(kind, off, 1, wait)?;
        self.lockrecs.push(LockRec {
            off,
            ltype: kind,
            count: 1,
        });
        Ok(())
    }

    /// Counted release of one lock byte.
    pub(crate) fn nest_unlock(&mut self, off: u64) -> Result<()> {
        if self.allrecord.is_some() {
            return Ok(());
        }
        let idx = match self.lockrecs.iter().position(|r| r.off == off) {
            Some(i) => i,
            None => {
                self.log(
                    LogLevel::Error,
                    Error::Lock,
                    &format!("nest_unlock: lock at {off} not held"),
                );
                return Err(Error::Lock);
            }
        };
        self.lockrecs[idx].count -= 1;
        if self.lockrecs[idx].count == 0 {
            self.lockrecs.swap_remove(idx);
            self.brunlock(off, 1)?;
            if self.lockrecs.is_empty() {
                // Another handle may change volatile header state from
                // here on; re-read it under the next lock.
                self.header_uptodate = false;
            }
        }
        Ok(())
    }

    // ── Chain and free-bucket locks ──────────────────────────────────────────

    pub(crate) fn lock_hash_group(&mut self, group: u64, kind: LockKind, wait: Wait) -> Result<()> {
        self.nest_lock(chain_lock_off(group), kind, wait)
    }

    pub(crate) fn unlock_hash_group(&mut self, group: u64) -> Result<()> {
        self.nest_unlock(chain_lock_off(group))
    }

    /// Free-bucket locks are always exclusive: even a lookup walks list
    /// links that a concurrent unlink would tear.
    pub(crate) fn lock_free_bucket(&mut self, bucket_off: u64, wait: Wait) -> Result<()> {
        self.nest_lock(free_lock_off(bucket_off), LockKind::Write, wait)
    }

    pub(crate) fn unlock_free_bucket(&mut self, bucket_off: u64) -> Result<()> {
        self.nest_unlock(free_lock_off(bucket_off))
    }

    // ── Allrecord lock ───────────────────────────────────────────────────────

    /// Take (or nest) the database-wide lock.  `upgradable` marks a shared
    /// acquisition that may later become exclusive; only one level of
    /// upgrade is tracked, which is all the transaction code needs.
    pub(crate) fn allrecord_lock(
        &mut self,
        kind: LockKind,
        wait: Wait,
        upgradable: bool,
    ) -> Result<()> {
        if let Some(ar) = &mut self.allrecord {
            if ar.ltype == kind {
                ar.count += 1;
                return Ok(());
            }
            self.log(
                LogLevel::Error,
                Error::Lock,
                "allrecord_lock: incompatible nesting",
            );
            return Err(Error::Lock);
        }
        if !self.lockrecs.is_empty() {
            // Taking the big lock above fine-grained ones inverts the order.
            self.log(
                LogLevel::Error,
                Error::Lock,
                "allrecord_lock: chain locks still held",
            );
            return Err(Error::Lock);
        }
        self.brlock(kind, HASH_LOCK_START, 0, wait)?;
        self.allrecord = Some(AllrecordLock {
            ltype: kind,
            count: 1,
            upgradable,
        });
        Ok(())
    }

    /// Upgrade a shared, upgradable allrecord lock to exclusive in place.
    pub(crate) fn allrecord_upgrade(&mut self, wait: Wait) -> Result<()> {
        match &self.allrecord {
            Some(ar) if ar.ltype == LockKind::Read && ar.upgradable => {}
            _ => {
                self.log(
                    LogLevel::Error,
                    Error::Lock,
                    "allrecord_upgrade: lock not held shared-upgradable",
                );
                return Err(Error::Lock);
            }
        }
        self.brlock(LockKind::Write, HASH_LOCK_START, 0, wait)?;
        if let Some(ar) = &mut self.allrecord {
            ar.ltype = LockKind::Write;
        }
        Ok(())
    }

    pub(crate) fn allrecord_unlock(&mut self) -> Result<()> {
        let ar = match &mut self.allrecord {
            Some(ar) => ar,
            None => {
                self.log(
                    LogLevel::Error,
                    Error::Lock,
                    "allrecord_unlock: lock not held",
                );
                return Err(Error::Lock);
            }
        };
        ar.count -= 1;
        if ar.count == 0 {
            self.allrecord = None;
            self.brunlock(HASH_LOCK_START, 0)?;
            self.header_uptodate = false;
        }
        Ok(())
    }

    pub(crate) fn have_allrecord(&self, kind: LockKind) -> bool {
        match &self.allrecord {
            Some(ar) => kind == LockKind::Read || ar.ltype == LockKind::Write,
            None => false,
        }
    }

    // ── Fixed single-byte locks ──────────────────────────────────────────────

    pub(crate) fn lock_open(&mut self) -> Result<()> {
        self.brlock(LockKind::Write, OPEN_LOCK, 1, Wait::Block)
    }

    pub(crate) fn unlock_open(&mut self) -> Result<()> {
        self.brunlock(OPEN_LOCK, 1)
    }

    /// Probe whether we are the only opener: an exclusive grab of the
    /// active byte succeeds only when nobody else holds it shared.
    pub(crate) fn probe_first_opener(&mut self) -> Result<bool> {
        match self.brlock(LockKind::Write, ACTIVE_LOCK, 1, Wait::NonBlock) {
            Ok(()) => {
                self.brunlock(ACTIVE_LOCK, 1)?;
                Ok(true)
            }
            Err(Error::Lock) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Taken shared for the lifetime of every handle.
    pub(crate) fn lock_active(&mut self) -> Result<()> {
        self.brlock(LockKind::Read, ACTIVE_LOCK, 1, Wait::Block)
    }

    pub(crate) fn unlock_active(&mut self) -> Result<()> {
        self.brunlock(ACTIVE_LOCK, 1)
    }

    pub(crate) fn lock_transaction(&mut self, wait: Wait) -> Result<()> {
        self.brlock(LockKind::Write, TRANSACTION_LOCK, 1, wait)
    }

    pub(crate) fn unlock_transaction(&mut self) -> Result<()> {
        self.brunlock(TRANSACTION_LOCK, 1)
    }

    pub(crate) fn lock_seqnum(&mut self) -> Result<()> {
        self.brlock(LockKind::Write, SEQNUM_LOCK, 1, Wait::Block)
    }

    pub(crate) fn unlock_seqnum(&mut self) -> Result<()> {
        self.brunlock(SEQNUM_LOCK, 1)
    }

    /// Drop every fine-grained lock this handle still holds, newest first.
    /// Used by close and by failing operations.
    pub(crate) fn release_all_fine_locks(&mut self) {
        while let Some(rec) = self.lockrecs.pop() {
            let _ = self.brunlock(rec.off, 1);
        }
    }
}

// ── Public lock API ───────────────────────────────────────────────────────────

impl Tdb {
    /// Expose the hash-group lock covering `key` for a user-level critical
    /// section.  Blocks until available.
    pub fn chainlock(&mut self, key: &[u8]) -> Result<()> {
        let h = self.hash_of(key);
        self.lock_hash_group(hash_to_group(h), LockKind::Write, Wait::Block)
    }

    /// Non-blocking variant of [`Tdb::chainlock`]; fails with `Lock` when
    /// another handle holds the group.
    pub fn chainlock_nonblock(&mut self, key: &[u8]) -> Result<()> {
        let h = self.hash_of(key);
        self.lock_hash_group(hash_to_group(h), LockKind::Write, Wait::NonBlock)
    }

    /// Release a [`Tdb::chainlock`].
    pub fn chainunlock(&mut self, key: &[u8]) -> Result<()> {
        let h = self.hash_of(key);
        self.unlock_hash_group(hash_to_group(h))
    }

    /// Shared chain lock, for callers who only read.
    pub fn chainlock_read(&mut self, key: &[u8]) -> Result<()> {
        let h = self.hash_of(key);
        self.lock_hash_group(hash_to_group(h), LockKind::Read, Wait::Block)
    }

    /// Release a [`Tdb::chainlock_read`].
    pub fn chainunlock_read(&mut self, key: &[u8]) -> Result<()> {
        let h = self.hash_of(key);
        self.unlock_hash_group(hash_to_group(h))
    }

    /// Database-wide exclusive lock.
    pub fn lockall(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(Error::Lock);
        }
        self.allrecord_lock(LockKind::Write, Wait::Block, false)
    }

    /// Non-blocking [`Tdb::lockall`].
    pub fn lockall_nonblock(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(Error::Lock);
        }
        self.allrecord_lock(LockKind::Write, Wait::NonBlock, false)
    }

    pub fn unlockall(&mut self) -> Result<()> {
        self.allrecord_unlock()
    }

    /// Database-wide shared lock.
    pub fn lockall_read(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(Error::Lock);
        }
        self.allrecord_lock(LockKind::Read, Wait::Block, false)
    }

    /// Non-blocking [`Tdb::lockall_read`].
    pub fn lockall_read_nonblock(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(Error::Lock);
        }
        self.allrecord_lock(LockKind::Read, Wait::NonBlock, false)
    }

    pub fn unlockall_read(&mut self) -> Result<()> {
        self.allrecord_unlock()
    }
}
