//! E2E Suite 08: cross-process locking
//!
//! fcntl locks only mean anything between processes, so the contention
//! tests fork: the child resets the inherited double-open registry,
//! opens its own handle and reports what the lock protocol told it via
//! its exit status.  The non-forking tests drive the lock interposition
//! attribute: a wrapper that turns every blocking acquire into a
//! non-blocking one makes "store under someone else's chain lock"
//! observable as `Error::Lock`, and a counting wrapper proves failed
//! operations release everything they took.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use tdb::{Attribute, Error, Flags, LockKind, LockOps, OpenFlags, StoreMode, Tdb};
use tempfile::TempDir;

fn open_at(path: &std::path::Path, attrs: Vec<Attribute>) -> Tdb {
    Tdb::open(
        path,
        Flags::DEFAULT,
        OpenFlags::RDWR | OpenFlags::CREAT,
        0o600,
        attrs,
    )
    .expect("open")
}

/// Forward to fcntl but never block: contention surfaces immediately.
struct NonBlocking;

impl LockOps for NonBlocking {
    fn lock(&mut self, fd: RawFd, rw: LockKind, off: u64, len: u64, _wait: bool)
        -> std::io::Result<()> {
        default_fcntl(fd, Some(rw), off, len, false)
    }

    fn unlock(&mut self, fd: RawFd, off: u64, len: u64) -> std::io::Result<()> {
        default_fcntl(fd, None, off, len, false)
    }
}

/// Count net outstanding acquisitions.
struct Counting(Arc<AtomicI64>);

impl LockOps for Counting {
    fn lock(&mut self, fd: RawFd, rw: LockKind, off: u64, len: u64, wait: bool)
        -> std::io::Result<()> {
        default_fcntl(fd, Some(rw), off, len, wait)?;
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unlock(&mut self, fd: RawFd, off: u64, len: u64) -> std::io::Result<()> {
        default_fcntl(fd, None, off, len, false)?;
        self.0.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A plain fcntl byte-range call, the same thing the engine does when no
/// attribute interposes.
fn default_fcntl(
    fd: RawFd,
    rw: Option<LockKind>,
    off: u64,
    len: u64,
    wait: bool,
) -> std::io::Result<()> {
    let mut fl = libc::flock {
        l_type: match rw {
            Some(LockKind::Read) => libc::F_RDLCK as libc::c_short,
            Some(LockKind::Write) => libc::F_WRLCK as libc::c_short,
            None => libc::F_UNLCK as libc::c_short,
        },
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: off as libc::off_t,
        l_len: len as libc::off_t,
        l_pid: 0,
    };
    let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
    let rc = unsafe { libc::fcntl(fd, cmd, &mut fl) };
    if rc == 0 {
        Ok(())
    } else {
        let err = std::io::Error::last_os_error();
        if matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EACCES)) {
            Err(std::io::Error::from(std::io::ErrorKind::WouldBlock))
        } else {
            Err(err)
        }
    }
}

/// Run `child` in a forked process; return its exit code.
fn in_child(child: impl FnOnce() -> i32) -> i32 {
    match unsafe { fork() }.expect("fork") {
        ForkResult::Parent { child: pid } => match waitpid(pid, None).expect("waitpid") {
            WaitStatus::Exited(_, code) => code,
            other => panic!("child did not exit cleanly: {other:?}"),
        },
        ForkResult::Child => {
            // The child owns nothing of the parent's: drop the inherited
            // registry and never touch the parent's handle.
            tdb::registry_reset_after_fork();
            let code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(child))
                .unwrap_or(120);
            unsafe { libc::_exit(code) };
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// The fork scenarios live in one test: one child at a time, states in
// sequence, no other harness threads in play between forks.
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_cross_process_lock_protocol() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("locks.tdb");
    let mut db = open_at(&path, vec![]);
    db.store(b"k", b"parent value", StoreMode::Insert).unwrap();

    // 1. Parent holds the chain lock for "k": a non-blocking store of
    //    "k" elsewhere must fail with LOCK.
    db.chainlock(b"k").unwrap();
    let code = in_child(|| {
        let mut other = open_at(&path, vec![Attribute::Flock(Box::new(NonBlocking))]);
        match other.store(b"k", b"child value", StoreMode::Replace) {
            Err(Error::Lock) => 0,
            other => {
                eprintln!("unexpected store result: {other:?}");
                1
            }
        }
    });
    assert_eq!(code, 0, "child should have hit LOCK");

    // ...and a non-blocking chainlock on the same group fails too.
    let code = in_child(|| {
        let mut other = open_at(&path, vec![]);
        match other.chainlock_nonblock(b"k") {
            Err(Error::Lock) => 0,
            other => {
                eprintln!("unexpected chainlock result: {other:?}");
                1
            }
        }
    });
    assert_eq!(code, 0);

    // 2. Parent releases: the child's store now goes through.
    db.chainunlock(b"k").unwrap();
    let code = in_child(|| {
        let mut other = open_at(&path, vec![Attribute::Flock(Box::new(NonBlocking))]);
        match other.store(b"k", b"child value", StoreMode::Replace) {
            Ok(()) => 0,
            other => {
                eprintln!("unexpected store result: {other:?}");
                1
            }
        }
    });
    assert_eq!(code, 0, "child store should succeed after release");
    assert_eq!(db.fetch(b"k").unwrap(), b"child value");

    // 3. Exclusive allrecord locks exclude each other.
    db.lockall().unwrap();
    let code = in_child(|| {
        let mut other = open_at(&path, vec![]);
        match other.lockall_nonblock() {
            Err(Error::Lock) => 0,
            other => {
                eprintln!("unexpected lockall result: {other:?}");
                1
            }
        }
    });
    assert_eq!(code, 0, "two exclusive allrecord locks at once");

    // 4. Shared allrecord locks coexist.
    db.unlockall().unwrap();
    db.lockall_read().unwrap();
    let code = in_child(|| {
        let mut other = open_at(&path, vec![]);
        match other.lockall_read_nonblock() {
            Ok(()) => {
                let _ = other.unlockall_read();
                0
            }
            other => {
                eprintln!("unexpected shared lockall result: {other:?}");
                1
            }
        }
    });
    assert_eq!(code, 0, "shared allrecord locks should coexist");
    db.unlockall_read().unwrap();

    // 5. A transaction excludes other writers until it finishes.
    db.transaction_start().unwrap();
    db.store(b"txn", b"pending", StoreMode::Insert).unwrap();
    let code = in_child(|| {
        let mut other = open_at(&path, vec![Attribute::Flock(Box::new(NonBlocking))]);
        match other.store(b"unrelated", b"blocked", StoreMode::Replace) {
            Err(Error::Lock) => 0,
            other => {
                eprintln!("unexpected store-during-transaction: {other:?}");
                1
            }
        }
    });
    assert_eq!(code, 0, "writer should be excluded during a transaction");
    db.transaction_commit().unwrap();
    db.check(None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// In-process lock-attribute behaviour
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_failed_operations_release_their_locks() {
    let dir = TempDir::new().unwrap();
    let outstanding = Arc::new(AtomicI64::new(0));
    let mut db = open_at(
        &dir.path().join("balance.tdb"),
        vec![Attribute::Flock(Box::new(Counting(outstanding.clone())))],
    );

    db.store(b"present", b"v", StoreMode::Insert).unwrap();
    // Failing operations of every shape...
    assert_eq!(db.store(b"present", b"x", StoreMode::Insert), Err(Error::Exists));
    assert_eq!(db.store(b"absent", b"x", StoreMode::Modify), Err(Error::Noexist));
    assert_eq!(db.delete(b"absent"), Err(Error::Noexist));
    assert_eq!(db.fetch(b"absent"), Err(Error::Noexist));
    // ...leave no lock outstanding (the lifetime ACTIVE lock stays).
    assert_eq!(outstanding.load(Ordering::SeqCst), 1, "leaked byte-range locks");

    drop(db);
    assert_eq!(outstanding.load(Ordering::SeqCst), 0, "locks leaked at close");
}

#[test]
fn test_double_open_same_process_is_busy() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("busy.tdb");
    let _db = open_at(&path, vec![]);
    match Tdb::open(&path, Flags::DEFAULT, OpenFlags::RDWR, 0o600, vec![]) {
        Err(Error::Busy) => {}
        other => panic!("second open should be Busy, got {:?}", other.map(|_| ())),
    }
}
