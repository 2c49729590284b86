//! Opening, creating and closing databases.
//!
//! The open sequence serializes initialization under the open lock byte,
//! detects the on-disk format (v2, byte-swapped v2, or legacy v1), checks
//! that the caller's hash function matches the one the file was built
//! with, and — when this handle is the first opener — replays any
//! interrupted commit before anyone can see it.
//!
//! A process-wide registry keyed by `(device, inode)` refuses to open the
//! same file twice in one process: fcntl locks are per-process, so a
//! second handle would silently bypass the lock protocol.

use std::fs::OpenOptions;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Mutex;

use crate::attr::{Attribute, HashFn};
use crate::db::Tdb;
use crate::error::{Error, LogLevel, Result};
use crate::flags::{Flags, OpenFlags};
use crate::free::FTABLE_PAYLOAD;
use crate::hashing::{default_hash, hash_test_value};
use crate::io::TdbFile;
use crate::layout::{
    Header, Magic, DATA_START, FEATURES_KNOWN, HEADER_SIZE, TOPLEVEL_HASH_BITS, VERSION,
};
use crate::record::{UsedRec, CAP_NOOPEN, CAP_TYPE_MASK, REC_HDR_SIZE};

/// Open handles in this process, by `(device, inode)`.
static OPEN_DBS: Mutex<Vec<(u64, u64)>> = Mutex::new(Vec::new());

fn registry_insert(dev: u64, ino: u64) -> Result<()> {
    let mut reg = OPEN_DBS.lock().expect("registry poisoned");
    if reg.contains(&(dev, ino)) {
        return Err(Error::Busy);
    }
    reg.push((dev, ino));
    Ok(())
}

fn registry_remove(dev: u64, ino: u64) {
    let mut reg = OPEN_DBS.lock().expect("registry poisoned");
    if let Some(i) = reg.iter().position(|&e| e == (dev, ino)) {
        reg.swap_remove(i);
    }
}

/// Forget every registry entry.  A forked child inherits the parent's
/// registry but none of its fcntl locks, so the inherited entries would
/// wrongly refuse a fresh open.  Call this in the child, before touching
/// any database, and never in a process that still uses its handles.
pub fn registry_reset_after_fork() {
    OPEN_DBS.lock().expect("registry poisoned").clear();
}

/// Attribute values unpacked from the open call.
struct OpenConfig {
    log_fn: Option<crate::attr::LogFn>,
    hash_fn: HashFn,
    seed: Option<u64>,
    lock_ops: Option<Box<dyn crate::attr::LockOps>>,
    open_hook: Option<crate::attr::OpenHookFn>,
    v1_hashsize: Option<u32>,
    stats: bool,
}

fn unpack_attrs(attrs: Vec<Attribute>) -> Result<OpenConfig> {
    let mut seen = [false; 7];
    let mut cfg = OpenConfig {
        log_fn: None,
        hash_fn: Box::new(default_hash),
        seed: None,
        lock_ops: None,
        open_hook: None,
        v1_hashsize: None,
        stats: false,
    };
    for a in attrs {
        let k = a.kind();
        if seen[k] {
            return Err(Error::Einval);
        }
        seen[k] = true;
        match a {
            Attribute::Log(f) => cfg.log_fn = Some(f),
            Attribute::Hash(f) => cfg.hash_fn = f,
            Attribute::Seed(s) => cfg.seed = Some(s),
            Attribute::Flock(ops) => cfg.lock_ops = Some(ops),
            Attribute::OpenHook(h) => cfg.open_hook = Some(h),
            Attribute::Tdb1Hashsize(n) => {
                if n == 0 {
                    return Err(Error::Einval);
                }
                cfg.v1_hashsize = Some(n);
            }
            Attribute::Stats => cfg.stats = true,
        }
    }
    Ok(cfg)
}

/// Serialized image of a fresh, empty v2 database.
fn new_database_image(hash_fn: &HashFn, seed: u64, convert: bool) -> Result<Vec<u8>> {
    let header = Header {
        version: VERSION,
        hash_seed: seed,
        hash_test: hash_test_value(hash_fn, seed),
        feature_bits: 0,
        recovery: 0,
        seqnum: 0,
        free_table: DATA_START,
        capabilities: 0,
        generation: 0,
        hash_off: HEADER_SIZE,
        hash_bits: TOPLEVEL_HASH_BITS as u64,
    };
    let conv = |v: u64| if convert { v.swap_bytes() } else { v };
    let mut image = Vec::with_capacity((DATA_START + REC_HDR_SIZE + FTABLE_PAYLOAD) as usize);
    image.extend_from_slice(&header.to_bytes(convert));
    // Empty root table.
    image.resize(DATA_START as usize, 0);
    // One free table with empty buckets.
    let frec = UsedRec::set_header(0, FTABLE_PAYLOAD, 0, 0, Magic::FreeTable)?;
    let (w0, w1) = frec.words();
    image.extend_from_slice(&conv(w0).to_le_bytes());
    image.extend_from_slice(&conv(w1).to_le_bytes());
    image.resize(image.len() + FTABLE_PAYLOAD as usize, 0);
    Ok(image)
}

impl Tdb {
    /// Open or create the database at `path`.
    ///
    /// `mode` is the permission bits for newly created files.  Attributes
    /// configure hashing, logging, locking, statistics and the v1 bucket
    /// count; duplicates of one kind are rejected.
    pub fn open<P: AsRef<Path>>(
        path: P,
        flags: Flags,
        open_flags: OpenFlags,
        mode: u32,
        attrs: Vec<Attribute>,
    ) -> Result<Tdb> {
        flags.validate()?;
        let mut cfg = unpack_attrs(attrs)?;
        let path = path.as_ref();

        if flags.contains(Flags::INTERNAL) {
            return Tdb::open_internal(path, flags, cfg);
        }

        let read_only = !open_flags.contains(OpenFlags::RDWR);
        if read_only
            && (open_flags.contains(OpenFlags::CREAT) || open_flags.contains(OpenFlags::TRUNC))
        {
            return Err(Error::Einval);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(open_flags.contains(OpenFlags::CREAT))
            .create_new(open_flags.contains(OpenFlags::EXCL))
            .truncate(open_flags.contains(OpenFlags::TRUNC))
            .mode(mode)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|_| Error::Io)?;
        let meta = file.metadata().map_err(|_| Error::Io)?;
        let (dev, ino) = (meta.dev(), meta.ino());
        registry_insert(dev, ino)?;

        let tdb_file = match TdbFile::new_file(
            file,
            meta.len(),
            flags.contains(Flags::NOMMAP),
            flags.contains(Flags::CONVERT),
            flags.contains(Flags::NOSYNC),
            dev,
            ino,
        ) {
            Ok(f) => f,
            Err(e) => {
                registry_remove(dev, ino);
                return Err(e);
            }
        };

        let mut tdb = Tdb {
            name: path.to_path_buf(),
            file: tdb_file,
            flags,
            read_only,
            header: Header::default(),
            header_uptodate: false,
            ftables: Vec::new(),
            last_ftable: 0,
            lockrecs: Vec::new(),
            allrecord: None,
            transaction: None,
            hash_fn: cfg.hash_fn,
            log_fn: cfg.log_fn,
            lock_ops: cfg.lock_ops,
            stats: if cfg.stats {
                Some(Box::new(Default::default()))
            } else {
                None
            },
            v1: None,
            registered: true,
        };
        let hook = cfg.open_hook.take();
        let seed = cfg.seed;
        let v1_hashsize = cfg.v1_hashsize;
        match tdb.open_locked(open_flags, hook, seed, v1_hashsize) {
            Ok(()) => Ok(tdb),
            Err(e) => {
                // The Drop impl unregisters and releases what was taken.
                Err(e)
            }
        }
    }

    fn open_internal(path: &Path, flags: Flags, cfg: OpenConfig) -> Result<Tdb> {
        let seed = cfg.seed;
        let convert = flags.contains(Flags::CONVERT);
        let mut tdb = Tdb {
            name: path.to_path_buf(),
            file: TdbFile::new_mem(Vec::new(), convert),
            flags,
            read_only: false,
            header: Header::default(),
            header_uptodate: false,
            ftables: Vec::new(),
            last_ftable: 0,
            lockrecs: Vec::new(),
            allrecord: None,
            transaction: None,
            hash_fn: cfg.hash_fn,
            log_fn: cfg.log_fn,
            lock_ops: None,
            stats: if cfg.stats {
                Some(Box::new(Default::default()))
            } else {
                None
            },
            v1: None,
            registered: false,
        };
        if flags.contains(Flags::VERSION1) {
            let hashsize = cfg.v1_hashsize.unwrap_or(crate::tdb1::DEFAULT_HASH_SIZE);
            let (image, state) = crate::tdb1::create_image(&tdb.hash_fn, hashsize, convert)?;
            tdb.file = TdbFile::new_mem(image, convert);
            tdb.v1 = Some(Box::new(state));
            return Ok(tdb);
        }
        let seed = seed.unwrap_or_else(rand::random);
        let image = new_database_image(&tdb.hash_fn, seed, convert)?;
        tdb.file = TdbFile::new_mem(image, convert);
        tdb.header_uptodate = false;
        tdb.update_header()?;
        Ok(tdb)
    }

    /// Everything that must happen under the open lock.
    fn open_locked(
        &mut self,
        open_flags: OpenFlags,
        mut hook: Option<crate::attr::OpenHookFn>,
        seed: Option<u64>,
        v1_hashsize: Option<u32>,
    ) -> Result<()> {
        self.lock_open()?;
        let res = (|| {
            if let Some(hook) = hook.as_mut() {
                let fd = self.fd().expect("file-backed open has a descriptor");
                hook(fd).map_err(|e| {
                    self.log(
                        LogLevel::Error,
                        Error::Io,
                        &format!("open: open-hook failed: {e}"),
                    );
                    Error::Io
                })?;
                self.file.refresh_size()?;
            }

            if self.file.size() < HEADER_SIZE {
                // Empty (or truncated-by-hook) file: create.
                if !(open_flags.contains(OpenFlags::CREAT)
                    || open_flags.contains(OpenFlags::TRUNC))
                {
                    return Err(Error::Io);
                }
                let seed = seed.unwrap_or_else(rand::random);
                self.file.truncate(0)?;
                if self.flags.contains(Flags::VERSION1) {
                    let hashsize = v1_hashsize.unwrap_or(crate::tdb1::DEFAULT_HASH_SIZE);
                    let (image, state) =
                        crate::tdb1::create_image(&self.hash_fn, hashsize, self.file.convert)?;
                    self.file.expand_file(image.len() as u64)?;
                    self.file.write(0, &image)?;
                    self.file.sync()?;
                    self.v1 = Some(Box::new(state));
                } else {
                    let image = new_database_image(&self.hash_fn, seed, self.file.convert)?;
                    self.file.expand_file(image.len() as u64)?;
                    self.file.write(0, &image)?;
                    self.file.sync()?;
                }
            } else {
                self.identify_existing()?;
            }

            if self.v1.is_none() {
                // Unknown feature bits mean a future format we cannot obey.
                let raw = self.file.read_vec(0, HEADER_SIZE)?;
                let header = Header::from_bytes(&raw, self.file.convert)?;
                if header.feature_bits & !FEATURES_KNOWN != 0 {
                    self.log(
                        LogLevel::Error,
                        Error::Corrupt,
                        &format!("open: unknown feature bits {:#x}", header.feature_bits),
                    );
                    return Err(Error::Corrupt);
                }
                self.header = header;
                self.check_capabilities()?;
            }

            // First opener replays any interrupted commit.
            if self.probe_first_opener()? {
                self.transaction_recover()?;
            }
            self.lock_active()?;
            if self.v1.is_none() {
                self.header_uptodate = false;
                self.update_header()?;
            }
            Ok(())
        })();
        let unlock = self.unlock_open();
        res.and(unlock)
    }

    /// Decide the on-disk format of a non-empty file and validate it.
    fn identify_existing(&mut self) -> Result<()> {
        let magic = self.file.read_vec(0, 32)?;
        if magic.starts_with(crate::tdb1::layout::MAGIC_FOOD) {
            let state = crate::tdb1::open_existing(self)?;
            self.v1 = Some(Box::new(state));
            self.flags.insert(Flags::VERSION1);
            return Ok(());
        }
        if &magic[..] != crate::layout::MAGIC_FOOD {
            self.log(LogLevel::Error, Error::Io, "open: not a tdb file");
            return Err(Error::Io);
        }
        if self.flags.contains(Flags::VERSION1) {
            // The file decides; the flag only shapes creation.
            self.flags.remove(Flags::VERSION1);
        }
        let version = self.file.read_off(crate::layout::hoff::VERSION)?;
        if version == VERSION.swap_bytes() && !self.file.convert {
            self.file.convert = true;
            self.flags.insert(Flags::CONVERT);
        } else if version != VERSION {
            self.log(
                LogLevel::Error,
                Error::Io,
                &format!("open: unknown version {version:#x}"),
            );
            return Err(Error::Io);
        }
        let raw = self.file.read_vec(0, HEADER_SIZE)?;
        let header = Header::from_bytes(&raw, self.file.convert)?;
        let expect = hash_test_value(&self.hash_fn, header.hash_seed);
        if header.hash_test != expect {
            self.log(
                LogLevel::Error,
                Error::Io,
                "open: file was created with a different hash function",
            );
            return Err(Error::Io);
        }
        if header.hash_off != HEADER_SIZE || header.hash_bits != TOPLEVEL_HASH_BITS as u64 {
            self.log(
                LogLevel::Error,
                Error::Corrupt,
                "open: unsupported root table geometry",
            );
            return Err(Error::Corrupt);
        }
        self.header = header;
        Ok(())
    }

    /// Walk the capability chain; refuse to open past one we must
    /// understand but do not.
    fn check_capabilities(&mut self) -> Result<()> {
        let mut off = self.header.capabilities;
        let mut hops = 0;
        while off != 0 {
            hops += 1;
            if hops > 64 {
                return Err(Error::Corrupt);
            }
            let rec = self.read_used(off)?;
            if rec.magic() != Some(Magic::Capability) {
                self.log(
                    LogLevel::Error,
                    Error::Corrupt,
                    &format!("open: capability chain hits bad magic at {off}"),
                );
                return Err(Error::Corrupt);
            }
            let captype = self.file.read_off(off + REC_HDR_SIZE)?;
            // No capability types are defined by this version, so any
            // NOOPEN-tagged one is by definition not understood.
            if captype & CAP_NOOPEN != 0 {
                self.log(
                    LogLevel::Error,
                    Error::Corrupt,
                    &format!(
                        "open: unsupported critical capability {:#x}",
                        captype & CAP_TYPE_MASK
                    ),
                );
                return Err(Error::Corrupt);
            }
            off = self.file.read_off(off + REC_HDR_SIZE + 8)?;
        }
        Ok(())
    }

    /// Close explicitly; equivalent to dropping the handle.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Tdb {
    fn drop(&mut self) {
        // An open transaction is cancelled, never committed, on close.
        while self.transaction.is_some() {
            let _ = self.transaction_cancel();
        }
        if !self.lockrecs.is_empty() {
            self.log(
                LogLevel::Warning,
                Error::Lock,
                "close: releasing leaked chain locks",
            );
            self.release_all_fine_locks();
        }
        while self.allrecord.is_some() {
            let _ = self.allrecord_unlock();
        }
        if !self.file.is_mem() {
            let _ = self.unlock_active();
        }
        if self.registered {
            registry_remove(self.file.device, self.file.inode);
        }
    }
}
