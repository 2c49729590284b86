//! The legacy version-1 engine, selected at open time by the on-disk
//! format.  It shares the handle, the lock manager and the transaction
//! overlay with the v2 engine but nothing at the byte level: records are
//! 24-byte-headed chain members, free space is a single freelist, and the
//! hash is the classic 32-bit string hash every v1 database ever written
//! used.  The v2 free-table and sublevel machinery is inactive here.

pub mod layout;

use crate::attr::LockKind;
use crate::db::Tdb;
use crate::error::{Error, LogLevel, Result};
use crate::flags::{Flags, StoreMode};
use crate::lock::Wait;
use layout::{
    bucket_off, hash_check_value, records_start, v1_hash, V1Rec, FREELIST_TOP, MAGIC_DEAD,
    MAGIC_FOOD, MAGIC_FREE, MAGIC_USED, OFF_HASH_CHECK, OFF_HASH_SIZE, OFF_MAGIC1_HASH,
    OFF_RECOVERY, OFF_SEQNUM, OFF_VERSION, REC_HDR, VERSION_1,
};

pub use layout::DEFAULT_HASH_SIZE;

/// Per-handle v1 state.
pub struct Tdb1State {
    pub hash_size: u32,
}

impl Tdb1State {
    pub(crate) fn seqnum(&self, tdb: &Tdb) -> u32 {
        tdb.db_read_u32(OFF_SEQNUM).unwrap_or(0)
    }
}

fn hash_size(tdb: &Tdb) -> u32 {
    tdb.v1.as_ref().expect("v1 dispatch requires v1 state").hash_size
}

/// Serialized image of a fresh v1 database.
pub(crate) fn create_image(
    _hash_fn: &crate::attr::HashFn,
    hashsize: u32,
    convert: bool,
) -> Result<(Vec<u8>, Tdb1State)> {
    if hashsize == 0 {
        return Err(Error::Einval);
    }
    let conv32 = |v: u32| if convert { v.swap_bytes() } else { v };
    let conv64 = |v: u64| if convert { v.swap_bytes() } else { v };
    let mut image = vec![0u8; records_start(hashsize) as usize];
    image[..MAGIC_FOOD.len()].copy_from_slice(MAGIC_FOOD);
    image[OFF_VERSION as usize..OFF_VERSION as usize + 4]
        .copy_from_slice(&conv32(VERSION_1).to_le_bytes());
    image[OFF_HASH_SIZE as usize..OFF_HASH_SIZE as usize + 4]
        .copy_from_slice(&conv32(hashsize).to_le_bytes());
    image[OFF_MAGIC1_HASH as usize..OFF_MAGIC1_HASH as usize + 4]
        .copy_from_slice(&conv32(1).to_le_bytes());
    image[OFF_HASH_CHECK as usize..OFF_HASH_CHECK as usize + 8]
        .copy_from_slice(&conv64(hash_check_value()).to_le_bytes());
    Ok((image, Tdb1State { hash_size: hashsize }))
}

/// Validate an existing v1 file and derive its state.  Called from the
/// open path once the magic string has identified the format.
pub(crate) fn open_existing(tdb: &mut Tdb) -> Result<Tdb1State> {
    let version = tdb.file_read_u32_direct(OFF_VERSION)?;
    if version == VERSION_1.swap_bytes() && !tdb.file.convert {
        tdb.file.convert = true;
        tdb.flags.insert(Flags::CONVERT);
    } else if version != VERSION_1 {
        tdb.log(
            LogLevel::Error,
            Error::Io,
            &format!("open: unknown v1 version {version:#x}"),
        );
        return Err(Error::Io);
    }
    let hashsize = tdb.file_read_u32_direct(OFF_HASH_SIZE)?;
    if hashsize == 0 || records_start(hashsize) > tdb.file.size() {
        tdb.log(LogLevel::Error, Error::Corrupt, "open: bad v1 hash size");
        return Err(Error::Corrupt);
    }
    if tdb.file_read_u32_direct(OFF_MAGIC1_HASH)? == 1 {
        let check = tdb.file.read_off(OFF_HASH_CHECK)?;
        if check != hash_check_value() {
            tdb.log(
                LogLevel::Error,
                Error::Io,
                "open: v1 file was written with a different hash",
            );
            return Err(Error::Io);
        }
    }
    Ok(Tdb1State { hash_size: hashsize })
}

// ── Record I/O ────────────────────────────────────────────────────────────────

fn read_rec(tdb: &Tdb, off: u64) -> Result<V1Rec> {
    let raw = tdb.db_read_vec(off, REC_HDR)?;
    let mut fields = [0u32; 6];
    for (i, f) in fields.iter_mut().enumerate() {
        *f = tdb
            .file
            .conv32(u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap()));
    }
    let rec = V1Rec::decode(&fields);
    rec.validate()?;
    if off + rec.total_len() > tdb.db_size() {
        return Err(Error::Corrupt);
    }
    Ok(rec)
}

fn write_rec(tdb: &mut Tdb, off: u64, rec: &V1Rec) -> Result<()> {
    let mut raw = [0u8; REC_HDR as usize];
    for (i, v) in rec.encode().iter().enumerate() {
        raw[i * 4..i * 4 + 4].copy_from_slice(&tdb.file.conv32(*v).to_le_bytes());
    }
    tdb.db_write(off, &raw)
}

fn bump_seqnum(tdb: &mut Tdb) -> Result<()> {
    if !tdb.flags.contains(Flags::SEQNUM) {
        return Ok(());
    }
    tdb.lock_seqnum()?;
    let res = (|| {
        let v = tdb.db_read_u32(OFF_SEQNUM)?;
        tdb.db_write_u32(OFF_SEQNUM, v.wrapping_add(1))
    })();
    tdb.unlock_seqnum()?;
    res
}

// ── Chain search ──────────────────────────────────────────────────────────────

/// Walk `key`'s chain.  Returns `(record offset, header, slot holding the
/// pointer to it)`, with the chain lock already held by the caller.
fn find_locked(tdb: &mut Tdb, key: &[u8], h: u32) -> Result<Option<(u64, V1Rec, u64)>> {
    let bucket = h % hash_size(tdb);
    let mut ptr_slot = bucket_off(bucket + 1);
    let mut off = tdb.db_read_u32(ptr_slot)? as u64;
    let mut hops = 0u32;
    while off != 0 {
        hops += 1;
        if hops > 1 << 24 {
            tdb.log(LogLevel::Fatal, Error::Corrupt, "v1 find: chain cycle");
            return Err(Error::Corrupt);
        }
        let rec = read_rec(tdb, off)?;
        if rec.magic != MAGIC_USED {
            tdb.log(
                LogLevel::Fatal,
                Error::Corrupt,
                &format!("v1 find: bad magic {:#x} at {off}", rec.magic),
            );
            return Err(Error::Corrupt);
        }
        if rec.full_hash == h && rec.key_len as usize == key.len() {
            tdb.bump(|s| s.compares += 1);
            let on_disk = tdb.db_read_vec(off + REC_HDR, rec.key_len as u64)?;
            if on_disk == key {
                return Ok(Some((off, rec, ptr_slot)));
            }
        } else {
            tdb.bump(|s| s.compare_wrong_rec_hash += 1);
        }
        ptr_slot = off; // the next-field sits first in the header
        off = rec.next as u64;
    }
    Ok(None)
}

fn lock_chain(tdb: &mut Tdb, h: u32, kind: LockKind, wait: Wait) -> Result<u64> {
    let byte = bucket_off(h % hash_size(tdb) + 1);
    tdb.nest_lock(byte, kind, wait)?;
    Ok(byte)
}

// ── Freelist ──────────────────────────────────────────────────────────────────

/// First-fit allocation from the freelist.  Returns `(offset, capacity)`
/// or `None` when nothing fits.  Splits from the tail of an oversized
/// region so the remainder keeps its freelist position.
fn alloc(tdb: &mut Tdb, needed: u32) -> Result<Option<(u64, u32)>> {
    tdb.bump(|s| s.allocs += 1);
    let keep = (needed + 3) & !3;
    tdb.nest_lock(FREELIST_TOP, LockKind::Write, Wait::Block)?;
    let res = (|| -> Result<Option<(u64, u32)>> {
        let mut ptr_slot = bucket_off(0);
        let mut off = tdb.db_read_u32(ptr_slot)? as u64;
        let mut hops = 0u32;
        while off != 0 {
            hops += 1;
            if hops > 1 << 24 {
                return Err(Error::Corrupt);
            }
            let mut rec = read_rec(tdb, off)?;
            if rec.magic != MAGIC_FREE {
                return Err(Error::Corrupt);
            }
            if rec.rec_len >= keep + REC_HDR as u32 + 16 {
                // Split: the tail becomes the allocation, the head stays
                // linked with a reduced capacity.
                let rem = rec.rec_len - keep - REC_HDR as u32;
                let alloc_off = off + REC_HDR + rem as u64;
                rec.rec_len = rem;
                write_rec(tdb, off, &rec)?;
                return Ok(Some((alloc_off, keep)));
            }
            if rec.rec_len >= needed {
                tdb.db_write_u32(ptr_slot, rec.next)?;
                return Ok(Some((off, rec.rec_len)));
            }
            ptr_slot = off;
            off = rec.next as u64;
        }
        Ok(None)
    })();
    tdb.nest_unlock(FREELIST_TOP)?;
    res
}

/// Push a region onto the freelist, merging a free right-hand neighbour.
fn free_region(tdb: &mut Tdb, off: u64, mut rec_len: u32) -> Result<()> {
    tdb.bump(|s| s.frees += 1);
    tdb.nest_lock(FREELIST_TOP, LockKind::Write, Wait::Block)?;
    let res = (|| -> Result<()> {
        let end = off + REC_HDR + rec_len as u64;
        if end + REC_HDR <= tdb.db_size() {
            let neigh = read_rec(tdb, end)?;
            if neigh.magic == MAGIC_FREE {
                // Unlink the neighbour before absorbing it.
                let mut ptr_slot = bucket_off(0);
                let mut cur = tdb.db_read_u32(ptr_slot)? as u64;
                while cur != 0 && cur != end {
                    ptr_slot = cur;
                    cur = read_rec(tdb, cur)?.next as u64;
                }
                if cur == end {
                    tdb.bump(|s| s.alloc_coalesce_succeeded += 1);
                    tdb.db_write_u32(ptr_slot, neigh.next)?;
                    rec_len += REC_HDR as u32 + neigh.rec_len;
                }
            }
        }
        let head = tdb.db_read_u32(bucket_off(0))?;
        let frec = V1Rec {
            next: head,
            rec_len,
            key_len: 0,
            data_len: 0,
            full_hash: 0,
            magic: MAGIC_FREE,
        };
        write_rec(tdb, off, &frec)?;
        tdb.db_write_u32(bucket_off(0), off as u32)
    })();
    tdb.nest_unlock(FREELIST_TOP)?;
    res
}

/// Grow the file and hand the new space to the freelist.  Serialized by
/// the freelist lock, which every v1 space operation already respects —
/// growth may therefore happen under a chain lock, which the store path
/// relies on.
fn expand(tdb: &mut Tdb, needed: u32) -> Result<()> {
    tdb.nest_lock(FREELIST_TOP, LockKind::Write, Wait::Block)?;
    let res = (|| -> Result<()> {
        tdb.refresh_file_size()?;
        let size = tdb.db_size();
        let add = (needed as u64 + REC_HDR + 16)
            .max(size / 4)
            .next_multiple_of(4);
        tdb.bump(|s| s.expands += 1);
        tdb.db_grow(add)?;
        free_region(tdb, size, (add - REC_HDR) as u32)
    })();
    tdb.nest_unlock(FREELIST_TOP)?;
    res
}

// ── Operations ────────────────────────────────────────────────────────────────

pub(crate) fn fetch(tdb: &mut Tdb, key: &[u8]) -> Result<Vec<u8>> {
    let h = v1_hash(key);
    let chain = lock_chain(tdb, h, LockKind::Read, Wait::Block)?;
    let res = match find_locked(tdb, key, h)? {
        Some((off, rec, _)) => {
            tdb.db_read_vec(off + REC_HDR + rec.key_len as u64, rec.data_len as u64)
        }
        None => Err(Error::Noexist),
    };
    tdb.nest_unlock(chain)?;
    res
}

pub(crate) fn exists(tdb: &mut Tdb, key: &[u8]) -> bool {
    let h = v1_hash(key);
    let chain = match lock_chain(tdb, h, LockKind::Read, Wait::Block) {
        Ok(c) => c,
        Err(_) => return false,
    };
    let found = matches!(find_locked(tdb, key, h), Ok(Some(_)));
    let _ = tdb.nest_unlock(chain);
    found
}

pub(crate) fn parse_record<R>(
    tdb: &mut Tdb,
    key: &[u8],
    f: impl FnOnce(&[u8]) -> R,
) -> Result<R> {
    let h = v1_hash(key);
    let chain = lock_chain(tdb, h, LockKind::Read, Wait::Block)?;
    let res = match find_locked(tdb, key, h)? {
        Some((off, rec, _)) => tdb
            .db_read_ref(off + REC_HDR + rec.key_len as u64, rec.data_len as u64)
            .map(|data| f(&data)),
        None => Err(Error::Noexist),
    };
    tdb.nest_unlock(chain)?;
    res
}

/// Link a fresh record at the head of `key`'s chain, allocating (and
/// expanding the file once) as needed.
fn insert_new(tdb: &mut Tdb, key: &[u8], value: &[u8], h: u32) -> Result<()> {
    let needed = (key.len() + value.len()) as u32;
    let (off, capacity) = match alloc(tdb, needed)? {
        Some(got) => got,
        None => {
            expand(tdb, needed)?;
            match alloc(tdb, needed)? {
                Some(got) => got,
                None => return Err(Error::Oom),
            }
        }
    };
    let head_slot = bucket_off(h % hash_size(tdb) + 1);
    let head = tdb.db_read_u32(head_slot)?;
    let rec = V1Rec {
        next: head,
        rec_len: capacity,
        key_len: key.len() as u32,
        data_len: value.len() as u32,
        full_hash: h,
        magic: MAGIC_USED,
    };
    write_rec(tdb, off, &rec)?;
    tdb.db_write(off + REC_HDR, key)?;
    tdb.db_write(off + REC_HDR + key.len() as u64, value)?;
    tdb.db_write_u32(head_slot, off as u32)
}

pub(crate) fn store(tdb: &mut Tdb, key: &[u8], value: &[u8], mode: StoreMode) -> Result<()> {
    tdb.check_writable()?;
    let h = v1_hash(key);
    let chain = lock_chain(tdb, h, LockKind::Write, Wait::Block)?;
    let res = (|| -> Result<()> {
        match find_locked(tdb, key, h)? {
            Some((off, mut rec, ptr_slot)) => {
                if mode == StoreMode::Insert {
                    return Err(Error::Exists);
                }
                if rec.rec_len as usize >= key.len() + value.len() {
                    rec.data_len = value.len() as u32;
                    write_rec(tdb, off, &rec)?;
                    return tdb.db_write(off + REC_HDR + key.len() as u64, value);
                }
                // Outgrown: unlink, free, insert fresh.
                tdb.db_write_u32(ptr_slot, rec.next)?;
                free_region(tdb, off, rec.rec_len)?;
                insert_new(tdb, key, value, h)
            }
            None => {
                if mode == StoreMode::Modify {
                    return Err(Error::Noexist);
                }
                insert_new(tdb, key, value, h)
            }
        }
    })();
    tdb.nest_unlock(chain)?;
    if res.is_ok() {
        bump_seqnum(tdb)?;
    }
    res
}

pub(crate) fn delete(tdb: &mut Tdb, key: &[u8]) -> Result<()> {
    tdb.check_writable()?;
    let h = v1_hash(key);
    let chain = lock_chain(tdb, h, LockKind::Write, Wait::Block)?;
    let res = (|| -> Result<()> {
        match find_locked(tdb, key, h)? {
            Some((off, rec, ptr_slot)) => {
                tdb.db_write_u32(ptr_slot, rec.next)?;
                free_region(tdb, off, rec.rec_len)
            }
            None => Err(Error::Noexist),
        }
    })();
    tdb.nest_unlock(chain)?;
    if res.is_ok() {
        bump_seqnum(tdb)?;
    }
    res
}

pub(crate) fn append(tdb: &mut Tdb, key: &[u8], suffix: &[u8]) -> Result<()> {
    tdb.check_writable()?;
    let h = v1_hash(key);
    let chain = lock_chain(tdb, h, LockKind::Write, Wait::Block)?;
    let res = (|| -> Result<()> {
        match find_locked(tdb, key, h)? {
            Some((off, mut rec, ptr_slot)) => {
                let fits = rec.rec_len as u64
                    >= rec.key_len as u64 + rec.data_len as u64 + suffix.len() as u64;
                if fits {
                    tdb.db_write(
                        off + REC_HDR + rec.key_len as u64 + rec.data_len as u64,
                        suffix,
                    )?;
                    rec.data_len += suffix.len() as u32;
                    return write_rec(tdb, off, &rec);
                }
                let mut value =
                    tdb.db_read_vec(off + REC_HDR + rec.key_len as u64, rec.data_len as u64)?;
                value.extend_from_slice(suffix);
                tdb.db_write_u32(ptr_slot, rec.next)?;
                free_region(tdb, off, rec.rec_len)?;
                insert_new(tdb, key, &value, h)
            }
            None => insert_new(tdb, key, suffix, h),
        }
    })();
    tdb.nest_unlock(chain)?;
    if res.is_ok() {
        bump_seqnum(tdb)?;
    }
    res
}

// ── Iteration ─────────────────────────────────────────────────────────────────

/// Copy out one whole chain under its read lock.
fn chain_pairs(tdb: &mut Tdb, bucket: u32) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let byte = bucket_off(bucket + 1);
    tdb.nest_lock(byte, LockKind::Read, Wait::Block)?;
    let res = (|| -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut pairs = Vec::new();
        let mut off = tdb.db_read_u32(byte)? as u64;
        let mut hops = 0u32;
        while off != 0 {
            hops += 1;
            if hops > 1 << 24 {
                return Err(Error::Corrupt);
            }
            let rec = read_rec(tdb, off)?;
            if rec.magic != MAGIC_USED {
                return Err(Error::Corrupt);
            }
            let key = tdb.db_read_vec(off + REC_HDR, rec.key_len as u64)?;
            let val =
                tdb.db_read_vec(off + REC_HDR + rec.key_len as u64, rec.data_len as u64)?;
            pairs.push((key, val));
            off = rec.next as u64;
        }
        Ok(pairs)
    })();
    tdb.nest_unlock(byte)?;
    res
}

pub(crate) fn traverse(
    tdb: &mut Tdb,
    mut f: impl FnMut(&mut Tdb, &[u8], &[u8]) -> bool,
) -> Result<u64> {
    tdb.bump(|s| s.traverses += 1);
    // A v1 traversal counts as a modification for seqnum watchers.
    bump_seqnum(tdb)?;
    let hs = hash_size(tdb);
    let mut count = 0u64;
    for b in 0..hs {
        for (k, v) in chain_pairs(tdb, b)? {
            count += 1;
            if !f(tdb, &k, &v) {
                return Ok(count);
            }
        }
    }
    Ok(count)
}

pub(crate) fn firstkey(tdb: &mut Tdb) -> Result<Option<Vec<u8>>> {
    let hs = hash_size(tdb);
    for b in 0..hs {
        if let Some((k, _)) = chain_pairs(tdb, b)?.into_iter().next() {
            return Ok(Some(k));
        }
    }
    Ok(None)
}

pub(crate) fn nextkey(tdb: &mut Tdb, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let h = v1_hash(key);
    let hs = hash_size(tdb);
    let bucket = h % hs;
    let pairs = chain_pairs(tdb, bucket)?;
    let mut take_next = false;
    for (k, _) in &pairs {
        if take_next {
            return Ok(Some(k.clone()));
        }
        if k == key {
            take_next = true;
        }
    }
    // Key gone (or last in its chain): continue with the later buckets.
    for b in bucket + 1..hs {
        if let Some((k, _)) = chain_pairs(tdb, b)?.into_iter().next() {
            return Ok(Some(k));
        }
    }
    Ok(None)
}

// ── Maintenance ───────────────────────────────────────────────────────────────

pub(crate) fn wipe_all(tdb: &mut Tdb) -> Result<()> {
    tdb.check_writable()?;
    let under_tx = tdb.transaction.is_some();
    if !under_tx {
        tdb.allrecord_lock(LockKind::Write, Wait::Block, false)?;
    }
    let res = (|| -> Result<()> {
        let hs = hash_size(tdb);
        for b in 0..=hs {
            tdb.db_write_u32(bucket_off(b), 0)?;
        }
        let start = records_start(hs);
        let size = tdb.db_size();
        if size > start + REC_HDR {
            let frec = V1Rec {
                next: 0,
                rec_len: (size - start - REC_HDR) as u32,
                key_len: 0,
                data_len: 0,
                full_hash: 0,
                magic: MAGIC_FREE,
            };
            write_rec(tdb, start, &frec)?;
            tdb.db_write_u32(bucket_off(0), start as u32)?;
        }
        Ok(())
    })();
    if !under_tx {
        tdb.allrecord_unlock()?;
    }
    if res.is_ok() {
        bump_seqnum(tdb)?;
    }
    res
}

pub(crate) fn check(
    tdb: &mut Tdb,
    mut cb: Option<&mut dyn FnMut(&[u8], &[u8]) -> Result<()>>,
) -> Result<()> {
    tdb.allrecord_lock(LockKind::Read, Wait::Block, false)?;
    let res = (|| -> Result<()> {
        let hs = hash_size(tdb);
        let mut reachable = std::collections::BTreeMap::new();
        // Hash chains.
        for b in 0..hs {
            let mut off = tdb.db_read_u32(bucket_off(b + 1))? as u64;
            let mut hops = 0u32;
            while off != 0 {
                hops += 1;
                if hops > 1 << 24 {
                    return Err(Error::Corrupt);
                }
                let rec = read_rec(tdb, off)?;
                if rec.magic != MAGIC_USED {
                    return Err(Error::Corrupt);
                }
                let key = tdb.db_read_vec(off + REC_HDR, rec.key_len as u64)?;
                if v1_hash(&key) != rec.full_hash || rec.full_hash % hs != b {
                    return Err(Error::Corrupt);
                }
                if let Some(cb) = cb.as_mut() {
                    let val = tdb
                        .db_read_vec(off + REC_HDR + rec.key_len as u64, rec.data_len as u64)?;
                    cb(&key, &val)?;
                }
                if reachable.insert(off, rec.total_len()).is_some() {
                    return Err(Error::Corrupt);
                }
                off = rec.next as u64;
            }
        }
        // Freelist.
        let mut off = tdb.db_read_u32(bucket_off(0))? as u64;
        let mut hops = 0u32;
        while off != 0 {
            hops += 1;
            if hops > 1 << 24 {
                return Err(Error::Corrupt);
            }
            let rec = read_rec(tdb, off)?;
            if rec.magic != MAGIC_FREE {
                return Err(Error::Corrupt);
            }
            if reachable.insert(off, rec.total_len()).is_some() {
                return Err(Error::Corrupt);
            }
            off = rec.next as u64;
        }
        // Linear coverage: every byte of the record area is a reachable
        // record, a dead record, or the recovery area.
        let recovery = tdb.db_read_u32(OFF_RECOVERY)? as u64;
        let mut cur = records_start(hs);
        let size = tdb.db_size();
        while cur < size {
            if cur == recovery && recovery != 0 {
                let max_len = tdb.file_read_off_direct(recovery + 8)?;
                cur += crate::record::RECOVERY_HDR_SIZE + max_len;
                continue;
            }
            if let Some(len) = reachable.get(&cur) {
                cur += len;
                continue;
            }
            let rec = read_rec(tdb, cur)?;
            if rec.magic != MAGIC_DEAD {
                return Err(Error::Corrupt);
            }
            cur += rec.total_len();
        }
        if cur != size {
            return Err(Error::Corrupt);
        }
        Ok(())
    })();
    tdb.allrecord_unlock()?;
    res
}

pub(crate) fn summary(tdb: &mut Tdb) -> Result<String> {
    tdb.allrecord_lock(LockKind::Read, Wait::Block, false)?;
    let res = (|| -> Result<String> {
        let hs = hash_size(tdb);
        let mut records = 0u64;
        let mut key_bytes = 0u64;
        let mut data_bytes = 0u64;
        let mut longest_chain = 0u64;
        for b in 0..hs {
            let mut off = tdb.db_read_u32(bucket_off(b + 1))? as u64;
            let mut chain = 0u64;
            while off != 0 {
                let rec = read_rec(tdb, off)?;
                records += 1;
                chain += 1;
                key_bytes += rec.key_len as u64;
                data_bytes += rec.data_len as u64;
                off = rec.next as u64;
            }
            longest_chain = longest_chain.max(chain);
        }
        let mut free_records = 0u64;
        let mut free_bytes = 0u64;
        let mut off = tdb.db_read_u32(bucket_off(0))? as u64;
        while off != 0 {
            let rec = read_rec(tdb, off)?;
            free_records += 1;
            free_bytes += rec.total_len();
            off = rec.next as u64;
        }
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "Size of file/data: {}/{}", tdb.db_size(), key_bytes + data_bytes);
        let _ = writeln!(out, "Number of records: {records}");
        let _ = writeln!(out, "Hash size: {hs}");
        let _ = writeln!(out, "Longest chain: {longest_chain}");
        let _ = writeln!(out, "Number of free records: {free_records}");
        let _ = writeln!(out, "Free bytes: {free_bytes}");
        let _ = writeln!(out, "Format: version 1");
        Ok(out)
    })();
    tdb.allrecord_unlock()?;
    res
}
