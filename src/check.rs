//! Structural verification: every invariant the format promises, checked
//! in one pass under the shared allrecord lock.
//!
//! The walk gathers extents from four roots — the hash tree, the
//! free-table chain, the capability chain and the recovery pointer — then
//! proves that together they tile the data area exactly: no gaps, no
//! overlaps, no byte belonging to two records.  Reachability of used and
//! free records falls out of the same proof: anything unreachable shows up
//! as a gap.

use crate::attr::LockKind;
use crate::db::Tdb;
use crate::error::{Error, LogLevel, Result};
use crate::free::{size_to_bucket, FREE_BUCKETS};
use crate::hash::{bits_from, GROUP_SIZE};
use crate::hashing::hash_test_value;
use crate::layout::{Magic, DATA_START, HASH_GROUP_BITS, HEADER_SIZE, VERSION};
use crate::lock::Wait;
use crate::record::{
    entry_extra, entry_is_subhash, entry_off, extra_bits, FreeRec, RECOVERY_HDR_SIZE,
    RECOVERY_INVALID_MAGIC, RECOVERY_MAGIC, REC_HDR_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Used,
    Free,
    Table,
    FreeTable,
    Capability,
    Recovery,
}

struct Walk<'a> {
    extents: Vec<(u64, u64, Kind)>,
    cb: Option<&'a mut dyn FnMut(&[u8], &[u8]) -> Result<()>>,
}

impl Tdb {
    /// Verify the whole database.  `cb`, when given, sees every live
    /// `(key, value)` pair and may return an error to abort the check.
    pub fn check(
        &mut self,
        cb: Option<&mut dyn FnMut(&[u8], &[u8]) -> Result<()>>,
    ) -> Result<()> {
        if self.v1.is_some() {
            return crate::tdb1::check(self, cb);
        }
        self.allrecord_lock(LockKind::Read, Wait::Block, false)?;
        self.header_uptodate = false;
        let res = (|| {
            self.update_header()?;
            self.check_header()?;
            let mut walk = Walk {
                extents: Vec::new(),
                cb,
            };
            self.check_hash_tree(&mut walk)?;
            self.check_free_tables(&mut walk)?;
            self.check_capabilities_chain(&mut walk)?;
            self.check_recovery_extent(&mut walk)?;
            self.check_coverage(walk.extents)
        })();
        self.allrecord_unlock()?;
        res
    }

    fn corrupt(&self, msg: &str) -> Error {
        self.log(LogLevel::Error, Error::Corrupt, msg);
        Error::Corrupt
    }

    fn check_header(&mut self) -> Result<()> {
        let h = &self.header;
        if h.version != VERSION {
            return Err(self.corrupt("check: bad version"));
        }
        if h.hash_test != hash_test_value(&self.hash_fn, h.hash_seed) {
            return Err(self.corrupt("check: hash check value mismatch"));
        }
        if h.hash_off != HEADER_SIZE || h.hash_bits != crate::layout::TOPLEVEL_HASH_BITS as u64 {
            return Err(self.corrupt("check: root table geometry mismatch"));
        }
        if h.free_table < DATA_START || h.free_table % 8 != 0 {
            return Err(self.corrupt("check: bad free table offset"));
        }
        Ok(())
    }

    fn check_hash_tree(&mut self, walk: &mut Walk) -> Result<()> {
        let root = self.header.hash_off;
        let entries = 1u64 << self.header.hash_bits;
        self.check_table(walk, root, entries, 0, u64::MAX, 0)
    }

    /// Recursively verify one table's entries.  `group_path_bits` carries
    /// the group index this table must agree with (`u64::MAX` for the
    /// root, which has no constraint from above).
    fn check_table(
        &mut self,
        walk: &mut Walk,
        table_off: u64,
        entries: u64,
        used: u32,
        _group_path_bits: u64,
        depth: u32,
    ) -> Result<()> {
        if depth > 24 {
            return Err(self.corrupt("check: hash tree too deep"));
        }
        let tbits = entries.trailing_zeros();
        let all = self.db_read_offs(table_off, entries)?;
        for g in 0..(entries / GROUP_SIZE) {
            let group = &all[(g * GROUP_SIZE) as usize..((g + 1) * GROUP_SIZE) as usize];
            let nsub = group.iter().filter(|&&e| entry_is_subhash(e)).count();
            if nsub > 1 {
                return Err(self.corrupt("check: group with more than one subhash entry"));
            }
            for (i, &e) in group.iter().enumerate() {
                if e == 0 {
                    continue;
                }
                let off = entry_off(e);
                if entry_is_subhash(e) {
                    if group.iter().enumerate().any(|(j, &o)| j != i && o != 0) {
                        return Err(
                            self.corrupt("check: subhash entry sharing a group with records")
                        );
                    }
                    self.check_subtree(walk, off, used + tbits - HASH_GROUP_BITS, g, depth)?;
                    continue;
                }
                self.check_used_entry(walk, off, e, used, tbits, g)?;
            }
        }
        Ok(())
    }

    fn check_subtree(
        &mut self,
        walk: &mut Walk,
        off: u64,
        child_used: u32,
        _parent_group: u64,
        depth: u32,
    ) -> Result<()> {
        let rec = self.read_used(off)?;
        match rec.magic() {
            Some(Magic::HashTable) => {
                walk.extents.push((off, rec.total_len(), Kind::Table));
                let n = rec.data_length() / 8;
                if n != 1 << crate::layout::SUBLEVEL_HASH_BITS {
                    return Err(self.corrupt("check: sublevel table with bad size"));
                }
                self.check_table(walk, off + REC_HDR_SIZE, n, child_used, 0, depth + 1)
            }
            Some(Magic::Chain) => {
                let mut page = off;
                let mut hops = 0u64;
                while page != 0 {
                    hops += 1;
                    if hops > self.db_size() / REC_HDR_SIZE {
                        return Err(self.corrupt("check: chain cycle"));
                    }
                    let rec = self.read_used(page)?;
                    if rec.magic() != Some(Magic::Chain) {
                        return Err(self.corrupt("check: chain page with bad magic"));
                    }
                    walk.extents.push((page, rec.total_len(), Kind::Table));
                    let slots = self.db_read_offs(page + REC_HDR_SIZE, GROUP_SIZE)?;
                    for &e in &slots {
                        if e == 0 {
                            continue;
                        }
                        if entry_is_subhash(e) {
                            return Err(self.corrupt("check: subhash entry inside a chain"));
                        }
                        self.check_used_entry(walk, entry_off(e), e, 64, 0, 0)?;
                    }
                    page = self.db_read_off(page + REC_HDR_SIZE + GROUP_SIZE * 8)?;
                }
                Ok(())
            }
            _ => Err(self.corrupt("check: subhash entry points at bad magic")),
        }
    }

    /// Verify one record entry: magic, lengths, hash placement, cached
    /// bits; then surface the pair to the callback.
    fn check_used_entry(
        &mut self,
        walk: &mut Walk,
        off: u64,
        entry: u64,
        used: u32,
        tbits: u32,
        group: u64,
    ) -> Result<()> {
        let rec = self.read_used(off)?;
        if rec.magic() != Some(Magic::Used) {
            return Err(self.corrupt(&format!("check: record at {off} has bad magic")));
        }
        if off + rec.total_len() > self.db_size() {
            return Err(self.corrupt(&format!("check: record at {off} overruns the file")));
        }
        let key = self.db_read_vec(off + REC_HDR_SIZE, rec.key_length())?;
        let h = self.hash_of(&key);
        if !rec.matches_hash(h) {
            return Err(self.corrupt(&format!("check: record at {off} caches wrong hash bits")));
        }
        if tbits != 0 {
            // Reachability: the key's own hash must select this group.
            if bits_from(h, used, tbits - HASH_GROUP_BITS) != group {
                return Err(
                    self.corrupt(&format!("check: record at {off} reachable from wrong group"))
                );
            }
            if entry_extra(entry) != extra_bits(h, used + tbits) {
                return Err(
                    self.corrupt(&format!("check: entry for {off} caches wrong extra bits"))
                );
            }
        }
        walk.extents.push((off, rec.total_len(), Kind::Used));
        if let Some(cb) = walk.cb.as_mut() {
            let val = self.db_read_vec(off + REC_HDR_SIZE + rec.key_length(), rec.data_length())?;
            cb(&key, &val)?;
        }
        Ok(())
    }

    fn check_free_tables(&mut self, walk: &mut Walk) -> Result<()> {
        let mut table_off = self.header.free_table;
        let mut tindex = 0u32;
        while table_off != 0 {
            if tindex > 64 {
                return Err(self.corrupt("check: free table chain too long"));
            }
            let rec = self.read_used(table_off)?;
            if rec.magic() != Some(Magic::FreeTable) {
                return Err(self.corrupt("check: free table with bad magic"));
            }
            walk.extents.push((table_off, rec.total_len(), Kind::FreeTable));
            for b in 0..FREE_BUCKETS {
                let bucket = self.bucket_off(table_off, b);
                let mut off = self.db_read_off(bucket)?;
                let mut prev = 0u64;
                let mut hops = 0u64;
                while off != 0 {
                    hops += 1;
                    if hops > self.db_size() / (REC_HDR_SIZE + 16) {
                        return Err(self.corrupt("check: free bucket cycle"));
                    }
                    let w = self.db_read_offs(off, 3)?;
                    let f = FreeRec::decode(w[0], w[1], w[2])
                        .map_err(|_| self.corrupt(&format!("check: bad free record at {off}")))?;
                    if f.prev != prev {
                        return Err(self.corrupt(&format!(
                            "check: free record at {off} has wrong prev link"
                        )));
                    }
                    if f.ftable != tindex {
                        return Err(self.corrupt(&format!(
                            "check: free record at {off} claims wrong table"
                        )));
                    }
                    if size_to_bucket(f.len) != b {
                        return Err(self.corrupt(&format!(
                            "check: free record at {off} in wrong size bucket"
                        )));
                    }
                    // The trailer must name the record it ends.
                    if self.db_read_off(off + f.total_len() - 8)? != off {
                        return Err(self.corrupt(&format!(
                            "check: free record at {off} has a bad trailer"
                        )));
                    }
                    walk.extents.push((off, f.total_len(), Kind::Free));
                    prev = off;
                    off = f.next;
                }
            }
            table_off = self.db_read_off(table_off + REC_HDR_SIZE)?;
            tindex += 1;
        }
        Ok(())
    }

    fn check_capabilities_chain(&mut self, walk: &mut Walk) -> Result<()> {
        let mut off = self.header.capabilities;
        let mut hops = 0;
        while off != 0 {
            hops += 1;
            if hops > 64 {
                return Err(self.corrupt("check: capability chain too long"));
            }
            let rec = self.read_used(off)?;
            if rec.magic() != Some(Magic::Capability) {
                return Err(self.corrupt("check: capability record with bad magic"));
            }
            walk.extents.push((off, rec.total_len(), Kind::Capability));
            off = self.db_read_off(off + REC_HDR_SIZE + 8)?;
        }
        Ok(())
    }

    fn check_recovery_extent(&mut self, walk: &mut Walk) -> Result<()> {
        let off = self.header.recovery;
        if off == 0 {
            return Ok(());
        }
        let magic = self.db_read_off(off)?;
        if magic != RECOVERY_MAGIC && magic != RECOVERY_INVALID_MAGIC {
            return Err(self.corrupt("check: recovery pointer to bad magic"));
        }
        let max_len = self.db_read_off(off + 8)?;
        walk.extents
            .push((off, RECOVERY_HDR_SIZE + max_len, Kind::Recovery));
        Ok(())
    }

    /// Prove the extents tile `[DATA_START, size)` exactly, tolerating
    /// only an orphaned invalidated recovery area (a crash between commit
    /// and reclaim leaves one; it is dead space, not damage).
    fn check_coverage(&mut self, mut extents: Vec<(u64, u64, Kind)>) -> Result<()> {
        extents.sort_unstable_by_key(|&(off, _, _)| off);
        let mut cur = DATA_START;
        let mut prev_kind: Option<Kind> = None;
        let mut i = 0;
        let size = self.db_size();
        while cur < size {
            if i < extents.len() && extents[i].0 == cur {
                let (off, len, kind) = extents[i];
                if len == 0 || off + len > size {
                    return Err(self.corrupt(&format!("check: extent at {off} overruns")));
                }
                if kind == Kind::Free && prev_kind == Some(Kind::Free) {
                    return Err(
                        self.corrupt(&format!("check: adjacent free records at {off}"))
                    );
                }
                prev_kind = Some(kind);
                cur += len;
                i += 1;
                continue;
            }
            if i < extents.len() && extents[i].0 < cur {
                return Err(self.corrupt(&format!(
                    "check: overlapping records at {}",
                    extents[i].0
                )));
            }
            // Gap: only an orphaned, invalidated recovery area is benign.
            let magic = self.db_read_off(cur)?;
            if magic == RECOVERY_INVALID_MAGIC {
                let max_len = self.db_read_off(cur + 8)?;
                let total = RECOVERY_HDR_SIZE + max_len;
                if cur + total > size {
                    return Err(self.corrupt("check: orphan recovery area overruns"));
                }
                self.log(
                    LogLevel::Warning,
                    Error::Corrupt,
                    &format!("check: {total} bytes of dead recovery area at {cur}"),
                );
                prev_kind = Some(Kind::Recovery);
                cur += total;
                continue;
            }
            return Err(self.corrupt(&format!("check: unaccounted bytes at {cur}")));
        }
        if i != extents.len() {
            return Err(self.corrupt("check: records past end of file"));
        }
        Ok(())
    }
}
