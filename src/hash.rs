//! The hash index: a fixed root table, linear probing inside 8-entry
//! groups, sublevel tables when a group saturates, and chain pages once
//! the hash is exhausted.
//!
//! Hash bits are consumed from the most significant end.  Reaching a group
//! in a table of `2^B` entries consumes `B-3` bits; the next 3 bits pick
//! the home bucket inside the group, and become the group-selection bits
//! of that group's sublevel, if one exists.  A lookup therefore descends:
//!
//! ```text
//! root (10 bits): group = h[0..7),  home = h[7..10)
//! sub1 (6 bits):  group = h[7..10), home = h[10..13)
//! sub2 (6 bits):  group = h[10..13), home = h[13..16)  ... and so on
//! ```
//!
//! A group holds at most one subhash entry; once present, every key of the
//! group lives beneath it and further inserts descend.  When no hash bits
//! remain, a saturated group converts to a linked list of chain pages of
//! eight entries each, walked by full key comparison.
//!
//! The whole subtree under one top-level group shares that group's chain
//! lock, which is what makes the single-lock `find_and_lock` sound.

use crate::attr::LockKind;
use crate::db::Tdb;
use crate::error::{Error, LogLevel, Result};
use crate::layout::{Magic, HASH_GROUP_BITS, SUBLEVEL_HASH_BITS, TOPLEVEL_HASH_BITS};
use crate::lock::Wait;
use crate::record::{
    encode_entry, entry_is_subhash, entry_off, extra_bits, UsedRec, REC_HDR_SIZE,
};

/// Entries per group.
pub(crate) const GROUP_SIZE: u64 = 1 << HASH_GROUP_BITS;

/// Payload bytes of a sublevel table record.
pub(crate) const SUBLEVEL_PAYLOAD: u64 = 8 * (1 << SUBLEVEL_HASH_BITS);

/// Payload bytes of a chain page: eight entries plus a next pointer.
pub(crate) const CHAIN_PAYLOAD: u64 = 8 * GROUP_SIZE + 8;

/// `n` hash bits starting at bit `pos` from the most significant end,
/// left-aligned into an `n`-bit value (zero-padded past bit 63).
#[inline]
pub(crate) fn bits_from(h: u64, pos: u32, n: u32) -> u64 {
    if pos >= 64 {
        return 0;
    }
    let take = n.min(64 - pos);
    ((h << pos) >> (64 - take)) << (n - take)
}

/// One step of the descent from the root to the table a key lives in.
#[derive(Debug, Clone)]
pub(crate) struct Level {
    /// Offset of the entry array.
    pub table_off: u64,
    /// Record heading this table (0 for the root, which lives in the
    /// header).
    pub rec_off: u64,
    /// Entry slot in the parent that references this table (0 for root).
    pub parent_slot: u64,
    /// Table size exponent.
    pub tbits: u32,
    /// Hash bits consumed before this table.
    pub used: u32,
}

/// Everything `find_and_lock` learned, enough to add, delete or update
/// without searching again.  The top-level group lock is held until
/// [`Tdb::unlock_hash`] is called with it.
pub(crate) struct HashInfo {
    pub h: u64,
    /// Index of the held chain lock.
    pub top_group: u64,
    pub ltype: LockKind,
    /// Descent path; the last level is where probing stopped.
    pub levels: Vec<Level>,
    /// Slot offset of the found record's entry.
    pub found_slot: Option<u64>,
    /// First empty slot seen in the final group (or chain pages).
    pub empty_slot: Option<u64>,
    /// Hash bits consumed including the final table's positioning, i.e.
    /// the base for entry extra bits.
    pub hash_used: u32,
    /// True when probing ended inside a chain list.
    pub in_chain: bool,
    /// Last chain page (append target) when `in_chain`.
    pub chain_tail: u64,
    /// Group slot heading the chain list when `in_chain`.
    pub chain_head_slot: u64,
    /// Slot referencing the chain page a match was found in (the head
    /// slot for the first page, the previous page's next-word otherwise).
    pub chain_parent_slot: u64,
    /// Header of the found record.
    pub rec: Option<UsedRec>,
}

impl Tdb {
    /// Hash a key with the database seed.
    pub(crate) fn hash_of(&self, key: &[u8]) -> u64 {
        (self.hash_fn)(key, self.header.hash_seed)
    }

    /// Re-hash a record in place by reading its key bytes.
    pub(crate) fn hash_record(&self, off: u64) -> Result<u64> {
        let rec = self.read_used(off)?;
        let key = self.db_read_vec(off + REC_HDR_SIZE, rec.key_length())?;
        Ok(self.hash_of(&key))
    }

    /// Read and tag-check a used-style record header.
    pub(crate) fn read_used(&self, off: u64) -> Result<UsedRec> {
        let w = self.db_read_offs(off, 2)?;
        let rec = UsedRec::from_words(w[0], w[1]);
        if rec.magic().is_none() {
            return Err(Error::Corrupt);
        }
        Ok(rec)
    }

    /// Locate `key`, taking the covering chain lock.  Returns the record
    /// offset (0 when absent) and the probe state.  The lock is held on
    /// success — including the not-found case — and must be released with
    /// [`Tdb::unlock_hash`].
    pub(crate) fn find_and_lock(
        &mut self,
        key: &[u8],
        ltype: LockKind,
        wait: Wait,
    ) -> Result<(u64, HashInfo)> {
        let h = self.hash_of(key);
        let top_group = h >> (64 - (TOPLEVEL_HASH_BITS - HASH_GROUP_BITS));
        self.lock_hash_group(top_group, ltype, wait)?;
        match self.find_locked(key, h, top_group, ltype) {
            Ok(r) => Ok(r),
            Err(e) => {
                let _ = self.unlock_hash_group(top_group);
                Err(e)
            }
        }
    }

    pub(crate) fn unlock_hash(&mut self, info: &HashInfo) -> Result<()> {
        self.unlock_hash_group(info.top_group)
    }

    fn find_locked(
        &mut self,
        key: &[u8],
        h: u64,
        top_group: u64,
        ltype: LockKind,
    ) -> Result<(u64, HashInfo)> {
        self.update_header()?;
        let mut info = HashInfo {
            h,
            top_group,
            ltype,
            levels: Vec::new(),
            found_slot: None,
            empty_slot: None,
            hash_used: 0,
            in_chain: false,
            chain_tail: 0,
            chain_head_slot: 0,
            chain_parent_slot: 0,
            rec: None,
        };
        let mut level = Level {
            table_off: self.header.hash_off,
            rec_off: 0,
            parent_slot: 0,
            tbits: TOPLEVEL_HASH_BITS,
            used: 0,
        };
        loop {
            let group = bits_from(h, level.used, level.tbits - HASH_GROUP_BITS);
            let home = bits_from(h, level.used + level.tbits - HASH_GROUP_BITS, HASH_GROUP_BITS);
            let group_start = level.table_off + group * GROUP_SIZE * 8;
            let entries = self.db_read_offs(group_start, GROUP_SIZE)?;
            info.hash_used = level.used + level.tbits;
            info.levels.push(level.clone());

            if let Some(b) = (0..GROUP_SIZE).find(|&b| entry_is_subhash(entries[b as usize])) {
                // The whole group lives beneath this table.
                let child = entry_off(entries[b as usize]);
                let rec = self.read_used(child)?;
                match rec.magic() {
                    Some(Magic::HashTable) => {
                        level = Level {
                            table_off: child + REC_HDR_SIZE,
                            rec_off: child,
                            parent_slot: group_start + b * 8,
                            tbits: SUBLEVEL_HASH_BITS,
                            used: level.used + level.tbits - HASH_GROUP_BITS,
                        };
                        continue;
                    }
                    Some(Magic::Chain) => {
                        info.in_chain = true;
                        info.chain_head_slot = group_start + b * 8;
                        info.hash_used = 64;
                        let off = self.chain_find(key, h, child, &mut info)?;
                        return Ok((off, info));
                    }
                    _ => {
                        self.log(
                            LogLevel::Fatal,
                            Error::Corrupt,
                            &format!("find: subhash entry at {group_start} points at bad magic"),
                        );
                        return Err(Error::Corrupt);
                    }
                }
            }

            // Plain group: probe every bucket from the home slot.
            let extra = extra_bits(h, info.hash_used);
            for i in 0..GROUP_SIZE {
                let b = (home + i) % GROUP_SIZE;
                let e = entries[b as usize];
                if e == 0 {
                    if info.empty_slot.is_none() {
                        info.empty_slot = Some(group_start + b * 8);
                    }
                    continue;
                }
                if crate::record::entry_extra(e) != extra {
                    self.bump(|s| s.compare_wrong_rec_hash += 1);
                    continue;
                }
                let off = entry_off(e);
                if let Some(rec) = self.match_record(off, key, h)? {
                    info.found_slot = Some(group_start + b * 8);
                    info.rec = Some(rec);
                    return Ok((off, info));
                }
            }
            return Ok((0, info));
        }
    }

    /// Compare the record at `off` against `key`; `None` on mismatch.
    fn match_record(&mut self, off: u64, key: &[u8], h: u64) -> Result<Option<UsedRec>> {
        let rec = self.read_used(off)?;
        if rec.magic() != Some(Magic::Used) {
            self.log(
                LogLevel::Fatal,
                Error::Corrupt,
                &format!("find: hash entry at {off} has bad magic"),
            );
            return Err(Error::Corrupt);
        }
        if !rec.matches_hash(h) {
            self.bump(|s| s.compare_wrong_rec_hash += 1);
            return Ok(None);
        }
        if rec.key_length() != key.len() as u64 {
            return Ok(None);
        }
        self.bump(|s| s.compares += 1);
        let on_disk = self.db_read_vec(off + REC_HDR_SIZE, rec.key_length())?;
        if on_disk == key {
            Ok(Some(rec))
        } else {
            Ok(None)
        }
    }

    /// Walk chain pages for `key`, recording the first empty slot and the
    /// tail page as we go.
    fn chain_find(&mut self, key: &[u8], h: u64, head: u64, info: &mut HashInfo) -> Result<u64> {
        let mut page = head;
        let mut parent_slot = info.chain_head_slot;
        let mut hops = 0u32;
        loop {
            if hops > 1 << 20 {
                self.log(LogLevel::Fatal, Error::Corrupt, "chain_find: chain cycle");
                return Err(Error::Corrupt);
            }
            hops += 1;
            let entries = self.db_read_offs(page + REC_HDR_SIZE, GROUP_SIZE)?;
            for (i, &e) in entries.iter().enumerate() {
                let slot = page + REC_HDR_SIZE + i as u64 * 8;
                if e == 0 {
                    if info.empty_slot.is_none() {
                        info.empty_slot = Some(slot);
                    }
                    continue;
                }
                let off = entry_off(e);
                if let Some(rec) = self.match_record(off, key, h)? {
                    info.found_slot = Some(slot);
                    info.rec = Some(rec);
                    info.chain_tail = page;
                    info.chain_parent_slot = parent_slot;
                    return Ok(off);
                }
            }
            let next_slot = page + REC_HDR_SIZE + GROUP_SIZE * 8;
            let next = self.db_read_off(next_slot)?;
            if next == 0 {
                info.chain_tail = page;
                info.chain_parent_slot = parent_slot;
                return Ok(0);
            }
            parent_slot = next_slot;
            page = next;
        }
    }

    /// Install `new_off` for the key described by `info`.  May promote the
    /// final group into a sublevel or append a chain page; both allocate,
    /// and allocation exhaustion surfaces as `Oom` (the caller may expand
    /// the file and retry the whole operation).
    pub(crate) fn add_to_hash(&mut self, info: &HashInfo, new_off: u64) -> Result<()> {
        if let Some(slot) = info.empty_slot {
            let e = encode_entry(new_off, info.h, info.hash_used, false);
            return self.db_write_off(slot, e);
        }
        if info.in_chain {
            return self.chain_append(info, new_off);
        }
        // Saturated group: promote, then re-descend.  The re-descent is
        // bounded: each promotion consumes more hash bits until a chain
        // absorbs everything.
        let mut guard = 0;
        loop {
            guard += 1;
            if guard > 64 {
                self.log(LogLevel::Fatal, Error::Corrupt, "add_to_hash: promotion loop");
                return Err(Error::Corrupt);
            }
            let level = info.levels.last().expect("descent recorded at least the root");
            // Re-read the group; promotion may have happened a loop ago.
            let key = self.db_read_vec(new_off + REC_HDR_SIZE, self.read_used(new_off)?.key_length())?;
            let (off, fresh) = self.find_locked(&key, info.h, info.top_group, info.ltype)?;
            debug_assert_eq!(off, 0);
            if let Some(slot) = fresh.empty_slot {
                let e = encode_entry(new_off, info.h, fresh.hash_used, false);
                return self.db_write_off(slot, e);
            }
            if fresh.in_chain {
                return self.chain_append(&fresh, new_off);
            }
            let last = fresh.levels.last().unwrap_or(level);
            self.expand_group(last, info.h)?;
        }
    }

    /// Append a chain page holding one entry and link it after the tail.
    fn chain_append(&mut self, info: &HashInfo, new_off: u64) -> Result<()> {
        let page = self.alloc(0, CHAIN_PAYLOAD, 0, Magic::Chain, false)?;
        if page == 0 {
            return Err(Error::Oom);
        }
        self.bump(|s| s.chains += 1);
        let mut payload = [0u64; (GROUP_SIZE + 1) as usize];
        payload[0] = encode_entry(new_off, info.h, 64, false);
        self.db_write_offs(page + REC_HDR_SIZE, &payload)?;
        // Link after the tail page.
        self.db_write_off(info.chain_tail + REC_HDR_SIZE + GROUP_SIZE * 8, page)
    }

    /// Promote the saturated group that `level` describes for hash `h`:
    /// move every entry into a fresh table (or chain) selected by each
    /// member's further hash bits, then swap the group image for a single
    /// tagged pointer.
    fn expand_group(&mut self, level: &Level, h: u64) -> Result<()> {
        let group = bits_from(h, level.used, level.tbits - HASH_GROUP_BITS);
        let home = bits_from(h, level.used + level.tbits - HASH_GROUP_BITS, HASH_GROUP_BITS);
        let group_start = level.table_off + group * GROUP_SIZE * 8;
        let entries = self.db_read_offs(group_start, GROUP_SIZE)?;
        let child_used = level.used + level.tbits - HASH_GROUP_BITS;

        let mut new_group = [0u64; GROUP_SIZE as usize];
        if child_used + SUBLEVEL_HASH_BITS > 64 {
            // No hash bits left to spread on: convert to chain pages.
            let head = self.entries_to_chain(&entries)?;
            new_group[home as usize] = encode_entry(head, 0, 64, true);
        } else {
            let table = self.entries_to_sublevel(&entries, child_used)?;
            new_group[home as usize] = encode_entry(table, 0, 64, true);
        }
        self.bump(|s| s.subhashes += 1);
        self.db_write_offs(group_start, &new_group)
    }

    /// Build a sublevel holding `entries`, re-hashing each member by its
    /// key.  On any failure the partially built subtree is released and
    /// the original group is left untouched.
    fn entries_to_sublevel(&mut self, entries: &[u64], child_used: u32) -> Result<u64> {
        let table = self.alloc(0, SUBLEVEL_PAYLOAD, 0, Magic::HashTable, false)?;
        if table == 0 {
            return Err(Error::Oom);
        }
        let zero = vec![0u64; 1 << SUBLEVEL_HASH_BITS];
        self.db_write_offs(table + REC_HDR_SIZE, &zero)?;
        for &e in entries {
            debug_assert!(!entry_is_subhash(e) && e != 0);
            let off = entry_off(e);
            let he = match self.hash_record(off) {
                Ok(he) => he,
                Err(err) => {
                    self.release_subtree(table)?;
                    return Err(err);
                }
            };
            if let Err(err) =
                self.table_insert(table + REC_HDR_SIZE, SUBLEVEL_HASH_BITS, child_used, he, off)
            {
                self.release_subtree(table)?;
                return Err(err);
            }
        }
        Ok(table)
    }

    /// Spill `entries` into a fresh chain list (one page; eight fit).
    fn entries_to_chain(&mut self, entries: &[u64]) -> Result<u64> {
        let page = self.alloc(0, CHAIN_PAYLOAD, 0, Magic::Chain, false)?;
        if page == 0 {
            return Err(Error::Oom);
        }
        self.bump(|s| s.chains += 1);
        let mut payload = [0u64; (GROUP_SIZE + 1) as usize];
        for (i, &e) in entries.iter().enumerate() {
            payload[i] = encode_entry(entry_off(e), 0, 64, false);
        }
        self.db_write_offs(page + REC_HDR_SIZE, &payload)?;
        Ok(page)
    }

    /// Insert into a (possibly fresh) table, promoting its groups
    /// recursively when they saturate.
    fn table_insert(
        &mut self,
        table_off: u64,
        tbits: u32,
        used: u32,
        h: u64,
        rec_off: u64,
    ) -> Result<()> {
        let group = bits_from(h, used, tbits - HASH_GROUP_BITS);
        let home = bits_from(h, used + tbits - HASH_GROUP_BITS, HASH_GROUP_BITS);
        let group_start = table_off + group * GROUP_SIZE * 8;
        let entries = self.db_read_offs(group_start, GROUP_SIZE)?;

        if let Some(b) = (0..GROUP_SIZE).find(|&b| entry_is_subhash(entries[b as usize])) {
            let child = entry_off(entries[b as usize]);
            let rec = self.read_used(child)?;
            return match rec.magic() {
                Some(Magic::HashTable) => self.table_insert(
                    child + REC_HDR_SIZE,
                    SUBLEVEL_HASH_BITS,
                    used + tbits - HASH_GROUP_BITS,
                    h,
                    rec_off,
                ),
                Some(Magic::Chain) => self.chain_insert(child, h, rec_off),
                _ => Err(Error::Corrupt),
            };
        }
        for i in 0..GROUP_SIZE {
            let b = (home + i) % GROUP_SIZE;
            if entries[b as usize] == 0 {
                let e = encode_entry(rec_off, h, used + tbits, false);
                return self.db_write_off(group_start + b * 8, e);
            }
        }
        // Saturated: promote this group and retry.
        let level = Level {
            table_off,
            rec_off: 0,
            parent_slot: 0,
            tbits,
            used,
        };
        self.expand_group(&level, h)?;
        self.table_insert(table_off, tbits, used, h, rec_off)
    }

    /// Insert into a chain list: first empty slot, else a fresh tail page.
    fn chain_insert(&mut self, head: u64, h: u64, rec_off: u64) -> Result<()> {
        let mut page = head;
        loop {
            let entries = self.db_read_offs(page + REC_HDR_SIZE, GROUP_SIZE)?;
            for (i, &e) in entries.iter().enumerate() {
                if e == 0 {
                    let slot = page + REC_HDR_SIZE + i as u64 * 8;
                    return self.db_write_off(slot, encode_entry(rec_off, h, 64, false));
                }
            }
            let next_slot = page + REC_HDR_SIZE + GROUP_SIZE * 8;
            let next = self.db_read_off(next_slot)?;
            if next == 0 {
                let fresh = self.alloc(0, CHAIN_PAYLOAD, 0, Magic::Chain, false)?;
                if fresh == 0 {
                    return Err(Error::Oom);
                }
                self.bump(|s| s.chains += 1);
                let mut payload = [0u64; (GROUP_SIZE + 1) as usize];
                payload[0] = encode_entry(rec_off, h, 64, false);
                self.db_write_offs(fresh + REC_HDR_SIZE, &payload)?;
                return self.db_write_off(next_slot, fresh);
            }
            page = next;
        }
    }

    /// Release a table record and every table reachable beneath it.  The
    /// member *records* stay; they are still referenced elsewhere.
    fn release_subtree(&mut self, table: u64) -> Result<()> {
        let rec = self.read_used(table)?;
        if rec.magic() == Some(Magic::HashTable) {
            let n = rec.data_length() / 8;
            let entries = self.db_read_offs(table + REC_HDR_SIZE, n)?;
            for e in entries {
                if entry_is_subhash(e) {
                    self.release_subtree(entry_off(e))?;
                }
            }
        }
        self.add_free_record(table, rec.total_len())
    }

    /// Remove the entry `info` found, then collapse any table or chain
    /// page the removal emptied, walking back up the descent path.
    pub(crate) fn delete_from_hash(&mut self, info: &HashInfo) -> Result<()> {
        let slot = info.found_slot.ok_or(Error::Corrupt)?;
        self.db_write_off(slot, 0)?;

        if info.in_chain {
            self.collapse_chain(info.chain_head_slot)?;
        }
        // Collapse empty sublevels from the innermost out.
        for i in (1..info.levels.len()).rev() {
            let level = &info.levels[i];
            let n = 1u64 << level.tbits;
            let entries = self.db_read_offs(level.table_off, n)?;
            if entries.iter().any(|&e| e != 0) {
                break;
            }
            let rec = self.read_used(level.rec_off)?;
            self.db_write_off(level.parent_slot, 0)?;
            self.add_free_record(level.rec_off, rec.total_len())?;
        }
        Ok(())
    }

    /// Free a chain list once its last entry is gone.  Collapse is
    /// all-or-nothing: emptied middle pages stay linked while any entry
    /// survives, so a traversal positioned on one page never has later
    /// pages pulled out from under it.
    fn collapse_chain(&mut self, head_slot: u64) -> Result<()> {
        let head = entry_off(self.db_read_off(head_slot)?);
        let mut page = head;
        while page != 0 {
            let entries = self.db_read_offs(page + REC_HDR_SIZE, GROUP_SIZE)?;
            if entries.iter().any(|&e| e != 0) {
                return Ok(());
            }
            page = self.db_read_off(page + REC_HDR_SIZE + GROUP_SIZE * 8)?;
        }
        // Every page is empty: unhook the list and release the pages.
        self.db_write_off(head_slot, 0)?;
        let mut page = head;
        while page != 0 {
            let next = self.db_read_off(page + REC_HDR_SIZE + GROUP_SIZE * 8)?;
            let rec = self.read_used(page)?;
            self.add_free_record(page, rec.total_len())?;
            page = next;
        }
        Ok(())
    }

    /// Point the entry that references `old_off` at `new_off` instead,
    /// keeping its tag bits.
    pub(crate) fn replace_in_hash(&mut self, info: &HashInfo, new_off: u64) -> Result<()> {
        let slot = info.found_slot.ok_or(Error::Corrupt)?;
        let e = encode_entry(new_off, info.h, info.hash_used, false);
        self.db_write_off(slot, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_extraction_from_msb() {
        let h = 0xABCD_EF01_2345_6789u64;
        assert_eq!(bits_from(h, 0, 7), 0xAB >> 1);
        assert_eq!(bits_from(h, 0, 10), 0xABC >> 2);
        assert_eq!(bits_from(h, 4, 4), 0xB);
        assert_eq!(bits_from(h, 60, 4), 0x9);
        // Past the end: zero-padded on the right.
        assert_eq!(bits_from(h, 62, 3), 0b010);
        assert_eq!(bits_from(h, 64, 3), 0);
    }

    #[test]
    fn descent_geometry() {
        // Root group/home split covers the top ten bits.
        let h = u64::MAX;
        assert_eq!(bits_from(h, 0, TOPLEVEL_HASH_BITS - HASH_GROUP_BITS), 127);
        assert_eq!(
            bits_from(h, TOPLEVEL_HASH_BITS - HASH_GROUP_BITS, HASH_GROUP_BITS),
            7
        );
        assert_eq!(SUBLEVEL_PAYLOAD, 512);
        assert_eq!(CHAIN_PAYLOAD, 72);
    }
}
