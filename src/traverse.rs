//! Iteration over live records: positional traversal and the
//! `firstkey`/`nextkey` cursor form.
//!
//! Traversal walks the hash trees in slot order, holding the covering
//! chain lock only while it copies a record out, never while the caller's
//! callback runs — so the callback may delete the record it was handed, or
//! store others, through the same handle.  The position survives deletion
//! because removal only zeroes slots; when a deletion collapses a whole
//! sublevel the stale stack levels fail revalidation and the walk resumes
//! in the parent, which has already moved past them.
//!
//! `nextkey` carries no hidden state: it relocates the given key by hash,
//! then advances.  If the key was deleted since it was handed out, the
//! walk resumes from the key's would-be slot, which after a plain
//! delete-current is exactly where it sat.

use crate::attr::LockKind;
use crate::db::Tdb;
use crate::error::{Error, Result};
use crate::hash::GROUP_SIZE;
use crate::layout::{Magic, HASH_GROUP_BITS, TOPLEVEL_HASH_BITS};
use crate::lock::Wait;
use crate::record::{entry_is_subhash, entry_off, REC_HDR_SIZE};

/// One level of the iteration stack.
#[derive(Debug, Clone)]
struct TravLevel {
    /// Offset of the entry array being scanned.
    table_off: u64,
    /// Record heading this table (0 for the root).
    rec_off: u64,
    /// Slot that referenced this table (0 for the root).
    parent_slot: u64,
    /// Entry count.
    entries: u64,
    /// Next entry index to examine.
    idx: u64,
    /// Chain page: after the entries, follow the next-page word.
    chain: bool,
}

/// A resumable traversal position.
pub struct TravPos {
    stack: Vec<TravLevel>,
}

impl TravPos {
    fn start(root_off: u64, root_entries: u64) -> TravPos {
        TravPos {
            stack: vec![TravLevel {
                table_off: root_off,
                rec_off: 0,
                parent_slot: 0,
                entries: root_entries,
                idx: 0,
                chain: false,
            }],
        }
    }

    fn done(&self) -> bool {
        self.stack.is_empty()
    }

    /// Top-level group the walk is currently inside.
    fn group(&self) -> u64 {
        let root = &self.stack[0];
        let idx = if self.stack.len() > 1 {
            root.idx.saturating_sub(1)
        } else {
            root.idx
        };
        idx >> HASH_GROUP_BITS
    }
}

impl Tdb {
    fn trav_root(&self) -> (u64, u64) {
        (self.header.hash_off, 1 << self.header.hash_bits)
    }

    /// Drop stack levels whose tables no longer hang where they used to
    /// (a callback deleted records and collapsed them).
    fn trav_revalidate(&mut self, pos: &mut TravPos) -> Result<()> {
        let mut keep = pos.stack.len();
        for i in 1..pos.stack.len() {
            let lvl = &pos.stack[i];
            let referenced = self.db_read_off(lvl.parent_slot)?;
            let still_there = (entry_is_subhash(referenced) && entry_off(referenced) == lvl.rec_off)
                || referenced == lvl.rec_off;
            if !still_there {
                keep = i;
                break;
            }
            let rec = self.read_used(lvl.rec_off)?;
            match rec.magic() {
                Some(Magic::HashTable) | Some(Magic::Chain) => {}
                _ => {
                    keep = i;
                    break;
                }
            }
        }
        pos.stack.truncate(keep);
        Ok(())
    }

    /// Advance to the next record without leaving the given top-level
    /// group (its lock is what we hold).  `None` means the group — or the
    /// whole table — is exhausted.
    fn trav_advance(&mut self, pos: &mut TravPos, group: u64) -> Result<Option<u64>> {
        loop {
            let at_root = match pos.stack.len() {
                0 => return Ok(None),
                n => n == 1,
            };
            let lvl = pos.stack.last_mut().expect("nonempty checked above");
            if at_root && lvl.idx >= (group + 1) * GROUP_SIZE {
                // Next group: caller must move the lock first.
                return Ok(None);
            }
            if lvl.idx >= lvl.entries {
                if lvl.chain {
                    let next_slot = lvl.table_off + GROUP_SIZE * 8;
                    let next = self.db_read_off(next_slot)?;
                    if next != 0 {
                        *lvl = TravLevel {
                            table_off: next + REC_HDR_SIZE,
                            rec_off: next,
                            parent_slot: next_slot,
                            entries: GROUP_SIZE,
                            idx: 0,
                            chain: true,
                        };
                        continue;
                    }
                }
                pos.stack.pop();
                continue;
            }
            let slot = lvl.table_off + lvl.idx * 8;
            lvl.idx += 1;
            let e = self.db_read_off(slot)?;
            if e == 0 {
                continue;
            }
            if entry_is_subhash(e) {
                let child = entry_off(e);
                let rec = self.read_used(child)?;
                let child_lvl = match rec.magic() {
                    Some(Magic::HashTable) => TravLevel {
                        table_off: child + REC_HDR_SIZE,
                        rec_off: child,
                        parent_slot: slot,
                        entries: rec.data_length() / 8,
                        idx: 0,
                        chain: false,
                    },
                    Some(Magic::Chain) => TravLevel {
                        table_off: child + REC_HDR_SIZE,
                        rec_off: child,
                        parent_slot: slot,
                        entries: GROUP_SIZE,
                        idx: 0,
                        chain: true,
                    },
                    _ => return Err(Error::Corrupt),
                };
                pos.stack.push(child_lvl);
                continue;
            }
            return Ok(Some(entry_off(e)));
        }
    }

    /// Produce the next `(key, value)` pair, or `None` at the end.  Takes
    /// and releases the covering chain lock internally.
    pub(crate) fn trav_step(&mut self, pos: &mut TravPos) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let groups = 1u64 << (TOPLEVEL_HASH_BITS - HASH_GROUP_BITS);
        while !pos.done() {
            let group = pos.group();
            if group >= groups {
                return Ok(None);
            }
            self.lock_hash_group(group, LockKind::Read, Wait::Block)?;
            let res = (|| -> Result<Option<(Vec<u8>, Vec<u8>)>> {
                self.update_header()?;
                self.trav_revalidate(pos)?;
                match self.trav_advance(pos, group)? {
                    Some(off) => {
                        let rec = self.read_used(off)?;
                        if rec.magic() != Some(Magic::Used) {
                            return Err(Error::Corrupt);
                        }
                        let key = self.db_read_vec(off + REC_HDR_SIZE, rec.key_length())?;
                        let val = self.db_read_vec(
                            off + REC_HDR_SIZE + rec.key_length(),
                            rec.data_length(),
                        )?;
                        Ok(Some((key, val)))
                    }
                    None => Ok(None),
                }
            })();
            self.unlock_hash_group(group)?;
            match res {
                Ok(Some(kv)) => return Ok(Some(kv)),
                Ok(None) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Visit every live record.  The callback receives the handle itself
    /// plus the key and value, and returns `false` to stop early; it may
    /// delete the record it was given and store or delete others.  Returns
    /// the number of records visited.
    pub fn traverse(
        &mut self,
        mut f: impl FnMut(&mut Tdb, &[u8], &[u8]) -> bool,
    ) -> Result<u64> {
        if self.v1.is_some() {
            return crate::tdb1::traverse(self, f);
        }
        self.bump(|s| s.traverses += 1);
        let (root, entries) = self.trav_root();
        let mut pos = TravPos::start(root, entries);
        let mut count = 0u64;
        while let Some((k, v)) = self.trav_step(&mut pos)? {
            count += 1;
            if !f(self, &k, &v) {
                break;
            }
        }
        Ok(count)
    }

    /// First key in traversal order.
    pub fn firstkey(&mut self) -> Result<Option<Vec<u8>>> {
        if self.v1.is_some() {
            return crate::tdb1::firstkey(self);
        }
        let (root, entries) = self.trav_root();
        let mut pos = TravPos::start(root, entries);
        Ok(self.trav_step(&mut pos)?.map(|(k, _)| k))
    }

    /// The key after `key` in traversal order, relocating by hash.
    pub fn nextkey(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.v1.is_some() {
            return crate::tdb1::nextkey(self, key);
        }
        let mut pos = match self.pos_after(key)? {
            Some(pos) => pos,
            None => return Ok(None),
        };
        Ok(self.trav_step(&mut pos)?.map(|(k, _)| k))
    }

    /// Build the traversal position just past `key`'s slot (or its
    /// would-be slot when the key is gone).
    fn pos_after(&mut self, key: &[u8]) -> Result<Option<TravPos>> {
        let (off, info) = self.find_and_lock(key, LockKind::Read, Wait::Block)?;
        let res = (|| -> Result<Option<TravPos>> {
            let (root, root_entries) = self.trav_root();
            let mut stack = Vec::with_capacity(info.levels.len() + 1);
            for (i, lvl) in info.levels.iter().enumerate() {
                let entries = if i == 0 { root_entries } else { 1 << lvl.tbits };
                stack.push(TravLevel {
                    table_off: lvl.table_off,
                    rec_off: lvl.rec_off,
                    parent_slot: lvl.parent_slot,
                    entries,
                    idx: 0,
                    chain: false,
                });
            }
            debug_assert_eq!(stack[0].table_off, root);
            if info.in_chain {
                let page = info.chain_tail;
                stack.push(TravLevel {
                    table_off: page + REC_HDR_SIZE,
                    rec_off: page,
                    parent_slot: info.chain_parent_slot,
                    entries: GROUP_SIZE,
                    idx: 0,
                    chain: true,
                });
            }
            // Point each ancestor level one past the slot it descended by.
            // A chain page deep in its list is anchored by the head slot,
            // which is the one that lives in the ancestor table.
            for i in 0..stack.len() - 1 {
                let (child_chain, child_parent_slot) =
                    (stack[i + 1].chain, stack[i + 1].parent_slot);
                let anchor = if child_chain {
                    info.chain_head_slot
                } else {
                    child_parent_slot
                };
                let lvl = &mut stack[i];
                if anchor >= lvl.table_off && anchor < lvl.table_off + lvl.entries * 8 {
                    lvl.idx = (anchor - lvl.table_off) / 8 + 1;
                } else {
                    lvl.idx = lvl.entries;
                }
            }
            // Point the leaf level past the record (or at its would-be slot).
            let leaf = stack.last_mut().expect("at least the root level");
            let resume_slot = if off != 0 { info.found_slot } else { info.empty_slot };
            match resume_slot {
                Some(slot) if slot >= leaf.table_off && slot < leaf.table_off + leaf.entries * 8 =>
                {
                    leaf.idx = (slot - leaf.table_off) / 8;
                    if off != 0 {
                        leaf.idx += 1;
                    }
                }
                _ if leaf.chain => {
                    // A full chain without the key: it would have been
                    // appended past the tail, so resume there.
                    leaf.idx = leaf.entries;
                }
                _ => {
                    // Saturated group with the key absent: resume after it.
                    let h = info.h;
                    let lvl = info.levels.last().expect("descent recorded the root");
                    let group = crate::hash::bits_from(h, lvl.used, lvl.tbits - HASH_GROUP_BITS);
                    leaf.idx = (group + 1) * GROUP_SIZE;
                }
            }
            Ok(Some(TravPos { stack }))
        })();
        self.unlock_hash(&info)?;
        res
    }
}
