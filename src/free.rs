//! Free-space management: size-class buckets of doubly linked free
//! records, allocation with growth headroom, and neighbour coalescing.
//!
//! Each free table is a record whose payload is a `next` table offset
//! followed by [`FREE_BUCKETS`] bucket heads.  Bucket spacing is four per
//! power of two, so bucket `i` holds regions whose payload length lies in
//! a geometric band.  List links are file offsets with 0 as null; `prev`
//! of the list head is 0 and the head is identified through the bucket
//! word itself.
//!
//! Coalescing uses a trailer word: the last 8 bytes of every free region
//! hold the region's own start offset.  Freeing a region peeks one word to
//! its left, validates that the candidate really is a resting free record
//! ending exactly there, and merges; then it peeks the header at its right
//! edge and merges forward.  Validation is what makes the trailer safe:
//! bytes inside used records may spell anything, but they only merge if
//! the record they point at is genuinely free and adjacent.

use crate::db::Tdb;
use crate::error::{Error, LogLevel, Result};
use crate::layout::{Magic, DATA_START};
use crate::lock::Wait;
use crate::record::{FreeRec, UsedRec, MAX_EXTRA, MIN_DATA_LEN, REC_HDR_SIZE};

/// Buckets per free table.  Sizes past the last exact band all share the
/// final bucket.
pub const FREE_BUCKETS: u64 = 120;

/// Payload bytes of a free-table record: `next` plus the bucket array.
pub const FTABLE_PAYLOAD: u64 = 8 + FREE_BUCKETS * 8;

/// Size class for a free payload length: `ilog2(len)*4` plus the two bits
/// below the leading one, capped to the last bucket.
pub fn size_to_bucket(len: u64) -> u64 {
    debug_assert!(len >= MIN_DATA_LEN);
    let l = 63 - u64::from(len.leading_zeros());
    let frac = if l >= 2 { (len >> (l - 2)) & 3 } else { 0 };
    (l * 4 + frac).min(FREE_BUCKETS - 1)
}

impl Tdb {
    /// File offset of bucket `b` of the table at `ftable_off`.
    #[inline]
    pub(crate) fn bucket_off(&self, ftable_off: u64, b: u64) -> u64 {
        ftable_off + REC_HDR_SIZE + 8 + b * 8
    }

    /// Re-read the free-table chain from the header.
    pub(crate) fn load_ftables(&mut self) -> Result<()> {
        self.ftables.clear();
        let mut off = self.header.free_table;
        while off != 0 {
            if self.ftables.len() > 64 {
                self.log(
                    LogLevel::Error,
                    Error::Corrupt,
                    "load_ftables: free table chain too long",
                );
                return Err(Error::Corrupt);
            }
            self.ftables.push(off);
            off = self.db_read_off(off + REC_HDR_SIZE)?;
        }
        if self.ftables.is_empty() {
            self.log(LogLevel::Error, Error::Corrupt, "load_ftables: no free table");
            return Err(Error::Corrupt);
        }
        if self.last_ftable >= self.ftables.len() {
            self.last_ftable = 0;
        }
        Ok(())
    }

    fn read_free(&self, off: u64) -> Result<FreeRec> {
        let w = self.db_read_offs(off, 3)?;
        FreeRec::decode(w[0], w[1], w[2])
    }

    fn write_free(&mut self, off: u64, f: &FreeRec) -> Result<()> {
        let (w0, w1, w2) = f.encode()?;
        self.db_write_offs(off, &[w0, w1, w2])?;
        // Trailer: last word of the region names its start.
        self.db_write_off(off + f.total_len() - 8, off)
    }

    /// Unlink `off` from its bucket list.  The bucket lock is held by the
    /// caller; `bucket` is the bucket head's file offset.
    fn unlink_free(&mut self, bucket: u64, off: u64, f: &FreeRec) -> Result<()> {
        if f.prev == 0 {
            if self.db_read_off(bucket)? != off {
                self.log(
                    LogLevel::Error,
                    Error::Corrupt,
                    &format!("unlink_free: record {off} not at head of its bucket"),
                );
                return Err(Error::Corrupt);
            }
            self.db_write_off(bucket, f.next)?;
        } else {
            // prev.next = next
            self.db_write_off(f.prev + REC_HDR_SIZE, f.next)?;
        }
        if f.next != 0 {
            // next.prev = prev, preserving next's magic bits
            let w0 = self.db_read_off(f.next)?;
            let mut n = FreeRec::decode(w0, self.db_read_off(f.next + 8)?, 0)?;
            n.prev = f.prev;
            n.next = self.db_read_off(f.next + REC_HDR_SIZE)?;
            self.write_free_links_only(f.next, &n)?;
        }
        Ok(())
    }

    /// Rewrite only words 0 and 2 (prev and next) of a free record.
    fn write_free_links_only(&mut self, off: u64, f: &FreeRec) -> Result<()> {
        let (w0, _, w2) = f.encode()?;
        self.db_write_off(off, w0)?;
        self.db_write_off(off + REC_HDR_SIZE, w2)
    }

    /// Push a free record of payload `len` onto bucket `bucket` of the
    /// table with index `ftable`.
    fn enqueue_free(&mut self, off: u64, len: u64, ftable: u32, bucket: u64) -> Result<()> {
        let old_head = self.db_read_off(bucket)?;
        let f = FreeRec {
            prev: 0,
            next: old_head,
            ftable,
            len,
        };
        self.write_free(off, &f)?;
        if old_head != 0 {
            let w0 = self.db_read_off(old_head)?;
            let mut h = FreeRec::decode(w0, self.db_read_off(old_head + 8)?, 0)?;
            h.prev = off;
            h.next = self.db_read_off(old_head + REC_HDR_SIZE)?;
            self.write_free_links_only(old_head, &h)?;
        }
        self.db_write_off(bucket, off)
    }

    /// Attempt to merge a resting free neighbour ending exactly at `off`.
    /// Returns the merged region start, or `off` unchanged.
    fn try_merge_left(&mut self, off: u64) -> Result<u64> {
        if off < DATA_START + REC_HDR_SIZE + MIN_DATA_LEN {
            return Ok(off);
        }
        let cand = self.db_read_off(off - 8)?;
        if cand < DATA_START || cand + REC_HDR_SIZE + MIN_DATA_LEN > off || cand % 8 != 0 {
            return Ok(off);
        }
        let w0 = self.db_read_off(cand)?;
        let w1 = self.db_read_off(cand + 8)?;
        let f = match FreeRec::decode(w0, w1, 0) {
            Ok(f) => f,
            Err(_) => return Ok(off),
        };
        if cand + f.total_len() != off {
            return Ok(off);
        }
        let ftable_off = match self.ftables.get(f.ftable as usize) {
            Some(&t) => t,
            None => return Ok(off),
        };
        let bucket = self.bucket_off(ftable_off, size_to_bucket(f.len));
        self.bump(|s| s.alloc_coalesce_tried += 1);
        if self.lock_free_bucket(bucket, Wait::NonBlock).is_err() {
            return Ok(off);
        }
        // Re-validate under the lock; the record may have been allocated
        // or reshaped into a different size class meanwhile.
        let res = (|| -> Result<u64> {
            let w0 = self.db_read_off(cand)?;
            let w1 = self.db_read_off(cand + 8)?;
            let w2 = self.db_read_off(cand + REC_HDR_SIZE)?;
            let f = match FreeRec::decode(w0, w1, w2) {
                Ok(f) => f,
                Err(_) => return Ok(off),
            };
            if cand + f.total_len() != off
                || f.ftable as usize >= self.ftables.len()
                || self.bucket_off(self.ftables[f.ftable as usize], size_to_bucket(f.len))
                    != bucket
            {
                return Ok(off);
            }
            self.unlink_free(bucket, cand, &f)?;
            self.bump(|s| s.alloc_coalesce_succeeded += 1);
            Ok(cand)
        })();
        self.unlock_free_bucket(bucket)?;
        res
    }

    /// Attempt to merge a resting free record starting exactly at `end`.
    /// Returns the merged region end, or `end` unchanged.
    fn try_merge_right(&mut self, end: u64) -> Result<u64> {
        if end + REC_HDR_SIZE + MIN_DATA_LEN > self.db_size() {
            return Ok(end);
        }
        let w0 = self.db_read_off(end)?;
        let w1 = self.db_read_off(end + 8)?;
        let f = match FreeRec::decode(w0, w1, 0) {
            Ok(f) => f,
            Err(_) => return Ok(end),
        };
        let ftable_off = match self.ftables.get(f.ftable as usize) {
            Some(&t) => t,
            None => return Ok(end),
        };
        let bucket = self.bucket_off(ftable_off, size_to_bucket(f.len));
        self.bump(|s| s.alloc_coalesce_tried += 1);
        if self.lock_free_bucket(bucket, Wait::NonBlock).is_err() {
            return Ok(end);
        }
        let res = (|| -> Result<u64> {
            let w0 = self.db_read_off(end)?;
            let w1 = self.db_read_off(end + 8)?;
            let w2 = self.db_read_off(end + REC_HDR_SIZE)?;
            let f = match FreeRec::decode(w0, w1, w2) {
                Ok(f) => f,
                Err(_) => return Ok(end),
            };
            if f.ftable as usize >= self.ftables.len()
                || self.bucket_off(self.ftables[f.ftable as usize], size_to_bucket(f.len))
                    != bucket
            {
                return Ok(end);
            }
            self.unlink_free(bucket, end, &f)?;
            self.bump(|s| s.alloc_coalesce_succeeded += 1);
            Ok(end + f.total_len())
        })();
        self.unlock_free_bucket(bucket)?;
        res
    }

    /// Hand `[off, off+total_len)` back to the free lists, coalescing with
    /// resting free neighbours on both sides.
    pub(crate) fn add_free_record(&mut self, off: u64, total_len: u64) -> Result<()> {
        debug_assert!(total_len >= REC_HDR_SIZE + MIN_DATA_LEN);
        self.bump(|s| s.frees += 1);
        let mut start = self.try_merge_left(off)?;
        let mut end = off + total_len;
        loop {
            let merged = self.try_merge_right(end)?;
            if merged == end {
                break;
            }
            end = merged;
        }
        // One more look left in case the left merge grew our span's class.
        if start == off {
            start = self.try_merge_left(off)?;
        }
        let len = end - start - REC_HDR_SIZE;
        let ftable = self.last_ftable as u32;
        let ftable_off = self.ftables[self.last_ftable];
        let bucket = self.bucket_off(ftable_off, size_to_bucket(len));
        self.lock_free_bucket(bucket, Wait::Block)?;
        let res = self.enqueue_free(start, len, ftable, bucket);
        self.unlock_free_bucket(bucket)?;
        res
    }

    /// Allocate a region able to hold a record with the given key and data
    /// lengths.  `growing` reserves ~50% data headroom and records it as
    /// tail padding so the record can grow in place.  Returns the record
    /// offset, or 0 when no free region fits ("expand the file and retry").
    pub(crate) fn alloc(
        &mut self,
        key_len: u64,
        data_len: u64,
        hash: u64,
        magic: Magic,
        growing: bool,
    ) -> Result<u64> {
        self.bump(|s| s.allocs += 1);
        let need = (key_len + data_len).max(MIN_DATA_LEN);
        let want = if growing {
            (key_len + data_len + data_len / 2).max(MIN_DATA_LEN)
        } else {
            need
        };
        let start_bucket = size_to_bucket(need.next_multiple_of(8));
        let ntables = self.ftables.len();
        for ti in 0..ntables {
            let t = (self.last_ftable + ti) % ntables;
            let ftable_off = self.ftables[t];
            for b in start_bucket..FREE_BUCKETS {
                let bucket = self.bucket_off(ftable_off, b);
                self.lock_free_bucket(bucket, Wait::Block)?;
                let got = self.alloc_from_bucket(bucket, need, want, key_len, data_len, hash, magic);
                self.unlock_free_bucket(bucket)?;
                match got {
                    Ok(None) => continue,
                    Ok(Some((off, tail))) => {
                        // The split-off tail is re-listed only after the
                        // source bucket is unlocked: one bucket lock at a
                        // time, so list locks can never cycle.
                        if let Some((tail_off, tail_len)) = tail {
                            self.add_free_record(tail_off, tail_len)?;
                        }
                        if b == start_bucket {
                            self.bump(|s| s.alloc_bucket_exact += 1);
                        }
                        if b == FREE_BUCKETS - 1 {
                            self.bump(|s| s.alloc_bucket_max += 1);
                        }
                        // Rotate the starting table to spread contention.
                        self.last_ftable = (t + 1) % ntables;
                        return Ok(off);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(0)
    }

    /// First fit within one locked bucket.  On success returns the record
    /// offset plus a pending `(offset, total_len)` tail split for the
    /// caller to re-list once the bucket lock is gone.
    #[allow(clippy::type_complexity)]
    fn alloc_from_bucket(
        &mut self,
        bucket: u64,
        need: u64,
        want: u64,
        key_len: u64,
        data_len: u64,
        hash: u64,
        magic: Magic,
    ) -> Result<Option<(u64, Option<(u64, u64)>)>> {
        let mut off = self.db_read_off(bucket)?;
        let mut hops = 0u32;
        while off != 0 {
            if hops > 1 << 20 {
                self.log(LogLevel::Error, Error::Corrupt, "alloc: free list cycle");
                return Err(Error::Corrupt);
            }
            hops += 1;
            let f = self.read_free(off)?;
            if f.len >= need {
                self.unlink_free(bucket, off, &f)?;
                return self
                    .finish_alloc(off, f.len, need, want, key_len, data_len, hash, magic)
                    .map(Some);
            }
            off = f.next;
        }
        Ok(None)
    }

    /// Carve the chosen region: write the new record header and report
    /// any oversized tail for the caller to return to the free lists.
    #[allow(clippy::too_many_arguments)]
    fn finish_alloc(
        &mut self,
        off: u64,
        len: u64,
        need: u64,
        want: u64,
        key_len: u64,
        data_len: u64,
        hash: u64,
        magic: Magic,
    ) -> Result<(u64, Option<(u64, u64)>)> {
        let max_keep = (key_len + data_len + MAX_EXTRA).max(MIN_DATA_LEN);
        let mut keep = want.min(max_keep).max(need).next_multiple_of(8);
        // Splitting only pays when the remainder is a whole free record.
        if len < keep + REC_HDR_SIZE + MIN_DATA_LEN {
            if len <= max_keep {
                keep = len;
            } else {
                // The padding field cannot absorb the whole region; force a
                // minimal split instead.
                keep = len - (REC_HDR_SIZE + MIN_DATA_LEN);
            }
        }
        let tail = if keep < len {
            let tail_off = off + REC_HDR_SIZE + keep;
            // Stomp the stale word so a neighbour's coalesce peek cannot
            // mistake the not-yet-listed tail for a resting free record.
            self.db_write_off(tail_off, 0)?;
            Some((tail_off, len - keep))
        } else {
            None
        };
        let extra = keep - key_len - data_len;
        let rec = UsedRec::set_header(key_len, data_len, extra, hash, magic)?;
        let (w0, w1) = rec.words();
        self.db_write_offs(off, &[w0, w1])?;
        Ok((off, tail))
    }

    /// Grow the file to make at least `needed` more payload bytes
    /// available, adding the new space as one free record.  Takes the
    /// allrecord lock unless one is already held (a transaction holds an
    /// upgradable one for its whole lifetime); callers must hold no chain
    /// lock when the lock is still to be taken.
    pub(crate) fn expand(&mut self, needed: u64) -> Result<()> {
        let need_lock = self.allrecord.is_none();
        if need_lock {
            self.allrecord_lock(crate::attr::LockKind::Write, Wait::Block, false)?;
        }
        let res = (|| -> Result<()> {
            // Someone else may have grown the file while we waited.
            self.refresh_file_size()?;
            let size = self.db_size();
            let add = (needed + REC_HDR_SIZE)
                .max(size / 4)
                .max(REC_HDR_SIZE + MIN_DATA_LEN)
                .next_multiple_of(8);
            self.bump(|s| s.expands += 1);
            self.db_grow(add)?;
            self.add_free_record(size, add)
        })();
        if need_lock {
            self.allrecord_unlock()?;
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_spacing_is_four_per_power_of_two() {
        assert_eq!(size_to_bucket(16), 16);
        assert_eq!(size_to_bucket(31), 19);
        assert_eq!(size_to_bucket(32), 20);
        assert_eq!(size_to_bucket(40), 21);
        assert_eq!(size_to_bucket(48), 22);
        assert_eq!(size_to_bucket(56), 23);
        assert_eq!(size_to_bucket(64), 24);
        // Monotone in size.
        let mut last = 0;
        for len in (16..1 << 16).step_by(7) {
            let b = size_to_bucket(len);
            assert!(b >= last, "bucket regressed at len {len}");
            last = b;
        }
        // Huge regions cap at the final bucket.
        assert_eq!(size_to_bucket(u64::MAX / 2), FREE_BUCKETS - 1);
    }
}
