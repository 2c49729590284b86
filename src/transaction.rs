//! Transactions: a process-local page overlay plus a durable recovery
//! record.
//!
//! While a transaction is open every engine write lands in overlay pages
//! and every read checks them first, so the file itself is untouched until
//! commit.  Isolation comes from the lock manager: `transaction_start`
//! takes the transaction byte and an upgradable shared allrecord lock, so
//! other writers block while readers keep seeing the pre-transaction
//! state.
//!
//! Commit is two-phase.  `prepare` upgrades the allrecord lock, serializes
//! before-images of every touched page into a recovery record placed past
//! the transaction's end-of-file snapshot, syncs, installs the header's
//! recovery pointer and syncs again — from here the transaction survives a
//! crash.  `commit` applies the overlay, syncs, invalidates the recovery
//! record and pointer, syncs, and hands the recovery space to the free
//! lists.  A first opener that finds a valid recovery pointer replays the
//! before-images and truncates back to the snapshot size.
//!
//! Nested transactions (with `Flags::ALLOW_NESTING`) share the outer
//! overlay: an inner commit merely unwinds the nesting count, and an inner
//! cancel poisons the whole transaction — the outer commit then fails and
//! cancels.  That propagation is deliberate, documented behaviour.

use crate::attr::LockKind;
use crate::db::Tdb;
use crate::error::{Error, LogLevel, Result};
use crate::flags::Flags;
use crate::layout::hoff;
use crate::lock::Wait;
use crate::record::{RecoveryRec, RECOVERY_HDR_SIZE, RECOVERY_INVALID_MAGIC, RECOVERY_MAGIC};

/// Overlay page size.
pub(crate) const PAGE_SIZE: u64 = 1024;

/// A live transaction's overlay state.
pub(crate) struct Transaction {
    /// One slot per page of the virtual file; `None` = untouched.
    blocks: Vec<Option<Box<[u8]>>>,
    /// File size when the transaction began.
    old_size: u64,
    /// Virtual size, grown by in-transaction expansion.
    virt_size: u64,
    /// Nested `transaction_start` depth.
    nesting: u32,
    /// An inner cancel happened; commit must fail.
    pub poisoned: bool,
    /// Recovery record installed by prepare: (offset, total length).
    prepared: Option<(u64, u64)>,
}

impl Transaction {
    fn new(size: u64) -> Transaction {
        Transaction {
            blocks: Vec::new(),
            old_size: size,
            virt_size: size,
            nesting: 0,
            poisoned: false,
            prepared: None,
        }
    }

    pub fn size(&self) -> u64 {
        self.virt_size
    }

    pub fn grow(&mut self, add: u64) {
        self.virt_size += add;
    }

    /// Read through the overlay, falling back to the file below the
    /// starting size and zeroes beyond it.
    pub fn read(&self, file: &crate::io::TdbFile, off: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len() as u64;
        if off.checked_add(len).map_or(true, |end| end > self.virt_size) {
            return Err(Error::Io);
        }
        let mut pos = off;
        let mut done = 0usize;
        while done < buf.len() {
            let page = (pos / PAGE_SIZE) as usize;
            let in_page = (pos % PAGE_SIZE) as usize;
            let take = (PAGE_SIZE as usize - in_page).min(buf.len() - done);
            let dst = &mut buf[done..done + take];
            match self.blocks.get(page).and_then(|b| b.as_ref()) {
                Some(block) => dst.copy_from_slice(&block[in_page..in_page + take]),
                None => {
                    if pos >= self.old_size {
                        dst.fill(0);
                    } else {
                        let avail = ((self.old_size - pos) as usize).min(take);
                        file.read(pos, &mut dst[..avail])?;
                        dst[avail..].fill(0);
                    }
                }
            }
            pos += take as u64;
            done += take;
        }
        Ok(())
    }

    /// Write through the overlay, faulting each touched page's original
    /// bytes in first.
    pub fn write(&mut self, file: &crate::io::TdbFile, off: u64, data: &[u8]) -> Result<()> {
        let len = data.len() as u64;
        if off.checked_add(len).map_or(true, |end| end > self.virt_size) {
            return Err(Error::Io);
        }
        let mut pos = off;
        let mut done = 0usize;
        while done < data.len() {
            let page = (pos / PAGE_SIZE) as usize;
            let in_page = (pos % PAGE_SIZE) as usize;
            let take = (PAGE_SIZE as usize - in_page).min(data.len() - done);
            self.fault_in(file, page)?;
            let block = self.blocks[page].as_mut().expect("just faulted in");
            block[in_page..in_page + take].copy_from_slice(&data[done..done + take]);
            pos += take as u64;
            done += take;
        }
        Ok(())
    }

    fn fault_in(&mut self, file: &crate::io::TdbFile, page: usize) -> Result<()> {
        if self.blocks.len() <= page {
            self.blocks.resize_with(page + 1, || None);
        }
        if self.blocks[page].is_none() {
            let mut block = vec![0u8; PAGE_SIZE as usize].into_boxed_slice();
            let start = page as u64 * PAGE_SIZE;
            if start < self.old_size {
                let avail = ((self.old_size - start).min(PAGE_SIZE)) as usize;
                file.read(start, &mut block[..avail])?;
            }
            self.blocks[page] = Some(block);
        }
        Ok(())
    }

    /// Touched pages intersecting the pre-transaction file, as
    /// `(offset, length)` runs for before-imaging.
    fn changed_runs(&self) -> Vec<(u64, u64)> {
        let mut runs = Vec::new();
        for (i, b) in self.blocks.iter().enumerate() {
            if b.is_none() {
                continue;
            }
            let start = i as u64 * PAGE_SIZE;
            if start >= self.old_size {
                continue;
            }
            let len = (self.old_size - start).min(PAGE_SIZE);
            runs.push((start, len));
        }
        runs
    }
}

impl Tdb {
    fn recovery_head(&self) -> Result<u64> {
        match &self.v1 {
            Some(_) => Ok(self.file_read_u32_direct(crate::tdb1::layout::OFF_RECOVERY)? as u64),
            None => self.file_read_off_direct(hoff::RECOVERY),
        }
    }

    fn set_recovery_head(&mut self, off: u64) -> Result<()> {
        match &self.v1 {
            Some(_) => self.file_write_u32_direct(crate::tdb1::layout::OFF_RECOVERY, off as u32),
            None => {
                self.header.recovery = off;
                self.file_write_off_direct(hoff::RECOVERY, off)
            }
        }
    }

    // Direct-file accessors that bypass the overlay (recovery plumbing
    // must reach the disk while the overlay is still pending).
    pub(crate) fn file_read_off_direct(&self, off: u64) -> Result<u64> {
        self.file.read_off(off)
    }

    pub(crate) fn file_write_off_direct(&mut self, off: u64, v: u64) -> Result<()> {
        self.file.write_off(off, v)
    }

    pub(crate) fn file_read_u32_direct(&self, off: u64) -> Result<u32> {
        self.file.read_u32(off)
    }

    pub(crate) fn file_write_u32_direct(&mut self, off: u64, v: u32) -> Result<()> {
        self.file.write_u32(off, v)
    }

    /// Begin a transaction.  Fails with `Nesting` inside another
    /// transaction unless `Flags::ALLOW_NESTING` is set, and with `Lock`
    /// under the allrecord lock.
    pub fn transaction_start(&mut self) -> Result<()> {
        if self.read_only {
            return Err(Error::Rdonly);
        }
        if let Some(tx) = &mut self.transaction {
            if self.flags.contains(Flags::ALLOW_NESTING) {
                tx.nesting += 1;
                return Ok(());
            }
            self.log(
                LogLevel::Error,
                Error::Nesting,
                "transaction_start: already inside a transaction",
            );
            return Err(Error::Nesting);
        }
        if self.allrecord.is_some() {
            self.log(
                LogLevel::Error,
                Error::Lock,
                "transaction_start: allrecord lock already held",
            );
            return Err(Error::Lock);
        }
        self.lock_transaction(Wait::Block)?;
        if let Err(e) = self.allrecord_lock(LockKind::Read, Wait::Block, true) {
            let _ = self.unlock_transaction();
            return Err(e);
        }
        self.header_uptodate = false;
        if let Err(e) = self.update_header() {
            let _ = self.allrecord_unlock();
            let _ = self.unlock_transaction();
            return Err(e);
        }
        let _ = self.refresh_file_size();
        self.transaction = Some(Box::new(Transaction::new(self.file.size())));
        Ok(())
    }

    /// Discard the transaction.  An inner cancel (under nesting) poisons
    /// the outer transaction: its commit will fail and cancel too.
    pub fn transaction_cancel(&mut self) -> Result<()> {
        let tx = match &mut self.transaction {
            Some(tx) => tx,
            None => {
                self.log(
                    LogLevel::Error,
                    Error::Einval,
                    "transaction_cancel: no transaction",
                );
                return Err(Error::Einval);
            }
        };
        if tx.nesting > 0 {
            tx.nesting -= 1;
            tx.poisoned = true;
            return Ok(());
        }
        self.bump(|s| s.transaction_cancels += 1);
        let tx = self.transaction.take().expect("checked above");
        // A cancel after prepare must retire the installed recovery
        // record, or the next prepare would orphan it.  Nothing past the
        // starting size was ever live, so shrinking back clears it all.
        if let Some((_, total)) = tx.prepared {
            if total != 0 {
                let _ = self.set_recovery_head(0);
            }
        }
        if self.file.size() > tx.old_size {
            let _ = self.file.truncate(tx.old_size);
            let _ = self.file.sync();
        }
        self.header_uptodate = false;
        let r1 = self.allrecord_unlock();
        let r2 = self.unlock_transaction();
        r1.and(r2)
    }

    /// Make the transaction durable-on-crash without applying it yet:
    /// after this returns, either the commit completes or the next opener
    /// rolls the file back to the pre-transaction state.
    pub fn transaction_prepare_commit(&mut self) -> Result<()> {
        let tx = match &self.transaction {
            Some(tx) => tx,
            None => return Err(Error::Einval),
        };
        if tx.nesting > 0 {
            return Err(Error::Nesting);
        }
        if tx.poisoned {
            let _ = self.transaction_cancel();
            return Err(Error::Nesting);
        }
        if tx.prepared.is_some() {
            return Err(Error::Einval);
        }
        self.allrecord_upgrade(Wait::Block)?;

        let (runs, old_size, virt_size) = {
            let tx = self.transaction.as_ref().unwrap();
            (tx.changed_runs(), tx.old_size, tx.virt_size)
        };
        if runs.is_empty() && virt_size == old_size {
            // Nothing touches pre-existing bytes; commit needs no journal.
            self.transaction.as_mut().unwrap().prepared = Some((0, 0));
            return Ok(());
        }

        // Serialize before-images, reading the *file*, not the overlay.
        let max_len: u64 = runs.iter().map(|(_, l)| 16 + l).sum();
        let rec = RecoveryRec {
            magic: RECOVERY_MAGIC,
            max_len,
            len: max_len,
            eof: old_size,
        };
        let mut image = Vec::with_capacity((RECOVERY_HDR_SIZE + max_len) as usize);
        image.extend_from_slice(&self.file.conv64(rec.magic).to_le_bytes());
        image.extend_from_slice(&self.file.conv64(rec.max_len).to_le_bytes());
        image.extend_from_slice(&self.file.conv64(rec.len).to_le_bytes());
        image.extend_from_slice(&self.file.conv64(rec.eof).to_le_bytes());
        for &(off, len) in &runs {
            image.extend_from_slice(&self.file.conv64(off).to_le_bytes());
            image.extend_from_slice(&self.file.conv64(len).to_le_bytes());
            let before = self.file.read_vec(off, len)?;
            image.extend_from_slice(&before);
        }

        // The recovery record lives past everything the commit will touch.
        let rec_off = virt_size.max(self.file.size());
        let need_total = rec_off + RECOVERY_HDR_SIZE + max_len;
        if need_total > self.file.size() {
            self.file.expand_file(need_total - self.file.size())?;
        }
        self.file.write(rec_off, &image)?;
        self.file.sync()?;
        self.set_recovery_head(rec_off)?;
        self.file.sync()?;
        self.transaction.as_mut().unwrap().prepared = Some((rec_off, RECOVERY_HDR_SIZE + max_len));
        Ok(())
    }

    /// Apply and finish the transaction.
    pub fn transaction_commit(&mut self) -> Result<()> {
        match &mut self.transaction {
            Some(tx) if tx.nesting > 0 => {
                tx.nesting -= 1;
                return if tx.poisoned { Err(Error::Nesting) } else { Ok(()) };
            }
            Some(_) => {}
            None => return Err(Error::Einval),
        }
        if self.transaction.as_ref().unwrap().prepared.is_none() {
            self.transaction_prepare_commit()?;
        }
        let tx = self.transaction.take().expect("checked above");
        let (rec_off, rec_total) = tx.prepared.expect("prepared above");

        // Apply overlay pages to the file.
        if tx.virt_size > self.file.size() {
            let add = tx.virt_size - self.file.size();
            self.file.expand_file(add)?;
        }
        for (i, block) in tx.blocks.iter().enumerate() {
            let block = match block {
                Some(b) => b,
                None => continue,
            };
            let start = i as u64 * PAGE_SIZE;
            if start >= tx.virt_size {
                break;
            }
            let len = (tx.virt_size - start).min(PAGE_SIZE) as usize;
            self.file.write(start, &block[..len])?;
        }
        self.file.sync()?;

        // Retire the recovery record, then give its space back.
        if rec_total != 0 {
            self.file.write_off(rec_off, RECOVERY_INVALID_MAGIC)?;
            self.set_recovery_head(0)?;
            self.file.sync()?;
        }
        self.header_uptodate = false;
        self.bump(|s| s.transactions += 1);
        let unlock1 = self.allrecord_unlock();
        let unlock2 = self.unlock_transaction();
        if rec_total != 0 {
            if self.v1.is_none() {
                // Reclaim under no transaction: these writes go straight down.
                self.update_header()?;
                self.add_free_record(rec_off, rec_total)?;
            } else {
                // The v1 area sits at EOF; shrinking the file releases it.
                self.file.truncate(rec_off)?;
            }
        }
        unlock1.and(unlock2)
    }

    /// Replay an interrupted commit.  Runs in the first opener, under the
    /// open lock, before the handle is live; `self.transaction` is None so
    /// all I/O is direct.
    pub(crate) fn transaction_recover(&mut self) -> Result<()> {
        let rec_off = self.recovery_head()?;
        if rec_off == 0 {
            return Ok(());
        }
        let magic = self.file_read_off_direct(rec_off)?;
        if magic != RECOVERY_MAGIC {
            // A finished commit died before reclaiming the area; just
            // drop the pointer.
            self.log(
                LogLevel::Warning,
                Error::Corrupt,
                &format!("recover: stale recovery pointer to {rec_off}"),
            );
            return self.set_recovery_head(0);
        }
        let max_len = self.file_read_off_direct(rec_off + 8)?;
        let len = self.file_read_off_direct(rec_off + 16)?;
        let eof = self.file_read_off_direct(rec_off + 24)?;
        if len > max_len || rec_off + RECOVERY_HDR_SIZE + len > self.file.size() {
            self.log(LogLevel::Fatal, Error::Corrupt, "recover: recovery record truncated");
            return Err(Error::Corrupt);
        }
        let mut pos = rec_off + RECOVERY_HDR_SIZE;
        let end = pos + len;
        let mut replayed = 0u64;
        while pos < end {
            let off = self.file_read_off_direct(pos)?;
            let run = self.file_read_off_direct(pos + 8)?;
            if run == 0 || pos + 16 + run > end || off + run > eof {
                self.log(LogLevel::Fatal, Error::Corrupt, "recover: bad before-image run");
                return Err(Error::Corrupt);
            }
            let bytes = self.file.read_vec(pos + 16, run)?;
            self.file.write(off, &bytes)?;
            pos += 16 + run;
            replayed += 1;
        }
        self.file.sync()?;
        self.file.truncate(eof)?;
        self.set_recovery_head(0)?;
        self.file.sync()?;
        self.log(
            LogLevel::Warning,
            Error::Io,
            &format!("recover: replayed {replayed} runs, file restored to {eof} bytes"),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::TdbFile;

    #[test]
    fn overlay_read_write_and_growth() {
        let file = TdbFile::new_mem(vec![7u8; 2048], false);
        let mut tx = Transaction::new(2048);
        // Untouched reads come from the file.
        let mut buf = [0u8; 16];
        tx.read(&file, 100, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 16]);
        // Writes land in the overlay, spanning pages.
        tx.write(&file, 1020, &[9u8; 8]).unwrap();
        tx.read(&file, 1018, &mut buf).unwrap();
        assert_eq!(&buf[..2], &[7, 7]);
        assert_eq!(&buf[2..10], &[9u8; 8]);
        assert_eq!(&buf[10..], &[7u8; 6]);
        // The file itself is untouched.
        assert_eq!(file.read_vec(1020, 8).unwrap(), vec![7u8; 8]);
        // Growth reads back zeroes until written.
        tx.grow(4096);
        assert_eq!(tx.size(), 2048 + 4096);
        tx.read(&file, 4000, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
        tx.write(&file, 4000, &[1u8; 16]).unwrap();
        tx.read(&file, 4000, &mut buf).unwrap();
        assert_eq!(buf, [1u8; 16]);
        // Out of bounds still refused.
        assert!(tx.read(&file, tx.size(), &mut buf).is_err());
    }

    #[test]
    fn changed_runs_clip_to_old_size() {
        let file = TdbFile::new_mem(vec![0u8; 1500], false);
        let mut tx = Transaction::new(1500);
        tx.grow(4096);
        tx.write(&file, 0, &[1]).unwrap(); // page 0: fully inside
        tx.write(&file, 1400, &[1]).unwrap(); // page 1: straddles old EOF
        tx.write(&file, 3000, &[1]).unwrap(); // page 2: fully beyond
        let runs = tx.changed_runs();
        assert_eq!(runs, vec![(0, 1024), (1024, 476)]);
    }
}
