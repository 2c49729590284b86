//! Human-readable database statistics.
//!
//! A single linear walk of the data area classifies every record by its
//! header tag; no hash descent is needed because each record is
//! self-describing.  Aggregation uses a tiny min/avg/max tally.

use crate::attr::LockKind;
use crate::db::Tdb;
use crate::error::{Error, Result};
use crate::layout::{Magic, DATA_START};
use crate::lock::Wait;
use crate::record::{FreeRec, RECOVERY_HDR_SIZE, REC_HDR_SIZE};

#[derive(Default)]
struct Tally {
    count: u64,
    sum: u64,
    min: u64,
    max: u64,
}

impl Tally {
    fn add(&mut self, v: u64) {
        if self.count == 0 || v < self.min {
            self.min = v;
        }
        if v > self.max {
            self.max = v;
        }
        self.count += 1;
        self.sum += v;
    }

    fn avg(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.sum / self.count
        }
    }

    /// "min/avg/max" rendering.
    fn range(&self) -> String {
        format!("{}/{}/{}", self.min, self.avg(), self.max)
    }
}

fn pct(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

impl Tdb {
    /// Render statistics: record count, size tallies, free-space shape,
    /// table counts and space distribution.
    pub fn summary(&mut self) -> Result<String> {
        if self.v1.is_some() {
            return crate::tdb1::summary(self);
        }
        self.allrecord_lock(LockKind::Read, Wait::Block, false)?;
        self.header_uptodate = false;
        let res = self.summary_locked();
        self.allrecord_unlock()?;
        res
    }

    fn summary_locked(&mut self) -> Result<String> {
        self.update_header()?;
        let size = self.db_size();
        let mut keys = Tally::default();
        let mut data = Tally::default();
        let mut extra = Tally::default();
        let mut free = Tally::default();
        let mut uncoalesced = 0u64;
        let mut subtables = 0u64;
        let mut chain_pages = 0u64;
        let mut ftables = 0u64;
        let mut caps = 0u64;
        let mut recovery_bytes = 0u64;
        let mut table_bytes = 0u64;
        let mut prev_free = false;

        let mut cur = DATA_START;
        while cur < size {
            let w0 = self.db_read_off(cur)?;
            let magic = Magic::from_bits(w0 >> 59).ok_or(Error::Corrupt)?;
            let total;
            let mut is_free = false;
            match magic {
                Magic::Free => {
                    let w1 = self.db_read_off(cur + 8)?;
                    let f = FreeRec::decode(w0, w1, 0)?;
                    free.add(f.len);
                    total = f.total_len();
                    is_free = true;
                    if prev_free {
                        uncoalesced += 1;
                    }
                }
                Magic::Recovery | Magic::RecoveryInvalid => {
                    let max_len = self.db_read_off(cur + 8)?;
                    total = RECOVERY_HDR_SIZE + max_len;
                    recovery_bytes += total;
                }
                _ => {
                    let rec = self.read_used(cur)?;
                    total = rec.total_len();
                    match magic {
                        Magic::Used => {
                            keys.add(rec.key_length());
                            data.add(rec.data_length());
                            extra.add(rec.extra_padding());
                        }
                        Magic::HashTable => {
                            subtables += 1;
                            table_bytes += total;
                        }
                        Magic::Chain => {
                            chain_pages += 1;
                            table_bytes += total;
                        }
                        Magic::FreeTable => {
                            ftables += 1;
                            table_bytes += total;
                        }
                        Magic::Capability => caps += 1,
                        _ => unreachable!("free and recovery handled above"),
                    }
                }
            }
            if total == 0 || cur + total > size {
                return Err(Error::Corrupt);
            }
            prev_free = is_free;
            cur += total;
        }

        let root_entries = self.db_read_offs(self.header.hash_off, 1 << self.header.hash_bits)?;
        let occupied = root_entries.iter().filter(|&&e| e != 0).count();

        let header_bytes = DATA_START;
        let key_bytes = keys.sum;
        let data_bytes = data.sum;
        let extra_bytes = extra.sum;
        let free_bytes = free.sum + free.count * REC_HDR_SIZE;
        let rechdr_bytes = keys.count * REC_HDR_SIZE;

        let mut out = String::new();
        use std::fmt::Write;
        let _ = writeln!(out, "Size of file/data: {}/{}", size, key_bytes + data_bytes);
        let _ = writeln!(out, "Number of records: {}", keys.count);
        let _ = writeln!(out, "Smallest/average/largest keys: {}", keys.range());
        let _ = writeln!(out, "Smallest/average/largest data: {}", data.range());
        let _ = writeln!(out, "Smallest/average/largest padding: {}", extra.range());
        let _ = writeln!(out, "Number of free records: {}", free.count);
        let _ = writeln!(out, "Smallest/average/largest free records: {}", free.range());
        let _ = writeln!(out, "Number of uncoalesced records: {}", uncoalesced);
        let _ = writeln!(out, "Number of hash sub-tables: {}", subtables);
        let _ = writeln!(out, "Number of chain pages: {}", chain_pages);
        let _ = writeln!(out, "Number of free tables: {}", ftables);
        if caps != 0 {
            let _ = writeln!(out, "Number of capabilities: {}", caps);
        }
        let _ = writeln!(
            out,
            "Toplevel hash used: {}/{} buckets",
            occupied,
            root_entries.len()
        );
        if self.header.seqnum != 0 {
            let _ = writeln!(out, "Sequence number: {}", self.header.seqnum);
        }
        let _ = writeln!(
            out,
            "Percentage keys/data/padding/free/rechdrs/tables/header/recovery: \
             {:.0}/{:.0}/{:.0}/{:.0}/{:.0}/{:.0}/{:.0}/{:.0}",
            pct(key_bytes, size),
            pct(data_bytes, size),
            pct(extra_bytes, size),
            pct(free_bytes, size),
            pct(rechdr_bytes, size),
            pct(table_bytes, size),
            pct(header_bytes, size),
            pct(recovery_bytes, size),
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_ranges() {
        let mut t = Tally::default();
        assert_eq!(t.range(), "0/0/0");
        t.add(4);
        t.add(10);
        t.add(1);
        assert_eq!(t.min, 1);
        assert_eq!(t.max, 10);
        assert_eq!(t.avg(), 5);
        assert_eq!(t.range(), "1/5/10");
    }

    #[test]
    fn percentages() {
        assert_eq!(pct(50, 200), 25.0);
        assert_eq!(pct(1, 0), 0.0);
    }
}
