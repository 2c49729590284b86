//! Packed record headers and hash-entry encoding.
//!
//! Every record opens with a 16-byte header of two 64-bit words.  Word 0
//! carries the 5-bit magic tag in its top bits so a single aligned read
//! identifies any record.  For used-style records (used, hash-table,
//! free-table, chain, capability) the remaining bits pack the key-length
//! width, the tail padding and 11 cached hash bits; word 1 packs the key
//! and data lengths.  Free records reuse word 0's low bits for their
//! bucket-list `prev` pointer and carry `next` in a third word, plus a
//! trailer word at the end of the region pointing back at the header so a
//! later `free()` of the right-hand neighbour can find and merge them.

use crate::error::{Error, Result};
use crate::layout::Magic;

/// Bytes in the common two-word header.
pub const REC_HDR_SIZE: u64 = 16;

/// Free records additionally need a `next` word and a trailer word inside
/// their region, so no allocation may have a smaller payload.
pub const MIN_DATA_LEN: u64 = 16;

/// Largest value the 15-bit `extra_padding` field can carry.
pub const MAX_EXTRA: u64 = (1 << 15) - 1;

const MAGIC_SHIFT: u32 = 59;
const KEYBITS_SHIFT: u32 = 54;
const EXTRA_SHIFT: u32 = 39;
const HASH_SHIFT: u32 = 28;
const HASH_FIELD_BITS: u32 = 11;

/// A decoded used-style record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedRec {
    word0: u64,
    word1: u64,
}

impl UsedRec {
    /// Build a header.  `extra` is unused tail bytes; `hash` is the key's
    /// full 64-bit hash (the top 11 bits are cached); `magic` the record
    /// type.  Fails with `Einval` when a length cannot be represented.
    pub fn set_header(
        key_len: u64,
        data_len: u64,
        extra: u64,
        hash: u64,
        magic: Magic,
    ) -> Result<UsedRec> {
        // key_bits is stored halved; actual width is 2*key_bits, giving
        // key lengths up to 2^62 in principle (the file is the real bound).
        let fls = 64 - key_len.leading_zeros();
        let keybits = (fls + 1) / 2;
        if keybits > 31 || extra > MAX_EXTRA {
            return Err(Error::Einval);
        }
        let data_width = 64 - 2 * keybits;
        if data_width < 64 && data_len >> data_width != 0 {
            return Err(Error::Einval);
        }
        let word0 = (magic as u64) << MAGIC_SHIFT
            | (keybits as u64) << KEYBITS_SHIFT
            | extra << EXTRA_SHIFT
            | (hash >> (64 - HASH_FIELD_BITS)) << HASH_SHIFT;
        let word1 = data_len << (2 * keybits) | key_len;
        Ok(UsedRec { word0, word1 })
    }

    #[inline]
    pub fn from_words(word0: u64, word1: u64) -> UsedRec {
        UsedRec { word0, word1 }
    }

    #[inline]
    pub fn words(&self) -> (u64, u64) {
        (self.word0, self.word1)
    }

    /// The 5-bit record tag, or `None` for an unassigned value.
    #[inline]
    pub fn magic(&self) -> Option<Magic> {
        Magic::from_bits(self.word0 >> MAGIC_SHIFT)
    }

    #[inline]
    fn key_width(&self) -> u32 {
        2 * ((self.word0 >> KEYBITS_SHIFT) & 0x1f) as u32
    }

    #[inline]
    pub fn key_length(&self) -> u64 {
        self.word1 & mask(self.key_width())
    }

    #[inline]
    pub fn data_length(&self) -> u64 {
        if self.key_width() >= 64 {
            0
        } else {
            self.word1 >> self.key_width()
        }
    }

    #[inline]
    pub fn extra_padding(&self) -> u64 {
        (self.word0 >> EXTRA_SHIFT) & MAX_EXTRA
    }

    /// The cached top hash bits (11 of them, right-aligned).
    #[inline]
    pub fn hash_bits(&self) -> u64 {
        (self.word0 >> HASH_SHIFT) & mask(HASH_FIELD_BITS)
    }

    /// Quick reject: does a full hash agree with the cached bits?
    #[inline]
    pub fn matches_hash(&self, hash: u64) -> bool {
        self.hash_bits() == hash >> (64 - HASH_FIELD_BITS)
    }

    /// Total bytes this record occupies in the file.
    #[inline]
    pub fn total_len(&self) -> u64 {
        REC_HDR_SIZE + self.key_length() + self.data_length() + self.extra_padding()
    }
}

#[inline]
fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

// ── Free records ──────────────────────────────────────────────────────────────

/// Offsets must fit beside the 5-bit magic in word 0.
pub const MAX_OFFSET: u64 = (1 << 59) - 1;

const FTABLE_SHIFT: u32 = 58;
const FREE_LEN_MASK: u64 = (1 << 58) - 1;

/// A decoded free-record header.  `len` is the region length beyond the
/// 16-byte header prefix, so a freed used record keeps its total extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRec {
    pub prev: u64,
    pub next: u64,
    pub ftable: u32,
    pub len: u64,
}

impl FreeRec {
    pub fn encode(&self) -> Result<(u64, u64, u64)> {
        if self.prev > MAX_OFFSET || self.len > FREE_LEN_MASK || self.ftable >= 1 << 6 {
            return Err(Error::Einval);
        }
        let word0 = (Magic::Free as u64) << MAGIC_SHIFT | self.prev;
        let word1 = (self.ftable as u64) << FTABLE_SHIFT | self.len;
        Ok((word0, word1, self.next))
    }

    /// Decode; fails unless word 0 carries the FREE tag.
    pub fn decode(word0: u64, word1: u64, next: u64) -> Result<FreeRec> {
        if Magic::from_bits(word0 >> MAGIC_SHIFT) != Some(Magic::Free) {
            return Err(Error::Corrupt);
        }
        Ok(FreeRec {
            prev: word0 & MAX_OFFSET,
            next,
            ftable: (word1 >> FTABLE_SHIFT) as u32,
            len: word1 & FREE_LEN_MASK,
        })
    }

    /// Total bytes of the free region.
    #[inline]
    pub fn total_len(&self) -> u64 {
        REC_HDR_SIZE + self.len
    }
}

// ── Hash entries ──────────────────────────────────────────────────────────────

/// Low 56 bits of a hash entry are the record offset.
pub const ENTRY_OFF_MASK: u64 = (1 << 56) - 1;
const ENTRY_EXTRA_SHIFT: u32 = 56;
/// Seven hash bits are cached in the entry itself.
pub const ENTRY_EXTRA_BITS: u32 = 7;
const ENTRY_SUBHASH: u64 = 1 << 63;

/// Encode a table entry: record (or subtable) offset, the next
/// [`ENTRY_EXTRA_BITS`] of the key's hash after `used` consumed bits, and
/// whether the target is a sub-table (sublevel or chain).
#[inline]
pub fn encode_entry(off: u64, hash: u64, used: u32, subhash: bool) -> u64 {
    let extra = extra_bits(hash, used);
    let mut e = off & ENTRY_OFF_MASK | extra << ENTRY_EXTRA_SHIFT;
    if subhash {
        e |= ENTRY_SUBHASH;
    }
    e
}

/// The [`ENTRY_EXTRA_BITS`] hash bits that follow `used` consumed bits,
/// taken from the most significant end (zero-padded past bit 63).
#[inline]
pub fn extra_bits(hash: u64, used: u32) -> u64 {
    if used >= 64 {
        return 0;
    }
    let avail = 64 - used;
    let take = ENTRY_EXTRA_BITS.min(avail);
    let bits = (hash << used) >> (64 - take);
    bits << (ENTRY_EXTRA_BITS - take)
}

#[inline]
pub fn entry_off(entry: u64) -> u64 {
    entry & ENTRY_OFF_MASK
}

#[inline]
pub fn entry_extra(entry: u64) -> u64 {
    (entry >> ENTRY_EXTRA_SHIFT) & mask(ENTRY_EXTRA_BITS)
}

#[inline]
pub fn entry_is_subhash(entry: u64) -> bool {
    entry & ENTRY_SUBHASH != 0
}

// ── Recovery records ──────────────────────────────────────────────────────────

/// Word 0 of a live recovery record.
pub const RECOVERY_MAGIC: u64 = (Magic::Recovery as u64) << MAGIC_SHIFT | 0x0f53_bc0e;
/// Word 0 after a successful commit.
pub const RECOVERY_INVALID_MAGIC: u64 =
    (Magic::RecoveryInvalid as u64) << MAGIC_SHIFT | 0x0f53_bc0e;

/// Bytes in the recovery record header.
pub const RECOVERY_HDR_SIZE: u64 = 32;

/// Recovery record header: `{magic, max_len, len, eof}` then `len` bytes
/// of `(offset u64, length u64, bytes)` before-image runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryRec {
    pub magic: u64,
    /// Bytes reserved for before-images.
    pub max_len: u64,
    /// Bytes of before-images actually present.
    pub len: u64,
    /// File size when the transaction began; restored on replay.
    pub eof: u64,
}

impl RecoveryRec {
    #[inline]
    pub fn total_len(&self) -> u64 {
        RECOVERY_HDR_SIZE + self.max_len
    }
}

// ── Capability records ────────────────────────────────────────────────────────

/// The opener may ignore this capability when checking.
pub const CAP_NOCHECK: u64 = 1 << 62;
/// The opener must not write unless it understands this capability.
pub const CAP_NOWRITE: u64 = 1 << 61;
/// The opener must not proceed at all without understanding it.
pub const CAP_NOOPEN: u64 = 1 << 63;
/// Mask of the capability type proper, below the handling bits.
pub const CAP_TYPE_MASK: u64 = !(CAP_NOOPEN | CAP_NOCHECK | CAP_NOWRITE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_header_round_trip() {
        for (k, d, x) in [
            (0u64, 0u64, 0u64),
            (3, 0, 0),
            (3, 1000, 11),
            (128, 1 << 20, MAX_EXTRA),
            (1 << 20, 1 << 30, 7),
        ] {
            let h = 0x9e37_79b9_7f4a_7c15u64;
            let r = UsedRec::set_header(k, d, x, h, Magic::Used).unwrap();
            assert_eq!(r.magic(), Some(Magic::Used));
            assert_eq!(r.key_length(), k, "key for ({k},{d},{x})");
            assert_eq!(r.data_length(), d, "data for ({k},{d},{x})");
            assert_eq!(r.extra_padding(), x);
            assert!(r.matches_hash(h));
            assert!(!r.matches_hash(!h));
            assert_eq!(r.total_len(), REC_HDR_SIZE + k + d + x);
            let (w0, w1) = r.words();
            assert_eq!(UsedRec::from_words(w0, w1), r);
        }
    }

    #[test]
    fn oversize_extra_rejected() {
        assert_eq!(
            UsedRec::set_header(1, 1, MAX_EXTRA + 1, 0, Magic::Used),
            Err(Error::Einval)
        );
    }

    #[test]
    fn non_used_magics_carry_lengths() {
        let r = UsedRec::set_header(0, 512, 0, 0, Magic::HashTable).unwrap();
        assert_eq!(r.magic(), Some(Magic::HashTable));
        assert_eq!(r.data_length(), 512);
        let r = UsedRec::set_header(0, 1448, 24, 0, Magic::FreeTable).unwrap();
        assert_eq!(r.magic(), Some(Magic::FreeTable));
        assert_eq!(r.total_len(), REC_HDR_SIZE + 1448 + 24);
    }

    #[test]
    fn free_record_round_trip() {
        let f = FreeRec {
            prev: 8448,
            next: 0,
            ftable: 2,
            len: 4096,
        };
        let (w0, w1, w2) = f.encode().unwrap();
        assert_eq!(FreeRec::decode(w0, w1, w2).unwrap(), f);
        assert_eq!(f.total_len(), REC_HDR_SIZE + 4096);
        // A used word0 does not decode as free.
        let u = UsedRec::set_header(1, 1, 0, 0, Magic::Used).unwrap();
        assert_eq!(FreeRec::decode(u.words().0, w1, w2), Err(Error::Corrupt));
    }

    #[test]
    fn entry_encoding() {
        let hash = 0xfedc_ba98_7654_3210u64;
        let off = 0x12_3456;
        for used in [10u32, 16, 22, 58, 64] {
            let e = encode_entry(off, hash, used, false);
            assert_eq!(entry_off(e), off);
            assert_eq!(entry_extra(e), extra_bits(hash, used));
            assert!(!entry_is_subhash(e));
        }
        let e = encode_entry(off, hash, 10, true);
        assert!(entry_is_subhash(e));
        assert_eq!(entry_off(e), off);
    }

    #[test]
    fn extra_bits_track_msb_consumption() {
        let hash = u64::MAX;
        assert_eq!(extra_bits(hash, 0), mask(ENTRY_EXTRA_BITS));
        // Only 3 bits remain past 61 consumed; they land left-aligned.
        assert_eq!(extra_bits(hash, 61), 0b111_0000);
        assert_eq!(extra_bits(hash, 64), 0);
        assert_eq!(extra_bits(0, 0), 0);
    }

    #[test]
    fn recovery_magics_share_low_bits() {
        assert_ne!(RECOVERY_MAGIC, RECOVERY_INVALID_MAGIC);
        assert_eq!(
            RECOVERY_MAGIC & (1 << MAGIC_SHIFT) - 1,
            RECOVERY_INVALID_MAGIC & (1 << MAGIC_SHIFT) - 1
        );
        assert_eq!(Magic::from_bits(RECOVERY_MAGIC >> MAGIC_SHIFT), Some(Magic::Recovery));
        assert_eq!(
            Magic::from_bits(RECOVERY_INVALID_MAGIC >> MAGIC_SHIFT),
            Some(Magic::RecoveryInvalid)
        );
    }
}
