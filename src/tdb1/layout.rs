//! Version-1 on-disk layout: header fields, the bucket array, the 24-byte
//! record header and the classic string hash.
//!
//! v1 keeps a flat array of `hash_size + 1` 32-bit bucket heads right
//! after the 128-byte header; bucket 0 is the freelist, buckets 1..=N the
//! hash chains.  Records are singly linked through their `next` field and
//! carry their full 32-bit hash, so chain walks rarely touch key bytes.
//! Chain locks cover the chain-head words themselves.
//!
//! ```text
//! offset  size  field
//! 0       32    magic_food        "TDB file\n" NUL-padded
//! 32      4     version           0x26011967
//! 36      4     hash_size         bucket count (default 131)
//! 40      4     rwlocks           0
//! 44      4     recovery_start    offset of recovery record, 0 = none
//! 48      4     sequence_number
//! 52      4     magic1_hash       1 when hash_check is present
//! 56      8     hash_check        classic hash of the magic string
//! 64      64    reserved, zero
//! 128     4*(hash_size+1)  bucket heads (bucket 0 = freelist)
//! ...           records: {next, rec_len, key_len, data_len, full_hash,
//!                         magic} then key then data
//! ```

use crate::error::{Error, Result};

/// v1 magic string prefix.
pub const MAGIC_FOOD: &[u8] = b"TDB file\n";

/// v1 version stamp.
pub const VERSION_1: u32 = 0x26011967;

/// Default bucket count, overridable with `Attribute::Tdb1Hashsize`.
pub const DEFAULT_HASH_SIZE: u32 = 131;

/// Fixed v1 header size; the bucket array starts here.
pub const FREELIST_TOP: u64 = 128;

pub const OFF_VERSION: u64 = 32;
pub const OFF_HASH_SIZE: u64 = 36;
pub const OFF_RWLOCKS: u64 = 40;
pub const OFF_RECOVERY: u64 = 44;
pub const OFF_SEQNUM: u64 = 48;
pub const OFF_MAGIC1_HASH: u64 = 52;
pub const OFF_HASH_CHECK: u64 = 56;

/// Bytes in a v1 record header.
pub const REC_HDR: u64 = 24;

/// Live record.
pub const MAGIC_USED: u32 = 0x26011999;
/// Freelist record.
pub const MAGIC_FREE: u32 = 0x6fe5_3515;
/// Unlinked but not yet reclaimed (kept for traverse safety).
pub const MAGIC_DEAD: u32 = 0xFEE1_DEAD;

/// File offset of bucket `i` (0 = freelist, `1..=hash_size` = chains).
#[inline]
pub fn bucket_off(i: u32) -> u64 {
    FREELIST_TOP + 4 * i as u64
}

/// First byte past the bucket array.
#[inline]
pub fn records_start(hash_size: u32) -> u64 {
    FREELIST_TOP + 4 * (hash_size as u64 + 1)
}

/// The classic 0x9464a485-family string hash every v1 database uses.
pub fn v1_hash(key: &[u8]) -> u32 {
    let mut value = 0x238F_13AFu32.wrapping_mul(key.len() as u32);
    for (i, &b) in key.iter().enumerate() {
        value = value.wrapping_add((b as u32) << (i * 5 % 24));
    }
    1_103_515_243u32.wrapping_mul(value).wrapping_add(12345)
}

/// Check value stored at [`OFF_HASH_CHECK`].
pub fn hash_check_value() -> u64 {
    let mut food = [0u8; 32];
    food[..MAGIC_FOOD.len()].copy_from_slice(MAGIC_FOOD);
    v1_hash(&food) as u64
}

/// A decoded v1 record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V1Rec {
    pub next: u32,
    /// Capacity: key + data + slack bytes following the header.
    pub rec_len: u32,
    pub key_len: u32,
    pub data_len: u32,
    pub full_hash: u32,
    pub magic: u32,
}

impl V1Rec {
    pub fn decode(fields: &[u32; 6]) -> V1Rec {
        V1Rec {
            next: fields[0],
            rec_len: fields[1],
            key_len: fields[2],
            data_len: fields[3],
            full_hash: fields[4],
            magic: fields[5],
        }
    }

    pub fn encode(&self) -> [u32; 6] {
        [
            self.next,
            self.rec_len,
            self.key_len,
            self.data_len,
            self.full_hash,
            self.magic,
        ]
    }

    /// Total bytes the record occupies.
    #[inline]
    pub fn total_len(&self) -> u64 {
        REC_HDR + self.rec_len as u64
    }

    /// Sanity for any record: capacity holds the lengths, magic known.
    pub fn validate(&self) -> Result<()> {
        match self.magic {
            MAGIC_USED => {
                if (self.key_len as u64 + self.data_len as u64) > self.rec_len as u64 {
                    return Err(Error::Corrupt);
                }
            }
            MAGIC_FREE | MAGIC_DEAD => {}
            _ => return Err(Error::Corrupt),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_hash_spread() {
        // Known-stable values for the classic function.
        assert_eq!(v1_hash(b""), 12345);
        assert_ne!(v1_hash(b"a"), v1_hash(b"b"));
        assert_ne!(v1_hash(b"ab"), v1_hash(b"ba"));
        // Distribution over the default bucket count is non-degenerate.
        let mut buckets = vec![0u32; DEFAULT_HASH_SIZE as usize];
        for i in 0..1000u32 {
            let k = format!("key {i}");
            buckets[(v1_hash(k.as_bytes()) % DEFAULT_HASH_SIZE) as usize] += 1;
        }
        let used = buckets.iter().filter(|&&c| c > 0).count();
        assert!(used > DEFAULT_HASH_SIZE as usize / 2, "used {used}");
    }

    #[test]
    fn record_round_trip() {
        let r = V1Rec {
            next: 4096,
            rec_len: 100,
            key_len: 10,
            data_len: 80,
            full_hash: 0xdead_beef,
            magic: MAGIC_USED,
        };
        assert_eq!(V1Rec::decode(&r.encode()), r);
        assert_eq!(r.total_len(), 124);
        assert!(r.validate().is_ok());
        let bad = V1Rec {
            key_len: 200,
            ..r
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn geometry() {
        assert_eq!(bucket_off(0), 128);
        assert_eq!(bucket_off(1), 132);
        assert_eq!(records_start(131), 128 + 4 * 132);
    }
}
