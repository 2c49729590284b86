//! Version-2 on-disk layout: header geometry, magic tags and the advisory
//! lock address plan.
//!
//! Integer fields are little-endian on disk unless the database carries the
//! CONVERT feature, in which case every integer is byte-swapped on read and
//! write (`magic_food` is raw bytes and never converted).  The header is a
//! single 256-byte block followed immediately by the root hash table, so the
//! first record lands at [`DATA_START`].
//!
//! ```text
//! offset  size  field
//! 0       32    magic_food        "TDB file ver 2\n" NUL-padded
//! 32      8     version           VERSION
//! 40      8     hash_seed
//! 48      8     hash_test         hash(HASH_MAGIC_CHECK, seed)
//! 56      8     feature_bits
//! 64      8     recovery          offset of recovery record, 0 = none
//! 72      8     seqnum
//! 80      8     free_table        offset of first free table
//! 88      8     capabilities      offset of first capability record
//! 96      8     generation
//! 104     8     hash_off          root table offset (HEADER_SIZE)
//! 112     8     hash_bits         root table size exponent
//! 120     136   reserved, zero
//! 256     8192  root hash table   1 << TOPLEVEL_HASH_BITS entries
//! 8448    ...   records
//! ```

use crate::error::{Error, Result};

/// First 32 bytes of every v2 database.
pub const MAGIC_FOOD: &[u8; 32] = b"TDB file ver 2\n\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0";

/// Format version stamp.
pub const VERSION: u64 = 0x26011967 + 7;

/// Size of the fixed header, and therefore the root table offset.
pub const HEADER_SIZE: u64 = 256;

/// Root hash table size exponent.
pub const TOPLEVEL_HASH_BITS: u32 = 10;

/// Entries per hash group (both root and sublevel tables).
pub const HASH_GROUP_BITS: u32 = 3;

/// Sublevel table size exponent.
pub const SUBLEVEL_HASH_BITS: u32 = 6;

/// First byte past the root hash table; no record lives below this.
pub const DATA_START: u64 = HEADER_SIZE + 8 * (1 << TOPLEVEL_HASH_BITS);

/// Feature bits this implementation understands (none are defined yet;
/// any set bit in `feature_bits` fails the open).
pub const FEATURES_KNOWN: u64 = 0;

// ── Lock address plan ─────────────────────────────────────────────────────────
//
// fcntl lock offsets are plain byte addresses and need not be backed by
// file bytes, so the plan lives in its own address range.  The allrecord
// lock spans [HASH_LOCK_START, EOF-of-lock-space) and therefore covers the
// chain and free-bucket bytes, which is what lets it stand in for all of
// them at once.

/// Serializes first-opener initialization.
pub const OPEN_LOCK: u64 = 0;
/// Held shared by every opener for the lifetime of the handle.
pub const ACTIVE_LOCK: u64 = 4;
/// Held for the lifetime of a transaction.
pub const TRANSACTION_LOCK: u64 = 8;
/// Guards read-modify-write of the header sequence number.
pub const SEQNUM_LOCK: u64 = 12;
/// One byte per top-level hash group, ascending group order.
pub const HASH_LOCK_START: u64 = 64;
/// Number of chain-lock bytes.
pub const HASH_LOCK_COUNT: u64 = 1 << (TOPLEVEL_HASH_BITS - HASH_GROUP_BITS);
/// Free-bucket lock bytes start here; a bucket's byte is
/// `FREE_LOCK_START + bucket_offset / 8`, so every bucket of every free
/// table gets a distinct byte without a registry.
pub const FREE_LOCK_START: u64 = HASH_LOCK_START + HASH_LOCK_COUNT;

/// Record type tags, stored in the top 5 bits of a record's first word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Used = 1,
    Free = 2,
    HashTable = 3,
    FreeTable = 4,
    Recovery = 5,
    RecoveryInvalid = 6,
    Capability = 7,
    Chain = 8,
}

impl Magic {
    /// Decode the 5-bit tag; `None` for unassigned values.
    pub fn from_bits(bits: u64) -> Option<Magic> {
        match bits {
            1 => Some(Magic::Used),
            2 => Some(Magic::Free),
            3 => Some(Magic::HashTable),
            4 => Some(Magic::FreeTable),
            5 => Some(Magic::Recovery),
            6 => Some(Magic::RecoveryInvalid),
            7 => Some(Magic::Capability),
            8 => Some(Magic::Chain),
            _ => None,
        }
    }
}

/// In-memory copy of the fixed header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub version: u64,
    pub hash_seed: u64,
    pub hash_test: u64,
    pub feature_bits: u64,
    pub recovery: u64,
    pub seqnum: u64,
    pub free_table: u64,
    pub capabilities: u64,
    pub generation: u64,
    pub hash_off: u64,
    pub hash_bits: u64,
}

/// Byte offsets of individual header fields, for targeted updates.
pub mod hoff {
    pub const VERSION: u64 = 32;
    pub const HASH_SEED: u64 = 40;
    pub const HASH_TEST: u64 = 48;
    pub const FEATURE_BITS: u64 = 56;
    pub const RECOVERY: u64 = 64;
    pub const SEQNUM: u64 = 72;
    pub const FREE_TABLE: u64 = 80;
    pub const CAPABILITIES: u64 = 88;
    pub const GENERATION: u64 = 96;
    pub const HASH_OFF: u64 = 104;
    pub const HASH_BITS: u64 = 112;
}

#[inline]
fn get_u64(buf: &[u8], off: usize, convert: bool) -> u64 {
    let v = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
    if convert {
        v.swap_bytes()
    } else {
        v
    }
}

#[inline]
fn put_u64(buf: &mut [u8], off: usize, v: u64, convert: bool) {
    let v = if convert { v.swap_bytes() } else { v };
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

impl Header {
    /// Parse the fixed header from its first 256 bytes.  Checks the magic
    /// string only; version and hash checks are the opener's business.
    pub fn from_bytes(buf: &[u8], convert: bool) -> Result<Header> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(Error::Io);
        }
        if &buf[..32] != MAGIC_FOOD {
            return Err(Error::Io);
        }
        Ok(Header {
            version: get_u64(buf, hoff::VERSION as usize, convert),
            hash_seed: get_u64(buf, hoff::HASH_SEED as usize, convert),
            hash_test: get_u64(buf, hoff::HASH_TEST as usize, convert),
            feature_bits: get_u64(buf, hoff::FEATURE_BITS as usize, convert),
            recovery: get_u64(buf, hoff::RECOVERY as usize, convert),
            seqnum: get_u64(buf, hoff::SEQNUM as usize, convert),
            free_table: get_u64(buf, hoff::FREE_TABLE as usize, convert),
            capabilities: get_u64(buf, hoff::CAPABILITIES as usize, convert),
            generation: get_u64(buf, hoff::GENERATION as usize, convert),
            hash_off: get_u64(buf, hoff::HASH_OFF as usize, convert),
            hash_bits: get_u64(buf, hoff::HASH_BITS as usize, convert),
        })
    }

    /// Serialize into a 256-byte block.
    pub fn to_bytes(&self, convert: bool) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[..32].copy_from_slice(MAGIC_FOOD);
        put_u64(&mut buf, hoff::VERSION as usize, self.version, convert);
        put_u64(&mut buf, hoff::HASH_SEED as usize, self.hash_seed, convert);
        put_u64(&mut buf, hoff::HASH_TEST as usize, self.hash_test, convert);
        put_u64(&mut buf, hoff::FEATURE_BITS as usize, self.feature_bits, convert);
        put_u64(&mut buf, hoff::RECOVERY as usize, self.recovery, convert);
        put_u64(&mut buf, hoff::SEQNUM as usize, self.seqnum, convert);
        put_u64(&mut buf, hoff::FREE_TABLE as usize, self.free_table, convert);
        put_u64(&mut buf, hoff::CAPABILITIES as usize, self.capabilities, convert);
        put_u64(&mut buf, hoff::GENERATION as usize, self.generation, convert);
        put_u64(&mut buf, hoff::HASH_OFF as usize, self.hash_off, convert);
        put_u64(&mut buf, hoff::HASH_BITS as usize, self.hash_bits, convert);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Header {
        Header {
            version: VERSION,
            hash_seed: 0xdead_beef_0bad_cafe,
            hash_test: 42,
            feature_bits: 0,
            recovery: 0,
            seqnum: 9,
            free_table: DATA_START,
            capabilities: 0,
            generation: 3,
            hash_off: HEADER_SIZE,
            hash_bits: TOPLEVEL_HASH_BITS as u64,
        }
    }

    #[test]
    fn header_round_trip() {
        for convert in [false, true] {
            let h = sample();
            let buf = h.to_bytes(convert);
            let back = Header::from_bytes(&buf, convert).unwrap();
            assert_eq!(h, back);
        }
    }

    #[test]
    fn convert_actually_swaps() {
        let h = sample();
        let native = h.to_bytes(false);
        let swapped = h.to_bytes(true);
        assert_eq!(&native[..32], &swapped[..32]);
        let v_native = u64::from_le_bytes(native[32..40].try_into().unwrap());
        let v_swapped = u64::from_le_bytes(swapped[32..40].try_into().unwrap());
        assert_eq!(v_native, VERSION);
        assert_eq!(v_swapped, VERSION.swap_bytes());
    }

    #[test]
    fn bad_magic_rejected() {
        let mut buf = sample().to_bytes(false);
        buf[0] ^= 0xff;
        assert_eq!(Header::from_bytes(&buf, false), Err(Error::Io));
    }

    #[test]
    fn geometry() {
        assert_eq!(DATA_START, 256 + 8 * 1024);
        assert_eq!(HASH_LOCK_COUNT, 128);
        assert_eq!(FREE_LOCK_START, 192);
        // The plan's fixed bytes stay clear of the chain-lock array.
        assert!(SEQNUM_LOCK < HASH_LOCK_START);
    }
}
