//! The seeded 64-bit hash the index is built on.
//!
//! The engine never assumes anything about the function beyond stability:
//! equal `(bytes, seed)` inputs must hash equally for the lifetime of the
//! file.  The default is xxh64.  A database records `hash(HASH_MAGIC_CHECK,
//! seed)` in its header at creation; every open re-derives that value, so a
//! handle with a different function (or a file from one) is refused before
//! any bucket is trusted.

use xxhash_rust::xxh64::xxh64;

/// Fed through the hash at creation to produce the header check value.
pub const HASH_MAGIC_CHECK: u64 = 0xA1AB_E11A_0109_2008;

/// Default hash: xxh64 with the database seed.
#[inline]
pub fn default_hash(key: &[u8], seed: u64) -> u64 {
    xxh64(key, seed)
}

/// The header check value for a given hash function and seed.
pub fn hash_test_value(hash: &dyn Fn(&[u8], u64) -> u64, seed: u64) -> u64 {
    hash(&HASH_MAGIC_CHECK.to_le_bytes(), seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_across_calls() {
        let a = default_hash(b"hello world", 42);
        let b = default_hash(b"hello world", 42);
        assert_eq!(a, b);
        assert_ne!(default_hash(b"hello world", 43), a);
        assert_ne!(default_hash(b"hello worle", 42), a);
    }

    #[test]
    fn check_value_depends_on_function_and_seed() {
        let xx: Box<dyn Fn(&[u8], u64) -> u64> = Box::new(default_hash);
        let other: Box<dyn Fn(&[u8], u64) -> u64> = Box::new(|k, s| {
            // A deliberately different function.
            k.iter().fold(s, |acc, &b| acc.wrapping_mul(131).wrapping_add(b as u64))
        });
        let seed = 0x1234_5678;
        assert_ne!(hash_test_value(&*xx, seed), hash_test_value(&*other, seed));
        assert_ne!(hash_test_value(&*xx, seed), hash_test_value(&*xx, seed + 1));
    }
}
