//! FNV-1a hashing for operation type identifiers.
//!
//! Every protocol's numeric id is derived from its name at compile time, so the
//! id and the name stay paired 1:1 without a hand-maintained id table. Two
//! names that happen to hash to the same value are reported as a duplicate id
//! when the second protocol is registered.

/// FNV-1a offset basis (32-bit).
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a prime (32-bit).
const FNV_PRIME: u32 = 0x0100_0193;

/// Computes a 32-bit FNV-1a hash over raw bytes.
///
/// Usable in `const` context, which is how protocols derive their
/// `OpTypeId` constants.
///
/// # Examples
///
/// ```
/// use opflow_core::hash::fnv1a_hash;
///
/// assert_eq!(fnv1a_hash(b"hello"), 1_335_831_723);
/// assert_eq!(fnv1a_hash(b""), 2_166_136_261); // FNV offset basis
/// ```
#[must_use]
pub const fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// Convenience wrapper hashing a string's UTF-8 bytes.
#[must_use]
pub const fn fnv1a_hash_str(s: &str) -> u32 {
    fnv1a_hash(s.as_bytes())
}
