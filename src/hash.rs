//! Deterministic state hashing.
//!
//! Peers exchange digests of their deepest trailing state to detect
//! divergence. `std`'s default hasher is randomly seeded per process, which
//! would make every comparison a false mismatch; [`StateHasher`] is FNV-1a
//! with a fixed seed, so identical state bytes produce identical digests on
//! every peer, platform and run.
//!
//! The digest is 32 bits and order-sensitive: components feed their raw state
//! bytes in a stable order (entity insertion order, field order). FNV-1a is
//! not cryptographically secure, which is fine; this is divergence
//! detection, not tamper-proofing.

use std::hash::Hasher;

/// FNV-1a 32-bit offset basis (the fixed seed shared by all peers).
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a 32-bit prime.
const FNV_PRIME: u32 = 0x0100_0193;

/// An order-sensitive, deterministic 32-bit digest over state bytes.
#[derive(Debug, Clone)]
pub struct StateHasher {
    state: u32,
}

impl StateHasher {
    /// Creates a hasher seeded with the FNV-1a offset basis.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: FNV_OFFSET_BASIS,
        }
    }

    /// Mixes a byte sequence into the digest.
    #[inline]
    pub fn mix(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u32::from(byte);
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }

    /// Mixes a little-endian `i64` (the raw form of [`Fixed`](crate::Fixed)
    /// values, frame numbers and entity ids).
    #[inline]
    pub fn mix_i64(&mut self, value: i64) {
        self.mix(&value.to_le_bytes());
    }

    /// Mixes a little-endian `i32`.
    #[inline]
    pub fn mix_i32(&mut self, value: i32) {
        self.mix(&value.to_le_bytes());
    }

    /// Mixes a single byte.
    #[inline]
    pub fn mix_u8(&mut self, value: u8) {
        self.mix(&[value]);
    }

    /// The current 32-bit digest.
    #[inline]
    #[must_use]
    pub const fn digest(&self) -> u32 {
        self.state
    }
}

impl Default for StateHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for StateHasher {
    /// Zero-extends the 32-bit digest; present so `#[derive(Hash)]` types can
    /// feed a `StateHasher` directly.
    #[inline]
    fn finish(&self) -> u64 {
        u64::from(self.state)
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        self.mix(bytes);
    }
}

/// Convenience: digest a single byte sequence.
#[inline]
#[must_use]
pub fn digest_bytes(bytes: &[u8]) -> u32 {
    let mut hasher = StateHasher::new();
    hasher.mix(bytes);
    hasher.digest()
}

// #########
// # TESTS #
// #########


// =============================================================================
// Property-Based Tests
// =============================================================================
