//! Datagram obfuscation.
//!
//! Every datagram body is XORed with a ChaCha20 keystream derived from a
//! key and IV **compiled into the binary**. This is obfuscation, not
//! confidentiality: it keeps casual packet inspection and naive tampering
//! out, nothing more. Anyone with the binary has the key. Do not mistake
//! this layer for security.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;

/// Compiled-in keystream key (not a secret).
const KEY: [u8; 32] = [
    0x6b, 0x1f, 0xc9, 0x4a, 0x0d, 0x83, 0x5e, 0x27, //
    0xb4, 0x91, 0x3c, 0xe8, 0x72, 0x5a, 0x0f, 0xd6, //
    0x38, 0xa1, 0x94, 0x4c, 0xee, 0x07, 0x61, 0xb9, //
    0x2d, 0xf0, 0x85, 0x13, 0xc7, 0x6e, 0x58, 0x9a,
];

/// Compiled-in keystream IV (not a secret).
const IV: [u8; 12] = [
    0x51, 0x3d, 0xaa, 0x0b, 0x87, 0x24, 0xf1, 0x6c, //
    0x19, 0xe5, 0x70, 0x2e,
];

/// Applies the fixed keystream in place. The operation is its own inverse:
/// masking twice restores the original bytes.
pub fn mask(buf: &mut [u8]) {
    let mut cipher = ChaCha20::new(&KEY.into(), &IV.into());
    cipher.apply_keystream(buf);
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn mask_is_involutive() {
        let original = b"trailing state sync".to_vec();
        let mut buf = original.clone();
        mask(&mut buf);
        assert_ne!(buf, original);
        mask(&mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn mask_is_deterministic() {
        let mut a = vec![1, 2, 3, 4, 5];
        let mut b = a.clone();
        mask(&mut a);
        mask(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_buffer_is_fine() {
        let mut buf: Vec<u8> = Vec::new();
        mask(&mut buf);
        assert!(buf.is_empty());
    }

    #[test]
    fn keystream_restarts_per_datagram() {
        // two equal datagrams produce equal ciphertexts (fixed IV)
        let mut a = vec![0u8; 16];
        let mut b = vec![0u8; 16];
        mask(&mut a);
        mask(&mut b);
        assert_eq!(a, b);
    }
}
