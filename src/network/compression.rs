//! Datagram payload compression.
//!
//! Payloads at or above [`COMPRESSION_THRESHOLD`] bytes are GZIP-compressed,
//! and the compressed form is used only when it is strictly smaller than the
//! plaintext; small or incompressible payloads go out as-is. The framing
//! layer records the choice in the high bit of the length word.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::DecodeError;

/// Minimum plaintext size worth attempting to compress.
pub const COMPRESSION_THRESHOLD: usize = 200;

/// Compresses `plain` when profitable.
///
/// Returns the bytes to transmit and whether they are compressed.
#[must_use]
pub fn maybe_compress(plain: &[u8]) -> (Vec<u8>, bool) {
    if plain.len() < COMPRESSION_THRESHOLD {
        return (plain.to_vec(), false);
    }
    let mut encoder = GzEncoder::new(Vec::with_capacity(plain.len() / 2), Compression::default());
    if encoder.write_all(plain).is_err() {
        return (plain.to_vec(), false);
    }
    let compressed = encoder.finish().unwrap_or_default();
    if !compressed.is_empty() && compressed.len() < plain.len() {
        (compressed, true)
    } else {
        (plain.to_vec(), false)
    }
}

/// Inflates a payload whose compressed flag was set.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = GzDecoder::new(data);
    let mut plain = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut plain)
        .map_err(|_| DecodeError::BadCompression)?;
    Ok(plain)
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn short_payloads_stay_plain() {
        let data = vec![7u8; COMPRESSION_THRESHOLD - 1];
        let (out, compressed) = maybe_compress(&data);
        assert!(!compressed);
        assert_eq!(out, data);
    }

    #[test]
    fn repetitive_payloads_compress() {
        let data = vec![0u8; 4096];
        let (out, compressed) = maybe_compress(&data);
        assert!(compressed);
        assert!(out.len() < data.len());
        assert_eq!(decompress(&out).unwrap(), data);
    }

    #[test]
    fn incompressible_payloads_stay_plain() {
        // pseudo-random bytes do not shrink under gzip
        let mut data = Vec::with_capacity(1024);
        let mut state = 0x12345678u32;
        for _ in 0..1024 {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            data.push((state >> 24) as u8);
        }
        let (out, compressed) = maybe_compress(&data);
        if compressed {
            assert!(out.len() < data.len());
        } else {
            assert_eq!(out, data);
        }
    }

    #[test]
    fn garbage_does_not_inflate() {
        assert_eq!(
            decompress(&[0xDE, 0xAD, 0xBE, 0xEF]),
            Err(DecodeError::BadCompression)
        );
    }

    #[test]
    fn round_trip_at_threshold() {
        let data = vec![42u8; COMPRESSION_THRESHOLD];
        let (out, compressed) = maybe_compress(&data);
        assert!(compressed);
        assert_eq!(decompress(&out).unwrap(), data);
    }
}
