//! Wire message types and datagram framing.
//!
//! Every datagram on the wire is:
//!
//! ```text
//! magic ‖ length_with_compressed_bit:u32 LE ‖ ciphertext
//! ```
//!
//! The high bit of the length word flags a GZIP-compressed body; the
//! remaining 31 bits carry the ciphertext length, so a body can never
//! exceed 2^31 - 1 bytes. The ciphertext is the (optionally compressed)
//! plaintext under the fixed obfuscation keystream. Plaintext layout is a
//! one-byte message tag followed by the tag-specific body:
//!
//! | tag | body |
//! |-----|------|
//! | Ack     | `message_number: i32` |
//! | Acked   | `message_number: i32 ‖ inner packet` |
//! | Unacked | `inner packet` |
//! | Ping    | `tx_timestamp_ticks: i64` |
//! | Pong    | `echoed_tx_timestamp_ticks: i64` |

use crate::error::DecodeError;
use crate::network::compression;
use crate::network::crypto;
use crate::packet::Packet;

/// Default magic header bytes prepended to every datagram.
pub const DEFAULT_MAGIC: [u8; 4] = *b"TSS1";

/// High bit of the length word: body is compressed.
const COMPRESSED_BIT: u32 = 1 << 31;

/// Maximum ciphertext length (the compressed bit is reserved).
pub const MAX_BODY_LEN: u32 = COMPRESSED_BIT - 1;

const TAG_ACK: u8 = 0;
const TAG_ACKED: u8 = 1;
const TAG_UNACKED: u8 = 2;
const TAG_PING: u8 = 3;
const TAG_PONG: u8 = 4;

/// A decoded transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Confirms receipt of an acked message.
    Ack {
        /// Number of the message being confirmed.
        message_number: i32,
    },
    /// A payload the sender retransmits until confirmed.
    Acked {
        /// Monotonic per-channel message number.
        message_number: i32,
        /// The carried payload.
        payload: Packet,
    },
    /// A fire-and-forget payload.
    Unacked {
        /// The carried payload.
        payload: Packet,
    },
    /// RTT probe carrying the sender's transmit timestamp.
    Ping {
        /// Sender clock ticks (milliseconds) at transmission.
        timestamp: i64,
    },
    /// RTT probe reply echoing the probe's timestamp.
    Pong {
        /// The echoed transmit timestamp.
        timestamp: i64,
    },
}

impl WireMessage {
    fn encode_plaintext(&self) -> Packet {
        let mut plain = Packet::new();
        match self {
            WireMessage::Ack { message_number } => {
                plain.write_u8(TAG_ACK);
                plain.write_i32(*message_number);
            },
            WireMessage::Acked {
                message_number,
                payload,
            } => {
                plain.write_u8(TAG_ACKED);
                plain.write_i32(*message_number);
                plain.write_raw(payload.bytes());
            },
            WireMessage::Unacked { payload } => {
                plain.write_u8(TAG_UNACKED);
                plain.write_raw(payload.bytes());
            },
            WireMessage::Ping { timestamp } => {
                plain.write_u8(TAG_PING);
                plain.write_i64(*timestamp);
            },
            WireMessage::Pong { timestamp } => {
                plain.write_u8(TAG_PONG);
                plain.write_i64(*timestamp);
            },
        }
        plain
    }

    fn decode_plaintext(bytes: Vec<u8>) -> Result<Self, DecodeError> {
        let mut plain = Packet::from_bytes(bytes);
        let tag = plain.read_u8()?;
        match tag {
            TAG_ACK => Ok(WireMessage::Ack {
                message_number: plain.read_i32()?,
            }),
            TAG_ACKED => Ok(WireMessage::Acked {
                message_number: plain.read_i32()?,
                payload: Packet::from_bytes(plain.read_remaining()),
            }),
            TAG_UNACKED => Ok(WireMessage::Unacked {
                payload: Packet::from_bytes(plain.read_remaining()),
            }),
            TAG_PING => Ok(WireMessage::Ping {
                timestamp: plain.read_i64()?,
            }),
            TAG_PONG => Ok(WireMessage::Pong {
                timestamp: plain.read_i64()?,
            }),
            tag => Err(DecodeError::BadTag { tag }),
        }
    }

    /// Frames, optionally compresses and masks the message into a datagram.
    #[must_use]
    pub fn encode_datagram(&self, magic: &[u8]) -> Vec<u8> {
        let plain = self.encode_plaintext();
        let (mut body, compressed) = compression::maybe_compress(plain.bytes());
        crypto::mask(&mut body);

        let mut length_word = body.len() as u32;
        debug_assert!(length_word <= MAX_BODY_LEN);
        if compressed {
            length_word |= COMPRESSED_BIT;
        }

        let mut datagram = Vec::with_capacity(magic.len() + 4 + body.len());
        datagram.extend_from_slice(magic);
        datagram.extend_from_slice(&length_word.to_le_bytes());
        datagram.extend_from_slice(&body);
        datagram
    }

    /// Validates framing, unmasks, decompresses and parses a datagram.
    pub fn decode_datagram(datagram: &[u8], magic: &[u8]) -> Result<Self, DecodeError> {
        let header_len = magic.len() + 4;
        if datagram.len() < header_len {
            return Err(DecodeError::Truncated {
                needed: header_len,
                available: datagram.len(),
            });
        }
        if &datagram[..magic.len()] != magic {
            return Err(DecodeError::BadMagic);
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&datagram[magic.len()..header_len]);
        let length_word = u32::from_le_bytes(word);
        let compressed = length_word & COMPRESSED_BIT != 0;
        let body_len = length_word & MAX_BODY_LEN;

        let body = &datagram[header_len..];
        if body.len() != body_len as usize {
            return Err(DecodeError::Truncated {
                needed: body_len as usize,
                available: body.len(),
            });
        }

        let mut body = body.to_vec();
        crypto::mask(&mut body);
        let plain = if compressed {
            compression::decompress(&body)?
        } else {
            body
        };
        Self::decode_plaintext(plain)
    }
}

// #########
// # TESTS #
// #########
