//! Error types for Trailstate.
//!
//! The error types here are structured: they store numeric context directly
//! instead of formatted strings, so constructing one on a hot path allocates
//! nothing, and callers can match on specific cases. Formatting happens lazily
//! in the `Display` implementations.
//!
//! Propagation rules (who unwinds what):
//!
//! - I/O errors are local to an endpoint and never unwind the game loop.
//! - Codec errors ([`DecodeError`]) unwind at most one packet; the offending
//!   datagram is counted as invalid and dropped.
//! - Arithmetic errors ([`ArithmeticError`]) indicate non-determinism upstream
//!   and are allowed to panic the simulation via the operator forms on
//!   [`Fixed`](crate::Fixed); the `try_*` forms return them instead.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::net::SocketAddr;

use crate::Frame;

/// Why a packet could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DecodeError {
    /// A read requested more bytes than the packet has left.
    Truncated {
        /// Bytes the read needed.
        needed: usize,
        /// Bytes remaining in the buffer.
        available: usize,
    },
    /// A length prefix was negative (and not the `-1` null marker).
    BadLength {
        /// The offending length value.
        length: i32,
    },
    /// A string payload was not valid UTF-8.
    InvalidUtf8,
    /// A tag byte did not name a known variant.
    BadTag {
        /// The offending tag value.
        tag: u8,
    },
    /// The datagram header did not carry the expected magic bytes.
    BadMagic,
    /// The declared payload length exceeds the ciphertext limit (2^31 - 1).
    OversizedPayload {
        /// The declared length.
        length: u32,
    },
    /// The compressed flag was set but the payload did not inflate.
    BadCompression,
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { needed, available } => {
                write!(
                    f,
                    "truncated read: needed {} bytes, {} available",
                    needed, available
                )
            },
            Self::BadLength { length } => write!(f, "invalid length prefix {}", length),
            Self::InvalidUtf8 => write!(f, "string payload is not valid UTF-8"),
            Self::BadTag { tag } => write!(f, "unknown tag byte 0x{:02x}", tag),
            Self::BadMagic => write!(f, "datagram header magic mismatch"),
            Self::OversizedPayload { length } => {
                write!(f, "declared payload length {} exceeds 2^31 - 1", length)
            },
            Self::BadCompression => write!(f, "compressed payload failed to inflate"),
        }
    }
}

impl Error for DecodeError {}

/// A [`Fixed`](crate::Fixed) operation left its domain.
///
/// These are treated as programming bugs: deterministic simulations must not
/// divide by zero or take the square root of a negative, because a peer that
/// *doesn't* hit the same condition has already diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithmeticError {
    /// Division (or remainder) by zero.
    DivisionByZero,
    /// Square root of a negative value.
    NegativeSqrt,
}

impl Display for ArithmeticError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DivisionByZero => write!(f, "fixed-point division by zero"),
            Self::NegativeSqrt => write!(f, "fixed-point square root of a negative value"),
        }
    }
}

impl Error for ArithmeticError {}

/// Top-level error type surfaced by sessions, the protocol and the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EngineError {
    /// A packet or command failed to decode.
    Decode(DecodeError),
    /// A wire command kind is not present in the registry.
    UnknownCommand {
        /// The unregistered kind value.
        kind: u8,
    },
    /// An acked message exhausted its retry budget.
    ProtocolTimeout {
        /// The endpoint that went silent.
        addr: SocketAddr,
    },
    /// The host refused a join because the session is at `max_players`.
    SessionFull,
    /// The host refused a join for a reason other than capacity.
    SessionRefused {
        /// Host-supplied refusal reason.
        reason: String,
    },
    /// The session was torn down (leave, timeout or fatal desync).
    SessionDisconnected {
        /// Human-readable reason code.
        reason: String,
    },
    /// A trailing-state hash disagreed with a peer at the same frame.
    Desync {
        /// The frame at which the digests diverged.
        frame: Frame,
    },
    /// A deterministic arithmetic operation left its domain.
    Arithmetic(ArithmeticError),
    /// A command arrived for a frame the deepest trailing state has passed.
    LateCommand {
        /// The command's execution frame.
        frame: Frame,
        /// The deepest trailing state's current frame.
        deepest: Frame,
    },
    /// An operation requires a session state the session is not in.
    InvalidSessionState,
    /// A command kind was registered twice, or collides with a reserved
    /// engine kind.
    DuplicateCommandKind {
        /// The offending kind value.
        kind: u8,
    },
    /// A snapshot named a component kind with no registered decoder.
    UnknownComponent {
        /// The unregistered component kind value.
        kind: u16,
    },
}

impl Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(err) => write!(f, "decode failed: {}", err),
            Self::UnknownCommand { kind } => write!(f, "unknown command kind {}", kind),
            Self::ProtocolTimeout { addr } => {
                write!(f, "acked message to {} timed out", addr)
            },
            Self::SessionFull => write!(f, "session is full"),
            Self::SessionRefused { reason } => write!(f, "join refused: {}", reason),
            Self::SessionDisconnected { reason } => write!(f, "disconnected: {}", reason),
            Self::Desync { frame } => {
                write!(f, "trailing state hash mismatch at frame {}", frame)
            },
            Self::Arithmetic(err) => write!(f, "{}", err),
            Self::LateCommand { frame, deepest } => {
                write!(
                    f,
                    "command for frame {} is behind the deepest trailing state (frame {})",
                    frame, deepest
                )
            },
            Self::InvalidSessionState => write!(f, "operation invalid in current session state"),
            Self::DuplicateCommandKind { kind } => {
                write!(f, "command kind {} is already registered or reserved", kind)
            },
            Self::UnknownComponent { kind } => {
                write!(f, "no decoder registered for component kind {}", kind)
            },
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Decode(err) => Some(err),
            Self::Arithmetic(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DecodeError> for EngineError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}

impl From<ArithmeticError> for EngineError {
    fn from(err: ArithmeticError) -> Self {
        Self::Arithmetic(err)
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_display_carries_context() {
        let err = DecodeError::Truncated {
            needed: 4,
            available: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains('4'));
        assert!(msg.contains('1'));
    }

    #[test]
    fn engine_error_from_decode() {
        let err: EngineError = DecodeError::BadMagic.into();
        assert_eq!(err, EngineError::Decode(DecodeError::BadMagic));
        assert!(err.source().is_some());
    }

    #[test]
    fn engine_error_from_arithmetic() {
        let err: EngineError = ArithmeticError::DivisionByZero.into();
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn late_command_display_names_both_frames() {
        let err = EngineError::LateCommand {
            frame: Frame::new(90),
            deepest: Frame::new(100),
        };
        let msg = err.to_string();
        assert!(msg.contains("90"));
        assert!(msg.contains("100"));
    }
}
