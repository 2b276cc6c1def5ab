//! # Trailstate
//!
//! Trailstate is a peer-to-peer lockstep simulation engine written in 100% safe
//! Rust. It keeps several snapshots of the simulation at different lags behind
//! the leading frame ("trailing state synchronization"): the leading state runs
//! ahead on locally predicted commands, while deeper states only ever execute
//! commands confirmed by the host. When a confirmed command contradicts a
//! prediction, the affected states are rolled back onto a deeper snapshot and
//! re-executed.
//!
//! The crate is split into a deterministic core and a transport stack:
//!
//! - [`fixed`], [`geometry`], [`hash`], [`packet`]: bit-exact arithmetic, the
//!   wire codec and the state digest that all peers must agree on.
//! - [`world`], [`simulation`], [`tss`], [`clock`]: the entity/component
//!   store, the single-state stepper, the trailing-state scheduler and the
//!   fixed-rate driver.
//! - [`network`], [`session`], [`command`]: reliable delivery over raw
//!   datagrams, membership, and the command wire format.
//!
//! Everything that can influence simulation state uses [`Fixed`] arithmetic
//! and ordered collections; floating point and hash-map iteration are kept to
//! the display side of the fence.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use clock::FrameClock;
pub use command::{Command, CommandKind, CommandRegistry};
pub use config::EngineConfig;
pub use error::{ArithmeticError, DecodeError, EngineError};
pub use fixed::Fixed;
pub use geometry::{Rect, Vec2};
pub use hash::StateHasher;
pub use network::loopback::LoopbackSocket;
pub use network::protocol::{ProtocolEvent, ReliableChannel, SendPriority};
pub use network::udp_socket::{DatagramSocket, UdpDatagramSocket};
pub use packet::Packet;
pub use sampler::SampleWindow;
pub use session::{Player, Session, SessionEvent, SessionState};
pub use simulation::{CommandHandlers, SimulationState};
pub use tss::{TrailingStateSync, TssEvent};
pub use world::{Component, ComponentKind, ComponentRegistry, ComponentSystem, SystemManager};

pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod fixed;
pub mod geometry;
pub mod hash;
pub mod packet;
pub mod sampler;
pub mod session;
pub mod simulation;
pub mod tss;
pub mod world;

/// Transport stack: wire framing, obfuscation, compression, reliable
/// delivery and the datagram socket seam.
pub mod network {
    pub mod compression;
    pub mod crypto;
    pub mod loopback;
    pub mod messages;
    pub mod protocol;
    pub mod udp_socket;
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i64 = -1;

/// A frame is a single step of simulation execution.
///
/// Frames are the fundamental unit of time: every scheduled command names the
/// frame it executes in, and every snapshot is stamped with the frame it
/// represents. Frame numbers start at 0 and increase monotonically; the
/// special value [`Frame::NULL`] (-1) means "no frame".
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i64);

impl Frame {
    /// The null frame constant, representing "no frame" or "uninitialized".
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// Creates a new `Frame` from an `i64` value.
    ///
    /// This does not validate the frame number; use [`Frame::is_valid`] to
    /// check for a non-negative frame.
    #[inline]
    #[must_use]
    pub const fn new(frame: i64) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `i64` value.
    #[inline]
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns `true` if this frame is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is valid (non-negative).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i64> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: i64) -> Self::Output {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i64> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i64) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i64> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, rhs: i64) -> Self::Output {
        Frame(self.0 - rhs)
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = i64;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<i64> for Frame {
    #[inline]
    fn from(value: i64) -> Self {
        Frame(value)
    }
}

impl From<Frame> for i64 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<i64> for Frame {
    #[inline]
    fn eq(&self, other: &i64) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i64> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &i64) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// Player id used by commands originating from the engine itself rather than
/// from any participant.
pub const SYSTEM_PLAYER: i32 = -1;

/// A unique identifier for a participant in a session.
///
/// Ids are allocated by the host, starting at 0, and never reused within a
/// session. The special value [`PlayerId::SYSTEM`] (-1) marks commands issued
/// by the engine itself (handshakes, state transfer, hash reports).
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerId(i32);

impl PlayerId {
    /// The system pseudo-player (engine-issued commands).
    pub const SYSTEM: PlayerId = PlayerId(SYSTEM_PLAYER);

    /// Creates a new `PlayerId` from an `i32` value.
    #[inline]
    #[must_use]
    pub const fn new(id: i32) -> Self {
        PlayerId(id)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this id denotes the engine itself.
    #[inline]
    #[must_use]
    pub const fn is_system(self) -> bool {
        self.0 == SYSTEM_PLAYER
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_system() {
            write!(f, "SYSTEM")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<i32> for PlayerId {
    #[inline]
    fn from(value: i32) -> Self {
        PlayerId(value)
    }
}

impl From<PlayerId> for i32 {
    #[inline]
    fn from(id: PlayerId) -> Self {
        id.0
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
    fn null_frame_is_null() {
        assert!(Frame::NULL.is_null());
        assert!(!Frame::NULL.is_valid());
        assert_eq!(Frame::NULL.as_i64(), NULL_FRAME);
    }

    #[test]
    fn frame_arithmetic() {
        let f = Frame::new(10);
        assert_eq!((f + 5).as_i64(), 15);
        assert_eq!((f - 5).as_i64(), 5);
        assert_eq!(f - Frame::new(4), 6);
        let mut g = f;
        g += 1;
        assert_eq!(g, Frame::new(11));
    }

    #[test]
    fn frame_ordering_consistent_with_i64() {
        assert!(Frame::new(3) < Frame::new(4));
        assert!(Frame::new(4) > 3);
        assert_eq!(Frame::new(4), 4);
        assert!(Frame::NULL < Frame::new(0));
    }

    #[test]
    fn frame_display() {
        assert_eq!(Frame::NULL.to_string(), "NULL_FRAME");
        assert_eq!(Frame::new(42).to_string(), "42");
    }

    #[test]
    fn system_player_id() {
        assert!(PlayerId::SYSTEM.is_system());
        assert!(!PlayerId::new(0).is_system());
        assert_eq!(PlayerId::SYSTEM.to_string(), "SYSTEM");
        assert_eq!(PlayerId::new(7).to_string(), "7");
    }
}
