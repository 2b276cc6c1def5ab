//! Commands and the command registry.
//!
//! A [`Command`] is the unit of player (and engine) intent: a tagged record
//! with an originating player, an authority flag, an optional execution frame
//! and an opaque payload. Kinds below [`CommandKind::FIRST_GAME`] are reserved
//! for the engine (handshakes, state transfer, hash reports); everything at
//! or above it is game-defined and **must** be simulation-bound, i.e. carry
//! the frame it executes in.
//!
//! Wire format per command:
//!
//! ```text
//! kind:u8 ‖ player:i32 ‖ authoritative:bool ‖ [frame:i64 if simulation-bound] ‖ payload
//! ```
//!
//! The [`CommandRegistry`] is the explicit registration table populated at
//! startup: decoding needs it to know whether a kind carries a frame, and a
//! kind absent from the table decodes to [`EngineError::UnknownCommand`].
//! There is no reflection and no ambient global; the registry is passed to
//! whoever decodes.

use std::collections::BTreeMap;

use crate::error::EngineError;
use crate::packet::Packet;
use crate::{Frame, PlayerId};

/// A command kind tag (one byte on the wire).
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct CommandKind(u8);

impl CommandKind {
    /// Protocol-level acknowledgement (reserved; handled below the session).
    pub const ACK: CommandKind = CommandKind(0);
    /// Generic query (reserved).
    pub const QUERY: CommandKind = CommandKind(1);
    /// Engine information broadcast; carries trailing-state hash reports.
    pub const INFO: CommandKind = CommandKind(2);
    /// Cumulative acknowledgement (reserved; handled below the session).
    pub const ACK_ALL_FOLLOWING: CommandKind = CommandKind(3);
    /// Client asks to join a session.
    pub const JOIN: CommandKind = CommandKind(4);
    /// Host answers a join request.
    pub const JOIN_RESPONSE: CommandKind = CommandKind(5);
    /// A participant announces departure.
    pub const LEAVE: CommandKind = CommandKind(6);
    /// Host broadcast: a new participant was admitted.
    pub const PLAYER_JOINED: CommandKind = CommandKind(7);
    /// Host broadcast: a participant left or timed out.
    pub const PLAYER_LEFT: CommandKind = CommandKind(8);
    /// Client asks the host for a full simulation snapshot.
    pub const GAME_STATE_QUERY: CommandKind = CommandKind(9);
    /// Host ships a full simulation snapshot.
    pub const GAME_STATE: CommandKind = CommandKind(10);

    /// The highest engine-reserved kind value.
    pub const LAST_ENGINE: u8 = 10;
    /// The first kind value available to game commands.
    pub const FIRST_GAME: u8 = Self::LAST_ENGINE + 1;

    /// Creates a kind from its wire value.
    #[inline]
    #[must_use]
    pub const fn new(value: u8) -> Self {
        CommandKind(value)
    }

    /// The wire value.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Whether this kind is reserved for the engine.
    #[inline]
    #[must_use]
    pub const fn is_engine(self) -> bool {
        self.0 <= Self::LAST_ENGINE
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A frame-stamped unit of intent flowing from players to the simulation.
#[derive(Debug, Clone)]
pub struct Command {
    /// What the command is (registry tag).
    pub kind: CommandKind,
    /// Originating player, or [`PlayerId::SYSTEM`] for engine traffic.
    pub player: PlayerId,
    /// Set by the host; authoritative commands bind all trailing states,
    /// tentative ones only the leading state.
    pub authoritative: bool,
    /// Execution frame. `Some` for every simulation-bound command, `None`
    /// for engine control traffic.
    pub frame: Option<Frame>,
    /// Kind-specific payload bytes.
    pub payload: Vec<u8>,
}

impl Command {
    /// Builds a tentative game command scheduled for `frame`.
    #[must_use]
    pub fn game(kind: CommandKind, player: PlayerId, frame: Frame, payload: Vec<u8>) -> Self {
        Command {
            kind,
            player,
            authoritative: false,
            frame: Some(frame),
            payload,
        }
    }

    /// Builds an engine control command (system player, no frame).
    #[must_use]
    pub fn engine(kind: CommandKind, payload: Vec<u8>) -> Self {
        Command {
            kind,
            player: PlayerId::SYSTEM,
            authoritative: false,
            frame: None,
            payload,
        }
    }

    /// Returns the command with the authoritative flag set.
    #[must_use]
    pub fn into_authoritative(mut self) -> Self {
        self.authoritative = true;
        self
    }

    /// Whether this command targets a simulation frame.
    #[inline]
    #[must_use]
    pub fn is_simulation_bound(&self) -> bool {
        self.frame.is_some()
    }

    /// Serializes the command in wire order.
    pub fn encode(&self, packet: &mut Packet) {
        packet.write_u8(self.kind.as_u8());
        packet.write_player_id(self.player);
        packet.write_bool(self.authoritative);
        if let Some(frame) = self.frame {
            packet.write_frame(frame);
        }
        packet.write_raw(&self.payload);
    }

    /// Serializes into a fresh packet.
    #[must_use]
    pub fn to_packet(&self) -> Packet {
        let mut packet = Packet::with_capacity(self.payload.len() + 16);
        self.encode(&mut packet);
        packet
    }
}

impl PartialEq for Command {
    /// Commands are equal when kind, player and payload match; simulation-
    /// bound commands additionally require the same frame. The authoritative
    /// flag is deliberately excluded: a host confirmation of a prediction is
    /// the *same* command, which is what makes duplicate delivery idempotent.
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.player == other.player
            && self.frame == other.frame
            && self.payload == other.payload
    }
}

impl Eq for Command {}

#[derive(Debug, Clone, Copy)]
struct CommandDescriptor {
    name: &'static str,
    simulation_bound: bool,
}

/// The explicit table of known command kinds, populated at startup.
///
/// Engine kinds are pre-registered; game kinds are added with
/// [`CommandRegistry::register`] and are always simulation-bound.
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    descriptors: BTreeMap<u8, CommandDescriptor>,
}

impl CommandRegistry {
    /// Creates a registry with the engine-reserved kinds pre-registered.
    #[must_use]
    pub fn new() -> Self {
        let mut descriptors = BTreeMap::new();
        let engine: [(CommandKind, &'static str); 11] = [
            (CommandKind::ACK, "ack"),
            (CommandKind::QUERY, "query"),
            (CommandKind::INFO, "info"),
            (CommandKind::ACK_ALL_FOLLOWING, "ack-all-following"),
            (CommandKind::JOIN, "join"),
            (CommandKind::JOIN_RESPONSE, "join-response"),
            (CommandKind::LEAVE, "leave"),
            (CommandKind::PLAYER_JOINED, "player-joined"),
            (CommandKind::PLAYER_LEFT, "player-left"),
            (CommandKind::GAME_STATE_QUERY, "game-state-query"),
            (CommandKind::GAME_STATE, "game-state"),
        ];
        for (kind, name) in engine {
            descriptors.insert(
                kind.as_u8(),
                CommandDescriptor {
                    name,
                    simulation_bound: false,
                },
            );
        }
        CommandRegistry { descriptors }
    }

    /// Registers a game command kind. Game commands always carry a frame.
    ///
    /// Fails when the kind is engine-reserved or already registered.
    pub fn register(&mut self, kind: CommandKind, name: &'static str) -> Result<(), EngineError> {
        if kind.is_engine() || self.descriptors.contains_key(&kind.as_u8()) {
            return Err(EngineError::DuplicateCommandKind {
                kind: kind.as_u8(),
            });
        }
        self.descriptors.insert(
            kind.as_u8(),
            CommandDescriptor {
                name,
                simulation_bound: true,
            },
        );
        Ok(())
    }

    /// Whether the kind is known to this registry.
    #[must_use]
    pub fn contains(&self, kind: CommandKind) -> bool {
        self.descriptors.contains_key(&kind.as_u8())
    }

    /// Whether commands of this kind carry an execution frame.
    #[must_use]
    pub fn is_simulation_bound(&self, kind: CommandKind) -> Option<bool> {
        self.descriptors
            .get(&kind.as_u8())
            .map(|d| d.simulation_bound)
    }

    /// Human-readable name for logs.
    #[must_use]
    pub fn name(&self, kind: CommandKind) -> Option<&'static str> {
        self.descriptors.get(&kind.as_u8()).map(|d| d.name)
    }

    /// Decodes one command from the packet, consuming the trailing bytes as
    /// the payload.
    pub fn decode(&self, packet: &mut Packet) -> Result<Command, EngineError> {
        let kind_value = packet.read_u8().map_err(EngineError::Decode)?;
        let kind = CommandKind::new(kind_value);
        let descriptor = self
            .descriptors
            .get(&kind_value)
            .ok_or(EngineError::UnknownCommand { kind: kind_value })?;
        let player = packet.read_player_id().map_err(EngineError::Decode)?;
        let authoritative = packet.read_bool().map_err(EngineError::Decode)?;
        let frame = if descriptor.simulation_bound {
            Some(packet.read_frame().map_err(EngineError::Decode)?)
        } else {
            None
        };
        Ok(Command {
            kind,
            player,
            authoritative,
            frame,
            payload: packet.read_remaining(),
        })
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// #########
// # TESTS #
// #########
