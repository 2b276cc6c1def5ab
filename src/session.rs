//! Session membership and command routing.
//!
//! A [`Session`] owns a [`ReliableChannel`] and drives everything above it:
//! the join/leave handshake, the authoritative host role, relaying game
//! commands into the [`TrailingStateSync`] scheduler, digest exchange and
//! the snapshot bootstrap for mid-game joiners.
//!
//! State machine:
//!
//! ```text
//! Unconnected ──join()──► Joining ──JoinResponse{ok}──► Client
//!      ▲                     │ timeout / refusal
//!      └─────────────────────┘
//! host() ──► HostListening ──leave()──► HostClosed
//! ```
//!
//! Ordering between membership and gameplay: receivers refuse (do not ack)
//! game commands authored by players they do not know yet, so a relayed
//! command keeps retrying until the corresponding `PlayerJoined` has been
//! processed. `PlayerJoined` is therefore always observed before the player's first
//! command, and `PlayerLeft` after their last.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;

use tracing::{debug, warn};
use web_time::Instant;

use crate::command::{Command, CommandKind, CommandRegistry};
use crate::config::EngineConfig;
use crate::error::{DecodeError, EngineError};
use crate::network::protocol::{ProtocolEvent, ReliableChannel, SendPriority};
use crate::network::udp_socket::DatagramSocket;
use crate::packet::Packet;
use crate::simulation::CommandHandlers;
use crate::tss::{TrailingStateSync, TssEvent};
use crate::world::ComponentRegistry;
use crate::{Frame, PlayerId};

/// The session's lifecycle state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No connection and no local session.
    Unconnected,
    /// A join request is in flight.
    Joining,
    /// Connected to a host as a client.
    Client,
    /// Hosting and accepting joins.
    HostListening,
    /// Was hosting; the session has been closed.
    HostClosed,
}

/// A session participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    /// Host-assigned id.
    pub id: PlayerId,
    /// Display name, chosen at join time.
    pub name: String,
    /// Opaque game-specific blob (e.g. the chosen ship); round-trips
    /// through the codec untouched.
    pub data: Vec<u8>,
}

impl Player {
    fn encode(&self, packet: &mut Packet) {
        packet.write_player_id(self.id);
        packet.write_string(&self.name);
        packet.write_bytes(Some(&self.data));
    }

    fn decode(packet: &mut Packet) -> Result<Self, DecodeError> {
        let id = packet.read_player_id()?;
        let name = packet.read_string()?;
        let data = packet.read_bytes()?.unwrap_or_default();
        Ok(Player { id, name, data })
    }
}

/// Notifications surfaced to the embedding game, drained once per frame.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionEvent {
    /// The host accepted our join; the session is now a [`SessionState::Client`].
    JoinAccepted {
        /// Our assigned player id.
        local_id: PlayerId,
    },
    /// The join attempt ended without a session.
    JoinFailed {
        /// Refusal or timeout reason.
        reason: String,
    },
    /// A participant was admitted (includes ourselves on the host side).
    PlayerJoined {
        /// The new participant.
        player: Player,
    },
    /// A participant left or timed out.
    PlayerLeft {
        /// The departed participant's id.
        id: PlayerId,
    },
    /// The session ended; `reason` is the last reason code.
    Disconnected {
        /// Human-readable reason code (e.g. `leave`, `timeout`, `desync`).
        reason: String,
    },
}

/// Join/leave membership, host authority and command dispatch.
pub struct Session {
    state: SessionState,
    channel: ReliableChannel,
    config: EngineConfig,
    registry: CommandRegistry,
    local_id: PlayerId,
    local_name: String,
    local_data: Vec<u8>,
    next_player_id: i32,
    players: BTreeMap<PlayerId, Player>,
    /// Host side: where each remote player lives.
    player_addrs: BTreeMap<PlayerId, SocketAddr>,
    /// Client side: the host endpoint.
    host_addr: Option<SocketAddr>,
    join_deadline: Option<Instant>,
    invalid_commands: u64,
    events: VecDeque<SessionEvent>,
}

impl Session {
    /// Starts hosting immediately; the local player takes id 0.
    #[must_use]
    pub fn host(
        socket: Box<dyn DatagramSocket>,
        config: EngineConfig,
        registry: CommandRegistry,
        name: &str,
        data: Vec<u8>,
    ) -> Self {
        let local = Player {
            id: PlayerId::new(0),
            name: name.to_owned(),
            data: data.clone(),
        };
        let mut players = BTreeMap::new();
        players.insert(local.id, local);
        Session {
            state: SessionState::HostListening,
            channel: ReliableChannel::new(socket, &config),
            config,
            registry,
            local_id: PlayerId::new(0),
            local_name: name.to_owned(),
            local_data: data,
            next_player_id: 1,
            players,
            player_addrs: BTreeMap::new(),
            host_addr: None,
            join_deadline: None,
            invalid_commands: 0,
            events: VecDeque::new(),
        }
    }

    /// Sends a join request to `host` and enters [`SessionState::Joining`].
    #[must_use]
    pub fn join(
        socket: Box<dyn DatagramSocket>,
        config: EngineConfig,
        registry: CommandRegistry,
        host: SocketAddr,
        name: &str,
        data: Vec<u8>,
        now: Instant,
    ) -> Self {
        let mut session = Session {
            state: SessionState::Joining,
            channel: ReliableChannel::new(socket, &config),
            config,
            registry,
            local_id: PlayerId::SYSTEM,
            local_name: name.to_owned(),
            local_data: data,
            next_player_id: 0,
            players: BTreeMap::new(),
            player_addrs: BTreeMap::new(),
            host_addr: Some(host),
            join_deadline: None,
            invalid_commands: 0,
            events: VecDeque::new(),
        };
        session.join_deadline = Some(now + session.config.join_timeout);

        let mut payload = Packet::new();
        payload.write_string(&session.local_name);
        payload.write_bytes(Some(&session.local_data));
        let join = Command::engine(CommandKind::JOIN, payload.into_bytes());
        session.send_engine(host, &join, SendPriority::High, now);
        session
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Our player id ([`PlayerId::SYSTEM`] until assigned).
    #[must_use]
    pub fn local_id(&self) -> PlayerId {
        self.local_id
    }

    /// The current roster, id-ordered.
    #[must_use]
    pub fn players(&self) -> Vec<&Player> {
        self.players.values().collect()
    }

    /// The address peers reach this session at.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.channel.local_addr()
    }

    /// Mean half-RTT to a peer in milliseconds, if measured.
    #[must_use]
    pub fn ping_ms(&self, addr: SocketAddr) -> Option<i64> {
        self.channel.ping_ms(addr)
    }

    /// Commands dropped as undecodable or unknown.
    #[must_use]
    pub fn invalid_command_count(&self) -> u64 {
        self.invalid_commands
    }

    /// Drains pending session events.
    pub fn events(&mut self) -> std::collections::vec_deque::Drain<'_, SessionEvent> {
        self.events.drain(..)
    }

    /// Issues a local game command scheduled for `frame`.
    ///
    /// On the host the command is immediately authoritative: injected and
    /// broadcast to every client. On a client it is injected tentatively
    /// (leading state only) and sent to the host for confirmation.
    pub fn send_command(
        &mut self,
        kind: CommandKind,
        frame: Frame,
        payload: Vec<u8>,
        tss: &mut TrailingStateSync,
        handlers: &CommandHandlers,
        now: Instant,
    ) -> Result<(), EngineError> {
        if kind.is_engine() {
            return Err(EngineError::InvalidSessionState);
        }
        if frame <= tss.leading_frame() {
            // commands must be authored for a strictly future frame
            return Err(EngineError::LateCommand {
                frame,
                deepest: tss.leading_frame(),
            });
        }
        match self.state {
            SessionState::HostListening => {
                let command =
                    Command::game(kind, self.local_id, frame, payload).into_authoritative();
                tss.inject(command.clone(), handlers)?;
                let packet = command.to_packet();
                self.channel
                    .broadcast(&packet, SendPriority::Medium, None, now);
                Ok(())
            },
            SessionState::Client => {
                let command = Command::game(kind, self.local_id, frame, payload);
                tss.inject(command.clone(), handlers)?;
                if let Some(host) = self.host_addr {
                    self.channel
                        .send(host, command.to_packet(), SendPriority::Medium, now);
                }
                Ok(())
            },
            _ => Err(EngineError::InvalidSessionState),
        }
    }

    /// Leaves the session: hosts broadcast the closure, clients notify the
    /// host. Ends in [`SessionState::HostClosed`] or
    /// [`SessionState::Unconnected`].
    pub fn leave(&mut self, now: Instant) {
        match self.state {
            SessionState::HostListening => {
                let mut payload = Packet::new();
                payload.write_player_id(self.local_id);
                let leave = Command::engine(CommandKind::LEAVE, payload.into_bytes());
                self.channel
                    .broadcast(&leave.to_packet(), SendPriority::High, None, now);
                self.state = SessionState::HostClosed;
                self.events.push_back(SessionEvent::Disconnected {
                    reason: "leave".to_owned(),
                });
            },
            SessionState::Client | SessionState::Joining => {
                if let Some(host) = self.host_addr {
                    let mut payload = Packet::new();
                    payload.write_player_id(self.local_id);
                    let leave = Command::engine(CommandKind::LEAVE, payload.into_bytes());
                    self.send_engine(host, &leave, SendPriority::High, now);
                    self.channel.remove_remote(host);
                }
                self.reset_to_unconnected("leave");
            },
            _ => {},
        }
    }

    /// Drives the whole stack once: the channel, inbound commands, protocol
    /// timeouts, the join deadline and scheduler events.
    pub fn poll(
        &mut self,
        now: Instant,
        tss: &mut TrailingStateSync,
        handlers: &CommandHandlers,
        components: &ComponentRegistry,
    ) {
        // 1. drain the socket; decode inline, refusing commands from
        //    authors we do not know yet (ordering guarantee)
        let mut inbound: Vec<(SocketAddr, Command)> = Vec::new();
        let mut invalid = 0u64;
        {
            let registry = &self.registry;
            let players = &self.players;
            let mut handler = |from: SocketAddr, payload: &mut Packet| -> bool {
                match registry.decode(payload) {
                    Ok(command) => {
                        if !command.kind.is_engine()
                            && !players.contains_key(&command.player)
                        {
                            // not acked: the sender retries until the
                            // membership broadcast has landed
                            return false;
                        }
                        inbound.push((from, command));
                        true
                    },
                    Err(err) => {
                        debug!(%from, error = %err, "dropping undecodable command");
                        invalid += 1;
                        true
                    },
                }
            };
            self.channel.poll(now, &mut handler);
        }
        self.invalid_commands += invalid;

        for (from, command) in inbound {
            self.process_command(from, command, now, tss, handlers, components);
        }

        // 2. endpoint timeouts
        let timeouts: Vec<ProtocolEvent> = self.channel.events().collect();
        for event in timeouts {
            let ProtocolEvent::MessageTimeout { addr } = event;
            self.handle_endpoint_loss(addr, now);
        }

        // 3. join deadline
        if self.state == SessionState::Joining {
            if let Some(deadline) = self.join_deadline {
                if now >= deadline {
                    warn!("join timed out");
                    self.reset_to_unconnected_silent();
                    self.events.push_back(SessionEvent::JoinFailed {
                        reason: "timeout".to_owned(),
                    });
                }
            }
        }

        // 4. scheduler events (digest broadcast, desync reaction)
        let tss_events: Vec<TssEvent> = tss.events().collect();
        for event in tss_events {
            match event {
                TssEvent::HashReport { frame, digest } => {
                    let mut payload = Packet::new();
                    payload.write_frame(frame);
                    payload.write_u32(digest);
                    let info = Command::engine(CommandKind::INFO, payload.into_bytes());
                    // lossy by design; the next cadence frame sends another
                    self.channel
                        .broadcast(&info.to_packet(), SendPriority::None, None, now);
                },
                TssEvent::DesyncDetected { frame, .. } => {
                    self.handle_desync(frame, tss, now);
                },
                TssEvent::CommandDropped { .. } | TssEvent::SnapshotLoaded { .. } => {},
            }
        }
    }

    fn process_command(
        &mut self,
        from: SocketAddr,
        command: Command,
        now: Instant,
        tss: &mut TrailingStateSync,
        handlers: &CommandHandlers,
        components: &ComponentRegistry,
    ) {
        if !command.kind.is_engine() {
            self.process_game_command(from, command, now, tss, handlers);
            return;
        }
        match command.kind {
            CommandKind::JOIN => self.host_accept_join(from, &command, now),
            CommandKind::JOIN_RESPONSE => self.client_join_response(from, &command, tss, now),
            CommandKind::LEAVE => self.handle_leave(from, &command, now),
            CommandKind::PLAYER_JOINED => {
                if let Ok(player) = Player::decode(&mut Packet::from_bytes(command.payload)) {
                    debug!(id = %player.id, "player joined");
                    self.players.insert(player.id, player.clone());
                    self.events.push_back(SessionEvent::PlayerJoined { player });
                }
            },
            CommandKind::PLAYER_LEFT => {
                let mut payload = Packet::from_bytes(command.payload);
                if let Ok(id) = payload.read_player_id() {
                    self.players.remove(&id);
                    self.events.push_back(SessionEvent::PlayerLeft { id });
                }
            },
            CommandKind::GAME_STATE_QUERY => {
                if self.state == SessionState::HostListening {
                    let blob = tss.export_bootstrap();
                    let mut payload = Packet::new();
                    payload.write_raw(blob.bytes());
                    let response =
                        Command::engine(CommandKind::GAME_STATE, payload.into_bytes());
                    self.send_engine(from, &response, SendPriority::Medium, now);
                }
            },
            CommandKind::GAME_STATE => {
                let mut blob = Packet::from_bytes(command.payload);
                match tss.import_bootstrap(&mut blob, &self.registry, components, handlers) {
                    Ok(()) => debug!("snapshot loaded"),
                    Err(err) => {
                        warn!(error = %err, "snapshot rejected; giving up");
                        self.fatal_disconnect("desync", now);
                    },
                }
            },
            CommandKind::INFO => {
                let mut payload = Packet::from_bytes(command.payload);
                if let (Ok(frame), Ok(digest)) = (payload.read_frame(), payload.read_u32()) {
                    // a mismatch queues a DesyncDetected event handled in poll
                    let _ = tss.peer_hash_report(frame, digest);
                }
            },
            _ => {
                // Ack / Query / AckAllFollowing live below the session layer
                debug!(kind = %command.kind, "ignoring reserved engine command");
            },
        }
    }

    fn process_game_command(
        &mut self,
        _from: SocketAddr,
        command: Command,
        now: Instant,
        tss: &mut TrailingStateSync,
        handlers: &CommandHandlers,
    ) {
        match self.state {
            SessionState::HostListening => {
                // the host signs and re-broadcasts; its word is final
                let confirmed = command.into_authoritative();
                if let Err(err) = tss.inject(confirmed.clone(), handlers) {
                    debug!(error = %err, "relayed command not applied locally");
                }
                let packet = confirmed.to_packet();
                self.channel
                    .broadcast(&packet, SendPriority::Medium, None, now);
            },
            SessionState::Client => {
                if let Err(err) = tss.inject(command, handlers) {
                    debug!(error = %err, "inbound command not applied");
                }
            },
            _ => {},
        }
    }

    fn host_accept_join(&mut self, from: SocketAddr, command: &Command, now: Instant) {
        if self.state != SessionState::HostListening {
            return;
        }
        let mut payload = Packet::from_bytes(command.payload.clone());
        let (name, data) = match (payload.read_string(), payload.read_bytes()) {
            (Ok(name), Ok(data)) => (name, data.unwrap_or_default()),
            _ => {
                self.invalid_commands += 1;
                return;
            },
        };

        if self.players.len() >= self.config.max_players as usize {
            debug!(%from, "refusing join: session full");
            let mut body = Packet::new();
            body.write_bool(false);
            body.write_string("full");
            let refusal = Command::engine(CommandKind::JOIN_RESPONSE, body.into_bytes());
            self.send_engine(from, &refusal, SendPriority::High, now);
            return;
        }

        let player = Player {
            id: PlayerId::new(self.next_player_id),
            name,
            data,
        };
        self.next_player_id += 1;

        // announce to the existing peers first, excluding the joiner
        let mut announce = Packet::new();
        player.encode(&mut announce);
        let joined = Command::engine(CommandKind::PLAYER_JOINED, announce.into_bytes());
        self.channel
            .broadcast(&joined.to_packet(), SendPriority::High, Some(from), now);

        self.players.insert(player.id, player.clone());
        self.player_addrs.insert(player.id, from);

        // reply with the assigned id and the full roster (joiner included)
        let mut body = Packet::new();
        body.write_bool(true);
        body.write_player_id(player.id);
        body.write_i32(self.players.len() as i32);
        for member in self.players.values() {
            member.encode(&mut body);
        }
        let response = Command::engine(CommandKind::JOIN_RESPONSE, body.into_bytes());
        self.send_engine(from, &response, SendPriority::High, now);

        self.events.push_back(SessionEvent::PlayerJoined { player });
    }

    fn client_join_response(
        &mut self,
        from: SocketAddr,
        command: &Command,
        tss: &mut TrailingStateSync,
        now: Instant,
    ) {
        if self.state != SessionState::Joining || Some(from) != self.host_addr {
            return;
        }
        let mut payload = Packet::from_bytes(command.payload.clone());
        let Ok(success) = payload.read_bool() else {
            self.invalid_commands += 1;
            return;
        };
        if !success {
            let reason = payload.read_string().unwrap_or_else(|_| "refused".to_owned());
            debug!(reason = %reason, "join refused");
            self.reset_to_unconnected_silent();
            self.events.push_back(SessionEvent::JoinFailed { reason });
            return;
        }
        let (Ok(local_id), Ok(count)) = (payload.read_player_id(), payload.read_i32()) else {
            self.invalid_commands += 1;
            return;
        };
        let mut players = BTreeMap::new();
        for _ in 0..count.max(0) {
            match Player::decode(&mut payload) {
                Ok(player) => {
                    players.insert(player.id, player);
                },
                Err(_) => {
                    self.invalid_commands += 1;
                    return;
                },
            }
        }
        self.local_id = local_id;
        self.players = players;
        self.state = SessionState::Client;
        self.join_deadline = None;
        debug!(%local_id, "join accepted");
        self.events
            .push_back(SessionEvent::JoinAccepted { local_id });

        // a mid-game joiner needs the world before it can step
        if tss.is_waiting_for_sync() {
            let query = Command::engine(CommandKind::GAME_STATE_QUERY, Vec::new());
            self.send_engine(from, &query, SendPriority::High, now);
        }
    }

    fn handle_leave(&mut self, from: SocketAddr, command: &Command, now: Instant) {
        match self.state {
            SessionState::HostListening => {
                let mut payload = Packet::from_bytes(command.payload.clone());
                let Ok(id) = payload.read_player_id() else { return };
                self.drop_player(id, now);
            },
            SessionState::Client | SessionState::Joining => {
                if Some(from) == self.host_addr {
                    // the host closed the session
                    self.reset_to_unconnected("host closed");
                }
            },
            _ => {},
        }
    }

    fn handle_endpoint_loss(&mut self, addr: SocketAddr, now: Instant) {
        match self.state {
            SessionState::HostListening => {
                let lost: Vec<PlayerId> = self
                    .player_addrs
                    .iter()
                    .filter(|(_, a)| **a == addr)
                    .map(|(id, _)| *id)
                    .collect();
                for id in lost {
                    warn!(%id, %addr, "player connection timed out");
                    self.drop_player(id, now);
                }
            },
            SessionState::Joining => {
                if Some(addr) == self.host_addr {
                    self.reset_to_unconnected_silent();
                    self.events.push_back(SessionEvent::JoinFailed {
                        reason: "timeout".to_owned(),
                    });
                }
            },
            SessionState::Client => {
                if Some(addr) == self.host_addr {
                    self.reset_to_unconnected("timeout");
                }
            },
            _ => {},
        }
    }

    /// Host side: removes a player and broadcasts the departure.
    fn drop_player(&mut self, id: PlayerId, now: Instant) {
        if self.players.remove(&id).is_none() {
            return;
        }
        if let Some(addr) = self.player_addrs.remove(&id) {
            self.channel.remove_remote(addr);
        }
        let mut payload = Packet::new();
        payload.write_player_id(id);
        let left = Command::engine(CommandKind::PLAYER_LEFT, payload.into_bytes());
        self.channel
            .broadcast(&left.to_packet(), SendPriority::High, None, now);
        self.events.push_back(SessionEvent::PlayerLeft { id });
    }

    fn handle_desync(&mut self, frame: Frame, tss: &mut TrailingStateSync, now: Instant) {
        if self.state != SessionState::Client {
            // the host is the reference; a diverging client must query us
            warn!(%frame, "peer diverged from host state");
            return;
        }
        if tss.is_recovering() {
            // one snapshot round-trip did not fix it; give up
            self.fatal_disconnect("desync", now);
            return;
        }
        warn!(%frame, "desync detected; requesting snapshot");
        tss.mark_recovering();
        if let Some(host) = self.host_addr {
            let query = Command::engine(CommandKind::GAME_STATE_QUERY, Vec::new());
            self.send_engine(host, &query, SendPriority::High, now);
        }
    }

    fn fatal_disconnect(&mut self, reason: &str, now: Instant) {
        if let Some(host) = self.host_addr {
            let mut payload = Packet::new();
            payload.write_player_id(self.local_id);
            let leave = Command::engine(CommandKind::LEAVE, payload.into_bytes());
            self.send_engine(host, &leave, SendPriority::None, now);
            self.channel.remove_remote(host);
        }
        self.reset_to_unconnected(reason);
    }

    fn reset_to_unconnected(&mut self, reason: &str) {
        self.reset_to_unconnected_silent();
        self.events.push_back(SessionEvent::Disconnected {
            reason: reason.to_owned(),
        });
    }

    fn reset_to_unconnected_silent(&mut self) {
        self.state = SessionState::Unconnected;
        self.players.clear();
        self.player_addrs.clear();
        self.join_deadline = None;
        self.local_id = PlayerId::SYSTEM;
    }

    fn send_engine(
        &mut self,
        addr: SocketAddr,
        command: &Command,
        priority: SendPriority,
        now: Instant,
    ) {
        self.channel.send(addr, command.to_packet(), priority, now);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("local_id", &self.local_id)
            .field("players", &self.players.keys().collect::<Vec<_>>())
            .field("invalid_commands", &self.invalid_commands)
            .finish_non_exhaustive()
    }
}

// #########
// # TESTS #
// #########
