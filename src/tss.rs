//! The trailing-state scheduler.
//!
//! [`TrailingStateSync`] owns `k+1` copies of the simulation at configured
//! delays `[0, d1, .., dk]`: `S0` (delay 0) is the *leading* state shown to
//! the player and fed by local predictions; deeper states only ever execute
//! host-confirmed commands and trail the leading frame by their delay.
//!
//! When a confirmed command lands on a frame that shallower states have
//! already executed, those states are *dirty*: each is rebuilt by cloning the
//! shallowest state still behind the command's frame, replaying the command
//! log on top and re-stepping to where the dirty state was. Rollback never
//! mutates a deeper state; it clones it.
//!
//! Divergence is caught by digest exchange: every `hash_cadence` frames the
//! deepest state's digest is recorded and broadcast; a peer reporting a
//! different digest for the same frame raises a desync, which the session
//! repairs with a full snapshot round-trip via
//! [`TrailingStateSync::export_bootstrap`] and
//! [`TrailingStateSync::import_bootstrap`]. Joining clients use the same
//! snapshot path, buffering commands until the snapshot arrives.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, warn};

use crate::command::{Command, CommandRegistry};
use crate::error::EngineError;
use crate::packet::Packet;
use crate::simulation::{CommandHandlers, SimulationState};
use crate::world::ComponentRegistry;
use crate::Frame;

/// How many recorded digests to retain for peer comparison.
const HASH_HISTORY_LIMIT: usize = 32;

/// Notifications produced by the scheduler, drained once per tick by the
/// session/game loop.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TssEvent {
    /// The deepest state reached a cadence frame; broadcast this digest.
    HashReport {
        /// The digested frame.
        frame: Frame,
        /// The deepest state's digest at that frame.
        digest: u32,
    },
    /// A peer's digest disagreed with ours at the same frame.
    DesyncDetected {
        /// The frame at which digests diverged.
        frame: Frame,
        /// Our digest.
        local: u32,
        /// The peer's digest.
        remote: u32,
    },
    /// A command arrived too late for the deepest state and was dropped.
    CommandDropped {
        /// The command's execution frame.
        frame: Frame,
    },
    /// A snapshot was loaded and all states were rebuilt from it.
    SnapshotLoaded {
        /// The snapshot's frame.
        frame: Frame,
        /// The leading frame to catch up to.
        leading: Frame,
    },
}

/// The trailing-state synchronization scheduler.
#[derive(Debug)]
pub struct TrailingStateSync {
    /// Strictly increasing delays in frames; `delays[0] == 0`.
    delays: Vec<i64>,
    /// `states[i]` trails the leading frame by `delays[i]`.
    states: Vec<SimulationState>,
    leading_frame: Frame,
    hash_cadence: i64,
    /// Digests of the deepest state at cadence frames.
    hash_history: BTreeMap<i64, u32>,
    /// All injected commands, retained until the deepest state passes them;
    /// the replay source for rollbacks.
    log: BTreeMap<i64, Vec<Command>>,
    /// True for a mid-game joiner until the host snapshot arrives.
    waiting_for_sync: bool,
    /// Commands received while waiting for the snapshot.
    buffered: Vec<Command>,
    /// True between a desync and the snapshot that repairs it.
    recovering: bool,
    events: VecDeque<TssEvent>,
    late_commands: u64,
    rollbacks: u64,
}

impl TrailingStateSync {
    /// Creates a scheduler whose states all start as copies of `initial` at
    /// frame 0.
    ///
    /// `delays` must start with 0 and be strictly increasing.
    pub fn new(
        delays: Vec<i64>,
        hash_cadence: i64,
        initial: SimulationState,
    ) -> Result<Self, EngineError> {
        if delays.first() != Some(&0)
            || !delays.windows(2).all(|pair| pair[0] < pair[1])
            || hash_cadence <= 0
        {
            return Err(EngineError::InvalidSessionState);
        }
        let states = vec![initial; delays.len()];
        Ok(TrailingStateSync {
            delays,
            states,
            leading_frame: Frame::new(0),
            hash_cadence,
            hash_history: BTreeMap::new(),
            log: BTreeMap::new(),
            waiting_for_sync: false,
            buffered: Vec::new(),
            recovering: false,
            events: VecDeque::new(),
            late_commands: 0,
            rollbacks: 0,
        })
    }

    /// Like [`TrailingStateSync::new`], but starts in waiting-for-sync: the
    /// scheduler buffers commands and does not step until a snapshot arrives.
    /// This is the mid-game joiner's entry point.
    pub fn new_waiting(
        delays: Vec<i64>,
        hash_cadence: i64,
        initial: SimulationState,
    ) -> Result<Self, EngineError> {
        let mut tss = Self::new(delays, hash_cadence, initial)?;
        tss.waiting_for_sync = true;
        Ok(tss)
    }

    /// The leading (user-visible) state.
    #[must_use]
    pub fn leading(&self) -> &SimulationState {
        &self.states[0]
    }

    /// The deepest trailing state (the rollback and desync anchor).
    #[must_use]
    pub fn deepest(&self) -> &SimulationState {
        &self.states[self.states.len() - 1]
    }

    /// A state by index (0 = leading). The visual observer samples one of
    /// these read-only.
    #[must_use]
    pub fn state_at(&self, index: usize) -> Option<&SimulationState> {
        self.states.get(index)
    }

    /// Number of maintained states.
    #[must_use]
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// The configured delays.
    #[must_use]
    pub fn delays(&self) -> &[i64] {
        &self.delays
    }

    /// The frame the leading state is scheduled to reach.
    #[must_use]
    pub fn leading_frame(&self) -> Frame {
        self.leading_frame
    }

    /// Whether the scheduler is buffering commands waiting for a snapshot.
    #[must_use]
    pub fn is_waiting_for_sync(&self) -> bool {
        self.waiting_for_sync
    }

    /// Whether a desync was detected and a snapshot round-trip is pending.
    #[must_use]
    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    /// Marks the start of a snapshot round-trip after a desync.
    pub fn mark_recovering(&mut self) {
        self.recovering = true;
    }

    /// Commands dropped as too late so far.
    #[must_use]
    pub fn late_command_count(&self) -> u64 {
        self.late_commands
    }

    /// Rollbacks performed so far.
    #[must_use]
    pub fn rollback_count(&self) -> u64 {
        self.rollbacks
    }

    /// Drains pending scheduler events.
    pub fn events(&mut self) -> std::collections::vec_deque::Drain<'_, TssEvent> {
        self.events.drain(..)
    }

    /// Routes a command into the trailing states.
    ///
    /// Tentative commands touch only the leading state. Authoritative
    /// commands are scheduled into every state still behind the command's
    /// frame; states already past it are rolled back onto the shallowest
    /// state still behind and re-executed.
    ///
    /// A command at or behind the deepest state's frame is rejected as
    /// [`EngineError::LateCommand`], by policy even when it is exactly *at*
    /// the deepest frame; the digest exchange catches any divergence that
    /// policy causes.
    pub fn inject(
        &mut self,
        command: Command,
        handlers: &CommandHandlers,
    ) -> Result<(), EngineError> {
        if self.waiting_for_sync {
            self.buffered.push(command);
            return Ok(());
        }
        let Some(frame) = command.frame else {
            return Err(EngineError::InvalidSessionState);
        };
        let deepest_frame = self.deepest().frame();
        if frame <= deepest_frame {
            self.late_commands += 1;
            warn!(%frame, %deepest_frame, "dropping late command");
            self.events.push_back(TssEvent::CommandDropped { frame });
            return Err(EngineError::LateCommand {
                frame,
                deepest: deepest_frame,
            });
        }

        self.log_insert(command.clone());

        if !command.authoritative {
            // predictions only ever touch the leading state
            if self.states[0].frame() < frame {
                self.states[0].schedule(command);
            } else {
                debug!(%frame, "tentative command behind leading state; awaiting confirmation");
            }
            return Ok(());
        }

        // smallest index still behind the command's frame; guaranteed to
        // exist because the deepest state is behind it
        let basis = self
            .states
            .iter()
            .position(|state| state.frame() < frame)
            .unwrap_or(self.states.len() - 1);

        let mut changed = false;
        for state in &mut self.states[basis..] {
            changed |= state.schedule(command.clone());
        }
        // an exact duplicate changes nothing; re-executing would be wasted work
        if basis > 0 && changed {
            self.rollback(basis, handlers);
        }
        Ok(())
    }

    /// Rebuilds states `0..basis` from `states[basis]` plus the command log.
    fn rollback(&mut self, basis: usize, handlers: &CommandHandlers) {
        self.rollbacks += 1;
        debug!(
            dirty = basis,
            basis_frame = %self.states[basis].frame(),
            "rolling back shallower states"
        );
        for dirty in (0..basis).rev() {
            let target = self.states[dirty].frame();
            let mut fresh = self.states[basis].clone();
            // replay the log on top of the basis; deeper-than-leading states
            // only ever see confirmed commands
            for commands in self.log.values() {
                for command in commands {
                    if command.authoritative || dirty == 0 {
                        fresh.schedule(command.clone());
                    }
                }
            }
            fresh.run_to(target, handlers);
            self.states[dirty] = fresh;
        }
    }

    /// Merges a command into the retained log with the same precedence rules
    /// the per-state queues use.
    fn log_insert(&mut self, command: Command) {
        let Some(frame) = command.frame else { return };
        let slot = self.log.entry(frame.as_i64()).or_default();
        if let Some(existing) = slot.iter_mut().find(|logged| **logged == command) {
            existing.authoritative |= command.authoritative;
            return;
        }
        let same_key =
            |logged: &Command| logged.kind == command.kind && logged.player == command.player;
        if command.authoritative {
            slot.retain(|logged| logged.authoritative || !same_key(logged));
        } else if slot.iter().any(|logged| logged.authoritative && same_key(logged)) {
            return;
        }
        slot.push(command);
    }

    /// Advances the scheduler by one tick: the leading frame moves forward
    /// and every state catches up to its delayed target. Does nothing while
    /// waiting for a snapshot.
    pub fn step(&mut self, handlers: &CommandHandlers) {
        if self.waiting_for_sync {
            return;
        }
        self.leading_frame += 1;
        self.catch_up(handlers);
        self.record_cadence_hash();
        self.prune_log();
    }

    fn catch_up(&mut self, handlers: &CommandHandlers) {
        let leading = self.leading_frame.as_i64();
        for (state, delay) in self.states.iter_mut().zip(self.delays.iter()) {
            let target = leading - delay;
            if target >= 0 {
                state.run_to(Frame::new(target), handlers);
            }
        }
    }

    fn record_cadence_hash(&mut self) {
        let frame = self.deepest().frame();
        if frame.as_i64() <= 0
            || frame.as_i64() % self.hash_cadence != 0
            || self.hash_history.contains_key(&frame.as_i64())
        {
            return;
        }
        let digest = self.deepest().hash();
        self.hash_history.insert(frame.as_i64(), digest);
        while self.hash_history.len() > HASH_HISTORY_LIMIT {
            let oldest = *self.hash_history.keys().next().unwrap_or(&0);
            self.hash_history.remove(&oldest);
        }
        self.events.push_back(TssEvent::HashReport { frame, digest });
    }

    fn prune_log(&mut self) {
        let deepest = self.deepest().frame().as_i64();
        self.log.retain(|&frame, _| frame > deepest);
    }

    /// Compares a peer's digest against our history.
    ///
    /// Returns `Some(true)` on agreement, `Some(false)` (and a
    /// [`TssEvent::DesyncDetected`]) on divergence, `None` when we have no
    /// digest recorded for that frame.
    pub fn peer_hash_report(&mut self, frame: Frame, remote: u32) -> Option<bool> {
        let local = *self.hash_history.get(&frame.as_i64())?;
        if local == remote {
            return Some(true);
        }
        warn!(%frame, local, remote, "trailing state digest mismatch");
        self.events.push_back(TssEvent::DesyncDetected {
            frame,
            local,
            remote,
        });
        Some(false)
    }

    /// Serializes the deepest state and the leading frame: the payload a
    /// host answers a `GameStateQuery` with.
    #[must_use]
    pub fn export_bootstrap(&self) -> Packet {
        let mut packet = Packet::new();
        packet.write_frame(self.leading_frame);
        self.deepest().encode(&mut packet);
        packet
    }

    /// Rebuilds every state from a host snapshot, replays buffered commands
    /// and catches back up to the received leading frame.
    pub fn import_bootstrap(
        &mut self,
        packet: &mut Packet,
        commands: &CommandRegistry,
        components: &ComponentRegistry,
        handlers: &CommandHandlers,
    ) -> Result<(), EngineError> {
        let leading = packet.read_frame().map_err(EngineError::Decode)?;
        let template = &self.states[0];
        let snapshot = SimulationState::decode(packet, commands, components, template)?;
        let frame = snapshot.frame();

        self.leading_frame = leading;
        for state in &mut self.states {
            *state = snapshot.clone();
        }
        self.log.clear();
        self.hash_history.clear();
        self.waiting_for_sync = false;
        self.recovering = false;

        let buffered = std::mem::take(&mut self.buffered);
        for command in buffered {
            // buffered commands older than the snapshot are already baked in
            if command.frame.is_some_and(|f| f > frame) {
                let _ = self.inject(command, handlers);
            }
        }
        self.catch_up(handlers);
        self.events
            .push_back(TssEvent::SnapshotLoaded { frame, leading });
        Ok(())
    }
}

// #########
// # TESTS #
// #########
