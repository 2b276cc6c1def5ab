//! The single-state simulation stepper.
//!
//! A [`SimulationState`] is one self-contained snapshot: the world, the frame
//! it represents and the commands scheduled at frames it has not executed
//! yet. Stepping a frame is strictly:
//!
//! 1. `frame += 1`
//! 2. dispatch every command scheduled for the new frame to its handler
//!    (authoritative first, then by player, then by kind),
//! 3. run every component system in registration order.
//!
//! Display/render sampling happens outside, read-only, against whichever
//! state the caller chooses; stepping never blocks on it.
//!
//! States are value types: cloning one deep-copies the world and the pending
//! command queues, which is what the trailing-state scheduler leans on for
//! rollback.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use tracing::warn;

use crate::command::{Command, CommandRegistry};
use crate::error::EngineError;
use crate::hash::StateHasher;
use crate::packet::Packet;
use crate::world::{ComponentRegistry, SystemManager};
use crate::Frame;

/// A function dispatched for every command of a registered kind.
///
/// Handlers mutate the world through the manager; they must be deterministic
/// (no wall clock, no unseeded randomness, no float).
pub type CommandHandler = fn(&mut SystemManager, &Command);

/// Dispatch table from command kind to handler.
///
/// Handlers are shared by every trailing state, so they live outside the
/// snapshots and are passed to [`SimulationState::step`] explicitly.
#[derive(Clone, Default)]
pub struct CommandHandlers {
    handlers: BTreeMap<u8, CommandHandler>,
}

impl CommandHandlers {
    /// Creates an empty dispatch table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for a command kind, replacing any previous one.
    pub fn register(&mut self, kind: crate::command::CommandKind, handler: CommandHandler) {
        self.handlers.insert(kind.as_u8(), handler);
    }

    fn dispatch(&self, world: &mut SystemManager, command: &Command) {
        match self.handlers.get(&command.kind.as_u8()) {
            Some(handler) => handler(world, command),
            None => {
                warn!(kind = command.kind.as_u8(), "no handler for command kind");
            },
        }
    }
}

impl std::fmt::Debug for CommandHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandlers")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

type FrameQueue = SmallVec<[Command; 4]>;

/// One frame-stamped snapshot of the world plus its pending command queues.
#[derive(Debug, Clone)]
pub struct SimulationState {
    frame: Frame,
    world: SystemManager,
    /// Commands scheduled at frames strictly greater than `frame`, keyed by
    /// execution frame.
    queue: BTreeMap<i64, FrameQueue>,
}

impl SimulationState {
    /// Wraps a world as a state at frame 0.
    #[must_use]
    pub fn new(world: SystemManager) -> Self {
        SimulationState {
            frame: Frame::new(0),
            world,
            queue: BTreeMap::new(),
        }
    }

    /// The frame this snapshot represents.
    #[inline]
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// Read access to the world (display sampling goes through this).
    #[must_use]
    pub fn world(&self) -> &SystemManager {
        &self.world
    }

    /// Write access to the world, for bootstrap and tests.
    pub fn world_mut(&mut self) -> &mut SystemManager {
        &mut self.world
    }

    /// Number of commands still pending execution.
    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.queue.values().map(|commands| commands.len()).sum()
    }

    /// Iterates pending commands in (frame, insertion) order.
    pub fn pending(&self) -> impl Iterator<Item = &Command> {
        self.queue.values().flat_map(|commands| commands.iter())
    }

    /// Schedules a command for its execution frame.
    ///
    /// Returns `false` without touching the queue when the command cannot
    /// execute in this state (frame already passed, or no frame at all) or
    /// when it is already queued (duplicate delivery is idempotent; a
    /// duplicate that is authoritative upgrades the queued command's flag).
    ///
    /// An authoritative command replaces any queued *tentative* command with
    /// the same kind, player and frame but a different payload, which is the
    /// host correcting a mispredicted command. A tentative command arriving
    /// after such a correction is dropped.
    pub fn schedule(&mut self, command: Command) -> bool {
        let Some(frame) = command.frame else {
            warn!("refusing to schedule a command without a frame");
            return false;
        };
        if frame <= self.frame {
            return false;
        }
        let queue = self.queue.entry(frame.as_i64()).or_default();

        // exact duplicate: idempotent, possibly upgrading authority
        if let Some(existing) = queue.iter_mut().find(|queued| **queued == command) {
            existing.authoritative |= command.authoritative;
            return false;
        }

        let same_key = |queued: &Command| {
            queued.kind == command.kind && queued.player == command.player
        };
        if command.authoritative {
            // the confirmed command supersedes conflicting predictions
            queue.retain(|queued| queued.authoritative || !same_key(queued));
        } else if queue.iter().any(|queued| queued.authoritative && same_key(queued)) {
            // a correction for this slot already arrived; the prediction loses
            return false;
        }

        queue.push(command);
        true
    }

    /// Advances exactly one frame.
    pub fn step(&mut self, handlers: &CommandHandlers) {
        self.frame += 1;
        if let Some(mut commands) = self.queue.remove(&self.frame.as_i64()) {
            // authoritative first, then player, then kind; stable for ties
            commands.sort_by_key(|c| (!c.authoritative, c.player, c.kind));
            for command in &commands {
                self.handlers_dispatch(handlers, command);
            }
        }
        self.world.update(self.frame);
    }

    fn handlers_dispatch(&mut self, handlers: &CommandHandlers, command: &Command) {
        handlers.dispatch(&mut self.world, command);
    }

    /// Steps until the state reaches `target`.
    pub fn run_to(&mut self, target: Frame, handlers: &CommandHandlers) {
        while self.frame < target {
            self.step(handlers);
        }
    }

    /// Deterministic digest over frame and world state.
    #[must_use]
    pub fn hash(&self) -> u32 {
        let mut hasher = StateHasher::new();
        hasher.mix_i64(self.frame.as_i64());
        self.world.write_hash(&mut hasher);
        hasher.digest()
    }

    /// Serializes frame, world and pending commands (bootstrap payload).
    pub fn encode(&self, packet: &mut Packet) {
        packet.write_frame(self.frame);
        self.world.encode(packet);
        let total: usize = self.pending_commands();
        packet.write_i32(total as i32);
        for command in self.pending() {
            packet.write_bytes(Some(command.to_packet().bytes()));
        }
    }

    /// Rebuilds a state from a bootstrap payload.
    pub fn decode(
        packet: &mut Packet,
        commands: &CommandRegistry,
        components: &ComponentRegistry,
        template: &SimulationState,
    ) -> Result<Self, EngineError> {
        let frame = packet.read_frame().map_err(EngineError::Decode)?;
        // systems come from the template; entities from the wire
        let mut world = template.world.clone();
        world.decode_into(packet, components)?;
        let mut state = SimulationState {
            frame,
            world,
            queue: BTreeMap::new(),
        };
        let count = packet.read_i32().map_err(EngineError::Decode)?;
        for _ in 0..count.max(0) {
            let body = packet
                .read_bytes()
                .map_err(EngineError::Decode)?
                .ok_or(EngineError::Decode(crate::error::DecodeError::BadLength {
                    length: -1,
                }))?;
            let mut body = Packet::from_bytes(body);
            let command = commands.decode(&mut body)?;
            state.schedule(command);
        }
        Ok(state)
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use crate::hash::StateHasher;
    use crate::packet::Packet;
    use crate::world::{
        Component, ComponentKind, ComponentSystem, EntityStore, SystemIndex, SystemParam,
    };
    use crate::PlayerId;
    use std::any::Any;

    const KIND_MARKER: ComponentKind = ComponentKind::new(1);
    const PARAM_TICK: SystemParam = SystemParam::new(1);
    const NUDGE: CommandKind = CommandKind::new(CommandKind::FIRST_GAME);

    /// A counter component: systems add the stored step every frame, and the
    /// nudge command adds its payload value once.
    #[derive(Debug, Clone)]
    struct Counter {
        value: i64,
        step: i64,
    }

    impl Component for Counter {
        fn kind(&self) -> ComponentKind {
            KIND_MARKER
        }

        fn supports(&self, param: SystemParam) -> bool {
            param == PARAM_TICK
        }

        fn encode(&self, packet: &mut Packet) {
            packet.write_i64(self.value);
            packet.write_i64(self.step);
        }

        fn write_hash(&self, hasher: &mut StateHasher) {
            hasher.mix_i64(self.value);
            hasher.mix_i64(self.step);
        }

        fn clone_box(&self) -> Box<dyn Component> {
            Box::new(self.clone())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[derive(Debug, Clone, Default)]
    struct TickSystem {
        index: SystemIndex,
    }

    impl ComponentSystem for TickSystem {
        fn param(&self) -> SystemParam {
            PARAM_TICK
        }

        fn index(&self) -> &SystemIndex {
            &self.index
        }

        fn index_mut(&mut self) -> &mut SystemIndex {
            &mut self.index
        }

        fn update(&mut self, store: &mut EntityStore, _frame: Frame) {
            for &id in self.index.entities() {
                if let Some(entity) = store.get_mut(id) {
                    if let Some(counter) = entity.component_mut::<Counter>() {
                        counter.value += counter.step;
                    }
                }
            }
        }

        fn clone_box(&self) -> Box<dyn ComponentSystem> {
            Box::new(self.clone())
        }
    }

    fn nudge_handler(world: &mut SystemManager, command: &Command) {
        let mut payload = Packet::from_bytes(command.payload.clone());
        let amount = payload.read_i64().unwrap_or(0);
        for entity in world.store_mut().iter_mut() {
            if let Some(counter) = entity.component_mut::<Counter>() {
                counter.value += amount;
            }
        }
    }

    fn handlers() -> CommandHandlers {
        let mut handlers = CommandHandlers::new();
        handlers.register(NUDGE, nudge_handler);
        handlers
    }

    fn fresh_state() -> SimulationState {
        let mut world = SystemManager::new();
        world.add_system(Box::new(TickSystem::default()));
        let _ = world.spawn(vec![Box::new(Counter { value: 0, step: 1 })]);
        SimulationState::new(world)
    }

    fn nudge(player: i32, frame: i64, amount: i64) -> Command {
        let mut payload = Packet::new();
        payload.write_i64(amount);
        Command::game(
            NUDGE,
            PlayerId::new(player),
            Frame::new(frame),
            payload.into_bytes(),
        )
    }

    fn counter_value(state: &SimulationState) -> i64 {
        state
            .world()
            .store()
            .iter()
            .next()
            .unwrap()
            .component::<Counter>()
            .unwrap()
            .value
    }

    #[test]
    fn step_advances_frame_and_systems() {
        let mut state = fresh_state();
        let handlers = handlers();
        state.step(&handlers);
        assert_eq!(state.frame(), Frame::new(1));
        assert_eq!(counter_value(&state), 1);
    }

    #[test]
    fn commands_dispatch_at_their_frame() {
        let mut state = fresh_state();
        let handlers = handlers();
        assert!(state.schedule(nudge(0, 3, 100)));
        state.run_to(Frame::new(2), &handlers);
        assert_eq!(counter_value(&state), 2);
        state.step(&handlers);
        // frame 3: nudge (+100) then system tick (+1)
        assert_eq!(counter_value(&state), 103);
    }

    #[test]
    fn scheduling_into_the_past_is_refused() {
        let mut state = fresh_state();
        let handlers = handlers();
        state.run_to(Frame::new(5), &handlers);
        assert!(!state.schedule(nudge(0, 5, 1)));
        assert!(!state.schedule(nudge(0, 3, 1)));
        assert!(state.schedule(nudge(0, 6, 1)));
    }

    #[test]
    fn duplicate_scheduling_is_idempotent() {
        let mut state = fresh_state();
        let handlers = handlers();
        assert!(state.schedule(nudge(0, 2, 10)));
        assert!(!state.schedule(nudge(0, 2, 10)));
        state.run_to(Frame::new(2), &handlers);
        // one nudge (+10), two ticks (+2)
        assert_eq!(counter_value(&state), 12);
    }

    #[test]
    fn authoritative_duplicate_upgrades_flag() {
        let mut state = fresh_state();
        assert!(state.schedule(nudge(0, 2, 10)));
        assert!(!state.schedule(nudge(0, 2, 10).into_authoritative()));
        assert!(state.pending().next().unwrap().authoritative);
        assert_eq!(state.pending_commands(), 1);
    }

    #[test]
    fn authoritative_replaces_conflicting_tentative() {
        let mut state = fresh_state();
        let handlers = handlers();
        assert!(state.schedule(nudge(0, 2, 10)));
        assert!(state.schedule(nudge(0, 2, 999).into_authoritative()));
        assert_eq!(state.pending_commands(), 1);
        state.run_to(Frame::new(2), &handlers);
        assert_eq!(counter_value(&state), 999 + 2);
    }

    #[test]
    fn tentative_after_correction_is_dropped() {
        let mut state = fresh_state();
        assert!(state.schedule(nudge(0, 2, 999).into_authoritative()));
        assert!(!state.schedule(nudge(0, 2, 10)));
        assert_eq!(state.pending_commands(), 1);
    }

    #[test]
    fn different_players_do_not_conflict() {
        let mut state = fresh_state();
        assert!(state.schedule(nudge(0, 2, 1)));
        assert!(state.schedule(nudge(1, 2, 2).into_authoritative()));
        assert_eq!(state.pending_commands(), 2);
    }

    #[test]
    fn identical_command_streams_hash_identically() {
        let mut a = fresh_state();
        let mut b = fresh_state();
        let handlers = handlers();
        for state in [&mut a, &mut b] {
            assert!(state.schedule(nudge(0, 2, 7)));
            assert!(state.schedule(nudge(1, 4, -3)));
            state.run_to(Frame::new(6), &handlers);
        }
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.frame(), Frame::new(6));
    }

    #[test]
    fn dispatch_order_is_independent_of_arrival_order() {
        let handlers = handlers();
        let mut a = fresh_state();
        assert!(a.schedule(nudge(0, 2, 5)));
        assert!(a.schedule(nudge(1, 2, 11).into_authoritative()));
        let mut b = fresh_state();
        assert!(b.schedule(nudge(1, 2, 11).into_authoritative()));
        assert!(b.schedule(nudge(0, 2, 5)));
        a.run_to(Frame::new(3), &handlers);
        b.run_to(Frame::new(3), &handlers);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn clone_is_independent() {
        let mut state = fresh_state();
        let handlers = handlers();
        assert!(state.schedule(nudge(0, 3, 50)));
        let snapshot = state.clone();
        state.run_to(Frame::new(3), &handlers);
        assert_eq!(snapshot.frame(), Frame::new(0));
        assert_eq!(snapshot.pending_commands(), 1);
        assert_ne!(state.hash(), snapshot.hash());
    }

    #[test]
    fn snapshot_encode_decode_round_trips() {
        let mut components = crate::world::ComponentRegistry::new();
        components.register(KIND_MARKER, |packet| {
            let value = packet.read_i64().map_err(EngineError::Decode)?;
            let step = packet.read_i64().map_err(EngineError::Decode)?;
            Ok(Box::new(Counter { value, step }))
        });
        let mut commands = CommandRegistry::new();
        commands.register(NUDGE, "nudge").unwrap();

        let handlers = handlers();
        let mut state = fresh_state();
        state.run_to(Frame::new(4), &handlers);
        assert!(state.schedule(nudge(0, 6, 9)));

        let mut packet = Packet::new();
        state.encode(&mut packet);

        let template = fresh_state();
        let mut restored =
            SimulationState::decode(&mut packet, &commands, &components, &template).unwrap();
        assert_eq!(restored.frame(), Frame::new(4));
        assert_eq!(restored.hash(), state.hash());
        assert_eq!(restored.pending_commands(), 1);

        // both replicas advance identically from here
        state.run_to(Frame::new(8), &handlers);
        restored.run_to(Frame::new(8), &handlers);
        assert_eq!(restored.hash(), state.hash());
    }
}
