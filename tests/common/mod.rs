//! A minimal deterministic game shared by the integration tests: one hull
//! entity driven by a movement system, thrust commands that set its
//! velocity, and the registries the engine needs to decode everything.

// not every test binary uses every helper
#![allow(dead_code)]

use std::any::Any;

use trailstate::world::{EntityStore, SystemIndex, SystemParam};
use trailstate::{
    Command, CommandHandlers, CommandKind, CommandRegistry, Component, ComponentKind,
    ComponentRegistry, ComponentSystem, EngineError, Fixed, Frame, Packet, PlayerId,
    SimulationState, StateHasher, SystemManager, Vec2,
};

pub const KIND_HULL: ComponentKind = ComponentKind::new(1);
pub const PARAM_MOVEMENT: SystemParam = SystemParam::new(1);
pub const SET_THRUST: CommandKind = CommandKind::new(CommandKind::FIRST_GAME);

#[derive(Debug, Clone, PartialEq)]
pub struct Hull {
    pub position: Vec2,
    pub velocity: Vec2,
}

impl Component for Hull {
    fn kind(&self) -> ComponentKind {
        KIND_HULL
    }

    fn supports(&self, param: SystemParam) -> bool {
        param == PARAM_MOVEMENT
    }

    fn encode(&self, packet: &mut Packet) {
        packet.write_vec2(self.position);
        packet.write_vec2(self.velocity);
    }

    fn write_hash(&self, hasher: &mut StateHasher) {
        hasher.mix_i64(self.position.x.raw());
        hasher.mix_i64(self.position.y.raw());
        hasher.mix_i64(self.velocity.x.raw());
        hasher.mix_i64(self.velocity.y.raw());
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

fn decode_hull(packet: &mut Packet) -> Result<Box<dyn Component>, EngineError> {
    let position = packet.read_vec2().map_err(EngineError::Decode)?;
    let velocity = packet.read_vec2().map_err(EngineError::Decode)?;
    Ok(Box::new(Hull { position, velocity }))
}

#[derive(Debug, Clone, Default)]
pub struct MovementSystem {
    index: SystemIndex,
}

impl ComponentSystem for MovementSystem {
    fn param(&self) -> SystemParam {
        PARAM_MOVEMENT
    }

    fn index(&self) -> &SystemIndex {
        &self.index
    }

    fn index_mut(&mut self) -> &mut SystemIndex {
        &mut self.index
    }

    fn update(&mut self, store: &mut EntityStore, _frame: Frame) {
        for &id in self.index().entities() {
            if let Some(entity) = store.get_mut(id) {
                if let Some(hull) = entity.component_mut::<Hull>() {
                    hull.position += hull.velocity;
                }
            }
        }
    }

    fn clone_box(&self) -> Box<dyn ComponentSystem> {
        Box::new(self.clone())
    }
}

fn set_thrust(world: &mut SystemManager, command: &Command) {
    let mut payload = Packet::from_bytes(command.payload.clone());
    let Ok(velocity) = payload.read_vec2() else { return };
    for entity in world.store_mut().iter_mut() {
        if let Some(hull) = entity.component_mut::<Hull>() {
            hull.velocity = velocity;
        }
    }
}

/// One hull at the origin, standing still.
pub fn initial_state() -> SimulationState {
    let mut world = SystemManager::new();
    world.add_system(Box::new(MovementSystem::default()));
    let _ = world.spawn(vec![Box::new(Hull {
        position: Vec2::ZERO,
        velocity: Vec2::ZERO,
    })]);
    SimulationState::new(world)
}

pub fn command_registry() -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry
        .register(SET_THRUST, "set-thrust")
        .expect("fresh registry");
    registry
}

pub fn component_registry() -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();
    registry.register(KIND_HULL, decode_hull);
    registry
}

pub fn handlers() -> CommandHandlers {
    let mut handlers = CommandHandlers::new();
    handlers.register(SET_THRUST, set_thrust);
    handlers
}

pub fn thrust(player: i32, frame: i64, vx: i64, vy: i64) -> Command {
    let mut payload = Packet::new();
    payload.write_vec2(Vec2::from_ints(vx, vy));
    Command::game(
        SET_THRUST,
        PlayerId::new(player),
        Frame::new(frame),
        payload.into_bytes(),
    )
}

/// The hull's current position in whole units.
pub fn hull_position(state: &SimulationState) -> (i64, i64) {
    let entity = state
        .world()
        .store()
        .iter()
        .next()
        .expect("hull entity exists");
    let hull = entity.component::<Hull>().expect("hull component");
    (hull.position.x.to_int(), hull.position.y.to_int())
}

/// Convenience: `Fixed` from whole units.
pub fn fx(value: i64) -> Fixed {
    Fixed::from_int(value)
}

/// Installs a test-writer subscriber so `cargo test -- --nocapture` shows
/// engine logs. Safe to call from every test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
