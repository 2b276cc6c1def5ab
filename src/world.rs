//! The entity/component store.
//!
//! Ownership is arena-shaped to keep snapshots cheap and cycle-free: the
//! [`SystemManager`] owns every entity, entities own their components by
//! value, and component systems hold nothing but entity ids. Cloning a
//! manager deep-clones entities and systems and then *rebuilds* every
//! system's index from the cloned contents. There are no internal pointers
//! to rewrite, which is exactly what makes trailing-state snapshots safe.
//!
//! Determinism notes: entity ids are allocated monotonically (so iterating
//! the id-ordered store is insertion order), systems run in registration
//! order, and every component can feed its raw state into a
//! [`StateHasher`] and the snapshot codec.

use std::any::Any;
use std::collections::BTreeMap;

use crate::error::EngineError;
use crate::hash::StateHasher;
use crate::packet::Packet;
use crate::Frame;

/// Identifier of an entity, unique within one simulation.
///
/// Ids start at 1 and are never reused; 0 is the null id.
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
pub struct EntityId(i64);

impl EntityId {
    /// The null entity (never allocated).
    pub const NULL: EntityId = EntityId(0);

    /// Creates an id from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(id: i64) -> Self {
        EntityId(id)
    }

    /// The raw id value.
    #[inline]
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Whether this is the null id.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire tag identifying a component type in snapshots.
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
pub struct ComponentKind(u16);

impl ComponentKind {
    /// Creates a kind from its wire value.
    #[inline]
    #[must_use]
    pub const fn new(value: u16) -> Self {
        ComponentKind(value)
    }

    /// The wire value.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

/// The parameterization a [`ComponentSystem`] applies to components.
///
/// A component declares which parameterizations it supports; a system indexes
/// exactly the entities owning at least one component that supports its
/// parameterization.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SystemParam(u16);

impl SystemParam {
    /// Creates a parameterization tag.
    #[inline]
    #[must_use]
    pub const fn new(value: u16) -> Self {
        SystemParam(value)
    }

    /// The raw tag value.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

/// The capability trait every simulation component implements: a stable wire
/// tag, the parameterizations it supports, snapshot encode, state hashing,
/// value-semantics cloning and typed downcasts.
pub trait Component: std::fmt::Debug {
    /// The component's wire tag (must be registered in a
    /// [`ComponentRegistry`] for snapshot decode).
    fn kind(&self) -> ComponentKind;

    /// Whether this component participates under the given system
    /// parameterization.
    fn supports(&self, param: SystemParam) -> bool;

    /// Writes the component's state to a snapshot packet.
    fn encode(&self, packet: &mut Packet);

    /// Mixes the component's deterministic state into a digest.
    fn write_hash(&self, hasher: &mut StateHasher);

    /// Deep-clones the component (value semantics).
    fn clone_box(&self) -> Box<dyn Component>;

    /// Typed read access for systems and command handlers.
    fn as_any(&self) -> &dyn Any;

    /// Typed write access for systems and command handlers.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl Clone for Box<dyn Component> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// An entity: an id plus the components it owns.
#[derive(Debug, Clone)]
pub struct Entity {
    id: EntityId,
    components: Vec<Box<dyn Component>>,
}

impl Entity {
    /// Builds an entity; normally done through [`SystemManager::spawn`].
    #[must_use]
    pub fn new(id: EntityId, components: Vec<Box<dyn Component>>) -> Self {
        Entity { id, components }
    }

    /// The entity's id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// All components in attachment order.
    #[must_use]
    pub fn components(&self) -> &[Box<dyn Component>] {
        &self.components
    }

    /// First component of concrete type `T`, if any.
    #[must_use]
    pub fn component<T: Component + 'static>(&self) -> Option<&T> {
        self.components
            .iter()
            .find_map(|c| c.as_any().downcast_ref::<T>())
    }

    /// Mutable access to the first component of concrete type `T`.
    pub fn component_mut<T: Component + 'static>(&mut self) -> Option<&mut T> {
        self.components
            .iter_mut()
            .find_map(|c| c.as_any_mut().downcast_mut::<T>())
    }

    /// Whether any component supports the given parameterization.
    #[must_use]
    pub fn supports(&self, param: SystemParam) -> bool {
        self.components.iter().any(|c| c.supports(param))
    }

    fn write_hash(&self, hasher: &mut StateHasher) {
        hasher.mix_i64(self.id.as_i64());
        for component in &self.components {
            hasher.mix(&component.kind().as_u16().to_le_bytes());
            component.write_hash(hasher);
        }
    }
}

/// Id-ordered entity storage. Because ids are monotonic, id order is
/// insertion order, which keeps iteration deterministic across peers.
#[derive(Debug, Clone, Default)]
pub struct EntityStore {
    entities: BTreeMap<EntityId, Entity>,
}

impl EntityStore {
    /// Looks up an entity.
    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    /// Mutable entity lookup.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    /// Iterates entities oldest-first.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Mutable oldest-first iteration.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.entities.values_mut()
    }

    /// Number of live entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// The per-system index of entities: ids only, no references into the store.
///
/// Implementors of [`ComponentSystem`] embed one of these; the manager keeps
/// it up to date and rebuilds it wholesale after a clone.
#[derive(Debug, Clone, Default)]
pub struct SystemIndex {
    entities: Vec<EntityId>,
}

impl SystemIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracked entity ids in attachment order.
    #[must_use]
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    fn attach(&mut self, id: EntityId) {
        if !self.entities.contains(&id) {
            self.entities.push(id);
        }
    }

    fn detach(&mut self, id: EntityId) {
        self.entities.retain(|&e| e != id);
    }

    fn clear(&mut self) {
        self.entities.clear();
    }
}

/// A simulation system: updates the components it indexes, once per frame,
/// in registration order.
pub trait ComponentSystem: std::fmt::Debug {
    /// The parameterization this system applies.
    fn param(&self) -> SystemParam;

    /// The system's entity index (maintained by the manager).
    fn index(&self) -> &SystemIndex;

    /// Mutable access to the entity index.
    fn index_mut(&mut self) -> &mut SystemIndex;

    /// Runs the logic update over the indexed entities.
    fn update(&mut self, store: &mut EntityStore, frame: Frame);

    /// Deep-clones the system (indexes are rebuilt by the manager after a
    /// clone, so implementations need not preserve them).
    fn clone_box(&self) -> Box<dyn ComponentSystem>;
}

impl Clone for Box<dyn ComponentSystem> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Decode table for snapshot rehydration: component wire tag → decode fn.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    decoders: BTreeMap<u16, fn(&mut Packet) -> Result<Box<dyn Component>, EngineError>>,
}

impl ComponentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a decoder for a component kind.
    pub fn register(
        &mut self,
        kind: ComponentKind,
        decode: fn(&mut Packet) -> Result<Box<dyn Component>, EngineError>,
    ) {
        self.decoders.insert(kind.as_u16(), decode);
    }

    /// Decodes a component of the given kind.
    pub fn decode(
        &self,
        kind: ComponentKind,
        packet: &mut Packet,
    ) -> Result<Box<dyn Component>, EngineError> {
        let decode = self
            .decoders
            .get(&kind.as_u16())
            .ok_or(EngineError::UnknownComponent {
                kind: kind.as_u16(),
            })?;
        decode(packet)
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("kinds", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Owns all entities and the ordered list of component systems.
#[derive(Debug)]
pub struct SystemManager {
    next_entity: i64,
    store: EntityStore,
    systems: Vec<Box<dyn ComponentSystem>>,
}

impl Default for SystemManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        SystemManager {
            next_entity: 1,
            store: EntityStore::default(),
            systems: Vec::new(),
        }
    }

    /// Appends a system; systems run in the order they were added.
    pub fn add_system(&mut self, mut system: Box<dyn ComponentSystem>) {
        system.index_mut().clear();
        for entity in self.store.iter() {
            if entity.supports(system.param()) {
                system.index_mut().attach(entity.id());
            }
        }
        self.systems.push(system);
    }

    /// Allocates a fresh entity id, attaches the components and offers the
    /// entity to every system.
    pub fn spawn(&mut self, components: Vec<Box<dyn Component>>) -> EntityId {
        let id = EntityId::new(self.next_entity);
        self.next_entity += 1;
        let entity = Entity::new(id, components);
        for system in &mut self.systems {
            if entity.supports(system.param()) {
                system.index_mut().attach(id);
            }
        }
        self.store.entities.insert(id, entity);
        id
    }

    /// Removes an entity and detaches it from all system indexes.
    pub fn despawn(&mut self, id: EntityId) -> bool {
        let removed = self.store.entities.remove(&id).is_some();
        if removed {
            for system in &mut self.systems {
                system.index_mut().detach(id);
            }
        }
        removed
    }

    /// The entity storage.
    #[must_use]
    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Mutable entity storage (command handlers mutate through this).
    pub fn store_mut(&mut self) -> &mut EntityStore {
        &mut self.store
    }

    /// Looks up an entity.
    #[must_use]
    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.store.get(id)
    }

    /// Mutable entity lookup.
    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.store.get_mut(id)
    }

    /// Runs every system's logic update, in registration order.
    pub fn update(&mut self, frame: Frame) {
        let SystemManager {
            store, systems, ..
        } = self;
        for system in systems.iter_mut() {
            system.update(store, frame);
        }
    }

    /// Mixes every entity's state into the digest, in id order.
    pub fn write_hash(&self, hasher: &mut StateHasher) {
        hasher.mix_i64(self.next_entity);
        for entity in self.store.iter() {
            entity.write_hash(hasher);
        }
    }

    /// Serializes the full world (ids and component state) into a packet.
    pub fn encode(&self, packet: &mut Packet) {
        packet.write_i64(self.next_entity);
        packet.write_i32(self.store.len() as i32);
        for entity in self.store.iter() {
            packet.write_i64(entity.id().as_i64());
            packet.write_i32(entity.components().len() as i32);
            for component in entity.components() {
                packet.write_u16(component.kind().as_u16());
                let mut body = Packet::new();
                component.encode(&mut body);
                packet.write_bytes(Some(body.bytes()));
            }
        }
    }

    /// Rebuilds the entity storage from a snapshot, keeping the systems that
    /// are already registered and rebuilding their indexes.
    pub fn decode_into(
        &mut self,
        packet: &mut Packet,
        registry: &ComponentRegistry,
    ) -> Result<(), EngineError> {
        let next_entity = packet.read_i64().map_err(EngineError::Decode)?;
        let entity_count = packet.read_i32().map_err(EngineError::Decode)?;
        if entity_count < 0 {
            return Err(EngineError::Decode(crate::error::DecodeError::BadLength {
                length: entity_count,
            }));
        }
        let mut entities = BTreeMap::new();
        for _ in 0..entity_count {
            let id = EntityId::new(packet.read_i64().map_err(EngineError::Decode)?);
            let component_count = packet.read_i32().map_err(EngineError::Decode)?;
            if component_count < 0 {
                return Err(EngineError::Decode(crate::error::DecodeError::BadLength {
                    length: component_count,
                }));
            }
            let mut components = Vec::with_capacity(component_count as usize);
            for _ in 0..component_count {
                let kind = ComponentKind::new(packet.read_u16().map_err(EngineError::Decode)?);
                let body = packet
                    .read_bytes()
                    .map_err(EngineError::Decode)?
                    .ok_or(EngineError::Decode(crate::error::DecodeError::BadLength {
                        length: -1,
                    }))?;
                let mut body = Packet::from_bytes(body);
                components.push(registry.decode(kind, &mut body)?);
            }
            entities.insert(id, Entity::new(id, components));
        }
        self.next_entity = next_entity;
        self.store.entities = entities;
        self.rebuild_indexes();
        Ok(())
    }

    fn rebuild_indexes(&mut self) {
        let SystemManager {
            store, systems, ..
        } = self;
        for system in systems.iter_mut() {
            system.index_mut().clear();
            for entity in store.iter() {
                if entity.supports(system.param()) {
                    system.index_mut().attach(entity.id());
                }
            }
        }
    }
}

impl Clone for SystemManager {
    /// Deep-clones entities and systems, then rebuilds every system index
    /// from the cloned contents; no aliasing survives a clone.
    fn clone(&self) -> Self {
        let mut cloned = SystemManager {
            next_entity: self.next_entity,
            store: self.store.clone(),
            systems: self.systems.clone(),
        };
        cloned.rebuild_indexes();
        cloned
    }
}

// #########
// # TESTS #
// #########
