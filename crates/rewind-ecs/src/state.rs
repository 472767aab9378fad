//! Canonical entity state, substates, and the snapshot history.
//!
//! The [`StateManager`] owns the live [`WorldState`]: every entity, the
//! substate each one belongs to, and a derived index from component name to
//! the entities holding it. Once per tick the live state is pushed into a
//! bounded [`TickBuffer`] so it can later be restored, diffed against, or
//! handed to a lagging peer.
//!
//! # Snapshots
//!
//! [`WorldState`] is built on persistent `im` maps. Cloning it is O(1) and
//! subsequent edits to the live state copy only the touched paths, so the
//! history buffer never observes later mutation.
//!
//! # Structural changes
//!
//! Every edit that can change which entities match a component query (adding
//! or removing an entity, attaching or detaching a component, restoring a
//! snapshot) is appended to a change log. The query cache drains that log to
//! decide which cached results are stale.
//!
//! # Example
//!
//! ```
//! use rewind_ecs::prelude::*;
//! use serde_json::json;
//!
//! let mut state = StateManager::new();
//! let entity = Entity::new("e1")
//!     .with_component(Component::new("render", json!({ "layer": 1 })).unwrap());
//! state.add_entity(entity, DEFAULT_SUB_STATE);
//! state.buffer_state(0);
//!
//! state.component_mut(&"e1".into(), "render").unwrap().state_mut()["layer"] = json!(5);
//! state.restore_state(0).unwrap();
//! assert_eq!(state.component(&"e1".into(), "render").unwrap().state()["layer"], 1);
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::{debug, warn};

use crate::buffer::{TickBuffer, DEFAULT_BUFFER_SIZE};
use crate::component::{Component, ComponentRegistry};
use crate::entity::{Entity, EntityHash};
use crate::snapshot::{SerializedEntity, SerializedState, DEFAULT_SUB_STATE};
use crate::{EcsError, Tick};

/// Pending changes beyond this collapse into a single [`StructuralChange::Reset`].
const MAX_PENDING_CHANGES: usize = 4096;

// ---------------------------------------------------------------------------
// WorldState
// ---------------------------------------------------------------------------

/// An entity plus the substate it lives in.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub entity: Entity,
    pub sub_state: String,
}

/// Entities and substates at one instant. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WorldState {
    entities: im::OrdMap<EntityHash, EntityRecord>,
    sub_states: im::OrdMap<String, im::OrdSet<EntityHash>>,
}

impl WorldState {
    /// An empty world with only the default substate.
    pub fn new() -> Self {
        let mut sub_states = im::OrdMap::new();
        sub_states.insert(DEFAULT_SUB_STATE.to_owned(), im::OrdSet::new());
        Self {
            entities: im::OrdMap::new(),
            sub_states,
        }
    }

    pub fn entity(&self, hash: &EntityHash) -> Option<&Entity> {
        self.entities.get(hash).map(|r| &r.entity)
    }

    pub fn contains(&self, hash: &EntityHash) -> bool {
        self.entities.contains_key(hash)
    }

    /// The substate `hash` belongs to.
    pub fn sub_state_of(&self, hash: &EntityHash) -> Option<&str> {
        self.entities.get(hash).map(|r| r.sub_state.as_str())
    }

    pub fn sub_state(&self, name: &str) -> Option<&im::OrdSet<EntityHash>> {
        self.sub_states.get(name)
    }

    pub fn sub_state_names(&self) -> impl Iterator<Item = &str> {
        self.sub_states.keys().map(String::as_str)
    }

    /// Entities in id order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values().map(|r| &r.entity)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Serialize the entities of one substate.
    pub fn serialize(&self, sub_state: &str) -> Result<SerializedState, EcsError> {
        let members = self.sub_state(sub_state).ok_or_else(|| EcsError::SubStateNotFound {
            name: sub_state.to_owned(),
        })?;
        let entities = members
            .iter()
            .filter_map(|hash| self.entities.get(hash))
            .map(|record| SerializedEntity {
                hash: record.entity.hash().clone(),
                components: record.entity.serialize(),
                sub_state: record.sub_state.clone(),
            })
            .collect();
        Ok(SerializedState { entities })
    }
}

impl Default for WorldState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// StructuralChange
// ---------------------------------------------------------------------------

/// An edit that may change query membership.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuralChange {
    /// An entity entered the world with this component set.
    EntityAdded {
        hash: EntityHash,
        components: BTreeSet<String>,
    },
    /// An entity left the world.
    EntityRemoved { hash: EntityHash },
    /// An entity gained or lost a component; `components` is the set after.
    ComponentsChanged {
        hash: EntityHash,
        components: BTreeSet<String>,
    },
    /// The whole world was swapped out (restore).
    Reset,
}

// ---------------------------------------------------------------------------
// StateManager
// ---------------------------------------------------------------------------

/// Canonical entity state with a bounded snapshot history.
#[derive(Debug)]
pub struct StateManager {
    current: WorldState,
    by_component: BTreeMap<String, BTreeSet<EntityHash>>,
    history: TickBuffer<WorldState>,
    changes: Vec<StructuralChange>,
    fallback_count: u64,
}

impl StateManager {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// A manager retaining `size` snapshots.
    pub fn with_buffer_size(size: usize) -> Self {
        Self {
            current: WorldState::new(),
            by_component: BTreeMap::new(),
            history: TickBuffer::new(size),
            changes: Vec::new(),
            fallback_count: 0,
        }
    }

    // -- entities -----------------------------------------------------------

    /// Add `entity` to `sub_state`, creating the substate if needed.
    ///
    /// An entity already tracked under the same id is fully removed first
    /// (remove hooks fire) and returned.
    pub fn add_entity(&mut self, entity: Entity, sub_state: &str) -> Option<Entity> {
        let replaced = self.detach(entity.hash());

        let hash = entity.hash().clone();
        self.index(&entity);
        self.member_set(sub_state).insert(hash.clone());
        self.record_change(StructuralChange::EntityAdded {
            hash: hash.clone(),
            components: entity.component_names().map(str::to_owned).collect(),
        });
        for component in entity.components() {
            component.fire_init(&hash);
        }
        self.current.entities.insert(
            hash,
            EntityRecord {
                entity,
                sub_state: sub_state.to_owned(),
            },
        );
        replaced
    }

    /// Remove an entity from every index and its substate, firing each
    /// component's remove hook, and hand it back to the caller.
    pub fn remove_entity(&mut self, hash: &EntityHash) -> Result<Entity, EcsError> {
        self.detach(hash).ok_or_else(|| EcsError::EntityNotFound {
            entity: hash.clone(),
        })
    }

    pub fn has_entity(&self, hash: &EntityHash) -> bool {
        self.current.contains(hash)
    }

    pub fn entity(&self, hash: &EntityHash) -> Result<&Entity, EcsError> {
        self.current.entity(hash).ok_or_else(|| EcsError::EntityNotFound {
            entity: hash.clone(),
        })
    }

    /// Component states of one entity keyed by name.
    pub fn entity_state(&self, hash: &EntityHash) -> Result<BTreeMap<String, Value>, EcsError> {
        Ok(self.entity(hash)?.serialize())
    }

    /// All tracked ids in order.
    pub fn entity_set(&self) -> BTreeSet<EntityHash> {
        self.current.entities.keys().cloned().collect()
    }

    pub fn entity_count(&self) -> usize {
        self.current.len()
    }

    // -- components ---------------------------------------------------------

    pub fn component(&self, hash: &EntityHash, name: &str) -> Result<&Component, EcsError> {
        self.entity(hash)?
            .component(name)
            .ok_or_else(|| EcsError::ComponentNotFound {
                entity: hash.clone(),
                component: name.to_owned(),
            })
    }

    /// Mutable access to one component. State edits are not structural and
    /// do not invalidate queries.
    pub fn component_mut(
        &mut self,
        hash: &EntityHash,
        name: &str,
    ) -> Result<&mut Component, EcsError> {
        let record = self
            .current
            .entities
            .get_mut(hash)
            .ok_or_else(|| EcsError::EntityNotFound {
                entity: hash.clone(),
            })?;
        record
            .entity
            .component_mut(name)
            .ok_or_else(|| EcsError::ComponentNotFound {
                entity: hash.clone(),
                component: name.to_owned(),
            })
    }

    /// Attach a component to a live entity. A component of the same name is
    /// replaced (its remove hook fires) and returned.
    pub fn add_component(
        &mut self,
        hash: &EntityHash,
        component: Component,
    ) -> Result<Option<Component>, EcsError> {
        let record = self
            .current
            .entities
            .get_mut(hash)
            .ok_or_else(|| EcsError::EntityNotFound {
                entity: hash.clone(),
            })?;
        let name = component.name().to_owned();
        let replaced = record.entity.add_component(component);
        if let Some(old) = &replaced {
            old.fire_remove(hash);
        }
        if let Some(attached) = record.entity.component(&name) {
            attached.fire_init(hash);
        }
        let after: BTreeSet<String> = record.entity.component_names().map(str::to_owned).collect();

        self.by_component.entry(name).or_default().insert(hash.clone());
        self.record_change(StructuralChange::ComponentsChanged {
            hash: hash.clone(),
            components: after,
        });
        Ok(replaced)
    }

    /// Detach a component from a live entity, firing its remove hook.
    pub fn remove_component(&mut self, hash: &EntityHash, name: &str) -> Result<Component, EcsError> {
        let record = self
            .current
            .entities
            .get_mut(hash)
            .ok_or_else(|| EcsError::EntityNotFound {
                entity: hash.clone(),
            })?;
        let removed = record.entity.remove_component(name)?;
        removed.fire_remove(hash);
        let after: BTreeSet<String> = record.entity.component_names().map(str::to_owned).collect();

        self.unindex_component(name, hash);
        self.record_change(StructuralChange::ComponentsChanged {
            hash: hash.clone(),
            components: after,
        });
        Ok(removed)
    }

    /// Ids of every entity holding `name`.
    ///
    /// Fails when no entity holds it; empty sets are never retained.
    pub fn get_entities_by_component(&self, name: &str) -> Result<&BTreeSet<EntityHash>, EcsError> {
        self.by_component
            .get(name)
            .ok_or_else(|| EcsError::ComponentIndexNotFound {
                component: name.to_owned(),
            })
    }

    /// Whether any entity currently holds `name`.
    pub fn has_component(&self, name: &str) -> bool {
        self.by_component.contains_key(name)
    }

    // -- substates ----------------------------------------------------------

    /// Create a substate (if missing) and move `entities` into it.
    pub fn add_sub_state(&mut self, name: &str, entities: &[EntityHash]) -> Result<(), EcsError> {
        self.member_set(name);
        self.add_entities_to_sub_state(name, entities)
    }

    /// Move tracked entities into `name`, creating it if needed.
    pub fn add_entities_to_sub_state(
        &mut self,
        name: &str,
        entities: &[EntityHash],
    ) -> Result<(), EcsError> {
        if let Some(missing) = entities.iter().find(|h| !self.current.contains(h)) {
            return Err(EcsError::EntityNotFound {
                entity: missing.clone(),
            });
        }
        for hash in entities {
            self.move_to_sub_state(hash, name);
        }
        Ok(())
    }

    pub fn add_entity_to_sub_state(&mut self, name: &str, hash: &EntityHash) -> Result<(), EcsError> {
        self.add_entities_to_sub_state(name, std::slice::from_ref(hash))
    }

    /// Move entities out of `name` back into the default substate.
    pub fn remove_entities_from_sub_state(
        &mut self,
        name: &str,
        entities: &[EntityHash],
    ) -> Result<(), EcsError> {
        let members = self
            .current
            .sub_states
            .get(name)
            .ok_or_else(|| EcsError::SubStateNotFound {
                name: name.to_owned(),
            })?;
        for hash in entities {
            if !self.current.contains(hash) {
                return Err(EcsError::EntityNotFound {
                    entity: hash.clone(),
                });
            }
            if !members.contains(hash) {
                return Err(EcsError::EntityNotInSubState {
                    entity: hash.clone(),
                    sub_state: name.to_owned(),
                });
            }
        }
        for hash in entities {
            self.move_to_sub_state(hash, DEFAULT_SUB_STATE);
        }
        Ok(())
    }

    pub fn sub_state(&self, name: &str) -> Result<&im::OrdSet<EntityHash>, EcsError> {
        self.current
            .sub_state(name)
            .ok_or_else(|| EcsError::SubStateNotFound {
                name: name.to_owned(),
            })
    }

    pub fn sub_state_names(&self) -> Vec<String> {
        self.current.sub_state_names().map(str::to_owned).collect()
    }

    /// Remove every entity. Substates survive, empty.
    pub fn clear(&mut self) {
        let all: Vec<EntityHash> = self.current.entities.keys().cloned().collect();
        for hash in all {
            self.detach(&hash);
        }
    }

    /// Remove every entity of one substate.
    pub fn clear_sub_state(&mut self, name: &str) -> Result<(), EcsError> {
        let members: Vec<EntityHash> = self.sub_state(name)?.iter().cloned().collect();
        for hash in members {
            self.detach(&hash);
        }
        Ok(())
    }

    // -- history ------------------------------------------------------------

    /// Snapshot the live state under `tick`, evicting the oldest snapshot
    /// once the buffer is full.
    pub fn buffer_state(&mut self, tick: Tick) {
        if let Some((evicted, _)) = self.history.push(tick, self.current.clone()) {
            debug!(tick, evicted, "state buffer evicted oldest snapshot");
        }
    }

    /// Replace the live state with the snapshot at `tick`.
    ///
    /// A missing tick falls back to the oldest retained snapshot; the
    /// fallback is counted and logged. Returns the tick actually restored.
    /// Remove hooks fire for every outgoing component and init hooks for
    /// every incoming one.
    pub fn restore_state(&mut self, tick: Tick) -> Result<Tick, EcsError> {
        let (restored_tick, snapshot) = match self.history.get(tick) {
            Some(snapshot) => (tick, snapshot.clone()),
            None => {
                let (oldest, snapshot) = self
                    .history
                    .oldest()
                    .ok_or(EcsError::NoBufferedState { tick })?;
                self.fallback_count += 1;
                warn!(
                    requested = tick,
                    restored = oldest,
                    fallbacks = self.fallback_count,
                    "state tick not buffered, restoring oldest snapshot"
                );
                (oldest, snapshot.clone())
            }
        };

        self.restore_world(snapshot);
        Ok(restored_tick)
    }

    /// Replace the live state with an arbitrary snapshot, firing remove
    /// hooks for the outgoing world and init hooks for the incoming one.
    pub fn restore_world(&mut self, world: WorldState) {
        for record in self.current.entities.values() {
            for component in record.entity.components() {
                component.fire_remove(record.entity.hash());
            }
        }
        self.current = world;
        for record in self.current.entities.values() {
            for component in record.entity.components() {
                component.fire_init(record.entity.hash());
            }
        }
        self.rebuild_index();
        self.record_change(StructuralChange::Reset);
    }

    /// The snapshot stored at exactly `tick`.
    pub fn buffered_state(&self, tick: Tick) -> Option<&WorldState> {
        self.history.get(tick)
    }

    pub fn buffered_ticks(&self) -> Vec<Tick> {
        self.history.ticks()
    }

    pub fn set_max_buffer_size(&mut self, size: usize) {
        self.history.set_capacity(size);
    }

    pub fn max_buffer_size(&self) -> usize {
        self.history.capacity()
    }

    /// How many restores fell back to the oldest snapshot.
    pub fn fallback_count(&self) -> u64 {
        self.fallback_count
    }

    /// The live state.
    pub fn world(&self) -> &WorldState {
        &self.current
    }

    // -- serialization ------------------------------------------------------

    pub fn serialize_state(&self, sub_state: &str) -> Result<SerializedState, EcsError> {
        self.current.serialize(sub_state)
    }

    /// Merge a foreign view into `sub_state`. Incoming entities always win:
    /// known ids are removed and re-added, unknown ids are built through
    /// `registry`. The payload is fully rebuilt before anything is touched.
    pub fn merge_state(
        &mut self,
        payload: &SerializedState,
        registry: &mut ComponentRegistry,
        sub_state: &str,
    ) -> Result<(), EcsError> {
        let rebuilt = payload
            .entities
            .iter()
            .map(|e| registry.rehydrate_entity(&e.hash, &e.components))
            .collect::<Result<Vec<_>, _>>()?;
        for entity in rebuilt {
            self.add_entity(entity, sub_state);
        }
        Ok(())
    }

    /// Entities of `sub_state` that are absent from `other` or whose
    /// component state differs from it.
    pub fn get_delta_state(
        &self,
        other: &WorldState,
        sub_state: &str,
    ) -> Result<SerializedState, EcsError> {
        let full = self.current.serialize(sub_state)?;
        let entities = full
            .entities
            .into_iter()
            .filter(|e| match other.entity(&e.hash) {
                Some(theirs) => theirs.serialize() != e.components,
                None => true,
            })
            .collect();
        Ok(SerializedState { entities })
    }

    /// Every substate serialized, keyed by substate name.
    pub fn get_state(&self) -> BTreeMap<String, SerializedState> {
        self.current
            .sub_states
            .keys()
            .filter_map(|name| {
                self.current
                    .serialize(name)
                    .ok()
                    .map(|state| (name.clone(), state))
            })
            .collect()
    }

    /// Merge every substate of a [`get_state`](Self::get_state) payload.
    pub fn merge_entire_state(
        &mut self,
        state: &BTreeMap<String, SerializedState>,
        registry: &mut ComponentRegistry,
    ) -> Result<(), EcsError> {
        for (name, payload) in state {
            self.merge_state(payload, registry, name)?;
        }
        Ok(())
    }

    // -- change log ---------------------------------------------------------

    /// Take every structural change recorded since the last drain.
    pub fn drain_changes(&mut self) -> Vec<StructuralChange> {
        std::mem::take(&mut self.changes)
    }

    pub fn pending_changes(&self) -> &[StructuralChange] {
        &self.changes
    }

    // -- internals ----------------------------------------------------------

    fn detach(&mut self, hash: &EntityHash) -> Option<Entity> {
        let record = self.current.entities.remove(hash)?;
        for name in record.entity.component_names() {
            self.unindex_component(name, hash);
        }
        if let Some(members) = self.current.sub_states.get_mut(&record.sub_state) {
            members.remove(hash);
        }
        for component in record.entity.components() {
            component.fire_remove(hash);
        }
        self.record_change(StructuralChange::EntityRemoved { hash: hash.clone() });
        Some(record.entity)
    }

    fn move_to_sub_state(&mut self, hash: &EntityHash, name: &str) {
        let Some(record) = self.current.entities.get_mut(hash) else {
            return;
        };
        let previous = std::mem::replace(&mut record.sub_state, name.to_owned());
        if let Some(members) = self.current.sub_states.get_mut(&previous) {
            members.remove(hash);
        }
        self.member_set(name).insert(hash.clone());
    }

    fn member_set(&mut self, name: &str) -> &mut im::OrdSet<EntityHash> {
        self.current.sub_states.entry(name.to_owned()).or_default()
    }

    fn index(&mut self, entity: &Entity) {
        for name in entity.component_names() {
            self.by_component
                .entry(name.to_owned())
                .or_default()
                .insert(entity.hash().clone());
        }
    }

    fn unindex_component(&mut self, name: &str, hash: &EntityHash) {
        if let Some(holders) = self.by_component.get_mut(name) {
            holders.remove(hash);
            if holders.is_empty() {
                self.by_component.remove(name);
            }
        }
    }

    fn rebuild_index(&mut self) {
        self.by_component.clear();
        for record in self.current.entities.values() {
            for name in record.entity.component_names() {
                self.by_component
                    .entry(name.to_owned())
                    .or_default()
                    .insert(record.entity.hash().clone());
            }
        }
    }

    fn record_change(&mut self, change: StructuralChange) {
        if self.changes.len() >= MAX_PENDING_CHANGES {
            self.changes.clear();
            self.changes.push(StructuralChange::Reset);
            return;
        }
        if self.changes.last() == Some(&StructuralChange::Reset) && change == StructuralChange::Reset {
            return;
        }
        self.changes.push(change);
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Lifecycle;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn component(name: &str, state: Value) -> Component {
        Component::new(name, state).unwrap()
    }

    fn entity(hash: &str, components: &[(&str, Value)]) -> Entity {
        let mut e = Entity::new(hash);
        for (name, state) in components {
            e.add_component(component(name, state.clone()));
        }
        e
    }

    fn h(s: &str) -> EntityHash {
        EntityHash::from(s)
    }

    // -- entities -----------------------------------------------------------

    #[test]
    fn add_entity_indexes_components_and_default_substate() {
        let mut sm = StateManager::new();
        sm.add_entity(entity("a", &[("render", json!({}))]), DEFAULT_SUB_STATE);

        assert!(sm.get_entities_by_component("render").unwrap().contains(&h("a")));
        assert!(sm.sub_state(DEFAULT_SUB_STATE).unwrap().contains(&h("a")));
        assert_eq!(sm.world().sub_state_of(&h("a")), Some(DEFAULT_SUB_STATE));
    }

    #[test]
    fn add_entity_with_existing_id_replaces() {
        let mut sm = StateManager::new();
        sm.add_entity(entity("a", &[("render", json!({}))]), DEFAULT_SUB_STATE);
        let replaced = sm.add_entity(entity("a", &[("transform", json!({}))]), "p1");

        assert!(replaced.unwrap().has_component("render"));
        assert_eq!(sm.entity_count(), 1);
        assert!(sm.get_entities_by_component("render").is_err());
        assert!(!sm.sub_state(DEFAULT_SUB_STATE).unwrap().contains(&h("a")));
        assert!(sm.sub_state("p1").unwrap().contains(&h("a")));
    }

    #[test]
    fn remove_untracked_entity_is_not_found() {
        let mut sm = StateManager::new();
        let err = sm.remove_entity(&h("ghost")).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[test]
    fn empty_component_index_is_pruned() {
        let mut sm = StateManager::new();
        sm.add_entity(entity("a", &[("render", json!({}))]), DEFAULT_SUB_STATE);
        sm.remove_entity(&h("a")).unwrap();

        assert!(!sm.has_component("render"));
        assert!(matches!(
            sm.get_entities_by_component("render"),
            Err(EcsError::ComponentIndexNotFound { .. })
        ));
    }

    #[test]
    fn hooks_fire_on_attach_and_detach() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let (init_log, remove_log) = (log.clone(), log.clone());
        let hooks = Lifecycle::new()
            .on_init(move |e, _| init_log.borrow_mut().push(format!("init {e}")))
            .on_remove(move |e, _| remove_log.borrow_mut().push(format!("remove {e}")));

        let mut sm = StateManager::new();
        let e = Entity::new("a").with_component(component("render", json!({})).with_hooks(hooks));
        sm.add_entity(e, DEFAULT_SUB_STATE);
        sm.remove_entity(&h("a")).unwrap();

        assert_eq!(*log.borrow(), vec!["init a", "remove a"]);
    }

    #[test]
    fn restore_state_detaches_outgoing_then_attaches_incoming() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let hooked = |hash: &str| {
            let (init_log, remove_log) = (log.clone(), log.clone());
            let hooks = Lifecycle::new()
                .on_init(move |e, _| init_log.borrow_mut().push(format!("init {e}")))
                .on_remove(move |e, _| remove_log.borrow_mut().push(format!("remove {e}")));
            Entity::new(hash).with_component(component("render", json!({})).with_hooks(hooks))
        };

        let mut sm = StateManager::new();
        sm.add_entity(hooked("a"), DEFAULT_SUB_STATE);
        sm.add_entity(hooked("b"), DEFAULT_SUB_STATE);
        sm.buffer_state(0);
        sm.remove_entity(&h("b")).unwrap();
        sm.add_entity(hooked("c"), DEFAULT_SUB_STATE);
        log.borrow_mut().clear();

        assert_eq!(sm.restore_state(0).unwrap(), 0);
        assert_eq!(
            *log.borrow(),
            vec!["remove a", "remove c", "init a", "init b"]
        );
        assert!(sm.get_entities_by_component("render").unwrap().contains(&h("b")));
        assert!(!sm.get_entities_by_component("render").unwrap().contains(&h("c")));
    }

    // -- components ---------------------------------------------------------

    #[test]
    fn lookup_failures_distinguish_entity_and_component() {
        let mut sm = StateManager::new();
        sm.add_entity(entity("a", &[("render", json!({}))]), DEFAULT_SUB_STATE);

        assert!(matches!(
            sm.component(&h("b"), "render"),
            Err(EcsError::EntityNotFound { .. })
        ));
        assert!(matches!(
            sm.component(&h("a"), "physics"),
            Err(EcsError::ComponentNotFound { .. })
        ));
    }

    #[test]
    fn live_component_edits_keep_index_consistent() {
        let mut sm = StateManager::new();
        sm.add_entity(entity("a", &[("render", json!({}))]), DEFAULT_SUB_STATE);
        sm.drain_changes();

        sm.add_component(&h("a"), component("transform", json!({ "x": 0 })))
            .unwrap();
        assert!(sm.get_entities_by_component("transform").unwrap().contains(&h("a")));

        sm.remove_component(&h("a"), "render").unwrap();
        assert!(!sm.has_component("render"));

        let changes = sm.drain_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(
            changes[1],
            StructuralChange::ComponentsChanged {
                hash: h("a"),
                components: BTreeSet::from(["transform".to_owned()]),
            }
        );
    }

    // -- substates ----------------------------------------------------------

    #[test]
    fn entities_move_between_substates() {
        let mut sm = StateManager::new();
        sm.add_entity(entity("a", &[]), DEFAULT_SUB_STATE);
        sm.add_entity(entity("b", &[]), DEFAULT_SUB_STATE);

        sm.add_sub_state("client-1", &[h("a")]).unwrap();
        assert_eq!(sm.world().sub_state_of(&h("a")), Some("client-1"));
        assert!(!sm.sub_state(DEFAULT_SUB_STATE).unwrap().contains(&h("a")));

        sm.remove_entities_from_sub_state("client-1", &[h("a")])
            .unwrap();
        assert!(sm.sub_state(DEFAULT_SUB_STATE).unwrap().contains(&h("a")));
        assert!(sm.sub_state("client-1").unwrap().is_empty());
    }

    #[test]
    fn substate_moves_validate_before_mutating() {
        let mut sm = StateManager::new();
        sm.add_entity(entity("a", &[]), DEFAULT_SUB_STATE);

        let err = sm
            .add_entities_to_sub_state("p", &[h("a"), h("ghost")])
            .unwrap_err();
        assert!(matches!(err, EcsError::EntityNotFound { .. }));
        assert_eq!(sm.world().sub_state_of(&h("a")), Some(DEFAULT_SUB_STATE));

        let err = sm
            .remove_entities_from_sub_state("nowhere", &[h("a")])
            .unwrap_err();
        assert!(matches!(err, EcsError::SubStateNotFound { .. }));

        sm.add_sub_state("p", &[]).unwrap();
        let err = sm.remove_entities_from_sub_state("p", &[h("a")]).unwrap_err();
        assert!(matches!(err, EcsError::EntityNotInSubState { .. }));
    }

    #[test]
    fn clear_sub_state_only_removes_its_members() {
        let mut sm = StateManager::new();
        sm.add_entity(entity("a", &[]), DEFAULT_SUB_STATE);
        sm.add_entity(entity("b", &[]), "p");

        sm.clear_sub_state("p").unwrap();
        assert!(sm.has_entity(&h("a")));
        assert!(!sm.has_entity(&h("b")));

        sm.clear();
        assert_eq!(sm.entity_count(), 0);
        assert!(sm.sub_state_names().contains(&"p".to_owned()));
    }

    // -- history ------------------------------------------------------------

    #[test]
    fn buffer_keeps_most_recent_snapshots() {
        let mut sm = StateManager::new();
        for tick in 0..10 {
            sm.buffer_state(tick);
        }
        assert_eq!(sm.buffered_ticks(), (2..10).collect::<Vec<_>>());
    }

    #[test]
    fn snapshots_are_immutable() {
        let mut sm = StateManager::new();
        sm.add_entity(entity("a", &[("p", json!({ "x": 1 }))]), DEFAULT_SUB_STATE);
        sm.buffer_state(0);
        sm.component_mut(&h("a"), "p").unwrap().state_mut()["x"] = json!(2);

        let snap = sm.buffered_state(0).unwrap();
        assert_eq!(snap.entity(&h("a")).unwrap().component("p").unwrap().state()["x"], 1);
    }

    #[test]
    fn restore_missing_tick_falls_back_to_oldest() {
        let mut sm = StateManager::with_buffer_size(2);
        for tick in 0..4 {
            sm.add_entity(entity(&format!("e{tick}"), &[]), DEFAULT_SUB_STATE);
            sm.buffer_state(tick);
        }
        assert_eq!(sm.restore_state(0).unwrap(), 2);
        assert_eq!(sm.fallback_count(), 1);
        assert_eq!(sm.entity_count(), 3);
    }

    #[test]
    fn restore_with_empty_buffer_fails() {
        let mut sm = StateManager::new();
        assert!(matches!(
            sm.restore_state(3),
            Err(EcsError::NoBufferedState { tick: 3 })
        ));
    }

    #[test]
    fn restore_rebuilds_index_and_signals_reset() {
        let mut sm = StateManager::new();
        sm.buffer_state(0);
        sm.add_entity(entity("a", &[("render", json!({}))]), DEFAULT_SUB_STATE);
        sm.drain_changes();

        sm.restore_state(0).unwrap();
        assert!(!sm.has_component("render"));
        assert_eq!(sm.drain_changes(), vec![StructuralChange::Reset]);
    }

    // -- serialization ------------------------------------------------------

    #[test]
    fn serialize_unknown_substate_fails() {
        let sm = StateManager::new();
        assert!(matches!(
            sm.serialize_state("nope"),
            Err(EcsError::SubStateNotFound { .. })
        ));
    }

    #[test]
    fn merge_replaces_known_and_builds_unknown() {
        let mut registry = ComponentRegistry::new(0);
        let mut sm = StateManager::new();
        sm.add_entity(entity("a", &[("render", json!({ "layer": 1 }))]), DEFAULT_SUB_STATE);

        let payload: SerializedState = serde_json::from_value(json!({
            "entities": [
                { "hash": "a", "components": { "render": { "layer": 9 } }, "subState": "default" },
                { "hash": "b", "components": { "transform": { "x": 3 } }, "subState": "default" }
            ]
        }))
        .unwrap();
        sm.merge_state(&payload, &mut registry, DEFAULT_SUB_STATE).unwrap();

        assert_eq!(sm.component(&h("a"), "render").unwrap().state()["layer"], 9);
        assert_eq!(sm.component(&h("b"), "transform").unwrap().state()["x"], 3);
        assert_eq!(sm.get_entities_by_component("transform").unwrap().len(), 1);
    }

    #[test]
    fn merge_with_malformed_entity_changes_nothing() {
        let mut registry = ComponentRegistry::new(0);
        let mut sm = StateManager::new();
        let payload: SerializedState = serde_json::from_value(json!({
            "entities": [
                { "hash": "a", "components": { "render": {} } },
                { "hash": "b", "components": { "render": 4 } }
            ]
        }))
        .unwrap();
        assert!(sm.merge_state(&payload, &mut registry, DEFAULT_SUB_STATE).is_err());
        assert_eq!(sm.entity_count(), 0);
    }

    #[test]
    fn get_state_round_trips_through_merge_entire_state() {
        let mut registry = ComponentRegistry::new(0);
        let mut source = StateManager::new();
        source.add_entity(entity("a", &[("p", json!({ "x": 1 }))]), DEFAULT_SUB_STATE);
        source.add_entity(entity("b", &[("p", json!({ "x": 2 }))]), "client-1");

        let mut target = StateManager::new();
        target
            .merge_entire_state(&source.get_state(), &mut registry)
            .unwrap();

        assert_eq!(target.get_state(), source.get_state());
        assert_eq!(target.world().sub_state_of(&h("b")), Some("client-1"));
    }
}
