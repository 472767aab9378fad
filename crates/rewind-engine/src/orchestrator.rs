//! Per-replica orchestration: tick sequencing, dispatch history, rollback
//! and unroll.
//!
//! Each [`Orchestrator::update`] runs, in order:
//!
//! 1. Inbound messages queued by [`Orchestrator::receive`] are handed to the
//!    [`Role`]. Nothing touches state between ticks.
//! 2. Processors run against their refreshed queries and queue actions.
//! 3. Events due at this tick are delivered and their handlers queue actions.
//! 4. The action queue is swapped, archived under the tick and dispatched.
//! 5. State is snapshotted under the tick.
//! 6. The role's post-update hook runs (the server sends UPDATEs here).
//! 7. The tick advances.
//!
//! Independently of the tick loop, [`Orchestrator::dispatch`] applies an
//! action immediately and records it in a counter-stamped history together
//! with the state it produced. [`Orchestrator::rollback`] and
//! [`Orchestrator::rollback_actions`] rewind that history to an authoritative
//! point, and [`Orchestrator::unroll`] re-applies whatever is left.
//!
//! # Example
//!
//! ```
//! use rewind_engine::prelude::*;
//! use serde_json::json;
//!
//! let mut replica = Orchestrator::new(SyncConfig::default(), ServerRole::new()).unwrap();
//! replica.register_component("counter", |args| json!({ "n": args["n"] }));
//! replica
//!     .create_entity(&[ComponentSpec::new("counter", json!({ "n": 0 }))], Some("c".into()))
//!     .unwrap();
//! replica.add_reducer(&["INC"], |_, state, _| {
//!     let c = state.component_mut(&"c".into(), "counter")?;
//!     let n = c.state()["n"].as_i64().unwrap_or(0);
//!     c.state_mut()["n"] = json!(n + 1);
//!     Ok(())
//! });
//!
//! replica.dispatch(Action::new("INC")).unwrap();
//! let checkpoint = replica.serialize();
//! replica.dispatch(Action::new("INC")).unwrap();
//!
//! replica.rollback(1, &checkpoint).unwrap();
//! replica.unroll().unwrap();
//! assert_eq!(replica.state().component(&"c".into(), "counter").unwrap().state()["n"], 2);
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::Rc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use rewind_ecs::prelude::*;

use crate::config::SyncConfig;
use crate::events::{EventManager, EventReport, SubscriptionId};
use crate::protocol::{Envelope, EventRecord, Message, PeerId};
use crate::role::Role;
use crate::SyncError;

/// Built-in action creating an entity from `{hash, components, subState?}`.
pub const ADD_ENTITY: &str = "ADD_ENTITY";
/// Built-in action removing the entity named by `{hash}`.
pub const REMOVE_ENTITY: &str = "REMOVE_ENTITY";

// ---------------------------------------------------------------------------
// SyncCore
// ---------------------------------------------------------------------------

/// The managers a [`Role`] may drive, plus the outgoing message queue.
pub struct SyncCore {
    pub state: StateManager,
    pub actions: ActionManager,
    pub processors: ProcessorManager,
    pub events: EventManager,
    registry: Rc<RefCell<ComponentRegistry>>,
    tick: Tick,
    outbox: Vec<Envelope>,
    config: SyncConfig,
}

impl SyncCore {
    fn new(config: SyncConfig) -> Self {
        let registry = Rc::new(RefCell::new(ComponentRegistry::new(config.hash_seed)));
        let mut actions = ActionManager::with_buffer_size(config.action_buffer_size);
        install_builtin_reducers(&mut actions, Rc::clone(&registry));
        Self {
            state: StateManager::with_buffer_size(config.state_buffer_size),
            actions,
            processors: ProcessorManager::new(),
            events: EventManager::new(),
            registry,
            tick: 0,
            outbox: Vec::new(),
            config,
        }
    }

    /// The next tick to be simulated.
    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn set_tick(&mut self, tick: Tick) {
        self.tick = tick;
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Queue a message for `peer`; collected by `take_outgoing`.
    pub fn send(&mut self, peer: PeerId, message: Message) {
        self.outbox.push(Envelope { peer, message });
    }

    /// Resize both history buffers.
    pub fn set_buffer_sizes(&mut self, size: usize) {
        self.state.set_max_buffer_size(size);
        self.actions.set_max_buffer_size(size);
    }

    /// Merge a serialized view through the shared component registry.
    pub fn merge_state(
        &mut self,
        payload: &SerializedState,
        sub_state: &str,
    ) -> Result<(), SyncError> {
        let mut registry = self
            .registry
            .try_borrow_mut()
            .map_err(|_| SyncError::RegistryBusy)?;
        self.state.merge_state(payload, &mut registry, sub_state)?;
        Ok(())
    }

    fn merge_entire_state(
        &mut self,
        state: &BTreeMap<String, SerializedState>,
    ) -> Result<(), SyncError> {
        let mut registry = self
            .registry
            .try_borrow_mut()
            .map_err(|_| SyncError::RegistryBusy)?;
        self.state.merge_entire_state(state, &mut registry)?;
        Ok(())
    }

    fn registry_mut(&self) -> Result<std::cell::RefMut<'_, ComponentRegistry>, SyncError> {
        self.registry
            .try_borrow_mut()
            .map_err(|_| SyncError::RegistryBusy)
    }
}

impl fmt::Debug for SyncCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCore")
            .field("tick", &self.tick)
            .field("entities", &self.state.entity_count())
            .field("queued_actions", &self.actions.queued_actions().len())
            .field("outbox", &self.outbox.len())
            .finish()
    }
}

fn rejected(action: &Action, reason: &str) -> EcsError {
    EcsError::ActionRejected {
        action_type: action.kind.clone(),
        reason: reason.to_owned(),
    }
}

fn target_hash(action: &Action) -> Result<EntityHash, EcsError> {
    action
        .get("hash")
        .and_then(Value::as_str)
        .map(EntityHash::from)
        .ok_or_else(|| rejected(action, "missing string field 'hash'"))
}

fn install_builtin_reducers(actions: &mut ActionManager, registry: Rc<RefCell<ComponentRegistry>>) {
    actions.add_reducer(&[ADD_ENTITY], move |action, state, _| {
        let hash = target_hash(action)?;
        let components = action
            .get("components")
            .cloned()
            .ok_or_else(|| rejected(action, "missing field 'components'"))?;
        let specs: Vec<ComponentSpec> =
            serde_json::from_value(components).map_err(|e| EcsError::MalformedAction {
                details: e.to_string(),
            })?;
        let sub_state = action
            .get("subState")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_SUB_STATE);
        let entity = registry
            .try_borrow_mut()
            .map_err(|_| rejected(action, "component registry is busy"))?
            .create_entity(&specs, Some(hash))?;
        state.add_entity(entity, sub_state);
        Ok(())
    });
    actions.add_reducer(&[REMOVE_ENTITY], |action, state, _| {
        state.remove_entity(&target_hash(action)?)?;
        Ok(())
    });
}

// ---------------------------------------------------------------------------
// Dispatch history
// ---------------------------------------------------------------------------

/// Replica phase. `RollingBack` and `Unrolling` only last for the duration
/// of the corresponding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Live,
    RollingBack,
    Unrolling,
}

/// What a dispatch observer is told about each applied action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchContext {
    pub counter: u64,
    /// Set while [`Orchestrator::unroll`] re-applies history. Observers that
    /// forward actions elsewhere should skip these.
    pub unrolling: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(u64);

type Observer = Box<dyn FnMut(&Action, DispatchContext)>;

#[derive(Debug, Clone)]
struct HistoryEntry {
    counter: u64,
    action: Action,
    state_after: WorldState,
}

/// Summary of one [`Orchestrator::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: Tick,
    pub messages: usize,
    pub message_errors: usize,
    pub processors: ProcessorReport,
    pub events: EventReport,
    pub actions: DispatchReport,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// One replica: the managers, a dispatch history and a role strategy.
pub struct Orchestrator<R: Role> {
    core: SyncCore,
    role: R,
    history: VecDeque<HistoryEntry>,
    counter: u64,
    phase: SyncPhase,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: u64,
    inbox: VecDeque<Envelope>,
}

impl<R: Role> Orchestrator<R> {
    /// Validate `config` and build a replica in the [`SyncPhase::Live`] phase.
    pub fn new(config: SyncConfig, mut role: R) -> Result<Self, SyncError> {
        config.validate()?;
        let mut core = SyncCore::new(config);
        role.attach(&mut core);
        Ok(Self {
            core,
            role,
            history: VecDeque::new(),
            counter: 0,
            phase: SyncPhase::Live,
            observers: Vec::new(),
            next_observer: 0,
            inbox: VecDeque::new(),
        })
    }

    // -- accessors ----------------------------------------------------------

    pub fn state(&self) -> &StateManager {
        &self.core.state
    }

    pub fn state_mut(&mut self) -> &mut StateManager {
        &mut self.core.state
    }

    pub fn actions(&self) -> &ActionManager {
        &self.core.actions
    }

    pub fn actions_mut(&mut self) -> &mut ActionManager {
        &mut self.core.actions
    }

    pub fn processors_mut(&mut self) -> &mut ProcessorManager {
        &mut self.core.processors
    }

    pub fn events(&self) -> &EventManager {
        &self.core.events
    }

    pub fn core(&self) -> &SyncCore {
        &self.core
    }

    pub fn role(&self) -> &R {
        &self.role
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut SyncCore, &mut R) {
        (&mut self.core, &mut self.role)
    }

    /// The next tick to be simulated.
    pub fn tick(&self) -> Tick {
        self.core.tick
    }

    /// Highest dispatch counter seen, local or adopted from a rollback.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Counters of the retained history entries, oldest first.
    pub fn history_counters(&self) -> Vec<u64> {
        self.history.iter().map(|e| e.counter).collect()
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    // -- registration -------------------------------------------------------

    pub fn register_component(
        &mut self,
        name: &str,
        constructor: impl Fn(&Value) -> Value + 'static,
    ) {
        self.core.registry.borrow_mut().register(name, constructor);
    }

    pub fn register_component_with_hooks(
        &mut self,
        name: &str,
        constructor: impl Fn(&Value) -> Value + 'static,
        hooks: Lifecycle,
    ) {
        self.core
            .registry
            .borrow_mut()
            .register_with_hooks(name, constructor, hooks);
    }

    pub fn add_reducer(
        &mut self,
        kinds: &[&str],
        reducer: impl Fn(&Action, &mut StateManager, &mut ActionQueue) -> Result<(), EcsError>
            + 'static,
    ) -> ReducerId {
        self.core.actions.add_reducer(kinds, reducer)
    }

    pub fn add_processor(&mut self, processor: Box<dyn Processor>) {
        self.core.processors.add_processor(processor);
    }

    pub fn subscribe(
        &mut self,
        event_type: &str,
        handler: impl Fn(&EventRecord, &mut ActionQueue) -> Result<(), EcsError> + 'static,
    ) -> SubscriptionId {
        self.core.events.subscribe(event_type, handler)
    }

    /// Register a callback run after every [`dispatch`](Self::dispatch) and
    /// every action re-applied by [`unroll`](Self::unroll), in registration
    /// order.
    pub fn observe(&mut self, observer: impl FnMut(&Action, DispatchContext) + 'static) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    // -- entities -----------------------------------------------------------

    /// Build an entity through the registry and add it immediately, outside
    /// of any action. Intended for setup before the first tick.
    pub fn create_entity(
        &mut self,
        specs: &[ComponentSpec],
        hash: Option<EntityHash>,
    ) -> Result<EntityHash, SyncError> {
        let entity = self.core.registry_mut()?.create_entity(specs, hash)?;
        let hash = entity.hash().clone();
        self.core.state.add_entity(entity, DEFAULT_SUB_STATE);
        Ok(hash)
    }

    /// An [`ADD_ENTITY`] action with a freshly generated id.
    pub fn spawn_action(
        &mut self,
        specs: &[ComponentSpec],
        sub_state: &str,
    ) -> Result<Action, SyncError> {
        let hash = self.core.registry_mut()?.generate_hash();
        Ok(Action::new(ADD_ENTITY)
            .with("hash", json!(hash.as_str()))
            .with("components", serde_json::to_value(specs)?)
            .with("subState", json!(sub_state)))
    }

    // -- dispatch -----------------------------------------------------------

    /// Queue an action for the next [`update`](Self::update).
    pub fn enqueue(&mut self, action: Action) -> Result<(), SyncError> {
        self.core.actions.dispatch(action)?;
        Ok(())
    }

    /// Apply an action now, record it in the history and notify observers.
    /// Returns the action's counter.
    pub fn dispatch(&mut self, action: Action) -> Result<u64, SyncError> {
        self.core.actions.dispatch_now(&action, &mut self.core.state)?;
        self.counter += 1;
        let counter = self.counter;
        self.history.push_back(HistoryEntry {
            counter,
            action: action.clone(),
            state_after: self.core.state.world().clone(),
        });
        self.notify(&action, counter, false);
        Ok(counter)
    }

    /// [`dispatch`](Self::dispatch) with an inverse used by
    /// [`rollback_actions`](Self::rollback_actions).
    pub fn dispatch_with_revert(&mut self, action: Action, revert: Action) -> Result<u64, SyncError> {
        revert.validate()?;
        self.dispatch(action.with_revert(revert))
    }

    fn notify(&mut self, action: &Action, counter: u64, unrolling: bool) {
        let ctx = DispatchContext { counter, unrolling };
        for (_, observer) in &mut self.observers {
            observer(action, ctx);
        }
    }

    // -- rollback -----------------------------------------------------------

    /// Snapshot-replace rollback.
    ///
    /// Restores the state recorded after the newest history entry at or
    /// before `counter` (the live state if none is retained), overlays
    /// `authoritative`, and drops every entry at or before `counter`. Newer
    /// entries stay for [`unroll`](Self::unroll).
    pub fn rollback(
        &mut self,
        counter: u64,
        authoritative: &BTreeMap<String, SerializedState>,
    ) -> Result<(), SyncError> {
        self.phase = SyncPhase::RollingBack;
        let result = self.rollback_inner(counter, authoritative);
        self.phase = SyncPhase::Live;
        result
    }

    fn rollback_inner(
        &mut self,
        counter: u64,
        authoritative: &BTreeMap<String, SerializedState>,
    ) -> Result<(), SyncError> {
        self.adopt_counter(counter);
        let base = self
            .history
            .iter()
            .rev()
            .find(|e| e.counter <= counter)
            .map(|e| e.state_after.clone());
        match base {
            Some(world) => self.core.state.restore_world(world),
            None => debug!(counter, "no history at or before counter, overlaying live state"),
        }
        let dropped = self.drop_through(counter);
        self.core.merge_entire_state(authoritative)?;
        debug!(counter, dropped, pending = self.history.len(), "rolled back to authoritative state");
        Ok(())
    }

    /// Action-revert rollback.
    ///
    /// Dispatches the revert of every entry newer than `counter`, newest
    /// first, then drops the entries at or before `counter`. Fails without
    /// touching state when any newer entry has no revert. Follow-ups raised
    /// by reverts are discarded.
    pub fn rollback_actions(&mut self, counter: u64) -> Result<usize, SyncError> {
        self.phase = SyncPhase::RollingBack;
        let result = self.rollback_actions_inner(counter);
        self.phase = SyncPhase::Live;
        result
    }

    fn rollback_actions_inner(&mut self, counter: u64) -> Result<usize, SyncError> {
        if let Some(entry) = self
            .history
            .iter()
            .find(|e| e.counter > counter && e.action.revert.is_none())
        {
            return Err(SyncError::MissingRevert {
                counter: entry.counter,
                action_type: entry.action.kind.clone(),
            });
        }
        self.adopt_counter(counter);

        let mut reverted = 0;
        for entry in self.history.iter().rev().filter(|e| e.counter > counter) {
            if let Some(revert) = &entry.action.revert {
                self.core.actions.replay_now(revert, &mut self.core.state)?;
                reverted += 1;
            }
        }
        let dropped = self.drop_through(counter);
        debug!(counter, reverted, dropped, "reverted actions newer than counter");
        Ok(reverted)
    }

    /// Re-apply every retained history entry in original order, refreshing
    /// the recorded states. Observers see `unrolling == true`.
    ///
    /// Follow-up actions raised by the entries were queued by the original
    /// [`dispatch`](Self::dispatch) and are not queued again.
    pub fn unroll(&mut self) -> Result<usize, SyncError> {
        self.phase = SyncPhase::Unrolling;
        let result = self.unroll_inner();
        self.phase = SyncPhase::Live;
        result
    }

    fn unroll_inner(&mut self) -> Result<usize, SyncError> {
        let mut entries = std::mem::take(&mut self.history);
        let mut replayed = 0;
        let mut outcome: Result<(), SyncError> = Ok(());
        for entry in entries.iter_mut() {
            if let Err(e) = self.core.actions.replay_now(&entry.action, &mut self.core.state) {
                outcome = Err(e.into());
                break;
            }
            entry.state_after = self.core.state.world().clone();
            self.notify(&entry.action, entry.counter, true);
            replayed += 1;
        }
        self.history = entries;
        outcome.map(|()| replayed)
    }

    fn adopt_counter(&mut self, counter: u64) {
        if counter > self.counter {
            debug!(local = self.counter, adopted = counter, "adopting authoritative counter");
            self.counter = counter;
        }
    }

    fn drop_through(&mut self, counter: u64) -> usize {
        let before = self.history.len();
        self.history.retain(|e| e.counter > counter);
        before - self.history.len()
    }

    // -- messaging ----------------------------------------------------------

    /// Queue an inbound message; it is handled at the next update.
    pub fn receive(&mut self, peer: PeerId, message: Message) {
        self.inbox.push_back(Envelope { peer, message });
    }

    /// Drain the messages produced since the last call.
    pub fn take_outgoing(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.core.outbox)
    }

    /// Publish an application event locally at the current tick and hand it
    /// to the role for forwarding.
    pub fn emit(&mut self, event_type: &str, payload: Value) -> Result<(), SyncError> {
        let event = EventRecord {
            kind: event_type.to_owned(),
            tick: self.core.tick,
            sid: None,
            payload,
        };
        self.core.events.enqueue(event.clone(), self.core.tick);
        self.role.on_emit(&mut self.core, event)
    }

    // -- tick ---------------------------------------------------------------

    /// Run one tick. Failures inside the tick are logged and counted in the
    /// report; they never stop the tick.
    pub fn update(&mut self) -> TickReport {
        let mut report = TickReport::default();
        while let Some(Envelope { peer, message }) = self.inbox.pop_front() {
            report.messages += 1;
            let kind = message.kind();
            if let Err(e) = self.role.on_message(&mut self.core, &peer, message) {
                report.message_errors += 1;
                warn!(tick = self.core.tick, peer = %peer, message = kind, error = %e, "message handling failed");
            }
        }

        // Read after the inbox: the role may have realigned the clock.
        let tick = self.core.tick;
        report.tick = tick;
        let core = &mut self.core;
        report.processors = core.processors.update(&mut core.state, core.actions.queue_mut());
        report.events = core.events.update(tick, core.actions.queue_mut());
        report.actions = core.actions.update(&mut core.state, tick);
        core.state.buffer_state(tick);

        if let Err(e) = self.role.after_update(&mut self.core) {
            warn!(tick, error = %e, "post-update role hook failed");
        }
        self.core.tick = tick + 1;
        report
    }

    // -- inspection ---------------------------------------------------------

    /// Every substate serialized, keyed by name.
    pub fn serialize(&self) -> BTreeMap<String, SerializedState> {
        self.core.state.get_state()
    }

    /// BLAKE3 hex digest of [`serialize`](Self::serialize). Equal digests
    /// on two replicas mean equal state.
    pub fn state_hash(&self) -> Result<String, SyncError> {
        let bytes = serde_json::to_vec(&self.serialize())?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

impl<R: Role + fmt::Debug> fmt::Debug for Orchestrator<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("core", &self.core)
            .field("role", &self.role)
            .field("counter", &self.counter)
            .field("history", &self.history.len())
            .field("phase", &self.phase)
            .field("observers", &self.observers.len())
            .field("inbox", &self.inbox.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::ServerRole;
    use std::cell::Cell;

    fn replica() -> Orchestrator<ServerRole> {
        let mut o = Orchestrator::new(SyncConfig::default(), ServerRole::new()).unwrap();
        o.register_component("count", |args| json!({ "n": args["n"] }));
        o.create_entity(&[ComponentSpec::new("count", json!({ "n": 0 }))], Some("c".into()))
            .unwrap();
        o.add_reducer(&["ADD"], |action, state, _| {
            let by = action.get("by").and_then(Value::as_i64).unwrap_or(0);
            let c = state.component_mut(&"c".into(), "count")?;
            let n = c.state()["n"].as_i64().unwrap_or(0);
            c.state_mut()["n"] = json!(n + by);
            Ok(())
        });
        o
    }

    fn add(by: i64) -> Action {
        Action::new("ADD").with("by", json!(by))
    }

    fn count(o: &Orchestrator<ServerRole>) -> i64 {
        o.state().component(&"c".into(), "count").unwrap().state()["n"]
            .as_i64()
            .unwrap()
    }

    #[test]
    fn dispatch_applies_immediately_and_counts() {
        let mut o = replica();
        assert_eq!(o.dispatch(add(2)).unwrap(), 1);
        assert_eq!(o.dispatch(add(3)).unwrap(), 2);
        assert_eq!(count(&o), 5);
        assert_eq!(o.history_counters(), vec![1, 2]);
    }

    #[test]
    fn dispatch_without_type_fails_fast() {
        let mut o = replica();
        let err = o.dispatch(Action::new("")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        assert_eq!(o.counter(), 0);
        assert_eq!(o.history_len(), 0);
    }

    #[test]
    fn update_runs_queued_actions_then_snapshots() {
        let mut o = replica();
        o.enqueue(add(4)).unwrap();
        let report = o.update();
        assert_eq!(report.tick, 0);
        assert_eq!(report.actions.dispatched, 1);
        assert_eq!(count(&o), 4);
        assert_eq!(o.state().buffered_ticks(), vec![0]);
        assert_eq!(o.tick(), 1);
    }

    #[test]
    fn builtin_reducers_add_and_remove_entities() {
        let mut o = replica();
        let spawn = o
            .spawn_action(&[ComponentSpec::new("count", json!({ "n": 9 }))], DEFAULT_SUB_STATE)
            .unwrap();
        let hash = EntityHash::from(spawn.get("hash").and_then(Value::as_str).unwrap());
        o.dispatch(spawn).unwrap();
        assert!(o.state().has_entity(&hash));

        o.dispatch(Action::new(REMOVE_ENTITY).with("hash", json!(hash.as_str())))
            .unwrap();
        assert!(!o.state().has_entity(&hash));
    }

    #[test]
    fn add_entity_without_components_is_rejected() {
        let mut o = replica();
        o.enqueue(Action::new(ADD_ENTITY).with("hash", json!("x"))).unwrap();
        let report = o.update();
        assert_eq!(report.actions.failed, 1);
        assert!(!o.state().has_entity(&"x".into()));
    }

    #[test]
    fn rollback_adopts_larger_counter() {
        let mut o = replica();
        o.dispatch(add(1)).unwrap();
        let snapshot = o.serialize();
        o.rollback(10, &snapshot).unwrap();
        assert_eq!(o.counter(), 10);
        assert_eq!(o.history_len(), 0);
        assert_eq!(o.dispatch(add(1)).unwrap(), 11);
    }

    #[test]
    fn rollback_actions_requires_every_revert() {
        let mut o = replica();
        o.dispatch(add(1)).unwrap();
        o.dispatch(add(2)).unwrap();
        let err = o.rollback_actions(1).unwrap_err();
        assert!(matches!(err, SyncError::MissingRevert { counter: 2, .. }));
        assert_eq!(count(&o), 3);
        assert_eq!(o.history_len(), 2);
    }

    #[test]
    fn rollback_actions_reverts_newest_first() {
        let mut o = replica();
        o.dispatch_with_revert(add(1), add(-1)).unwrap();
        o.dispatch_with_revert(add(2), add(-2)).unwrap();
        o.dispatch_with_revert(add(3), add(-3)).unwrap();

        assert_eq!(o.rollback_actions(1).unwrap(), 2);
        assert_eq!(count(&o), 1);
        assert_eq!(o.history_counters(), vec![2, 3]);

        assert_eq!(o.unroll().unwrap(), 2);
        assert_eq!(count(&o), 6);
    }

    #[test]
    fn observers_see_unrolling_flag() {
        let mut o = replica();
        let live = Rc::new(Cell::new(0));
        let replayed = Rc::new(Cell::new(0));
        let (l, r) = (Rc::clone(&live), Rc::clone(&replayed));
        o.observe(move |_, ctx| {
            if ctx.unrolling {
                r.set(r.get() + 1);
            } else {
                l.set(l.get() + 1);
            }
        });

        o.dispatch(add(1)).unwrap();
        let snapshot = o.serialize();
        o.dispatch(add(1)).unwrap();
        o.rollback(1, &snapshot).unwrap();
        o.unroll().unwrap();

        assert_eq!(live.get(), 2);
        assert_eq!(replayed.get(), 1);
        assert_eq!(o.phase(), SyncPhase::Live);
    }

    #[test]
    fn unobserve_stops_notifications() {
        let mut o = replica();
        let seen = Rc::new(Cell::new(0));
        let s = Rc::clone(&seen);
        let id = o.observe(move |_, _| s.set(s.get() + 1));
        o.dispatch(add(1)).unwrap();
        assert!(o.unobserve(id));
        o.dispatch(add(1)).unwrap();
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn state_hash_tracks_content() {
        let mut a = replica();
        let b = replica();
        assert_eq!(a.state_hash().unwrap(), b.state_hash().unwrap());
        a.dispatch(add(1)).unwrap();
        assert_ne!(a.state_hash().unwrap(), b.state_hash().unwrap());
        assert_eq!(a.state_hash().unwrap().len(), 64);
    }

    #[test]
    fn emitted_events_run_on_next_update() {
        let mut o = replica();
        o.subscribe("BUMP", |event, queue| {
            queue.dispatch(Action::new("ADD").with("by", event.payload["by"].clone()))
        });
        o.emit("BUMP", json!({ "by": 7 })).unwrap();
        assert_eq!(count(&o), 0);
        let report = o.update();
        assert_eq!(report.events.delivered, 1);
        assert_eq!(count(&o), 7);
    }
}
