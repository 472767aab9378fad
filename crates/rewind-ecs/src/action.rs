//! Actions, reducers, and the per-tick action history.
//!
//! An [`Action`] is a tagged JSON record `{ "type": ..., ...payload }`.
//! Actions are queued on the [`ActionManager`] and, at each tick boundary,
//! moved into a tick-keyed history and handed to every reducer registered for
//! their type, in arrival order.
//!
//! # Double buffering
//!
//! [`ActionManager::update`] swaps the active queue out before dispatching.
//! Anything a reducer dispatches lands in the fresh queue and is processed on
//! the *next* update, which bounds synchronous recursion to one hop per tick.
//!
//! # Replay
//!
//! [`ActionManager::re_apply_from`] re-dispatches archived batches from a
//! tick onward. Actions dispatched by reducers during replay are discarded:
//! they were already archived under the tick that originally processed them.
//!
//! # Example
//!
//! ```
//! use rewind_ecs::prelude::*;
//! use serde_json::json;
//!
//! let mut state = StateManager::new();
//! state.add_entity(
//!     Entity::new("p").with_component(Component::new("score", json!({ "n": 0 })).unwrap()),
//!     DEFAULT_SUB_STATE,
//! );
//!
//! let mut actions = ActionManager::new();
//! actions.add_reducer(&["SCORE"], |action, state, _queue| {
//!     let by = action.get("by").and_then(|v| v.as_i64()).unwrap_or(0);
//!     let score = state.component_mut(&"p".into(), "score")?;
//!     let n = score.state()["n"].as_i64().unwrap_or(0);
//!     score.state_mut()["n"] = json!(n + by);
//!     Ok(())
//! });
//!
//! actions.dispatch(Action::new("SCORE").with("by", json!(3))).unwrap();
//! actions.update(&mut state, 0);
//! assert_eq!(state.component(&"p".into(), "score").unwrap().state()["n"], 3);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::buffer::{TickBuffer, DEFAULT_BUFFER_SIZE};
use crate::state::StateManager;
use crate::{EcsError, Tick};

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// A tagged command record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    /// Application-supplied inverse, used by action-based rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert: Option<Box<Action>>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Action {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            revert: None,
            payload: Map::new(),
        }
    }

    /// Builder-style payload field.
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_owned(), value);
        self
    }

    pub fn with_revert(mut self, revert: Action) -> Self {
        self.revert = Some(Box::new(revert));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Parse an untyped JSON record, failing fast when `type` is missing.
    pub fn from_value(value: Value) -> Result<Self, EcsError> {
        match value.get("type") {
            Some(Value::String(kind)) if !kind.is_empty() => {}
            _ => return Err(EcsError::MissingActionType),
        }
        serde_json::from_value(value).map_err(|e| EcsError::MalformedAction {
            details: e.to_string(),
        })
    }

    /// Fail fast on an action without a type.
    pub fn validate(&self) -> Result<(), EcsError> {
        if self.kind.is_empty() {
            return Err(EcsError::MissingActionType);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ActionQueue
// ---------------------------------------------------------------------------

/// The active front buffer. Reducers, processors and event handlers receive
/// one of these to dispatch follow-up actions.
#[derive(Debug, Default, Clone)]
pub struct ActionQueue {
    pending: Vec<Action>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an action. Fails fast when it has no type.
    pub fn dispatch(&mut self, action: Action) -> Result<(), EcsError> {
        action.validate()?;
        self.pending.push(action);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn as_slice(&self) -> &[Action] {
        &self.pending
    }

    /// Take every queued action, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.pending)
    }
}

// ---------------------------------------------------------------------------
// Reducers
// ---------------------------------------------------------------------------

/// Applies one action to canonical state. May queue follow-up actions.
pub type Reducer = Rc<dyn Fn(&Action, &mut StateManager, &mut ActionQueue) -> Result<(), EcsError>>;

/// Handle returned by [`ActionManager::add_reducer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReducerId(u64);

impl fmt::Display for ReducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reducer#{}", self.0)
    }
}

/// Outcome of dispatching a batch of actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Actions handed to at least one reducer.
    pub dispatched: usize,
    /// Actions whose type had no reducer (silently tolerated).
    pub unhandled: usize,
    /// Reducer invocations that returned an error.
    pub failed: usize,
}

impl DispatchReport {
    pub fn merge(&mut self, other: DispatchReport) {
        self.dispatched += other.dispatched;
        self.unhandled += other.unhandled;
        self.failed += other.failed;
    }
}

// ---------------------------------------------------------------------------
// ActionManager
// ---------------------------------------------------------------------------

/// Double-buffered action queue, reducer registry and per-tick history.
pub struct ActionManager {
    queue: ActionQueue,
    reducers: BTreeMap<String, Vec<(ReducerId, Reducer)>>,
    history: TickBuffer<Vec<Action>>,
    next_reducer: u64,
    fallback_count: u64,
}

impl ActionManager {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// A manager retaining `size` ticks of action history.
    pub fn with_buffer_size(size: usize) -> Self {
        Self {
            queue: ActionQueue::new(),
            reducers: BTreeMap::new(),
            history: TickBuffer::new(size),
            next_reducer: 0,
            fallback_count: 0,
        }
    }

    // -- reducers -----------------------------------------------------------

    /// Register `reducer` for every type in `kinds`.
    pub fn add_reducer(
        &mut self,
        kinds: &[&str],
        reducer: impl Fn(&Action, &mut StateManager, &mut ActionQueue) -> Result<(), EcsError> + 'static,
    ) -> ReducerId {
        let id = ReducerId(self.next_reducer);
        self.next_reducer += 1;
        let reducer: Reducer = Rc::new(reducer);
        for kind in kinds {
            self.reducers
                .entry((*kind).to_owned())
                .or_default()
                .push((id, reducer.clone()));
        }
        id
    }

    /// Unregister `id` from every type in `kinds`.
    ///
    /// Types with no reducers at all are skipped. A type that has reducers
    /// but not this one is an error, and nothing is removed.
    pub fn remove_reducer(&mut self, id: ReducerId, kinds: &[&str]) -> Result<(), EcsError> {
        for kind in kinds {
            if let Some(list) = self.reducers.get(*kind) {
                if !list.iter().any(|(rid, _)| *rid == id) {
                    return Err(EcsError::ReducerNotFound {
                        action_type: (*kind).to_owned(),
                        reducer: id.to_string(),
                    });
                }
            }
        }
        for kind in kinds {
            if let Some(list) = self.reducers.get_mut(*kind) {
                list.retain(|(rid, _)| *rid != id);
                if list.is_empty() {
                    self.reducers.remove(*kind);
                }
            }
        }
        Ok(())
    }

    pub fn reducer_count(&self, kind: &str) -> usize {
        self.reducers.get(kind).map_or(0, Vec::len)
    }

    // -- dispatch -----------------------------------------------------------

    /// Queue an action for the next update.
    pub fn dispatch(&mut self, action: Action) -> Result<(), EcsError> {
        self.queue.dispatch(action)
    }

    /// Actions waiting for the next update.
    pub fn queued_actions(&self) -> &[Action] {
        self.queue.as_slice()
    }

    /// Mutable access to the active queue.
    pub fn queue_mut(&mut self) -> &mut ActionQueue {
        &mut self.queue
    }

    /// Apply one action immediately, bypassing the queue and the history.
    /// Follow-up actions land in the active queue.
    pub fn dispatch_now(
        &mut self,
        action: &Action,
        state: &mut StateManager,
    ) -> Result<DispatchReport, EcsError> {
        action.validate()?;
        Ok(apply(&self.reducers, action, state, &mut self.queue))
    }

    /// [`dispatch_now`](Self::dispatch_now) for an action whose follow-ups
    /// were already queued once. They are discarded, as in
    /// [`re_apply_from`](Self::re_apply_from).
    pub fn replay_now(
        &mut self,
        action: &Action,
        state: &mut StateManager,
    ) -> Result<DispatchReport, EcsError> {
        action.validate()?;
        let mut scratch = ActionQueue::new();
        let report = apply(&self.reducers, action, state, &mut scratch);
        if !scratch.is_empty() {
            debug!(action = %action.kind, discarded = scratch.len(), "dropped follow-up actions raised during replay");
        }
        Ok(report)
    }

    /// Swap the active queue, archive its contents under `tick`, and
    /// dispatch them in arrival order.
    pub fn update(&mut self, state: &mut StateManager, tick: Tick) -> DispatchReport {
        let batch = self.queue.drain();
        let mut report = DispatchReport::default();
        for action in &batch {
            report.merge(apply(&self.reducers, action, state, &mut self.queue));
        }
        debug!(
            tick,
            actions = batch.len(),
            follow_ups = self.queue.len(),
            "dispatched action batch"
        );
        if let Some((evicted, _)) = self.history.push(tick, batch) {
            debug!(tick, evicted, "action buffer evicted oldest batch");
        }
        report
    }

    /// Re-dispatch every archived batch from `tick` through the newest one.
    ///
    /// An evicted `tick` falls back to the oldest retained batch; the
    /// fallback is counted and logged.
    pub fn re_apply_from(
        &mut self,
        tick: Tick,
        state: &mut StateManager,
    ) -> Result<DispatchReport, EcsError> {
        let (oldest, _) = self
            .history
            .oldest()
            .ok_or(EcsError::NoBufferedActions { tick })?;
        let start = if tick < oldest {
            self.fallback_count += 1;
            warn!(
                requested = tick,
                replayed_from = oldest,
                fallbacks = self.fallback_count,
                "action tick not buffered, replaying from oldest batch"
            );
            oldest
        } else {
            tick
        };

        let mut scratch = ActionQueue::new();
        let mut report = DispatchReport::default();
        for (_, batch) in self.history.range_from(start) {
            for action in batch {
                report.merge(apply(&self.reducers, action, state, &mut scratch));
            }
        }
        if !scratch.is_empty() {
            debug!(discarded = scratch.len(), "dropped follow-up actions raised during replay");
        }
        Ok(report)
    }

    // -- history ------------------------------------------------------------

    /// The batch archived at `tick`, in dispatch order.
    pub fn get_action_buffer(&self, tick: Tick) -> Option<&[Action]> {
        self.history.get(tick).map(Vec::as_slice)
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

    /// How many replays fell back to the oldest batch.
    pub fn fallback_count(&self) -> u64 {
        self.fallback_count
    }
}

impl Default for ActionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ActionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionManager")
            .field("queued", &self.queue.len())
            .field("reducer_types", &self.reducers.keys().collect::<Vec<_>>())
            .field("buffered_ticks", &self.history.ticks())
            .field("fallback_count", &self.fallback_count)
            .finish()
    }
}

/// Run every reducer registered for `action.kind`. Failures are logged and
/// counted; later reducers and actions still run.
fn apply(
    reducers: &BTreeMap<String, Vec<(ReducerId, Reducer)>>,
    action: &Action,
    state: &mut StateManager,
    queue: &mut ActionQueue,
) -> DispatchReport {
    let mut report = DispatchReport::default();
    let Some(list) = reducers.get(&action.kind) else {
        report.unhandled = 1;
        return report;
    };
    report.dispatched = 1;
    for (id, reducer) in list {
        if let Err(e) = reducer(action, state, queue) {
            report.failed += 1;
            warn!(action = %action.kind, reducer = %id, error = %e, "reducer failed");
        }
    }
    report
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
