//! Rewind ECS -- entity-component state with tick history and replay.
//!
//! This crate holds the single-threaded core of the Rewind runtime:
//!
//! - [`state::StateManager`]: canonical entities, named substates, a bounded
//!   snapshot history, and serialize / merge / delta over the wire format in
//!   [`snapshot`].
//! - [`action::ActionManager`]: a double-buffered action queue, reducers, a
//!   bounded per-tick action history, and replay from a tick.
//! - [`query::QueryCache`] and [`processor::ProcessorManager`]: per-consumer
//!   component queries that are invalidated by structural changes and
//!   recomputed lazily.
//!
//! # Quick Start
//!
//! ```
//! use rewind_ecs::prelude::*;
//! use serde_json::json;
//!
//! let mut registry = ComponentRegistry::new(7);
//! registry.register("position", |args| json!({ "x": args["x"], "y": args["y"] }));
//!
//! let mut state = StateManager::new();
//! let entity = registry
//!     .create_entity(&[ComponentSpec::new("position", json!({ "x": 0, "y": 0 }))], None)
//!     .unwrap();
//! let hash = entity.hash().clone();
//! state.add_entity(entity, DEFAULT_SUB_STATE);
//!
//! let mut actions = ActionManager::new();
//! actions.add_reducer(&["MOVE"], |action, state, _| {
//!     let target = EntityHash::from(action.get("entity").and_then(|v| v.as_str()).unwrap_or(""));
//!     let position = state.component_mut(&target, "position")?;
//!     position.state_mut()["x"] = action.get("x").cloned().unwrap_or_default();
//!     Ok(())
//! });
//!
//! actions
//!     .dispatch(Action::new("MOVE").with("entity", json!(hash.as_str())).with("x", json!(4)))
//!     .unwrap();
//! actions.update(&mut state, 0);
//! state.buffer_state(0);
//!
//! assert_eq!(state.component(&hash, "position").unwrap().state()["x"], 4);
//! ```

#![deny(unsafe_code)]

pub mod action;
pub mod buffer;
pub mod component;
pub mod entity;
pub mod processor;
pub mod query;
pub mod snapshot;
pub mod state;

/// Discrete simulation step.
pub type Tick = u64;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Broad category of an [`EcsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input from the caller. Fix the call site.
    ContractViolation,
    /// Unknown id, index or registration. Guard with an existence check
    /// where absence is expected.
    NotFound,
}

/// Errors produced by state, action and query operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity id is not tracked.
    #[error("entity '{entity}' is not tracked by the state manager")]
    EntityNotFound { entity: entity::EntityHash },

    /// The entity exists but does not hold the component.
    #[error("entity '{entity}' has no component '{component}'")]
    ComponentNotFound {
        entity: entity::EntityHash,
        component: String,
    },

    /// No entity currently holds the component.
    #[error("no entity holds component '{component}'")]
    ComponentIndexNotFound { component: String },

    /// The substate has never been created.
    #[error("substate '{name}' does not exist")]
    SubStateNotFound { name: String },

    /// The entity is tracked but lives in a different substate.
    #[error("entity '{entity}' is not in substate '{sub_state}'")]
    EntityNotInSubState {
        entity: entity::EntityHash,
        sub_state: String,
    },

    /// A component name was referenced that has no registered constructor.
    #[error("component type '{name}' not registered. Registered components: [{registered}]")]
    UnknownComponent { name: String, registered: String },

    /// Component state is not a JSON object, or the name is empty.
    #[error("malformed component '{name}': {details}")]
    MalformedComponent { name: String, details: String },

    /// An action has no `type`.
    #[error("action is missing its 'type'")]
    MissingActionType,

    /// An action record could not be parsed.
    #[error("malformed action: {details}")]
    MalformedAction { details: String },

    /// A reducer refused to apply an action.
    #[error("action '{action_type}' rejected: {reason}")]
    ActionRejected { action_type: String, reason: String },

    /// The type has reducers, but not this one.
    #[error("{reducer} is not registered for action type '{action_type}'")]
    ReducerNotFound { action_type: String, reducer: String },

    /// A query consumer was used before being registered.
    #[error("query consumer '{consumer}' is not registered")]
    UnknownConsumer { consumer: String },

    /// A restore was requested while no snapshot is buffered.
    #[error("no state buffered (requested tick {tick})")]
    NoBufferedState { tick: Tick },

    /// A replay was requested while no action batch is buffered.
    #[error("no actions buffered (requested tick {tick})")]
    NoBufferedActions { tick: Tick },
}

impl EcsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EcsError::MalformedComponent { .. }
            | EcsError::MissingActionType
            | EcsError::MalformedAction { .. }
            | EcsError::ActionRejected { .. }
            | EcsError::UnknownConsumer { .. } => ErrorKind::ContractViolation,
            EcsError::EntityNotFound { .. }
            | EcsError::ComponentNotFound { .. }
            | EcsError::ComponentIndexNotFound { .. }
            | EcsError::SubStateNotFound { .. }
            | EcsError::EntityNotInSubState { .. }
            | EcsError::UnknownComponent { .. }
            | EcsError::ReducerNotFound { .. }
            | EcsError::NoBufferedState { .. }
            | EcsError::NoBufferedActions { .. } => ErrorKind::NotFound,
        }
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::action::{Action, ActionManager, ActionQueue, DispatchReport, Reducer, ReducerId};
    pub use crate::buffer::{TickBuffer, DEFAULT_BUFFER_SIZE};
    pub use crate::component::{Component, ComponentRegistry, ComponentSpec, Lifecycle};
    pub use crate::entity::{Entity, EntityHash, HashGenerator};
    pub use crate::processor::{Processor, ProcessorManager, ProcessorReport};
    pub use crate::query::{difference, intersect, Comparator, Family, QueryCache};
    pub use crate::snapshot::{
        serialized_state_equality, SerializedEntity, SerializedState, DEFAULT_SUB_STATE,
    };
    pub use crate::state::{StateManager, StructuralChange, WorldState};
    pub use crate::{EcsError, ErrorKind, Tick};
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
