//! Rewind Engine -- tick orchestration, rollback and client/server sync.
//!
//! This crate builds on [`rewind_ecs`] to drive a replica: the
//! [`Orchestrator`](orchestrator::Orchestrator) runs the per-tick update
//! (inbound messages, processors, events, actions, snapshot), keeps a
//! counter-stamped dispatch history for rollback and unroll, and delegates
//! protocol handling to a [`Role`](role::Role) strategy, either
//! [`ServerRole`](role::ServerRole) or [`ClientRole`](role::ClientRole).
//!
//! # Quick Start
//!
//! ```
//! use rewind_engine::prelude::*;
//! use serde_json::json;
//!
//! let mut server = Orchestrator::new(SyncConfig::default(), ServerRole::new()).unwrap();
//! server.register_component("position", |args| json!({ "x": args["x"] }));
//!
//! let spawn = server
//!     .spawn_action(&[ComponentSpec::new("position", json!({ "x": 1 }))], DEFAULT_SUB_STATE)
//!     .unwrap();
//! server.enqueue(spawn).unwrap();
//! server.update();
//!
//! assert_eq!(server.state().entity_count(), 1);
//! assert_eq!(server.tick(), 1);
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod events;
pub mod orchestrator;
pub mod protocol;
pub mod role;

use rewind_ecs::prelude::{EcsError, ErrorKind};

use crate::protocol::PeerId;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the ECS crate for convenience.
pub use rewind_ecs;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by the orchestrator, the roles and configuration.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Ecs(#[from] EcsError),

    /// JSON encoding or decoding failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// A message arrived from a peer the role does not know.
    #[error("unknown peer '{peer}'")]
    UnknownPeer { peer: PeerId },

    /// The role never accepts this message type.
    #[error("{role} does not accept {message} messages")]
    UnexpectedMessage {
        role: &'static str,
        message: &'static str,
    },

    /// An action-revert rollback hit a history entry without an inverse.
    #[error("history entry {counter} ('{action_type}') has no revert action")]
    MissingRevert { counter: u64, action_type: String },

    /// The component registry was borrowed while a reducer held it.
    #[error("component registry is already in use")]
    RegistryBusy,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Ecs(e) => e.kind(),
            SyncError::UnknownPeer { .. } => ErrorKind::NotFound,
            SyncError::Serialization(_)
            | SyncError::Config { .. }
            | SyncError::UnexpectedMessage { .. }
            | SyncError::MissingRevert { .. }
            | SyncError::RegistryBusy => ErrorKind::ContractViolation,
        }
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    pub use rewind_ecs::prelude::*;

    pub use crate::config::SyncConfig;
    pub use crate::events::{EventHandler, EventManager, EventReport, SubscriptionId};
    pub use crate::orchestrator::{
        DispatchContext, ObserverId, Orchestrator, SyncCore, SyncPhase, TickReport, ADD_ENTITY,
        REMOVE_ENTITY,
    };
    pub use crate::protocol::{Envelope, EventRecord, Message, PeerId};
    pub use crate::role::{ClientInfo, ClientRole, Role, ServerRole};
    pub use crate::SyncError;
}
