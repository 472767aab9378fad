//! Role strategies plugged into an [`Orchestrator`](crate::orchestrator::Orchestrator).
//!
//! The orchestrator owns the tick loop; a [`Role`] supplies the protocol side
//! of a replica. [`ServerRole`] answers BUFFER/EVENT/ACKNOWLEDGE and sends a
//! full or delta UPDATE to each client after every tick. [`ClientRole`]
//! answers CONNECTION, reconciles every UPDATE against its own history and
//! forwards locally emitted events one at a time.

mod client;
mod server;

pub use client::ClientRole;
pub use server::{ClientInfo, ServerRole};

use crate::orchestrator::SyncCore;
use crate::protocol::{EventRecord, Message, PeerId};
use crate::SyncError;

/// Role-specific wiring around the shared tick loop.
pub trait Role {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Called once when the orchestrator is built.
    fn attach(&mut self, _core: &mut SyncCore) {}

    /// Handle one inbound message at the start of a tick.
    fn on_message(
        &mut self,
        core: &mut SyncCore,
        from: &PeerId,
        message: Message,
    ) -> Result<(), SyncError>;

    /// Runs after the tick's state has been buffered, before the tick
    /// advances.
    fn after_update(&mut self, _core: &mut SyncCore) -> Result<(), SyncError> {
        Ok(())
    }

    /// A locally emitted event, already queued for local delivery.
    fn on_emit(&mut self, _core: &mut SyncCore, _event: EventRecord) -> Result<(), SyncError> {
        Ok(())
    }
}

fn unexpected(role: &'static str, message: &Message) -> SyncError {
    SyncError::UnexpectedMessage {
        role,
        message: message.kind(),
    }
}
