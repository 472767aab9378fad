//! Predicting client.
//!
//! The client simulates ahead of the server. Every UPDATE is reconciled by
//! restoring the snapshot at the last acknowledged tick, merging the server's
//! state on top, buffering that as the authoritative snapshot for the
//! update's tick, and replaying the locally archived action batches that came
//! after it.

use std::collections::VecDeque;

use tracing::{debug, warn};

use rewind_ecs::prelude::{EcsError, SerializedState, Tick, DEFAULT_SUB_STATE};

use super::{unexpected, Role};
use crate::config::SyncConfig;
use crate::orchestrator::{Orchestrator, SyncCore};
use crate::protocol::{EventRecord, Message, PeerId};
use crate::SyncError;

/// Client side of the protocol.
#[derive(Debug)]
pub struct ClientRole {
    server: PeerId,
    last_ack: Option<Tick>,
    pending_events: VecDeque<EventRecord>,
    event_in_flight: bool,
    stale_updates: u64,
}

impl ClientRole {
    pub fn new(server: PeerId) -> Self {
        Self {
            server,
            last_ack: None,
            pending_events: VecDeque::new(),
            event_in_flight: false,
            stale_updates: 0,
        }
    }

    pub fn server(&self) -> &PeerId {
        &self.server
    }

    /// Tick of the newest UPDATE incorporated.
    pub fn last_ack(&self) -> Option<Tick> {
        self.last_ack
    }

    /// Events waiting behind the one in flight.
    pub fn queued_events(&self) -> usize {
        self.pending_events.len()
    }

    pub fn event_in_flight(&self) -> bool {
        self.event_in_flight
    }

    /// UPDATEs ignored because they predate the last acknowledgement.
    pub fn stale_updates(&self) -> u64 {
        self.stale_updates
    }

    fn send_next_event(&mut self, core: &mut SyncCore) {
        if self.event_in_flight {
            return;
        }
        if let Some(event) = self.pending_events.pop_front() {
            self.event_in_flight = true;
            core.send(self.server.clone(), Message::Event { event });
        }
    }

    fn reconcile(
        &mut self,
        core: &mut SyncCore,
        tick: Tick,
        state: SerializedState,
    ) -> Result<(), SyncError> {
        let previous = self.last_ack;
        if let Some(ack) = previous {
            if tick < ack {
                self.stale_updates += 1;
                warn!(tick, last_ack = ack, "ignoring stale update");
                return Ok(());
            }
            if let Err(e) = core.state.restore_state(ack) {
                warn!(tick, last_ack = ack, error = %e, "could not restore acknowledged state");
            }
        }

        core.merge_state(&state, DEFAULT_SUB_STATE)?;
        core.state.buffer_state(tick);

        let next = tick + 1;
        if next < core.tick() {
            match core.actions.re_apply_from(next, &mut core.state) {
                Ok(report) => debug!(from = next, replayed = report.dispatched, "replayed local actions"),
                Err(EcsError::NoBufferedActions { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            core.set_tick(next);
        }

        self.last_ack = Some(tick);
        core.send(self.server.clone(), Message::Acknowledge { tick: Some(tick) });

        if previous.map_or(true, |ack| tick > ack) {
            self.event_in_flight = false;
            self.send_next_event(core);
        }
        Ok(())
    }
}

impl Role for ClientRole {
    fn name(&self) -> &'static str {
        "client"
    }

    fn attach(&mut self, core: &mut SyncCore) {
        let size = core.config().client_buffer_size;
        core.set_buffer_sizes(size);
    }

    fn on_message(
        &mut self,
        core: &mut SyncCore,
        from: &PeerId,
        message: Message,
    ) -> Result<(), SyncError> {
        if *from != self.server {
            return Err(SyncError::UnknownPeer { peer: from.clone() });
        }
        match message {
            Message::Connection => {
                let depth = core.config().requested_depth();
                core.send(self.server.clone(), Message::Buffer { depth });
                core.send(
                    self.server.clone(),
                    Message::Acknowledge {
                        tick: self.last_ack,
                    },
                );
            }
            Message::Acknowledge { tick: Some(tick) } if self.last_ack.is_none() => {
                debug!(from = core.tick(), to = tick, "aligning clock with server");
                core.set_tick(tick);
            }
            Message::Acknowledge { .. } => {}
            Message::Update { tick, state } => self.reconcile(core, tick, state)?,
            other @ (Message::Buffer { .. } | Message::Event { .. }) => {
                return Err(unexpected(self.name(), &other));
            }
        }
        Ok(())
    }

    fn on_emit(&mut self, core: &mut SyncCore, event: EventRecord) -> Result<(), SyncError> {
        self.pending_events.push_back(event);
        self.send_next_event(core);
        Ok(())
    }
}

impl Orchestrator<ClientRole> {
    /// Build a client of `server`.
    pub fn client(config: SyncConfig, server: PeerId) -> Result<Self, SyncError> {
        Self::new(config, ClientRole::new(server))
    }
}
