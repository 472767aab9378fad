//! Authoritative server.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use rewind_ecs::prelude::{SerializedState, Tick, DEFAULT_SUB_STATE};

use super::{unexpected, Role};
use crate::orchestrator::{Orchestrator, SyncCore};
use crate::protocol::{Message, PeerId};
use crate::SyncError;

/// What the server knows about one connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Highest tick the client reported as incorporated.
    pub last_ack: Option<Tick>,
    /// Replay depth requested in the client's BUFFER message.
    pub buffer_depth: Option<usize>,
    /// Substate serialized for this client.
    pub sub_state: String,
}

/// Server side of the protocol.
#[derive(Debug, Default)]
pub struct ServerRole {
    clients: BTreeMap<PeerId, ClientInfo>,
    full_updates: u64,
    delta_updates: u64,
}

impl ServerRole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self, peer: &PeerId) -> Option<&ClientInfo> {
        self.clients.get(peer)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// UPDATEs sent with the full substate.
    pub fn full_updates(&self) -> u64 {
        self.full_updates
    }

    /// UPDATEs sent as a delta.
    pub fn delta_updates(&self) -> u64 {
        self.delta_updates
    }

    /// Track a client and greet it with CONNECTION and the current tick.
    pub fn connect(&mut self, core: &mut SyncCore, peer: PeerId, sub_state: &str) {
        self.clients.insert(
            peer.clone(),
            ClientInfo {
                last_ack: None,
                buffer_depth: None,
                sub_state: sub_state.to_owned(),
            },
        );
        debug!(peer = %peer, sub_state, "client connected");
        core.send(peer.clone(), Message::Connection);
        core.send(
            peer,
            Message::Acknowledge {
                tick: Some(core.tick()),
            },
        );
    }

    pub fn disconnect(&mut self, core: &mut SyncCore, peer: &PeerId) -> Option<ClientInfo> {
        let info = self.clients.remove(peer)?;
        self.clamp_buffer(core);
        Some(info)
    }

    /// Shrink the state history to the smallest depth any client asked for.
    fn clamp_buffer(&self, core: &mut SyncCore) {
        let depth = self
            .clients
            .values()
            .filter_map(|c| c.buffer_depth)
            .min()
            .unwrap_or(core.config().state_buffer_size)
            .max(1);
        if depth != core.state.max_buffer_size() {
            debug!(depth, "clamping state buffer");
            core.state.set_max_buffer_size(depth);
        }
    }

    fn update_for(
        &self,
        core: &SyncCore,
        info: &ClientInfo,
        tick: Tick,
    ) -> Result<Option<(SerializedState, bool)>, SyncError> {
        let depth = info.buffer_depth.unwrap_or(core.state.max_buffer_size()) as Tick;
        let base = match info.last_ack {
            Some(ack) if tick < ack.saturating_add(depth) => core.state.buffered_state(ack),
            _ => None,
        };
        match base {
            Some(base) => {
                let delta = core.state.get_delta_state(base, &info.sub_state)?;
                Ok((!delta.is_empty()).then_some((delta, false)))
            }
            None => Ok(Some((core.state.serialize_state(&info.sub_state)?, true))),
        }
    }
}

impl Role for ServerRole {
    fn name(&self) -> &'static str {
        "server"
    }

    fn on_message(
        &mut self,
        core: &mut SyncCore,
        from: &PeerId,
        message: Message,
    ) -> Result<(), SyncError> {
        let Some(info) = self.clients.get_mut(from) else {
            return Err(SyncError::UnknownPeer { peer: from.clone() });
        };
        match message {
            Message::Buffer { depth } => {
                info.buffer_depth = Some(depth);
                self.clamp_buffer(core);
            }
            Message::Acknowledge { tick } => {
                info.last_ack = tick;
            }
            Message::Event { mut event } => {
                event.sid = Some(from.clone());
                let at = core.tick();
                debug!(peer = %from, event = %event.kind, client_tick = event.tick, at, "client event queued");
                core.events.enqueue(event, at);
            }
            other @ (Message::Connection | Message::Update { .. }) => {
                return Err(unexpected(self.name(), &other));
            }
        }
        Ok(())
    }

    fn after_update(&mut self, core: &mut SyncCore) -> Result<(), SyncError> {
        let tick = core.tick();
        let mut outgoing = Vec::with_capacity(self.clients.len());
        for (peer, info) in &self.clients {
            match self.update_for(core, info, tick) {
                Ok(Some((state, full))) => outgoing.push((peer.clone(), state, full)),
                Ok(None) => {}
                Err(e) => warn!(peer = %peer, tick, error = %e, "could not build update"),
            }
        }
        for (peer, state, full) in outgoing {
            if full {
                self.full_updates += 1;
            } else {
                self.delta_updates += 1;
            }
            core.send(peer, Message::Update { tick, state });
        }
        Ok(())
    }
}

impl Orchestrator<ServerRole> {
    /// Connect a client that receives the default substate.
    pub fn add_client(&mut self, peer: PeerId) {
        self.add_client_with_sub_state(peer, DEFAULT_SUB_STATE);
    }

    pub fn add_client_with_sub_state(&mut self, peer: PeerId, sub_state: &str) {
        let (core, role) = self.parts_mut();
        role.connect(core, peer, sub_state);
    }

    pub fn remove_client(&mut self, peer: &PeerId) -> Option<ClientInfo> {
        let (core, role) = self.parts_mut();
        role.disconnect(core, peer)
    }
}
