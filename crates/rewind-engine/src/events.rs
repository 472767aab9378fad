//! Tick-queued publish/subscribe for application events.
//!
//! Events are never delivered synchronously. [`EventManager::publish`] queues
//! the event under a tick, and [`EventManager::update`] delivers everything
//! due at or before the current tick to the subscribed handlers, which react
//! by dispatching actions.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde_json::Value;
use tracing::warn;

use rewind_ecs::prelude::{ActionQueue, EcsError, Tick};

use crate::protocol::EventRecord;

/// Reacts to one event by queueing actions.
pub type EventHandler = Rc<dyn Fn(&EventRecord, &mut ActionQueue) -> Result<(), EcsError>>;

/// Handle returned by [`EventManager::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Outcome of one delivery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct EventManager {
    listeners: BTreeMap<String, Vec<(SubscriptionId, EventHandler)>>,
    queue: BTreeMap<Tick, Vec<EventRecord>>,
    current_tick: Tick,
    next_id: u64,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        event_type: &str,
        handler: impl Fn(&EventRecord, &mut ActionQueue) -> Result<(), EcsError> + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.listeners
            .entry(event_type.to_owned())
            .or_default()
            .push((id, Rc::new(handler)));
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let mut found = false;
        self.listeners.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(sid, _)| *sid != id);
            found |= handlers.len() != before;
            !handlers.is_empty()
        });
        found
    }

    pub fn listener_count(&self, event_type: &str) -> usize {
        self.listeners.get(event_type).map_or(0, Vec::len)
    }

    /// Queue an event for delivery at `tick` (default: the current tick).
    pub fn publish(&mut self, event_type: &str, payload: Value, tick: Option<Tick>) {
        let tick = tick.unwrap_or(self.current_tick);
        self.enqueue(
            EventRecord {
                kind: event_type.to_owned(),
                tick,
                sid: None,
                payload,
            },
            tick,
        );
    }

    /// Queue an already-built record for delivery at `at`.
    pub fn enqueue(&mut self, event: EventRecord, at: Tick) {
        self.queue.entry(at).or_default().push(event);
    }

    /// Events still waiting for delivery.
    pub fn pending(&self) -> usize {
        self.queue.values().map(Vec::len).sum()
    }

    pub fn current_tick(&self) -> Tick {
        self.current_tick
    }

    /// Deliver every event queued at or before `tick`, oldest tick first.
    pub fn update(&mut self, tick: Tick, actions: &mut ActionQueue) -> EventReport {
        self.current_tick = tick;
        let later = self.queue.split_off(&tick.saturating_add(1));
        let due = std::mem::replace(&mut self.queue, later);

        let mut report = EventReport::default();
        for event in due.into_values().flatten() {
            let Some(handlers) = self.listeners.get(&event.kind) else {
                continue;
            };
            for (_, handler) in handlers {
                report.delivered += 1;
                if let Err(e) = handler(&event, actions) {
                    report.failed += 1;
                    warn!(event = %event.kind, tick, error = %e, "event handler failed");
                }
            }
        }
        report
    }
}

impl fmt::Debug for EventManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventManager")
            .field("event_types", &self.listeners.keys().collect::<Vec<_>>())
            .field("pending", &self.pending())
            .field("current_tick", &self.current_tick)
            .finish()
    }
}
