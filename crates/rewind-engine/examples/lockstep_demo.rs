//! Headless sync demo -- one server, two predicting clients, in-memory wire.
//!
//! Run with:
//!   cargo run --example lockstep_demo -p rewind-engine
//!
//! Set `RUST_LOG=debug` to watch reconciliation, deltas and event gating.

use std::collections::VecDeque;

use rewind_engine::prelude::*;
use serde_json::{json, Value};

const SERVER: &str = "server";
const TICKS: u64 = 40;
/// Rounds a message spends on the wire.
const LATENCY: usize = 2;

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// Queues a STEP for every entity with a position and a velocity.
struct Movement;

impl Processor for Movement {
    fn name(&self) -> &str {
        "movement"
    }

    fn family(&self) -> Family {
        Family::new(&["position", "velocity"], &["frozen"])
    }

    fn update(
        &mut self,
        entities: &[EntityHash],
        _state: &StateManager,
        queue: &mut ActionQueue,
    ) -> Result<(), EcsError> {
        for hash in entities {
            queue.dispatch(Action::new("STEP").with("entity", json!(hash.as_str())))?;
        }
        Ok(())
    }
}

fn entity_of(action: &Action) -> EntityHash {
    EntityHash::from(action.get("entity").and_then(Value::as_str).unwrap_or(""))
}

fn install<R: Role>(replica: &mut Orchestrator<R>) {
    replica.register_component("position", |args| json!({ "x": args["x"], "y": args["y"] }));
    replica.register_component("velocity", |args| json!({ "dx": args["dx"], "dy": args["dy"] }));
    replica.add_processor(Box::new(Movement));

    replica.add_reducer(&["STEP"], |action, state, _| {
        let hash = entity_of(action);
        let v = state.component(&hash, "velocity")?.state().clone();
        let p = state.component_mut(&hash, "position")?;
        for (axis, delta) in [("x", "dx"), ("y", "dy")] {
            let now = p.state()[axis].as_i64().unwrap_or(0);
            p.state_mut()[axis] = json!(now + v[delta].as_i64().unwrap_or(0));
        }
        Ok(())
    });
    replica.add_reducer(&["THRUST"], |action, state, _| {
        let v = state.component_mut(&entity_of(action), "velocity")?;
        v.state_mut()["dx"] = action.get("dx").cloned().unwrap_or_default();
        Ok(())
    });
    replica.subscribe("THRUST_REQUEST", |event, queue| {
        queue.dispatch(
            Action::new("THRUST")
                .with("entity", event.payload["entity"].clone())
                .with("dx", event.payload["dx"].clone()),
        )
    });
}

// ---------------------------------------------------------------------------
// Wire
// ---------------------------------------------------------------------------

/// Messages in flight, delivered `LATENCY` rounds after being sent.
#[derive(Default)]
struct Wire {
    in_flight: VecDeque<Vec<(PeerId, Envelope)>>,
}

impl Wire {
    fn send(&mut self, batch: Vec<(PeerId, Envelope)>) {
        self.in_flight.push_back(batch);
    }

    fn arrivals(&mut self) -> Vec<(PeerId, Envelope)> {
        if self.in_flight.len() > LATENCY {
            self.in_flight.pop_front().unwrap_or_default()
        } else {
            Vec::new()
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let config = SyncConfig::from_json(r#"{ "client_buffer_size": 16, "hash_seed": 7 }"#)?;

    let mut server = Orchestrator::new(config.clone(), ServerRole::new())?;
    install(&mut server);
    let ship = server.create_entity(
        &[
            ComponentSpec::new("position", json!({ "x": 0, "y": 0 })),
            ComponentSpec::new("velocity", json!({ "dx": 1, "dy": 0 })),
        ],
        None,
    )?;

    let mut clients = Vec::new();
    for name in ["alice", "bob"] {
        let mut client = Orchestrator::client(config.clone(), SERVER.into())?;
        install(&mut client);
        server.add_client(name.into());
        clients.push((PeerId::from(name), client));
    }

    let mut wire = Wire::default();
    for tick in 0..TICKS {
        if tick == 10 {
            clients[0]
                .1
                .emit("THRUST_REQUEST", json!({ "entity": ship.as_str(), "dx": 3 }))?;
        }
        if tick == 20 {
            clients[1]
                .1
                .emit("THRUST_REQUEST", json!({ "entity": ship.as_str(), "dx": -2 }))?;
        }

        for (from, envelope) in wire.arrivals() {
            if envelope.peer.as_str() == SERVER {
                server.receive(from, envelope.message);
            } else if let Some((_, client)) = clients.iter_mut().find(|(id, _)| *id == envelope.peer) {
                client.receive(from, envelope.message);
            }
        }

        server.update();
        let mut batch: Vec<(PeerId, Envelope)> = server
            .take_outgoing()
            .into_iter()
            .map(|e| (PeerId::from(SERVER), e))
            .collect();
        for (id, client) in &mut clients {
            client.update();
            batch.extend(client.take_outgoing().into_iter().map(|e| (id.clone(), e)));
        }
        wire.send(batch);
    }

    // Let the wire drain so every replica sees the last authoritative state.
    for _ in 0..=LATENCY + 1 {
        for (from, envelope) in wire.arrivals() {
            if let Some((_, client)) = clients.iter_mut().find(|(id, _)| *id == envelope.peer) {
                client.receive(from, envelope.message);
            }
        }
        for (_, client) in &mut clients {
            client.update();
            client.take_outgoing();
        }
        wire.send(Vec::new());
    }

    let position = server.state().component(&ship, "position")?.state().clone();
    println!("server   tick {:>3}  position {}", server.tick(), position);
    println!(
        "         full updates {}, delta updates {}",
        server.role().full_updates(),
        server.role().delta_updates()
    );
    for (id, client) in &clients {
        let position = client.state().component(&ship, "position")?.state().clone();
        println!(
            "{:<8} tick {:>3}  position {}  stale updates {}  action fallbacks {}",
            id.as_str(),
            client.tick(),
            position,
            client.role().stale_updates(),
            client.actions().fallback_count()
        );
    }
    Ok(())
}
