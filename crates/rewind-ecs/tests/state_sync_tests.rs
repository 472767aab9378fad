//! Integration tests for snapshot history, delta/merge, replay and queries.

use rewind_ecs::prelude::*;
use serde_json::json;

// -- helpers ----------------------------------------------------------------

fn registry() -> ComponentRegistry {
    let mut r = ComponentRegistry::new(11);
    r.register("render", |args| json!({ "layer": args["layer"] }));
    r.register("transform", |args| json!({ "x": args["x"], "y": args["y"] }));
    r.register("physics", |_| json!({ "mass": 1 }));
    r
}

fn spawn(state: &mut StateManager, r: &mut ComponentRegistry, hash: &str, specs: &[ComponentSpec]) {
    let e = r.create_entity(specs, Some(hash.into())).unwrap();
    state.add_entity(e, DEFAULT_SUB_STATE);
}

fn render(layer: i64) -> ComponentSpec {
    ComponentSpec::new("render", json!({ "layer": layer }))
}

fn transform(x: i64, y: i64) -> ComponentSpec {
    ComponentSpec::new("transform", json!({ "x": x, "y": y }))
}

fn physics() -> ComponentSpec {
    ComponentSpec::new("physics", json!({}))
}

fn target(action: &Action) -> EntityHash {
    EntityHash::from(action.get("entity").and_then(|v| v.as_str()).unwrap_or(""))
}

/// MOVE sets x/y, RELAYER sets the render layer.
fn reducers(actions: &mut ActionManager) {
    actions.add_reducer(&["MOVE"], |action, state, _| {
        let t = state.component_mut(&target(action), "transform")?;
        t.state_mut()["x"] = action.get("x").cloned().unwrap_or_default();
        t.state_mut()["y"] = action.get("y").cloned().unwrap_or_default();
        Ok(())
    });
    actions.add_reducer(&["RELAYER"], |action, state, _| {
        let r = state.component_mut(&target(action), "render")?;
        r.state_mut()["layer"] = action.get("layer").cloned().unwrap_or_default();
        Ok(())
    });
}

fn mv(entity: &str, x: i64, y: i64) -> Action {
    Action::new("MOVE")
        .with("entity", json!(entity))
        .with("x", json!(x))
        .with("y", json!(y))
}

fn relayer(entity: &str, layer: i64) -> Action {
    Action::new("RELAYER")
        .with("entity", json!(entity))
        .with("layer", json!(layer))
}

// ---------------------------------------------------------------------------
// 1. Ring-buffer bound
// ---------------------------------------------------------------------------

#[test]
fn ten_updates_with_capacity_eight_retain_ticks_two_through_nine() {
    let mut state = StateManager::new();
    let mut actions = ActionManager::new();
    for tick in 0..10 {
        actions.dispatch(Action::new("NOOP")).unwrap();
        actions.update(&mut state, tick);
        state.buffer_state(tick);
    }
    let expected: Vec<Tick> = (2..10).collect();
    assert_eq!(state.buffered_ticks(), expected);
    assert_eq!(actions.buffered_ticks(), expected);
}

// ---------------------------------------------------------------------------
// 2. Replay determinism
// ---------------------------------------------------------------------------

#[test]
fn restore_then_replay_matches_direct_application() {
    let mut r = registry();
    let mut state = StateManager::new();
    spawn(&mut state, &mut r, "e", &[render(0), transform(0, 0)]);
    let mut actions = ActionManager::new();
    reducers(&mut actions);

    state.buffer_state(0);
    let script = [
        vec![mv("e", 1, 1)],
        vec![relayer("e", 3), mv("e", 2, 2)],
        vec![mv("e", 4, 5)],
    ];
    for (tick, batch) in script.iter().enumerate() {
        for a in batch {
            actions.dispatch(a.clone()).unwrap();
        }
        actions.update(&mut state, tick as Tick);
    }
    let direct = serde_json::to_vec(&state.serialize_state(DEFAULT_SUB_STATE).unwrap()).unwrap();

    state.restore_state(0).unwrap();
    actions.re_apply_from(0, &mut state).unwrap();
    let replayed = serde_json::to_vec(&state.serialize_state(DEFAULT_SUB_STATE).unwrap()).unwrap();

    assert_eq!(direct, replayed);
}

// ---------------------------------------------------------------------------
// 3. Delta correctness
// ---------------------------------------------------------------------------

#[test]
fn delta_contains_exactly_the_changed_entity() {
    let mut r = registry();
    let mut state = StateManager::new();
    spawn(&mut state, &mut r, "a", &[render(1)]);
    spawn(&mut state, &mut r, "b", &[render(1)]);
    state.buffer_state(0);

    state.component_mut(&"b".into(), "render").unwrap().state_mut()["layer"] = json!(2);
    let delta = state
        .get_delta_state(state.buffered_state(0).unwrap(), DEFAULT_SUB_STATE)
        .unwrap();

    assert_eq!(delta.len(), 1);
    assert_eq!(delta.entities[0].hash, EntityHash::from("b"));
    assert_eq!(delta.entities[0].components["render"], json!({ "layer": 2 }));
}

#[test]
fn delta_between_identical_content_is_empty() {
    let mut r = registry();
    let mut left = StateManager::new();
    let mut right = StateManager::new();
    for sm in [&mut left, &mut right] {
        spawn(sm, &mut r, "a", &[render(1), transform(3, 4)]);
    }
    let delta = left.get_delta_state(right.world(), DEFAULT_SUB_STATE).unwrap();
    assert!(delta.is_empty());
}

#[test]
fn delta_includes_entities_missing_from_other_view() {
    let mut r = registry();
    let mut state = StateManager::new();
    state.buffer_state(0);
    spawn(&mut state, &mut r, "new", &[render(1)]);

    let delta = state
        .get_delta_state(state.buffered_state(0).unwrap(), DEFAULT_SUB_STATE)
        .unwrap();
    assert_eq!(delta.len(), 1);
}

// ---------------------------------------------------------------------------
// 4. Merge idempotence
// ---------------------------------------------------------------------------

#[test]
fn merging_own_serialization_is_idempotent() {
    let mut r = registry();
    let mut state = StateManager::new();
    spawn(&mut state, &mut r, "a", &[render(1), transform(1, 2)]);
    spawn(&mut state, &mut r, "b", &[physics()]);

    let before = state.serialize_state(DEFAULT_SUB_STATE).unwrap();
    state.merge_state(&before, &mut r, DEFAULT_SUB_STATE).unwrap();
    let after = state.serialize_state(DEFAULT_SUB_STATE).unwrap();

    assert_eq!(before, after);
    assert!(serialized_state_equality(&before, &after));
}

#[test]
fn incoming_payload_wins_conflicts() {
    let mut r = registry();
    let mut local = StateManager::new();
    spawn(&mut local, &mut r, "a", &[render(1), transform(0, 0)]);

    let mut remote = StateManager::new();
    spawn(&mut remote, &mut r, "a", &[render(7)]);
    let payload = remote.serialize_state(DEFAULT_SUB_STATE).unwrap();

    local.merge_state(&payload, &mut r, DEFAULT_SUB_STATE).unwrap();
    let a = local.entity(&"a".into()).unwrap();
    assert_eq!(a.component("render").unwrap().state()["layer"], 7);
    assert!(!a.has_component("transform"));
    assert!(!local.has_component("transform"));
}

// ---------------------------------------------------------------------------
// 5. Query cache correctness
// ---------------------------------------------------------------------------

#[test]
fn query_cache_updates_only_after_next_refresh() {
    let mut r = registry();
    let mut state = StateManager::new();
    spawn(&mut state, &mut r, "e1", &[render(0)]);
    spawn(&mut state, &mut r, "e2", &[render(0), transform(0, 0)]);
    spawn(&mut state, &mut r, "e3", &[render(0), transform(0, 0), physics()]);

    let mut cache = QueryCache::new();
    cache.register("drawable", Family::new(&["render", "transform"], &["physics"]));
    cache.refresh(&mut state);
    assert_eq!(cache.cached("drawable").unwrap(), &[EntityHash::from("e2")]);

    let t = r.create_component("transform", &json!({ "x": 0, "y": 0 })).unwrap();
    state.add_component(&"e1".into(), t).unwrap();
    assert_eq!(cache.cached("drawable").unwrap(), &[EntityHash::from("e2")]);

    cache.refresh(&mut state);
    assert_eq!(
        cache.cached("drawable").unwrap(),
        &[EntityHash::from("e1"), EntityHash::from("e2")]
    );
}

#[test]
fn query_cache_tracks_restore_and_merge() {
    let mut r = registry();
    let mut state = StateManager::new();
    spawn(&mut state, &mut r, "e1", &[render(0)]);
    state.buffer_state(0);
    spawn(&mut state, &mut r, "e2", &[render(0)]);

    let mut cache = QueryCache::new();
    cache.register("r", Family::new(&["render"], &[]));
    assert_eq!(cache.entities("r", &mut state).unwrap().len(), 2);

    state.restore_state(0).unwrap();
    assert_eq!(cache.entities("r", &mut state).unwrap().len(), 1);

    let mut other = StateManager::new();
    spawn(&mut other, &mut r, "e9", &[render(4)]);
    state
        .merge_state(&other.serialize_state(DEFAULT_SUB_STATE).unwrap(), &mut r, DEFAULT_SUB_STATE)
        .unwrap();
    assert_eq!(cache.entities("r", &mut state).unwrap().len(), 2);
}

// ---------------------------------------------------------------------------
// 6. Action-buffer windowing
// ---------------------------------------------------------------------------

#[test]
fn action_batches_are_keyed_by_tick() {
    let mut state = StateManager::new();
    let mut actions = ActionManager::new();
    actions.dispatch(Action::new("A").with("n", json!(1))).unwrap();
    actions.dispatch(Action::new("A").with("n", json!(2))).unwrap();
    actions.update(&mut state, 0);
    actions.dispatch(Action::new("A").with("n", json!(3))).unwrap();
    actions.update(&mut state, 1);

    let t0 = actions.get_action_buffer(0).unwrap();
    assert_eq!(t0.len(), 2);
    assert_eq!(t0[0].get("n"), Some(&json!(1)));
    assert_eq!(t0[1].get("n"), Some(&json!(2)));
    assert_eq!(actions.get_action_buffer(1).unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// 7. Substates on the wire
// ---------------------------------------------------------------------------

#[test]
fn substates_serialize_independently() {
    let mut r = registry();
    let mut state = StateManager::new();
    spawn(&mut state, &mut r, "shared", &[render(0)]);
    spawn(&mut state, &mut r, "private", &[render(1)]);
    state.add_sub_state("client-1", &["private".into()]).unwrap();

    let default = state.serialize_state(DEFAULT_SUB_STATE).unwrap();
    let private = state.serialize_state("client-1").unwrap();
    assert_eq!(default.len(), 1);
    assert_eq!(private.entities[0].sub_state, "client-1");

    let everything = state.get_state();
    assert_eq!(everything.len(), 2);
}
