//! Wire representation of entity state.
//!
//! A [`SerializedState`] is what crosses the network:
//!
//! ```json
//! { "entities": [ { "hash": "a1B2c3D4", "components": { "render": { "layer": 1 } }, "subState": "default" } ] }
//! ```
//!
//! It is also the unit of comparison for divergence diagnosis; see
//! [`serialized_state_equality`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::EntityHash;

/// Name of the substate every state manager always has.
pub const DEFAULT_SUB_STATE: &str = "default";

/// One entity on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedEntity {
    pub hash: EntityHash,
    pub components: BTreeMap<String, Value>,
    #[serde(rename = "subState", default = "default_sub_state")]
    pub sub_state: String,
}

fn default_sub_state() -> String {
    DEFAULT_SUB_STATE.to_owned()
}

/// A full or delta view of one substate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SerializedState {
    pub entities: Vec<SerializedEntity>,
}

impl SerializedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entity(&self, hash: &EntityHash) -> Option<&SerializedEntity> {
        self.entities.iter().find(|e| &e.hash == hash)
    }

    /// Entities keyed by id. Later duplicates win, matching merge order.
    pub fn by_hash(&self) -> BTreeMap<&EntityHash, &SerializedEntity> {
        self.entities.iter().map(|e| (&e.hash, e)).collect()
    }
}

/// Structural equality of two serialized views.
///
/// Entity order on the wire carries no meaning, so entities are matched by id.
pub fn serialized_state_equality(a: &SerializedState, b: &SerializedState) -> bool {
    a.entities.len() == b.entities.len() && a.by_hash() == b.by_hash()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(hash: &str, layer: i64) -> SerializedEntity {
        SerializedEntity {
            hash: EntityHash::from(hash),
            components: BTreeMap::from([("render".to_owned(), json!({ "layer": layer }))]),
            sub_state: DEFAULT_SUB_STATE.to_owned(),
        }
    }

    #[test]
    fn wire_shape_uses_camel_case_sub_state() {
        let state = SerializedState {
            entities: vec![entity("e1", 1)],
        };
        let v = serde_json::to_value(&state).unwrap();
        assert_eq!(
            v,
            json!({ "entities": [ { "hash": "e1", "components": { "render": { "layer": 1 } }, "subState": "default" } ] })
        );
    }

    #[test]
    fn missing_sub_state_defaults() {
        let state: SerializedState =
            serde_json::from_value(json!({ "entities": [ { "hash": "x", "components": {} } ] }))
                .unwrap();
        assert_eq!(state.entities[0].sub_state, DEFAULT_SUB_STATE);
    }

    #[test]
    fn equality_ignores_entity_order() {
        let a = SerializedState {
            entities: vec![entity("e1", 1), entity("e2", 2)],
        };
        let b = SerializedState {
            entities: vec![entity("e2", 2), entity("e1", 1)],
        };
        assert!(serialized_state_equality(&a, &b));
    }

    #[test]
    fn equality_detects_changed_field() {
        let a = SerializedState {
            entities: vec![entity("e1", 1)],
        };
        let b = SerializedState {
            entities: vec![entity("e1", 3)],
        };
        assert!(!serialized_state_equality(&a, &b));
    }
}
