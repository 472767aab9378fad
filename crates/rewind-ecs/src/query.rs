//! Component-set predicates and the invalidation-driven query cache.
//!
//! A [`Family`] selects entities that hold every required component and none
//! of the forbidden ones. The [`QueryCache`] keeps one result per consumer and
//! never recomputes eagerly: structural changes drained from the
//! [`StateManager`] only mark affected results invalid, and the result is
//! recomputed at most once, on the next refresh or access.
//!
//! # Example
//!
//! ```
//! use rewind_ecs::prelude::*;
//! use serde_json::json;
//!
//! let mut state = StateManager::new();
//! for (hash, names) in [("a", vec!["render"]), ("b", vec!["render", "transform"])] {
//!     let mut e = Entity::new(hash);
//!     for n in names {
//!         e.add_component(Component::new(n, json!({})).unwrap());
//!     }
//!     state.add_entity(e, DEFAULT_SUB_STATE);
//! }
//!
//! let mut cache = QueryCache::new();
//! cache.register("draw", Family::new(&["render", "transform"], &[]));
//! let hits = cache.entities("draw", &mut state).unwrap();
//! assert_eq!(hits, &[EntityHash::from("b")]);
//! ```

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use tracing::trace;

use crate::entity::{Entity, EntityHash};
use crate::state::{StateManager, StructuralChange};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Set helpers
// ---------------------------------------------------------------------------

/// Ids present in both sets.
pub fn intersect(a: &BTreeSet<EntityHash>, b: &BTreeSet<EntityHash>) -> BTreeSet<EntityHash> {
    a.intersection(b).cloned().collect()
}

/// Ids of `a` not present in `b`.
pub fn difference(a: &BTreeSet<EntityHash>, b: &BTreeSet<EntityHash>) -> BTreeSet<EntityHash> {
    a.difference(b).cloned().collect()
}

// ---------------------------------------------------------------------------
// Family
// ---------------------------------------------------------------------------

/// Immutable (required, forbidden) component-name predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Family {
    required: BTreeSet<String>,
    forbidden: BTreeSet<String>,
}

impl Family {
    pub fn new(required: &[&str], forbidden: &[&str]) -> Self {
        Self {
            required: required.iter().map(|s| (*s).to_owned()).collect(),
            forbidden: forbidden.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    pub fn required(&self) -> &BTreeSet<String> {
        &self.required
    }

    pub fn forbidden(&self) -> &BTreeSet<String> {
        &self.forbidden
    }

    /// Whether an entity holding exactly `components` matches.
    pub fn matches(&self, components: &BTreeSet<String>) -> bool {
        self.required.is_subset(components) && self.forbidden.is_disjoint(components)
    }

    pub fn matches_entity(&self, entity: &Entity) -> bool {
        self.required.iter().all(|n| entity.has_component(n))
            && !self.forbidden.iter().any(|n| entity.has_component(n))
    }

    /// Evaluate against the component index of `state`.
    ///
    /// Narrows the full entity set through each required component's holders,
    /// short-circuiting to empty when one has no holders, then subtracts the
    /// holders of each forbidden component.
    pub fn compute(&self, state: &StateManager) -> BTreeSet<EntityHash> {
        let mut set = state.entity_set();
        for name in &self.required {
            match state.get_entities_by_component(name) {
                Ok(holders) => set = intersect(&set, holders),
                Err(_) => return BTreeSet::new(),
            }
            if set.is_empty() {
                return set;
            }
        }
        for name in &self.forbidden {
            if let Ok(holders) = state.get_entities_by_component(name) {
                set = difference(&set, holders);
            }
        }
        set
    }
}

// ---------------------------------------------------------------------------
// QueryCache
// ---------------------------------------------------------------------------

/// Total order over matched entities, consulted on each recomputation.
pub type Comparator = Rc<dyn Fn(&EntityHash, &EntityHash, &StateManager) -> Ordering>;

struct CachedQuery {
    family: Family,
    members: BTreeSet<EntityHash>,
    ordered: Vec<EntityHash>,
    order: Option<Comparator>,
    invalid: bool,
    recomputations: u64,
}

impl CachedQuery {
    fn affected_by(&self, change: &StructuralChange) -> bool {
        match change {
            StructuralChange::EntityAdded { hash, components }
            | StructuralChange::ComponentsChanged { hash, components } => {
                self.members.contains(hash) || self.family.matches(components)
            }
            StructuralChange::EntityRemoved { hash } => self.members.contains(hash),
            StructuralChange::Reset => true,
        }
    }

    fn recompute(&mut self, state: &StateManager) {
        self.members = self.family.compute(state);
        self.ordered = self.members.iter().cloned().collect();
        if let Some(order) = &self.order {
            self.ordered.sort_by(|a, b| order(a, b, state));
        }
        self.invalid = false;
        self.recomputations += 1;
    }
}

/// Per-consumer cached query results.
#[derive(Default)]
pub struct QueryCache {
    queries: BTreeMap<String, CachedQuery>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) `consumer`'s family. The result starts invalid.
    pub fn register(&mut self, consumer: &str, family: Family) {
        self.queries.insert(
            consumer.to_owned(),
            CachedQuery {
                family,
                members: BTreeSet::new(),
                ordered: Vec::new(),
                order: None,
                invalid: true,
                recomputations: 0,
            },
        );
    }

    pub fn unregister(&mut self, consumer: &str) -> Result<(), EcsError> {
        self.queries
            .remove(consumer)
            .map(|_| ())
            .ok_or_else(|| unknown(consumer))
    }

    pub fn is_registered(&self, consumer: &str) -> bool {
        self.queries.contains_key(consumer)
    }

    /// Give `consumer` a total order; its result is re-sorted on the next
    /// recomputation.
    pub fn set_order(
        &mut self,
        consumer: &str,
        order: impl Fn(&EntityHash, &EntityHash, &StateManager) -> Ordering + 'static,
    ) -> Result<(), EcsError> {
        let query = self.queries.get_mut(consumer).ok_or_else(|| unknown(consumer))?;
        query.order = Some(Rc::new(order));
        query.invalid = true;
        Ok(())
    }

    pub(crate) fn install_order(&mut self, consumer: &str, order: Comparator) {
        if let Some(query) = self.queries.get_mut(consumer) {
            query.order = Some(order);
            query.invalid = true;
        }
    }

    /// Mark every result a change could affect as invalid.
    pub fn observe(&mut self, changes: &[StructuralChange]) {
        for (consumer, query) in self.queries.iter_mut() {
            if query.invalid {
                continue;
            }
            if changes.iter().any(|c| query.affected_by(c)) {
                trace!(consumer = %consumer, "query invalidated");
                query.invalid = true;
            }
        }
    }

    /// Drain `state`'s structural changes into the cache.
    ///
    /// The change log is consumed, so a second cache synced against the
    /// same `StateManager` misses whatever this one drained. Keep one cache
    /// per state: the [`ProcessorManager`](crate::processor::ProcessorManager)
    /// one, reached through its `cache_mut`.
    pub fn sync(&mut self, state: &mut StateManager) {
        let changes = state.drain_changes();
        if !changes.is_empty() {
            self.observe(&changes);
        }
    }

    /// Sync, then recompute every invalid result. Run once per update.
    pub fn refresh(&mut self, state: &mut StateManager) {
        self.sync(state);
        let state = &*state;
        for query in self.queries.values_mut().filter(|q| q.invalid) {
            query.recompute(state);
        }
    }

    /// `consumer`'s result, recomputed first if it was invalidated.
    pub fn entities(
        &mut self,
        consumer: &str,
        state: &mut StateManager,
    ) -> Result<&[EntityHash], EcsError> {
        self.sync(state);
        let query = self.queries.get_mut(consumer).ok_or_else(|| unknown(consumer))?;
        if query.invalid {
            query.recompute(state);
        }
        Ok(&query.ordered)
    }

    /// `consumer`'s last computed result, stale or not.
    pub fn cached(&self, consumer: &str) -> Result<&[EntityHash], EcsError> {
        self.queries
            .get(consumer)
            .map(|q| q.ordered.as_slice())
            .ok_or_else(|| unknown(consumer))
    }

    pub fn is_invalid(&self, consumer: &str) -> Result<bool, EcsError> {
        self.queries
            .get(consumer)
            .map(|q| q.invalid)
            .ok_or_else(|| unknown(consumer))
    }

    /// How many times `consumer`'s result has been recomputed.
    pub fn recompute_count(&self, consumer: &str) -> Result<u64, EcsError> {
        self.queries
            .get(consumer)
            .map(|q| q.recomputations)
            .ok_or_else(|| unknown(consumer))
    }

    pub fn family(&self, consumer: &str) -> Result<&Family, EcsError> {
        self.queries
            .get(consumer)
            .map(|q| &q.family)
            .ok_or_else(|| unknown(consumer))
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (consumer, q) in &self.queries {
            map.entry(consumer, &(&q.family, q.members.len(), q.invalid));
        }
        map.finish()
    }
}

fn unknown(consumer: &str) -> EcsError {
    EcsError::UnknownConsumer {
        consumer: consumer.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
