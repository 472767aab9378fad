//! Entity identifiers, entity records, and id generation.
//!
//! An [`EntityHash`] is an opaque string id shared verbatim between peers. An
//! [`Entity`] owns an ordered mapping from component name to [`Component`].
//! New ids come from a [`HashGenerator`], which is seeded so that two replicas
//! started with the same seed mint the same sequence of ids.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::component::Component;
use crate::EcsError;

// ---------------------------------------------------------------------------
// EntityHash
// ---------------------------------------------------------------------------

/// Opaque unique identifier of an entity.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityHash(String);

impl EntityHash {
    /// Wrap an existing id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EntityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityHash({})", self.0)
    }
}

impl fmt::Display for EntityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityHash {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for EntityHash {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// HashGenerator
// ---------------------------------------------------------------------------

const HASH_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const HASH_LENGTH: usize = 8;

/// Mints 8-character alphanumeric entity ids from a seeded PCG stream.
///
/// Every id handed out is remembered, so the generator never repeats itself
/// even if the stream happens to produce the same string twice.
#[derive(Debug, Clone)]
pub struct HashGenerator {
    rng: Pcg64Mcg,
    issued: BTreeSet<EntityHash>,
}

impl HashGenerator {
    /// Create a generator seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Pcg64Mcg::seed_from_u64(seed),
            issued: BTreeSet::new(),
        }
    }

    /// Produce a fresh id that this generator has not produced before.
    pub fn generate(&mut self) -> EntityHash {
        loop {
            let id: String = (0..HASH_LENGTH)
                .map(|_| HASH_ALPHABET[self.rng.gen_range(0..HASH_ALPHABET.len())] as char)
                .collect();
            let hash = EntityHash(id);
            if self.issued.insert(hash.clone()) {
                return hash;
            }
        }
    }

    /// Mark an externally supplied id as taken so it is never generated.
    pub fn reserve(&mut self, hash: &EntityHash) {
        self.issued.insert(hash.clone());
    }
}

impl Default for HashGenerator {
    fn default() -> Self {
        Self::new(0)
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A named bag of components.
///
/// Components are keyed (and iterated) by name, so a component name appears
/// at most once per entity. Hooks are not fired here; the
/// [`StateManager`](crate::state::StateManager) fires them when an entity or
/// component is attached to or detached from the live world.
#[derive(Debug, Clone)]
pub struct Entity {
    hash: EntityHash,
    components: BTreeMap<String, Component>,
}

impl Entity {
    /// An entity with no components.
    pub fn new(hash: impl Into<EntityHash>) -> Self {
        Self {
            hash: hash.into(),
            components: BTreeMap::new(),
        }
    }

    /// Builder-style component attachment.
    pub fn with_component(mut self, component: Component) -> Self {
        self.add_component(component);
        self
    }

    pub fn hash(&self) -> &EntityHash {
        &self.hash
    }

    /// Attach a component, returning the one it replaced (if any).
    pub fn add_component(&mut self, component: Component) -> Option<Component> {
        self.components.insert(component.name().to_owned(), component)
    }

    /// Detach a component by name.
    pub fn remove_component(&mut self, name: &str) -> Result<Component, EcsError> {
        self.components
            .remove(name)
            .ok_or_else(|| EcsError::ComponentNotFound {
                entity: self.hash.clone(),
                component: name.to_owned(),
            })
    }

    pub fn has_component(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.get(name)
    }

    pub fn component_mut(&mut self, name: &str) -> Option<&mut Component> {
        self.components.get_mut(name)
    }

    /// Component names in sorted order.
    pub fn component_names(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    /// Components in name order.
    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Component states keyed by name, the shape used on the wire.
    pub fn serialize(&self) -> BTreeMap<String, Value> {
        self.components
            .iter()
            .map(|(name, c)| (name.clone(), c.state().clone()))
            .collect()
    }

    /// Structural equality of component state, ignoring hooks.
    pub fn equals(&self, other: &Entity) -> bool {
        self.hash == other.hash && self.serialize() == other.serialize()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
