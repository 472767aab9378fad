//! Component records and the component factory registry.
//!
//! A [`Component`] is a named JSON object plus an optional pair of lifecycle
//! hooks ([`Lifecycle`]). Component state is stored as [`serde_json::Value`]
//! so that it can be snapshotted, diffed and shipped to peers without knowing
//! the concrete type.
//!
//! The [`ComponentRegistry`] maps a component name to a constructor
//! `(args) -> state` and the hooks every component of that name carries. It is
//! the factory used to build entities from declarative component lists and to
//! rebuild entities received from a peer.
//!
//! # Example
//!
//! ```
//! use rewind_ecs::prelude::*;
//! use serde_json::json;
//!
//! let mut registry = ComponentRegistry::new(1);
//! registry.register("transform", |args| json!({ "x": args["x"], "y": args["y"] }));
//!
//! let entity = registry
//!     .create_entity(&[ComponentSpec::new("transform", json!({ "x": 1, "y": 2 }))], None)
//!     .unwrap();
//! assert_eq!(entity.component("transform").unwrap().state()["y"], 2);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::entity::{Entity, EntityHash, HashGenerator};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Lifecycle hooks
// ---------------------------------------------------------------------------

/// Hook invoked with the owning entity id and the component state.
pub type Hook = Rc<dyn Fn(&EntityHash, &Value)>;

/// Optional init/remove hook pair carried by a component.
///
/// `init` fires once when the component becomes part of the live world,
/// `remove` fires once when it leaves it. Hooks observe state; they never
/// mutate it, so replaying a history produces the same state regardless of
/// what the hooks do.
#[derive(Clone, Default)]
pub struct Lifecycle {
    pub init: Option<Hook>,
    pub remove: Option<Hook>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_init(mut self, hook: impl Fn(&EntityHash, &Value) + 'static) -> Self {
        self.init = Some(Rc::new(hook));
        self
    }

    pub fn on_remove(mut self, hook: impl Fn(&EntityHash, &Value) + 'static) -> Self {
        self.remove = Some(Rc::new(hook));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.init.is_none() && self.remove.is_none()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("init", &self.init.is_some())
            .field("remove", &self.remove.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// A named component: mutable JSON object state plus lifecycle hooks.
#[derive(Debug, Clone)]
pub struct Component {
    name: String,
    state: Value,
    hooks: Lifecycle,
}

impl Component {
    /// Create a component without hooks. `state` must be a JSON object.
    pub fn new(name: impl Into<String>, state: Value) -> Result<Self, EcsError> {
        let name = name.into();
        if name.is_empty() {
            return Err(EcsError::MalformedComponent {
                name,
                details: "component name is empty".to_owned(),
            });
        }
        if !state.is_object() {
            return Err(EcsError::MalformedComponent {
                name,
                details: format!("state must be a JSON object, got {state}"),
            });
        }
        Ok(Self {
            name,
            state,
            hooks: Lifecycle::default(),
        })
    }

    pub fn with_hooks(mut self, hooks: Lifecycle) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    /// Mutable access to the state. Reducers mutate components in place.
    pub fn state_mut(&mut self) -> &mut Value {
        &mut self.state
    }

    pub fn hooks(&self) -> &Lifecycle {
        &self.hooks
    }

    pub(crate) fn fire_init(&self, owner: &EntityHash) {
        if let Some(init) = &self.hooks.init {
            init(owner, &self.state);
        }
    }

    pub(crate) fn fire_remove(&self, owner: &EntityHash) {
        if let Some(remove) = &self.hooks.remove {
            remove(owner, &self.state);
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentSpec
// ---------------------------------------------------------------------------

/// One entry of a declarative component list: a registered name plus the
/// arguments passed to its constructor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Constructor turning arguments into component state.
pub type Constructor = Rc<dyn Fn(&Value) -> Value>;

#[derive(Clone)]
struct ComponentFactory {
    constructor: Constructor,
    hooks: Lifecycle,
}

/// Registry of component constructors keyed by component name.
///
/// Also owns the [`HashGenerator`] used to name entities it creates.
#[derive(Clone)]
pub struct ComponentRegistry {
    factories: BTreeMap<String, ComponentFactory>,
    hashes: HashGenerator,
}

impl ComponentRegistry {
    /// Create an empty registry whose generated entity ids derive from `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            factories: BTreeMap::new(),
            hashes: HashGenerator::new(seed),
        }
    }

    /// Register (or replace) a constructor without hooks.
    pub fn register(&mut self, name: &str, constructor: impl Fn(&Value) -> Value + 'static) {
        self.register_with_hooks(name, constructor, Lifecycle::default());
    }

    /// Register (or replace) a constructor whose components carry `hooks`.
    pub fn register_with_hooks(
        &mut self,
        name: &str,
        constructor: impl Fn(&Value) -> Value + 'static,
        hooks: Lifecycle,
    ) {
        self.factories.insert(
            name.to_owned(),
            ComponentFactory {
                constructor: Rc::new(constructor),
                hooks,
            },
        );
    }

    /// Remove a constructor. Fails if `name` was never registered.
    pub fn unregister(&mut self, name: &str) -> Result<(), EcsError> {
        self.factories
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| self.unknown(name))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build one component by running its constructor on `args`.
    pub fn create_component(&self, name: &str, args: &Value) -> Result<Component, EcsError> {
        let factory = self.factories.get(name).ok_or_else(|| self.unknown(name))?;
        let state = (factory.constructor)(args);
        Ok(Component::new(name, state)?.with_hooks(factory.hooks.clone()))
    }

    /// Rebuild a component from already-constructed state (as received on
    /// the wire). The constructor is not run; registered hooks are attached
    /// when the name is known.
    pub fn rehydrate(&self, name: &str, state: Value) -> Result<Component, EcsError> {
        let component = Component::new(name, state)?;
        Ok(match self.factories.get(name) {
            Some(factory) => component.with_hooks(factory.hooks.clone()),
            None => component,
        })
    }

    /// Build an entity from a declarative component list.
    ///
    /// Names without a registered constructor are skipped with a warning.
    /// When `hash` is `None` a fresh id is generated.
    pub fn create_entity(
        &mut self,
        specs: &[ComponentSpec],
        hash: Option<EntityHash>,
    ) -> Result<Entity, EcsError> {
        let hash = match hash {
            Some(hash) => {
                self.hashes.reserve(&hash);
                hash
            }
            None => self.hashes.generate(),
        };
        let mut entity = Entity::new(hash);
        for spec in specs {
            if !self.is_registered(&spec.name) {
                warn!(
                    entity = %entity.hash(),
                    component = %spec.name,
                    "skipping unregistered component"
                );
                continue;
            }
            entity.add_component(self.create_component(&spec.name, &spec.args)?);
        }
        Ok(entity)
    }

    /// Rebuild an entity from its serialized component map.
    pub fn rehydrate_entity(
        &mut self,
        hash: &EntityHash,
        components: &BTreeMap<String, Value>,
    ) -> Result<Entity, EcsError> {
        self.hashes.reserve(hash);
        let mut entity = Entity::new(hash.clone());
        for (name, state) in components {
            entity.add_component(self.rehydrate(name, state.clone())?);
        }
        Ok(entity)
    }

    /// A fresh entity id.
    pub fn generate_hash(&mut self) -> EntityHash {
        self.hashes.generate()
    }

    fn unknown(&self, name: &str) -> EcsError {
        EcsError::UnknownComponent {
            name: name.to_owned(),
            registered: self.names().collect::<Vec<_>>().join(", "),
        }
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    fn registry() -> ComponentRegistry {
        let mut r = ComponentRegistry::new(9);
        r.register("transform", |args| json!({ "x": args["x"], "y": args["y"] }));
        r.register("render", |args| json!({ "layer": args["layer"] }));
        r
    }

    #[test]
    fn non_object_state_is_malformed() {
        let err = Component::new("render", json!(3)).unwrap_err();
        assert!(matches!(err, EcsError::MalformedComponent { .. }));
        assert_eq!(err.kind(), crate::ErrorKind::ContractViolation);
    }

    #[test]
    fn create_component_runs_constructor() {
        let r = registry();
        let c = r.create_component("render", &json!({ "layer": 4 })).unwrap();
        assert_eq!(c.name(), "render");
        assert_eq!(c.state(), &json!({ "layer": 4 }));
    }

    #[test]
    fn create_unknown_component_lists_registered_names() {
        let r = registry();
        match r.create_component("physics", &json!({})) {
            Err(EcsError::UnknownComponent { name, registered }) => {
                assert_eq!(name, "physics");
                assert_eq!(registered, "render, transform");
            }
            other => panic!("expected UnknownComponent, got {other:?}"),
        }
    }

    #[test]
    fn create_entity_skips_unregistered_components() {
        let mut r = registry();
        let e = r
            .create_entity(
                &[
                    ComponentSpec::new("render", json!({ "layer": 1 })),
                    ComponentSpec::new("physics", json!({})),
                ],
                Some(EntityHash::from("abc")),
            )
            .unwrap();
        assert_eq!(e.hash().as_str(), "abc");
        assert!(e.has_component("render"));
        assert!(!e.has_component("physics"));
    }

    #[test]
    fn create_entity_generates_hash_when_absent() {
        let mut r = registry();
        let a = r.create_entity(&[], None).unwrap();
        let b = r.create_entity(&[], None).unwrap();
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn unregister_unknown_is_not_found() {
        let mut r = registry();
        r.unregister("render").unwrap();
        let err = r.unregister("render").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[test]
    fn rehydrate_attaches_registered_hooks() {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let sink = fired.clone();
        let mut r = ComponentRegistry::new(0);
        r.register_with_hooks(
            "render",
            |args| args.clone(),
            Lifecycle::new().on_init(move |e, _| sink.borrow_mut().push(e.to_string())),
        );

        let c = r.rehydrate("render", json!({ "layer": 2 })).unwrap();
        c.fire_init(&EntityHash::from("e1"));
        assert_eq!(*fired.borrow(), vec!["e1".to_owned()]);

        let plain = r.rehydrate("unknown", json!({})).unwrap();
        assert!(plain.hooks().is_empty());
    }
}
