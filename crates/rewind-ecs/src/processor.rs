//! Processors: per-tick consumers of cached queries.
//!
//! A [`Processor`] declares a [`Family`] and, once per update, receives the
//! entities currently matching it. Processors see state read-only and change
//! the world by dispatching actions, so every mutation still flows through
//! reducers and lands in the replayable action history.

use tracing::warn;

use crate::action::ActionQueue;
use crate::entity::EntityHash;
use crate::query::{Comparator, Family, QueryCache};
use crate::state::StateManager;
use crate::EcsError;

/// A named consumer of one component query.
pub trait Processor {
    /// Unique name; also the query-cache consumer key.
    fn name(&self) -> &str;

    fn family(&self) -> Family;

    /// Optional total order for the matched entities. Installed on the
    /// query cache at registration, so it is applied on each recomputation.
    fn order(&self) -> Option<Comparator> {
        None
    }

    fn update(
        &mut self,
        entities: &[EntityHash],
        state: &StateManager,
        queue: &mut ActionQueue,
    ) -> Result<(), EcsError>;
}

/// Outcome of one processor pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorReport {
    pub ran: usize,
    pub failed: usize,
}

/// Runs processors in registration order over their cached queries.
#[derive(Default)]
pub struct ProcessorManager {
    processors: Vec<Box<dyn Processor>>,
    cache: QueryCache,
}

impl ProcessorManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor. A processor with the same name is replaced.
    pub fn add_processor(&mut self, processor: Box<dyn Processor>) {
        let name = processor.name().to_owned();
        self.processors.retain(|p| p.name() != name);
        self.cache.register(&name, processor.family());
        if let Some(order) = processor.order() {
            self.cache.install_order(&name, order);
        }
        self.processors.push(processor);
    }

    pub fn remove_processor(&mut self, name: &str) -> Result<Box<dyn Processor>, EcsError> {
        let index = self
            .processors
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| EcsError::UnknownConsumer {
                consumer: name.to_owned(),
            })?;
        self.cache.unregister(name)?;
        Ok(self.processors.remove(index))
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Queries for consumers that are not processors live here too.
    pub fn cache_mut(&mut self) -> &mut QueryCache {
        &mut self.cache
    }

    /// Refresh invalidated queries, then run every processor once.
    pub fn update(&mut self, state: &mut StateManager, queue: &mut ActionQueue) -> ProcessorReport {
        self.cache.refresh(state);
        let state = &*state;
        let mut report = ProcessorReport::default();
        for processor in self.processors.iter_mut() {
            let entities = match self.cache.cached(processor.name()) {
                Ok(entities) => entities,
                Err(e) => {
                    warn!(processor = processor.name(), error = %e, "processor has no query");
                    report.failed += 1;
                    continue;
                }
            };
            report.ran += 1;
            if let Err(e) = processor.update(entities, state, queue) {
                report.failed += 1;
                warn!(processor = processor.name(), error = %e, "processor failed");
            }
        }
        report
    }
}
