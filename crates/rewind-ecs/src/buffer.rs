//! Fixed-capacity, tick-ordered ring buffer.
//!
//! Both the state history and the action history are a [`TickBuffer`]. Entries
//! are kept sorted by tick; pushing past capacity silently evicts the oldest
//! tick. Pushing a tick that is already present replaces that entry in place.

use std::collections::VecDeque;

use crate::Tick;

/// Default number of ticks retained by state and action buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 8;

/// Bounded history of values keyed by tick.
#[derive(Debug, Clone)]
pub struct TickBuffer<T> {
    entries: VecDeque<(Tick, T)>,
    capacity: usize,
}

impl<T> TickBuffer<T> {
    /// An empty buffer holding at most `capacity` ticks (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the capacity, evicting oldest entries if it shrank.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.evict();
    }

    /// Insert `value` at `tick`, keeping tick order.
    ///
    /// Returns the evicted oldest entry when the buffer overflowed.
    pub fn push(&mut self, tick: Tick, value: T) -> Option<(Tick, T)> {
        match self.entries.binary_search_by_key(&tick, |(t, _)| *t) {
            Ok(i) => {
                self.entries[i].1 = value;
                None
            }
            Err(i) => {
                self.entries.insert(i, (tick, value));
                self.evict()
            }
        }
    }

    pub fn get(&self, tick: Tick) -> Option<&T> {
        self.entries
            .binary_search_by_key(&tick, |(t, _)| *t)
            .ok()
            .map(|i| &self.entries[i].1)
    }

    pub fn contains(&self, tick: Tick) -> bool {
        self.get(tick).is_some()
    }

    pub fn oldest(&self) -> Option<(Tick, &T)> {
        self.entries.front().map(|(t, v)| (*t, v))
    }

    pub fn newest(&self) -> Option<(Tick, &T)> {
        self.entries.back().map(|(t, v)| (*t, v))
    }

    /// Entries with tick `>= from`, in tick order.
    pub fn range_from(&self, from: Tick) -> impl Iterator<Item = (Tick, &T)> {
        let start = self.entries.partition_point(|(t, _)| *t < from);
        self.entries.range(start..).map(|(t, v)| (*t, v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Tick, &T)> {
        self.entries.iter().map(|(t, v)| (*t, v))
    }

    /// Retained ticks, oldest first.
    pub fn ticks(&self) -> Vec<Tick> {
        self.entries.iter().map(|(t, _)| *t).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict(&mut self) -> Option<(Tick, T)> {
        let mut last = None;
        while self.entries.len() > self.capacity {
            last = self.entries.pop_front();
        }
        last
    }
}

impl<T> Default for TickBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}
