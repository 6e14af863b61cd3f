//! Deferred resource retirement for multi-frame-in-flight rendering.
//!
//! When using multiple frames in flight, GPU resources cannot be destroyed
//! immediately as a submitted frame may still read them. Resources are queued
//! with the generation of the last frame that could reference them and handed
//! back once the scheduler reports that generation complete.

use std::collections::VecDeque;

/// An item waiting for its generation to complete.
pub struct Retired<T> {
    pub item: T,
    /// Generation of the last frame that may reference the item.
    pub generation: u64,
}

/// Queue of items ordered by retirement generation.
pub struct RetirementQueue<T> {
    pending: VecDeque<Retired<T>>,
}

impl<T> Default for RetirementQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RetirementQueue<T> {
    pub const fn new() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }

    /// Queue an item last referenced by `generation`.
    pub fn retire(&mut self, item: T, generation: u64) {
        // Keep the queue sorted so only the front can mature.
        let position = self.pending.partition_point(|p| p.generation <= generation);
        self.pending.insert(position, Retired { item, generation });
    }

    /// Remove every item whose generation is at or below `completed`.
    pub fn drain_completed(&mut self, completed: u64) -> Vec<T> {
        let mut ready = Vec::new();
        while matches!(self.pending.front(), Some(p) if p.generation <= completed) {
            if let Some(p) = self.pending.pop_front() {
                ready.push(p.item);
            }
        }
        ready
    }

    /// Remove every item regardless of generation. Use after the device is idle.
    pub fn flush(&mut self) -> Vec<T> {
        self.pending.drain(..).map(|p| p.item).collect()
    }

    /// Get the number of pending items.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
