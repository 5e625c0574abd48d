use crate::shard::{Item, ShardKey, XorMetric};
use crate::util::Result;
use crossbeam::sync::ShardedLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

/// Topology is the shared, read-mostly view of the shard ring.
///
/// Readers take a snapshot and route against it. A refresh builds a complete
/// new metric off to the side and swaps it in one step, so no reader ever sees
/// a partially populated ring.
pub struct Topology<T> {
    current: ShardedLock<Arc<XorMetric<T>>>,
    generation: AtomicU64,
}

impl<T: Item> Default for Topology<T> {
    fn default() -> Self {
        Self::new(XorMetric::new())
    }
}

impl<T: Item> Topology<T> {
    pub fn new(metric: XorMetric<T>) -> Self {
        Self {
            current: ShardedLock::new(Arc::new(metric)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn populate<I: IntoIterator<Item = T>>(items: I) -> Result<Self> {
        Ok(Self::new(XorMetric::populate(items)?))
    }

    pub fn snapshot(&self) -> Arc<XorMetric<T>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// replace swaps in a new member set and returns the new generation.
    pub fn replace(&self, metric: XorMetric<T>) -> u64 {
        let size = metric.len();
        let next = Arc::new(metric);
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = next;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(generation, shards = size, "topology replaced");
        generation
    }

    /// Number of times the member set has been replaced.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Item + Clone> Topology<T> {
    pub fn find(&self, key: ShardKey) -> Option<T> {
        self.snapshot().find(key).cloned()
    }
}
