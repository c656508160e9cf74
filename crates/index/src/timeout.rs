//! Timeout index shared between the read path and the eviction sweep

use crate::avl::{AvlMultimap, IndexError};
use parking_lot::{Mutex, MutexGuard};

/// Last-activity timestamp (UNIX seconds) -> identifiers active at that time
pub struct TimeoutIndex<V> {
    tree: Mutex<AvlMultimap<i64, V>>,
}

impl<V: PartialEq + Clone> TimeoutIndex<V> {
    pub fn new() -> Self {
        Self {
            tree: Mutex::new(AvlMultimap::new()),
        }
    }

    pub fn insert(&self, timestamp: i64, id: V) {
        self.tree.lock().insert(timestamp, id);
    }

    pub fn remove(&self, timestamp: i64, id: &V) -> Result<(), IndexError> {
        self.tree.lock().remove_value(timestamp, id)
    }

    /// Move `id` to a newer timestamp; a no-op when the timestamp is unchanged
    pub fn rekey(&self, old: i64, new: i64, id: V) -> bool {
        if old == new {
            return true;
        }
        self.tree.lock().rekey(old, new, id)
    }

    /// Snapshot every id whose timestamp is strictly before `deadline`.
    ///
    /// The tree itself is left untouched; callers remove ids as they close.
    pub fn expired(&self, deadline: i64) -> Vec<(i64, V)> {
        let tree = self.tree.lock();
        tree.keys_less_than(deadline)
            .into_iter()
            .flat_map(|ts| tree.values_at(ts).iter().cloned().map(move |id| (ts, id)))
            .collect()
    }

    pub fn values_at(&self, timestamp: i64) -> Vec<V> {
        self.tree.lock().values_at(timestamp).to_vec()
    }

    /// Number of distinct timestamps
    pub fn len(&self) -> usize {
        self.tree.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.lock().is_empty()
    }

    /// Hold the lock across a read-check-rekey sequence
    pub fn lock(&self) -> MutexGuard<'_, AvlMultimap<i64, V>> {
        self.tree.lock()
    }
}

impl<V: PartialEq + Clone> Default for TimeoutIndex<V> {
    fn default() -> Self {
        Self::new()
    }
}
