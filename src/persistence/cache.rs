//! Bounded insertion-ordered cache

use std::collections::{HashMap, VecDeque};

/// Keyed cache holding at most `capacity` entries.
///
/// When full, inserting a new key evicts the oldest inserted entry.
/// Re-inserting an existing key replaces its value in place.
#[derive(Debug, Clone)]
pub struct ReportCache<V> {
    capacity: usize,
    entries: HashMap<String, V>,
    order: VecDeque<String>,
}

impl<V> ReportCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Insert a value, returning the evicted entry if the cache overflowed
    pub fn insert(&mut self, key: impl Into<String>, value: V) -> Option<(String, V)> {
        let key = key.into();
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = value;
            return None;
        }

        self.order.push_back(key.clone());
        self.entries.insert(key, value);

        if self.entries.len() > self.capacity {
            while let Some(oldest) = self.order.pop_front() {
                if let Some(evicted) = self.entries.remove(&oldest) {
                    return Some((oldest, evicted));
                }
            }
        }
        None
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        let removed = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(removed)
    }

    /// Values in insertion order
    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.order.iter().filter_map(|k| self.entries.get(k))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
