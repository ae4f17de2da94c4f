//! Bounded memory of recently emitted keys.
//!
//! After a crash between a shard commit and the state save, the builder
//! re-reads the tail of the last batch. Keys still in the ring are skipped
//! so the shard does not get them twice.

use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Default)]
pub struct ReplayGuard {
    capacity: usize,
    order: VecDeque<String>,
    counts: HashMap<String, usize>,
}

impl ReplayGuard {
    /// A guard remembering the last `capacity` keys. Zero disables it.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(1 << 16)),
            counts: HashMap::new(),
        }
    }

    /// Rebuilds a guard from persisted keys, oldest first.
    pub fn from_keys<I>(capacity: usize, keys: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut guard = Self::new(capacity);
        for key in keys {
            guard.remember(key);
        }
        guard
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.counts.contains_key(key)
    }

    pub fn remember(&mut self, key: String) {
        if self.capacity == 0 {
            return;
        }
        *self.counts.entry(key.clone()).or_insert(0) += 1;
        self.order.push_back(key);

        while self.order.len() > self.capacity {
            let Some(old) = self.order.pop_front() else {
                break;
            };
            if let Some(n) = self.counts.get_mut(&old) {
                *n -= 1;
                if *n == 0 {
                    self.counts.remove(&old);
                }
            }
        }
    }

    /// Keys oldest first, as persisted in the state file.
    pub fn keys(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut guard = ReplayGuard::new(2);
        guard.remember("a".into());
        guard.remember("b".into());
        guard.remember("c".into());
        assert!(!guard.contains("a"));
        assert!(guard.contains("b") && guard.contains("c"));
        assert_eq!(guard.keys(), ["b", "c"]);
    }

    #[test]
    fn repeated_key_survives_until_last_copy_leaves() {
        let mut guard = ReplayGuard::from_keys(2, ["x".to_string(), "x".to_string()]);
        guard.remember("y".into());
        assert!(guard.contains("x"));
        guard.remember("z".into());
        assert!(!guard.contains("x"));
    }

    #[test]
    fn zero_capacity_disables() {
        let mut guard = ReplayGuard::new(0);
        guard.remember("a".into());
        assert!(!guard.is_enabled());
        assert!(guard.is_empty());
        assert!(!guard.contains("a"));
    }
}
