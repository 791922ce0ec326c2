use fnv::FnvHashSet;
use std::{collections::VecDeque, hash::Hash};

/// Bounded FIFO set of recently seen keys.
///
/// Once `capacity` keys are held, inserting a new key forgets the oldest one.
#[derive(Clone, Debug)]
pub struct RecentlySeen<K> {
    capacity: usize,
    keys: FnvHashSet<K>,
    order: VecDeque<K>,
}

impl<K> RecentlySeen<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            keys: FnvHashSet::with_capacity_and_hasher(capacity, Default::default()),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Record `key`, returning `false` if it was already present.
    pub fn insert(&mut self, key: K) -> bool {
        if self.keys.contains(&key) {
            return false;
        }

        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }

        self.keys.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
