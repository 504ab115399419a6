//! Chained hash table parameterised by an equality comparer.
//!
//! Unlike `std::collections::HashMap`, hashing and equality come from an
//! [`EqualityComparer`] value, so set operations and joins can use
//! caller-supplied key semantics without newtype wrappers.

use std::hash::Hash;

use crate::key::{DefaultEqualityComparer, EqualityComparer};

const INITIAL_BUCKETS: usize = 8;

#[derive(Debug, Clone)]
enum Slot<K, V> {
    Occupied {
        hash: u64,
        key: K,
        value: V,
        next: Option<usize>,
    },
    Free {
        next_free: Option<usize>,
    },
}

/// Hash table with bucket heads indexing into a slab of entries.
///
/// Each entry links to the next entry of its bucket. Removed entries go on a
/// free list and their slots are reused by later inserts.
#[derive(Debug, Clone)]
pub struct HashLookup<K, V, C = DefaultEqualityComparer> {
    buckets: Vec<Option<usize>>,
    slots: Vec<Slot<K, V>>,
    free_list: Option<usize>,
    len: usize,
    comparer: C,
}

impl<K: Hash + Eq, V> Default for HashLookup<K, V, DefaultEqualityComparer> {
    fn default() -> Self {
        Self::new(DefaultEqualityComparer)
    }
}

impl<K, V, C: EqualityComparer<K>> HashLookup<K, V, C> {
    /// Create an empty lookup.
    pub fn new(comparer: C) -> Self {
        Self {
            buckets: vec![None; INITIAL_BUCKETS],
            slots: Vec::new(),
            free_list: None,
            len: 0,
            comparer,
        }
    }

    /// Number of entries.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether there are no entries.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The comparer in use.
    pub const fn comparer(&self) -> &C {
        &self.comparer
    }

    fn bucket_of(&self, hash: u64) -> usize {
        // Bucket count is a power of two.
        (hash as usize) & (self.buckets.len() - 1)
    }

    fn find(&self, key: &K) -> Option<usize> {
        let hash = self.comparer.hash(key);
        let mut cursor = self.buckets[self.bucket_of(hash)];
        while let Some(index) = cursor {
            match &self.slots[index] {
                Slot::Occupied {
                    hash: h,
                    key: k,
                    next,
                    ..
                } => {
                    if *h == hash && self.comparer.equals(k, key) {
                        return Some(index);
                    }
                    cursor = *next;
                }
                Slot::Free { .. } => return None,
            }
        }
        None
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Value stored for `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        let index = self.find(key)?;
        match &self.slots[index] {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Free { .. } => None,
        }
    }

    /// Mutable value stored for `key`.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let index = self.find(key)?;
        match &mut self.slots[index] {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Free { .. } => None,
        }
    }

    /// Insert `key` only if absent. Returns `false` when it was already there.
    pub fn try_add(&mut self, key: K, value: V) -> bool {
        if self.contains_key(&key) {
            return false;
        }
        let hash = self.comparer.hash(&key);
        self.insert_new(hash, key, value);
        true
    }

    /// Insert or replace; returns the previous value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if let Some(existing) = self.get_mut(&key) {
            return Some(std::mem::replace(existing, value));
        }
        let hash = self.comparer.hash(&key);
        self.insert_new(hash, key, value);
        None
    }

    /// Value for `key`, inserting `make()` first if absent.
    pub fn get_or_insert_with<F: FnOnce() -> V>(&mut self, key: K, make: F) -> &mut V {
        let index = match self.find(&key) {
            Some(index) => index,
            None => {
                let hash = self.comparer.hash(&key);
                self.insert_new(hash, key, make())
            }
        };
        match &mut self.slots[index] {
            Slot::Occupied { value, .. } => value,
            Slot::Free { .. } => unreachable!("slot {index} is occupied after lookup or insert"),
        }
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let hash = self.comparer.hash(key);
        let bucket = self.bucket_of(hash);
        let mut previous: Option<usize> = None;
        let mut cursor = self.buckets[bucket];

        while let Some(index) = cursor {
            let (matches, next) = match &self.slots[index] {
                Slot::Occupied {
                    hash: h,
                    key: k,
                    next,
                    ..
                } => (*h == hash && self.comparer.equals(k, key), *next),
                Slot::Free { .. } => return None,
            };
            if matches {
                match previous {
                    None => self.buckets[bucket] = next,
                    Some(prev) => {
                        if let Slot::Occupied { next: link, .. } = &mut self.slots[prev] {
                            *link = next;
                        }
                    }
                }
                let freed = std::mem::replace(
                    &mut self.slots[index],
                    Slot::Free {
                        next_free: self.free_list,
                    },
                );
                self.free_list = Some(index);
                self.len -= 1;
                return match freed {
                    Slot::Occupied { value, .. } => Some(value),
                    Slot::Free { .. } => None,
                };
            }
            previous = Some(index);
            cursor = next;
        }
        None
    }

    fn insert_new(&mut self, hash: u64, key: K, value: V) -> usize {
        if self.len >= self.buckets.len() {
            self.grow();
        }
        let bucket = self.bucket_of(hash);
        let entry = Slot::Occupied {
            hash,
            key,
            value,
            next: self.buckets[bucket],
        };

        let index = match self.free_list {
            Some(free) => {
                if let Slot::Free { next_free } = self.slots[free] {
                    self.free_list = next_free;
                }
                self.slots[free] = entry;
                free
            }
            None => {
                self.slots.push(entry);
                self.slots.len() - 1
            }
        };
        self.buckets[bucket] = Some(index);
        self.len += 1;
        index
    }

    fn grow(&mut self) {
        let new_len = self.buckets.len() * 2;
        self.buckets = vec![None; new_len];
        for index in 0..self.slots.len() {
            let bucket = match &self.slots[index] {
                Slot::Occupied { hash, .. } => self.bucket_of(*hash),
                Slot::Free { .. } => continue,
            };
            let head = self.buckets[bucket];
            if let Slot::Occupied { next, .. } = &mut self.slots[index] {
                *next = head;
            }
            self.buckets[bucket] = Some(index);
        }
    }

    /// Iterate entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Occupied { key, value, .. } => Some((key, value)),
            Slot::Free { .. } => None,
        })
    }
}

/// Owning iterator over the entries of a [`HashLookup`].
pub struct LookupIntoIter<K, V> {
    slots: std::vec::IntoIter<Slot<K, V>>,
}

impl<K, V> Iterator for LookupIntoIter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        self.slots.by_ref().find_map(|slot| match slot {
            Slot::Occupied { key, value, .. } => Some((key, value)),
            Slot::Free { .. } => None,
        })
    }
}

impl<K, V, C> IntoIterator for HashLookup<K, V, C> {
    type Item = (K, V);
    type IntoIter = LookupIntoIter<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        LookupIntoIter {
            slots: self.slots.into_iter(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;
    use crate::key::ProjectionEqualityComparer;

    /// Every key lands in the same bucket.
    struct Colliding;

    impl EqualityComparer<u32> for Colliding {
        fn equals(&self, a: &u32, b: &u32) -> bool {
            a == b
        }
        fn hash(&self, _value: &u32) -> u64 {
            7
        }
    }

    #[test]
    fn test_try_add_rejects_duplicates() {
        let mut lookup = HashLookup::default();
        assert!(lookup.try_add("a", 1));
        assert!(!lookup.try_add("a", 2));
        assert_eq!(lookup.get(&"a"), Some(&1));
        assert_eq!(lookup.len(), 1);
    }

    #[test]
    fn test_remove_reuses_slot() {
        let mut lookup = HashLookup::new(Colliding);
        for k in 0..5 {
            lookup.insert(k, k * 10);
        }
        assert_eq!(lookup.remove(&2), Some(20));
        assert_eq!(lookup.remove(&2), None);
        assert!(!lookup.contains_key(&2));
        assert_eq!(lookup.get(&4), Some(&40));
        assert_eq!(lookup.get(&0), Some(&0));

        lookup.insert(9, 90);
        assert_eq!(lookup.slots.len(), 5);
        assert_eq!(lookup.get(&9), Some(&90));
        assert_eq!(lookup.len(), 5);
    }

    #[test]
    fn test_custom_comparer() {
        let mut lookup = HashLookup::new(ProjectionEqualityComparer::new(|s: &String| s.to_lowercase()));
        lookup.insert("Key".to_string(), 1);
        assert_eq!(lookup.insert("KEY".to_string(), 2), Some(1));
        assert_eq!(lookup.len(), 1);
        assert_eq!(lookup.get(&"key".to_string()), Some(&2));
    }

    #[test]
    fn test_get_or_insert_with() {
        let mut lookup: HashLookup<u8, Vec<u8>> = HashLookup::default();
        lookup.get_or_insert_with(1, Vec::new).push(10);
        lookup.get_or_insert_with(1, Vec::new).push(11);
        assert_eq!(lookup.get(&1), Some(&vec![10, 11]));
    }

    proptest! {
        #[test]
        fn prop_matches_std_hashmap(ops in prop::collection::vec((any::<bool>(), 0u16..64, any::<u16>()), 0..300)) {
            let mut lookup = HashLookup::default();
            let mut model = HashMap::new();
            for (is_insert, key, value) in ops {
                if is_insert {
                    prop_assert_eq!(lookup.insert(key, value), model.insert(key, value));
                } else {
                    prop_assert_eq!(lookup.remove(&key), model.remove(&key));
                }
                prop_assert_eq!(lookup.len(), model.len());
            }
            for (k, v) in &model {
                prop_assert_eq!(lookup.get(k), Some(v));
            }
            let mut entries: Vec<_> = lookup.into_iter().collect();
            entries.sort_unstable();
            let mut expected: Vec<_> = model.into_iter().collect();
            expected.sort_unstable();
            prop_assert_eq!(entries, expected);
        }
    }
}
