//! A single-threaded insertion-ordered hash store.
//!
//! [`LocalHashStore`] is the form a store takes while only one thread can see it. It has the same
//! key semantics as [`HashStore`](crate::HashStore) (a [`KeyStrategy`], value and identity modes,
//! insertion order) but none of the synchronization. The two convert into each other with
//! [`HashStore::from_local`](crate::HashStore::from_local) and
//! [`HashStore::to_local`](crate::HashStore::to_local); both directions keep the order and the
//! stored hashes.

use crate::raw::{capacity_for, exceeds_load_factor, growth_capacity, INITIAL_CAPACITY};
use crate::strategy::{DefaultStrategy, KeyStrategy};
use std::fmt;
use std::iter::FromIterator;

struct Slot<K, V> {
    hash: u64,
    key: K,
    value: V,
    next_in_lookup: Option<usize>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// An insertion-ordered hash store for use by a single thread.
///
/// ```
/// use seqhash::LocalHashStore;
///
/// let mut local = LocalHashStore::new();
/// local.insert("b", 2);
/// local.insert("a", 1);
/// local.insert("b", 3);
/// assert_eq!(local.iter().collect::<Vec<_>>(), vec![(&"b", &3), (&"a", &1)]);
/// ```
pub struct LocalHashStore<K, V, S = DefaultStrategy> {
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    buckets: Vec<Option<usize>>,
    first: Option<usize>,
    last: Option<usize>,
    len: usize,
    identity: bool,
    strategy: S,
}

impl<K, V> LocalHashStore<K, V, DefaultStrategy> {
    /// An empty store with the default strategy.
    pub fn new() -> Self {
        Self::with_strategy(DefaultStrategy::default())
    }

    /// An empty store that holds `n` entries without growing.
    pub fn with_capacity(n: usize) -> Self {
        Self::with_capacity_and_strategy(n, DefaultStrategy::default())
    }
}

impl<K, V> Default for LocalHashStore<K, V, DefaultStrategy> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> LocalHashStore<K, V, S> {
    /// An empty store that hashes and compares keys with `strategy`.
    pub fn with_strategy(strategy: S) -> Self {
        Self::with_capacity_and_strategy(0, strategy)
    }

    /// An empty store that holds `n` entries without growing, using `strategy`.
    pub fn with_capacity_and_strategy(n: usize, strategy: S) -> Self {
        Self {
            slots: Vec::with_capacity(n),
            free: Vec::new(),
            buckets: vec![None; capacity_for(n)],
            first: None,
            last: None,
            len: 0,
            identity: false,
            strategy,
        }
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the store has no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The number of buckets.
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Whether keys are compared by identity.
    pub fn is_identity(&self) -> bool {
        self.identity
    }

    /// The key strategy.
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// The entries in insertion order.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter {
            store: self,
            next: self.first,
            remaining: self.len,
        }
    }

    /// The entries in insertion order, with the hash each one is stored under.
    pub fn iter_hashed(&self) -> impl Iterator<Item = (u64, &K, &V)> + '_ {
        let mut next = self.first;
        std::iter::from_fn(move || {
            let slot = self.slot(next?);
            next = slot.next;
            Some((slot.hash, &slot.key, &slot.value))
        })
    }

    /// Consumes the store, yielding `(hash, key, value)` in insertion order.
    pub fn into_iter_hashed(mut self) -> IntoIter<K, V> {
        let first = self.first.take();
        let slots = std::mem::take(&mut self.slots);
        IntoIter {
            slots,
            next: first,
            remaining: self.len,
        }
    }

    /// Removes every entry. The mode is kept.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.buckets = vec![None; INITIAL_CAPACITY];
        self.first = None;
        self.last = None;
        self.len = 0;
    }

    fn slot(&self, i: usize) -> &Slot<K, V> {
        match self.slots[i] {
            Some(ref slot) => slot,
            None => unreachable!("slot {} is linked but vacant", i),
        }
    }

    fn slot_mut(&mut self, i: usize) -> &mut Slot<K, V> {
        match self.slots[i] {
            Some(ref mut slot) => slot,
            None => unreachable!("slot {} is linked but vacant", i),
        }
    }

    fn bini(&self, hash: u64) -> usize {
        (hash & (self.buckets.len() as u64 - 1)) as usize
    }

    /// Links a new entry at the end, without looking for an existing one.
    fn push(&mut self, hash: u64, key: K, value: V) {
        let bin = self.bini(hash);
        let slot = Slot {
            hash,
            key,
            value,
            next_in_lookup: self.buckets[bin],
            prev: self.last,
            next: None,
        };
        let i = match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(slot);
                i
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.buckets[bin] = Some(i);
        match self.last {
            Some(last) => self.slot_mut(last).next = Some(i),
            None => self.first = Some(i),
        }
        self.last = Some(i);
        self.len += 1;

        if exceeds_load_factor(self.len, self.buckets.len()) {
            self.rebucket(growth_capacity(self.len));
        }
    }

    /// Rebuilds the lookup chains over `capacity` buckets.
    fn rebucket(&mut self, capacity: usize) {
        self.buckets = vec![None; capacity];
        let mut next = self.first;
        while let Some(i) = next {
            let hash = self.slot(i).hash;
            let bin = self.bini(hash);
            let head = self.buckets[bin];
            let slot = self.slot_mut(i);
            slot.next_in_lookup = head;
            next = slot.next;
            self.buckets[bin] = Some(i);
        }
    }

    fn unlink(&mut self, i: usize, prev_in_lookup: Option<usize>) -> (K, V) {
        let slot = match self.slots[i].take() {
            Some(slot) => slot,
            None => unreachable!("slot {} is linked but vacant", i),
        };
        match prev_in_lookup {
            Some(p) => self.slot_mut(p).next_in_lookup = slot.next_in_lookup,
            None => {
                let bin = self.bini(slot.hash);
                self.buckets[bin] = slot.next_in_lookup;
            }
        }
        match slot.prev {
            Some(p) => self.slot_mut(p).next = slot.next,
            None => self.first = slot.next,
        }
        match slot.next {
            Some(n) => self.slot_mut(n).prev = slot.prev,
            None => self.last = slot.prev,
        }
        self.free.push(i);
        self.len -= 1;
        (slot.key, slot.value)
    }
}

impl<K, V, S> LocalHashStore<K, V, S>
where
    S: KeyStrategy<K>,
{
    /// Finds `key` under a precomputed `hash`, returning its slot and its lookup predecessor.
    fn find(&self, key: &K, hash: u64) -> Option<(usize, Option<usize>)> {
        let mut prev = None;
        let mut next = self.buckets[self.bini(hash)];
        while let Some(i) = next {
            let slot = self.slot(i);
            if self
                .strategy
                .equal(self.identity, key, hash, &slot.key, slot.hash)
            {
                return Some((i, prev));
            }
            prev = Some(i);
            next = slot.next_in_lookup;
        }
        None
    }

    /// The value stored for `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        let hash = self.strategy.hash(key, self.identity);
        self.find(key, hash).map(|(i, _)| &self.slot(i).value)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Inserts or updates `key`, returning the previous value. An update keeps the key's position.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let hash = self.strategy.hash(&key, self.identity);
        self.insert_hashed(hash, key, value)
    }

    /// Like [`insert`](Self::insert), with a hash already computed by this store's strategy in its
    /// current mode.
    pub(crate) fn insert_hashed(&mut self, hash: u64, key: K, value: V) -> Option<V> {
        if let Some((i, _)) = self.find(&key, hash) {
            return Some(std::mem::replace(&mut self.slot_mut(i).value, value));
        }
        self.push(hash, key, value);
        None
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let hash = self.strategy.hash(key, self.identity);
        let (i, prev) = self.find(key, hash)?;
        Some(self.unlink(i, prev).1)
    }

    /// Removes and returns the oldest entry.
    pub fn shift(&mut self) -> Option<(K, V)> {
        let first = self.first?;
        let hash = self.slot(first).hash;
        let mut prev = None;
        let mut next = self.buckets[self.bini(hash)];
        while let Some(i) = next {
            if i == first {
                return Some(self.unlink(first, prev));
            }
            prev = Some(i);
            next = self.slot(i).next_in_lookup;
        }
        unreachable!("slot {} is not linked into its bucket", first)
    }

    /// Compares keys by identity from now on, rehashing every entry.
    ///
    /// Entries whose keys become the same keep the position of the first one and the value of
    /// the last one.
    pub fn switch_to_identity_equality(&mut self) {
        if self.identity {
            return;
        }
        let entries = IntoIter {
            slots: std::mem::take(&mut self.slots),
            next: self.first,
            remaining: self.len,
        };
        self.free.clear();
        self.buckets = vec![None; self.buckets.len()];
        self.first = None;
        self.last = None;
        self.len = 0;
        self.identity = true;

        for (_, key, value) in entries {
            let hash = self.strategy.hash(&key, true);
            self.insert_hashed(hash, key, value);
        }
    }
}

impl<K, V, S> LocalHashStore<K, V, S> {
    /// Sets the mode of a store that has no entries yet.
    pub(crate) fn set_identity(&mut self, identity: bool) {
        debug_assert!(self.is_empty());
        self.identity = identity;
    }

    /// Splits the store into its strategy and its `(hash, key, value)` entries in order.
    pub(crate) fn into_parts(mut self) -> (S, IntoIter<K, V>) {
        let entries = IntoIter {
            slots: std::mem::take(&mut self.slots),
            next: self.first,
            remaining: self.len,
        };
        (self.strategy, entries)
    }
}

/// An iterator over the entries of a [`LocalHashStore`] in insertion order.
pub struct Iter<'a, K, V, S> {
    store: &'a LocalHashStore<K, V, S>,
    next: Option<usize>,
    remaining: usize,
}

impl<'a, K, V, S> Iterator for Iter<'a, K, V, S> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.store.slot(self.next?);
        self.next = slot.next;
        self.remaining -= 1;
        Some((&slot.key, &slot.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V, S> ExactSizeIterator for Iter<'_, K, V, S> {}

impl<K, V, S> fmt::Debug for Iter<'_, K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("remaining", &self.remaining)
            .finish()
    }
}

/// An owning iterator over the `(hash, key, value)` entries of a [`LocalHashStore`].
pub struct IntoIter<K, V> {
    slots: Vec<Option<Slot<K, V>>>,
    next: Option<usize>,
    remaining: usize,
}

impl<K, V> Iterator for IntoIter<K, V> {
    type Item = (u64, K, V);

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.next?;
        let slot = match self.slots[i].take() {
            Some(slot) => slot,
            None => unreachable!("slot {} is linked but vacant", i),
        };
        self.next = slot.next;
        self.remaining -= 1;
        Some((slot.hash, slot.key, slot.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for IntoIter<K, V> {}

impl<K, V> fmt::Debug for IntoIter<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntoIter")
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl<'a, K, V, S> IntoIterator for &'a LocalHashStore<K, V, S> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K, V, S> IntoIterator for LocalHashStore<K, V, S> {
    type Item = (K, V);
    type IntoIter = std::iter::Map<IntoIter<K, V>, fn((u64, K, V)) -> (K, V)>;

    fn into_iter(self) -> Self::IntoIter {
        let strip: fn((u64, K, V)) -> (K, V) = |(_, k, v)| (k, v);
        self.into_iter_hashed().map(strip)
    }
}

impl<K, V, S> Extend<(K, V)> for LocalHashStore<K, V, S>
where
    S: KeyStrategy<K>,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

impl<K, V, S> FromIterator<(K, V)> for LocalHashStore<K, V, S>
where
    S: KeyStrategy<K> + Default,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let iter = iter.into_iter();
        let mut store = Self::with_capacity_and_strategy(iter.size_hint().0, S::default());
        store.extend(iter);
        store
    }
}

impl<K, V, S> Clone for LocalHashStore<K, V, S>
where
    K: Clone,
    V: Clone,
    S: Clone,
{
    fn clone(&self) -> Self {
        let mut clone = Self::with_capacity_and_strategy(self.len, self.strategy.clone());
        clone.identity = self.identity;
        for (hash, key, value) in self.iter_hashed() {
            clone.push(hash, key.clone(), value.clone());
        }
        clone
    }
}

impl<K, V, S> fmt::Debug for LocalHashStore<K, V, S>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_update_remove() {
        let mut local = LocalHashStore::new();
        assert_eq!(local.insert(1, "a"), None);
        assert_eq!(local.insert(2, "b"), None);
        assert_eq!(local.insert(1, "c"), Some("a"));
        assert_eq!(local.len(), 2);
        assert_eq!(local.get(&1), Some(&"c"));
        assert_eq!(local.remove(&1), Some("c"));
        assert_eq!(local.remove(&1), None);
        assert!(!local.contains_key(&1));
        assert_eq!(local.len(), 1);
    }

    #[test]
    fn order_survives_growth_and_reuse() {
        let mut local = LocalHashStore::new();
        for i in 0..100 {
            local.insert(i, i * 10);
        }
        assert_eq!(local.capacity(), 256);
        for i in (0..100).step_by(2) {
            local.remove(&i);
        }
        for i in 100..110 {
            local.insert(i, i * 10);
        }
        let keys: Vec<_> = local.iter().map(|(k, _)| *k).collect();
        let expected: Vec<_> = (1..100).step_by(2).chain(100..110).collect();
        assert_eq!(keys, expected);
        assert_eq!(local.len(), expected.len());
    }

    #[test]
    fn shift_takes_oldest() {
        let mut local: LocalHashStore<_, _> = vec![("x", 1), ("y", 2)].into_iter().collect();
        assert_eq!(local.shift(), Some(("x", 1)));
        assert_eq!(local.shift(), Some(("y", 2)));
        assert_eq!(local.shift(), None);
        local.insert("z", 3);
        assert_eq!(local.iter().collect::<Vec<_>>(), vec![(&"z", &3)]);
    }

    #[test]
    fn identity_switch_keeps_order() {
        let mut local = LocalHashStore::new();
        for i in 0..20 {
            local.insert(i, i);
        }
        local.switch_to_identity_equality();
        assert!(local.is_identity());
        assert_eq!(local.len(), 20);
        assert_eq!(local.get(&7), Some(&7));
        let keys: Vec<_> = local.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn hashed_iteration_matches_strategy() {
        let mut local = LocalHashStore::new();
        local.insert("k", 1);
        let (hash, key, value) = local.iter_hashed().next().unwrap();
        assert_eq!(hash, local.strategy().hash(&"k", false));
        assert_eq!((key, value), (&"k", &1));

        let owned: Vec<_> = local.clone().into_iter_hashed().collect();
        assert_eq!(owned, vec![(hash, "k", 1)]);
    }
}
