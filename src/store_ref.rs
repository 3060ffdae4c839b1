use crate::error::ConsistencyError;
use crate::iter::{Iter, Keys, Values};
use crate::layout_lock::ThreadToken;
use crate::local::LocalHashStore;
use crate::reclaim::Guard;
use crate::strategy::{DefaultStrategy, KeyStrategy};
use crate::HashStore;
use std::fmt::{self, Debug, Formatter};
use std::ops::Index;

/// A reference to a [`HashStore`], constructed with [`HashStore::pin`].
///
/// It registers the current thread with the store and pins it for as long as it lives, so none
/// of its methods need a [`ThreadToken`] or a [`Guard`]. It can therefore not be shared with or
/// sent to other threads; each thread pins the store on its own.
pub struct HashStoreRef<'store, K, V, S = DefaultStrategy> {
    store: &'store HashStore<K, V, S>,
    token: ThreadToken<'store>,
    guard: Guard<'store>,
}

impl<K, V, S> HashStore<K, V, S> {
    /// Registers the current thread and pins it, returning a reference to the store that needs
    /// neither token nor guard.
    ///
    /// Keep in mind that for as long as you hold onto it, you are preventing the collection of
    /// garbage generated by the store.
    pub fn pin(&self) -> HashStoreRef<'_, K, V, S> {
        HashStoreRef {
            store: self,
            token: self.register_thread(),
            guard: self.guard(),
        }
    }
}

impl<K, V, S> HashStoreRef<'_, K, V, S> {
    /// The store this refers to.
    pub fn store(&self) -> &HashStore<K, V, S> {
        self.store
    }

    /// The token of the current thread.
    pub fn token(&self) -> &ThreadToken<'_> {
        &self.token
    }

    /// The guard pinning the current thread.
    pub fn guard(&self) -> &Guard<'_> {
        &self.guard
    }

    /// Returns the number of entries in the store.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Returns `true` if the store has no entries.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// The number of buckets.
    pub fn capacity(&self) -> usize {
        self.store.capacity()
    }

    /// Returns `true` once keys are compared by identity.
    pub fn is_identity(&self) -> bool {
        self.store.is_identity()
    }

    /// An iterator visiting all key-value pairs in insertion order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        self.store.iter(&self.guard)
    }

    /// An iterator visiting all keys in insertion order.
    pub fn keys(&self) -> Keys<'_, K, V> {
        self.store.keys(&self.guard)
    }

    /// An iterator visiting all values in insertion order.
    pub fn values(&self) -> Values<'_, K, V> {
        self.store.values(&self.guard)
    }

    /// See [`HashStore::each_entry`].
    pub fn each_entry<'g, F>(&'g self, visit: F)
    where
        F: FnMut(usize, &'g K, &'g V),
    {
        self.store.each_entry(&self.guard, visit)
    }

    /// See [`HashStore::each_entry_hashed`].
    pub fn each_entry_hashed<'g, F>(&'g self, visit: F)
    where
        F: FnMut(usize, u64, &'g K, &'g V),
    {
        self.store.each_entry_hashed(&self.guard, visit)
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.store.clear(&self.guard)
    }

    /// See [`HashStore::verify`].
    pub fn verify(&self) -> Result<(), ConsistencyError> {
        self.store.verify(&self.guard)
    }

    /// See [`HashStore::verify_quiescent`].
    pub fn verify_quiescent(&self) -> Result<(), ConsistencyError> {
        self.store.verify_quiescent(&self.guard)
    }
}

impl<K, V, S> HashStoreRef<'_, K, V, S>
where
    S: KeyStrategy<K>,
{
    /// Returns the value to which `key` is mapped.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.store.get(&self.token, key, &self.guard)
    }

    /// Returns the value for `key`, or `default(key)` if there is none.
    pub fn lookup_or_default<F>(&self, key: &K, default: F) -> V
    where
        V: Clone,
        F: FnOnce(&K) -> V,
    {
        self.store
            .lookup_or_default(&self.token, key, default, &self.guard)
    }

    /// Tests if `key` is a key in this store.
    pub fn contains_key(&self, key: &K) -> bool {
        self.store.contains_key(&self.token, key, &self.guard)
    }

    /// Maps `key` to `value`, returning the previous value.
    pub fn set(&self, key: K, value: V) -> Option<&V> {
        self.store.set(&self.token, key, value, &self.guard)
    }

    /// Removes `key`, returning its value.
    pub fn delete(&self, key: &K) -> Result<Option<&V>, ConsistencyError> {
        self.store.delete(&self.token, key, &self.guard)
    }

    /// See [`HashStore::delete_last`].
    pub fn delete_last(&self, expected_key: &K) -> Result<Option<&V>, ConsistencyError> {
        self.store.delete_last(&self.token, expected_key, &self.guard)
    }

    /// Removes the oldest entry and returns it.
    pub fn delete_first(&self) -> Result<Option<(&K, &V)>, ConsistencyError> {
        self.store.delete_first(&self.token, &self.guard)
    }

    /// See [`HashStore::replace_from`].
    pub fn replace_from<T>(&self, other: LocalHashStore<K, V, T>) {
        self.store.replace_from(other, &self.guard)
    }

    /// See [`HashStore::replace_from_store`].
    pub fn replace_from_store<T>(&self, other: &HashStore<K, V, T>)
    where
        K: Clone,
        V: Clone,
        T: KeyStrategy<K> + Clone,
    {
        self.store.replace_from_store(other, &self.guard)
    }

    /// See [`HashStore::to_local`].
    pub fn to_local(&self) -> LocalHashStore<K, V, S>
    where
        K: Clone,
        V: Clone,
        S: Clone,
    {
        self.store.to_local(&self.token, &self.guard)
    }
}

impl<K, V, S> HashStoreRef<'_, K, V, S>
where
    K: Clone,
    V: Clone,
    S: KeyStrategy<K> + Clone,
{
    /// See [`HashStore::rehash`].
    pub fn rehash(&self) {
        self.store.rehash(&self.guard)
    }

    /// See [`HashStore::switch_to_identity_equality_and_rehash`].
    pub fn switch_to_identity_equality_and_rehash(&self) {
        self.store
            .switch_to_identity_equality_and_rehash(&self.guard)
    }
}

impl<'g, K, V, S> IntoIterator for &'g HashStoreRef<'_, K, V, S> {
    type IntoIter = Iter<'g, K, V>;
    type Item = (&'g K, &'g V);

    fn into_iter(self) -> Self::IntoIter {
        self.store.iter(&self.guard)
    }
}

impl<K, V, S> Debug for HashStoreRef<'_, K, V, S>
where
    K: Debug,
    V: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self).finish()
    }
}

impl<K, V, S> Index<&'_ K> for HashStoreRef<'_, K, V, S>
where
    S: KeyStrategy<K>,
{
    type Output = V;

    fn index(&self, key: &K) -> &V {
        self.get(key).expect("no entry found for key")
    }
}
