mod traverser;
pub(crate) use traverser::EntryIter;

use crate::reclaim::Guard;
use std::fmt;

/// An iterator over a store's entries in insertion order.
///
/// See [`HashStore::iter`](crate::HashStore::iter) for details.
pub struct Iter<'g, K, V> {
    pub(crate) entries: EntryIter<'g, K, V>,
    pub(crate) guard: &'g Guard<'g>,
}

impl<'g, K: 'g, V: 'g> Iterator for Iter<'g, K, V> {
    type Item = (&'g K, &'g V);
    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.next()?;
        // safety: the store does not reclaim entries until after guard drop
        let entry = unsafe { entry.deref() };
        Some((entry.key(), entry.value(self.guard)))
    }
}

/// An iterator over a store's keys in insertion order.
///
/// See [`HashStore::keys`](crate::HashStore::keys) for details.
pub struct Keys<'g, K, V> {
    pub(crate) entries: EntryIter<'g, K, V>,
}

impl<'g, K: 'g, V: 'g> Iterator for Keys<'g, K, V> {
    type Item = &'g K;
    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.next()?;
        // safety: the store does not reclaim entries until after guard drop
        Some(unsafe { entry.deref() }.key())
    }
}

/// An iterator over a store's values in insertion order.
///
/// See [`HashStore::values`](crate::HashStore::values) for details.
pub struct Values<'g, K, V> {
    pub(crate) entries: EntryIter<'g, K, V>,
    pub(crate) guard: &'g Guard<'g>,
}

impl<'g, K: 'g, V: 'g> Iterator for Values<'g, K, V> {
    type Item = &'g V;
    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.next()?;
        // safety: the store does not reclaim entries until after guard drop
        Some(unsafe { entry.deref() }.value(self.guard))
    }
}

macro_rules! debug_iter {
    ($($name:ident),*) => {$(
        impl<K, V> fmt::Debug for $name<'_, K, V> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("entries", &self.entries)
                    .finish()
            }
        }
    )*};
}

debug_iter!(Iter, Keys, Values);

#[cfg(test)]
mod tests {
    use crate::HashStore;
    use std::collections::HashSet;

    #[test]
    fn iter() {
        let store = HashStore::<usize, usize>::new();
        let token = store.register_thread();
        let guard = store.guard();
        store.set(&token, 1, 42, &guard);
        store.set(&token, 2, 84, &guard);

        assert_eq!(
            store.iter(&guard).collect::<Vec<(&usize, &usize)>>(),
            vec![(&1, &42), (&2, &84)]
        );
    }

    #[test]
    fn keys() {
        let store = HashStore::<usize, usize>::new();
        let token = store.register_thread();
        let guard = store.guard();
        store.set(&token, 1, 42, &guard);
        store.set(&token, 2, 84, &guard);

        let keys: HashSet<&usize> = store.keys(&guard).collect();
        assert_eq!(keys, [&1, &2].iter().copied().collect());
    }

    #[test]
    fn values() {
        let store = HashStore::<usize, usize>::new();
        let token = store.register_thread();
        let guard = store.guard();
        store.set(&token, 1, 42, &guard);
        store.set(&token, 2, 84, &guard);
        store.set(&token, 1, 21, &guard);

        assert_eq!(store.values(&guard).collect::<Vec<&usize>>(), vec![&21, &84]);
    }

    #[test]
    fn skips_removed() {
        let store = HashStore::<usize, usize>::new();
        let token = store.register_thread();
        let guard = store.guard();
        for i in 0..4 {
            store.set(&token, i, i, &guard);
        }
        store.delete(&token, &1, &guard).unwrap();
        store.delete(&token, &3, &guard).unwrap();
        assert_eq!(store.keys(&guard).copied().collect::<Vec<_>>(), vec![0, 2]);
    }
}
