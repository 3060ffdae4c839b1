use crate::reclaim::{Atomic, Guard, Linked, Shared};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// What an [`Entry`] stands for in the chains it is linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// A user entry with a key and a value.
    Data,
    /// HEAD or TAIL of the sequence chain.
    Sentinel,
    /// Marks the `next` link it replaces as deleted; its own `next` is the real successor.
    Removed,
    /// Placed on a predecessor's `next_in_sequence` while its successor is being unlinked,
    /// so that two adjacent entries cannot be unlinked at once. Its `next` is that successor.
    Lock,
}

/// A node of the store.
///
/// Data entries are linked into two chains at once: the singly-linked lookup chain of their
/// bucket and the doubly-linked sequence chain that records insertion order. Markers only ever
/// appear as the target of a `next_in_sequence` or `next_in_lookup` link, never as a bucket
/// head and never in a `prev_in_sequence` link; a marker's own successor is never a marker.
pub(crate) struct Entry<K, V> {
    pub(crate) hash: u64,
    key: Option<K>,
    pub(crate) value: Atomic<V>,
    pub(crate) next_in_lookup: Atomic<Entry<K, V>>,
    pub(crate) prev_in_sequence: Atomic<Entry<K, V>>,
    pub(crate) next_in_sequence: Atomic<Entry<K, V>>,
    kind: Kind,
    published: AtomicBool,
}

impl<K, V> Entry<K, V> {
    pub(crate) fn new(hash: u64, key: K, value: Shared<'_, V>, published: bool) -> Self {
        Self {
            hash,
            key: Some(key),
            value: Atomic::from(value),
            next_in_lookup: Atomic::null(),
            prev_in_sequence: Atomic::null(),
            next_in_sequence: Atomic::null(),
            kind: Kind::Data,
            published: AtomicBool::new(published),
        }
    }

    pub(crate) fn sentinel() -> Self {
        Self::marker(Kind::Sentinel)
    }

    /// A removed marker for a sequence link, pointing at the real successor.
    pub(crate) fn removed_in_sequence(next: Shared<'_, Entry<K, V>>) -> Self {
        let marker = Self::marker(Kind::Removed);
        marker.next_in_sequence.store(next, Ordering::Relaxed);
        marker
    }

    /// A lock marker that blocks the predecessor of `entry` while `entry` is unlinked.
    pub(crate) fn lock_before(entry: Shared<'_, Entry<K, V>>) -> Self {
        let marker = Self::marker(Kind::Lock);
        marker.next_in_sequence.store(entry, Ordering::Relaxed);
        marker
    }

    /// A removed marker for a lookup link. Its successor is filled in by the deleting thread.
    pub(crate) fn removed_in_lookup() -> Self {
        Self::marker(Kind::Removed)
    }

    fn marker(kind: Kind) -> Self {
        Self {
            hash: 0,
            key: None,
            value: Atomic::null(),
            next_in_lookup: Atomic::null(),
            prev_in_sequence: Atomic::null(),
            next_in_sequence: Atomic::null(),
            kind,
            published: AtomicBool::new(false),
        }
    }

    pub(crate) fn kind(&self) -> Kind {
        self.kind
    }

    /// Both lock and removed markers count as removed.
    pub(crate) fn is_removed(&self) -> bool {
        matches!(self.kind, Kind::Removed | Kind::Lock)
    }

    pub(crate) fn is_lock(&self) -> bool {
        self.kind == Kind::Lock
    }

    pub(crate) fn is_sentinel(&self) -> bool {
        self.kind == Kind::Sentinel
    }

    pub(crate) fn is_published(&self) -> bool {
        self.published.load(Ordering::SeqCst)
    }

    pub(crate) fn publish(&self) {
        self.published.store(true, Ordering::SeqCst);
    }

    pub(crate) fn has_key(&self) -> bool {
        self.key.is_some()
    }

    pub(crate) fn key(&self) -> &K {
        match self.key {
            Some(ref key) => key,
            None => unreachable!("a {:?} entry carries no key", self.kind),
        }
    }

    /// Loads the current value of a data entry.
    pub(crate) fn value<'g>(&self, guard: &'g Guard<'_>) -> &'g V {
        let value = self.value.load(Ordering::SeqCst, guard);
        assert!(!value.is_null(), "a {:?} entry carries no value", self.kind);
        // safety: values are only retired after being swapped out of an entry, or together with
        // their entry, and we loaded it under `guard`.
        unsafe { &**value.deref() }
    }

    /// The successor in insertion order, stepping over at most one marker.
    pub(crate) fn next_live<'g>(&self, guard: &'g Guard<'_>) -> Shared<'g, Entry<K, V>> {
        let mut next = self.next_in_sequence.load(Ordering::SeqCst, guard);
        // safety: sequence links are never null below TAIL, and everything reachable from an
        // entry we could load under `guard` stays alive for as long as `guard` does.
        let n = unsafe { next.deref() };
        if n.is_removed() {
            next = n.next_in_sequence.load(Ordering::SeqCst, guard);
        }
        debug_assert!(!unsafe { next.deref() }.is_removed());
        next
    }

    /// Installs `value`, returning the one it replaces.
    pub(crate) fn swap_value<'g>(
        &self,
        value: Shared<'_, V>,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, V> {
        self.value.swap(value, Ordering::SeqCst, guard)
    }

    /// Takes the key back out of an entry that was never made visible to another thread.
    pub(crate) fn into_key(entry: Box<Linked<Entry<K, V>>>) -> K {
        let mut entry = Linked::into_inner(*entry);
        // the value is still owned by the caller
        entry.value = Atomic::null();
        match entry.key.take() {
            Some(key) => key,
            None => unreachable!("only data entries are handed back"),
        }
    }
}

impl<K, V> Drop for Entry<K, V> {
    fn drop(&mut self) {
        // safety: an entry is dropped only once nobody can observe it anymore, and the value it
        // currently links to is owned by it; replaced values were retired on their own.
        drop(unsafe { self.value.take_box() });
    }
}

impl<K, V> fmt::Debug for Entry<K, V>
where
    K: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key {
            Some(ref key) => write!(f, "{:?}", key),
            None => write!(f, "{:?}", self.kind),
        }
    }
}
