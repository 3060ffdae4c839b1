use crate::entry::Entry;
use crate::reclaim::{Guard, Shared};
use std::fmt;

/// Walks the sequence chain from a first entry up to TAIL, stepping over removal markers.
///
/// The walk takes no lock. An entry being removed while we pass it may still be yielded; an
/// entry that is live for the whole walk is yielded exactly once. Entries of a generation that a
/// layout change replaced meanwhile stay linked to TAIL, so a walk that started on them finishes
/// on them.
pub(crate) struct EntryIter<'g, K, V> {
    next: Shared<'g, Entry<K, V>>,
    tail: Shared<'g, Entry<K, V>>,
    guard: &'g Guard<'g>,
}

impl<'g, K, V> EntryIter<'g, K, V> {
    pub(crate) fn new(
        first: Shared<'g, Entry<K, V>>,
        tail: Shared<'g, Entry<K, V>>,
        guard: &'g Guard<'g>,
    ) -> Self {
        Self {
            next: first,
            tail,
            guard,
        }
    }
}

impl<'g, K, V> Iterator for EntryIter<'g, K, V> {
    type Item = Shared<'g, Entry<K, V>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == self.tail {
            return None;
        }
        let current = self.next;
        // safety: every entry we reach was loaded under `guard`, and is only reclaimed after the
        // guard is dropped
        self.next = unsafe { current.deref() }.next_live(self.guard);
        Some(current)
    }
}

impl<K, V> fmt::Debug for EntryIter<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryIter")
            .field("next", &self.next)
            .field("tail", &self.tail)
            .finish()
    }
}
