use crate::entry::Entry;
use crate::reclaim::{Atomic, Guard, Shared};
use std::fmt::Write;
use std::sync::atomic::Ordering;

/// The smallest bucket array a store ever uses.
pub(crate) const INITIAL_CAPACITY: usize = 8;

/// The largest bucket array a store grows to. Past this the load factor is allowed to exceed
/// 3/4 and chains simply get longer.
pub(crate) const MAXIMUM_CAPACITY: usize = 1 << 30;

/// Whether `size` entries overflow `capacity` buckets.
#[inline]
pub(crate) fn exceeds_load_factor(size: usize, capacity: usize) -> bool {
    // size / capacity > 3/4
    size.saturating_mul(4) > capacity.saturating_mul(3) && capacity < MAXIMUM_CAPACITY
}

/// The capacity to grow to once `size` entries no longer fit: the smallest power of two strictly
/// greater than twice the size, so a freshly grown array is at most half full.
pub(crate) fn growth_capacity(size: usize) -> usize {
    let wanted = size.saturating_mul(2).saturating_add(1);
    wanted
        .checked_next_power_of_two()
        .unwrap_or(MAXIMUM_CAPACITY)
        .clamp(INITIAL_CAPACITY, MAXIMUM_CAPACITY)
}

/// The capacity that holds `size` entries without growing.
pub(crate) fn capacity_for(size: usize) -> usize {
    let mut capacity = INITIAL_CAPACITY;
    while exceeds_load_factor(size, capacity) {
        capacity <<= 1;
    }
    capacity
}

/// The bucket array: one lookup-chain head per bucket.
///
/// A table is never resized in place. Layout changes build a new one, swap it into the store and
/// retire the old one, so a reader that loaded a table can keep scanning it safely.
pub(crate) struct Table<K, V> {
    bins: Box<[Atomic<Entry<K, V>>]>,
}

impl<K, V> Table<K, V> {
    pub(crate) fn new(bins: usize) -> Self {
        debug_assert!(bins.is_power_of_two());
        Self {
            bins: (0..bins).map(|_| Atomic::null()).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.bins.len()
    }

    #[inline]
    pub(crate) fn bini(&self, hash: u64) -> usize {
        let mask = self.bins.len() as u64 - 1;
        (hash & mask) as usize
    }

    #[inline]
    pub(crate) fn bin<'g>(&self, i: usize, guard: &'g Guard<'_>) -> Shared<'g, Entry<K, V>> {
        self.bins[i].load(Ordering::SeqCst, guard)
    }

    #[inline]
    pub(crate) fn cas_bin<'g>(
        &self,
        i: usize,
        current: Shared<'_, Entry<K, V>>,
        new: Shared<'_, Entry<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Result<Shared<'g, Entry<K, V>>, Shared<'g, Entry<K, V>>> {
        self.bins[i].compare_exchange(current, new, guard)
    }

    #[inline]
    pub(crate) fn store_bin(&self, i: usize, new: Shared<'_, Entry<K, V>>) {
        self.bins[i].store(new, Ordering::SeqCst)
    }

    /// Pushes `entry` onto the head of its bucket. Only for tables no other thread can see yet,
    /// or for use inside a layout change.
    pub(crate) fn push_exclusive(&self, entry: Shared<'_, Entry<K, V>>, guard: &Guard<'_>) {
        // safety: the caller hands us a live entry
        let e = unsafe { entry.deref() };
        let i = self.bini(e.hash);
        e.next_in_lookup.store(self.bin(i, guard), Ordering::SeqCst);
        self.store_bin(i, entry);
    }

    /// Renders one bucket's chain as `[hash ...]`, skipping markers.
    pub(crate) fn dump_bin(&self, i: usize, guard: &Guard<'_>) -> String {
        let mut out = String::from("[");
        let mut entry = self.bin(i, guard);
        let mut first = true;
        while !entry.is_null() {
            // safety: loaded under `guard`
            let e = unsafe { entry.deref() };
            if !e.is_removed() {
                if !first {
                    out.push(' ');
                }
                let _ = write!(out, "{:#x}@{:p}", e.hash, entry.as_ptr());
                first = false;
            }
            entry = e.next_in_lookup.load(Ordering::SeqCst, guard);
        }
        out.push(']');
        out
    }

    /// Renders every bucket, one per line.
    pub(crate) fn dump(&self, guard: &Guard<'_>) -> String {
        let mut out = String::new();
        for i in 0..self.len() {
            let _ = writeln!(out, "{}: {}", i, self.dump_bin(i, guard));
        }
        out
    }
}
