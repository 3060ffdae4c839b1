use crate::config::{Checkpoint, Config, SpinPolicy};
use crate::entry::Entry;
use crate::error::ConsistencyError;
use crate::iter::{EntryIter, Iter, Keys, Values};
use crate::layout_lock::{LayoutChange, LayoutLock, ThreadToken};
use crate::local::LocalHashStore;
use crate::raw::{self, Table};
use crate::reclaim::{Atomic, Collector, Guard, RetireShared, Shared};
use crate::strategy::{DefaultStrategy, KeyStrategy};
use std::fmt;
use std::iter::FromIterator;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// A concurrent hash store that remembers insertion order.
///
/// Any number of threads may look up, insert, update and delete entries at the same time. None
/// of these operations takes a lock on its common path: lookups are optimistic and retried if a
/// _layout change_ interleaves, and writes only announce themselves in a per-thread register.
/// Layout changes (growing the bucket array, rehashing, switching to identity equality,
/// clearing, replacing the contents) are rare and run exclusively; see
/// [`LayoutLock`](crate::layout_lock::LayoutLock).
///
/// Entries are kept in two chains at once: the lookup chain of their bucket, and a global
/// sequence chain in insertion order. Traversals walk the sequence chain without any lock, and
/// always see every entry that was live for the whole traversal exactly once, in order.
///
/// # Threads and guards
///
/// Every thread that operates on a store first registers with it through
/// [`register_thread`](HashStore::register_thread) and passes the returned [`ThreadToken`] to
/// each operation. Memory of removed entries is reclaimed with [`seize`]: operations take a
/// [`Guard`](seize::Guard) from [`guard`](HashStore::guard), and references they return live
/// as long as that guard does. [`pin`](HashStore::pin) bundles both for convenience.
///
/// ```
/// use seqhash::HashStore;
///
/// let store = HashStore::new();
/// let token = store.register_thread();
/// let guard = store.guard();
///
/// store.set(&token, "a", 1, &guard);
/// store.set(&token, "b", 2, &guard);
/// assert_eq!(store.set(&token, "a", 3, &guard), Some(&1));
/// assert_eq!(store.get(&token, &"a", &guard), Some(&3));
///
/// let keys: Vec<_> = store.keys(&guard).copied().collect();
/// assert_eq!(keys, vec!["a", "b"]);
/// ```
pub struct HashStore<K, V, S = DefaultStrategy> {
    /// The current bucket array. Only replaced during a layout change.
    buckets: Atomic<Table<K, V>>,

    /// Sentinels of the sequence chain. Neither ever changes.
    head: Atomic<Entry<K, V>>,
    tail: Atomic<Entry<K, V>>,

    /// Only changed under a write or during a layout change.
    size: AtomicUsize,

    /// Only changed during a layout change, and only ever from `false` to `true`.
    identity: AtomicBool,

    lock: LayoutLock,

    /// Shared with the temporary stores rehashing builds, so their entries can be adopted.
    collector: Arc<Collector>,

    strategy: S,
    spin: SpinPolicy,
    checkpoint: Option<Checkpoint>,

    _kv: PhantomData<*const (K, V)>,
}

// Safety: keys and values are shared between threads and may be dropped by any of them.
unsafe impl<K, V, S> Send for HashStore<K, V, S>
where
    K: Send + Sync,
    V: Send + Sync,
    S: Send,
{
}

unsafe impl<K, V, S> Sync for HashStore<K, V, S>
where
    K: Send + Sync,
    V: Send + Sync,
    S: Sync,
{
}

/// The outcome of a lookup: the bucket array and bucket it looked at, the equality mode and hash
/// it used, the first entry of that bucket and the entry that was found, if any.
struct Lookup<'g, K, V> {
    table: Shared<'g, Table<K, V>>,
    identity: bool,
    hash: u64,
    index: usize,
    first: Shared<'g, Entry<K, V>>,
    entry: Shared<'g, Entry<K, V>>,
}

impl<K, V> HashStore<K, V, DefaultStrategy> {
    /// Creates an empty store with room for a handful of entries.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates an empty store that holds `n` entries before it first grows.
    pub fn with_capacity(n: usize) -> Self {
        Self::with_config(Config::default().initial_capacity(n))
    }

    /// Creates an empty store with the given configuration.
    pub fn with_config(config: Config) -> Self {
        Self::with_config_and_strategy(config, DefaultStrategy::default())
    }
}

impl<K, V> Default for HashStore<K, V, DefaultStrategy> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> HashStore<K, V, S> {
    /// Creates an empty store that hashes and compares keys with `strategy`.
    pub fn with_strategy(strategy: S) -> Self {
        Self::with_config_and_strategy(Config::default(), strategy)
    }

    /// Creates an empty store that holds `n` entries before it first grows, and hashes and
    /// compares keys with `strategy`.
    pub fn with_capacity_and_strategy(n: usize, strategy: S) -> Self {
        Self::with_config_and_strategy(Config::default().initial_capacity(n), strategy)
    }

    /// Creates an empty store with the given configuration and key strategy.
    pub fn with_config_and_strategy(config: Config, strategy: S) -> Self {
        Self::build(
            raw::capacity_for(config.initial_capacity),
            strategy,
            config.spin,
            config.checkpoint,
            Arc::new(Collector::new()),
        )
    }

    fn build(
        capacity: usize,
        strategy: S,
        spin: SpinPolicy,
        checkpoint: Option<Checkpoint>,
        collector: Arc<Collector>,
    ) -> Self {
        let head = Shared::boxed(Entry::sentinel(), &collector);
        let tail = Shared::boxed(Entry::sentinel(), &collector);
        // safety: both were just allocated and nobody else has seen them
        unsafe {
            head.deref().next_in_sequence.store(tail, Ordering::SeqCst);
            tail.deref().prev_in_sequence.store(head, Ordering::SeqCst);
            head.deref().publish();
            tail.deref().publish();
        }
        let table = Shared::boxed(Table::new(capacity), &collector);

        Self {
            buckets: Atomic::from(table),
            head: Atomic::from(head),
            tail: Atomic::from(tail),
            size: AtomicUsize::new(0),
            identity: AtomicBool::new(false),
            lock: LayoutLock::with_spin_policy(spin),
            collector,
            strategy,
            spin,
            checkpoint,
            _kv: PhantomData,
        }
    }

    /// Pin a `Guard` for use with this store.
    ///
    /// Keep in mind that for as long as you hold onto this `Guard`, you are preventing the
    /// collection of garbage generated by the store.
    pub fn guard(&self) -> Guard<'_> {
        self.collector.enter()
    }

    #[inline]
    fn check_guard(&self, guard: &Guard<'_>) {
        // guard.collector() may be `None` if it is unprotected
        if let Some(c) = guard.collector() {
            assert!(
                Collector::ptr_eq(c, &self.collector),
                "guard belongs to a different collector than this store"
            );
        }
    }

    /// Registers the calling thread with this store.
    ///
    /// The token must be passed to every operation the thread performs on the store. Dropping it
    /// unregisters the thread.
    pub fn register_thread(&self) -> ThreadToken<'_> {
        self.lock.register_thread()
    }

    #[inline]
    fn check_token(&self, token: &ThreadToken<'_>) {
        assert!(
            self.lock.owns(token),
            "thread token was registered with a different store"
        );
    }

    /// The number of entries in the store.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    /// Returns `true` if the store has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of buckets.
    pub fn capacity(&self) -> usize {
        let guard = self.guard();
        let table = self.buckets.load(Ordering::SeqCst, &guard);
        // safety: the bucket array is never null and we loaded it under `guard`
        unsafe { table.deref() }.len()
    }

    /// Returns `true` once keys are compared by identity.
    pub fn is_identity(&self) -> bool {
        self.identity.load(Ordering::SeqCst)
    }

    /// The key strategy.
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    fn head<'g>(&self, guard: &'g Guard<'_>) -> Shared<'g, Entry<K, V>> {
        self.head.load(Ordering::SeqCst, guard)
    }

    fn tail<'g>(&self, guard: &'g Guard<'_>) -> Shared<'g, Entry<K, V>> {
        self.tail.load(Ordering::SeqCst, guard)
    }

    /// The first live entry, or TAIL.
    fn first_entry<'g>(&self, guard: &'g Guard<'_>) -> Shared<'g, Entry<K, V>> {
        // safety: sentinels live as long as the store
        unsafe { self.head(guard).deref() }.next_live(guard)
    }

    pub(crate) fn entries<'g>(&'g self, guard: &'g Guard<'_>) -> EntryIter<'g, K, V> {
        EntryIter::new(self.first_entry(guard), self.tail(guard), guard)
    }

    fn checkpoint(&self) {
        if let Some(ref checkpoint) = self.checkpoint {
            checkpoint();
        }
    }

    /// An iterator visiting all key-value pairs in insertion order.
    ///
    /// The iterator holds no lock. Entries inserted or removed while it runs may or may not be
    /// visited; every other entry is visited exactly once.
    pub fn iter<'g>(&'g self, guard: &'g Guard<'_>) -> Iter<'g, K, V> {
        self.check_guard(guard);
        Iter {
            entries: self.entries(guard),
            guard,
        }
    }

    /// An iterator visiting all keys in insertion order.
    pub fn keys<'g>(&'g self, guard: &'g Guard<'_>) -> Keys<'g, K, V> {
        self.check_guard(guard);
        Keys {
            entries: self.entries(guard),
        }
    }

    /// An iterator visiting all values in insertion order.
    pub fn values<'g>(&'g self, guard: &'g Guard<'_>) -> Values<'g, K, V> {
        self.check_guard(guard);
        Values {
            entries: self.entries(guard),
            guard,
        }
    }

    /// Calls `visit` with the position, key and value of every entry, in insertion order.
    ///
    /// The configured [checkpoint](Config::checkpoint) runs after each entry.
    pub fn each_entry<'g, F>(&'g self, guard: &'g Guard<'_>, mut visit: F)
    where
        F: FnMut(usize, &'g K, &'g V),
    {
        self.check_guard(guard);
        for (i, entry) in self.entries(guard).enumerate() {
            // safety: yielded entries were loaded under `guard`
            let e = unsafe { entry.deref() };
            visit(i, e.key(), e.value(guard));
            self.checkpoint();
        }
    }

    /// Like [`each_entry`](Self::each_entry), but also passes the hash each entry is stored under.
    pub fn each_entry_hashed<'g, F>(&'g self, guard: &'g Guard<'_>, mut visit: F)
    where
        F: FnMut(usize, u64, &'g K, &'g V),
    {
        self.check_guard(guard);
        for (i, entry) in self.entries(guard).enumerate() {
            // safety: yielded entries were loaded under `guard`
            let e = unsafe { entry.deref() };
            visit(i, e.hash, e.key(), e.value(guard));
            self.checkpoint();
        }
    }

    /// Appends an unpublished entry to the sequence chain and publishes it.
    ///
    /// Must run under a write.
    fn append(&self, entry: Shared<'_, Entry<K, V>>, guard: &Guard<'_>) {
        let tail = self.tail(guard);
        // safety: the sentinel lives as long as the store, and `entry` is ours
        let (t, e) = unsafe { (tail.deref(), entry.deref()) };

        // last -> TAIL becomes last -> entry -> TAIL
        let mut last;
        loop {
            last = t.prev_in_sequence.load(Ordering::SeqCst, guard);
            e.prev_in_sequence.store(last, Ordering::SeqCst);
            // safety: loaded under `guard`
            let l = unsafe { last.deref() };
            if !l.is_removed()
                && l
                    .next_in_sequence
                    .compare_exchange(tail, entry, guard)
                    .is_ok()
            {
                break;
            }
        }

        let mut spinner = self.spin.spinner();
        while t
            .prev_in_sequence
            .compare_exchange(last, entry, guard)
            .is_err()
        {
            spinner.spin();
        }

        e.publish();
    }

    /// Unlinks a data entry from the sequence chain.
    ///
    /// Returns `false` if another thread is already removing it. Must run under a write.
    fn remove_from_sequence(&self, entry: Shared<'_, Entry<K, V>>, guard: &Guard<'_>) -> bool {
        // safety: `entry` was loaded under `guard`
        let e = unsafe { entry.deref() };
        debug_assert!(e.has_key());
        let mut spinner = self.spin.spinner();
        while !e.is_published() {
            spinner.spin();
        }

        // entry -> next becomes entry -> removed -> next, so no insertion after entry gets lost
        let removed = Shared::boxed(Entry::removed_in_sequence(Shared::null()), &self.collector);
        // safety: we just allocated it
        let r = unsafe { removed.deref() };
        let next = loop {
            let next = e.next_in_sequence.load(Ordering::SeqCst, guard);
            // safety: loaded under `guard`
            let n = unsafe { next.deref() };
            if n.is_lock() {
                // next is being removed
                let mut spinner = self.spin.spinner();
                // safety: as above
                while unsafe { e.next_in_sequence.load(Ordering::SeqCst, guard).deref() }.is_lock()
                {
                    spinner.spin();
                }
            } else if n.is_removed() {
                // someone else is removing entry
                // safety: nobody else has seen the marker
                drop(unsafe { removed.into_box() });
                return false;
            } else {
                r.next_in_sequence.store(next, Ordering::SeqCst);
                if e
                    .next_in_sequence
                    .compare_exchange(next, removed, guard)
                    .is_ok()
                {
                    break next;
                }
            }
        };

        // prev -> entry becomes prev -> lock -> entry, so prev cannot be removed meanwhile
        let lock = Shared::boxed(Entry::lock_before(entry), &self.collector);
        let prev = loop {
            let prev = e.prev_in_sequence.load(Ordering::SeqCst, guard);
            // safety: loaded under `guard`
            let p = unsafe { prev.deref() };
            debug_assert!(!p.is_removed());
            let prev_next = p.next_in_sequence.load(Ordering::SeqCst, guard);
            // safety: as above
            if unsafe { prev_next.deref() }.is_removed() {
                // prev is being removed; wait for it to relink entry
                let mut spinner = self.spin.spinner();
                while e.prev_in_sequence.load(Ordering::SeqCst, guard) == prev {
                    spinner.spin();
                }
            } else if p
                .next_in_sequence
                .compare_exchange(entry, lock, guard)
                .is_ok()
            {
                break prev;
            }
        };

        // prev -> lock -> entry -> removed -> next is now frozen
        // safety: loaded under `guard`
        let (p, n) = unsafe { (prev.deref(), next.deref()) };
        p.next_in_sequence.store(next, Ordering::SeqCst);
        let mut spinner = self.spin.spinner();
        while n
            .prev_in_sequence
            .compare_exchange(entry, prev, guard)
            .is_err()
        {
            spinner.spin();
        }

        // safety: the lock marker is no longer reachable from the chain
        unsafe { guard.retire_shared(lock) };
        true
    }

    /// Unlinks a data entry from the lookup chain of its bucket in `table`.
    ///
    /// Must run under a write, on the entry this thread removed from the sequence chain.
    fn remove_from_lookup(
        &self,
        entry: Shared<'_, Entry<K, V>>,
        table: Shared<'_, Table<K, V>>,
        guard: &Guard<'_>,
    ) -> Result<(), ConsistencyError> {
        // safety: both were loaded under `guard`
        let (e, t) = unsafe { (entry.deref(), table.deref()) };
        let index = t.bini(e.hash);

        // block insertions after entry so that adjacent removals serialize
        let removed = Shared::boxed(Entry::removed_in_lookup(), &self.collector);
        // safety: we just allocated it
        let r = unsafe { removed.deref() };
        let next = loop {
            let next = e.next_in_lookup.load(Ordering::SeqCst, guard);
            r.next_in_lookup.store(next, Ordering::SeqCst);
            if e
                .next_in_lookup
                .compare_exchange(next, removed, guard)
                .is_ok()
            {
                break next;
            }
        };

        let mut spinner = self.spin.spinner();
        loop {
            match self.find_previous_in_lookup(t, index, entry, guard)? {
                None => {
                    if t.cas_bin(index, entry, next, guard).is_ok() {
                        return Ok(());
                    }
                }
                Some(prev) => {
                    // safety: loaded under `guard`
                    let p = unsafe { prev.deref() };
                    if p.is_removed() {
                        // prev is being removed
                        spinner.spin();
                    } else if p
                        .next_in_lookup
                        .compare_exchange(entry, next, guard)
                        .is_ok()
                    {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Finds the entry that links to `entry` in bucket `index`, `None` if it is the bucket head.
    fn find_previous_in_lookup<'g>(
        &self,
        table: &Table<K, V>,
        index: usize,
        entry: Shared<'_, Entry<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Result<Option<Shared<'g, Entry<K, V>>>, ConsistencyError> {
        // entries keep their identity across layout changes, so searching by address suffices
        let mut prev = None;
        let mut e = table.bin(index, guard);
        while !e.is_null() {
            if e.as_ptr() == entry.as_ptr() {
                return Ok(prev);
            }
            prev = Some(e);
            // safety: loaded under `guard`
            e = unsafe { e.deref() }.next_in_lookup.load(Ordering::SeqCst, guard);
        }

        // safety: `entry` was loaded under `guard`
        let hash = unsafe { entry.deref() }.hash;
        let err = ConsistencyError::PredecessorNotFound {
            index,
            hash,
            dump: format!(
                "searched {}\nsize = {}\n{}",
                table.dump_bin(index, guard),
                self.len(),
                table.dump(guard)
            ),
        };
        error!(index, hash, "{}", err);
        Err(err)
    }

    /// Removes an entry found by a lookup from both chains and retires it.
    ///
    /// Returns `Ok(false)` if another thread removed it first. Must run under a write, with
    /// `table` being the current bucket array.
    fn remove_entry(
        &self,
        entry: Shared<'_, Entry<K, V>>,
        table: Shared<'_, Table<K, V>>,
        guard: &Guard<'_>,
    ) -> Result<bool, ConsistencyError> {
        if !self.remove_from_sequence(entry, guard) {
            return Ok(false);
        }
        self.size.fetch_sub(1, Ordering::SeqCst);
        self.remove_from_lookup(entry, table, guard)?;
        // safety: unlinked from both chains above
        unsafe { self.retire_entry(entry, guard) };
        Ok(true)
    }

    /// Retires an entry along with the removal markers it links to.
    ///
    /// # Safety
    ///
    /// The entry must be unreachable from the store's chains and bucket array.
    unsafe fn retire_entry(&self, entry: Shared<'_, Entry<K, V>>, guard: &Guard<'_>) {
        // safety: loaded under `guard` by the caller
        let e = unsafe { entry.deref() };
        for link in [&e.next_in_sequence, &e.next_in_lookup] {
            let next = link.load(Ordering::SeqCst, guard);
            // safety: markers are owned by the entry that links to them
            if !next.is_null() && unsafe { next.deref() }.is_removed() {
                unsafe { guard.retire_shared(next) };
            }
        }
        // safety: guaranteed by the caller
        unsafe { guard.retire_shared(entry) };
    }

    /// Links entries that nobody else can see yet at the end of both chains.
    ///
    /// Must run during a layout change or on a store no other thread has access to.
    fn bulk_insert<I>(&self, entries: I, guard: &Guard<'_>)
    where
        I: IntoIterator<Item = (u64, K, V)>,
    {
        let table = self.buckets.load(Ordering::SeqCst, guard);
        let tail = self.tail(guard);
        // safety: the bucket array and the sentinel are live
        let (table, t) = unsafe { (table.deref(), tail.deref()) };
        for (hash, key, value) in entries {
            let value = Shared::boxed(value, &self.collector);
            let entry = Shared::boxed(Entry::new(hash, key, value, true), &self.collector);
            table.push_exclusive(entry, guard);

            let last = t.prev_in_sequence.load(Ordering::SeqCst, guard);
            // safety: `entry` is ours, `last` is a live entry or HEAD
            unsafe {
                last.deref().next_in_sequence.store(entry, Ordering::SeqCst);
                entry.deref().prev_in_sequence.store(last, Ordering::SeqCst);
                entry.deref().next_in_sequence.store(tail, Ordering::SeqCst);
            }
            t.prev_in_sequence.store(entry, Ordering::SeqCst);
        }
    }

    /// Grows the bucket array if the current entries still overflow it.
    fn resize(&self, guard: &Guard<'_>) {
        let change = self.lock.start_layout_change();

        let table = self.buckets.load(Ordering::SeqCst, guard);
        // safety: the bucket array is never null
        let capacity = unsafe { table.deref() }.len();
        let size = self.len();
        if !raw::exceeds_load_factor(size, capacity) {
            // another thread resized first
            return;
        }

        let new_capacity = raw::growth_capacity(size);
        let new_table = Table::new(new_capacity);
        // readers still scanning the old array may follow the rethreaded links, so they only
        // ever point to entries earlier in the sequence
        for entry in self.entries(guard) {
            new_table.push_exclusive(entry, guard);
        }
        let old = self.buckets.swap(
            Shared::boxed(new_table, &self.collector),
            Ordering::SeqCst,
            guard,
        );
        // safety: swapped out above, and nobody can load it again
        unsafe { guard.retire_shared(old) };

        debug!(size, from = capacity, to = new_capacity, "grew bucket array");
        debug_assert_eq!(self.verify_with(Some(&change), guard), Ok(()));
    }

    /// Retires every entry and installs an empty bucket array of `capacity` buckets.
    fn clear_in_layout_change(&self, _change: &LayoutChange<'_>, capacity: usize, guard: &Guard<'_>) {
        let head = self.head(guard);
        let tail = self.tail(guard);
        let mut entry = self.first_entry(guard);
        while entry != tail {
            // safety: loaded under `guard`
            let next = unsafe { entry.deref() }.next_live(guard);
            // safety: HEAD is relinked to TAIL below, before anyone else can traverse again
            unsafe { self.retire_entry(entry, guard) };
            entry = next;
        }

        // safety: sentinels live as long as the store
        unsafe {
            head.deref().next_in_sequence.store(tail, Ordering::SeqCst);
            tail.deref().prev_in_sequence.store(head, Ordering::SeqCst);
        }
        let old = self.buckets.swap(
            Shared::boxed(Table::new(capacity), &self.collector),
            Ordering::SeqCst,
            guard,
        );
        // safety: swapped out above
        unsafe { guard.retire_shared(old) };
        self.size.store(0, Ordering::SeqCst);
    }

    /// Removes every entry and shrinks the bucket array back to its initial size.
    pub fn clear(&self, guard: &Guard<'_>) {
        self.check_guard(guard);
        let change = self.lock.start_layout_change();
        let size = self.len();
        self.clear_in_layout_change(&change, raw::INITIAL_CAPACITY, guard);
        debug!(size, "cleared store");
        debug_assert_eq!(self.verify_with(Some(&change), guard), Ok(()));
    }

    /// Checks the structural invariants of the store.
    ///
    /// This runs concurrently with other operations, so it only checks what holds at any point in
    /// time: the shape of the sentinels, that no sentinel appears inside the sequence chain, that
    /// no lookup chain loops back to an entry, and that every live entry's successor has a
    /// predecessor. [`verify_quiescent`](Self::verify_quiescent) checks more.
    pub fn verify(&self, guard: &Guard<'_>) -> Result<(), ConsistencyError> {
        self.check_guard(guard);
        self.verify_with(None, guard)
    }

    /// Checks the structural invariants of the store with all writes stopped.
    ///
    /// In addition to what [`verify`](Self::verify) checks, every live entry must be reachable
    /// from its bucket, no removal marker may remain in either chain, and the number of live
    /// entries must equal [`len`](Self::len).
    pub fn verify_quiescent(&self, guard: &Guard<'_>) -> Result<(), ConsistencyError> {
        self.check_guard(guard);
        let change = self.lock.start_layout_change();
        self.verify_with(Some(&change), guard)
    }

    fn verify_with(
        &self,
        change: Option<&LayoutChange<'_>>,
        guard: &Guard<'_>,
    ) -> Result<(), ConsistencyError> {
        let invariant = |what: String| {
            let err = ConsistencyError::Invariant(what);
            error!("{}", err);
            Err(err)
        };

        let head = self.head(guard);
        let tail = self.tail(guard);
        // safety: sentinels live as long as the store
        let (h, t) = unsafe { (head.deref(), tail.deref()) };
        if !h.is_sentinel() || !t.is_sentinel() {
            return invariant(String::from("HEAD or TAIL is not a sentinel"));
        }
        if !h.prev_in_sequence.load(Ordering::SeqCst, guard).is_null()
            || !h.next_in_lookup.load(Ordering::SeqCst, guard).is_null()
        {
            return invariant(String::from("HEAD has a predecessor"));
        }
        if !t.next_in_sequence.load(Ordering::SeqCst, guard).is_null()
            || !t.next_in_lookup.load(Ordering::SeqCst, guard).is_null()
        {
            return invariant(String::from("TAIL has a successor"));
        }
        if h.next_in_sequence.load(Ordering::SeqCst, guard).is_null()
            || t.prev_in_sequence.load(Ordering::SeqCst, guard).is_null()
        {
            return invariant(String::from("HEAD or TAIL is unlinked"));
        }

        let table = self.buckets.load(Ordering::SeqCst, guard);
        // safety: the bucket array is never null
        let table = unsafe { table.deref() };

        let mut live = 0;
        let mut entry = h.next_in_sequence.load(Ordering::SeqCst, guard);
        while entry != tail {
            // safety: loaded under `guard`
            let e = unsafe { entry.deref() };
            if e.is_sentinel() {
                return invariant(format!("sentinel found in the sequence chain at {:?}", entry));
            }
            if e.is_removed() {
                if change.is_some() {
                    return invariant(format!(
                        "{:?} marker left in the sequence chain",
                        e.kind()
                    ));
                }
            } else {
                live += 1;

                let mut next = e.next_in_lookup.load(Ordering::SeqCst, guard);
                while !next.is_null() {
                    if next == entry {
                        return invariant(format!(
                            "lookup chain of {:#x} loops back to it",
                            e.hash
                        ));
                    }
                    // safety: loaded under `guard`
                    next = unsafe { next.deref() }
                        .next_in_lookup
                        .load(Ordering::SeqCst, guard);
                }

                let successor = e.next_live(guard);
                // safety: loaded under `guard`
                if unsafe { successor.deref() }
                    .prev_in_sequence
                    .load(Ordering::SeqCst, guard)
                    .is_null()
                {
                    return invariant(format!("successor of {:#x} has no predecessor", e.hash));
                }

                if change.is_some() {
                    // safety: loaded under `guard`
                    let back = unsafe { successor.deref() }
                        .prev_in_sequence
                        .load(Ordering::SeqCst, guard);
                    if back != entry {
                        return invariant(format!(
                            "successor of {:#x} does not link back to it",
                            e.hash
                        ));
                    }
                    if !in_bucket(table, entry, guard) {
                        return invariant(format!(
                            "{:#x} is not reachable from bucket {}",
                            e.hash,
                            table.bini(e.hash)
                        ));
                    }
                }
            }
            entry = e.next_in_sequence.load(Ordering::SeqCst, guard);
        }

        if change.is_some() && live != self.len() {
            return invariant(format!(
                "{} live entries but size is {}",
                live,
                self.len()
            ));
        }
        Ok(())
    }
}

fn in_bucket<K, V>(table: &Table<K, V>, entry: Shared<'_, Entry<K, V>>, guard: &Guard<'_>) -> bool {
    // safety: loaded under `guard` by the caller
    let index = table.bini(unsafe { entry.deref() }.hash);
    let mut e = table.bin(index, guard);
    while !e.is_null() {
        if e == entry {
            return true;
        }
        // safety: loaded under `guard`
        e = unsafe { e.deref() }.next_in_lookup.load(Ordering::SeqCst, guard);
    }
    false
}

impl<K, V, S> HashStore<K, V, S>
where
    S: KeyStrategy<K>,
{
    /// Looks `key` up, retrying until no layout change interleaved with the search.
    fn lookup<'g>(
        &'g self,
        token: &ThreadToken<'_>,
        key: &K,
        guard: &'g Guard<'_>,
    ) -> Lookup<'g, K, V> {
        let mut identity = self.identity.load(Ordering::SeqCst);
        let mut hash = self.strategy.hash(key, identity);
        loop {
            self.lock.start_read(token);
            if self.identity.load(Ordering::SeqCst) != identity {
                identity = !identity;
                hash = self.strategy.hash(key, identity);
            }
            let lookup = self.find(key, hash, identity, guard);
            if self.lock.finish_read(token) {
                return lookup;
            }
        }
    }

    /// Whether a write may act on `lookup`: no layout change replaced the bucket array or switched
    /// the equality mode since. Must be called while writing.
    fn still_valid(&self, lookup: &Lookup<'_, K, V>, guard: &Guard<'_>) -> bool {
        self.buckets.load(Ordering::SeqCst, guard) == lookup.table
            && self.identity.load(Ordering::SeqCst) == lookup.identity
    }

    fn find<'g>(&'g self, key: &K, hash: u64, identity: bool, guard: &'g Guard<'_>) -> Lookup<'g, K, V> {
        let table = self.buckets.load(Ordering::SeqCst, guard);
        // safety: the bucket array is never null
        let t = unsafe { table.deref() };
        let index = t.bini(hash);
        let first = t.bin(index, guard);

        let mut entry = first;
        while !entry.is_null() {
            // safety: loaded under `guard`
            let e = unsafe { entry.deref() };
            if !e.is_removed() && self.strategy.equal(identity, key, hash, e.key(), e.hash) {
                break;
            }
            entry = e.next_in_lookup.load(Ordering::SeqCst, guard);
        }

        Lookup {
            table,
            identity,
            hash,
            index,
            first,
            entry,
        }
    }

    /// Returns a reference to the value corresponding to `key`.
    pub fn get<'g>(
        &'g self,
        token: &ThreadToken<'_>,
        key: &K,
        guard: &'g Guard<'_>,
    ) -> Option<&'g V> {
        self.check_guard(guard);
        self.check_token(token);
        let lookup = self.lookup(token, key, guard);
        if lookup.entry.is_null() {
            return None;
        }
        // safety: loaded under `guard`
        Some(unsafe { lookup.entry.deref() }.value(guard))
    }

    /// Returns the value for `key`, or `default(key)` if there is none.
    pub fn lookup_or_default<F>(
        &self,
        token: &ThreadToken<'_>,
        key: &K,
        default: F,
        guard: &Guard<'_>,
    ) -> V
    where
        V: Clone,
        F: FnOnce(&K) -> V,
    {
        match self.get(token, key, guard) {
            Some(value) => value.clone(),
            None => default(key),
        }
    }

    /// Returns `true` if the store contains `key`.
    pub fn contains_key(&self, token: &ThreadToken<'_>, key: &K, guard: &Guard<'_>) -> bool {
        self.get(token, key, guard).is_some()
    }

    /// Inserts a key-value pair, or updates the value of an existing key.
    ///
    /// A new key goes to the end of the insertion order; an update keeps the key's position.
    /// Returns the previous value, if any.
    pub fn set<'g>(
        &'g self,
        token: &ThreadToken<'_>,
        key: K,
        value: V,
        guard: &'g Guard<'_>,
    ) -> Option<&'g V> {
        self.check_guard(guard);
        self.check_token(token);

        let value = Shared::boxed(value, &self.collector);
        let mut key = key;
        loop {
            let lookup = self.lookup(token, &key, guard);

            if lookup.entry.is_null() {
                let entry = Shared::boxed(
                    Entry::new(lookup.hash, key, value, false),
                    &self.collector,
                );
                // safety: we just allocated it
                let e = unsafe { entry.deref() };
                e.next_in_sequence.store(self.tail(guard), Ordering::SeqCst);
                e.next_in_lookup.store(lookup.first, Ordering::SeqCst);

                let write = self.lock.start_write(token);
                let table = lookup.table;
                // a layout change may have replaced the bucket array or switched the mode since
                // the lookup, or another entry may have been inserted into the bucket
                let inserted = self.still_valid(&lookup, guard)
                    // safety: the bucket array is never null
                    && unsafe { table.deref() }
                        .cas_bin(lookup.index, lookup.first, entry, guard)
                        .is_ok();
                if !inserted {
                    drop(write);
                    // safety: the entry never became visible to another thread
                    key = Entry::into_key(unsafe { entry.into_box() });
                    continue;
                }

                let size = self.size.fetch_add(1, Ordering::SeqCst) + 1;
                // safety: as above
                let capacity = unsafe { table.deref() }.len();
                self.append(entry, guard);
                drop(write);

                if raw::exceeds_load_factor(size, capacity) {
                    self.resize(guard);
                }
                return None;
            }

            // a layout change may replace the entry, so the update must not race with one
            let write = self.lock.start_write(token);
            if !self.still_valid(&lookup, guard) {
                drop(write);
                continue;
            }
            // safety: loaded under `guard`
            let old = unsafe { lookup.entry.deref() }.swap_value(value, guard);
            drop(write);

            // if the entry is removed concurrently, the update is simply ordered before that
            // safety: swapped out above; readers that loaded it are protected by their guards
            unsafe { guard.retire_shared(old) };
            // safety: retired, but not reclaimed before `guard` is dropped
            return Some(unsafe { old.deref() });
        }
    }

    /// Removes `key`, returning its value if it was present.
    ///
    /// Returns `Ok(None)` if the key is absent or another thread removed it first.
    pub fn delete<'g>(
        &'g self,
        token: &ThreadToken<'_>,
        key: &K,
        guard: &'g Guard<'_>,
    ) -> Result<Option<&'g V>, ConsistencyError> {
        self.check_guard(guard);
        self.check_token(token);
        loop {
            let lookup = self.lookup(token, key, guard);
            if lookup.entry.is_null() {
                return Ok(None);
            }

            let write = self.lock.start_write(token);
            if !self.still_valid(&lookup, guard) {
                // a layout change replaced the entry we found
                drop(write);
                continue;
            }
            let removed = self.remove_entry(lookup.entry, lookup.table, guard)?;
            drop(write);

            if !removed {
                return Ok(None);
            }
            // safety: retired, but not reclaimed before `guard` is dropped
            return Ok(Some(unsafe { lookup.entry.deref() }.value(guard)));
        }
    }

    /// Removes the last entry, which the caller expects to be `expected_key`.
    ///
    /// Returns `Ok(None)` if the store is empty or another thread removed that entry first. If the
    /// last entry has a different key, nothing is removed and a
    /// [`ConsistencyError::LastKeyMismatch`] is returned.
    pub fn delete_last<'g>(
        &'g self,
        token: &ThreadToken<'_>,
        expected_key: &K,
        guard: &'g Guard<'_>,
    ) -> Result<Option<&'g V>, ConsistencyError> {
        self.check_guard(guard);
        self.check_token(token);
        loop {
            let identity = self.identity.load(Ordering::SeqCst);
            let hash = self.strategy.hash(expected_key, identity);

            let write = self.lock.start_write(token);
            if self.identity.load(Ordering::SeqCst) != identity {
                drop(write);
                continue;
            }

            let tail = self.tail(guard);
            // safety: the sentinel lives as long as the store, and prev links never point to
            // markers
            let last = unsafe { tail.deref() }
                .prev_in_sequence
                .load(Ordering::SeqCst, guard);
            // safety: loaded under `guard`
            let l = unsafe { last.deref() };
            if l.is_sentinel() {
                return Ok(None);
            }
            if !self
                .strategy
                .equal(identity, expected_key, hash, l.key(), l.hash)
            {
                let err = ConsistencyError::LastKeyMismatch {
                    expected_hash: hash,
                    found_hash: l.hash,
                };
                error!("{}", err);
                return Err(err);
            }

            let table = self.buckets.load(Ordering::SeqCst, guard);
            let removed = self.remove_entry(last, table, guard)?;
            drop(write);

            return Ok(if removed { Some(l.value(guard)) } else { None });
        }
    }

    /// Removes the oldest entry and returns it.
    pub fn delete_first<'g>(
        &'g self,
        token: &ThreadToken<'_>,
        guard: &'g Guard<'_>,
    ) -> Result<Option<(&'g K, &'g V)>, ConsistencyError> {
        self.check_guard(guard);
        self.check_token(token);

        let _write = self.lock.start_write(token);
        let tail = self.tail(guard);
        let mut entry = self.first_entry(guard);
        while entry != tail {
            if self.remove_from_sequence(entry, guard) {
                self.size.fetch_sub(1, Ordering::SeqCst);
                let table = self.buckets.load(Ordering::SeqCst, guard);
                self.remove_from_lookup(entry, table, guard)?;
                // safety: unlinked from both chains above
                unsafe { self.retire_entry(entry, guard) };

                // safety: retired, but not reclaimed before `guard` is dropped
                let e = unsafe { entry.deref() };
                return Ok(Some((e.key(), e.value(guard))));
            }
            // lost the race for this one, try the next first entry
            entry = self.first_entry(guard);
        }
        Ok(None)
    }

    /// Replaces the contents of the store with those of `other`, including its equality mode.
    ///
    /// The keys are rehashed with this store's strategy. To replace from another concurrent
    /// store, use [`replace_from_store`](HashStore::replace_from_store).
    pub fn replace_from<T>(&self, other: LocalHashStore<K, V, T>, guard: &Guard<'_>) {
        self.check_guard(guard);
        let identity = other.is_identity();
        let len = other.len();
        // hash before the layout change, hashing runs arbitrary code
        let entries: Vec<_> = other
            .into_iter()
            .map(|(key, value)| (self.strategy.hash(&key, identity), key, value))
            .collect();

        let change = self.lock.start_layout_change();
        let capacity = raw::growth_capacity(len);
        self.clear_in_layout_change(&change, capacity, guard);
        self.identity.store(identity, Ordering::SeqCst);
        self.bulk_insert(entries, guard);
        self.size.store(len, Ordering::SeqCst);

        debug!(size = len, capacity, identity, "replaced contents");
        debug_assert_eq!(self.verify_with(Some(&change), guard), Ok(()));
    }

    /// Replaces the contents of the store with a snapshot of `other`, including its equality mode.
    ///
    /// The snapshot is taken with [`to_local`](HashStore::to_local) before this store's layout
    /// changes, so `other` may be this store itself.
    pub fn replace_from_store<T>(&self, other: &HashStore<K, V, T>, guard: &Guard<'_>)
    where
        K: Clone,
        V: Clone,
        T: KeyStrategy<K> + Clone,
    {
        let other_guard = other.guard();
        let token = other.register_thread();
        let snapshot = other.to_local(&token, &other_guard);
        drop(token);
        drop(other_guard);
        self.replace_from(snapshot, guard);
    }

    /// Copies the live entries, in order and with their stored hashes, into a
    /// [`LocalHashStore`].
    pub fn to_local(&self, token: &ThreadToken<'_>, guard: &Guard<'_>) -> LocalHashStore<K, V, S>
    where
        K: Clone,
        V: Clone,
        S: Clone,
    {
        self.check_guard(guard);
        self.check_token(token);
        loop {
            self.lock.start_read(token);
            let mut local =
                LocalHashStore::with_capacity_and_strategy(self.len(), self.strategy.clone());
            local.set_identity(self.is_identity());
            for entry in self.entries(guard) {
                // safety: yielded entries were loaded under `guard`
                let e = unsafe { entry.deref() };
                local.insert_hashed(e.hash, e.key().clone(), e.value(guard).clone());
            }
            // a layout change may have rehashed the entries under a new mode
            if self.lock.finish_read(token) {
                return local;
            }
        }
    }

    /// Builds a store from a [`LocalHashStore`], keeping its order, stored hashes, strategy and
    /// equality mode.
    ///
    /// The store uses the default [`Config`]; see [`from_local_with_config`] to carry over a spin
    /// policy or checkpoint.
    ///
    /// [`from_local_with_config`]: HashStore::from_local_with_config
    pub fn from_local(local: LocalHashStore<K, V, S>) -> Self {
        Self::from_local_with_config(local, Config::default())
    }

    /// Like [`from_local`](HashStore::from_local), with the given configuration.
    ///
    /// The initial capacity in `config` is a lower bound; the store is always large enough for
    /// the entries of `local`.
    pub fn from_local_with_config(local: LocalHashStore<K, V, S>, config: Config) -> Self {
        let len = local.len();
        let identity = local.is_identity();
        let (strategy, entries) = local.into_parts();

        let capacity = raw::growth_capacity(len).max(raw::capacity_for(config.initial_capacity));
        let store = Self::build(
            capacity,
            strategy,
            config.spin,
            config.checkpoint,
            Arc::new(Collector::new()),
        );
        store.identity.store(identity, Ordering::SeqCst);
        {
            let guard = store.guard();
            store.bulk_insert(entries, &guard);
            store.size.store(len, Ordering::SeqCst);
        }
        store
    }
}

impl<K, V, S> HashStore<K, V, S>
where
    K: Clone,
    V: Clone,
    S: KeyStrategy<K> + Clone,
{
    /// Rebuilds both chains by inserting every entry anew.
    ///
    /// Does nothing once keys are compared by identity.
    pub fn rehash(&self, guard: &Guard<'_>) {
        self.check_guard(guard);
        let change = self.lock.start_layout_change();
        // checked inside the layout change, the mode cannot change anymore
        if self.is_identity() {
            return;
        }
        self.rehash_in_layout_change(&change, guard);
        debug!(size = self.len(), "rehashed");
        debug_assert_eq!(self.verify_with(Some(&change), guard), Ok(()));
    }

    /// Compares keys by identity from now on, and rehashes every entry accordingly.
    pub fn switch_to_identity_equality_and_rehash(&self, guard: &Guard<'_>) {
        self.check_guard(guard);
        let change = self.lock.start_layout_change();
        self.identity.store(true, Ordering::SeqCst);
        self.rehash_in_layout_change(&change, guard);
        debug!(size = self.len(), "switched to identity equality");
        debug_assert_eq!(self.verify_with(Some(&change), guard), Ok(()));
    }

    fn rehash_in_layout_change(&self, _change: &LayoutChange<'_>, guard: &Guard<'_>) {
        let head = self.head(guard);
        let tail = self.tail(guard);
        if self.is_empty() {
            debug_assert!(self.first_entry(guard) == tail);
            return;
        }

        // hashing and comparing run arbitrary code, which must not run with this store's lock
        // held exclusively in a way it can observe; so insert into a copy with its own lock, and
        // adopt the result
        let table = self.buckets.load(Ordering::SeqCst, guard);
        // safety: the bucket array is never null
        let capacity = unsafe { table.deref() }.len();
        let copy = Self::build(
            capacity,
            self.strategy.clone(),
            self.spin,
            None,
            Arc::clone(&self.collector),
        );
        copy.identity.store(self.is_identity(), Ordering::SeqCst);
        {
            let token = copy.register_thread();
            for entry in self.entries(guard) {
                // safety: yielded entries were loaded under `guard`
                let e = unsafe { entry.deref() };
                copy.set(&token, e.key().clone(), e.value(guard).clone(), guard);
            }
        }

        let old_first = self.first_entry(guard);
        let copy_head = copy.head(guard);
        let copy_tail = copy.tail(guard);
        // safety: sentinels live as long as their store
        let (ch, ct) = unsafe { (copy_head.deref(), copy_tail.deref()) };
        let first = ch.next_live(guard);
        let last = ct.prev_in_sequence.load(Ordering::SeqCst, guard);
        let size = copy.len();
        debug_assert!(first != copy_tail && last != copy_head);

        // empty the copy, so dropping it leaves the adopted entries alone
        ch.next_in_sequence.store(copy_tail, Ordering::SeqCst);
        ct.prev_in_sequence.store(copy_head, Ordering::SeqCst);
        let new_table = copy.buckets.swap(
            Shared::boxed(Table::new(raw::INITIAL_CAPACITY), &self.collector),
            Ordering::SeqCst,
            guard,
        );
        copy.size.store(0, Ordering::SeqCst);
        drop(copy);

        // retire the previous generation; it still ends in TAIL
        let mut entry = old_first;
        while entry != tail {
            // safety: loaded under `guard`
            let next = unsafe { entry.deref() }.next_live(guard);
            // safety: replaced by the new generation below, before anyone else can look again
            unsafe { self.retire_entry(entry, guard) };
            entry = next;
        }

        // safety: all of these are live and, during a layout change, ours alone
        unsafe {
            first.deref().prev_in_sequence.store(head, Ordering::SeqCst);
            head.deref().next_in_sequence.store(first, Ordering::SeqCst);
            last.deref().next_in_sequence.store(tail, Ordering::SeqCst);
            tail.deref().prev_in_sequence.store(last, Ordering::SeqCst);
        }
        let old_table = self.buckets.swap(new_table, Ordering::SeqCst, guard);
        // safety: swapped out above
        unsafe { guard.retire_shared(old_table) };
        self.size.store(size, Ordering::SeqCst);
    }
}

impl<K, V, S> Drop for HashStore<K, V, S> {
    fn drop(&mut self) {
        // safety: we have &mut self _and_ all references we have returned are bound to the
        // lifetime of their borrow of self, so there cannot be any outstanding references to
        // anything in the store. with no operation in flight, no marker is linked anywhere.
        unsafe {
            let head = self.head.load_unguarded(Ordering::SeqCst);
            let tail = self.tail.load_unguarded(Ordering::SeqCst);
            let mut entry = head.deref().next_in_sequence.load_unguarded(Ordering::SeqCst);
            while entry != tail {
                let next = entry.deref().next_in_sequence.load_unguarded(Ordering::SeqCst);
                drop(entry.into_box());
                entry = next;
            }
            drop(head.into_box());
            drop(tail.into_box());
            drop(self.buckets.take_box());
        }
    }
}

impl<K, V, S> fmt::Debug for HashStore<K, V, S>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.guard();
        f.debug_map().entries(self.iter(&guard)).finish()
    }
}

impl<K, V, S> Extend<(K, V)> for &HashStore<K, V, S>
where
    S: KeyStrategy<K>,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        let token = self.register_thread();
        let guard = self.guard();
        for (key, value) in iter {
            self.set(&token, key, value, &guard);
        }
    }
}

impl<K, V, S> FromIterator<(K, V)> for HashStore<K, V, S>
where
    S: KeyStrategy<K> + Default,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let iter = iter.into_iter();
        let store = Self::with_capacity_and_strategy(iter.size_hint().0, S::default());
        (&store).extend(iter);
        store
    }
}
