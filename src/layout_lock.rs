//! A lightweight layout lock.
//!
//! The lock separates _normal operations_ (reads, writes) that run concurrently without taking
//! any shared lock on their fast path from rare _layout changes_ that need every normal operation
//! to be out of the way. It follows "Parallelization of Dynamic Languages: Synchronizing Built-in
//! Collections" (Daloze et al., OOPSLA 2018).
//!
//! Each participating thread owns a [`ThreadToken`] holding a small state register:
//!
//!  - `IDLE`: no write in flight, no layout change since the thread last checked.
//!  - `WRITE`: a write is in flight.
//!  - `LAYOUT_CHANGE`: a layout change has happened (or is happening) since the thread last went
//!    through the slow path. It is added on top of `WRITE` when a layout change catches a write in
//!    flight.
//!
//! Reads are optimistic: they run without touching the register and check afterwards with
//! [`LayoutLock::finish_read`] that no layout change interleaved, retrying if one did. Writes
//! flip their register from `IDLE` to `WRITE` with a single CAS. A layout change takes the base
//! lock exclusively, adds `LAYOUT_CHANGE` to every register, and waits until each one reads back
//! exactly `LAYOUT_CHANGE`, i.e. until every write in flight has finished. Registers are left at
//! `LAYOUT_CHANGE` afterwards, so back-to-back layout changes do not need to scan again; each
//! thread goes once through the slow path (the base lock in shared mode) to get back to `IDLE`.
//!
//! # Liveness
//!
//! The quiescence wait of a layout change is unbounded: it lasts as long as the slowest write in
//! flight. Writes are short, so this is bounded in practice, but a writer that gets descheduled
//! in the middle of a write stalls every layout change until it runs again. The waits follow the
//! lock's [`SpinPolicy`].

use crate::config::SpinPolicy;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

const IDLE: usize = 0;
const WRITE: usize = 1;
const LAYOUT_CHANGE: usize = 2;

/// The register of one registered thread.
#[derive(Debug)]
pub(crate) struct ThreadState {
    state: AtomicUsize,
}

impl ThreadState {
    fn new() -> Self {
        // a layout change racing with registration must not be missed
        Self {
            state: AtomicUsize::new(LAYOUT_CHANGE),
        }
    }

    fn get(&self) -> usize {
        self.state.load(Ordering::SeqCst)
    }
}

/// Arbitrates between concurrent normal operations and exclusive layout changes.
///
/// See the [module documentation](self) for the protocol.
///
/// ```
/// use seqhash::layout_lock::LayoutLock;
///
/// let lock = LayoutLock::new();
/// let token = lock.register_thread();
///
/// // an optimistic read, retried until no layout change interleaved
/// loop {
///     lock.start_read(&token);
///     // ... read shared data ...
///     if lock.finish_read(&token) {
///         break;
///     }
/// }
///
/// {
///     let _write = lock.start_write(&token);
///     // ... mutate shared data, never concurrently with a layout change ...
/// }
///
/// let change = lock.start_layout_change();
/// // ... no write is in flight on any registered thread ...
/// change.finish();
/// ```
pub struct LayoutLock {
    /// The registered thread states. The lock around them doubles as the base lock: layout
    /// changes and (un)registration hold it exclusively, slow-path reads and writes hold it
    /// shared.
    base: RwLock<Vec<Arc<ThreadState>>>,
    /// Set whenever a thread went through the slow path, which may have left its register at a
    /// value other than `LAYOUT_CHANGE`.
    rescan: AtomicBool,
    spin: SpinPolicy,
}

impl Default for LayoutLock {
    fn default() -> Self {
        Self::new()
    }
}

impl LayoutLock {
    /// A lock with the default [`SpinPolicy`].
    pub fn new() -> Self {
        Self::with_spin_policy(SpinPolicy::default())
    }

    /// A lock whose quiescence waits follow `spin`.
    pub fn with_spin_policy(spin: SpinPolicy) -> Self {
        Self {
            base: RwLock::new(Vec::new()),
            rescan: AtomicBool::new(false),
            spin,
        }
    }

    /// The wait policy of this lock.
    pub fn spin_policy(&self) -> SpinPolicy {
        self.spin
    }

    /// Registers the calling thread.
    ///
    /// The returned token is passed to every operation the thread performs under this lock and
    /// unregisters the thread when dropped. A token may move to another thread but must not be
    /// used from two threads at once, which is why it is not `Sync`.
    pub fn register_thread(&self) -> ThreadToken<'_> {
        let state = Arc::new(ThreadState::new());
        self.base.write().push(Arc::clone(&state));
        trace!("registered thread with layout lock");
        ThreadToken {
            lock: self,
            state,
            _not_sync: PhantomData,
        }
    }

    fn unregister_thread(&self, state: &Arc<ThreadState>) {
        let mut registry = self.base.write();
        if let Some(i) = registry.iter().position(|s| Arc::ptr_eq(s, state)) {
            registry.swap_remove(i);
        }
    }

    /// The number of currently registered threads.
    pub fn registered_threads(&self) -> usize {
        self.base.read().len()
    }

    /// Whether `token` was handed out by this lock.
    pub fn owns(&self, token: &ThreadToken<'_>) -> bool {
        std::ptr::eq(self, token.lock)
    }

    /// Starts an optimistic read. This does nothing; it only marks where the read begins.
    #[inline]
    pub fn start_read(&self, _token: &ThreadToken<'_>) {}

    /// Ends an optimistic read.
    ///
    /// Returns `true` if no layout change interleaved with the read, so everything it observed is
    /// consistent. Returns `false` if the read must be retried from the start.
    #[inline]
    pub fn finish_read(&self, token: &ThreadToken<'_>) -> bool {
        // keep the reads of the data above the check of the register
        fence(Ordering::SeqCst);
        if token.state.get() == IDLE {
            return true;
        }

        // wait for the layout change to finish, then try again
        self.slow_set(&token.state, IDLE);
        false
    }

    /// Starts a write, waiting for a layout change in progress to finish.
    ///
    /// The write lasts until the returned guard is dropped. The same token must not start a
    /// second write, or a layout change on the same lock, while the guard is alive.
    #[inline]
    pub fn start_write<'t>(&self, token: &'t ThreadToken<'_>) -> WriteGuard<'t> {
        if token
            .state
            .state
            .compare_exchange(IDLE, WRITE, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // a layout change happened or is pending
            self.slow_set(&token.state, WRITE);
        }
        WriteGuard {
            state: &token.state,
        }
    }

    /// Starts a layout change and waits until no write is in flight on any registered thread.
    ///
    /// The layout change lasts until the returned guard is dropped or
    /// [`finish`](LayoutChange::finish)ed.
    pub fn start_layout_change(&self) -> LayoutChange<'_> {
        // wait for slow paths and for other layout changes
        let registry = self.base.write();

        if self.rescan.load(Ordering::SeqCst) {
            trace!(threads = registry.len(), "layout change scans thread states");
            for state in registry.iter() {
                if state.get() != LAYOUT_CHANGE {
                    state.state.fetch_add(LAYOUT_CHANGE, Ordering::SeqCst);
                    // wait for the write in flight, if any, to complete
                    let mut spinner = self.spin.spinner();
                    while state.get() != LAYOUT_CHANGE {
                        spinner.spin();
                    }
                }
            }

            // only a slow path can make another scan necessary
            self.rescan.store(false, Ordering::SeqCst);
        }

        LayoutChange {
            _registry: registry,
        }
    }

    /// The common slow path of reads and writes.
    #[cold]
    fn slow_set(&self, state: &ThreadState, value: usize) {
        // blocks while a layout change is in progress
        let _registry = self.base.read();
        state.state.store(value, Ordering::SeqCst);
        // the next layout change must scan, since this register is no longer LAYOUT_CHANGE
        self.rescan.store(true, Ordering::SeqCst);
        trace!(value, "layout lock slow path");
    }
}

impl fmt::Debug for LayoutLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayoutLock")
            .field("rescan", &self.rescan.load(Ordering::Relaxed))
            .field("spin", &self.spin)
            .finish()
    }
}

/// A thread's registration with a [`LayoutLock`] (or with the lock of a
/// [`HashStore`](crate::HashStore)).
///
/// Dropping the token unregisters the thread.
pub struct ThreadToken<'lock> {
    lock: &'lock LayoutLock,
    state: Arc<ThreadState>,
    _not_sync: PhantomData<Cell<()>>,
}

impl Drop for ThreadToken<'_> {
    fn drop(&mut self) {
        self.lock.unregister_thread(&self.state);
    }
}

impl fmt::Debug for ThreadToken<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadToken")
            .field("lock", &(self.lock as *const LayoutLock))
            .field("state", &self.state.get())
            .finish()
    }
}

/// An in-flight write. Dropping it finishes the write.
#[must_use = "the write finishes as soon as the guard is dropped"]
pub struct WriteGuard<'t> {
    state: &'t ThreadState,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        // subtract rather than reset, a layout change may have added LAYOUT_CHANGE meanwhile
        self.state.state.fetch_sub(WRITE, Ordering::SeqCst);
    }
}

impl fmt::Debug for WriteGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteGuard").finish_non_exhaustive()
    }
}

/// An in-progress layout change. Dropping it finishes the layout change.
///
/// Holding one is proof that no write is in flight on the lock that produced it.
#[must_use = "the layout change finishes as soon as the guard is dropped"]
pub struct LayoutChange<'l> {
    _registry: RwLockWriteGuard<'l, Vec<Arc<ThreadState>>>,
}

impl LayoutChange<'_> {
    /// Finishes the layout change.
    ///
    /// Thread registers are deliberately left at `LAYOUT_CHANGE`, so consecutive layout changes
    /// skip the scan; every thread's next operation goes through the slow path once.
    pub fn finish(self) {
        drop(self);
    }
}

impl fmt::Debug for LayoutChange<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayoutChange").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn new_registration_starts_in_layout_change() {
        let lock = LayoutLock::new();
        let token = lock.register_thread();
        assert_eq!(token.state.get(), LAYOUT_CHANGE);
        assert_eq!(lock.registered_threads(), 1);

        // the first read observes the pending layout change and must retry
        assert!(!lock.finish_read(&token));
        assert_eq!(token.state.get(), IDLE);
        assert!(lock.rescan.load(Ordering::SeqCst));
        assert!(lock.finish_read(&token));
    }

    #[test]
    fn write_fast_and_slow_path() {
        let lock = LayoutLock::new();
        let token = lock.register_thread();

        // slow path: the register still holds LAYOUT_CHANGE
        {
            let _write = lock.start_write(&token);
            assert_eq!(token.state.get(), WRITE);
        }
        assert_eq!(token.state.get(), IDLE);

        // fast path
        {
            let _write = lock.start_write(&token);
            assert_eq!(token.state.get(), WRITE);
        }
        assert_eq!(token.state.get(), IDLE);
    }

    #[test]
    fn layout_change_leaves_registers_set() {
        let lock = LayoutLock::new();
        let token = lock.register_thread();
        assert!(!lock.finish_read(&token));
        assert_eq!(token.state.get(), IDLE);

        lock.start_layout_change().finish();
        assert_eq!(token.state.get(), LAYOUT_CHANGE);
        assert!(!lock.rescan.load(Ordering::SeqCst));

        // no slow path since, so the next layout change does not touch the register
        lock.start_layout_change().finish();
        assert_eq!(token.state.get(), LAYOUT_CHANGE);

        assert!(!lock.finish_read(&token));
        assert!(lock.finish_read(&token));
    }

    #[test]
    fn unregister_on_drop() {
        let lock = LayoutLock::new();
        let a = lock.register_thread();
        let b = lock.register_thread();
        assert!(lock.owns(&a));
        assert_eq!(lock.registered_threads(), 2);
        drop(a);
        assert_eq!(lock.registered_threads(), 1);
        drop(b);
        assert_eq!(lock.registered_threads(), 0);

        let other = LayoutLock::new();
        let c = other.register_thread();
        assert!(!lock.owns(&c));
    }

    #[test]
    fn layout_change_waits_for_write_in_flight() {
        let lock = LayoutLock::new();
        let in_write = AtomicUsize::new(0);
        let observed = AtomicUsize::new(usize::MAX);
        let barrier = Barrier::new(2);

        thread::scope(|s| {
            s.spawn(|| {
                let token = lock.register_thread();
                let write = lock.start_write(&token);
                in_write.store(1, Ordering::SeqCst);
                barrier.wait();
                thread::sleep(std::time::Duration::from_millis(50));
                in_write.store(0, Ordering::SeqCst);
                drop(write);
                // the register now holds LAYOUT_CHANGE, so this takes the slow path and
                // blocks until the layout change below is over
                let _write = lock.start_write(&token);
            });

            barrier.wait();
            let change = lock.start_layout_change();
            observed.store(in_write.load(Ordering::SeqCst), Ordering::SeqCst);
            change.finish();
        });

        assert_eq!(observed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn writes_never_overlap_layout_changes() {
        let lock = LayoutLock::with_spin_policy(SpinPolicy::yielding());
        let writers = AtomicUsize::new(0);
        let violations = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let token = lock.register_thread();
                    for _ in 0..2_000 {
                        let _write = lock.start_write(&token);
                        writers.fetch_add(1, Ordering::SeqCst);
                        std::hint::spin_loop();
                        writers.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..200 {
                    let change = lock.start_layout_change();
                    if writers.load(Ordering::SeqCst) != 0 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    change.finish();
                }
            });
        });

        assert_eq!(violations.load(Ordering::SeqCst), 0);
    }
}
