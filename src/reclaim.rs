pub(crate) use seize::{Collector, Guard, Linked};

use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::{fmt, ptr};

/// A link that may be swapped atomically and whose target is managed by a [`Collector`].
///
/// Every chain pointer in the store (bucket heads, lookup links, sequence links, values) is one
/// of these. Loading goes through a [`Guard`], which keeps the target alive for the guard's
/// lifetime even if another thread unlinks and retires it in the meantime.
pub(crate) struct Atomic<T>(seize::AtomicPtr<T>);

impl<T> Atomic<T> {
    pub(crate) fn null() -> Self {
        Self(seize::AtomicPtr::default())
    }

    pub(crate) fn load<'g>(&self, ordering: Ordering, guard: &'g Guard<'_>) -> Shared<'g, T> {
        guard.protect(&self.0, ordering).into()
    }

    /// Loads the link without protecting its target.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the structure the link belongs to, so that
    /// nothing can retire the target while the returned pointer is in use.
    pub(crate) unsafe fn load_unguarded<'g>(&self, ordering: Ordering) -> Shared<'g, T> {
        self.0.load(ordering).into()
    }

    pub(crate) fn store(&self, new: Shared<'_, T>, ordering: Ordering) {
        self.0.store(new.ptr, ordering);
    }

    pub(crate) fn swap<'g>(
        &self,
        new: Shared<'_, T>,
        ordering: Ordering,
        _: &'g Guard<'_>,
    ) -> Shared<'g, T> {
        self.0.swap(new.ptr, ordering).into()
    }

    /// Replaces `current` with `new`, returning what was actually found on failure.
    pub(crate) fn compare_exchange<'g>(
        &self,
        current: Shared<'_, T>,
        new: Shared<'_, T>,
        _: &'g Guard<'_>,
    ) -> Result<Shared<'g, T>, Shared<'g, T>> {
        self.0
            .compare_exchange(current.ptr, new.ptr, Ordering::SeqCst, Ordering::SeqCst)
            .map(Shared::from)
            .map_err(Shared::from)
    }

    /// Takes ownership of the target, leaving the link null.
    ///
    /// # Safety
    ///
    /// The target must be valid, and no other reference to it may exist or be created later.
    pub(crate) unsafe fn take_box(&mut self) -> Option<Box<Linked<T>>> {
        let ptr = std::mem::replace(self.0.get_mut(), ptr::null_mut());
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { Box::from_raw(ptr) })
        }
    }
}

impl<T> From<Shared<'_, T>> for Atomic<T> {
    fn from(shared: Shared<'_, T>) -> Self {
        Atomic(shared.ptr.into())
    }
}

impl<T> fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.0.load(Ordering::SeqCst))
    }
}

/// A pointer loaded from an [`Atomic`], valid for as long as the guard `'g` it was loaded under.
pub(crate) struct Shared<'g, T> {
    ptr: *mut Linked<T>,
    _g: PhantomData<&'g ()>,
}

impl<'g, T> Shared<'g, T> {
    pub(crate) fn null() -> Self {
        Shared::from(ptr::null_mut())
    }

    /// Allocates `value` so that it can later be retired through a guard of `collector`.
    pub(crate) fn boxed(value: T, collector: &Collector) -> Self {
        Shared::from(collector.link_boxed(value))
    }

    /// Converts the pointer back into the `Box` it was allocated as.
    ///
    /// # Safety
    ///
    /// The pointer must be valid, and nobody else may hold or later obtain a reference to the
    /// same object.
    pub(crate) unsafe fn into_box(self) -> Box<Linked<T>> {
        unsafe { Box::from_raw(self.ptr) }
    }

    /// Dereferences the pointer.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null and must have been loaded under a guard that is still alive
    /// (or under exclusive access to the owning structure).
    pub(crate) unsafe fn deref(&self) -> &'g Linked<T> {
        unsafe { &*self.ptr }
    }

    pub(crate) fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    pub(crate) fn as_ptr(&self) -> *mut Linked<T> {
        self.ptr
    }
}

impl<'g, T> PartialEq<Shared<'g, T>> for Shared<'g, T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Shared<'_, T> {}

impl<T> Clone for Shared<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Shared<'_, T> {}

impl<T> From<*mut Linked<T>> for Shared<'_, T> {
    fn from(ptr: *mut Linked<T>) -> Self {
        Shared {
            ptr,
            _g: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Shared<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.ptr)
    }
}

pub(crate) trait RetireShared {
    /// Retires the target, reclaiming it once every guard that may still see it is gone.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null and already unreachable for any thread that enters a guard
    /// after this call.
    unsafe fn retire_shared<T>(&self, shared: Shared<'_, T>);
}

impl RetireShared for Guard<'_> {
    unsafe fn retire_shared<T>(&self, shared: Shared<'_, T>) {
        unsafe { self.retire(shared.ptr, seize::reclaim::boxed::<T>) }
    }
}
