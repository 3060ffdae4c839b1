//! A concurrent, insertion-ordered hash store.
//!
//! This crate provides [`HashStore`], the kind of map a dynamic language uses for its built-in
//! `Hash` once the hash becomes reachable from more than one thread. It keeps entries in the
//! order they were first inserted, supports FIFO-style use through
//! [`delete_first`](HashStore::delete_first) and [`delete_last`](HashStore::delete_last), and
//! lets any number of threads read and mutate it at once. The design follows "Parallelization of
//! Dynamic Languages: Synchronizing Built-in Collections" (Daloze et al., OOPSLA 2018).
//!
//! # A note on design
//!
//! Each entry lives in two intrusive chains: a singly-linked _lookup chain_ per bucket, and a
//! doubly-linked _sequence chain_ that records insertion order. Both are mutated only with
//! compare-and-swap, and removals go through transient marker nodes so that an entry can be
//! unlinked from the middle of either chain while other threads insert next to it.
//!
//! What cannot be done with CAS alone (growing the bucket array, rehashing, switching the
//! equality mode, clearing and replacing the contents) is a _layout change_, arbitrated by a
//! [`LayoutLock`](layout_lock::LayoutLock). Lookups never block; they validate afterwards that no
//! layout change overlapped them. Writes flip a per-thread register on the way in and out. Only
//! layout changes wait, until every write in flight has drained.
//!
//! # Threads, tokens and guards
//!
//! A thread has to [register](HashStore::register_thread) with a store before it operates on it,
//! and passes the resulting [`ThreadToken`] to every operation. Memory of removed entries is
//! reclaimed with [`seize`]: operations take a [`Guard`] obtained from
//! [`HashStore::guard`], and references they hand out live as long as that guard. Keep in mind
//! that holding on to a guard prevents garbage collection of anything retired meanwhile.
//!
//! For code that does not want to juggle both, [`HashStore::pin`] returns a [`HashStoreRef`]
//! that carries its own token and guard:
//!
//! ```
//! use seqhash::HashStore;
//!
//! let store = HashStore::new();
//! let store = store.pin();
//! for (i, key) in ["a", "b", "c", "d", "e", "f"].iter().enumerate() {
//!     store.set(*key, i + 1);
//! }
//! store.delete(&"c").unwrap();
//! assert_eq!(store.delete_first().unwrap(), Some((&"a", &1)));
//! assert_eq!(store.keys().copied().collect::<Vec<_>>(), vec!["b", "d", "e", "f"]);
//! ```
//!
//! # Equality modes
//!
//! Keys are hashed and compared through a [`KeyStrategy`]. A store starts comparing keys by
//! value and can be switched, once, to comparing them by identity with
//! [`switch_to_identity_equality_and_rehash`](HashStore::switch_to_identity_equality_and_rehash).
//!
//! # Single-threaded stores
//!
//! [`LocalHashStore`] is the unsynchronized counterpart, for hashes only one thread can see. The
//! two convert into each other with [`HashStore::from_local`] and [`HashStore::to_local`].
#![deny(missing_docs)]
#![warn(missing_debug_implementations, rust_2018_idioms)]

mod config;
mod entry;
mod error;
mod iter;
pub mod layout_lock;
mod local;
mod raw;
mod reclaim;
mod store;
mod store_ref;
mod strategy;

#[cfg(feature = "rayon")]
mod rayon_impls;

#[cfg(feature = "serde")]
mod serde_impls;

/// Iterator types.
pub mod iterators {
    pub use crate::iter::{Iter, Keys, Values};
    pub use crate::local::{IntoIter as LocalIntoIter, Iter as LocalIter};
}

pub use config::{Checkpoint, Config, SpinPolicy};
pub use error::ConsistencyError;
pub use layout_lock::ThreadToken;
pub use local::LocalHashStore;
pub use store::HashStore;
pub use store_ref::HashStoreRef;
pub use strategy::{ArcIdentityStrategy, DefaultStrategy, KeyStrategy};

pub use seize::Guard;

/// Default hasher for [`HashStore`].
pub type DefaultHashBuilder = ahash::RandomState;
