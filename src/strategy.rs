//! How keys are hashed and compared.
//!
//! A store compares keys in one of two modes. In _value_ mode two keys are the same if they are
//! equal; in _identity_ mode they are the same only if they are the same object. A store starts
//! out in value mode and can be switched to identity mode once, with
//! [`HashStore::switch_to_identity_equality_and_rehash`](crate::HashStore::switch_to_identity_equality_and_rehash).
//! What "the same object" means is up to the [`KeyStrategy`].

use crate::DefaultHashBuilder;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

/// Mixed into identity-mode hashes so that the two modes never agree by accident.
const IDENTITY_SALT: u64 = 0x9e37_79b9_7f4a_7c15;

/// Hashes and compares the keys of a store.
///
/// Implementations must be consistent: two keys that are `equal` in a mode must hash to the same
/// value in that mode. A store calls `equal` only with the hashes it computed with `hash` in the
/// same mode, so an implementation may use them to short-circuit.
pub trait KeyStrategy<K: ?Sized> {
    /// Hashes `key` for value mode (`identity == false`) or identity mode.
    fn hash(&self, key: &K, identity: bool) -> u64;

    /// Whether `a` and `b` are the same key in the given mode.
    fn equal(&self, identity: bool, a: &K, hash_a: u64, b: &K, hash_b: u64) -> bool;
}

/// Hashes keys with a [`BuildHasher`] and compares them with [`Eq`].
///
/// Plain Rust values have no identity separate from their value, so identity mode behaves like
/// value mode here, only with different hashes. Use [`ArcIdentityStrategy`] for keys that do have
/// an identity.
#[derive(Clone, Default)]
pub struct DefaultStrategy<S = DefaultHashBuilder> {
    build_hasher: S,
}

impl DefaultStrategy {
    /// Hash keys with a randomly seeded [`DefaultHashBuilder`].
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S> DefaultStrategy<S> {
    /// Hash keys using `build_hasher`.
    pub fn with_hasher(build_hasher: S) -> Self {
        Self { build_hasher }
    }

    /// The hasher builder in use.
    pub fn hasher(&self) -> &S {
        &self.build_hasher
    }
}

impl<S> fmt::Debug for DefaultStrategy<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultStrategy").finish_non_exhaustive()
    }
}

impl<K, S> KeyStrategy<K> for DefaultStrategy<S>
where
    K: ?Sized + Hash + Eq,
    S: BuildHasher,
{
    fn hash(&self, key: &K, identity: bool) -> u64 {
        let mut h = self.build_hasher.build_hasher();
        key.hash(&mut h);
        let hash = h.finish();
        if identity {
            hash ^ IDENTITY_SALT
        } else {
            hash
        }
    }

    fn equal(&self, _identity: bool, a: &K, hash_a: u64, b: &K, hash_b: u64) -> bool {
        hash_a == hash_b && a == b
    }
}

/// A strategy for `Arc` keys whose identity mode compares allocations.
///
/// In value mode, keys are hashed and compared through the value they point to. In identity mode,
/// two keys are the same only if they point to the same allocation, as with [`Arc::ptr_eq`].
///
/// ```
/// use seqhash::{ArcIdentityStrategy, HashStore};
/// use std::sync::Arc;
///
/// let store = HashStore::with_strategy(ArcIdentityStrategy::new());
/// let store = store.pin();
/// let a = Arc::new(String::from("key"));
/// let b = Arc::new(String::from("key"));
///
/// store.set(Arc::clone(&a), 1);
/// assert_eq!(store.get(&b), Some(&1));
///
/// store.switch_to_identity_equality_and_rehash();
/// assert_eq!(store.get(&b), None);
/// assert_eq!(store.get(&a), Some(&1));
/// ```
#[derive(Clone, Default)]
pub struct ArcIdentityStrategy<S = DefaultHashBuilder> {
    build_hasher: S,
}

impl ArcIdentityStrategy {
    /// Hash keys with a randomly seeded [`DefaultHashBuilder`].
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S> ArcIdentityStrategy<S> {
    /// Hash keys using `build_hasher`.
    pub fn with_hasher(build_hasher: S) -> Self {
        Self { build_hasher }
    }
}

impl<S> fmt::Debug for ArcIdentityStrategy<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArcIdentityStrategy").finish_non_exhaustive()
    }
}

impl<T, S> KeyStrategy<Arc<T>> for ArcIdentityStrategy<S>
where
    T: ?Sized + Hash + Eq,
    S: BuildHasher,
{
    fn hash(&self, key: &Arc<T>, identity: bool) -> u64 {
        let mut h = self.build_hasher.build_hasher();
        if identity {
            (Arc::as_ptr(key) as *const () as usize).hash(&mut h);
            h.finish() ^ IDENTITY_SALT
        } else {
            (**key).hash(&mut h);
            h.finish()
        }
    }

    fn equal(&self, identity: bool, a: &Arc<T>, hash_a: u64, b: &Arc<T>, hash_b: u64) -> bool {
        if hash_a != hash_b {
            return false;
        }
        if identity {
            Arc::ptr_eq(a, b)
        } else {
            **a == **b
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_modes_hash_differently() {
        let s = DefaultStrategy::<DefaultHashBuilder>::default();
        let value = KeyStrategy::<str>::hash(&s, "a", false);
        let identity = KeyStrategy::<str>::hash(&s, "a", true);
        assert_ne!(value, identity);
        assert_eq!(value, KeyStrategy::<str>::hash(&s, "a", false));
        assert!(s.equal(true, "a", identity, "a", identity));
        assert!(!s.equal(false, "a", value, "b", KeyStrategy::<str>::hash(&s, "b", false)));
    }

    #[test]
    fn arc_identity() {
        let s = ArcIdentityStrategy::<DefaultHashBuilder>::default();
        let a = Arc::new(5u32);
        let b = Arc::new(5u32);

        let (ha, hb) = (s.hash(&a, false), s.hash(&b, false));
        assert_eq!(ha, hb);
        assert!(s.equal(false, &a, ha, &b, hb));

        let (ha, hb) = (s.hash(&a, true), s.hash(&b, true));
        assert!(!s.equal(true, &a, ha, &b, hb));
        let a2 = Arc::clone(&a);
        assert!(s.equal(true, &a, ha, &a2, s.hash(&a2, true)));
    }
}
