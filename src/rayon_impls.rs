use crate::{HashStore, KeyStrategy};
use rayon::iter::{FromParallelIterator, IntoParallelIterator, ParallelExtend, ParallelIterator};

impl<K, V, S> ParallelExtend<(K, V)> for HashStore<K, V, S>
where
    K: Send + Sync,
    V: Send + Sync,
    S: KeyStrategy<K> + Sync,
{
    // This is of limited use due to the `&mut self` parameter. See `par_extend_sync`
    fn par_extend<I>(&mut self, par_iter: I)
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        self.par_extend_sync(par_iter);
    }
}

impl<K, V, S> HashStore<K, V, S>
where
    K: Send + Sync,
    V: Send + Sync,
    S: KeyStrategy<K> + Sync,
{
    /// Inserts all pairs of `par_iter` from rayon's worker threads.
    ///
    /// Each worker registers with the store once per job it runs, not once per pair.
    pub fn par_extend_sync<I>(&self, par_iter: I)
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        par_iter.into_par_iter().for_each_init(
            || (self.register_thread(), self.guard()),
            |(token, guard), (k, v)| {
                self.set(token, k, v, guard);
            },
        );
    }
}

impl<K, V> FromParallelIterator<(K, V)> for HashStore<K, V>
where
    K: Send + Sync + std::hash::Hash + Eq,
    V: Send + Sync,
{
    fn from_par_iter<I>(par_iter: I) -> Self
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        let mut created_store = HashStore::new();
        created_store.par_extend(par_iter);
        created_store
    }
}
