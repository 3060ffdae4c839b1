use crate::{HashStore, HashStoreRef, KeyStrategy, LocalHashStore};
use serde::{
    de::{MapAccess, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};
use std::fmt::{self, Formatter};
use std::marker::PhantomData;

struct HashStoreVisitor<K, V, S> {
    key_marker: PhantomData<K>,
    value_marker: PhantomData<V>,
    strategy_marker: PhantomData<S>,
}

impl<K, V, S> Serialize for HashStoreRef<'_, K, V, S>
where
    K: Serialize,
    V: Serialize,
{
    fn serialize<Sr>(&self, serializer: Sr) -> Result<Sr::Ok, Sr::Error>
    where
        Sr: Serializer,
    {
        serializer.collect_map(self.iter())
    }
}

impl<K, V, S> Serialize for HashStore<K, V, S>
where
    K: Serialize,
    V: Serialize,
{
    fn serialize<Sr>(&self, serializer: Sr) -> Result<Sr::Ok, Sr::Error>
    where
        Sr: Serializer,
    {
        self.pin().serialize(serializer)
    }
}

impl<K, V, S> Serialize for LocalHashStore<K, V, S>
where
    K: Serialize,
    V: Serialize,
{
    fn serialize<Sr>(&self, serializer: Sr) -> Result<Sr::Ok, Sr::Error>
    where
        Sr: Serializer,
    {
        serializer.collect_map(self.iter())
    }
}

impl<'de, K, V, S> Deserialize<'de> for HashStore<K, V, S>
where
    K: Deserialize<'de>,
    V: Deserialize<'de>,
    S: KeyStrategy<K> + Default,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(HashStoreVisitor::new())
    }
}

impl<K, V, S> HashStoreVisitor<K, V, S> {
    pub(crate) fn new() -> Self {
        Self {
            key_marker: PhantomData,
            value_marker: PhantomData,
            strategy_marker: PhantomData,
        }
    }
}

impl<'de, K, V, S> Visitor<'de> for HashStoreVisitor<K, V, S>
where
    K: Deserialize<'de>,
    V: Deserialize<'de>,
    S: KeyStrategy<K> + Default,
{
    type Value = HashStore<K, V, S>;

    fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "a map")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let store = match access.size_hint() {
            Some(n) => HashStore::with_capacity_and_strategy(n, S::default()),
            None => HashStore::with_strategy(S::default()),
        };

        {
            let store = store.pin();
            // a repeated key keeps its first position and its last value
            while let Some((key, value)) = access.next_entry()? {
                store.set(key, value);
            }
        }

        Ok(store)
    }
}
