use seqhash::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn new() {
    let _store = HashStore::<usize, usize>::new();
}

#[test]
fn clear() {
    let store = HashStore::<usize, usize>::new();
    let token = store.register_thread();
    let guard = store.guard();
    {
        for i in 0..20 {
            store.set(&token, i, 1, &guard);
        }
    }
    assert_eq!(store.capacity(), 32);
    store.clear(&guard);
    assert!(store.is_empty());
    assert_eq!(store.capacity(), 8);
    assert_eq!(store.iter(&guard).count(), 0);
    assert_eq!(store.verify_quiescent(&guard), Ok(()));

    // and it is usable afterwards
    store.set(&token, 7, 7, &guard);
    assert_eq!(store.keys(&guard).copied().collect::<Vec<_>>(), vec![7]);
}

#[test]
fn set() {
    let store = HashStore::<usize, usize>::new();
    let token = store.register_thread();
    let guard = store.guard();
    let old = store.set(&token, 42, 0, &guard);
    assert!(old.is_none());
}

#[test]
fn get_empty() {
    let store = HashStore::<usize, usize>::new();

    {
        let token = store.register_thread();
        let guard = store.guard();
        let e = store.get(&token, &42, &guard);
        assert!(e.is_none());
    }
}

#[test]
fn delete_empty() {
    let store = HashStore::<usize, usize>::new();

    {
        let token = store.register_thread();
        let guard = store.guard();
        let old = store.delete(&token, &42, &guard);
        assert_eq!(old, Ok(None));
    }
}

#[test]
fn set_and_delete() {
    let store = HashStore::<usize, usize>::new();

    {
        let token = store.register_thread();
        let guard = store.guard();
        store.set(&token, 42, 0, &guard);
        let old = store.delete(&token, &42, &guard).unwrap().unwrap();
        assert_eq!(old, &0);
        assert!(store.get(&token, &42, &guard).is_none());
        assert!(store.is_empty());
    }
}

#[test]
fn set_and_get() {
    let store = HashStore::<usize, usize>::new();

    store.set(&store.register_thread(), 42, 0, &store.guard());
    {
        let token = store.register_thread();
        let guard = store.guard();
        let e = store.get(&token, &42, &guard).unwrap();
        assert_eq!(e, &0);
    }
}

use hasher::one_bucket;

#[test]
fn one_bucket_chain() {
    let store = HashStore::<&'static str, usize, _>::with_strategy(one_bucket());
    let token = store.register_thread();
    let guard = store.guard();

    // we want to check that all operations work regardless on whether
    // we are operating on the head of a bucket, the tail of the bucket,
    // or somewhere in the middle.
    let v = store.set(&token, "tail", 0, &guard);
    assert_eq!(v, None);
    let v = store.set(&token, "middle", 10, &guard);
    assert_eq!(v, None);
    let v = store.set(&token, "head", 100, &guard);
    assert_eq!(v, None);
    let e = store.get(&token, &"head", &guard).unwrap();
    assert_eq!(e, &100);
    let e = store.get(&token, &"middle", &guard).unwrap();
    assert_eq!(e, &10);
    let e = store.get(&token, &"tail", &guard).unwrap();
    assert_eq!(e, &0);

    // check that replacing the keys returns the correct old value
    let v = store.set(&token, "head", 101, &guard);
    assert_eq!(v, Some(&100));
    let v = store.set(&token, "middle", 11, &guard);
    assert_eq!(v, Some(&10));
    let v = store.set(&token, "tail", 1, &guard);
    assert_eq!(v, Some(&0));
    // and updated the right value without moving the key
    let keys: Vec<_> = store.keys(&guard).copied().collect();
    assert_eq!(keys, vec!["tail", "middle", "head"]);
    assert_eq!(store.get(&token, &"head", &guard), Some(&101));

    // and that delete produces the right value
    // note that we must delete them in a particular order
    // so that we test all three entry positions
    let v = store.delete(&token, &"middle", &guard);
    assert_eq!(v, Ok(Some(&11)));
    let v = store.delete(&token, &"tail", &guard);
    assert_eq!(v, Ok(Some(&1)));
    let v = store.delete(&token, &"head", &guard);
    assert_eq!(v, Ok(Some(&101)));
    assert!(store.is_empty());
    assert_eq!(store.verify_quiescent(&guard), Ok(()));
}

#[test]
fn update_keeps_position() {
    let store = HashStore::<usize, usize>::new();
    let token = store.register_thread();
    let guard = store.guard();
    store.set(&token, 42, 0, &guard);
    store.set(&token, 7, 0, &guard);
    let old = store.set(&token, 42, 1, &guard);
    assert_eq!(old, Some(&0));
    assert_eq!(store.len(), 2);
    let entries: Vec<_> = store.iter(&guard).map(|(k, v)| (*k, *v)).collect();
    assert_eq!(entries, vec![(42, 1), (7, 0)]);
}

#[test]
fn insertion_order() {
    let store = HashStore::new();
    let store = store.pin();
    for (i, key) in ["a", "b", "c", "d", "e", "f"].iter().enumerate() {
        assert_eq!(store.set(*key, i + 1), None);
    }
    assert_eq!(store.delete(&"c"), Ok(Some(&3)));
    assert_eq!(store.delete_first(), Ok(Some((&"a", &1))));

    let mut seen = Vec::new();
    store.each_entry(|i, k, v| seen.push((i, *k, *v)));
    assert_eq!(seen, vec![(0, "b", 2), (1, "d", 4), (2, "e", 5), (3, "f", 6)]);
    assert_eq!(store.len(), 4);
}

#[test]
fn grows_past_three_quarters() {
    let store = HashStore::<usize, usize>::new();
    let store = store.pin();
    assert_eq!(store.capacity(), 8);
    for i in 0..6 {
        store.set(i, i);
    }
    // 6 / 8 is not above the load factor
    assert_eq!(store.capacity(), 8);
    store.set(6, 6);
    assert_eq!(store.capacity(), 16);
    assert_eq!(store.keys().copied().collect::<Vec<_>>(), (0..7).collect::<Vec<_>>());
    assert_eq!(store.verify_quiescent(), Ok(()));
}

#[test]
fn with_capacity_does_not_grow() {
    let store = HashStore::<usize, usize>::with_capacity(100);
    let capacity = store.capacity();
    let store = store.pin();
    for i in 0..100 {
        store.set(i, i);
    }
    assert_eq!(store.capacity(), capacity);
}

#[test]
fn delete_last() {
    let store = HashStore::<&'static str, usize>::new();
    let store = store.pin();
    store.set("a", 1);
    store.set("b", 2);
    store.set("c", 3);

    assert_eq!(store.delete_last(&"c"), Ok(Some(&3)));
    assert_eq!(store.delete_last(&"b"), Ok(Some(&2)));
    assert_eq!(store.keys().copied().collect::<Vec<_>>(), vec!["a"]);
    assert_eq!(store.delete_last(&"a"), Ok(Some(&1)));
    assert_eq!(store.delete_last(&"a"), Ok(None));
    assert_eq!(store.verify_quiescent(), Ok(()));
}

#[test]
fn delete_last_mismatch() {
    let store = HashStore::<&'static str, usize>::new();
    let store = store.pin();
    store.set("a", 1);
    store.set("b", 2);

    let err = store.delete_last(&"a").unwrap_err();
    assert!(matches!(err, ConsistencyError::LastKeyMismatch { .. }));
    // nothing was removed
    assert_eq!(store.len(), 2);
    assert_eq!(store.keys().copied().collect::<Vec<_>>(), vec!["a", "b"]);
}

#[test]
fn delete_first_empty() {
    let store = HashStore::<usize, usize>::new();
    let store = store.pin();
    assert_eq!(store.delete_first(), Ok(None));
    store.set(1, 1);
    assert_eq!(store.delete_first(), Ok(Some((&1, &1))));
    assert_eq!(store.delete_first(), Ok(None));
}

#[test]
fn delete_first_drains_in_order() {
    let store = HashStore::<usize, usize>::new();
    let store = store.pin();
    for i in 0..50 {
        store.set(i, i * 2);
    }
    for i in 0..50 {
        assert_eq!(store.delete_first(), Ok(Some((&i, &(i * 2)))));
    }
    assert!(store.is_empty());
    assert_eq!(store.verify_quiescent(), Ok(()));
}

#[test]
fn lookup_or_default() {
    let store = HashStore::<usize, String>::new();
    let store = store.pin();
    store.set(1, String::from("one"));
    assert_eq!(store.lookup_or_default(&1, |_| String::new()), "one");
    assert_eq!(store.lookup_or_default(&2, |k| k.to_string()), "2");
    // the default is not inserted
    assert!(!store.contains_key(&2));
}

#[test]
fn each_entry_hashed() {
    let store = HashStore::<u32, u32>::new();
    let store = store.pin();
    for i in 0..10 {
        store.set(i, i);
    }
    let mut visited = 0;
    store.each_entry_hashed(|i, hash, k, v| {
        assert_eq!(i as u32, *k);
        assert_eq!(k, v);
        assert_eq!(hash, store.store().strategy().hash(k, false));
        visited += 1;
    });
    assert_eq!(visited, 10);
}

#[test]
fn checkpoint_runs_per_entry() {
    let count = Arc::new(AtomicUsize::new(0));
    let config = {
        let count = Arc::clone(&count);
        Config::new().checkpoint(move || {
            count.fetch_add(1, Ordering::Relaxed);
        })
    };
    let store = HashStore::<u32, u32>::with_config(config);
    let store = store.pin();
    for i in 0..5 {
        store.set(i, i);
    }
    store.each_entry(|_, _, _| {});
    assert_eq!(count.load(Ordering::Relaxed), 5);
    store.each_entry_hashed(|_, _, _, _| {});
    assert_eq!(count.load(Ordering::Relaxed), 10);
}

#[test]
fn replace_from() {
    let store = HashStore::<&'static str, u32>::new();
    let store = store.pin();
    for (i, key) in ["x", "y", "z"].iter().enumerate() {
        store.set(*key, i as u32);
    }

    let mut local = LocalHashStore::new();
    for i in 0..20u32 {
        local.insert(["b", "a", "d", "c"][i as usize % 4], i);
    }
    store.replace_from(local);

    assert_eq!(store.len(), 4);
    assert_eq!(store.get(&"x"), None);
    assert_eq!(store.get(&"a"), Some(&17));
    let keys: Vec<_> = store.keys().copied().collect();
    assert_eq!(keys, vec!["b", "a", "d", "c"]);
    assert_eq!(store.verify_quiescent(), Ok(()));

    store.replace_from(LocalHashStore::new());
    assert!(store.is_empty());
    assert_eq!(store.capacity(), 8);
}

#[test]
fn replace_from_store() {
    let source = HashStore::<u32, u32>::new();
    {
        let source = source.pin();
        for i in 0..10 {
            source.set(i, i * 2);
        }
        source.delete(&4).unwrap();
    }

    let store = HashStore::<u32, u32>::new();
    let store = store.pin();
    store.set(100, 100);
    store.replace_from_store(&source);
    assert_eq!(store.get(&100), None);
    assert_eq!(store.len(), 9);
    let expected: Vec<_> = source.pin().iter().map(|(k, v)| (*k, *v)).collect();
    let got: Vec<_> = store.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(got, expected);
    assert_eq!(store.verify_quiescent(), Ok(()));

    // replacing a store with itself keeps it as it was
    store.replace_from_store(store.store());
    let again: Vec<_> = store.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(again, expected);
    assert_eq!(store.verify_quiescent(), Ok(()));
}

#[test]
fn from_local_with_config() {
    let count = Arc::new(AtomicUsize::new(0));
    let config = {
        let count = Arc::clone(&count);
        Config::new().initial_capacity(100).checkpoint(move || {
            count.fetch_add(1, Ordering::Relaxed);
        })
    };
    let mut local = LocalHashStore::new();
    for i in 0..3u32 {
        local.insert(i, i);
    }

    let store = HashStore::from_local_with_config(local, config);
    let store = store.pin();
    assert_eq!(store.capacity(), 256);
    store.each_entry(|_, _, _| {});
    assert_eq!(count.load(Ordering::Relaxed), 3);
    assert_eq!(store.verify_quiescent(), Ok(()));

    // the configured capacity never leaves too little room
    let local: LocalHashStore<u32, u32> = (0..20).map(|i| (i, i)).collect();
    let store = HashStore::from_local_with_config(local, Config::new().initial_capacity(1));
    assert_eq!(store.capacity(), 64);
    assert_eq!(store.pin().len(), 20);
}

#[test]
fn to_local_and_back() {
    let store = HashStore::<u32, u32>::new();
    {
        let store = store.pin();
        for i in 0..30 {
            store.set(i, i + 100);
        }
        for i in (0..30).step_by(3) {
            store.delete(&i).unwrap();
        }
    }

    let local = store.pin().to_local();
    assert_eq!(local.len(), 20);
    let mut hashes = Vec::new();
    store
        .pin()
        .each_entry_hashed(|_, hash, k, v| hashes.push((hash, *k, *v)));
    let local_hashes: Vec<_> = local.iter_hashed().map(|(h, k, v)| (h, *k, *v)).collect();
    assert_eq!(hashes, local_hashes);
    assert_eq!(local.get(&4), Some(&104));

    let back = HashStore::from_local(local);
    let back = back.pin();
    assert_eq!(back.len(), 20);
    assert_eq!(back.get(&4), Some(&104));
    assert_eq!(back.get(&3), None);
    let mut back_hashes = Vec::new();
    back.each_entry_hashed(|_, hash, k, v| back_hashes.push((hash, *k, *v)));
    assert_eq!(hashes, back_hashes);
    assert_eq!(back.verify_quiescent(), Ok(()));

    // still grows like any other store
    for i in 100..200 {
        back.set(i, i);
    }
    assert_eq!(back.len(), 120);
    assert_eq!(back.verify_quiescent(), Ok(()));
}

#[test]
fn rehash_keeps_everything() {
    let store = HashStore::<String, usize>::new();
    let store = store.pin();
    for i in 0..100 {
        store.set(i.to_string(), i);
    }
    for i in (0..100).step_by(7) {
        store.delete(&i.to_string()).unwrap();
    }
    let before: Vec<_> = store.iter().map(|(k, v)| (k.clone(), *v)).collect();

    store.rehash();
    store.rehash();

    let after: Vec<_> = store.iter().map(|(k, v)| (k.clone(), *v)).collect();
    assert_eq!(before, after);
    assert_eq!(store.len(), before.len());
    assert_eq!(store.get(&String::from("50")), Some(&50));
    assert_eq!(store.verify_quiescent(), Ok(()));
}

#[test]
fn switch_to_identity() {
    let store = HashStore::<u64, u64>::new();
    let store = store.pin();
    for i in 0..10 {
        store.set(i, i);
    }
    assert!(!store.is_identity());
    store.switch_to_identity_equality_and_rehash();
    assert!(store.is_identity());
    // plain values have no identity apart from their value
    assert_eq!(store.get(&3), Some(&3));
    assert_eq!(store.keys().copied().collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());

    // rehashing an identity store does nothing
    store.rehash();
    assert_eq!(store.len(), 10);
    assert_eq!(store.verify_quiescent(), Ok(()));

    let local = store.to_local();
    assert!(local.is_identity());
    assert!(HashStore::from_local(local).is_identity());
}

#[test]
fn current_kv_dropped() {
    let dropped1 = Arc::new(0);
    let dropped2 = Arc::new(0);

    let store = HashStore::<Arc<usize>, Arc<usize>>::new();

    store.set(
        &store.register_thread(),
        dropped1.clone(),
        dropped2.clone(),
        &store.guard(),
    );
    assert_eq!(Arc::strong_count(&dropped1), 2);
    assert_eq!(Arc::strong_count(&dropped2), 2);

    drop(store);

    // dropping the store should immediately drop (not deferred) all keys and values
    assert_eq!(Arc::strong_count(&dropped1), 1);
    assert_eq!(Arc::strong_count(&dropped2), 1);
}

#[test]
fn default() {
    let store: HashStore<usize, usize> = Default::default();

    let token = store.register_thread();
    let guard = store.guard();
    store.set(&token, 42, 0, &guard);

    assert_eq!(store.get(&token, &42, &guard), Some(&0));
}

#[test]
fn debug() {
    let store: HashStore<usize, usize> = HashStore::new();

    {
        let store = store.pin();
        store.set(42, 0);
        store.set(16, 8);
    }

    let formatted = format!("{:?}", store);
    assert_eq!(formatted, "{42: 0, 16: 8}");
}

#[test]
fn extend() {
    let store: HashStore<usize, usize> = HashStore::new();

    let entries: Vec<(usize, usize)> = vec![(42, 0), (16, 6), (38, 42)];

    (&store).extend(entries.clone().into_iter());

    let guard = store.guard();
    let collected: Vec<(usize, usize)> = store
        .iter(&guard)
        .map(|(key, value)| (*key, *value))
        .collect();

    assert_eq!(entries, collected);
}

#[test]
fn from_iter() {
    use std::iter::FromIterator;

    let entries: Vec<(usize, usize)> = vec![(42, 0), (16, 6), (38, 42), (16, 7)];

    let store: HashStore<usize, usize> = HashStore::from_iter(entries.into_iter());

    let store = store.pin();
    let collected: Vec<(usize, usize)> = store.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(collected, vec![(42, 0), (16, 7), (38, 42)]);
}

#[test]
fn index() {
    let store = HashStore::<&'static str, usize>::new();
    let store = store.pin();
    store.set("k", 3);
    assert_eq!(store[&"k"], 3);
}

#[test]
#[should_panic(expected = "no entry found for key")]
fn index_missing() {
    let store = HashStore::<&'static str, usize>::new();
    let store = store.pin();
    let _value = store[&"k"];
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_insert() {
    let store = Arc::new(HashStore::<usize, usize>::new());

    let store1 = store.clone();
    let t1 = std::thread::spawn(move || {
        let store = store1.pin();
        for i in 0..64 {
            store.set(i, 0);
        }
    });
    let store2 = store.clone();
    let t2 = std::thread::spawn(move || {
        let store = store2.pin();
        for i in 0..64 {
            store.set(i, 1);
        }
    });

    t1.join().unwrap();
    t2.join().unwrap();

    let store = store.pin();
    assert_eq!(store.len(), 64);
    for i in 0..64 {
        let v = store.get(&i).unwrap();
        assert!(v == &0 || v == &1);
    }
    assert_eq!(store.verify_quiescent(), Ok(()));
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_delete() {
    let store = Arc::new(HashStore::<usize, usize>::new());

    {
        let store = store.pin();
        for i in 0..64 {
            store.set(i, i);
        }
    }

    let deleted = Arc::new(AtomicUsize::new(0));
    let threads: Vec<_> = (0..2)
        .map(|_| {
            let store = store.clone();
            let deleted = deleted.clone();
            std::thread::spawn(move || {
                let store = store.pin();
                for i in 0..64 {
                    if let Some(v) = store.delete(&i).unwrap() {
                        assert_eq!(v, &i);
                        deleted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    // every key was deleted by exactly one thread
    assert_eq!(deleted.load(Ordering::SeqCst), 64);
    let store = store.pin();
    for i in 0..64 {
        assert!(store.get(&i).is_none());
    }
    assert!(store.is_empty());
    assert_eq!(store.verify_quiescent(), Ok(()));
}
