// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./lru_map_test.rs"]
mod lru_map_test;

use hashbrown::HashMap;
use hashbrown::hash_map::RawEntryMut;
use intrusive_collections::{LinkedList, LinkedListLink, UnsafeRef, intrusive_adapter};
use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomPinned;

//
// MapKey
//

// Holds both the key and the LRU list link. The key lives in a Box owned by the map so its address
// is stable for the lifetime of the entry.
#[derive(Debug)]
struct MapKey<K> {
  key: K,
  link: LinkedListLink,
  _pinned: PhantomPinned,
}

impl<K> MapKey<K> {
  const fn new(key: K) -> Self {
    Self {
      key,
      link: LinkedListLink::new(),
      _pinned: PhantomPinned,
    }
  }
}

impl<K: PartialEq> PartialEq for MapKey<K> {
  fn eq(&self, other: &Self) -> bool {
    self.key.eq(&other.key)
  }
}

impl<K: Eq> Eq for MapKey<K> {}

impl<K: Hash> Hash for MapKey<K> {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.key.hash(state);
  }
}

// Safety: The link is only manipulated while holding the map mutex.
unsafe impl<K: Sync> Sync for MapKey<K> {}

intrusive_adapter!(LruAdapter<K> = UnsafeRef<MapKey<K>>: MapKey<K> { link: LinkedListLink });

//
// Inner
//

struct Inner<K, V, S> {
  map: HashMap<Box<MapKey<K>>, V, S>,
  lru: LinkedList<LruAdapter<K>>,
  capacity: usize,
}

impl<K, V, S> Drop for Inner<K, V, S> {
  fn drop(&mut self) {
    // The list does not own its entries, so clear it without walking it before the map frees
    // them.
    self.lru.fast_clear();
  }
}

//
// LruMap
//

/// A capacity bounded map that evicts the least recently used entry on insert. Lookups promote
/// the entry to most recently used. All operations take a single mutex.
pub struct LruMap<K, V, S = RandomState> {
  hash_builder: S,
  inner: Mutex<Inner<K, V, S>>,
}

impl<K: Eq + Hash, V: Clone> LruMap<K, V> {
  #[must_use]
  pub fn new(capacity: usize) -> Self {
    Self::with_hasher(capacity, RandomState::new())
  }
}

impl<K: Eq + Hash, V: Clone, S: BuildHasher + Clone> LruMap<K, V, S> {
  pub fn with_hasher(capacity: usize, hash_builder: S) -> Self {
    Self {
      inner: Mutex::new(Inner {
        map: HashMap::with_hasher(hash_builder.clone()),
        lru: LinkedList::new(LruAdapter::new()),
        capacity,
      }),
      hash_builder,
    }
  }

  // Given a key in the map, move it to most recently used.
  fn promote(lru: &mut LinkedList<LruAdapter<K>>, key: *const MapKey<K>) {
    let mut entry = unsafe {
      // Safety: The key is in the map and already linked into the LRU.
      lru.cursor_mut_from_ptr(key)
    };
    if let Some(entry) = entry.remove() {
      lru.push_back(entry);
    }
  }

  // Evict from the front of the LRU until the map fits within its capacity.
  fn evict(
    map: &mut HashMap<Box<MapKey<K>>, V, S>,
    lru: &mut LinkedList<LruAdapter<K>>,
    capacity: usize,
  ) -> usize {
    let mut num_evictions = 0;
    while map.len() > capacity {
      let Some(front) = lru.front().get() else {
        break;
      };
      let RawEntryMut::Occupied(entry) = map.raw_entry_mut().from_key(front) else {
        unreachable!()
      };
      // Unlink before the map frees the key.
      lru.pop_front();
      entry.remove();
      num_evictions += 1;
    }
    num_evictions
  }

  /// Returns a copy of the value for the key and promotes it to most recently used.
  pub fn get(&self, key: &K) -> Option<V> {
    let hash = self.hash_builder.hash_one(key);
    let mut inner = self.inner.lock();
    let Inner { map, lru, .. } = &mut *inner;
    let (map_key, value) = map
      .raw_entry()
      .from_hash(hash, |key_to_match| key_to_match.key == *key)?;
    let map_key: *const MapKey<K> = &**map_key;
    let value = value.clone();
    Self::promote(lru, map_key);
    Some(value)
  }

  /// Inserts or replaces the value for the key. The entry becomes most recently used and the
  /// least recently used entries are evicted if the map is over capacity. Returns the number of
  /// evicted entries.
  pub fn insert(&self, key: K, value: V) -> usize {
    let hash = self.hash_builder.hash_one(&key);
    let mut inner = self.inner.lock();
    let Inner { map, lru, capacity } = &mut *inner;
    match map
      .raw_entry_mut()
      .from_hash(hash, |key_to_match| key_to_match.key == key)
    {
      RawEntryMut::Occupied(mut e) => {
        *e.get_mut() = value;
        let map_key: *const MapKey<K> = &**e.key();
        Self::promote(lru, map_key);
      },
      RawEntryMut::Vacant(v) => {
        let map_key = Box::new(MapKey::new(key));
        lru.push_back(unsafe {
          // Safety: Ownership of the list entry is within the map, so we must use UnsafeRef for
          // the list itself.
          UnsafeRef::from_raw(map_key.as_ref())
        });
        v.insert_hashed_nocheck(hash, map_key, value);
      },
    }
    Self::evict(map, lru, *capacity)
  }

  /// Sets a new capacity, evicting least recently used entries if required. Returns the number of
  /// evicted entries.
  pub fn set_capacity(&self, capacity: usize) -> usize {
    let mut inner = self.inner.lock();
    let Inner {
      map,
      lru,
      capacity: current,
    } = &mut *inner;
    *current = capacity;
    Self::evict(map, lru, capacity)
  }

  pub fn capacity(&self) -> usize {
    self.inner.lock().capacity
  }

  pub fn len(&self) -> usize {
    self.inner.lock().map.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
