//! Sample concurrent maps coordinated by a [`Roundabout`].
//!
//! These are clients, not extensions: the log supplies every exclusion
//! guarantee, and the maps are otherwise plain hash tables. [`LockedMap`]
//! guards one table with ring-wide claims; [`ShardedMap`] hashes keys onto
//! lanes so writers to different shards run concurrently.

use crate::ring::Roundabout;
use fxhash::FxHashMap;
use std::{
    cell::UnsafeCell,
    fmt::{self, Debug, Formatter},
    hash::Hash,
};

/// A hash map behind one coordination log: shared readers, one writer.
///
/// Reads run under `share_ring` (concurrent with each other and with
/// ordered traversals), structural mutation under `lock_ring`, and
/// read-only traversal under `order_ring` (excludes writers, tolerates
/// readers).
///
/// # Examples
///
/// ```
/// use roundabout::map::LockedMap;
///
/// let map = LockedMap::new();
/// map.insert("k", 1);
/// assert_eq!(map.get(&"k"), Some(1));
/// assert_eq!(map.remove(&"k"), Some(1));
/// assert!(map.is_empty());
/// ```
pub struct LockedMap<K, V> {
    ring:  Roundabout,
    table: UnsafeCell<FxHashMap<K, V>>,
}

// Every `&mut` access to the table runs under a `LockRing` claim and every
// `&` access under `ShareRing`/`OrderRing`; the conflict matrix keeps the
// exclusive accesses disjoint from all others, which is the aliasing
// contract `Sync` requires of the inner table.
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for LockedMap<K, V> {}

impl<K: Eq + Hash, V> LockedMap<K, V> {
    pub fn new() -> Self {
        LockedMap {
            ring:  Roundabout::new(),
            table: UnsafeCell::new(FxHashMap::default()),
        }
    }

    /// Clones the value under `key`, if any.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.ring.share_ring(|_, _| {
            // shared: writers are excluded, other readers only take `&`
            let table = unsafe { &*self.table.get() };
            table.get(key).cloned()
        })
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.ring.share_ring(|_, _| {
            let table = unsafe { &*self.table.get() };
            table.contains_key(key)
        })
    }

    /// Inserts, returning the displaced value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.ring.lock_ring(|_, _| {
            // exclusive: every other descriptor has retracted
            let table = unsafe { &mut *self.table.get() };
            table.insert(key, value)
        })
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.ring.lock_ring(|_, _| {
            let table = unsafe { &mut *self.table.get() };
            table.remove(key)
        })
    }

    pub fn len(&self) -> usize {
        self.ring.share_ring(|_, _| {
            let table = unsafe { &*self.table.get() };
            table.len()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.ring.lock_ring(|_, _| {
            let table = unsafe { &mut *self.table.get() };
            table.clear();
        })
    }

    /// Visits every entry read-only: concurrent with `get`, serialized
    /// against mutation.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        self.ring.order_ring(|_, _| {
            let table = unsafe { &*self.table.get() };
            for (key, value) in table {
                f(key, value);
            }
        })
    }
}

impl<K: Eq + Hash, V> Default for LockedMap<K, V> {
    fn default() -> Self {
        LockedMap::new()
    }
}

impl<K, V> Debug for LockedMap<K, V> {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("LockedMap")
            .field("ring", &self.ring)
            .finish_non_exhaustive()
    }
}

const SHARDS: usize = 16;

/// A sharded hash map: keys hash onto lanes, so writers to different
/// shards run concurrently and readers only wait for a writer on their own
/// shard.
///
/// Per-key operations claim `share_lane`/`lock_lane` on the key's shard;
/// whole-map operations claim the ring.
///
/// # Examples
///
/// ```
/// use roundabout::map::ShardedMap;
///
/// let map = ShardedMap::new();
/// map.insert(1, "one");
/// map.insert(2, "two");
/// assert_eq!(map.get(&1), Some("one"));
/// assert_eq!(map.len(), 2);
/// ```
pub struct ShardedMap<K, V> {
    ring:   Roundabout,
    shards: [UnsafeCell<FxHashMap<K, V>>; SHARDS],
}

// Shard `i` is only referenced mutably under `LockLane(i)` and only
// referenced shared under `ShareLane(i)` or a ring-wide claim; the lane
// matrix makes those disjoint, shard by shard.
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for ShardedMap<K, V> {}

impl<K: Eq + Hash, V> ShardedMap<K, V> {
    pub fn new() -> Self {
        ShardedMap {
            ring:   Roundabout::new(),
            shards: std::array::from_fn(|_| UnsafeCell::new(FxHashMap::default())),
        }
    }

    #[inline]
    fn lane_of(key: &K) -> u32 {
        fxhash::hash32(key) % SHARDS as u32
    }

    /// Clones the value under `key`, if any. Waits only for a writer on
    /// this key's shard.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let lane = Self::lane_of(key);
        self.ring.share_lane(lane, |_, _| {
            let shard = unsafe { &*self.shards[lane as usize].get() };
            shard.get(key).cloned()
        })
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let lane = Self::lane_of(key);
        self.ring.share_lane(lane, |_, _| {
            let shard = unsafe { &*self.shards[lane as usize].get() };
            shard.contains_key(key)
        })
    }

    /// Inserts, returning the displaced value. Excludes only this shard.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let lane = Self::lane_of(&key);
        self.ring.lock_lane(lane, |_, _| {
            let shard = unsafe { &mut *self.shards[lane as usize].get() };
            shard.insert(key, value)
        })
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let lane = Self::lane_of(key);
        self.ring.lock_lane(lane, |_, _| {
            let shard = unsafe { &mut *self.shards[lane as usize].get() };
            shard.remove(key)
        })
    }

    /// Entry count across all shards. A ring-wide share, so it excludes
    /// every lane writer in both directions but runs alongside readers.
    pub fn len(&self) -> usize {
        self.ring.share_ring(|_, _| {
            self.shards
                .iter()
                .map(|shard| unsafe { &*shard.get() }.len())
                .sum()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.ring.lock_ring(|_, _| {
            for shard in &self.shards {
                unsafe { &mut *shard.get() }.clear();
            }
        })
    }
}

impl<K: Eq + Hash, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        ShardedMap::new()
    }
}

impl<K, V> Debug for ShardedMap<K, V> {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ShardedMap")
            .field("ring", &self.ring)
            .field("shards", &SHARDS)
            .finish_non_exhaustive()
    }
}
