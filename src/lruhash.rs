//! One slab of the host cache: a cost-bounded LRU table whose entries carry
//! their own reader/writer lock.
//!
//! Two lock levels:
//! * the table mutex guards the index and the LRU order, held only long
//!   enough to find/unlink an entry and try its lock;
//! * the per-entry `RwLock` guards the data. Guards own an `Arc` to the
//!   entry so they outlive the table lock.
//!
//! A contended entry lock is never waited on under the table mutex: the
//! waiter drops the mutex, blocks on the entry, then checks the entry is
//! still linked and retries the lookup if not. Callers' closures always run
//! with the table mutex released.
//!
//! Eviction unlinks under the table lock, then takes the victim's write lock
//! with the table lock released, marks it unlinked and hands the storage
//! back to the pool.

use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use rustc_hash::FxBuildHasher;
use tracing::trace;

use crate::alloc::{Pool, Record, SharedPool};

#[derive(Default)]
pub struct Slot<K, V> {
    key: K,
    data: V,
    /// cleared once the entry leaves the table
    linked: bool,
}

/// Pooled storage behind every entry.
pub type Cell<K, V> = RwLock<Slot<K, V>>;

struct Node<K, V> {
    cell: Record<Cell<K, V>>,
    cost: usize,
}

struct Table<K, V> {
    lru: LruCache<K, Node<K, V>, FxBuildHasher>,
    used: usize,
    capacity: usize,
}

impl<K: Hash + Eq, V> Table<K, V> {
    /// Unlink LRU entries until the table fits. The most recent entry stays.
    fn evict_overflow(&mut self, victims: &mut Vec<Record<Cell<K, V>>>) {
        while self.used > self.capacity && self.lru.len() > 1 {
            let Some((_, node)) = self.lru.pop_lru() else {
                break;
            };
            self.used -= node.cost;
            victims.push(node.cell);
        }
    }
}

/// Occupancy snapshot of one slab.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlabStats {
    pub entries: usize,
    pub used: usize,
    pub capacity: usize,
    pub quarantined: usize,
}

pub struct LruHash<K, V> {
    table: Mutex<Table<K, V>>,
    pool: Mutex<Pool<Cell<K, V>>>,
}

/// Shared access to an entry; the lock is released on drop.
pub struct ReadGuard<K, V>(ArcRwLockReadGuard<RawRwLock, Slot<K, V>>);

impl<K, V> ReadGuard<K, V> {
    pub fn key(&self) -> &K {
        &self.0.key
    }
}

impl<K, V> Deref for ReadGuard<K, V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.0.data
    }
}

/// Exclusive access to an entry's data. The key stays read-only.
pub struct WriteGuard<K, V>(ArcRwLockWriteGuard<RawRwLock, Slot<K, V>>);

impl<K, V> WriteGuard<K, V> {
    pub fn key(&self) -> &K {
        &self.0.key
    }
}

impl<K, V> Deref for WriteGuard<K, V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.0.data
    }
}

impl<K, V> DerefMut for WriteGuard<K, V> {
    fn deref_mut(&mut self) -> &mut V {
        &mut self.0.data
    }
}

impl<K, V> LruHash<K, V>
where
    K: Hash + Eq + Clone + Default,
    V: Default,
{
    /// `capacity` is in cost units (bytes). With a `parent` the slab's
    /// record pool overflows into it.
    pub fn new(capacity: usize, parent: Option<SharedPool<Cell<K, V>>>) -> Self {
        let pool = match parent {
            Some(parent) => parent.child(),
            None => Pool::new(),
        };
        Self {
            table: Mutex::new(Table {
                lru: LruCache::unbounded_with_hasher(FxBuildHasher),
                used: 0,
                capacity,
            }),
            pool: Mutex::new(pool),
        }
    }

    /// Read-lock the entry for `key`. Does not touch the LRU order.
    pub fn lookup(&self, key: &K) -> Option<ReadGuard<K, V>> {
        loop {
            let cell = {
                let table = self.table.lock();
                let node = table.lru.peek(key)?;
                if let Some(guard) = node.cell.try_read_arc() {
                    return Some(ReadGuard(guard));
                }
                Arc::clone(&node.cell)
            };
            let guard = cell.read_arc();
            if guard.linked {
                return Some(ReadGuard(guard));
            }
        }
    }

    /// Write-lock the entry for `key`. Does not touch the LRU order.
    pub fn lookup_mut(&self, key: &K) -> Option<WriteGuard<K, V>> {
        loop {
            let cell = {
                let table = self.table.lock();
                let node = table.lru.peek(key)?;
                if let Some(guard) = node.cell.try_write_arc() {
                    return Some(WriteGuard(guard));
                }
                Arc::clone(&node.cell)
            };
            let guard = cell.write_arc();
            if guard.linked {
                return Some(WriteGuard(guard));
            }
        }
    }

    /// Insert `data`, replacing the data of an existing entry.
    pub fn insert(&self, key: K, data: V, cost: usize) {
        self.upsert(key, cost, |slot, _| *slot = data)
    }

    /// Mutate the entry for `key` in place, creating it with `init` first
    /// when absent. Either way the entry becomes most recently used.
    pub fn update_or_insert<R>(
        &self,
        key: K,
        cost: usize,
        init: impl FnOnce() -> V,
        update: impl FnOnce(&mut V) -> R,
    ) -> R {
        self.upsert(key, cost, |slot, fresh| {
            if fresh {
                *slot = init();
            }
            update(slot)
        })
    }

    pub fn remove(&self, key: &K) -> bool {
        let node = {
            let mut guard = self.table.lock();
            let table = &mut *guard;
            let node = table.lru.pop(key);
            if let Some(node) = &node {
                table.used -= node.cost;
            }
            node
        };
        match node {
            Some(node) => {
                self.reclaim(vec![node.cell]);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut victims = Vec::new();
        {
            let mut table = self.table.lock();
            while let Some((_, node)) = table.lru.pop_lru() {
                victims.push(node.cell);
            }
            table.used = 0;
        }
        self.reclaim(victims);
    }

    /// Change the cost limit, evicting right away if the table shrank.
    pub fn set_capacity(&self, capacity: usize) {
        let mut victims = Vec::new();
        {
            let mut table = self.table.lock();
            table.capacity = capacity;
            table.evict_overflow(&mut victims);
        }
        self.reclaim(victims);
    }

    /// Visit every entry, most recently used first. Each entry is
    /// read-locked while `visit` looks at it, so `visit` must not update
    /// this table: writing the visited key would wait on itself.
    pub fn traverse(&self, mut visit: impl FnMut(&K, &V)) {
        let cells: Vec<_> = {
            let table = self.table.lock();
            table.lru.iter().map(|(_, node)| Arc::clone(&node.cell)).collect()
        };
        for cell in cells {
            let slot = cell.read();
            if slot.linked {
                visit(&slot.key, &slot.data);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used(&self) -> usize {
        self.table.lock().used
    }

    pub fn capacity(&self) -> usize {
        self.table.lock().capacity
    }

    pub fn num_quarantined(&self) -> usize {
        self.pool.lock().num_quarantined()
    }

    pub fn stats(&self) -> SlabStats {
        let (entries, used, capacity) = {
            let table = self.table.lock();
            (table.lru.len(), table.used, table.capacity)
        };
        SlabStats {
            entries,
            used,
            capacity,
            quarantined: self.num_quarantined(),
        }
    }

    /// Find or create the entry, promote it, and run `apply` on its data
    /// with only the entry's write lock held. `apply` sees `fresh == true`
    /// when the entry was just created.
    fn upsert<R>(&self, key: K, cost: usize, apply: impl FnOnce(&mut V, bool) -> R) -> R {
        let mut victims = Vec::new();
        let (mut guard, fresh) = loop {
            let mut locked = self.table.lock();
            let table = &mut *locked;
            if let Some(node) = table.lru.get_mut(&key) {
                let old = std::mem::replace(&mut node.cost, cost);
                let cell = Arc::clone(&node.cell);
                table.used = table.used - old + cost;
                table.evict_overflow(&mut victims);
                if let Some(guard) = cell.try_write_arc() {
                    break (guard, false);
                }
                drop(locked);
                let guard = cell.write_arc();
                if guard.linked {
                    break (guard, false);
                }
                // evicted while we waited
                continue;
            }
            let cell = self.fill(key.clone(), V::default());
            // nobody else can see the new cell yet
            let guard = cell.write_arc();
            table.lru.push(key.clone(), Node { cell, cost });
            table.used += cost;
            table.evict_overflow(&mut victims);
            break (guard, true);
        };
        let out = apply(&mut guard.data, fresh);
        drop(guard);
        self.reclaim(victims);
        out
    }

    fn fill(&self, key: K, data: V) -> Record<Cell<K, V>> {
        let mut rec = self.pool.lock().obtain();
        match Arc::get_mut(&mut rec) {
            Some(cell) => {
                *cell.get_mut() = Slot {
                    key,
                    data,
                    linked: true,
                };
                rec
            }
            None => Arc::new(RwLock::new(Slot {
                key,
                data,
                linked: true,
            })),
        }
    }

    fn reclaim(&self, victims: Vec<Record<Cell<K, V>>>) {
        if victims.is_empty() {
            return;
        }
        trace!(target = "lruhash", count = victims.len(), "reclaiming entries");
        for cell in &victims {
            // Wait out every reader/writer that found the entry before it
            // was unlinked.
            cell.write().linked = false;
        }
        let mut pool = self.pool.lock();
        for cell in victims {
            pool.release(cell);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn table(capacity: usize) -> LruHash<u32, String> {
        LruHash::new(capacity, None)
    }

    #[test]
    fn insert_then_lookup() {
        let t = table(10);
        assert!(t.lookup(&1).is_none());
        t.insert(1, "one".to_string(), 1);
        let g = t.lookup(&1).expect("present");
        assert_eq!(*g.key(), 1);
        assert_eq!(g.as_str(), "one");
        drop(g);

        t.insert(1, "uno".to_string(), 1);
        assert_eq!(t.lookup(&1).expect("present").as_str(), "uno");
        assert_eq!(t.len(), 1);
        assert_eq!(t.used(), 1);
    }

    #[test]
    fn evicts_least_recently_updated_first() {
        let t = table(3);
        t.insert(1, "a".into(), 1);
        t.insert(2, "b".into(), 1);
        t.insert(3, "c".into(), 1);
        // touching 1 moves it ahead of 2
        t.insert(1, "a2".into(), 1);
        t.insert(4, "d".into(), 1);
        assert!(t.lookup(&2).is_none());
        assert!(t.lookup(&1).is_some());

        // a plain lookup does not save 3
        assert!(t.lookup(&3).is_some());
        t.insert(5, "e".into(), 1);
        assert!(t.lookup(&3).is_none());
        assert_eq!(t.len(), 3);
        assert_eq!(t.used(), 3);
    }

    #[test]
    fn update_or_insert_mutates_in_place() {
        let t = table(10);
        let first = t.update_or_insert(7, 1, || "x".to_string(), |s| {
            s.push('1');
            s.len()
        });
        assert_eq!(first, 2);
        let second = t.update_or_insert(7, 1, || unreachable!(), |s| {
            s.push('2');
            s.len()
        });
        assert_eq!(second, 3);
        assert_eq!(t.lookup(&7).expect("present").as_str(), "x12");
    }

    #[test]
    fn lookup_mut_writes_data() {
        let t = table(10);
        t.insert(1, "a".into(), 1);
        {
            let mut g = t.lookup_mut(&1).expect("present");
            g.push('b');
        }
        assert_eq!(t.lookup(&1).expect("present").as_str(), "ab");
    }

    #[test]
    fn cost_change_is_accounted() {
        let t = table(100);
        t.insert(1, "a".into(), 40);
        t.insert(1, "a".into(), 10);
        assert_eq!(t.used(), 10);
        t.insert(2, "b".into(), 95);
        assert!(t.lookup(&1).is_none());
        assert_eq!(t.used(), 95);
    }

    #[test]
    fn newest_entry_survives_oversize_insert() {
        let t = table(5);
        t.insert(1, "a".into(), 1);
        t.insert(2, "b".into(), 50);
        assert!(t.lookup(&2).is_some());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn remove_and_clear_feed_the_pool() {
        let t = table(10);
        t.insert(1, "a".into(), 1);
        t.insert(2, "b".into(), 1);
        t.insert(3, "c".into(), 1);
        let before = t.num_quarantined();
        assert!(t.remove(&1));
        assert!(!t.remove(&1));
        assert_eq!(t.num_quarantined(), before + 1);
        t.clear();
        assert!(t.is_empty());
        assert_eq!(t.used(), 0);
        assert_eq!(t.num_quarantined(), before + 3);
    }

    #[test]
    fn set_capacity_shrinks() {
        let t = table(10);
        for k in 0..10 {
            t.insert(k, k.to_string(), 1);
        }
        t.set_capacity(4);
        assert_eq!(t.len(), 4);
        for k in 6..10 {
            assert!(t.lookup(&k).is_some());
        }
        assert_eq!(t.stats().capacity, 4);
    }

    #[test]
    fn traverse_visits_mru_first() {
        let t = table(10);
        t.insert(1, "a".into(), 1);
        t.insert(2, "b".into(), 1);
        let mut seen = Vec::new();
        t.traverse(|k, v| seen.push((*k, v.clone())));
        assert_eq!(seen, vec![(2, "b".to_string()), (1, "a".to_string())]);
    }

    #[test]
    fn eviction_waits_for_reader() {
        let t = Arc::new(table(1));
        t.insert(1, "held".into(), 1);
        let guard = t.lookup(&1).expect("present");

        let writer = {
            let t = Arc::clone(&t);
            thread::spawn(move || t.insert(2, "new".into(), 1))
        };
        thread::sleep(Duration::from_millis(100));
        assert!(!writer.is_finished());
        // unlinked already, but our view is intact
        assert!(t.lookup(&1).is_none());
        assert_eq!(guard.as_str(), "held");
        drop(guard);

        writer.join().expect("writer thread");
        assert_eq!(t.lookup(&2).expect("present").as_str(), "new");
    }

    #[test]
    fn blocked_update_leaves_slab_usable() {
        let t = Arc::new(table(10));
        t.insert(1, "a".into(), 1);
        t.insert(2, "b".into(), 1);
        let reader = t.lookup(&1).expect("present");

        let writer = {
            let t = Arc::clone(&t);
            thread::spawn(move || t.update_or_insert(1, 1, String::new, |s| s.push('!')))
        };
        thread::sleep(Duration::from_millis(100));
        assert!(!writer.is_finished());
        // other keys of the same slab stay reachable meanwhile
        assert_eq!(t.lookup(&2).expect("present").as_str(), "b");
        t.insert(3, "c".into(), 1);
        assert_eq!(t.len(), 3);
        drop(reader);

        writer.join().expect("writer thread");
        assert_eq!(t.lookup(&1).expect("present").as_str(), "a!");
    }

    #[test]
    fn update_racing_eviction_leaves_consistent_table() {
        let t = Arc::new(table(1));
        t.insert(1, "old".into(), 1);
        let reader = t.lookup(&1).expect("present");

        let writer = {
            let t = Arc::clone(&t);
            thread::spawn(move || t.update_or_insert(1, 1, || "new".to_string(), |s| s.push('+')))
        };
        thread::sleep(Duration::from_millis(50));
        // evicts 1 while the writer waits on its lock
        let evictor = {
            let t = Arc::clone(&t);
            thread::spawn(move || t.insert(2, "b".into(), 1))
        };
        thread::sleep(Duration::from_millis(50));
        drop(reader);
        evictor.join().expect("evictor thread");
        writer.join().expect("writer thread");

        // whichever thread won, the evicted record's data is gone
        let mut seen = Vec::new();
        t.traverse(|k, v| seen.push((*k, v.clone())));
        assert!(seen.iter().all(|(_, v)| v != "old+"));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn concurrent_mixed_traffic_stays_bounded() {
        let t = Arc::new(table(64));
        thread::scope(|s| {
            for worker in 0..8u32 {
                let t = Arc::clone(&t);
                s.spawn(move || {
                    for i in 0..2_000u32 {
                        let key = (i * 7 + worker) % 200;
                        match i % 4 {
                            0 => t.insert(key, key.to_string(), 1),
                            1 => {
                                if let Some(g) = t.lookup(&key) {
                                    assert_eq!(*g, key.to_string());
                                }
                            }
                            2 => t.update_or_insert(key, 1, || key.to_string(), |_| ()),
                            _ => {
                                t.remove(&key);
                            }
                        }
                    }
                });
            }
        });
        assert!(t.used() <= 64);
        assert_eq!(t.used(), t.len());
    }
}
