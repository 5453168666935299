//! Slab table: N independent [`LruHash`] instances picked by key hash.

use std::hash::{BuildHasher, Hash};

use rustc_hash::FxBuildHasher;

use crate::alloc::SharedPool;
use crate::lruhash::{Cell, LruHash, ReadGuard, SlabStats, WriteGuard};

pub struct SlabHash<K, V> {
    slabs: Vec<LruHash<K, V>>,
    pool: SharedPool<Cell<K, V>>,
    hasher: FxBuildHasher,
}

impl<K, V> SlabHash<K, V>
where
    K: Hash + Eq + Clone + Default,
    V: Default,
{
    /// `capacity` is split evenly; the remainder goes to the first slab.
    pub fn new(num_slabs: usize, capacity: usize) -> Self {
        Self::with_pool(num_slabs, capacity, SharedPool::new())
    }

    /// Like [`SlabHash::new`] but every slab overflows into `pool`.
    pub fn with_pool(num_slabs: usize, capacity: usize, pool: SharedPool<Cell<K, V>>) -> Self {
        let num_slabs = num_slabs.max(1);
        let slabs = split_capacity(capacity, num_slabs)
            .map(|cap| LruHash::new(cap, Some(pool.clone())))
            .collect();
        Self {
            slabs,
            pool,
            hasher: FxBuildHasher,
        }
    }

    pub fn slab_for(&self, key: &K) -> usize {
        (self.hasher.hash_one(key) % self.slabs.len() as u64) as usize
    }

    fn slab(&self, key: &K) -> &LruHash<K, V> {
        &self.slabs[self.slab_for(key)]
    }

    pub fn lookup(&self, key: &K) -> Option<ReadGuard<K, V>> {
        self.slab(key).lookup(key)
    }

    pub fn lookup_mut(&self, key: &K) -> Option<WriteGuard<K, V>> {
        self.slab(key).lookup_mut(key)
    }

    pub fn insert(&self, key: K, data: V, cost: usize) {
        self.slab(&key).insert(key, data, cost)
    }

    pub fn update_or_insert<R>(
        &self,
        key: K,
        cost: usize,
        init: impl FnOnce() -> V,
        update: impl FnOnce(&mut V) -> R,
    ) -> R {
        self.slab(&key).update_or_insert(key, cost, init, update)
    }

    pub fn remove(&self, key: &K) -> bool {
        self.slab(key).remove(key)
    }

    pub fn clear(&self) {
        for slab in &self.slabs {
            slab.clear();
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        for (slab, cap) in self.slabs.iter().zip(split_capacity(capacity, self.slabs.len())) {
            slab.set_capacity(cap);
        }
    }

    pub fn traverse(&self, mut visit: impl FnMut(&K, &V)) {
        for slab in &self.slabs {
            slab.traverse(&mut visit);
        }
    }

    pub fn num_slabs(&self) -> usize {
        self.slabs.len()
    }

    pub fn len(&self) -> usize {
        self.slabs.iter().map(LruHash::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slabs.iter().all(LruHash::is_empty)
    }

    pub fn capacity(&self) -> usize {
        self.slabs.iter().map(LruHash::capacity).sum()
    }

    pub fn used(&self) -> usize {
        self.slabs.iter().map(LruHash::used).sum()
    }

    pub fn slab_stats(&self) -> Vec<SlabStats> {
        self.slabs.iter().map(LruHash::stats).collect()
    }

    /// Records parked in the shared major pool.
    pub fn pool_quarantined(&self) -> usize {
        self.pool.num_quarantined()
    }
}

fn split_capacity(total: usize, n: usize) -> impl Iterator<Item = usize> {
    let per = total / n;
    let rest = total % n;
    (0..n).map(move |i| if i == 0 { per + rest } else { per })
}
