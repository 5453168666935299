//! Two-level record recycling.
//!
//! A [`SharedPool`] is the major pool: one per cache, shared by every slab and
//! serialized by a mutex. Each slab owns a minor [`Pool`] that keeps a small
//! quarantine of released records and only touches the major pool on
//! overflow, on an empty quarantine, or on `clear`.
//!
//! 记录以 `Arc<T>` 形式流转：只有独占（strong count == 1）的记录才能回收。

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace};

/// Quarantine capacity of a minor pool.
pub const QUARANTINE_MAX: usize = 10;

/// A pooled record. Uniquely owned while obtained.
pub type Record<T> = Arc<T>;

pub struct Pool<T> {
    parent: Option<SharedPool<T>>,
    quarantine: Vec<Record<T>>,
    max_quarantine: usize,
    fresh_allocs: u64,
}

impl<T: Default> Pool<T> {
    /// Top-level pool: unbounded quarantine, frees on clear.
    pub fn new() -> Self {
        Self {
            parent: None,
            quarantine: Vec::new(),
            max_quarantine: usize::MAX,
            fresh_allocs: 0,
        }
    }

    /// Minor pool that overflows into `parent`.
    pub fn with_parent(parent: SharedPool<T>) -> Self {
        Self {
            parent: Some(parent),
            quarantine: Vec::with_capacity(QUARANTINE_MAX),
            max_quarantine: QUARANTINE_MAX,
            fresh_allocs: 0,
        }
    }

    pub fn obtain(&mut self) -> Record<T> {
        if let Some(rec) = self.quarantine.pop() {
            return rec;
        }
        if let Some(parent) = &self.parent {
            if let Some(rec) = parent.take() {
                return rec;
            }
            // Nothing anywhere: fill our own quarantine in one go so the
            // next obtains stay off the parent lock.
            self.prealloc();
        }
        self.fresh_allocs += 1;
        Arc::new(T::default())
    }

    /// Return a record. Records still shared elsewhere are dropped.
    pub fn release(&mut self, mut rec: Record<T>) {
        match Arc::get_mut(&mut rec) {
            Some(inner) => *inner = T::default(),
            None => {
                trace!(target = "alloc", refs = Arc::strong_count(&rec), "record still shared, not recycled");
                return;
            }
        }
        if self.quarantine.len() >= self.max_quarantine {
            if let Some(parent) = &self.parent {
                let keep = self.quarantine.len() - self.max_quarantine / 2;
                let mut batch = self.quarantine.split_off(keep);
                batch.push(rec);
                parent.put_all(batch);
                return;
            }
        }
        self.quarantine.push(rec);
    }

    /// Hand the whole quarantine to the parent, or free it at the top level.
    pub fn clear(&mut self) {
        let drained = std::mem::take(&mut self.quarantine);
        match &self.parent {
            Some(parent) if !drained.is_empty() => parent.put_all(drained),
            _ => drop(drained),
        }
    }

    pub fn num_quarantined(&self) -> usize {
        self.quarantine.len()
    }

    pub fn fresh_allocs(&self) -> u64 {
        self.fresh_allocs
    }

    fn prealloc(&mut self) {
        if let Err(err) = self.quarantine.try_reserve(self.max_quarantine) {
            error!(target = "alloc", error = %err, "prealloc: out of memory");
            return;
        }
        for _ in 0..self.max_quarantine {
            self.quarantine.push(Arc::new(T::default()));
        }
        self.fresh_allocs += self.max_quarantine as u64;
    }
}

impl<T: Default> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        if let Some(parent) = &self.parent {
            if !self.quarantine.is_empty() {
                let mut major = parent.0.lock();
                major.quarantine.append(&mut self.quarantine);
            }
        }
    }
}

/// Handle to a major pool. Cloning shares the same pool.
pub struct SharedPool<T>(Arc<Mutex<Pool<T>>>);

impl<T> Clone for SharedPool<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Default> SharedPool<T> {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Pool::new())))
    }

    /// Create a minor pool drawing from this one.
    pub fn child(&self) -> Pool<T> {
        Pool::with_parent(self.clone())
    }

    pub fn obtain(&self) -> Record<T> {
        self.0.lock().obtain()
    }

    pub fn release(&self, rec: Record<T>) {
        self.0.lock().release(rec)
    }

    pub fn clear(&self) {
        self.0.lock().clear()
    }

    pub fn num_quarantined(&self) -> usize {
        self.0.lock().num_quarantined()
    }

    fn take(&self) -> Option<Record<T>> {
        self.0.lock().quarantine.pop()
    }

    fn put_all(&self, mut batch: Vec<Record<T>>) {
        self.0.lock().quarantine.append(&mut batch);
    }
}

impl<T: Default> Default for SharedPool<T> {
    fn default() -> Self {
        Self::new()
    }
}
