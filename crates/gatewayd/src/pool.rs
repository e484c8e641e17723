//! Bounded key→resource pool backing upstream leases
//!
//! A single mutex serializes every operation. The lock is only ever held
//! across map operations, never across I/O on the stored resources; callers
//! that need to use a resource first take it out (`pop`/`pop_any`) or clone
//! a shared handle (`get`).

use gatewayd_common::error::{ErrorKind, GatewayError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

/// A bounded mapping from string keys to resources
pub struct Pool<T> {
    capacity: usize,
    items: Mutex<HashMap<String, T>>,
}

impl<T> Pool<T> {
    /// Create an empty pool with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a resource under `key`.
    ///
    /// Fails with `PoolExhausted` when the pool is full or the key is
    /// already taken; callers must `remove` first to rebind a key.
    pub fn put(&self, key: impl Into<String>, value: T) -> Result<()> {
        let key = key.into();
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(GatewayError::new(ErrorKind::PoolExhausted)
                .with_message(format!("pool is at capacity ({})", self.capacity)));
        }
        if items.contains_key(&key) {
            return Err(GatewayError::new(ErrorKind::PoolExhausted)
                .with_message(format!("key already present in pool: {key}")));
        }
        items.insert(key, value);
        Ok(())
    }

    /// Remove and return the resource bound to `key`
    pub fn pop(&self, key: &str) -> Option<T> {
        self.items.lock().remove(key)
    }

    /// Remove and return any (key, resource) pair
    pub fn pop_any(&self) -> Option<(String, T)> {
        let mut items = self.items.lock();
        let key = items.keys().next()?.clone();
        let value = items.remove(&key)?;
        Some((key, value))
    }

    /// Drop the resource bound to `key`, if any
    pub fn remove(&self, key: &str) {
        self.items.lock().remove(key);
    }

    /// Current number of entries
    pub fn size(&self) -> usize {
        self.items.lock().len()
    }

    /// Declared capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True when the pool holds no entries
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Visit every entry under the lock. `f` must not touch the pool.
    pub fn for_each(&self, mut f: impl FnMut(&str, &T)) {
        let items = self.items.lock();
        for (key, value) in items.iter() {
            f(key, value);
        }
    }

    /// Apply `finalizer` to every remaining entry and empty the pool
    pub fn clear(&self, mut finalizer: impl FnMut(String, T)) {
        let drained: Vec<(String, T)> = {
            let mut items = self.items.lock();
            items.drain().collect()
        };
        for (key, value) in drained {
            finalizer(key, value);
        }
    }
}

impl<T: Clone> Pool<T> {
    /// Clone the resource bound to `key` without removing it
    pub fn get(&self, key: &str) -> Option<T> {
        self.items.lock().get(key).cloned()
    }
}
