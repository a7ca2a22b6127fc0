//! Keyed advisory read/write locks
//!
//! One `RwLock` per key (a project name), created on first use. Routine
//! writes take the read side so they proceed in parallel; operations that
//! must exclude them take the write side. Guards are owned, so they can be
//! held across `.await` points inside a request.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Registry of per-key read/write locks
#[derive(Default)]
pub struct KeyedLock {
    locks: DashMap<String, Arc<RwLock<()>>>,
}

impl KeyedLock {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the shared side of the lock for `key`
    pub async fn read(&self, key: &str) -> OwnedRwLockReadGuard<()> {
        self.lock_for(key).read_owned().await
    }

    /// Acquire the exclusive side of the lock for `key`
    pub async fn write(&self, key: &str) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(key).write_owned().await
    }

    /// Acquire the exclusive side when `exclusive` is set, else the shared side
    pub async fn lock(&self, key: &str, exclusive: bool) -> KeyedGuard {
        if exclusive {
            KeyedGuard::Exclusive(self.write(key).await)
        } else {
            KeyedGuard::Shared(self.read(key).await)
        }
    }

    /// Number of keys that have been locked at least once
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no key has been locked yet
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn lock_for(&self, key: &str) -> Arc<RwLock<()>> {
        self.locks.entry(key.to_string()).or_default().clone()
    }
}

/// Either side of a keyed lock, released on drop
pub enum KeyedGuard {
    /// Held alongside other shared guards
    Shared(OwnedRwLockReadGuard<()>),
    /// Held alone
    Exclusive(OwnedRwLockWriteGuard<()>),
}
