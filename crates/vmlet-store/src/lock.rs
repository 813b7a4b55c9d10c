//! Per-key mutual exclusion.
//!
//! Operations on the same object ID are strictly serialised; different
//! IDs proceed in parallel. Keys are tracked in a shared set guarded by a
//! condvar, so there is one tiny table instead of one mutex per ID.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

use crate::error::{Result, StoreError};

#[derive(Default)]
pub(crate) struct KeyLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Releases the key on drop.
pub(crate) struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
}

impl KeyLocks {
    /// Blocks until `key` is free, then holds it until the guard drops.
    pub(crate) fn lock(&self, key: &str) -> Result<KeyGuard<'_>> {
        let mut held = self.held.lock().map_err(|_| StoreError::LockPoisoned)?;
        while held.contains(key) {
            held = self
                .released
                .wait(held)
                .map_err(|_| StoreError::LockPoisoned)?;
        }
        held.insert(key.to_string());
        Ok(KeyGuard {
            locks: self,
            key: key.to_string(),
        })
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut held) = self.locks.held.lock() {
            held.remove(&self.key);
            self.locks.released.notify_all();
        }
    }
}
