//! Per-entity lock table
//!
//! One mutex per `(collection, id)`. Operations on the same entity observe a
//! total order; operations on different entities never contend. An entry
//! lives only while a handle to it exists, so the table stays as small as
//! the set of entities in flight.

use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::Collection;
use crate::error::{LedgerError, Result};

/// Identity of a lockable entity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey {
    pub collection: Collection,
    pub id: String,
}

impl EntityKey {
    pub fn new(collection: Collection, id: &str) -> Self {
        Self {
            collection,
            id: id.to_string(),
        }
    }
}

/// Table of per-entity mutexes, holding an entry only while some caller
/// has a handle to it
#[derive(Default)]
pub struct KeyLocks {
    locks: DashMap<EntityKey, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle on one entity's mutex. The shard guard is released before
    /// returning, so callers never hold the map while waiting on an entity.
    pub fn handle(&self, key: EntityKey) -> LockHandle<'_> {
        let mutex = match self.locks.get(&key) {
            Some(existing) => Arc::clone(existing.value()),
            None => Arc::clone(
                self.locks
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .value(),
            ),
        };
        LockHandle {
            table: self,
            key,
            mutex,
        }
    }

    /// Number of entities currently held or awaited
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// A caller's claim on one table entry. Dropping the last handle for a key
/// removes its entry.
///
/// Guards borrow the handle, so they are always released first.
pub struct LockHandle<'a> {
    table: &'a KeyLocks,
    key: EntityKey,
    mutex: Arc<Mutex<()>>,
}

impl LockHandle<'_> {
    pub fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        acquire(&self.mutex)
    }
}

impl Drop for LockHandle<'_> {
    fn drop(&mut self) {
        // Clones are only made under the shard lock `remove_if` holds, so a
        // count of two (map and this handle) cannot change underneath it.
        self.table
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 2);
    }
}

fn acquire(mutex: &Mutex<()>) -> Result<MutexGuard<'_, ()>> {
    mutex
        .lock()
        .map_err(|e| LedgerError::Internal(format!("Lock poisoned: {}", e)))
}

/// Sort two keys into the global acquisition order.
pub fn ordered<'a>(a: &'a EntityKey, b: &'a EntityKey) -> (&'a EntityKey, &'a EntityKey) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_shares_mutex() {
        let locks = KeyLocks::new();
        let key = EntityKey::new(Collection::Users, "1");
        let a = locks.handle(key.clone());
        let b = locks.handle(key);
        assert!(Arc::ptr_eq(&a.mutex, &b.mutex));
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_distinct_keys_do_not_contend() {
        let locks = KeyLocks::new();
        let a = locks.handle(EntityKey::new(Collection::Users, "1"));
        let b = locks.handle(EntityKey::new(Collection::Users, "2"));
        let _ga = a.lock().unwrap();
        assert!(b.mutex.try_lock().is_ok());
    }

    #[test]
    fn test_same_id_in_different_collections_is_distinct() {
        let locks = KeyLocks::new();
        let a = locks.handle(EntityKey::new(Collection::Users, "9"));
        let b = locks.handle(EntityKey::new(Collection::Communities, "9"));
        assert!(!Arc::ptr_eq(&a.mutex, &b.mutex));
    }

    #[test]
    fn test_entry_removed_with_last_handle() {
        let locks = KeyLocks::new();
        let key = EntityKey::new(Collection::PremiumKeys, "GUESS");
        let a = locks.handle(key.clone());
        let b = locks.handle(key);
        drop(a);
        assert_eq!(locks.len(), 1);
        {
            let _guard = b.lock().unwrap();
        }
        drop(b);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_waiter_keeps_entry_alive() {
        let locks = KeyLocks::new();
        let key = EntityKey::new(Collection::Users, "hot");

        std::thread::scope(|scope| {
            let holder = locks.handle(key.clone());
            let guard = holder.lock().unwrap();
            let waiter = scope.spawn(|| {
                let handle = locks.handle(key.clone());
                let _guard = handle.lock().unwrap();
            });
            drop(guard);
            drop(holder);
            waiter.join().unwrap();
        });
        assert!(locks.is_empty());
    }

    #[test]
    fn test_ordering_is_symmetric() {
        let x = EntityKey::new(Collection::Users, "b");
        let y = EntityKey::new(Collection::Users, "a");
        assert_eq!(ordered(&x, &y), ordered(&y, &x));
        assert_eq!(ordered(&x, &y).0.id, "a");
    }
}
