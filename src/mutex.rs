//! Named mutex registry.
//!
//! VCD does not serialize writes to sub-objects of a shared parent (NAT rules
//! on one edge gateway, VMs in one vApp, behaviour ACLs on one RDE type), so
//! every lifecycle operation that mutates such a child holds the parent's
//! named mutex for the whole operation.
//!
//! Slots are created lazily and never removed. Locks are not reentrant:
//! acquiring a key that the same operation already holds deadlocks. Code
//! that needs the parent lock is split into a locking wrapper and a body
//! that assumes the lock is held.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::ProviderError;

/// Name of a mutex slot, e.g. a parent edge gateway URN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParentLockKey(String);

impl ParentLockKey {
    /// Create a key from any string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Composite key scoping a resource kind to a parent, e.g.
    /// `rde_type_behavior_acl.urn:vcloud:type:...`.
    pub fn scoped(kind: &str, parent: &str) -> Self {
        Self(format!("{}.{}", kind, parent))
    }

    /// The key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParentLockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type Slot = Arc<AsyncMutex<()>>;

/// Process-wide keyed mutexes, owned by the engine handle.
#[derive(Default)]
pub struct MutexRegistry {
    slots: Mutex<HashMap<ParentLockKey, Slot>>,
    held: Mutex<HashMap<ParentLockKey, OwnedMutexGuard<()>>>,
}

impl MutexRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &ParentLockKey) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    /// Wait for the mutex named `key` and hold it until the guard drops.
    pub async fn lock(&self, key: &ParentLockKey) -> KeyGuard {
        debug!(key = %key, "waiting for lock");
        let guard = self.slot(key).lock_owned().await;
        debug!(key = %key, "acquired lock");
        KeyGuard {
            key: key.clone(),
            _guard: guard,
        }
    }

    /// Acquire several keys in lexicographic order.
    ///
    /// Duplicate keys are acquired once. Sorting makes two operations that
    /// need `{a, b}` acquire in the same order regardless of how each
    /// declared them.
    pub async fn lock_all<I>(&self, keys: I) -> LockSet
    where
        I: IntoIterator<Item = ParentLockKey>,
    {
        let keys = lock_order(keys);
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.lock(key).await);
        }
        LockSet { guards }
    }

    /// Acquire `key` and keep it held inside the registry until [`release`].
    ///
    /// [`release`]: MutexRegistry::release
    pub async fn acquire(&self, key: &ParentLockKey) {
        let guard = self.slot(key).lock_owned().await;
        debug!(key = %key, "acquired lock");
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), guard);
    }

    /// Release a key previously taken with [`acquire`].
    ///
    /// [`acquire`]: MutexRegistry::acquire
    pub fn release(&self, key: &ParentLockKey) -> Result<(), ProviderError> {
        let guard = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        match guard {
            Some(guard) => {
                drop(guard);
                debug!(key = %key, "released lock");
                Ok(())
            },
            None => Err(ProviderError::Misuse(format!(
                "release of '{}' without a matching acquire",
                key
            ))),
        }
    }

    /// Whether `key` is currently held by anyone.
    pub fn is_locked(&self, key: &ParentLockKey) -> bool {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(key)
            .map(|slot| slot.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of keys currently held.
    pub fn held_count(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().filter(|slot| slot.try_lock().is_err()).count()
    }

    /// Number of slots ever created.
    pub fn slot_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Sort and deduplicate keys into acquisition order.
pub fn lock_order<I>(keys: I) -> Vec<ParentLockKey>
where
    I: IntoIterator<Item = ParentLockKey>,
{
    let mut keys: Vec<_> = keys.into_iter().collect();
    keys.sort();
    keys.dedup();
    keys
}

/// A held mutex; released on drop, including during unwinding.
#[derive(Debug)]
pub struct KeyGuard {
    key: ParentLockKey,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    /// The key this guard holds.
    pub fn key(&self) -> &ParentLockKey {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        debug!(key = %self.key, "released lock");
    }
}

/// Several held mutexes acquired in lock order.
pub struct LockSet {
    guards: Vec<KeyGuard>,
}

impl LockSet {
    /// An empty set, for resources without a parent.
    pub fn empty() -> Self {
        Self { guards: Vec::new() }
    }

    /// Keys in the order they were acquired.
    pub fn keys(&self) -> Vec<&ParentLockKey> {
        self.guards.iter().map(KeyGuard::key).collect()
    }

    /// Whether the set holds nothing.
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        // Release in reverse acquisition order.
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn key(s: &str) -> ParentLockKey {
        ParentLockKey::new(s)
    }

    #[tokio::test]
    async fn test_lock_and_release_on_drop() {
        let registry = MutexRegistry::new();
        {
            let _guard = registry.lock(&key("edge-1")).await;
            assert!(registry.is_locked(&key("edge-1")));
            assert!(!registry.is_locked(&key("edge-2")));
        }
        assert!(!registry.is_locked(&key("edge-1")));
        assert_eq!(registry.slot_count(), 1);
    }

    #[tokio::test]
    async fn test_release_without_acquire_is_misuse() {
        let registry = MutexRegistry::new();
        let err = registry.release(&key("never")).unwrap_err();
        assert!(matches!(err, ProviderError::Misuse(_)));

        registry.acquire(&key("k")).await;
        assert!(registry.is_locked(&key("k")));
        registry.release(&key("k")).unwrap();
        assert!(!registry.is_locked(&key("k")));
        assert!(registry.release(&key("k")).is_err());
    }

    #[test]
    fn test_lock_order_sorts_and_dedups() {
        let order = lock_order(vec![key("b"), key("a"), key("b")]);
        assert_eq!(order, vec![key("a"), key("b")]);
    }

    #[tokio::test]
    async fn test_lock_all_acquires_sorted() {
        let registry = MutexRegistry::new();
        let set = registry
            .lock_all(vec![key("urn:z"), key("urn:a"), key("urn:m")])
            .await;
        let keys: Vec<_> = set.keys().into_iter().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["urn:a", "urn:m", "urn:z"]);
        assert_eq!(registry.held_count(), 3);
        drop(set);
        assert_eq!(registry.held_count(), 0);
    }

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let registry = Arc::new(MutexRegistry::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = registry.lock(&key("edge")).await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_waiter_wakes_when_holder_drops() {
        use tokio_test::{assert_pending, assert_ready, task};

        let registry = MutexRegistry::new();
        let edge = key("edge");
        let mut first = task::spawn(registry.lock(&edge));
        let held = assert_ready!(first.poll());

        let mut second = task::spawn(registry.lock(&edge));
        assert_pending!(second.poll());

        drop(held);
        assert!(second.is_woken());
        let _guard = assert_ready!(second.poll());
        assert!(registry.is_locked(&edge));
    }

    #[tokio::test]
    async fn test_guard_released_on_panic() {
        let registry = Arc::new(MutexRegistry::new());
        let task_registry = Arc::clone(&registry);
        let result = tokio::spawn(async move {
            let _guard = task_registry.lock(&key("vapp")).await;
            panic!("boom");
        })
        .await;
        assert!(result.is_err());
        assert!(!registry.is_locked(&key("vapp")));
    }

    #[tokio::test]
    async fn test_cancelled_wait_does_not_leak() {
        let registry = MutexRegistry::new();
        let held = registry.lock(&key("b")).await;
        let attempt = tokio::time::timeout(
            Duration::from_millis(10),
            registry.lock_all(vec![key("a"), key("b")]),
        )
        .await;
        assert!(attempt.is_err());
        assert!(!registry.is_locked(&key("a")));
        drop(held);
        assert_eq!(registry.held_count(), 0);
    }
}
