//! Keyed singleton registry with reference-counted leases.
//!
//! Every schema, pager, coordinator and cell attribute lives in one of these:
//! the first `acquire` for a key creates the instance, later ones share it,
//! and dropping the last [`Lease`] hands the entry to the registry's
//! [`EvictionPolicy`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::time::Instant;

use crate::eviction::{EvictionPolicy, IdleEntry};

/// Lock helper shared by the engine; a poisoned lock still holds valid state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Slot<V> {
    value: Arc<V>,
    refs: usize,
    idle_since: Option<Instant>,
    acquisitions: u64,
    // bumped on every release so a stale eviction timer can tell it lost the race
    epoch: u64,
}

struct RegistryInner<K, V> {
    kind: &'static str,
    policy: EvictionPolicy,
    slots: Mutex<HashMap<K, Slot<V>>>,
}

pub struct KeyedRegistry<K, V> {
    inner: Arc<RegistryInner<K, V>>,
}

impl<K, V> Clone for KeyedRegistry<K, V> {
    fn clone(&self) -> Self {
        KeyedRegistry {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Non-owning handle used by components that must look entries up without
/// keeping the registry alive.
pub struct WeakRegistry<K, V> {
    inner: Weak<RegistryInner<K, V>>,
}

impl<K, V> Clone for WeakRegistry<K, V> {
    fn clone(&self) -> Self {
        WeakRegistry {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<K, V> KeyedRegistry<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(kind: &'static str, policy: EvictionPolicy) -> Self {
        KeyedRegistry {
            inner: Arc::new(RegistryInner {
                kind,
                policy,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.inner.kind
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.inner.policy
    }

    /// Returns a lease on the instance for `key`, creating it on first access.
    ///
    /// `create` runs under the registry lock and must not acquire from this
    /// same registry.
    pub fn acquire_with(&self, key: K, create: impl FnOnce(&K) -> V) -> Lease<K, V> {
        let mut slots = lock(&self.inner.slots);
        let value = match slots.get_mut(&key) {
            Some(slot) => {
                slot.refs += 1;
                slot.acquisitions += 1;
                slot.idle_since = None;
                Arc::clone(&slot.value)
            }
            None => {
                log::debug!("{}: creating {:?}", self.inner.kind, key);
                let value = Arc::new(create(&key));
                slots.insert(
                    key.clone(),
                    Slot {
                        value: Arc::clone(&value),
                        refs: 1,
                        idle_since: None,
                        acquisitions: 1,
                        epoch: 0,
                    },
                );
                value
            }
        };
        drop(slots);

        Lease {
            registry: Arc::clone(&self.inner),
            key,
            value,
        }
    }

    /// Looks up a live entry without acquiring it.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.inner.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        lock(&self.inner.slots).contains_key(key)
    }

    /// Number of outstanding leases for `key` (0 when idle or absent).
    pub fn ref_count(&self, key: &K) -> usize {
        self.inner.ref_count(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn downgrade(&self) -> WeakRegistry<K, V> {
        WeakRegistry {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Re-evaluates the policy for every idle entry and returns how many were evicted.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }
}

impl<K, V> WeakRegistry<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.inner.upgrade()?.get(key)
    }

    /// Takes a lease on an entry that is still registered; never creates one.
    pub fn acquire_existing(&self, key: &K) -> Option<Lease<K, V>> {
        let registry = self.inner.upgrade()?;
        let value = {
            let mut slots = lock(&registry.slots);
            let slot = slots.get_mut(key)?;
            slot.refs += 1;
            slot.acquisitions += 1;
            slot.idle_since = None;
            Arc::clone(&slot.value)
        };
        Some(Lease {
            registry,
            key: key.clone(),
            value,
        })
    }
}

impl<K, V> RegistryInner<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<Arc<V>> {
        lock(&self.slots).get(key).map(|slot| Arc::clone(&slot.value))
    }

    fn ref_count(&self, key: &K) -> usize {
        lock(&self.slots).get(key).map_or(0, |slot| slot.refs)
    }

    fn retain(&self, key: &K) {
        if let Some(slot) = lock(&self.slots).get_mut(key) {
            slot.refs += 1;
            slot.idle_since = None;
        }
    }

    fn release(self: &Arc<Self>, key: &K) {
        let mut slots = lock(&self.slots);
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs > 0 {
            return;
        }

        slot.idle_since = Some(Instant::now());
        slot.epoch += 1;
        let epoch = slot.epoch;
        let idle = IdleEntry {
            idle_for: std::time::Duration::ZERO,
            acquisitions: slot.acquisitions,
        };

        if self.policy.should_evict(&idle) {
            let evicted = slots.remove(key);
            drop(slots);
            log::debug!("{}: evicted {:?}", self.kind, key);
            drop(evicted);
            return;
        }
        drop(slots);

        if let Some(grace) = self.policy.grace_period() {
            self.schedule_eviction(key.clone(), epoch, grace);
        }
    }

    fn schedule_eviction(self: &Arc<Self>, key: K, epoch: u64, grace: std::time::Duration) {
        // without a runtime the entry waits for the next sweep
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(self);
        handle.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                inner.evict_if_still_idle(&key, epoch);
            }
        });
    }

    fn evict_if_still_idle(&self, key: &K, epoch: u64) {
        let mut slots = lock(&self.slots);
        let idle = match slots.get(key) {
            Some(slot) if slot.refs == 0 && slot.epoch == epoch => slot,
            _ => return,
        };
        let entry = IdleEntry {
            idle_for: idle.idle_since.map_or(std::time::Duration::ZERO, |since| since.elapsed()),
            acquisitions: idle.acquisitions,
        };
        if self.policy.should_evict(&entry) {
            let evicted = slots.remove(key);
            drop(slots);
            log::debug!("{}: evicted {:?} after grace period", self.kind, key);
            drop(evicted);
        }
    }

    fn sweep(&self) -> usize {
        let mut slots = lock(&self.slots);
        let now = Instant::now();
        let doomed: Vec<K> = slots
            .iter()
            .filter_map(|(key, slot)| {
                let since = slot.idle_since?;
                let idle = IdleEntry {
                    idle_for: now.saturating_duration_since(since),
                    acquisitions: slot.acquisitions,
                };
                self.policy.should_evict(&idle).then(|| key.clone())
            })
            .collect();

        let evicted: Vec<Slot<V>> = doomed.iter().filter_map(|key| slots.remove(key)).collect();
        drop(slots);
        if !evicted.is_empty() {
            log::debug!("{}: sweep evicted {} entries", self.kind, evicted.len());
        }
        evicted.len()
    }
}

/// Scoped hold on a registry entry; dropping it releases the reference on
/// every exit path.
pub struct Lease<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    registry: Arc<RegistryInner<K, V>>,
    key: K,
    value: Arc<V>,
}

impl<K, V> Lease<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Shared handle to the instance; does not keep the entry registered.
    pub fn handle(&self) -> Arc<V> {
        Arc::clone(&self.value)
    }

    /// Number of live leases on this entry, this one included.
    pub fn ref_count(&self) -> usize {
        self.registry.ref_count(&self.key)
    }
}

impl<K, V> Deref for Lease<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

impl<K, V> Clone for Lease<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        self.registry.retain(&self.key);
        Lease {
            registry: Arc::clone(&self.registry),
            key: self.key.clone(),
            value: Arc::clone(&self.value),
        }
    }
}

impl<K, V> Drop for Lease<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

impl<K, V> Debug for Lease<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("kind", &self.registry.kind)
            .field("key", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn registry(policy: EvictionPolicy) -> KeyedRegistry<String, usize> {
        KeyedRegistry::new("test", policy)
    }

    #[test]
    fn same_key_shares_one_instance() {
        let created = AtomicUsize::new(0);
        let reg = registry(EvictionPolicy::Immediate);
        let make = |_: &String| created.fetch_add(1, Ordering::SeqCst);

        let a = reg.acquire_with("k".to_string(), make);
        let b = reg.acquire_with("k".to_string(), make);
        assert!(Arc::ptr_eq(&a.handle(), &b.handle()));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(reg.ref_count(&"k".to_string()), 2);
    }

    #[test]
    fn immediate_policy_evicts_on_last_release() {
        let reg = registry(EvictionPolicy::Immediate);
        let a = reg.acquire_with("k".to_string(), |_| 1);
        let b = a.clone();
        drop(a);
        assert!(reg.contains(&"k".to_string()));
        drop(b);
        assert!(!reg.contains(&"k".to_string()));
        assert!(reg.is_empty());
    }

    #[test]
    fn never_policy_keeps_idle_entries() {
        let reg = registry(EvictionPolicy::Never);
        drop(reg.acquire_with("k".to_string(), |_| 7));
        assert_eq!(reg.get(&"k".to_string()).as_deref(), Some(&7));
        assert_eq!(reg.sweep(), 0);
    }

    #[test]
    fn reacquire_after_eviction_recreates() {
        let reg = registry(EvictionPolicy::Immediate);
        drop(reg.acquire_with("k".to_string(), |_| 1));
        let lease = reg.acquire_with("k".to_string(), |_| 2);
        assert_eq!(*lease, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn after_duration_evicts_once_grace_period_passes() {
        let reg = registry(EvictionPolicy::AfterDuration(Duration::from_millis(100)));
        drop(reg.acquire_with("k".to_string(), |_| 1));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(reg.contains(&"k".to_string()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!reg.contains(&"k".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn reacquired_entry_survives_pending_timer() {
        let reg = registry(EvictionPolicy::AfterDuration(Duration::from_millis(100)));
        drop(reg.acquire_with("k".to_string(), |_| 1));
        let held = reg.acquire_with("k".to_string(), |_| 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(reg.contains(&"k".to_string()));
        assert_eq!(*held, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_applies_custom_predicate() {
        let reg = registry(EvictionPolicy::custom(|idle| {
            idle.idle_for >= Duration::from_secs(1)
        }));
        drop(reg.acquire_with("a".to_string(), |_| 1));
        assert_eq!(reg.sweep(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(reg.sweep(), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn weak_registry_sees_live_entries_only() {
        let reg = registry(EvictionPolicy::Immediate);
        let weak = reg.downgrade();
        let lease = reg.acquire_with("k".to_string(), |_| 3);
        assert_eq!(weak.get(&"k".to_string()).as_deref(), Some(&3));
        drop(lease);
        assert!(weak.get(&"k".to_string()).is_none());
        drop(reg);
        assert!(weak.get(&"k".to_string()).is_none());
    }

    #[test]
    fn acquire_existing_holds_but_never_creates() {
        let reg = registry(EvictionPolicy::Immediate);
        let weak = reg.downgrade();
        assert!(weak.acquire_existing(&"k".to_string()).is_none());

        let lease = reg.acquire_with("k".to_string(), |_| 5);
        let pinned = weak.acquire_existing(&"k".to_string()).unwrap();
        assert_eq!(lease.ref_count(), 2);

        drop(lease);
        assert_eq!(pinned.ref_count(), 1);
        assert_eq!(*pinned, 5);
        drop(pinned);
        assert!(!reg.contains(&"k".to_string()));
    }
}
