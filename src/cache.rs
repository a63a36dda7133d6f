//! The read-through entry cache.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::storage::VersionVector;

//------------ EntryCache ----------------------------------------------------

/// Caches loaded entries per name.
///
/// A cached entry is served as long as it is younger than the TTL *and*
/// the backend still reports the version vector observed at load time;
/// any newer version invalidates the copy. A TTL of zero disables the
/// cache entirely. The cache is unbounded in size but versioned: stale
/// copies are replaced on their next lookup.
///
/// At most one load per name runs at a time; concurrent lookups for the
/// same name wait for the in-flight load instead of duplicating it.
#[derive(Debug)]
pub struct EntryCache<T> {
    ttl: Duration,
    slots: Mutex<HashMap<String, CacheSlot<T>>>,
    loading: Mutex<HashSet<String>>,
    loaded: Condvar,
}

#[derive(Debug)]
struct CacheSlot<T> {
    value: Arc<T>,
    loaded_at: Instant,
    versions: VersionVector,
}

impl<T> EntryCache<T> {
    pub fn new(ttl: Duration) -> Self {
        EntryCache {
            ttl,
            slots: Mutex::new(HashMap::new()),
            loading: Mutex::new(HashSet::new()),
            loaded: Condvar::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Returns the cached value for `name`, loading it if necessary.
    ///
    /// `versions` reports the backend's current version vector for the
    /// name, `load` produces a fresh value. With caching disabled every
    /// lookup loads.
    pub fn lookup(
        &self,
        name: &str,
        versions: impl Fn() -> Result<VersionVector, Error>,
        load: impl Fn() -> Result<T, Error>,
    ) -> Result<Arc<T>, Error> {
        if !self.is_enabled() {
            return load().map(Arc::new);
        }

        if let Some(value) = self.current(name, &versions)? {
            trace!("cache hit for entry '{}'", name);
            return Ok(value);
        }

        let _guard = LoadGuard::acquire(self, name);

        // The load we waited for may have refreshed the slot already.
        if let Some(value) = self.current(name, &versions)? {
            trace!("coalesced load for entry '{}'", name);
            return Ok(value);
        }

        debug!("loading entry '{}' into cache", name);
        let versions = versions()?;
        let value = Arc::new(load()?);
        self.lock_slots().insert(
            name.to_string(),
            CacheSlot {
                value: value.clone(),
                loaded_at: Instant::now(),
                versions,
            },
        );
        Ok(value)
    }

    /// Drops any cached copy of `name`. Used after mutations.
    pub fn forget(&self, name: &str) {
        if self.is_enabled() {
            self.lock_slots().remove(name);
        }
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheSlot<T>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current(
        &self,
        name: &str,
        versions: &impl Fn() -> Result<VersionVector, Error>,
    ) -> Result<Option<Arc<T>>, Error> {
        let fresh = {
            let slots = self.lock_slots();
            match slots.get(name) {
                Some(slot) if slot.loaded_at.elapsed() < self.ttl => Some(slot.versions.clone()),
                _ => None,
            }
        };
        // The backend check happens outside the slot lock; a slightly
        // stale answer is re-validated on the next lookup.
        match fresh {
            Some(observed) if observed == versions()? => {
                let slots = self.lock_slots();
                Ok(slots.get(name).map(|slot| slot.value.clone()))
            }
            _ => Ok(None),
        }
    }
}

//------------ LoadGuard -----------------------------------------------------

/// Marks a name as being loaded; concurrent acquirers block until the
/// current load finishes.
struct LoadGuard<'a, T> {
    cache: &'a EntryCache<T>,
    name: String,
}

impl<'a, T> LoadGuard<'a, T> {
    fn acquire(cache: &'a EntryCache<T>, name: &str) -> Self {
        let mut loading = cache
            .loading
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while loading.contains(name) {
            loading = cache
                .loaded
                .wait(loading)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        loading.insert(name.to_string());
        LoadGuard {
            cache,
            name: name.to_string(),
        }
    }
}

impl<T> Drop for LoadGuard<'_, T> {
    fn drop(&mut self) {
        self.cache
            .loading
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.name);
        self.cache.loaded.notify_all();
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::storage::ArtifactKind;

    use super::*;

    fn versions_of(version: u64) -> VersionVector {
        let mut vv = VersionVector::new();
        vv.insert(ArtifactKind::Certificate, version);
        vv
    }

    #[test]
    fn disabled_cache_always_loads() {
        let cache: EntryCache<u64> = EntryCache::new(Duration::ZERO);
        let loads = AtomicU64::new(0);

        for _ in 0..3 {
            cache
                .lookup(
                    "entry",
                    || Ok(versions_of(1)),
                    || Ok(loads.fetch_add(1, Ordering::SeqCst)),
                )
                .unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn fresh_unchanged_entry_is_served_from_cache() {
        let cache: EntryCache<u64> = EntryCache::new(Duration::from_secs(60));
        let loads = AtomicU64::new(0);

        for _ in 0..3 {
            let value = cache
                .lookup(
                    "entry",
                    || Ok(versions_of(1)),
                    || Ok(loads.fetch_add(1, Ordering::SeqCst)),
                )
                .unwrap();
            assert_eq!(*value, 0);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn version_change_invalidates() {
        let cache: EntryCache<u64> = EntryCache::new(Duration::from_secs(60));
        let loads = AtomicU64::new(0);
        let backend_version = AtomicU64::new(1);

        let lookup = |cache: &EntryCache<u64>| {
            *cache
                .lookup(
                    "entry",
                    || Ok(versions_of(backend_version.load(Ordering::SeqCst))),
                    || Ok(loads.fetch_add(1, Ordering::SeqCst)),
                )
                .unwrap()
        };

        assert_eq!(lookup(&cache), 0);
        assert_eq!(lookup(&cache), 0);

        backend_version.store(2, Ordering::SeqCst);
        assert_eq!(lookup(&cache), 1);
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn forget_drops_the_cached_copy() {
        let cache: EntryCache<u64> = EntryCache::new(Duration::from_secs(60));
        let loads = AtomicU64::new(0);

        let lookup = |cache: &EntryCache<u64>| {
            *cache
                .lookup(
                    "entry",
                    || Ok(versions_of(1)),
                    || Ok(loads.fetch_add(1, Ordering::SeqCst)),
                )
                .unwrap()
        };

        assert_eq!(lookup(&cache), 0);
        cache.forget("entry");
        assert_eq!(lookup(&cache), 1);
    }

    #[test]
    fn expired_entry_is_reloaded() {
        let cache: EntryCache<u64> = EntryCache::new(Duration::from_millis(10));
        let loads = AtomicU64::new(0);

        let lookup = |cache: &EntryCache<u64>| {
            *cache
                .lookup(
                    "entry",
                    || Ok(versions_of(1)),
                    || Ok(loads.fetch_add(1, Ordering::SeqCst)),
                )
                .unwrap()
        };

        assert_eq!(lookup(&cache), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(lookup(&cache), 1);
    }

    #[test]
    fn concurrent_lookups_coalesce() {
        let cache: Arc<EntryCache<u64>> = Arc::new(EntryCache::new(Duration::from_secs(60)));
        let loads = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let loads = loads.clone();
                std::thread::spawn(move || {
                    *cache
                        .lookup(
                            "entry",
                            || Ok(versions_of(1)),
                            || {
                                loads.fetch_add(1, Ordering::SeqCst);
                                std::thread::sleep(Duration::from_millis(10));
                                Ok(7)
                            },
                        )
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 7);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
