use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::{Mutex, MutexGuard};

use crate::storage::{ArtifactKind, BackendError, StorageResult, Version, VersionVector};

//------------ MemoryBackend -------------------------------------------------

/// An in-memory backend, mostly useful for testing and ephemeral stores.
///
/// Every instance owns its own map; two `memory://` backends never share
/// state.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    version_limit: u64,
    entries: Mutex<HashMap<String, EntryBlobs>>,
}

type EntryBlobs = HashMap<ArtifactKind, BTreeMap<Version, Vec<u8>>>;

impl MemoryBackend {
    pub fn new(version_limit: u64) -> Self {
        MemoryBackend {
            version_limit: version_limit.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, HashMap<String, EntryBlobs>>> {
        self.entries
            .lock()
            .map_err(|e| BackendError::other(format!("cannot lock memory store: {}", e)))
    }

    pub fn acquire(&self, name_hint: &str) -> StorageResult<String> {
        let mut entries = self.lock()?;
        let mut candidate = name_hint.to_string();
        let mut suffix = 2;
        while entries.contains_key(&candidate) {
            candidate = format!("{}#{}", name_hint, suffix);
            suffix += 1;
        }
        entries.insert(candidate.clone(), HashMap::new());
        Ok(candidate)
    }

    pub fn discard(&self, name: &str) -> StorageResult<()> {
        self.lock()?.remove(name);
        Ok(())
    }

    pub fn write(&self, name: &str, kind: ArtifactKind, bytes: &[u8]) -> StorageResult<Version> {
        let mut entries = self.lock()?;
        let versions = entries
            .entry(name.to_string())
            .or_default()
            .entry(kind)
            .or_default();

        let version = versions.keys().next_back().copied().unwrap_or(0) + 1;
        versions.insert(version, bytes.to_vec());
        while versions.len() as u64 > self.version_limit {
            let Some(oldest) = versions.keys().next().copied() else {
                break;
            };
            versions.remove(&oldest);
        }

        Ok(version)
    }

    pub fn read(&self, name: &str, kind: ArtifactKind) -> StorageResult<Option<(Vec<u8>, Version)>> {
        Ok(self
            .lock()?
            .get(name)
            .and_then(|blobs| blobs.get(&kind))
            .and_then(|versions| versions.iter().next_back())
            .map(|(version, bytes)| (bytes.clone(), *version)))
    }

    pub fn names(&self) -> StorageResult<Vec<String>> {
        Ok(self
            .lock()?
            .iter()
            .filter(|(_, blobs)| blobs.values().any(|versions| !versions.is_empty()))
            .map(|(name, _)| name.clone())
            .collect())
    }

    pub fn version_vector(&self, name: &str) -> StorageResult<VersionVector> {
        Ok(self
            .lock()?
            .get(name)
            .map(|blobs| {
                blobs
                    .iter()
                    .filter_map(|(kind, versions)| {
                        versions.keys().next_back().map(|version| (*kind, *version))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn uri(&self) -> String {
        "memory://".to_string()
    }

    pub fn version_limit(&self) -> u64 {
        self.version_limit
    }
}

impl Display for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("memory://")
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_keeps_exactly_the_limit() {
        let backend = MemoryBackend::new(2);
        let name = backend.acquire("entry").unwrap();
        for i in 0..5u8 {
            backend.write(&name, ArtifactKind::Key, &[i]).unwrap();
        }

        let entries = backend.entries.lock().unwrap();
        let versions = &entries[&name][&ArtifactKind::Key];
        assert_eq!(versions.len(), 2);
        assert_eq!(versions.keys().copied().collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn instances_do_not_share_state() {
        let a = MemoryBackend::new(2);
        let b = MemoryBackend::new(2);
        let name = a.acquire("entry").unwrap();
        a.write(&name, ArtifactKind::Key, b"key").unwrap();

        assert!(b.read(&name, ArtifactKind::Key).unwrap().is_none());
    }

    #[test]
    fn version_limit_is_at_least_one() {
        let backend = MemoryBackend::new(0);
        assert_eq!(backend.version_limit(), 1);
    }
}
