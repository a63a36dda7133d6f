use std::collections::BTreeMap;
use std::{fmt, io};

use url::Url;

use crate::storage::{FsBackend, MemoryBackend};

//------------ Version -------------------------------------------------------

/// The version tag of one stored artifact blob.
///
/// Versions are monotonically increasing per `(entry, kind)` pair, starting
/// at 1 for the first write.
pub type Version = u64;

/// The latest retained version per artifact kind of one entry.
///
/// An empty vector means the entry does not exist (or holds no artifacts,
/// which the registry treats the same way).
pub type VersionVector = BTreeMap<ArtifactKind, Version>;

//------------ ArtifactKind --------------------------------------------------

/// The kinds of blobs stored per entry.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ArtifactKind {
    Key,
    Certificate,
    CertificateRequest,
    RevocationList,
    Attributes,
    Audit,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 6] = [
        ArtifactKind::Key,
        ArtifactKind::Certificate,
        ArtifactKind::CertificateRequest,
        ArtifactKind::RevocationList,
        ArtifactKind::Attributes,
        ArtifactKind::Audit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Key => "key",
            ArtifactKind::Certificate => "certificate",
            ArtifactKind::CertificateRequest => "csr",
            ArtifactKind::RevocationList => "crl",
            ArtifactKind::Attributes => "attrs",
            ArtifactKind::Audit => "audit",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

//------------ Backend -------------------------------------------------------

/// Versioned, named blob storage.
///
/// A backend keeps, per entry name and artifact kind, the latest
/// `version_limit` versions of a blob. Reads always see the newest version;
/// writes append a new version and prune the oldest ones. Backends are
/// expected to be safe for concurrent use; higher-level ordering is the
/// registry's concern.
#[derive(Debug)]
pub enum Backend {
    Memory(MemoryBackend),
    Fs(FsBackend),
}

impl Backend {
    /// Creates a backend from a storage URI.
    ///
    /// Supported schemes are `memory://` and `fs://<path>`.
    pub fn create(storage_uri: &Url, version_limit: u64) -> StorageResult<Self> {
        match storage_uri.scheme() {
            "memory" => Ok(Backend::Memory(MemoryBackend::new(version_limit))),
            "fs" => {
                let path = format!(
                    "{}{}",
                    storage_uri.host_str().unwrap_or_default(),
                    storage_uri.path()
                );
                Ok(Backend::Fs(FsBackend::new(path, version_limit)?))
            }
            scheme => Err(BackendError::UnknownScheme(scheme.to_owned())),
        }
    }

    /// Creates an in-memory backend.
    pub fn memory(version_limit: u64) -> Self {
        Backend::Memory(MemoryBackend::new(version_limit))
    }

    /// Creates a filesystem backend rooted at the given path.
    pub fn fs(path: impl Into<std::path::PathBuf>, version_limit: u64) -> StorageResult<Self> {
        Ok(Backend::Fs(FsBackend::new(path, version_limit)?))
    }

    /// Reserves a fresh unique entry name.
    ///
    /// If the hint is taken, `<hint>#2`, `<hint>#3`, … are tried until an
    /// unused name is found. Returns the actually reserved name.
    pub fn acquire(&self, name_hint: &str) -> StorageResult<String> {
        match self {
            Backend::Memory(m) => m.acquire(name_hint),
            Backend::Fs(d) => d.acquire(name_hint),
        }
    }

    /// Drops a reserved name again, removing anything stored under it.
    ///
    /// Only meant for undoing a failed entry creation; established entries
    /// are never deleted.
    pub fn discard(&self, name: &str) -> StorageResult<()> {
        match self {
            Backend::Memory(m) => m.discard(name),
            Backend::Fs(d) => d.discard(name),
        }
    }

    /// Appends a new version of an artifact blob, pruning old versions.
    pub fn write(&self, name: &str, kind: ArtifactKind, bytes: &[u8]) -> StorageResult<Version> {
        match self {
            Backend::Memory(m) => m.write(name, kind, bytes),
            Backend::Fs(d) => d.write(name, kind, bytes),
        }
    }

    /// Reads the latest version of an artifact blob.
    pub fn read(&self, name: &str, kind: ArtifactKind) -> StorageResult<Option<(Vec<u8>, Version)>> {
        match self {
            Backend::Memory(m) => m.read(name, kind),
            Backend::Fs(d) => d.read(name, kind),
        }
    }

    /// Returns a snapshot of all entry names holding at least one artifact.
    pub fn names(&self) -> StorageResult<Vec<String>> {
        match self {
            Backend::Memory(m) => m.names(),
            Backend::Fs(d) => d.names(),
        }
    }

    /// Returns the latest version per artifact kind of the given entry.
    pub fn version_vector(&self, name: &str) -> StorageResult<VersionVector> {
        match self {
            Backend::Memory(m) => m.version_vector(name),
            Backend::Fs(d) => d.version_vector(name),
        }
    }

    /// The URI this backend was created from, used to name the registry.
    pub fn uri(&self) -> String {
        match self {
            Backend::Memory(m) => m.uri(),
            Backend::Fs(d) => d.uri(),
        }
    }

    /// The number of versions retained per `(entry, kind)`.
    pub fn version_limit(&self) -> u64 {
        match self {
            Backend::Memory(m) => m.version_limit(),
            Backend::Fs(d) => d.version_limit(),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

//------------ StorageResult -------------------------------------------------

pub type StorageResult<T> = Result<T, BackendError>;

//------------ BackendError --------------------------------------------------

/// This type defines possible errors for storage backends.
#[derive(Debug)]
pub enum BackendError {
    UnknownScheme(String),
    UnknownName(String),
    Io(String, io::Error),
    Other(String),
}

impl BackendError {
    pub fn io(context: impl fmt::Display, e: io::Error) -> Self {
        BackendError::Io(context.to_string(), e)
    }

    pub fn other(msg: impl fmt::Display) -> Self {
        BackendError::Other(msg.to_string())
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::UnknownScheme(scheme) => write!(f, "unknown storage scheme: {}", scheme),
            BackendError::UnknownName(name) => write!(f, "unknown entry name: {}", name),
            BackendError::Io(context, e) => write!(f, "{}: {}", context, e),
            BackendError::Other(msg) => msg.fmt(f),
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackendError::Io(_, e) => Some(e),
            _ => None,
        }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use rand::{distributions::Alphanumeric, Rng};

    use super::*;

    fn random_name() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect()
    }

    fn impl_write_read(backend: Backend) {
        let name = backend.acquire(&random_name()).unwrap();

        let version = backend.write(&name, ArtifactKind::Certificate, b"cert-1").unwrap();
        assert_eq!(version, 1);

        let (bytes, version) = backend.read(&name, ArtifactKind::Certificate).unwrap().unwrap();
        assert_eq!(bytes, b"cert-1");
        assert_eq!(version, 1);

        assert!(backend.read(&name, ArtifactKind::Key).unwrap().is_none());
    }

    fn impl_version_monotonicity(backend: Backend) {
        let name = backend.acquire(&random_name()).unwrap();

        let mut last = 0;
        for i in 0..5 {
            let blob = format!("blob-{}", i);
            let version = backend.write(&name, ArtifactKind::Audit, blob.as_bytes()).unwrap();
            assert!(version > last);
            last = version;
        }
        let (bytes, version) = backend.read(&name, ArtifactKind::Audit).unwrap().unwrap();
        assert_eq!(version, last);
        assert_eq!(bytes, b"blob-4");
    }

    fn impl_retention(backend: Backend) {
        let name = backend.acquire(&random_name()).unwrap();

        for i in 0..7u8 {
            backend.write(&name, ArtifactKind::Key, &[i]).unwrap();
        }

        // Only the newest `version_limit` versions remain; the latest read
        // keeps working.
        let (bytes, version) = backend.read(&name, ArtifactKind::Key).unwrap().unwrap();
        assert_eq!(version, 7);
        assert_eq!(bytes, vec![6]);
    }

    fn impl_acquire_suffixes(backend: Backend) {
        let base = random_name();

        let first = backend.acquire(&base).unwrap();
        assert_eq!(first, base);

        let second = backend.acquire(&base).unwrap();
        assert_eq!(second, format!("{}#2", base));

        let third = backend.acquire(&base).unwrap();
        assert_eq!(third, format!("{}#3", base));
    }

    fn impl_names_skip_empty(backend: Backend) {
        let empty = backend.acquire(&random_name()).unwrap();
        let full = backend.acquire(&random_name()).unwrap();
        backend.write(&full, ArtifactKind::Attributes, b"{}").unwrap();

        let names = backend.names().unwrap();
        assert!(names.contains(&full));
        assert!(!names.contains(&empty));
    }

    fn impl_discard(backend: Backend) {
        let name = backend.acquire(&random_name()).unwrap();
        backend.write(&name, ArtifactKind::Key, b"key").unwrap();
        backend.discard(&name).unwrap();

        assert!(backend.read(&name, ArtifactKind::Key).unwrap().is_none());
        assert!(!backend.names().unwrap().contains(&name));

        // The name is free for re-use.
        assert_eq!(backend.acquire(&name).unwrap(), name);
    }

    fn impl_version_vector(backend: Backend) {
        let name = backend.acquire(&random_name()).unwrap();
        assert!(backend.version_vector(&name).unwrap().is_empty());

        backend.write(&name, ArtifactKind::Key, b"key").unwrap();
        backend.write(&name, ArtifactKind::Certificate, b"cert").unwrap();
        backend.write(&name, ArtifactKind::Certificate, b"cert-2").unwrap();

        let vv = backend.version_vector(&name).unwrap();
        assert_eq!(vv.get(&ArtifactKind::Key), Some(&1));
        assert_eq!(vv.get(&ArtifactKind::Certificate), Some(&2));
        assert_eq!(vv.get(&ArtifactKind::Audit), None);
    }

    fn impl_awkward_names(backend: Backend) {
        for name in ["root1:intermediate1:leaf1", "a b", "x/y", "ünïcode", "."] {
            let acquired = backend.acquire(name).unwrap();
            assert_eq!(acquired, name);
            backend.write(&acquired, ArtifactKind::Attributes, b"{}").unwrap();
            let (bytes, _) = backend.read(&acquired, ArtifactKind::Attributes).unwrap().unwrap();
            assert_eq!(bytes, b"{}");
            assert!(backend.names().unwrap().contains(&acquired.to_string()));
        }
    }

    fn test_impl(make: impl Fn() -> Backend) {
        impl_write_read(make());
        impl_version_monotonicity(make());
        impl_retention(make());
        impl_acquire_suffixes(make());
        impl_names_skip_empty(make());
        impl_discard(make());
        impl_version_vector(make());
        impl_awkward_names(make());
    }

    #[test]
    fn memory_backend() {
        test_impl(|| Backend::memory(2));
        assert_eq!(Backend::memory(2).uri(), "memory://");
    }

    #[test]
    fn fs_backend() {
        let dir = tempfile::tempdir().unwrap();
        test_impl(|| Backend::fs(dir.path().join(random_name()), 2).unwrap());
    }

    #[test]
    fn create_from_uri() {
        let uri = Url::parse("memory://").unwrap();
        assert!(matches!(Backend::create(&uri, 2).unwrap(), Backend::Memory(_)));

        let dir = tempfile::tempdir().unwrap();
        let uri = Url::parse(&format!("fs://{}", dir.path().display())).unwrap();
        assert!(matches!(Backend::create(&uri, 2).unwrap(), Backend::Fs(_)));

        let uri = Url::parse("gopher://x").unwrap();
        assert!(matches!(
            Backend::create(&uri, 2),
            Err(BackendError::UnknownScheme(_))
        ));
    }
}
