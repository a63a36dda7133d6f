use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use crate::storage::{ArtifactKind, BackendError, StorageResult, Version, VersionVector};

const TMP_DIR: &str = ".tmp";

//------------ FsBackend -----------------------------------------------------

/// A filesystem backend.
///
/// Each entry becomes a directory under the root; each artifact version
/// becomes a file `<kind>.<version>` inside it. Entry names are escaped
/// into filesystem-safe directory names; the escaping is reversible so
/// `names()` can report the original names.
///
/// New values are written to a temp file first and then renamed (moved)
/// into place, to avoid partially written files on I/O errors or crashes.
#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
    tmp: PathBuf,
    version_limit: u64,
}

impl FsBackend {
    pub fn new(path: impl Into<PathBuf>, version_limit: u64) -> StorageResult<Self> {
        let root = path.into();
        let tmp = root.join(TMP_DIR);

        if !tmp.exists() {
            fs::create_dir_all(&tmp).map_err(|e| {
                BackendError::io(
                    format!("cannot create directory for tmp files: {}", tmp.display()),
                    e,
                )
            })?;
        }

        Ok(FsBackend {
            root,
            tmp,
            version_limit: version_limit.max(1),
        })
    }

    fn entry_dir(&self, name: &str) -> PathBuf {
        self.root.join(escape_name(name))
    }

    pub fn acquire(&self, name_hint: &str) -> StorageResult<String> {
        let mut candidate = name_hint.to_string();
        let mut suffix = 2;
        loop {
            let dir = self.entry_dir(&candidate);
            if !dir.exists() {
                fs::create_dir_all(&dir).map_err(|e| {
                    BackendError::io(format!("cannot create entry dir: {}", dir.display()), e)
                })?;
                return Ok(candidate);
            }
            candidate = format!("{}#{}", name_hint, suffix);
            suffix += 1;
        }
    }

    pub fn discard(&self, name: &str) -> StorageResult<()> {
        let dir = self.entry_dir(name);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| {
                BackendError::io(format!("cannot remove entry dir: {}", dir.display()), e)
            })?;
        }
        Ok(())
    }

    pub fn write(&self, name: &str, kind: ArtifactKind, bytes: &[u8]) -> StorageResult<Version> {
        let dir = self.entry_dir(name);
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| {
                BackendError::io(format!("cannot create entry dir: {}", dir.display()), e)
            })?;
        }

        let mut versions = self.versions(&dir, kind)?;
        let version = versions.last().copied().unwrap_or(0) + 1;
        let path = dir.join(format!("{}.{}", kind.as_str(), version));

        let tmp_file = tempfile::NamedTempFile::new_in(&self.tmp).map_err(|e| {
            BackendError::io(
                format!("cannot create tmp file for {} of '{}'", kind, name),
                e,
            )
        })?;
        fs::write(&tmp_file, bytes).map_err(|e| {
            BackendError::io(
                format!("cannot write tmp file for {} of '{}'", kind, name),
                e,
            )
        })?;
        tmp_file.persist(&path).map_err(|e| {
            BackendError::io(
                format!(
                    "cannot rename temp file {} to {}",
                    e.file.path().display(),
                    path.display()
                ),
                e.error,
            )
        })?;

        // Prune the smallest-numbered version files beyond the limit.
        versions.push(version);
        while versions.len() as u64 > self.version_limit {
            let oldest = versions.remove(0);
            let old_path = dir.join(format!("{}.{}", kind.as_str(), oldest));
            if let Err(e) = fs::remove_file(&old_path) {
                warn!("cannot prune {}: {}", old_path.display(), e);
            }
        }

        Ok(version)
    }

    pub fn read(&self, name: &str, kind: ArtifactKind) -> StorageResult<Option<(Vec<u8>, Version)>> {
        let dir = self.entry_dir(name);
        if !dir.exists() {
            return Ok(None);
        }
        match self.versions(&dir, kind)?.last() {
            None => Ok(None),
            Some(version) => {
                let path = dir.join(format!("{}.{}", kind.as_str(), version));
                let bytes = fs::read(&path)
                    .map_err(|e| BackendError::io(format!("cannot read {}", path.display()), e))?;
                Ok(Some((bytes, *version)))
            }
        }
    }

    pub fn names(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        let dir_entries = fs::read_dir(&self.root)
            .map_err(|e| BackendError::io(format!("cannot read dir {}", self.root.display()), e))?;
        for dir_entry in dir_entries {
            let dir_entry = dir_entry.map_err(|e| {
                BackendError::io(format!("cannot read entry in {}", self.root.display()), e)
            })?;
            let path = dir_entry.path();
            let file_name = dir_entry.file_name().to_string_lossy().to_string();
            if !path.is_dir() || file_name.starts_with('.') {
                continue;
            }
            let name = match unescape_name(&file_name) {
                Some(name) => name,
                None => {
                    warn!("skipping malformed entry dir: {}", path.display());
                    continue;
                }
            };
            if self.has_artifacts(&path)? {
                names.push(name);
            }
        }
        Ok(names)
    }

    pub fn version_vector(&self, name: &str) -> StorageResult<VersionVector> {
        let dir = self.entry_dir(name);
        if !dir.exists() {
            return Ok(VersionVector::new());
        }
        let mut vv = VersionVector::new();
        for kind in ArtifactKind::ALL {
            if let Some(version) = self.versions(&dir, kind)?.last() {
                vv.insert(kind, *version);
            }
        }
        Ok(vv)
    }

    pub fn uri(&self) -> String {
        format!("fs://{}", self.root.display())
    }

    pub fn version_limit(&self) -> u64 {
        self.version_limit
    }

    /// Returns the sorted version numbers present for an artifact kind.
    fn versions(&self, dir: &Path, kind: ArtifactKind) -> StorageResult<Vec<Version>> {
        let mut versions = Vec::new();
        let dir_entries = fs::read_dir(dir)
            .map_err(|e| BackendError::io(format!("cannot read dir {}", dir.display()), e))?;
        for dir_entry in dir_entries {
            let dir_entry = dir_entry
                .map_err(|e| BackendError::io(format!("cannot read entry in {}", dir.display()), e))?;
            let file_name = dir_entry.file_name().to_string_lossy().to_string();
            if let Some((stem, version)) = file_name.rsplit_once('.') {
                if stem == kind.as_str() {
                    if let Ok(version) = version.parse::<Version>() {
                        versions.push(version);
                    }
                }
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    fn has_artifacts(&self, dir: &Path) -> StorageResult<bool> {
        for kind in ArtifactKind::ALL {
            if !self.versions(dir, kind)?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Display for FsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fs://{}", self.root.display())
    }
}

//------------ Name escaping -------------------------------------------------

/// Escapes an entry name into a filesystem-safe directory name.
///
/// ASCII alphanumerics, `-`, `_` and non-leading `.` pass through; every
/// other byte becomes `%XX`. The mapping is injective so directory names
/// can be turned back into entry names.
fn escape_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for (i, b) in name.bytes().enumerate() {
        let pass = b.is_ascii_alphanumeric()
            || b == b'-'
            || b == b'_'
            || (b == b'.' && i > 0);
        if pass {
            escaped.push(b as char);
        } else {
            escaped.push_str(&format!("%{:02X}", b));
        }
    }
    escaped
}

fn unescape_name(escaped: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(escaped.len());
    let mut chars = escaped.bytes();
    while let Some(b) = chars.next() {
        if b == b'%' {
            let hi = chars.next()?;
            let lo = chars.next()?;
            let hex = [hi, lo];
            let hex = std::str::from_utf8(&hex).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8(bytes).ok()
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trip() {
        for name in [
            "plain",
            "root1:intermediate1:leaf1",
            "with space",
            "a/b\\c",
            "ünïcode",
            ".leading.dot",
            "100%",
        ] {
            let escaped = escape_name(name);
            assert!(!escaped.contains('/'));
            assert!(!escaped.contains(':'));
            assert!(!escaped.starts_with('.'));
            assert_eq!(unescape_name(&escaped).as_deref(), Some(name));
        }
    }

    #[test]
    fn escaping_is_injective_for_colliding_inputs() {
        assert_ne!(escape_name("a:b"), escape_name("a%3Ab"));
    }

    #[test]
    fn retention_prunes_smallest_version_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path().join("store"), 2).unwrap();
        let name = backend.acquire("entry").unwrap();

        for i in 0..5u8 {
            backend.write(&name, ArtifactKind::Certificate, &[i]).unwrap();
        }

        let versions = backend
            .versions(&backend.entry_dir(&name), ArtifactKind::Certificate)
            .unwrap();
        assert_eq!(versions, vec![4, 5]);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");

        let backend = FsBackend::new(&path, 2).unwrap();
        let name = backend.acquire("entry").unwrap();
        backend.write(&name, ArtifactKind::Key, b"key-bytes").unwrap();

        let reopened = FsBackend::new(&path, 2).unwrap();
        let (bytes, version) = reopened.read(&name, ArtifactKind::Key).unwrap().unwrap();
        assert_eq!(bytes, b"key-bytes");
        assert_eq!(version, 1);
        assert_eq!(reopened.names().unwrap(), vec![name]);
    }
}
