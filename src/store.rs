//! The certificate registry.
//!
//! A [`Registry`] catalogs named entries over a storage [`Backend`].
//! Mutations run under a single writer lock so that name allocation,
//! factory invocation and artifact persistence cannot interleave; reads
//! take the reader lock and are served through the entry cache.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::audit::{AuditAction, AuditRecord};
use crate::cache::EntryCache;
use crate::certs::{
    CertPool, Certificate, CertificateFactory, CertificateRequest, CertificateRequestFactory,
    KeyUsage, RevocationList, RevocationListFactory,
};
use crate::error::Error;
use crate::keys::KeyPair;
use crate::storage::{ArtifactKind, Backend, VersionVector};

/// The artifact kinds `merge` copies between registries.
///
/// The audit log is deliberately absent: it is append-only, so merging
/// writes a `merge_imported` record instead of overwriting history.
const MERGE_KINDS: [ArtifactKind; 5] = [
    ArtifactKind::Key,
    ArtifactKind::Certificate,
    ArtifactKind::CertificateRequest,
    ArtifactKind::RevocationList,
    ArtifactKind::Attributes,
];

//------------ Registry ------------------------------------------------------

/// A persistent registry of certificate entries.
pub struct Registry {
    name: String,
    backend: Backend,
    cache: EntryCache<Entry>,
    lock: std::sync::RwLock<()>,
}

impl Registry {
    /// Creates a registry over the given backend.
    ///
    /// A `cache_ttl` of zero disables the entry cache.
    pub fn new(backend: Backend, cache_ttl: Duration) -> Self {
        let name = format!("Registry[{}]", backend.uri());
        info!("opening {}", name);
        Registry {
            name,
            backend,
            cache: EntryCache::new(cache_ttl),
            lock: std::sync::RwLock::new(()),
        }
    }

    /// The registry name, derived from the backend URI.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates a new entry from the factory's key pair and certificate.
    ///
    /// If `desired_name` is taken, `<name>#2`, `<name>#3`, … are tried
    /// until a free name is found; the actually allocated name is
    /// returned. A factory failure leaves no entry behind.
    pub fn create_certificate(
        &self,
        desired_name: &str,
        factory: &dyn CertificateFactory,
        user: &str,
    ) -> Result<String, Error> {
        check_name(desired_name)?;
        let _guard = self.write_lock();

        let name = self.backend.acquire(desired_name)?;
        let result = factory.new_certificate().and_then(|(key_pair, certificate)| {
            if !key_pair.public_key_matches(&certificate.public_key_der()) {
                return Err(Error::integrity(
                    "factory returned a certificate that does not match its key",
                ));
            }
            self.backend
                .write(&name, ArtifactKind::Key, &key_pair.to_pkcs8_der())?;
            self.backend
                .write(&name, ArtifactKind::Certificate, certificate.as_der())?;
            self.append_audit_locked(
                &name,
                AuditRecord::new(user, AuditAction::CreateCertificate, factory.name()),
            )
        });
        self.finish_create(name, result, user, "certificate")
    }

    /// Creates a new entry from the factory's key pair and CSR.
    pub fn create_certificate_request(
        &self,
        desired_name: &str,
        factory: &dyn CertificateRequestFactory,
        user: &str,
    ) -> Result<String, Error> {
        check_name(desired_name)?;
        let _guard = self.write_lock();

        let name = self.backend.acquire(desired_name)?;
        let result = factory
            .new_certificate_request()
            .and_then(|(key_pair, request)| {
                if !key_pair.public_key_matches(&request.public_key_der()) {
                    return Err(Error::integrity(
                        "factory returned a request that does not match its key",
                    ));
                }
                self.backend
                    .write(&name, ArtifactKind::Key, &key_pair.to_pkcs8_der())?;
                self.backend
                    .write(&name, ArtifactKind::CertificateRequest, request.as_der())?;
                self.append_audit_locked(
                    &name,
                    AuditRecord::new(user, AuditAction::CreateCertificateRequest, factory.name()),
                )
            });
        self.finish_create(name, result, user, "certificate request")
    }

    fn finish_create(
        &self,
        name: String,
        result: Result<(), Error>,
        user: &str,
        what: &str,
    ) -> Result<String, Error> {
        match result {
            Ok(()) => {
                self.cache.forget(&name);
                info!("{}: created {} entry '{}' for '{}'", self.name, what, name, user);
                Ok(name)
            }
            Err(e) => {
                if let Err(cleanup) = self.backend.discard(&name) {
                    warn!(
                        "{}: cannot discard entry '{}' after failed create: {}",
                        self.name, name, cleanup
                    );
                }
                Err(e)
            }
        }
    }

    /// Returns a handle to the named entry.
    pub fn entry(&self, name: &str) -> Result<RegistryEntry<'_>, Error> {
        check_name(name)?;
        let _guard = self.read_lock();
        self.load_entry(name)?;
        Ok(RegistryEntry {
            registry: self,
            name: name.to_string(),
        })
    }

    /// Returns a snapshot iterator over all entries.
    ///
    /// The set of names is fixed when this method returns; entries added
    /// later are not observed, while entry contents are loaded fresh as
    /// the iterator reaches them.
    pub fn entries(&self) -> Result<Entries<'_>, Error> {
        let _guard = self.read_lock();
        let mut names = self.backend.names()?;
        names.sort();
        Ok(Entries {
            registry: self,
            names: names.into_iter(),
        })
    }

    /// Partitions all certificates into root and intermediate pools for
    /// chain verification.
    pub fn cert_pools(&self) -> Result<(CertPool, CertPool), Error> {
        let _guard = self.read_lock();
        let mut roots = CertPool::new();
        let mut intermediates = CertPool::new();
        for name in self.backend.names()? {
            let entry = match self.load_entry(&name) {
                Ok(entry) => entry,
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if let Some(certificate) = &entry.certificate {
                if certificate.is_self_signed() {
                    roots.add(certificate.clone());
                } else if certificate.is_ca() {
                    intermediates.add(certificate.clone());
                }
            }
        }
        Ok((roots, intermediates))
    }

    /// Folds all entries of `other` into this registry.
    ///
    /// Entries whose name and public key match an existing entry are
    /// treated as the same identity: artifacts are upserted only where
    /// the source version is strictly newer or locally absent. A name
    /// held by a different identity gets the usual suffix treatment.
    /// Merging twice from the same source is a no-op the second time.
    pub fn merge(&self, other: &Registry, user: &str) -> Result<(), Error> {
        if std::ptr::eq(self, other) {
            return Err(Error::invalid_input("cannot merge a registry into itself"));
        }
        let _guard = self.write_lock();
        info!("{}: merging entries from {}...", self.name, other.name);

        let mut source_entries = other.entries()?;
        while let Some(source) = source_entries.next_entry()? {
            let snapshot = source.snapshot()?;
            self.merge_entry_locked(source.name(), &snapshot, user)?;
        }
        Ok(())
    }

    fn merge_entry_locked(&self, source_name: &str, source: &Entry, user: &str) -> Result<(), Error> {
        let source_key = source.public_key_der()?;

        // Probe the suffix candidates for this name: the first candidate
        // with a matching public key is the same identity, the first free
        // candidate hosts a colliding import. Probing in allocation order
        // keeps repeated merges idempotent.
        let mut suffix = 1u64;
        let (target_name, existing) = loop {
            let candidate = if suffix == 1 {
                source_name.to_string()
            } else {
                format!("{}#{}", source_name, suffix)
            };
            match self.try_load_entry(&candidate)? {
                None => break (candidate, None),
                Some(local) => {
                    if local.public_key_der().ok().as_deref() == Some(source_key.as_slice()) {
                        break (candidate, Some(local));
                    }
                }
            }
            suffix += 1;
        };

        match existing {
            None => {
                let name = self.backend.acquire(&target_name)?;
                for kind in ArtifactKind::ALL {
                    if let Some(bytes) = source.artifact_bytes(kind) {
                        self.backend.write(&name, kind, &bytes)?;
                    }
                }
                self.append_audit_locked(
                    &name,
                    AuditRecord::new(
                        user,
                        AuditAction::MergeImported,
                        format!("imported entry '{}'", source_name),
                    ),
                )?;
                self.cache.forget(&name);
                debug!("{}: merge imported '{}' as '{}'", self.name, source_name, name);
            }
            Some(local) => {
                let mut imported = 0usize;
                for kind in MERGE_KINDS {
                    let bytes = match source.artifact_bytes(kind) {
                        Some(bytes) => bytes,
                        None => continue,
                    };
                    let newer = match (local.versions.get(&kind), source.versions.get(&kind)) {
                        (None, _) => true,
                        (Some(local_version), Some(source_version)) => source_version > local_version,
                        (Some(_), None) => false,
                    };
                    if newer && local.artifact_bytes(kind).as_deref() != Some(bytes.as_slice()) {
                        self.backend.write(&target_name, kind, &bytes)?;
                        imported += 1;
                    }
                }
                if imported > 0 {
                    self.append_audit_locked(
                        &target_name,
                        AuditRecord::new(
                            user,
                            AuditAction::MergeImported,
                            format!("updated {} artifacts from '{}'", imported, source_name),
                        ),
                    )?;
                    self.cache.forget(&target_name);
                    debug!(
                        "{}: merge updated '{}' ({} artifacts)",
                        self.name, target_name, imported
                    );
                }
            }
        }
        Ok(())
    }

    fn load_entry(&self, name: &str) -> Result<Arc<Entry>, Error> {
        let versions = self.backend.version_vector(name)?;
        if versions.is_empty() {
            return Err(Error::not_found(name));
        }
        self.cache.lookup(
            name,
            || self.backend.version_vector(name).map_err(Error::from),
            || Entry::load(&self.backend, name),
        )
    }

    fn try_load_entry(&self, name: &str) -> Result<Option<Arc<Entry>>, Error> {
        match self.load_entry(name) {
            Ok(entry) => Ok(Some(entry)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn append_audit_locked(&self, name: &str, record: AuditRecord) -> Result<(), Error> {
        let mut records: Vec<AuditRecord> = match self.backend.read(name, ArtifactKind::Audit)? {
            Some((bytes, _)) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::integrity(format!("cannot parse audit log of '{}': {}", name, e))
            })?,
            None => Vec::new(),
        };
        debug!("{}: audit '{}': {}", self.name, name, record);
        records.push(record);
        let bytes = serde_json::to_vec(&records)
            .map_err(|e| Error::integrity(format!("cannot marshal audit log of '{}': {}", name, e)))?;
        self.backend.write(name, ArtifactKind::Audit, &bytes)?;
        Ok(())
    }

    fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Display for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

fn check_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        Err(Error::invalid_input("entry name must not be empty"))
    } else {
        Ok(())
    }
}

//------------ Entry ---------------------------------------------------------

/// The decoded artifacts of one entry, as loaded from the backend.
#[derive(Debug)]
struct Entry {
    key_der: Option<Vec<u8>>,
    certificate: Option<Certificate>,
    certificate_request: Option<CertificateRequest>,
    revocation_list: Option<RevocationList>,
    attributes: BTreeMap<String, String>,
    audit: Vec<AuditRecord>,
    versions: VersionVector,
}

impl Entry {
    fn load(backend: &Backend, name: &str) -> Result<Entry, Error> {
        let versions = backend.version_vector(name)?;

        let key_der = backend.read(name, ArtifactKind::Key)?.map(|(bytes, _)| bytes);
        let certificate = backend
            .read(name, ArtifactKind::Certificate)?
            .map(|(bytes, _)| Certificate::from_der(bytes))
            .transpose()?;
        let certificate_request = backend
            .read(name, ArtifactKind::CertificateRequest)?
            .map(|(bytes, _)| CertificateRequest::from_der(bytes))
            .transpose()?;
        let revocation_list = backend
            .read(name, ArtifactKind::RevocationList)?
            .map(|(bytes, _)| RevocationList::from_der(bytes))
            .transpose()?;
        let attributes = match backend.read(name, ArtifactKind::Attributes)? {
            Some((bytes, _)) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::integrity(format!("cannot parse attributes of '{}': {}", name, e))
            })?,
            None => BTreeMap::new(),
        };
        let audit = match backend.read(name, ArtifactKind::Audit)? {
            Some((bytes, _)) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::integrity(format!("cannot parse audit log of '{}': {}", name, e))
            })?,
            None => Vec::new(),
        };

        let entry = Entry {
            key_der,
            certificate,
            certificate_request,
            revocation_list,
            attributes,
            audit,
            versions,
        };
        entry.check_invariants(name)?;
        Ok(entry)
    }

    /// A certificate or CSR must match the stored key's public part.
    fn check_invariants(&self, name: &str) -> Result<(), Error> {
        let key_der = match &self.key_der {
            Some(der) => der,
            None => return Ok(()),
        };
        let public_key = KeyPair::from_pkcs8_der(key_der)?.public_key_der();
        if let Some(certificate) = &self.certificate {
            if certificate.public_key_der() != public_key {
                return Err(Error::integrity(format!(
                    "certificate of '{}' does not match its key",
                    name
                )));
            }
        }
        if let Some(request) = &self.certificate_request {
            if request.public_key_der() != public_key {
                return Err(Error::integrity(format!(
                    "certificate request of '{}' does not match its key",
                    name
                )));
            }
        }
        Ok(())
    }

    /// The SubjectPublicKeyInfo identifying this entry.
    fn public_key_der(&self) -> Result<Vec<u8>, Error> {
        if let Some(der) = &self.key_der {
            return Ok(KeyPair::from_pkcs8_der(der)?.public_key_der());
        }
        if let Some(certificate) = &self.certificate {
            return Ok(certificate.public_key_der());
        }
        if let Some(request) = &self.certificate_request {
            return Ok(request.public_key_der());
        }
        Err(Error::integrity("entry has no public key material"))
    }

    /// The raw blob of one artifact kind, as it would be persisted.
    fn artifact_bytes(&self, kind: ArtifactKind) -> Option<Vec<u8>> {
        match kind {
            ArtifactKind::Key => self.key_der.clone(),
            ArtifactKind::Certificate => {
                self.certificate.as_ref().map(|c| c.as_der().to_vec())
            }
            ArtifactKind::CertificateRequest => {
                self.certificate_request.as_ref().map(|r| r.as_der().to_vec())
            }
            ArtifactKind::RevocationList => {
                self.revocation_list.as_ref().map(|l| l.as_der().to_vec())
            }
            ArtifactKind::Attributes => {
                if self.attributes.is_empty() {
                    None
                } else {
                    serde_json::to_vec(&self.attributes).ok()
                }
            }
            ArtifactKind::Audit => {
                if self.audit.is_empty() {
                    None
                } else {
                    serde_json::to_vec(&self.audit).ok()
                }
            }
        }
    }
}

//------------ RegistryEntry -------------------------------------------------

/// A cheap handle to one registry entry.
///
/// The handle holds no artifact data itself; every accessor revalidates
/// through the registry's cache, so a handle observes later changes to
/// its entry. Accessors that cannot fail report missing or unreadable
/// artifacts as absent.
pub struct RegistryEntry<'a> {
    registry: &'a Registry,
    name: String,
}

impl<'a> RegistryEntry<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn snapshot(&self) -> Result<Arc<Entry>, Error> {
        let _guard = self.registry.read_lock();
        self.registry.load_entry(&self.name)
    }

    pub fn has_key(&self) -> bool {
        self.snapshot().map(|e| e.key_der.is_some()).unwrap_or(false)
    }

    pub fn has_certificate(&self) -> bool {
        self.snapshot().map(|e| e.certificate.is_some()).unwrap_or(false)
    }

    pub fn has_certificate_request(&self) -> bool {
        self.snapshot()
            .map(|e| e.certificate_request.is_some())
            .unwrap_or(false)
    }

    pub fn has_revocation_list(&self) -> bool {
        self.snapshot()
            .map(|e| e.revocation_list.is_some())
            .unwrap_or(false)
    }

    /// Returns the entry's private key.
    ///
    /// Key access is recorded in the audit log; this is the one read
    /// that mutates state, and it fails if the audit write fails.
    pub fn key(&self, user: &str) -> Result<Option<KeyPair>, Error> {
        let entry = {
            let _guard = self.registry.write_lock();
            let entry = self.registry.load_entry(&self.name)?;
            if entry.key_der.is_some() {
                self.registry.append_audit_locked(
                    &self.name,
                    AuditRecord::new(user, AuditAction::AccessKey, "private key accessed"),
                )?;
                self.registry.cache.forget(&self.name);
            }
            entry
        };
        match &entry.key_der {
            Some(der) => Ok(Some(KeyPair::from_pkcs8_der(der)?)),
            None => Ok(None),
        }
    }

    pub fn certificate(&self) -> Option<Certificate> {
        self.snapshot().ok().and_then(|e| e.certificate.clone())
    }

    pub fn certificate_request(&self) -> Option<CertificateRequest> {
        self.snapshot().ok().and_then(|e| e.certificate_request.clone())
    }

    pub fn revocation_list(&self) -> Option<RevocationList> {
        self.snapshot().ok().and_then(|e| e.revocation_list.clone())
    }

    pub fn attributes(&self) -> BTreeMap<String, String> {
        self.snapshot().map(|e| e.attributes.clone()).unwrap_or_default()
    }

    /// The entry's audit trail, oldest record first.
    pub fn audit(&self) -> Vec<AuditRecord> {
        self.snapshot().map(|e| e.audit.clone()).unwrap_or_default()
    }

    /// Replaces the entry's attributes.
    pub fn set_attributes(
        &self,
        attributes: BTreeMap<String, String>,
        user: &str,
    ) -> Result<(), Error> {
        let _guard = self.registry.write_lock();
        self.registry.load_entry(&self.name)?;

        let bytes = serde_json::to_vec(&attributes)
            .map_err(|e| Error::invalid_input(format!("cannot marshal attributes: {}", e)))?;
        self.registry
            .backend
            .write(&self.name, ArtifactKind::Attributes, &bytes)?;
        self.registry.append_audit_locked(
            &self.name,
            AuditRecord::new(
                user,
                AuditAction::SetAttributes,
                format!("{} attributes", attributes.len()),
            ),
        )?;
        self.registry.cache.forget(&self.name);
        Ok(())
    }

    /// Replaces the entry's revocation list with a freshly issued one.
    ///
    /// Fails unless the entry holds a CA certificate with the CRL sign
    /// key usage; the new list is signed with the entry's own key.
    pub fn reset_revocation_list(
        &self,
        factory: &dyn RevocationListFactory,
        user: &str,
    ) -> Result<RevocationList, Error> {
        let _guard = self.registry.write_lock();
        let entry = self.registry.load_entry(&self.name)?;

        let certificate = entry.certificate.clone().ok_or_else(|| {
            Error::invalid_input(format!("entry '{}' has no certificate", self.name))
        })?;
        if !certificate.is_ca() || !certificate.has_key_usage(KeyUsage::CrlSign) {
            return Err(Error::invalid_input(format!(
                "certificate of '{}' cannot sign revocation lists",
                self.name
            )));
        }
        let key_der = entry.key_der.as_ref().ok_or_else(|| {
            Error::integrity(format!("entry '{}' has a certificate but no key", self.name))
        })?;
        let signer = KeyPair::from_pkcs8_der(key_der)?;

        let revocation_list = factory.new_revocation_list(&certificate, &signer)?;
        self.registry.backend.write(
            &self.name,
            ArtifactKind::RevocationList,
            revocation_list.as_der(),
        )?;
        self.registry.append_audit_locked(
            &self.name,
            AuditRecord::new(user, AuditAction::ResetRevocationList, factory.name()),
        )?;
        self.registry.cache.forget(&self.name);
        Ok(revocation_list)
    }

    /// Whether the entry's certificate is self-signed and verifies under
    /// its own key.
    pub fn is_root(&self) -> bool {
        self.certificate()
            .map(|c| c.is_self_signed())
            .unwrap_or(false)
    }

    pub fn is_ca(&self) -> bool {
        self.certificate().map(|c| c.is_ca()).unwrap_or(false)
    }

    /// Whether the entry holds a CA certificate asserting the given key
    /// usage.
    pub fn can_issue(&self, usage: KeyUsage) -> bool {
        self.certificate()
            .map(|c| c.is_ca() && c.has_key_usage(usage))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for RegistryEntry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RegistryEntry({})", self.name)
    }
}

//------------ Entries -------------------------------------------------------

/// A snapshot iterator over registry entries.
pub struct Entries<'a> {
    registry: &'a Registry,
    names: std::vec::IntoIter<String>,
}

impl<'a> Entries<'a> {
    /// Returns the next entry, or `None` when the snapshot is exhausted.
    pub fn next_entry(&mut self) -> Result<Option<RegistryEntry<'a>>, Error> {
        while let Some(name) = self.names.next() {
            match self.registry.entry(&name) {
                Ok(entry) => return Ok(Some(entry)),
                // Names can outlive their artifacts only across external
                // interference; skip rather than fail the whole walk.
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

impl<'a> Iterator for Entries<'a> {
    type Item = Result<RegistryEntry<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::{CertificateTemplate, LocalCertificateFactory};
    use crate::keys::KeyAlgorithm;

    fn root_factory(cn: &str) -> LocalCertificateFactory {
        let mut template = CertificateTemplate::new(cn, 1);
        template.is_ca = true;
        template.max_path_len = Some(2);
        template.key_usages = vec![KeyUsage::CertSign, KeyUsage::CrlSign];
        LocalCertificateFactory::self_signed(template, KeyAlgorithm::EcdsaP256.key_pair_factory())
    }

    fn memory_registry() -> Registry {
        Registry::new(Backend::memory(2), Duration::ZERO)
    }

    struct FailingFactory;

    impl CertificateFactory for FailingFactory {
        fn name(&self) -> &str {
            "Failing"
        }

        fn new_certificate(&self) -> Result<(KeyPair, Certificate), Error> {
            Err(Error::protocol("issuance refused"))
        }
    }

    #[test]
    fn registry_name_derives_from_backend() {
        assert_eq!(memory_registry().name(), "Registry[memory://]");
    }

    #[test]
    fn empty_name_is_rejected() {
        let registry = memory_registry();
        assert!(matches!(
            registry.create_certificate("", &root_factory("x"), "alice"),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(registry.entry(""), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn unknown_entry_is_not_found() {
        let registry = memory_registry();
        assert!(matches!(registry.entry("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn colliding_names_get_suffixes() {
        let registry = memory_registry();
        let factory = root_factory("collision");

        assert_eq!(
            registry.create_certificate("collision", &factory, "alice").unwrap(),
            "collision"
        );
        assert_eq!(
            registry.create_certificate("collision", &factory, "alice").unwrap(),
            "collision#2"
        );
        assert_eq!(
            registry.create_certificate("collision", &factory, "alice").unwrap(),
            "collision#3"
        );

        assert!(registry.entry("collision").is_ok());
        assert!(registry.entry("collision#2").is_ok());
    }

    #[test]
    fn factory_failure_leaves_no_entry() {
        let registry = memory_registry();
        assert!(registry
            .create_certificate("doomed", &FailingFactory, "alice")
            .is_err());
        assert!(matches!(registry.entry("doomed"), Err(Error::NotFound(_))));

        // The name was released again.
        assert_eq!(
            registry
                .create_certificate("doomed", &root_factory("doomed"), "alice")
                .unwrap(),
            "doomed"
        );
    }

    #[test]
    fn key_access_is_audited() {
        let registry = memory_registry();
        let name = registry
            .create_certificate("audited", &root_factory("audited"), "alice")
            .unwrap();

        let entry = registry.entry(&name).unwrap();
        let audit = entry.audit();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::CreateCertificate);
        assert_eq!(audit[0].user, "alice");
        assert_eq!(audit[0].details, "Local");

        entry.key("bob").unwrap().unwrap();

        let audit = entry.audit();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[1].action, AuditAction::AccessKey);
        assert_eq!(audit[1].user, "bob");
    }

    #[test]
    fn entries_snapshot_ignores_later_creates() {
        let registry = memory_registry();
        registry
            .create_certificate("first", &root_factory("first"), "alice")
            .unwrap();

        let mut entries = registry.entries().unwrap();
        registry
            .create_certificate("second", &root_factory("second"), "alice")
            .unwrap();

        let mut seen = Vec::new();
        while let Some(entry) = entries.next_entry().unwrap() {
            seen.push(entry.name().to_string());
        }
        assert_eq!(seen, vec!["first"]);
    }

    #[test]
    fn handle_observes_later_changes() {
        let registry = memory_registry();
        let name = registry
            .create_certificate("observed", &root_factory("observed"), "alice")
            .unwrap();
        let entry = registry.entry(&name).unwrap();

        assert!(entry.attributes().is_empty());
        let mut attributes = BTreeMap::new();
        attributes.insert("Key".to_string(), "Value".to_string());
        entry.set_attributes(attributes.clone(), "alice").unwrap();

        // The same handle sees the update.
        assert_eq!(entry.attributes(), attributes);
    }
}
