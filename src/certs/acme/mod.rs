//! ACME issued certificates.
//!
//! The ACME protocol itself (account registration, challenge solving,
//! order handling) lives behind the [`AcmeSession`] capability; this
//! module owns what surrounds it: provider configuration, durable account
//! registrations and the certificate factory gluing both to the registry.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::certs::{Certificate, CertificateFactory};
use crate::error::Error;
use crate::keys::{KeyPair, KeyPairFactory};

pub use self::registration::ProviderRegistration;

pub mod registration;

/// Environment variable naming extra PEM bundles the ACME client trusts
/// when talking to test CAs. Entries are separated by `:` or `;`.
pub const CA_CERTIFICATES_ENV: &str = "LEGO_CA_CERTIFICATES";

/// The PEM bundle paths configured through [`CA_CERTIFICATES_ENV`].
pub fn trusted_ca_bundle_paths() -> Vec<PathBuf> {
    match env::var(CA_CERTIFICATES_ENV) {
        Ok(value) => value
            .split([':', ';'])
            .filter(|part| !part.is_empty())
            .map(PathBuf::from)
            .collect(),
        Err(_) => Vec::new(),
    }
}

//------------ ProviderConfig ------------------------------------------------

/// The configuration of one ACME provider.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProviderConfig {
    pub name: String,
    pub url: String,
    pub registration_email: String,
    /// The file keeping this provider's account registrations.
    pub registration_path: PathBuf,
}

//------------ AcmeCertificateRequest ----------------------------------------

/// A resolved certificate request: the provider to ask plus the DNS names
/// the certificate must cover.
#[derive(Clone, Debug)]
pub struct AcmeCertificateRequest {
    pub provider: ProviderConfig,
    pub domains: Vec<String>,
}

impl AcmeCertificateRequest {
    pub fn new(provider: ProviderConfig, domains: Vec<String>) -> Self {
        AcmeCertificateRequest { provider, domains }
    }
}

//------------ AcmeSession ---------------------------------------------------

/// The capability executing the ACME protocol against a provider.
///
/// Implementations handle account registration and challenge solving;
/// the registry core never speaks the protocol itself.
pub trait AcmeSession: Send + Sync {
    /// Registers an account for the provider, agreeing to its terms of
    /// service, and returns the provider's registration resource.
    fn register_account(
        &self,
        provider: &ProviderConfig,
        account_key: &KeyPair,
    ) -> Result<serde_json::Value, Error>;

    /// Obtains a certificate chain for the request, leaf first.
    fn obtain_certificate(
        &self,
        request: &AcmeCertificateRequest,
        registration: &ProviderRegistration,
        certificate_key: &KeyPair,
    ) -> Result<Vec<Certificate>, Error>;
}

//------------ AcmeCertificateFactory ----------------------------------------

/// Issues certificates through an ACME provider.
///
/// The factory makes sure an account registration exists for the
/// provider (creating and persisting one on first use), generates a fresh
/// certificate key and asks the session for the certificate. Only the
/// leaf is returned; chain reconstruction is the registry's job at read
/// time.
pub struct AcmeCertificateFactory {
    name: String,
    request: AcmeCertificateRequest,
    key_pair_factory: KeyPairFactory,
    session: Arc<dyn AcmeSession>,
}

impl AcmeCertificateFactory {
    pub fn new(
        request: AcmeCertificateRequest,
        key_pair_factory: KeyPairFactory,
        session: Arc<dyn AcmeSession>,
    ) -> Self {
        AcmeCertificateFactory {
            name: format!("ACME[{}]", request.provider.name),
            request,
            key_pair_factory,
            session,
        }
    }

    fn ensure_registration(&self) -> Result<ProviderRegistration, Error> {
        let provider = &self.request.provider;
        registration::ensure(
            &provider.registration_path,
            &provider.name,
            &provider.registration_email,
            || {
                info!(
                    "registering at ACME provider '{}' as '{}'...",
                    provider.name, provider.registration_email
                );
                let account_key = self.key_pair_factory.new_key_pair()?;
                let resource = self.session.register_account(provider, &account_key)?;
                Ok(ProviderRegistration::new(
                    &provider.name,
                    &provider.registration_email,
                    &account_key,
                    resource,
                ))
            },
        )
    }
}

impl CertificateFactory for AcmeCertificateFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_certificate(&self) -> Result<(KeyPair, Certificate), Error> {
        let provider = &self.request.provider;
        info!(
            "obtaining X.509 certificate from ACME provider '{}'...",
            provider.name
        );

        let registration = self.ensure_registration()?;
        let certificate_key = self.key_pair_factory.new_key_pair()?;
        let chain = self
            .session
            .obtain_certificate(&self.request, &registration, &certificate_key)?;

        let leaf = chain.into_iter().next().ok_or_else(|| {
            Error::protocol(format!(
                "ACME provider '{}' returned an empty certificate chain",
                provider.name
            ))
        })?;
        if !certificate_key.public_key_matches(&leaf.public_key_der()) {
            return Err(Error::integrity(
                "ACME certificate does not match the requested key",
            ));
        }

        Ok((certificate_key, leaf))
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::certs::{CertificateTemplate, KeyUsage, LocalCertificateFactory};
    use crate::keys::KeyAlgorithm;

    /// A session that issues from a throwaway local CA instead of talking
    /// to a provider.
    struct StubSession {
        registrations: AtomicUsize,
    }

    impl StubSession {
        fn new() -> Self {
            StubSession {
                registrations: AtomicUsize::new(0),
            }
        }
    }

    impl AcmeSession for StubSession {
        fn register_account(
            &self,
            provider: &ProviderConfig,
            _account_key: &KeyPair,
        ) -> Result<serde_json::Value, Error> {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({ "provider": provider.name, "status": "valid" }))
        }

        fn obtain_certificate(
            &self,
            request: &AcmeCertificateRequest,
            _registration: &ProviderRegistration,
            certificate_key: &KeyPair,
        ) -> Result<Vec<Certificate>, Error> {
            // Sign the requested names with a fresh CA and re-issue for
            // the caller's key by handing back a parent-signed cert.
            let mut ca_template = CertificateTemplate::new("Stub ACME CA", 1);
            ca_template.is_ca = true;
            ca_template.key_usages = vec![KeyUsage::CertSign];
            let (ca_key, ca_cert) = LocalCertificateFactory::self_signed(
                ca_template,
                KeyAlgorithm::EcdsaP256.key_pair_factory(),
            )
            .new_certificate()?;

            let mut template = CertificateTemplate::new(&request.domains[0], 1);
            template.dns_names = request.domains.clone();
            let mut params = template.to_params()?;
            params.serial_number = Some(rcgen::SerialNumber::from(crate::certs::serial::next()));
            let ca_der = rustls_pki_types::CertificateDer::from(ca_cert.as_der());
            let issuer = rcgen::Issuer::from_ca_cert_der(&ca_der, ca_key.rcgen())
                .map_err(|e| crate::certs::CryptoError::parse(e))?;
            let leaf = params
                .signed_by(certificate_key.rcgen(), &issuer)
                .map_err(|e| crate::certs::CryptoError::generation(e))?;

            let leaf = Certificate::from_der(leaf.der().as_ref().to_vec())?;
            Ok(vec![leaf, ca_cert.clone()])
        }
    }

    fn test_provider(dir: &std::path::Path, name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            url: "https://acme.example/directory".to_string(),
            registration_email: "ops@example.com".to_string(),
            registration_path: dir.join("registrations.json"),
        }
    }

    #[test]
    fn factory_registers_once_and_issues() {
        let dir = tempfile::tempdir().unwrap();
        let provider = test_provider(dir.path(), "Test1");
        let session = Arc::new(StubSession::new());

        let request =
            AcmeCertificateRequest::new(provider.clone(), vec!["host.example.com".to_string()]);
        let factory = AcmeCertificateFactory::new(
            request,
            KeyAlgorithm::EcdsaP256.key_pair_factory(),
            session.clone(),
        );
        assert_eq!(factory.name(), "ACME[Test1]");

        let (key, cert) = factory.new_certificate().unwrap();
        assert!(key.public_key_matches(&cert.public_key_der()));
        assert_eq!(session.registrations.load(Ordering::SeqCst), 1);

        // A second issuance reuses the persisted registration.
        let (_, _) = factory.new_certificate().unwrap();
        assert_eq!(session.registrations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registrations_are_kept_per_provider() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(StubSession::new());

        for name in ["Test1", "Test2"] {
            let request = AcmeCertificateRequest::new(
                test_provider(dir.path(), name),
                vec!["host.example.com".to_string()],
            );
            let factory = AcmeCertificateFactory::new(
                request,
                KeyAlgorithm::EcdsaP256.key_pair_factory(),
                session.clone(),
            );
            factory.new_certificate().unwrap();
        }

        assert_eq!(session.registrations.load(Ordering::SeqCst), 2);
        let registrations =
            registration::read_all(&dir.path().join("registrations.json")).unwrap();
        assert_eq!(registrations.len(), 2);
    }

    #[test]
    fn trusted_bundles_split_on_both_separators() {
        env::set_var(CA_CERTIFICATES_ENV, "/a/one.pem:/b/two.pem;/c/three.pem");
        let paths = trusted_ca_bundle_paths();
        env::remove_var(CA_CERTIFICATES_ENV);

        assert_eq!(
            paths,
            vec![
                PathBuf::from("/a/one.pem"),
                PathBuf::from("/b/two.pem"),
                PathBuf::from("/c/three.pem"),
            ]
        );
    }
}
