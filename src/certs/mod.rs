//! Certificates, requests, revocation lists and the factories that
//! produce them.
//!
//! Artifacts are kept in their DER encoding and parsed on demand for
//! inspection; building happens in the factory implementations. The
//! registry only ever talks to the [`CertificateFactory`],
//! [`CertificateRequestFactory`] and [`RevocationListFactory`]
//! capabilities.

use std::fmt;
use std::fs;
use std::path::Path;

use ::time::OffsetDateTime;
use x509_parser::prelude::*;

use crate::error::Error;
use crate::keys::KeyPair;

pub use self::acme::{AcmeCertificateFactory, AcmeCertificateRequest, AcmeSession, ProviderConfig};
pub use self::local::{
    LocalCertificateFactory, LocalRevocationListFactory, RevocationListTemplate,
    RevokedCertificate,
};
pub use self::remote::RemoteCertificateRequestFactory;

pub mod acme;
pub mod local;
pub mod remote;
pub mod serial;

// Deep chains are almost certainly cyclic pool contents.
const MAX_CHAIN_LEN: usize = 8;

//------------ CryptoError ---------------------------------------------------

/// This type defines possible errors for key and certificate handling.
#[derive(Debug)]
pub enum CryptoError {
    KeyGeneration(String),
    KeyParse(String),
    CertificateGeneration(String),
    Parse(String),
    Verification(String),
}

impl CryptoError {
    pub fn key_generation(e: impl fmt::Display) -> Self {
        CryptoError::KeyGeneration(e.to_string())
    }

    pub fn key_parse(e: impl fmt::Display) -> Self {
        CryptoError::KeyParse(e.to_string())
    }

    pub fn generation(e: impl fmt::Display) -> Self {
        CryptoError::CertificateGeneration(e.to_string())
    }

    pub fn parse(e: impl fmt::Display) -> Self {
        CryptoError::Parse(e.to_string())
    }

    pub fn verification(e: impl fmt::Display) -> Self {
        CryptoError::Verification(e.to_string())
    }
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::KeyGeneration(e) => write!(f, "key generation failed: {}", e),
            CryptoError::KeyParse(e) => write!(f, "cannot parse key: {}", e),
            CryptoError::CertificateGeneration(e) => write!(f, "certificate generation failed: {}", e),
            CryptoError::Parse(e) => write!(f, "cannot parse artifact: {}", e),
            CryptoError::Verification(e) => write!(f, "verification failed: {}", e),
        }
    }
}

impl std::error::Error for CryptoError {}

//------------ KeyUsage ------------------------------------------------------

/// X.509 key usage bits relevant to the registry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyUsage {
    DigitalSignature,
    ContentCommitment,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    CertSign,
    CrlSign,
}

/// Extended key usages supported by the certificate template.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExtendedKeyUsage {
    ServerAuth,
    ClientAuth,
}

//------------ CertificateTemplate -------------------------------------------

/// The caller-provided shape of a certificate to issue.
///
/// Serial numbers are deliberately absent; the issuing factory assigns
/// them (1 for self-signed roots, a fresh random serial otherwise), so a
/// template can back any number of issuances without aliasing state
/// between them.
#[derive(Clone, Debug)]
pub struct CertificateTemplate {
    pub common_name: String,
    pub organization: Option<String>,
    pub dns_names: Vec<String>,
    pub is_ca: bool,
    pub max_path_len: Option<u32>,
    pub key_usages: Vec<KeyUsage>,
    pub extended_key_usages: Vec<ExtendedKeyUsage>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

impl CertificateTemplate {
    /// A leaf template valid from now for the given number of days.
    pub fn new(common_name: &str, valid_days: i64) -> Self {
        let now = OffsetDateTime::now_utc();
        CertificateTemplate {
            common_name: common_name.to_string(),
            organization: None,
            dns_names: Vec::new(),
            is_ca: false,
            max_path_len: None,
            key_usages: Vec::new(),
            extended_key_usages: Vec::new(),
            not_before: now,
            not_after: now + ::time::Duration::days(valid_days),
        }
    }

    pub(crate) fn to_params(&self) -> Result<rcgen::CertificateParams, Error> {
        let mut params = rcgen::CertificateParams::default();

        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, self.common_name.as_str());
        if let Some(organization) = &self.organization {
            dn.push(rcgen::DnType::OrganizationName, organization.as_str());
        }
        params.distinguished_name = dn;

        params.is_ca = if self.is_ca {
            match self.max_path_len {
                Some(depth) => rcgen::IsCa::Ca(rcgen::BasicConstraints::Constrained(depth as u8)),
                None => rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained),
            }
        } else {
            rcgen::IsCa::NoCa
        };

        params.key_usages = self
            .key_usages
            .iter()
            .map(|usage| match usage {
                KeyUsage::DigitalSignature => rcgen::KeyUsagePurpose::DigitalSignature,
                KeyUsage::ContentCommitment => rcgen::KeyUsagePurpose::ContentCommitment,
                KeyUsage::KeyEncipherment => rcgen::KeyUsagePurpose::KeyEncipherment,
                KeyUsage::DataEncipherment => rcgen::KeyUsagePurpose::DataEncipherment,
                KeyUsage::KeyAgreement => rcgen::KeyUsagePurpose::KeyAgreement,
                KeyUsage::CertSign => rcgen::KeyUsagePurpose::KeyCertSign,
                KeyUsage::CrlSign => rcgen::KeyUsagePurpose::CrlSign,
            })
            .collect();

        params.extended_key_usages = self
            .extended_key_usages
            .iter()
            .map(|usage| match usage {
                ExtendedKeyUsage::ServerAuth => rcgen::ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsage::ClientAuth => rcgen::ExtendedKeyUsagePurpose::ClientAuth,
            })
            .collect();

        params.subject_alt_names = self
            .dns_names
            .iter()
            .map(|name| {
                rcgen::string::Ia5String::try_from(name.clone())
                    .map(rcgen::SanType::DnsName)
                    .map_err(|e| {
                        Error::invalid_input(format!("invalid DNS name '{}': {}", name, e))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        params.not_before = self.not_before;
        params.not_after = self.not_after;

        Ok(params)
    }
}

//------------ Certificate ---------------------------------------------------

/// An X.509 certificate, kept in DER encoding.
#[derive(Clone, Eq, PartialEq)]
pub struct Certificate {
    der: Vec<u8>,
}

impl Certificate {
    /// Wraps a DER encoded certificate, validating that it parses.
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self, Error> {
        let der = der.into();
        parse_x509_certificate(&der).map_err(|e| CryptoError::parse(e))?;
        Ok(Certificate { der })
    }

    pub fn from_pem(pem: &str) -> Result<Self, Error> {
        let parsed = ::pem::parse(pem).map_err(|e| CryptoError::parse(e))?;
        Self::from_der(parsed.contents().to_vec())
    }

    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    pub fn to_pem(&self) -> String {
        ::pem::encode(&::pem::Pem::new("CERTIFICATE", self.der.clone()))
    }

    fn parsed(&self) -> X509Certificate<'_> {
        // The encoding was validated in `from_der`.
        parse_x509_certificate(&self.der)
            .map(|(_, cert)| cert)
            .unwrap_or_else(|_| unreachable!("certificate was validated on construction"))
    }

    /// The subject distinguished name, rendered for display.
    pub fn subject(&self) -> String {
        self.parsed().subject().to_string()
    }

    /// The issuer distinguished name, rendered for display.
    pub fn issuer(&self) -> String {
        self.parsed().issuer().to_string()
    }

    /// The DER encoded SubjectPublicKeyInfo.
    pub fn public_key_der(&self) -> Vec<u8> {
        self.parsed().public_key().raw.to_vec()
    }

    pub fn serial_number(&self) -> String {
        self.parsed().raw_serial_as_string()
    }

    pub fn not_after_timestamp(&self) -> i64 {
        self.parsed().validity().not_after.timestamp()
    }

    /// Whether the basic constraints extension asserts CA.
    pub fn is_ca(&self) -> bool {
        self.parsed()
            .basic_constraints()
            .ok()
            .flatten()
            .map(|bc| bc.value.ca)
            .unwrap_or(false)
    }

    /// Whether the given key usage bit is asserted.
    pub fn has_key_usage(&self, usage: KeyUsage) -> bool {
        let cert = self.parsed();
        let key_usage = match cert.key_usage() {
            Ok(Some(ext)) => ext.value,
            _ => return false,
        };
        match usage {
            KeyUsage::DigitalSignature => key_usage.digital_signature(),
            KeyUsage::ContentCommitment => key_usage.non_repudiation(),
            KeyUsage::KeyEncipherment => key_usage.key_encipherment(),
            KeyUsage::DataEncipherment => key_usage.data_encipherment(),
            KeyUsage::KeyAgreement => key_usage.key_agreement(),
            KeyUsage::CertSign => key_usage.key_cert_sign(),
            KeyUsage::CrlSign => key_usage.crl_sign(),
        }
    }

    /// Whether subject equals issuer and the signature verifies under the
    /// certificate's own public key.
    pub fn is_self_signed(&self) -> bool {
        let cert = self.parsed();
        cert.subject().as_raw() == cert.issuer().as_raw()
            && cert.verify_signature(None).is_ok()
    }

    /// Whether this certificate names the issuer as its issuer and its
    /// signature verifies under the issuer's public key.
    pub fn is_issued_by(&self, issuer: &Certificate) -> bool {
        let cert = self.parsed();
        let issuer_cert = issuer.parsed();
        cert.issuer().as_raw() == issuer_cert.subject().as_raw()
            && cert.verify_signature(Some(issuer_cert.public_key())).is_ok()
    }

    /// Builds all verified chains from this certificate to a root in
    /// `roots`, using `intermediates` for the inner links.
    ///
    /// Each chain starts at this certificate and ends at a root; a root
    /// certificate verifies to a single chain of length one.
    pub fn verify(
        &self,
        roots: &CertPool,
        intermediates: &CertPool,
    ) -> Result<Vec<Vec<Certificate>>, Error> {
        let mut chains = Vec::new();
        let mut path = vec![self.clone()];
        extend_chains(self, roots, intermediates, &mut path, &mut chains);
        if chains.is_empty() {
            Err(CryptoError::verification(format!(
                "no trusted chain for certificate '{}'",
                self.subject()
            ))
            .into())
        } else {
            Ok(chains)
        }
    }
}

fn extend_chains(
    current: &Certificate,
    roots: &CertPool,
    intermediates: &CertPool,
    path: &mut Vec<Certificate>,
    chains: &mut Vec<Vec<Certificate>>,
) {
    if roots.contains(current) {
        chains.push(path.clone());
    }
    if path.len() >= MAX_CHAIN_LEN {
        return;
    }
    for candidate in intermediates.iter().chain(roots.iter()) {
        if candidate == current || path.contains(candidate) {
            continue;
        }
        if current.is_issued_by(candidate) {
            path.push(candidate.clone());
            extend_chains(candidate, roots, intermediates, path, chains);
            path.pop();
        }
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Certificate({})", self.subject())
    }
}

//------------ CertificateRequest --------------------------------------------

/// An X.509 certificate signing request, kept in DER encoding.
#[derive(Clone, Eq, PartialEq)]
pub struct CertificateRequest {
    der: Vec<u8>,
}

impl CertificateRequest {
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self, Error> {
        let der = der.into();
        X509CertificationRequest::from_der(&der).map_err(|e| CryptoError::parse(e))?;
        Ok(CertificateRequest { der })
    }

    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    pub fn to_pem(&self) -> String {
        ::pem::encode(&::pem::Pem::new("CERTIFICATE REQUEST", self.der.clone()))
    }

    fn parsed(&self) -> X509CertificationRequest<'_> {
        X509CertificationRequest::from_der(&self.der)
            .map(|(_, csr)| csr)
            .unwrap_or_else(|_| unreachable!("request was validated on construction"))
    }

    pub fn subject(&self) -> String {
        self.parsed().certification_request_info.subject.to_string()
    }

    /// The DER encoded SubjectPublicKeyInfo.
    pub fn public_key_der(&self) -> Vec<u8> {
        self.parsed()
            .certification_request_info
            .subject_pki
            .raw
            .to_vec()
    }
}

impl fmt::Debug for CertificateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertificateRequest({})", self.subject())
    }
}

//------------ RevocationList ------------------------------------------------

/// An X.509 certificate revocation list, kept in DER encoding.
#[derive(Clone, Eq, PartialEq)]
pub struct RevocationList {
    der: Vec<u8>,
}

impl RevocationList {
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self, Error> {
        let der = der.into();
        parse_x509_crl(&der).map_err(|e| CryptoError::parse(e))?;
        Ok(RevocationList { der })
    }

    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    pub fn to_pem(&self) -> String {
        ::pem::encode(&::pem::Pem::new("X509 CRL", self.der.clone()))
    }

    fn parsed(&self) -> CertificateRevocationList<'_> {
        parse_x509_crl(&self.der)
            .map(|(_, crl)| crl)
            .unwrap_or_else(|_| unreachable!("revocation list was validated on construction"))
    }

    pub fn issuer(&self) -> String {
        self.parsed().issuer().to_string()
    }

    pub fn revoked_count(&self) -> usize {
        self.parsed().iter_revoked_certificates().count()
    }

    /// Whether the signature verifies under the issuer's public key.
    pub fn verifies_under(&self, issuer: &Certificate) -> bool {
        let crl = self.parsed();
        let issuer_cert = issuer.parsed();
        crl.verify_signature(issuer_cert.public_key()).is_ok()
    }
}

impl fmt::Debug for RevocationList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevocationList({})", self.issuer())
    }
}

//------------ CertPool ------------------------------------------------------

/// A set of certificates used to anchor or extend a verification chain.
#[derive(Clone, Debug, Default)]
pub struct CertPool {
    certs: Vec<Certificate>,
}

impl CertPool {
    pub fn new() -> Self {
        CertPool::default()
    }

    /// Adds a certificate unless an identical one is already present.
    pub fn add(&mut self, cert: Certificate) {
        if !self.contains(&cert) {
            self.certs.push(cert);
        }
    }

    pub fn contains(&self, cert: &Certificate) -> bool {
        self.certs.iter().any(|c| c == cert)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Certificate> {
        self.certs.iter()
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }
}

//------------ Factory capabilities ------------------------------------------

/// A capability producing a fresh private key and certificate.
pub trait CertificateFactory {
    /// The factory name, surfaced in logs and audit details.
    fn name(&self) -> &str;

    /// Produces the key pair and certificate of a new entry.
    fn new_certificate(&self) -> Result<(KeyPair, Certificate), Error>;
}

/// A capability producing a fresh private key and certificate request.
pub trait CertificateRequestFactory {
    fn name(&self) -> &str;

    fn new_certificate_request(&self) -> Result<(KeyPair, CertificateRequest), Error>;
}

/// A capability producing a revocation list for an issuing certificate.
pub trait RevocationListFactory {
    fn name(&self) -> &str;

    /// Produces a revocation list signed by the given issuer.
    fn new_revocation_list(
        &self,
        issuer: &Certificate,
        signer: &KeyPair,
    ) -> Result<RevocationList, Error>;
}

//------------ PEM bundle I/O ------------------------------------------------

/// Writes certificates as a PEM bundle.
pub fn write_certificates(path: impl AsRef<Path>, certs: &[Certificate]) -> Result<(), Error> {
    let bundle: String = certs.iter().map(Certificate::to_pem).collect();
    fs::write(path.as_ref(), bundle.as_bytes()).map_err(|e| {
        Error::protocol(format!(
            "cannot write certificate bundle {}: {}",
            path.as_ref().display(),
            e
        ))
    })
}

/// Reads all certificates from a PEM bundle.
pub fn read_certificates(path: impl AsRef<Path>) -> Result<Vec<Certificate>, Error> {
    let bytes = fs::read(path.as_ref()).map_err(|e| {
        Error::protocol(format!(
            "cannot read certificate bundle {}: {}",
            path.as_ref().display(),
            e
        ))
    })?;
    ::pem::parse_many(&bytes)
        .map_err(|e| CryptoError::parse(e).into())
        .and_then(|pems| {
            pems.into_iter()
                .filter(|p| p.tag() == "CERTIFICATE")
                .map(|p| Certificate::from_der(p.contents().to_vec()))
                .collect()
        })
}

//------------ Tests ---------------------------------------------------------
