//! Locally issued certificates and revocation lists.

use rustls_pki_types::CertificateDer;
use time::OffsetDateTime;

use crate::certs::{
    serial, Certificate, CertificateFactory, CertificateTemplate, CryptoError, RevocationList,
    RevocationListFactory,
};
use crate::error::Error;
use crate::keys::{KeyPair, KeyPairFactory};

const LOCAL_FACTORY_NAME: &str = "Local";

//------------ LocalCertificateFactory ---------------------------------------

/// Issues certificates by signing locally: self-signed when no parent is
/// given, signed by the parent's key otherwise.
///
/// Every issuance generates a fresh key pair and works on its own copy of
/// the template. Self-signed certificates get serial number 1; all others
/// draw from the process-wide serial generator.
pub struct LocalCertificateFactory {
    template: CertificateTemplate,
    key_pair_factory: KeyPairFactory,
    issuer: Option<(Certificate, KeyPair)>,
}

impl LocalCertificateFactory {
    /// Creates a factory for self-signed certificates.
    pub fn self_signed(template: CertificateTemplate, key_pair_factory: KeyPairFactory) -> Self {
        LocalCertificateFactory {
            template,
            key_pair_factory,
            issuer: None,
        }
    }

    /// Creates a factory for certificates signed by the given parent.
    pub fn signed_by(
        template: CertificateTemplate,
        key_pair_factory: KeyPairFactory,
        parent: Certificate,
        signer: KeyPair,
    ) -> Self {
        LocalCertificateFactory {
            template,
            key_pair_factory,
            issuer: Some((parent, signer)),
        }
    }
}

impl CertificateFactory for LocalCertificateFactory {
    fn name(&self) -> &str {
        LOCAL_FACTORY_NAME
    }

    fn new_certificate(&self) -> Result<(KeyPair, Certificate), Error> {
        let key_pair = self.key_pair_factory.new_key_pair()?;
        let mut params = self.template.to_params()?;

        let certificate = match &self.issuer {
            Some((parent, signer)) => {
                info!("creating signed local X.509 certificate...");
                params.serial_number = Some(rcgen::SerialNumber::from(serial::next()));
                let parent_der = CertificateDer::from(parent.as_der());
                let issuer = rcgen::Issuer::from_ca_cert_der(&parent_der, signer.rcgen())
                    .map_err(|e| CryptoError::parse(e))?;
                params
                    .signed_by(key_pair.rcgen(), &issuer)
                    .map_err(|e| CryptoError::generation(e))?
            }
            None => {
                info!("creating self-signed local X.509 certificate...");
                params.serial_number = Some(rcgen::SerialNumber::from(vec![1u8]));
                params
                    .self_signed(key_pair.rcgen())
                    .map_err(|e| CryptoError::generation(e))?
            }
        };

        // Parse the encoding back so downstream consumers always hold a
        // validated certificate.
        let certificate = Certificate::from_der(certificate.der().as_ref().to_vec())?;
        Ok((key_pair, certificate))
    }
}

//------------ RevocationListTemplate ----------------------------------------

/// The caller-provided shape of a revocation list.
#[derive(Clone, Debug)]
pub struct RevocationListTemplate {
    pub number: u64,
    pub this_update: OffsetDateTime,
    pub next_update: OffsetDateTime,
    pub revoked: Vec<RevokedCertificate>,
}

impl RevocationListTemplate {
    /// An empty revocation list valid from now for the given number of days.
    pub fn new(number: u64, valid_days: i64) -> Self {
        let now = OffsetDateTime::now_utc();
        RevocationListTemplate {
            number,
            this_update: now,
            next_update: now + time::Duration::days(valid_days),
            revoked: Vec::new(),
        }
    }
}

/// One revoked certificate within a revocation list.
#[derive(Clone, Debug)]
pub struct RevokedCertificate {
    pub serial_number: u64,
    pub revocation_time: OffsetDateTime,
}

//------------ LocalRevocationListFactory ------------------------------------

/// Issues revocation lists signed by the entry's own certificate.
///
/// The issuing certificate and signer key are supplied by the registry at
/// reset time, so one template can serve any CRL-sign capable entry.
pub struct LocalRevocationListFactory {
    template: RevocationListTemplate,
}

impl LocalRevocationListFactory {
    pub fn new(template: RevocationListTemplate) -> Self {
        LocalRevocationListFactory { template }
    }
}

impl RevocationListFactory for LocalRevocationListFactory {
    fn name(&self) -> &str {
        LOCAL_FACTORY_NAME
    }

    fn new_revocation_list(
        &self,
        issuer: &Certificate,
        signer: &KeyPair,
    ) -> Result<RevocationList, Error> {
        info!("creating local X.509 revocation list...");

        let params = rcgen::CertificateRevocationListParams {
            this_update: self.template.this_update,
            next_update: self.template.next_update,
            crl_number: rcgen::SerialNumber::from(self.template.number),
            issuing_distribution_point: None,
            revoked_certs: self
                .template
                .revoked
                .iter()
                .map(|revoked| rcgen::RevokedCertParams {
                    serial_number: rcgen::SerialNumber::from(revoked.serial_number),
                    revocation_time: revoked.revocation_time,
                    reason_code: None,
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: rcgen::KeyIdMethod::Sha256,
        };

        let issuer_der = CertificateDer::from(issuer.as_der());
        let issuer = rcgen::Issuer::from_ca_cert_der(&issuer_der, signer.rcgen())
            .map_err(|e| CryptoError::parse(e))?;

        let revocation_list = params
            .signed_by(&issuer)
            .map_err(|e| CryptoError::generation(e))?;

        RevocationList::from_der(revocation_list.der().as_ref().to_vec())
    }
}

//------------ Tests ---------------------------------------------------------
