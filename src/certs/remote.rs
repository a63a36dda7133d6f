//! Certificate requests for remotely signed certificates.

use crate::certs::{
    CertificateRequest, CertificateRequestFactory, CertificateTemplate, CryptoError,
};
use crate::error::Error;
use crate::keys::{KeyPair, KeyPairFactory};

const REMOTE_FACTORY_NAME: &str = "Remote";

//------------ RemoteCertificateRequestFactory -------------------------------

/// Produces a fresh key pair and a CSR for it, to be signed elsewhere.
pub struct RemoteCertificateRequestFactory {
    template: CertificateTemplate,
    key_pair_factory: KeyPairFactory,
}

impl RemoteCertificateRequestFactory {
    pub fn new(template: CertificateTemplate, key_pair_factory: KeyPairFactory) -> Self {
        RemoteCertificateRequestFactory {
            template,
            key_pair_factory,
        }
    }
}

impl CertificateRequestFactory for RemoteCertificateRequestFactory {
    fn name(&self) -> &str {
        REMOTE_FACTORY_NAME
    }

    fn new_certificate_request(&self) -> Result<(KeyPair, CertificateRequest), Error> {
        info!("creating local X.509 certificate request...");

        let key_pair = self.key_pair_factory.new_key_pair()?;
        let params = self.template.to_params()?;
        let request = params
            .serialize_request(key_pair.rcgen())
            .map_err(|e| CryptoError::generation(e))?;

        let request = CertificateRequest::from_der(request.der().as_ref().to_vec())?;
        Ok((key_pair, request))
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyAlgorithm;

    #[test]
    fn request_matches_generated_key() {
        let factory = RemoteCertificateRequestFactory::new(
            CertificateTemplate::new("request1", 1),
            KeyAlgorithm::EcdsaP256.key_pair_factory(),
        );
        assert_eq!(factory.name(), "Remote");

        let (key, request) = factory.new_certificate_request().unwrap();
        assert!(request.subject().contains("request1"));
        assert!(key.public_key_matches(&request.public_key_der()));

        let pem = request.to_pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
    }
}
