//! SKI computation.

use sha1::{Digest, Sha1};
use tokio_rustls::rustls::pki_types::CertificateDer;
use x509_parser::prelude::X509Certificate;

use crate::{error::ShipError, types::Ski};

/// Computes the SKI of a certificate: the SHA-1 over the DER encoded
/// SubjectPublicKeyInfo.
pub fn ski_from_certificate(cert: &CertificateDer<'_>) -> Result<Ski, ShipError> {
    use x509_parser::prelude::FromDer;

    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|_| ShipError::Certificate("certificate is not valid DER"))?;

    let spki = parsed.tbs_certificate.subject_pki.raw;
    let digest: [u8; 20] = Sha1::digest(spki).into();

    Ok(Ski::from_digest(digest))
}

#[cfg(test)]
mod tests {
    use tokio_rustls::rustls::pki_types::CertificateDer;

    use super::*;

    fn generated_cert() -> CertificateDer<'static> {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let cert = rcgen::CertificateParams::new(vec!["hearth.test".to_owned()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        cert.der().clone()
    }

    #[test]
    fn ski_is_stable_for_one_certificate() {
        let cert = generated_cert();

        let first = ski_from_certificate(&cert).unwrap();
        let second = ski_from_certificate(&cert).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), 40);
        assert!(first.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_keys_get_different_skis() {
        let first = ski_from_certificate(&generated_cert()).unwrap();
        let second = ski_from_certificate(&generated_cert()).unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn garbage_is_rejected() {
        let cert = CertificateDer::from(vec![0x30, 0x00]);
        assert!(ski_from_certificate(&cert).is_err());
    }
}
