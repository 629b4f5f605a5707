//! Pinned certificate verification
//!
//! Trust is an exact byte comparison between the DER certificate the upstream
//! presented and the DER certificate on file. No chain, name or expiry checks.

use crate::error::ProxyError;
use crate::tls::load_pem_or_der_certs;
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Decides whether `peer` is acceptable under `pin`.
///
/// Without a pin every certificate is accepted.
#[inline]
pub fn verify(peer: &[u8], pin: Option<&[u8]>) -> bool {
    match pin {
        None => true,
        Some(pin) => peer == pin,
    }
}

/// Formats the SHA-256 fingerprint of a DER certificate as `sha256:<hex>`.
pub fn fingerprint(der: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(der)))
}

/// A certificate the upstream must present verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedCertificate {
    der: CertificateDer<'static>,
}

impl PinnedCertificate {
    pub fn from_der(der: impl Into<Vec<u8>>) -> Self {
        Self {
            der: CertificateDer::from(der.into()),
        }
    }

    /// Loads the pin from a PEM or raw DER file. For PEM the first
    /// certificate in the file is the pin.
    pub fn from_file(path: &Path) -> Result<Self, ProxyError> {
        let der = load_pem_or_der_certs(path)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ProxyError::Certificate(format!("no certificate found in {}", path.display()))
            })?;
        Ok(Self { der })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.der.as_ref()
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(self.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_pin_accepts_anything() {
        assert!(verify(b"", None));
        assert!(verify(b"any certificate", None));
    }

    #[test]
    fn test_pin_is_exact_byte_equality() {
        let cases: &[(&[u8], &[u8])] = &[
            (b"cert-a", b"cert-a"),
            (b"cert-a", b"cert-b"),
            (b"cert-a", b"cert-a\0"),
            (b"", b""),
            (b"", b"x"),
            (&[0x30, 0x82, 0x01], &[0x30, 0x82, 0x01]),
        ];
        for (cert, pin) in cases {
            assert_eq!(verify(cert, Some(*pin)), cert == pin, "{cert:?} vs {pin:?}");
        }
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(b"abc");
        assert_eq!(
            fp,
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_pinned_certificate_from_der() {
        let pin = PinnedCertificate::from_der(vec![1u8, 2, 3]);
        assert_eq!(pin.as_bytes(), &[1, 2, 3]);
        assert!(verify(&[1, 2, 3], Some(pin.as_bytes())));
        assert_eq!(pin.fingerprint(), fingerprint(&[1, 2, 3]));
    }
}
