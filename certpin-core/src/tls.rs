//! TLS building blocks: certificate loading, server identities and the
//! upstream client configuration.

use crate::error::ProxyError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, ring};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

const PEM_MARKER: &[u8] = b"-----BEGIN";

/// The crypto provider used by every TLS configuration in the proxy.
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Reads certificates from a PEM bundle, or a single raw DER certificate.
pub fn load_pem_or_der_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let bytes = fs::read(path).map_err(|e| {
        ProxyError::Certificate(format!("failed to read {}: {}", path.display(), e))
    })?;

    if !bytes.trim_ascii_start().starts_with(PEM_MARKER) {
        return Ok(vec![CertificateDer::from(bytes)]);
    }

    let certs = rustls_pemfile::certs(&mut BufReader::new(bytes.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            ProxyError::Certificate(format!("failed to parse {}: {}", path.display(), e))
        })?;
    if certs.is_empty() {
        return Err(ProxyError::Certificate(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Reads the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let bytes = fs::read(path).map_err(|e| {
        ProxyError::Certificate(format!("failed to read {}: {}", path.display(), e))
    })?;

    rustls_pemfile::private_key(&mut BufReader::new(bytes.as_slice()))
        .map_err(|e| ProxyError::Certificate(format!("failed to parse {}: {}", path.display(), e)))?
        .ok_or_else(|| {
            ProxyError::Certificate(format!("no private key found in {}", path.display()))
        })
}

/// Certificate chain and key presented to clients for one hostname,
/// compiled into a ready-to-use rustls server configuration.
#[derive(Clone)]
pub struct ServerIdentity {
    config: Arc<ServerConfig>,
}

impl ServerIdentity {
    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, ProxyError> {
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Certificate(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| ProxyError::Certificate(format!("invalid cert/key: {}", e)))?;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn from_files(cert: &Path, key: &Path) -> Result<Self, ProxyError> {
        Self::new(load_pem_or_der_certs(cert)?, load_private_key(key)?)
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity").finish_non_exhaustive()
    }
}

/// Client-side TLS configuration for upstream connections.
///
/// Chain and hostname validation are switched off: the upstream is trusted
/// only through the pin check that follows the handshake. Handshake
/// signatures are still verified against the presented certificate, so a
/// peer cannot present a certificate whose key it does not hold.
#[derive(Clone)]
pub struct UpstreamTls {
    connector: TlsConnector,
}

impl UpstreamTls {
    pub fn insecure() -> Result<Self, ProxyError> {
        let provider = provider();
        let verifier = Arc::new(AcceptAnyServerCert {
            provider: provider.clone(),
        });

        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Certificate(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }
}

impl std::fmt::Debug for UpstreamTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamTls").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Parses `host` into a rustls server name (DNS name or IP address).
pub fn server_name(host: &str) -> Result<ServerName<'static>, ProxyError> {
    ServerName::try_from(host.to_string())
        .map_err(|_| ProxyError::Config(format!("invalid server name {:?}", host)))
}
