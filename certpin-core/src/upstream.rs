//! Upstream connector: TCP dial, TLS client handshake, pin check.

use crate::error::ProxyError;
use crate::pin::{self, PinnedCertificate};
use crate::routes::Upstream;
use crate::tls::UpstreamTls;
use rustls::pki_types::ServerName;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tracing::{debug, error};

/// An upstream stream whose certificate passed the pin check.
pub type AuthenticatedStream = TlsStream<TcpStream>;

/// Opens pinned TLS connections. One attempt per call; no retries.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    tls: UpstreamTls,
    connect_timeout: Option<Duration>,
    handshake_timeout: Option<Duration>,
}

impl UpstreamConnector {
    pub fn new(tls: UpstreamTls) -> Self {
        Self {
            tls,
            connect_timeout: None,
            handshake_timeout: None,
        }
    }

    pub fn with_connect_timeout(mut self, limit: Option<Duration>) -> Self {
        self.connect_timeout = limit;
        self
    }

    pub fn with_handshake_timeout(mut self, limit: Option<Duration>) -> Self {
        self.handshake_timeout = limit;
        self
    }

    /// Connects to the upstream of a route.
    pub async fn connect_upstream(
        &self,
        upstream: &Upstream,
    ) -> Result<AuthenticatedStream, ProxyError> {
        self.connect(&upstream.address, upstream.sni.clone(), upstream.pin.as_ref())
            .await
    }

    /// Dials `address`, handshakes presenting `sni` and checks the leaf
    /// certificate against `pin`.
    ///
    /// On [`ProxyError::PinMismatch`] the upstream connection has already
    /// been closed.
    pub async fn connect(
        &self,
        address: &str,
        sni: ServerName<'static>,
        pin: Option<&PinnedCertificate>,
    ) -> Result<AuthenticatedStream, ProxyError> {
        debug!(upstream = address, "Connecting to upstream");
        let tcp = bounded(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|source| ProxyError::Connect {
                upstream: address.to_string(),
                source,
            })?;
        let _ = tcp.set_nodelay(true);

        let mut stream = bounded(self.handshake_timeout, self.tls.connector().connect(sni, tcp))
            .await
            .map_err(|e| ProxyError::handshake(address, e))?;

        let peer = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(|leaf| leaf.as_ref().to_vec());

        let accepted = match (&peer, pin) {
            (Some(leaf), pin) => pin::verify(leaf, pin.map(PinnedCertificate::as_bytes)),
            (None, None) => true,
            (None, Some(_)) => false,
        };

        if !accepted {
            let expected = pin.map(PinnedCertificate::fingerprint).unwrap_or_default();
            let actual = peer
                .as_deref()
                .map(pin::fingerprint)
                .unwrap_or_else(|| "none".to_string());
            error!(
                event = "pin_mismatch",
                upstream = address,
                expected = %expected,
                actual = %actual,
                "CERTIFICATE MISMATCH - closing upstream connection"
            );
            let _ = stream.shutdown().await;
            drop(stream);
            return Err(ProxyError::PinMismatch {
                upstream: address.to_string(),
                expected,
                actual,
            });
        }

        debug!(
            upstream = address,
            pinned = pin.is_some(),
            "Upstream certificate accepted"
        );
        Ok(stream)
    }
}

/// Runs an I/O future under an optional deadline.
pub(crate) async fn bounded<T, F>(limit: Option<Duration>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => timeout(limit, fut)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "operation timed out"))?,
        None => fut.await,
    }
}
