//! SNI terminator: picks the server certificate from the ClientHello.
//!
//! The ClientHello is read before any certificate is committed to. Its
//! server name is looked up in the route table; the matching route's server
//! configuration completes the handshake. No match means no handshake.

use crate::error::ProxyError;
use crate::routes::{Route, SharedRouteTable};
use rustls::server::Acceptor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::LazyConfigAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, warn};

/// A client connection whose handshake completed for a known route.
pub struct Terminated {
    pub stream: TlsStream<TcpStream>,
    pub route: Arc<Route>,
}

#[derive(Debug, Clone)]
pub struct SniTerminator {
    routes: SharedRouteTable,
    handshake_timeout: Option<Duration>,
}

impl SniTerminator {
    pub fn new(routes: SharedRouteTable) -> Self {
        Self {
            routes,
            handshake_timeout: None,
        }
    }

    pub fn with_handshake_timeout(mut self, limit: Option<Duration>) -> Self {
        self.handshake_timeout = limit;
        self
    }

    pub fn routes(&self) -> &SharedRouteTable {
        &self.routes
    }

    /// Runs the server handshake on `tcp`, resolving the route exactly once.
    pub async fn accept(&self, tcp: TcpStream, peer: SocketAddr) -> Result<Terminated, ProxyError> {
        let handshake = self.handshake(tcp, peer);
        match self.handshake_timeout {
            Some(limit) => timeout(limit, handshake)
                .await
                .map_err(|_| ProxyError::handshake(peer.to_string(), "handshake timed out"))?,
            None => handshake.await,
        }
    }

    async fn handshake(&self, tcp: TcpStream, peer: SocketAddr) -> Result<Terminated, ProxyError> {
        let start = LazyConfigAcceptor::new(Acceptor::default(), tcp)
            .await
            .map_err(|e| ProxyError::handshake(peer.to_string(), e))?;

        let sni = start.client_hello().server_name().map(str::to_owned);
        let Some(route) = sni.as_deref().and_then(|name| self.routes.resolve(name)) else {
            warn!(peer = %peer, sni = ?sni, "No route for requested hostname, aborting handshake");
            return Err(ProxyError::RouteNotFound(sni));
        };
        let Some(identity) = route.identity() else {
            warn!(peer = %peer, sni = ?sni, "Route has no server certificate, aborting handshake");
            return Err(ProxyError::RouteNotFound(sni));
        };

        debug!(peer = %peer, sni = route.hostname(), "Route resolved, completing handshake");
        let stream = start
            .into_stream(identity.server_config())
            .await
            .map_err(|e| ProxyError::handshake(peer.to_string(), e))?;

        Ok(Terminated { stream, route })
    }
}
