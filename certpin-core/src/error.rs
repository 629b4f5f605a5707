//! Error taxonomy for the proxy.
//!
//! Every variant except [`ProxyError::Certificate`], [`ProxyError::Config`]
//! and [`ProxyError::Bind`] is scoped to a single connection: it is logged and the connection is
//! closed, but the listener and the other sessions carry on.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("TLS handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },

    #[error("no route for SNI {0:?}")]
    RouteNotFound(Option<String>),

    #[error("certificate presented by {upstream} does not match the pin (expected {expected}, got {actual})")]
    PinMismatch {
        upstream: String,
        expected: String,
        actual: String,
    },

    #[error("connecting to {upstream} failed: {source}")]
    Connect {
        upstream: String,
        #[source]
        source: io::Error,
    },

    #[error("forwarding {direction} failed: {source}")]
    Forward {
        direction: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
}

impl ProxyError {
    /// Short label used for the `error_type` metric and log field.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Accept(_) => "accept",
            ProxyError::Handshake { .. } => "handshake",
            ProxyError::RouteNotFound(_) => "route_not_found",
            ProxyError::PinMismatch { .. } => "pin_mismatch",
            ProxyError::Connect { .. } => "connect",
            ProxyError::Forward { .. } => "forward",
            ProxyError::Certificate(_) => "certificate",
            ProxyError::Config(_) => "config",
            ProxyError::Bind { .. } => "bind",
        }
    }

    pub(crate) fn handshake(peer: impl Into<String>, reason: impl ToString) -> Self {
        ProxyError::Handshake {
            peer: peer.into(),
            reason: reason.to_string(),
        }
    }
}
