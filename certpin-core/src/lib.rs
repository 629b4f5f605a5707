//! Core of the certpin TLS pinning proxy.
//!
//! Connections flow through [`server`] -> [`sni`] -> [`upstream`] ->
//! [`bridge`]: the client's TLS session is terminated with the certificate
//! chosen by its SNI (or accepted in plaintext on a forward listener), the
//! upstream TLS connection is only exposed once its certificate matches the
//! route's pin, and the two streams are then bridged byte for byte.

pub mod bridge;
pub mod capture;
pub mod error;
pub mod metrics;
pub mod pin;
pub mod routes;
pub mod server;
pub mod sni;
pub mod tls;
pub mod upstream;

pub use bridge::{BridgeOptions, BridgeStats, bridge};
pub use error::ProxyError;
pub use metrics::ProxyMetrics;
pub use pin::{PinnedCertificate, verify};
pub use routes::{Route, RouteTable, SharedRouteTable, Upstream};
pub use server::{
    ListenerConfig, ListenerMode, ProxyHandle, ProxyOptions, ProxyServer, SessionState,
    ShutdownMode,
};
pub use upstream::UpstreamConnector;

use certpin_config::Config;
use futures::future::join_all;
use std::time::Duration;
use tracing::{info, warn};

/// Loads every route named by `config` and builds the listener set.
///
/// All certificate, key and pin files are read here, so a bad file fails
/// before anything is bound.
pub fn listeners_from_config(config: &Config) -> Result<Vec<ListenerConfig>, ProxyError> {
    let mut listeners = Vec::new();
    for listener in &config.sni_listeners {
        let table = RouteTable::from_configs(&listener.routes)?;
        info!(
            address = %listener.listen,
            routes = table.len(),
            "Loaded SNI listener"
        );
        listeners.push(ListenerConfig::sni(
            listener.listen.clone(),
            SharedRouteTable::new(table),
        ));
    }
    for listener in &config.forward_listeners {
        let route = Route::from_forward_config(listener)?;
        info!(
            address = %listener.listen,
            upstream = %listener.upstream,
            pinned = route.upstream().pin.is_some(),
            "Loaded forward listener"
        );
        listeners.push(ListenerConfig::forward(listener.listen.clone(), route));
    }
    Ok(listeners)
}

/// Starts every listener in `config`. If one fails to bind, the ones
/// already started are shut down and the error is returned.
pub async fn start_from_config(
    config: &Config,
    metrics: Option<ProxyMetrics>,
) -> Result<Vec<ProxyHandle>, ProxyError> {
    let listeners = listeners_from_config(config)?;
    let mut options = ProxyOptions::from_config(config);
    options.metrics = metrics;
    let server = ProxyServer::new(options)?;

    let mut handles = Vec::with_capacity(listeners.len());
    for listener in listeners {
        match server.start(listener).await {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                join_all(
                    handles
                        .into_iter()
                        .map(|handle| handle.shutdown(ShutdownMode::Force)),
                )
                .await;
                return Err(e);
            }
        }
    }
    Ok(handles)
}

/// Stops accepting on every listener, lets live sessions finish for up to
/// `grace`, then closes whatever is left.
pub async fn shutdown_all(handles: Vec<ProxyHandle>, grace: Option<Duration>) {
    join_all(handles.iter().map(|handle| handle.stop())).await;

    let drained = join_all(handles.iter().map(|handle| handle.drained()));
    let mode = match grace {
        Some(grace) => match tokio::time::timeout(grace, drained).await {
            Ok(_) => ShutdownMode::Graceful,
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "Sessions still open after grace period, closing them");
                ShutdownMode::Force
            }
        },
        None => {
            drained.await;
            ShutdownMode::Graceful
        }
    };

    join_all(handles.into_iter().map(|handle| handle.shutdown(mode))).await;
}
