//! Route table: virtual hostname -> upstream target, server identity and pin.

use crate::error::ProxyError;
use crate::pin::PinnedCertificate;
use crate::tls::{ServerIdentity, server_name};
use arc_swap::ArcSwap;
use certpin_config::{ForwardListener, RouteConfig};
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Where and how to reach the backend of a route.
#[derive(Debug, Clone)]
pub struct Upstream {
    /// `host:port` to dial
    pub address: String,
    /// Name presented in the outbound ClientHello
    pub sni: ServerName<'static>,
    /// Certificate the backend must present, if any
    pub pin: Option<PinnedCertificate>,
}

impl Upstream {
    pub fn new(
        address: impl Into<String>,
        sni: &str,
        pin: Option<PinnedCertificate>,
    ) -> Result<Self, ProxyError> {
        Ok(Self {
            address: address.into(),
            sni: server_name(sni)?,
            pin,
        })
    }
}

/// One routing entry.
#[derive(Debug, Clone)]
pub struct Route {
    hostname: String,
    identity: Option<ServerIdentity>,
    upstream: Upstream,
}

impl Route {
    /// A route terminated by an SNI listener with `identity`.
    pub fn new(hostname: &str, identity: ServerIdentity, upstream: Upstream) -> Self {
        Self {
            hostname: normalize(hostname),
            identity: Some(identity),
            upstream,
        }
    }

    /// A route for a forward listener: no inbound TLS.
    pub fn forward(upstream: Upstream) -> Self {
        let hostname = upstream.sni.to_str().into_owned();
        Self {
            hostname,
            identity: None,
            upstream,
        }
    }

    /// Loads the certificate, key and pin files named by `config`.
    pub fn from_config(config: &RouteConfig) -> Result<Self, ProxyError> {
        let identity = ServerIdentity::from_files(&config.cert, &config.key)?;
        let pin = config
            .pinned_cert
            .as_deref()
            .map(PinnedCertificate::from_file)
            .transpose()?;
        let upstream = Upstream::new(&config.upstream, config.effective_upstream_sni(), pin)?;

        debug!(
            hostname = %config.hostname,
            upstream = %config.upstream,
            pinned = upstream.pin.is_some(),
            "Loaded route"
        );
        Ok(Self::new(&config.hostname, identity, upstream))
    }

    pub fn from_forward_config(config: &ForwardListener) -> Result<Self, ProxyError> {
        let pin = config
            .pinned_cert
            .as_deref()
            .map(PinnedCertificate::from_file)
            .transpose()?;
        Ok(Self::forward(Upstream::new(
            &config.upstream,
            config.effective_upstream_sni(),
            pin,
        )?))
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn identity(&self) -> Option<&ServerIdentity> {
        self.identity.as_ref()
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }
}

/// Immutable hostname -> route map.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<String, Arc<Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table, refusing duplicate hostnames.
    pub fn from_routes(routes: impl IntoIterator<Item = Route>) -> Result<Self, ProxyError> {
        let mut table = Self::new();
        for route in routes {
            table.insert(route)?;
        }
        Ok(table)
    }

    pub fn from_configs(configs: &[RouteConfig]) -> Result<Self, ProxyError> {
        Self::from_routes(
            configs
                .iter()
                .map(Route::from_config)
                .collect::<Result<Vec<_>, _>>()?,
        )
    }

    fn insert(&mut self, route: Route) -> Result<(), ProxyError> {
        if self.routes.contains_key(&route.hostname) {
            return Err(ProxyError::Config(format!(
                "duplicate route for {}",
                route.hostname
            )));
        }
        self.routes.insert(route.hostname.clone(), Arc::new(route));
        Ok(())
    }

    /// Exact (case-insensitive) hostname lookup. No wildcard matching.
    pub fn resolve(&self, hostname: &str) -> Option<Arc<Route>> {
        self.routes.get(&normalize(hostname)).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// The single indirection point through which connections see the table.
///
/// Readers take a snapshot; [`SharedRouteTable::replace`] installs a whole
/// new table atomically and never mutates the one readers may hold.
#[derive(Debug, Clone)]
pub struct SharedRouteTable {
    inner: Arc<ArcSwap<RouteTable>>,
}

impl SharedRouteTable {
    pub fn new(table: RouteTable) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(table)),
        }
    }

    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.inner.load_full()
    }

    pub fn resolve(&self, hostname: &str) -> Option<Arc<Route>> {
        self.inner.load().resolve(hostname)
    }

    /// Swaps in `table`, returning the previous one.
    pub fn replace(&self, table: RouteTable) -> Arc<RouteTable> {
        self.inner.swap(Arc::new(table))
    }
}

fn normalize(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}
