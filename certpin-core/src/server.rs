//! Proxy server: accept loop and per-connection pipeline.
//!
//! Each accepted connection runs in its own task:
//! `Accepted -> Handshaking -> RouteResolved -> UpstreamConnecting ->
//! Verified -> Bridging -> Closed`. Forward listeners skip the handshake.
//! A failure ends that connection only; the listener keeps accepting until
//! its [`ProxyHandle`] is told to stop.

use crate::bridge::{BridgeOptions, bridge};
use crate::error::ProxyError;
use crate::metrics::ProxyMetrics;
use crate::routes::{Route, SharedRouteTable};
use crate::sni::{SniTerminator, Terminated};
use crate::tls::UpstreamTls;
use crate::upstream::UpstreamConnector;
use certpin_config::Config;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Where a connection is in its pipeline. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Handshaking,
    RouteResolved,
    UpstreamConnecting,
    Verified,
    Bridging,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Accepted => "accepted",
            SessionState::Handshaking => "handshaking",
            SessionState::RouteResolved => "route_resolved",
            SessionState::UpstreamConnecting => "upstream_connecting",
            SessionState::Verified => "verified",
            SessionState::Bridging => "bridging",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a listener treats its inbound connections.
#[derive(Debug, Clone)]
pub enum ListenerMode {
    /// Terminate TLS, choosing the certificate and upstream from the SNI.
    Sni(SharedRouteTable),
    /// Plaintext clients, all sent to one fixed route.
    Forward(Arc<Route>),
}

impl ListenerMode {
    fn label(&self) -> &'static str {
        match self {
            ListenerMode::Sni(_) => "sni",
            ListenerMode::Forward(_) => "forward",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub address: String,
    pub mode: ListenerMode,
}

impl ListenerConfig {
    pub fn sni(address: impl Into<String>, routes: SharedRouteTable) -> Self {
        Self {
            address: address.into(),
            mode: ListenerMode::Sni(routes),
        }
    }

    pub fn forward(address: impl Into<String>, route: Route) -> Self {
        Self {
            address: address.into(),
            mode: ListenerMode::Forward(Arc::new(route)),
        }
    }
}

/// Settings shared by every listener of a [`ProxyServer`].
#[derive(Clone, Default)]
pub struct ProxyOptions {
    pub connect_timeout: Option<Duration>,
    pub handshake_timeout: Option<Duration>,
    pub bridge: BridgeOptions,
    /// Per-listener cap on concurrent connections
    pub max_connections: Option<usize>,
    pub metrics: Option<ProxyMetrics>,
}

impl ProxyOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: seconds(config.timeouts.connect),
            handshake_timeout: seconds(config.timeouts.handshake),
            bridge: BridgeOptions {
                buffer_size: config.buffer_size,
                idle_timeout: seconds(config.timeouts.idle),
            },
            max_connections: config.max_connections,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ProxyMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop accepting; live sessions run to completion.
    Graceful,
    /// Stop accepting and close every live session.
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerState {
    Accepting,
    Draining,
    Closed,
}

/// Starts listeners. Cheap to clone; listeners share the upstream TLS
/// configuration and options.
#[derive(Clone)]
pub struct ProxyServer {
    options: ProxyOptions,
    connector: UpstreamConnector,
}

impl ProxyServer {
    pub fn new(options: ProxyOptions) -> Result<Self, ProxyError> {
        Ok(Self::with_upstream_tls(options, UpstreamTls::insecure()?))
    }

    pub fn with_upstream_tls(options: ProxyOptions, tls: UpstreamTls) -> Self {
        let connector = UpstreamConnector::new(tls)
            .with_connect_timeout(options.connect_timeout)
            .with_handshake_timeout(options.handshake_timeout);
        Self { options, connector }
    }

    /// Binds `listener.address` and starts accepting in a background task.
    pub async fn start(&self, listener: ListenerConfig) -> Result<ProxyHandle, ProxyError> {
        let tcp = TcpListener::bind(&listener.address)
            .await
            .map_err(|source| ProxyError::Bind {
                address: listener.address.clone(),
                source,
            })?;
        let local_addr = tcp.local_addr().map_err(|source| ProxyError::Bind {
            address: listener.address.clone(),
            source,
        })?;

        let mode = listener.mode.clone();
        let pipeline = Arc::new(Pipeline {
            mode: match &listener.mode {
                ListenerMode::Sni(routes) => Stage::Sni(
                    SniTerminator::new(routes.clone())
                        .with_handshake_timeout(self.options.handshake_timeout),
                ),
                ListenerMode::Forward(route) => Stage::Forward(route.clone()),
            },
            label: listener.mode.label(),
            connector: self.connector.clone(),
            bridge: self.options.bridge.clone(),
            metrics: self.options.metrics.clone(),
        });
        let limit = self
            .options
            .max_connections
            .map(|n| Arc::new(Semaphore::new(n)));

        let (signal_tx, signal_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(ListenerState::Accepting);

        info!(address = %local_addr, mode = pipeline.label, "Listener started");
        let task = tokio::spawn(accept_loop(tcp, pipeline, limit, signal_rx, state_tx));

        Ok(ProxyHandle {
            local_addr,
            mode,
            signal: signal_tx,
            state: state_rx,
            task,
        })
    }
}

/// Control handle for one running listener.
pub struct ProxyHandle {
    local_addr: SocketAddr,
    mode: ListenerMode,
    signal: watch::Sender<Option<ShutdownMode>>,
    state: watch::Receiver<ListenerState>,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The listener's route table, for SNI listeners. Replacing it affects
    /// new connections only.
    pub fn routes(&self) -> Option<&SharedRouteTable> {
        match &self.mode {
            ListenerMode::Sni(routes) => Some(routes),
            ListenerMode::Forward(_) => None,
        }
    }

    /// Closes the listening socket. Returns once no new connections will be
    /// accepted; sessions already running carry on.
    pub async fn stop(&self) {
        self.signal.send_if_modified(|mode| {
            if mode.is_none() {
                *mode = Some(ShutdownMode::Graceful);
                true
            } else {
                false
            }
        });
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s != ListenerState::Accepting).await;
    }

    /// Resolves once the listener is closed and every session has ended.
    pub async fn drained(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ListenerState::Closed).await;
    }

    /// Stops the listener and waits for its task to finish. In
    /// [`ShutdownMode::Force`] live sessions are aborted, which closes both
    /// of their sockets.
    pub async fn shutdown(self, mode: ShutdownMode) {
        self.signal.send_replace(Some(mode));
        if let Err(e) = self.task.await {
            error!(address = %self.local_addr, error = %e, "Listener task failed");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    limit: Option<Arc<Semaphore>>,
    mut signal: watch::Receiver<Option<ShutdownMode>>,
    state: watch::Sender<ListenerState>,
) {
    let address = listener.local_addr().ok();
    let mut sessions = JoinSet::new();

    let mut mode = loop {
        tokio::select! {
            biased;
            changed = signal.changed() => {
                // A dropped handle counts as a graceful stop.
                let mode = match changed {
                    Ok(()) => *signal.borrow_and_update(),
                    Err(_) => Some(ShutdownMode::Graceful),
                };
                if let Some(mode) = mode {
                    break mode;
                }
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    let permit = match &limit {
                        Some(semaphore) => match semaphore.clone().try_acquire_owned() {
                            Ok(permit) => Some(permit),
                            Err(_) => {
                                warn!(peer = %peer, "Connection limit reached, dropping connection");
                                if let Some(metrics) = &pipeline.metrics {
                                    metrics
                                        .connections_total
                                        .with_label_values(&[pipeline.label, "rejected"])
                                        .inc();
                                }
                                continue;
                            }
                        },
                        None => None,
                    };
                    let pipeline = pipeline.clone();
                    sessions.spawn(async move {
                        pipeline.handle_connection(tcp, peer).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    let e = ProxyError::Accept(e);
                    warn!(error = %e, "Accept failed");
                    if let Some(metrics) = &pipeline.metrics {
                        metrics.errors_total.with_label_values(&[e.kind()]).inc();
                    }
                }
            },
        }
    };

    drop(listener);
    state.send_replace(ListenerState::Draining);
    info!(address = ?address, live_sessions = sessions.len(), "Listener closed");

    loop {
        if mode == ShutdownMode::Force && !sessions.is_empty() {
            info!(address = ?address, live_sessions = sessions.len(), "Aborting live sessions");
            sessions.abort_all();
        }
        tokio::select! {
            joined = sessions.join_next() => {
                if joined.is_none() {
                    break;
                }
            }
            Ok(()) = signal.changed() => {
                if let Some(next) = *signal.borrow_and_update() {
                    mode = next;
                }
            }
        }
    }

    state.send_replace(ListenerState::Closed);
    debug!(address = ?address, "All sessions finished");
}

/// Session accounting that also runs when the session task is aborted.
struct SessionGuard {
    metrics: Option<ProxyMetrics>,
    label: &'static str,
    start: Instant,
    status: &'static str,
}

impl SessionGuard {
    fn new(metrics: Option<ProxyMetrics>, label: &'static str) -> Self {
        if let Some(metrics) = &metrics {
            metrics.connections_active.inc();
        }
        Self {
            metrics,
            label,
            start: Instant::now(),
            status: "aborted",
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(metrics) = &self.metrics {
            metrics.connections_active.dec();
            metrics
                .connections_total
                .with_label_values(&[self.label, self.status])
                .inc();
            metrics
                .session_duration
                .with_label_values(&[self.label])
                .observe(self.start.elapsed().as_secs_f64());
        }
    }
}

enum Stage {
    Sni(SniTerminator),
    Forward(Arc<Route>),
}

struct Pipeline {
    mode: Stage,
    label: &'static str,
    connector: UpstreamConnector,
    bridge: BridgeOptions,
    metrics: Option<ProxyMetrics>,
}

impl Pipeline {
    async fn handle_connection(&self, tcp: TcpStream, peer: SocketAddr) {
        let mut guard = SessionGuard::new(self.metrics.clone(), self.label);
        debug!(peer = %peer, mode = self.label, state = %SessionState::Accepted, "New connection");

        let mut state = SessionState::Accepted;
        let result = self.process(tcp, peer, &mut state).await;
        let duration = guard.start.elapsed().as_secs_f64();

        guard.status = if result.is_ok() { "success" } else { "failure" };
        if let (Err(e), Some(metrics)) = (&result, &self.metrics) {
            metrics.errors_total.with_label_values(&[e.kind()]).inc();
        }
        drop(guard);

        match result {
            Ok(()) => info!(
                peer = %peer,
                state = %SessionState::Closed,
                duration_secs = %duration,
                "Session closed"
            ),
            // Already reported with both fingerprints by the connector.
            Err(ProxyError::PinMismatch { upstream, .. }) => info!(
                peer = %peer,
                upstream = %upstream,
                state = %state,
                "Client connection closed after pin mismatch"
            ),
            Err(e @ (ProxyError::Handshake { .. } | ProxyError::RouteNotFound(_))) => debug!(
                peer = %peer,
                state = %state,
                error = %e,
                duration_secs = %duration,
                "Client rejected"
            ),
            Err(e) => warn!(
                peer = %peer,
                state = %state,
                error = %e,
                duration_secs = %duration,
                "Connection failed"
            ),
        }
    }

    async fn process(
        &self,
        tcp: TcpStream,
        peer: SocketAddr,
        state: &mut SessionState,
    ) -> Result<(), ProxyError> {
        let _ = tcp.set_nodelay(true);
        match &self.mode {
            Stage::Sni(terminator) => {
                *state = SessionState::Handshaking;
                let Terminated { stream, route } = terminator.accept(tcp, peer).await?;
                *state = SessionState::RouteResolved;
                self.connect_and_bridge(stream, route, peer, state).await
            }
            Stage::Forward(route) => {
                *state = SessionState::RouteResolved;
                self.connect_and_bridge(tcp, route.clone(), peer, state)
                    .await
            }
        }
    }

    async fn connect_and_bridge<S>(
        &self,
        client: S,
        route: Arc<Route>,
        peer: SocketAddr,
        state: &mut SessionState,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let host = route.hostname();
        *state = SessionState::UpstreamConnecting;
        let upstream = match self.connector.connect_upstream(route.upstream()).await {
            Ok(upstream) => upstream,
            Err(e) => {
                if let (ProxyError::PinMismatch { .. }, Some(metrics)) = (&e, &self.metrics) {
                    metrics.pin_mismatches.with_label_values(&[host]).inc();
                }
                return Err(e);
            }
        };
        *state = SessionState::Verified;

        let counters = self.metrics.as_ref().map(|metrics| {
            metrics.sessions_bridged.with_label_values(&[host]).inc();
            metrics.byte_counters(host)
        });

        *state = SessionState::Bridging;
        info!(
            peer = %peer,
            sni = host,
            upstream = %route.upstream().address,
            state = %state,
            "Session established"
        );
        let stats = bridge(client, upstream, &self.bridge, counters).await?;
        *state = SessionState::Closed;
        debug!(
            peer = %peer,
            sni = host,
            bytes_tx = stats.a_to_b,
            bytes_rx = stats.b_to_a,
            "Bridge finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{RouteTable, Upstream};

    fn forward_listener() -> ListenerConfig {
        ListenerConfig::forward(
            "127.0.0.1:0",
            Route::forward(Upstream::new("127.0.0.1:9", "upstream.test", None).unwrap()),
        )
    }

    #[test]
    fn test_session_state_labels() {
        assert_eq!(SessionState::Accepted.to_string(), "accepted");
        assert_eq!(SessionState::UpstreamConnecting.as_str(), "upstream_connecting");
    }

    #[test]
    fn test_options_from_config_maps_zero_to_disabled() {
        let config = Config::parse(
            r#"
forward_listeners:
  - listen: "127.0.0.1:8080"
    upstream: "example.com:443"
timeouts:
  connect: 3
  handshake: 0
buffer_size: 4096
max_connections: 5
"#,
        )
        .unwrap();

        let options = ProxyOptions::from_config(&config);
        assert_eq!(options.connect_timeout, Some(Duration::from_secs(3)));
        assert_eq!(options.handshake_timeout, None);
        assert_eq!(options.bridge.idle_timeout, None);
        assert_eq!(options.bridge.buffer_size, 4096);
        assert_eq!(options.max_connections, Some(5));
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = taken.local_addr().unwrap().to_string();
        let server = ProxyServer::new(ProxyOptions::default()).unwrap();

        let result = server
            .start(ListenerConfig::sni(address, SharedRouteTable::new(RouteTable::new())))
            .await;
        assert!(matches!(result, Err(ProxyError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_stop_closes_listener() {
        let server = ProxyServer::new(ProxyOptions::default()).unwrap();
        let handle = server.start(forward_listener()).await.unwrap();
        let addr = handle.local_addr();
        assert!(handle.routes().is_none());

        handle.stop().await;
        assert!(TcpStream::connect(addr).await.is_err());

        tokio::time::timeout(Duration::from_secs(5), handle.drained())
            .await
            .expect("idle listener should drain immediately");
        handle.shutdown(ShutdownMode::Graceful).await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let server = ProxyServer::new(ProxyOptions::default()).unwrap();
        let handle = server.start(forward_listener()).await.unwrap();
        handle.stop().await;
        handle.stop().await;
        handle.shutdown(ShutdownMode::Force).await;
    }
}
