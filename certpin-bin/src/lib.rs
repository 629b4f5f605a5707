use bytes::Bytes;
use certpin_config::Config;
use certpin_core::capture::{CertificateFormat, capture_certificate};
use certpin_core::{ProxyMetrics, shutdown_all, start_from_config};
use clap::ValueEnum;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

pub fn init_logging(format: LogFormat) -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into())
        .add_directive("certpin=debug".parse()?);

    let builder = fmt().with_env_filter(filter).with_target(false);
    let result = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    result.map_err(|e| -> Box<dyn Error> { e })
}

/// Serves the registry in the Prometheus text format on `address`.
/// Returns the bound address.
pub async fn serve_metrics(address: &str, registry: Registry) -> Result<SocketAddr, Box<dyn Error>> {
    let metrics_addr: SocketAddr = address.parse()?;
    let metrics_listener = TcpListener::bind(metrics_addr).await?;
    let local_addr = metrics_listener.local_addr()?;

    tokio::spawn(async move {
        loop {
            let (stream, _) = match metrics_listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Metrics accept failed");
                    continue;
                }
            };
            let registry = registry.clone();
            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service =
                    hyper::service::service_fn(move |_req: Request<hyper::body::Incoming>| {
                        let registry = registry.clone();
                        async move {
                            let encoder = TextEncoder::new();
                            let mut buffer = vec![];
                            encoder
                                .encode(&registry.gather(), &mut buffer)
                                .map_err(|e| format!("Metrics encoding error: {}", e))?;
                            Ok::<_, String>(Response::new(Full::new(Bytes::from(buffer))))
                        }
                    });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!(error = %err, "Metrics connection error");
                }
            });
        }
    });

    info!(address = %local_addr, "Metrics endpoint listening");
    Ok(local_addr)
}

/// Runs every listener in the configuration until SIGINT or SIGTERM.
pub async fn run(config_path: &Path) -> Result<(), Box<dyn Error>> {
    let config = Config::from_file(config_path)?;
    info!(
        config = %config_path.display(),
        sni_listeners = config.sni_listeners.len(),
        forward_listeners = config.forward_listeners.len(),
        "Configuration loaded"
    );

    let metrics = if config.metrics.enabled {
        let registry = Registry::new();
        let metrics = ProxyMetrics::new(&registry)?;
        serve_metrics(&config.metrics.address, registry).await?;
        Some(metrics)
    } else {
        None
    };

    let handles = start_from_config(&config, metrics).await?;
    info!(listeners = handles.len(), "Proxy started, waiting for connections...");

    shutdown_signal().await?;
    let grace = Duration::from_secs(config.shutdown_timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT));
    info!(grace_secs = grace.as_secs(), "Shutting down proxy");
    shutdown_all(handles, Some(grace)).await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<(), Box<dyn Error>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    info!("Received shutdown signal");
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<(), Box<dyn Error>> {
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    Ok(())
}

/// Fetches the certificate served at `address` and writes it to `output`.
pub async fn capture(
    address: &str,
    output: &Path,
    server_name: Option<&str>,
    format: CertificateFormat,
    timeout: Option<Duration>,
) -> Result<(), Box<dyn Error>> {
    let der = capture_certificate(address, server_name, timeout).await?;
    tokio::fs::write(output, format.encode(&der)).await?;
    info!(
        upstream = address,
        output = %output.display(),
        format = ?format,
        "Certificate written"
    );
    Ok(())
}
