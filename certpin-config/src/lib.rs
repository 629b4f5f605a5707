use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default read buffer per bridge direction (1 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 1_048_576;

/// Errors raised while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML configuration: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no listeners configured")]
    NoListeners,

    #[error("duplicate route hostname {hostname:?} on listener {listen}")]
    DuplicateHostname { listen: String, hostname: String },

    #[error("empty route hostname on listener {0}")]
    EmptyHostname(String),

    #[error("invalid address {0:?}, expected host:port")]
    InvalidAddress(String),

    #[error("buffer_size must be greater than zero")]
    ZeroBufferSize,
}

/// certpin configuration loaded from YAML or JSON.
///
/// A configuration holds any number of SNI listeners (TLS terminated on the
/// proxy, routed by hostname) and forward listeners (plain TCP forwarded to a
/// single pinned upstream).
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// TLS-terminating listeners routed by SNI
    #[serde(default)]
    pub sni_listeners: Vec<SniListener>,
    /// Plain listeners forwarding to one fixed upstream
    #[serde(default)]
    pub forward_listeners: Vec<ForwardListener>,
    /// Timeout configuration for various operations
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Read buffer size per bridge direction in bytes (default: 1 MiB)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum number of concurrent sessions per listener (unbounded if not specified)
    #[serde(default)]
    pub max_connections: Option<usize>,
    /// Graceful shutdown timeout in seconds (default: 30 if not specified)
    #[serde(default)]
    pub shutdown_timeout: Option<u64>,
    /// Prometheus metrics configuration
    #[serde(default)]
    pub metrics: Metrics,
}

/// A listener that terminates TLS and picks a route from the client's SNI.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SniListener {
    /// Address to listen on (e.g., "0.0.0.0:443")
    pub listen: String,
    /// Routes keyed by hostname
    pub routes: Vec<RouteConfig>,
}

/// One virtual hostname served by an SNI listener.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteConfig {
    /// SNI value this route answers for
    pub hostname: String,
    /// PEM certificate chain presented to clients
    pub cert: PathBuf,
    /// PEM private key matching `cert`
    pub key: PathBuf,
    /// Backend address (host:port)
    pub upstream: String,
    /// SNI sent to the backend (default: `hostname`)
    #[serde(default)]
    pub upstream_sni: Option<String>,
    /// Certificate the backend must present, PEM or DER (no pinning if absent)
    #[serde(default)]
    pub pinned_cert: Option<PathBuf>,
}

impl RouteConfig {
    /// SNI presented on the upstream handshake.
    pub fn effective_upstream_sni(&self) -> &str {
        self.upstream_sni.as_deref().unwrap_or(&self.hostname)
    }
}

/// A plain TCP listener whose clients are all bridged to one pinned upstream.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ForwardListener {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    pub listen: String,
    /// Backend address (host:port)
    pub upstream: String,
    /// SNI sent to the backend (default: host part of `upstream`)
    #[serde(default)]
    pub upstream_sni: Option<String>,
    /// Certificate the backend must present, PEM or DER (no pinning if absent)
    #[serde(default)]
    pub pinned_cert: Option<PathBuf>,
}

impl ForwardListener {
    /// SNI presented on the upstream handshake.
    pub fn effective_upstream_sni(&self) -> &str {
        match self.upstream_sni.as_deref() {
            Some(sni) => sni,
            None => split_host_port(&self.upstream)
                .map(|(host, _)| host)
                .unwrap_or(&self.upstream),
        }
    }
}

/// Timeout settings for proxy operations (all values in seconds, 0 disables).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Timeouts {
    /// Maximum time to establish the upstream TCP connection (default: 10s)
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,
    /// Maximum time for each TLS handshake, inbound and outbound (default: 10s)
    #[serde(default = "default_handshake_timeout")]
    pub handshake: u64,
    /// Maximum idle time for a bridged session (default: disabled)
    #[serde(default)]
    pub idle: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            handshake: default_handshake_timeout(),
            idle: 0,
        }
    }
}

/// Prometheus metrics server configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Metrics {
    /// Whether to enable metrics collection
    pub enabled: bool,
    /// Address to bind metrics HTTP server (e.g., "127.0.0.1:9090")
    pub address: String,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "127.0.0.1:9090".to_string(),
        }
    }
}

impl Config {
    /// Loads configuration from a file.
    ///
    /// Files ending in `.json` are parsed as JSON, everything else as YAML.
    /// Relative certificate paths are resolved against the file's directory
    /// and the result is validated.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use certpin_config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::from_file(Path::new("certpin.yaml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let mut config = if is_json {
            Self::parse_json(&contents)?
        } else {
            Self::parse(&contents)?
        };

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Examples
    ///
    /// ```
    /// use certpin_config::Config;
    ///
    /// let yaml = r#"
    /// forward_listeners:
    ///   - listen: "127.0.0.1:8080"
    ///     upstream: "example.com:443"
    /// "#;
    ///
    /// let config = Config::parse(yaml).unwrap();
    /// assert_eq!(config.forward_listeners[0].effective_upstream_sni(), "example.com");
    /// ```
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml_ng::from_str(contents)?)
    }

    /// Parses configuration from a JSON string.
    pub fn parse_json(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(contents)?)
    }

    /// Makes every relative certificate, key and pin path absolute against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };

        for listener in &mut self.sni_listeners {
            for route in &mut listener.routes {
                join(&mut route.cert);
                join(&mut route.key);
                if let Some(pin) = route.pinned_cert.as_mut() {
                    join(pin);
                }
            }
        }
        for listener in &mut self.forward_listeners {
            if let Some(pin) = listener.pinned_cert.as_mut() {
                join(pin);
            }
        }
    }

    /// Checks structural constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sni_listeners.is_empty() && self.forward_listeners.is_empty() {
            return Err(ConfigError::NoListeners);
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }

        for listener in &self.sni_listeners {
            check_address(&listener.listen)?;

            let mut seen = HashSet::new();
            for route in &listener.routes {
                if route.hostname.trim().is_empty() {
                    return Err(ConfigError::EmptyHostname(listener.listen.clone()));
                }
                check_address(&route.upstream)?;
                if !seen.insert(route.hostname.to_ascii_lowercase()) {
                    return Err(ConfigError::DuplicateHostname {
                        listen: listener.listen.clone(),
                        hostname: route.hostname.clone(),
                    });
                }
            }
        }

        for listener in &self.forward_listeners {
            check_address(&listener.listen)?;
            check_address(&listener.upstream)?;
        }

        Ok(())
    }
}

fn check_address(addr: &str) -> Result<(), ConfigError> {
    split_host_port(addr)
        .map(|_| ())
        .ok_or_else(|| ConfigError::InvalidAddress(addr.to_string()))
}

/// Splits `host:port`, accepting bracketed IPv6 hosts such as `[::1]:443`.
///
/// Returns `None` when the port is missing or not a valid `u16`, or the host is empty.
///
/// # Examples
///
/// ```
/// use certpin_config::split_host_port;
///
/// assert_eq!(split_host_port("example.com:443"), Some(("example.com", 443)));
/// assert_eq!(split_host_port("[::1]:8443"), Some(("::1", 8443)));
/// assert_eq!(split_host_port("example.com"), None);
/// ```
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}
