//! Run Configuration
//!
//! This module turns the command line's target string and options into a
//! validated [`RunConfig`] that the engine consumes read-only. The core never
//! looks at argv; everything it needs is in here.
//!
//! ## Target strings
//!
//! - `http://host[:port]/path`: request/response cycling over plain TCP
//!   (default port 80)
//! - `https://host[:port]/path`: request/response cycling through TLS
//!   (default port 443)
//! - `tls://host[:port]`: TLS handshake/renegotiation probing
//!   (default port 443)
//!
//! ## Hard caps
//!
//! Concurrency and header counts are bounded. Exceeding a cap is a
//! configuration error reported loudly, never a silent clamp.

use std::net::{SocketAddr, ToSocketAddrs};
use thiserror::Error;

/// Hard cap on simultaneous connections.
pub const MAX_PEERS: usize = 999;

/// Hard cap on extra header lines.
pub const MAX_HEADERS: usize = 256;

/// Default concurrency for the request/response variant.
pub const DEFAULT_REQUEST_CONCURRENCY: usize = 1;

/// Default concurrency for the handshake/renegotiation variant.
pub const DEFAULT_PROBE_CONCURRENCY: usize = 400;

/// Protocol tag of the target endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Plain HTTP request/response cycling.
    Http,
    /// HTTP request/response cycling through a TLS session.
    Https,
    /// TLS handshake/renegotiation probing (no HTTP at all).
    Tls,
}

impl Protocol {
    /// Default port for this protocol.
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https | Protocol::Tls => 443,
        }
    }

    /// Whether this protocol runs the request/response state machine.
    pub fn is_request_variant(self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }
}

/// The parsed target endpoint. Immutable for the whole run.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    /// Resolves the endpoint to a socket address, taking the first result
    /// like the original single `getaddrinfo` call.
    pub fn resolve(&self) -> Result<SocketAddr, ConfigError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ConfigError::Resolve {
                host: self.host.clone(),
                source: e,
            })?
            .next()
            .ok_or_else(|| ConfigError::NoAddress {
                host: self.host.clone(),
            })
    }
}

/// Everything the engine needs to run. Produced once by the CLI layer,
/// passed by reference everywhere else.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub endpoint: Endpoint,
    /// Maximum simultaneous connections (1..=MAX_PEERS).
    pub concurrency: usize,
    /// Stop after this many completions; unbounded when `None`.
    pub request_limit: Option<u64>,
    /// Literal header lines appended verbatim to every request.
    pub headers: Vec<String>,
    /// Operator acknowledgment for the TLS probe variant.
    pub accepted: bool,
    /// Bypass the probe variant's warm-up pause.
    pub skip_delay: bool,
}

impl RunConfig {
    /// Builds a config from a target string and options, enforcing the caps.
    pub fn new(
        target: &str,
        concurrency: Option<usize>,
        request_limit: Option<u64>,
        headers: Vec<String>,
        accepted: bool,
        skip_delay: bool,
    ) -> Result<Self, ConfigError> {
        let endpoint = parse_target(target)?;

        let concurrency = concurrency.unwrap_or(if endpoint.protocol.is_request_variant() {
            DEFAULT_REQUEST_CONCURRENCY
        } else {
            DEFAULT_PROBE_CONCURRENCY
        });
        if concurrency == 0 || concurrency > MAX_PEERS {
            return Err(ConfigError::Concurrency {
                requested: concurrency,
                max: MAX_PEERS,
            });
        }
        if headers.len() > MAX_HEADERS {
            return Err(ConfigError::TooManyHeaders {
                requested: headers.len(),
                max: MAX_HEADERS,
            });
        }

        Ok(Self {
            endpoint,
            concurrency,
            request_limit,
            headers,
            accepted,
            skip_delay,
        })
    }
}

/// Parses a target string into an [`Endpoint`].
pub fn parse_target(target: &str) -> Result<Endpoint, ConfigError> {
    let (protocol, rest) = if let Some(rest) = target.strip_prefix("http://") {
        (Protocol::Http, rest)
    } else if let Some(rest) = target.strip_prefix("https://") {
        (Protocol::Https, rest)
    } else if let Some(rest) = target.strip_prefix("tls://") {
        (Protocol::Tls, rest)
    } else {
        return Err(ConfigError::Scheme(target.to_string()));
    };

    // Split authority from path; a bare "http://host" defaults to "/".
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };

    let (host, port) = match authority.rfind(':') {
        Some(i) => {
            let port: u16 = authority[i + 1..]
                .parse()
                .map_err(|_| ConfigError::Port(authority[i + 1..].to_string()))?;
            (&authority[..i], port)
        }
        None => (authority, protocol.default_port()),
    };
    if host.is_empty() {
        return Err(ConfigError::Host(target.to_string()));
    }

    Ok(Endpoint {
        protocol,
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

/// Errors produced while building the run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Unsupported or missing URL scheme
    #[error("unsupported target scheme in {0:?} (expected http://, https:// or tls://)")]
    Scheme(String),

    /// Missing host component
    #[error("missing host in target {0:?}")]
    Host(String),

    /// Unparseable port component
    #[error("invalid port {0:?}")]
    Port(String),

    /// Concurrency outside the supported range
    #[error("concurrency {requested} out of range (1..={max})")]
    Concurrency { requested: usize, max: usize },

    /// Too many extra header lines
    #[error("{requested} header lines exceed the cap of {max}")]
    TooManyHeaders { requested: usize, max: usize },

    /// DNS resolution failed
    #[error("cannot resolve {host:?}: {source}")]
    Resolve {
        host: String,
        source: std::io::Error,
    },

    /// DNS resolution returned no addresses
    #[error("no addresses for {host:?}")]
    NoAddress { host: String },
}
