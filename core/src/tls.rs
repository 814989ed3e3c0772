//! TLS protocol model: versions, sockets, socket factories, connection specs.
//!
//! # Design
//! A `SocketFactory` hands out `TlsSocket` descriptors: the endpoint plus the
//! protocol versions the socket supports and has enabled. The client inspects
//! its factory once at build time and derives the transport's TLS version
//! range from the result, so whatever a factory does to its sockets is what
//! the transport negotiates.
//!
//! `TlsVersionPinning` is a decorator over another factory. It forwards
//! everything and intercepts only socket creation, forcing a single enabled
//! protocol version on each socket before returning it.
//!
//! `ConnectionSpec` is the ordered fallback list the client is allowed to
//! negotiate: TLS profiles with explicit version lists, or cleartext.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::error::ConfigError;
use crate::platform::Platform;

/// A TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub fn protocol_name(self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }

    pub(crate) fn to_reqwest(self) -> reqwest::tls::Version {
        match self {
            TlsVersion::Tls10 => reqwest::tls::Version::TLS_1_0,
            TlsVersion::Tls11 => reqwest::tls::Version::TLS_1_1,
            TlsVersion::Tls12 => reqwest::tls::Version::TLS_1_2,
            TlsVersion::Tls13 => reqwest::tls::Version::TLS_1_3,
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.protocol_name())
    }
}

/// Versions the rustls backend can actually speak.
pub const BACKEND_TLS_VERSIONS: &[TlsVersion] = &[TlsVersion::Tls12, TlsVersion::Tls13];

const DEFAULT_CIPHER_SUITES: &[&str] = &[
    "TLS_AES_128_GCM_SHA256",
    "TLS_AES_256_GCM_SHA384",
    "TLS_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
];

/// Where a socket is headed. One variant per socket creation form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Not yet connected.
    Plain,
    Host {
        host: String,
        port: u16,
    },
    HostWithLocal {
        host: String,
        port: u16,
        local: SocketAddr,
    },
    Address {
        address: IpAddr,
        port: u16,
    },
    AddressWithLocal {
        address: IpAddr,
        port: u16,
        local: SocketAddr,
    },
}

/// A TLS socket as produced by a `SocketFactory`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSocket {
    endpoint: Endpoint,
    supported: Vec<TlsVersion>,
    enabled: Vec<TlsVersion>,
}

impl TlsSocket {
    pub fn new(endpoint: Endpoint, supported: Vec<TlsVersion>, enabled: Vec<TlsVersion>) -> Self {
        Self {
            endpoint,
            supported,
            enabled,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn supported_protocols(&self) -> &[TlsVersion] {
        &self.supported
    }

    pub fn enabled_protocols(&self) -> &[TlsVersion] {
        &self.enabled
    }

    pub fn supports(&self, version: TlsVersion) -> bool {
        self.supported.contains(&version)
    }

    /// Replace the enabled protocol list. Every version must be supported.
    pub fn set_enabled_protocols(&mut self, versions: &[TlsVersion]) -> Result<(), ConfigError> {
        if versions.is_empty() {
            return Err(ConfigError::NoTlsVersions);
        }
        if let Some(&missing) = versions.iter().find(|v| !self.supports(**v)) {
            return Err(ConfigError::UnsupportedTlsVersion(missing));
        }
        self.enabled = versions.to_vec();
        Ok(())
    }
}

/// Creates TLS sockets for the client.
pub trait SocketFactory: Send + Sync + fmt::Debug {
    fn default_cipher_suites(&self) -> Vec<String>;

    fn supported_cipher_suites(&self) -> Vec<String>;

    fn create_socket(&self, endpoint: Endpoint) -> Result<TlsSocket, ConfigError>;
}

/// The platform's own socket factory: sockets come out with the platform's
/// default protocol set enabled.
#[derive(Debug, Clone, Default)]
pub struct SystemSocketFactory {
    platform: Platform,
}

impl SystemSocketFactory {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }
}

impl SocketFactory for SystemSocketFactory {
    fn default_cipher_suites(&self) -> Vec<String> {
        DEFAULT_CIPHER_SUITES.iter().map(|s| s.to_string()).collect()
    }

    fn supported_cipher_suites(&self) -> Vec<String> {
        self.default_cipher_suites()
    }

    fn create_socket(&self, endpoint: Endpoint) -> Result<TlsSocket, ConfigError> {
        Ok(TlsSocket::new(
            endpoint,
            self.platform.supported_tls_versions(),
            self.platform.default_tls_versions(),
        ))
    }
}

/// Decorator that forces exactly one protocol version on every socket the
/// wrapped factory creates.
#[derive(Debug, Clone)]
pub struct TlsVersionPinning {
    delegate: Arc<dyn SocketFactory>,
    version: TlsVersion,
}

impl TlsVersionPinning {
    /// Wrap `delegate`. Fails if its sockets cannot enable `version`.
    pub fn new(delegate: Arc<dyn SocketFactory>, version: TlsVersion) -> Result<Self, ConfigError> {
        let socket = delegate.create_socket(Endpoint::Plain)?;
        if !socket.supports(version) {
            return Err(ConfigError::UnsupportedTlsVersion(version));
        }
        Ok(Self { delegate, version })
    }

    pub fn version(&self) -> TlsVersion {
        self.version
    }

    fn patch(&self, mut socket: TlsSocket) -> Result<TlsSocket, ConfigError> {
        socket.set_enabled_protocols(&[self.version])?;
        Ok(socket)
    }
}

impl SocketFactory for TlsVersionPinning {
    fn default_cipher_suites(&self) -> Vec<String> {
        self.delegate.default_cipher_suites()
    }

    fn supported_cipher_suites(&self) -> Vec<String> {
        self.delegate.supported_cipher_suites()
    }

    fn create_socket(&self, endpoint: Endpoint) -> Result<TlsSocket, ConfigError> {
        self.patch(self.delegate.create_socket(endpoint)?)
    }
}

/// One negotiation profile: a TLS version list, or cleartext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSpec {
    tls_versions: Option<Vec<TlsVersion>>,
}

impl ConnectionSpec {
    /// TLS 1.3 and 1.2.
    pub fn modern_tls() -> Self {
        Self {
            tls_versions: Some(vec![TlsVersion::Tls13, TlsVersion::Tls12]),
        }
    }

    /// Every TLS version, for servers stuck on old stacks.
    pub fn compatible_tls() -> Self {
        Self {
            tls_versions: Some(vec![
                TlsVersion::Tls13,
                TlsVersion::Tls12,
                TlsVersion::Tls11,
                TlsVersion::Tls10,
            ]),
        }
    }

    /// Unencrypted `http://`.
    pub fn cleartext() -> Self {
        Self { tls_versions: None }
    }

    /// Narrow a TLS profile to `versions`.
    pub fn with_tls_versions(self, versions: &[TlsVersion]) -> Result<Self, ConfigError> {
        if self.tls_versions.is_none() {
            return Err(ConfigError::CleartextHasNoTls);
        }
        if versions.is_empty() {
            return Err(ConfigError::NoTlsVersions);
        }
        Ok(Self {
            tls_versions: Some(versions.to_vec()),
        })
    }

    pub fn is_tls(&self) -> bool {
        self.tls_versions.is_some()
    }

    pub fn tls_versions(&self) -> Option<&[TlsVersion]> {
        self.tls_versions.as_deref()
    }

    /// Versions this spec and `socket` have in common, in the spec's order.
    pub fn negotiable_versions(&self, socket: &TlsSocket) -> Vec<TlsVersion> {
        self.tls_versions
            .iter()
            .flatten()
            .filter(|v| socket.enabled_protocols().contains(*v))
            .copied()
            .collect()
    }

    pub fn is_compatible(&self, socket: &TlsSocket) -> bool {
        !self.negotiable_versions(socket).is_empty()
    }
}

/// Specs used when nothing else is configured.
pub fn default_connection_specs() -> Vec<ConnectionSpec> {
    vec![ConnectionSpec::modern_tls(), ConnectionSpec::cleartext()]
}

/// What the transport may negotiate, resolved from specs and a sample socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPolicy {
    /// Sorted ascending. `None` when no TLS version survives, which disables https.
    pub tls_versions: Option<Vec<TlsVersion>>,
    pub allows_cleartext: bool,
}

impl TlsPolicy {
    /// The first spec compatible with `socket` wins, then the backend's own
    /// limits apply.
    pub fn resolve(specs: &[ConnectionSpec], socket: &TlsSocket) -> Self {
        let tls_versions = specs
            .iter()
            .filter(|spec| spec.is_tls())
            .map(|spec| spec.negotiable_versions(socket))
            .find(|versions| !versions.is_empty())
            .map(|mut versions| {
                versions.retain(|v| BACKEND_TLS_VERSIONS.contains(v));
                versions.sort();
                versions.dedup();
                versions
            })
            .filter(|versions| !versions.is_empty());

        Self {
            tls_versions,
            allows_cleartext: specs.iter().any(|spec| !spec.is_tls()),
        }
    }

    pub fn min_version(&self) -> Option<TlsVersion> {
        self.tls_versions.as_ref().and_then(|v| v.first().copied())
    }

    pub fn max_version(&self) -> Option<TlsVersion> {
        self.tls_versions.as_ref().and_then(|v| v.last().copied())
    }

    pub fn permits_scheme(&self, scheme: &str) -> bool {
        match scheme {
            "http" => self.allows_cleartext,
            "https" => self.tls_versions.is_some(),
            _ => false,
        }
    }
}
