//! Error types for the map HTTP adapter.
//!
//! # Design
//! Two families with different propagation rules. `ConfigError` covers
//! anything that can go wrong while a client is being assembled; the adapter
//! reports most of these to its diagnostic sink and degrades instead of
//! failing. `FetchError` is the failure half of a request outcome and is
//! always handed to the request's callback, never returned from
//! `on_request`.

use std::path::PathBuf;

use crate::tls::TlsVersion;

/// Errors raised while configuring or building an `HttpClient`.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The socket factory cannot enable the requested protocol version.
    #[error("{0} is not supported by the socket factory")]
    UnsupportedTlsVersion(TlsVersion),

    /// A TLS connection spec was given an empty version list.
    #[error("TLS connection spec requires at least one TLS version")]
    NoTlsVersions,

    /// A TLS version list was applied to the cleartext spec.
    #[error("cleartext connection spec cannot carry TLS versions")]
    CleartextHasNoTls,

    /// The underlying reqwest client refused the configuration.
    #[error("failed to build HTTP transport: {0}")]
    Client(#[from] reqwest::Error),

    /// The dispatcher's worker runtime could not be started.
    #[error("failed to start dispatcher runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// The response cache directory could not be prepared.
    #[error("failed to open response cache at {}: {source}", path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A handler configuration document was malformed.
    #[error("invalid handler configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure outcome of a single request.
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    /// The call was cancelled before it produced a response.
    #[error("Canceled")]
    Canceled,

    /// Connecting, sending, or reading exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// DNS resolution, TCP connect, or the TLS handshake failed.
    #[error("connection failed: {0}")]
    Connect(String),

    /// No connection spec permits this scheme (for example plain `http` without
    /// a cleartext spec).
    #[error("{scheme} communication not enabled for client")]
    ProtocolNotPermitted { scheme: String },

    /// The URL is not an absolute http(s) URL.
    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A header name or value is not legal HTTP.
    #[error("invalid header {name:?}")]
    InvalidHeader { name: String },

    /// Any other transport failure (protocol error, body read failure).
    #[error("transport error: {0}")]
    Transport(String),
}

impl FetchError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, FetchError::Canceled)
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_connect() {
            FetchError::Connect(error_chain(&err))
        } else {
            FetchError::Transport(error_chain(&err))
        }
    }
}

/// Flatten an error and its sources into one line. reqwest's own `Display`
/// stops at the outermost layer, which hides the useful part (DNS, TLS).
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Leaf;

    impl std::fmt::Display for Leaf {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "dns lookup failed")
        }
    }

    impl std::error::Error for Leaf {}

    #[derive(Debug)]
    struct Outer(Leaf);

    impl std::fmt::Display for Outer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "error sending request")
        }
    }

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn error_chain_joins_sources() {
        assert_eq!(
            error_chain(&Outer(Leaf)),
            "error sending request: dns lookup failed"
        );
    }

    #[test]
    fn canceled_displays_like_a_cancelled_call() {
        assert_eq!(FetchError::Canceled.to_string(), "Canceled");
        assert!(FetchError::Canceled.is_canceled());
        assert!(!FetchError::Timeout.is_canceled());
    }

    #[test]
    fn protocol_not_permitted_names_scheme() {
        let err = FetchError::ProtocolNotPermitted {
            scheme: "http".to_string(),
        };
        assert_eq!(err.to_string(), "http communication not enabled for client");
    }

    #[test]
    fn unsupported_tls_version_names_version() {
        let err = ConfigError::UnsupportedTlsVersion(TlsVersion::Tls12);
        assert_eq!(err.to_string(), "TLSv1.2 is not supported by the socket factory");
    }

    #[test]
    fn cache_error_includes_path() {
        let err = ConfigError::Cache {
            path: PathBuf::from("/tmp/tiles"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(err.to_string(), "failed to open response cache at /tmp/tiles: denied");
    }
}
