//! The adapter the map renderer talks to.
//!
//! # Design
//! `MapHttpHandler` owns one `HttpClient`, configured once at construction
//! with the fixed timeouts, an optional disk cache, and the TLS 1.2 pin on
//! platforms that need it. It keeps no call registry of its own:
//! cancellation walks a snapshot of the dispatcher's running and queued calls.
//!
//! Construction never fails because of an optional feature. A cache that
//! cannot be opened, or a TLS patch that cannot be applied, is reported to
//! the `DiagnosticSink` and the handler carries on without it.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::DiskCache;
use crate::call::Callback;
use crate::client::{ClientBuilder, HttpClient};
use crate::config::{CacheConfig, HandlerConfig, CONNECT_TIMEOUT, READ_TIMEOUT, WRITE_TIMEOUT};
use crate::error::ConfigError;
use crate::http::HttpRequest;
use crate::platform::Platform;
use crate::tls::{ConnectionSpec, SocketFactory, SystemSocketFactory, TlsVersion, TlsVersionPinning};

/// The network capability a map renderer plugs in.
pub trait HttpHandler: Send + Sync {
    /// Start an asynchronous GET of `url`. `callback` is invoked exactly
    /// once. Returns `true` once the request is enqueued.
    fn on_request(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        callback: Box<dyn Callback>,
    ) -> bool;

    /// Cancel every running or queued request whose canonical URL string
    /// equals `url` exactly.
    fn on_cancel(&self, url: &str);
}

/// Receives non-fatal setup failures.
pub trait DiagnosticSink: Send + Sync {
    fn error(&self, message: &str, cause: &(dyn StdError + 'static));
}

/// Default sink: an `error` event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn error(&self, message: &str, cause: &(dyn StdError + 'static)) {
        tracing::error!(error = %cause, "{message}");
    }
}

/// Everything a handler can be constructed from.
#[derive(Clone)]
pub struct HandlerOptions {
    pub cache: Option<CacheConfig>,
    pub platform: Platform,
    /// Replaces the platform's own socket factory.
    pub socket_factory: Option<Arc<dyn SocketFactory>>,
    pub diagnostics: Arc<dyn DiagnosticSink>,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            cache: None,
            platform: Platform::detect(),
            socket_factory: None,
            diagnostics: Arc::new(TracingDiagnostics),
        }
    }
}

impl From<HandlerConfig> for HandlerOptions {
    fn from(config: HandlerConfig) -> Self {
        Self {
            cache: config.cache(),
            platform: config
                .platform_api_level
                .map_or_else(Platform::detect, Platform::android),
            ..Self::default()
        }
    }
}

impl fmt::Debug for HandlerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerOptions")
            .field("cache", &self.cache)
            .field("platform", &self.platform)
            .field("socket_factory", &self.socket_factory)
            .finish_non_exhaustive()
    }
}

/// `HttpHandler` backed by an `HttpClient`.
#[derive(Debug, Clone)]
pub struct MapHttpHandler {
    client: HttpClient,
}

impl MapHttpHandler {
    /// No cache; platform detected.
    pub fn new() -> Result<Self, ConfigError> {
        Self::with_options(HandlerOptions::default())
    }

    /// Cache responses under `directory`, bounded by `max_size` bytes. A
    /// non-positive `max_size` disables caching.
    pub fn with_cache(directory: impl Into<PathBuf>, max_size: i64) -> Result<Self, ConfigError> {
        Self::with_options(HandlerOptions {
            cache: CacheConfig::resolve(Some(directory.into()), max_size),
            ..HandlerOptions::default()
        })
    }

    pub fn from_config(config: HandlerConfig) -> Result<Self, ConfigError> {
        Self::with_options(config.into())
    }

    pub fn with_options(options: HandlerOptions) -> Result<Self, ConfigError> {
        let HandlerOptions {
            cache,
            platform,
            socket_factory,
            diagnostics,
        } = options;

        let mut builder = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .write_timeout(WRITE_TIMEOUT)
            .read_timeout(READ_TIMEOUT);

        if let Some(CacheConfig {
            directory,
            max_size,
        }) = cache
        {
            match DiskCache::open(&directory, max_size) {
                Ok(cache) => builder = builder.cache(cache),
                Err(source) => diagnostics.error(
                    "Unable to open response cache",
                    &ConfigError::Cache {
                        path: directory,
                        source,
                    },
                ),
            }
        }

        let factory =
            socket_factory.unwrap_or_else(|| Arc::new(SystemSocketFactory::new(platform)));
        let builder = builder.socket_factory(factory.clone());

        if platform.needs_tls12_patch() {
            match enable_tls12(builder.clone(), factory).and_then(ClientBuilder::build) {
                Ok(client) => return Ok(Self { client }),
                Err(e) => diagnostics.error("Error while setting TLS 1.2", &e),
            }
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }
}

/// Pin sockets to TLS 1.2 and order the connection specs
/// modern (1.2 only), compatible, cleartext.
fn enable_tls12(
    builder: ClientBuilder,
    factory: Arc<dyn SocketFactory>,
) -> Result<ClientBuilder, ConfigError> {
    let pinned = TlsVersionPinning::new(factory, TlsVersion::Tls12)?;
    let modern = ConnectionSpec::modern_tls().with_tls_versions(&[TlsVersion::Tls12])?;
    Ok(builder
        .socket_factory(Arc::new(pinned))
        .connection_specs(vec![
            modern,
            ConnectionSpec::compatible_tls(),
            ConnectionSpec::cleartext(),
        ]))
}

impl HttpHandler for MapHttpHandler {
    fn on_request(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        callback: Box<dyn Callback>,
    ) -> bool {
        match HttpRequest::get(url, headers) {
            Ok(request) => {
                self.client.enqueue(request, callback);
                true
            }
            Err(e) => {
                tracing::debug!(url, error = %e, "request rejected");
                callback.on_complete(Err(e));
                false
            }
        }
    }

    fn on_cancel(&self, url: &str) {
        for call in self
            .client
            .dispatcher()
            .all_calls()
            .into_iter()
            .filter(|call| call.request().url().as_str() == url)
        {
            tracing::debug!(id = %call.id(), url, "canceling call");
            call.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::tls::{Endpoint, TlsSocket};

    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl DiagnosticSink for RecordingSink {
        fn error(&self, message: &str, cause: &(dyn StdError + 'static)) {
            self.messages
                .lock()
                .unwrap()
                .push(format!("{message}: {cause}"));
        }
    }

    /// Sockets that only ever speak TLS 1.0.
    #[derive(Debug)]
    struct Tls10OnlyFactory;

    impl SocketFactory for Tls10OnlyFactory {
        fn default_cipher_suites(&self) -> Vec<String> {
            Vec::new()
        }

        fn supported_cipher_suites(&self) -> Vec<String> {
            Vec::new()
        }

        fn create_socket(&self, endpoint: Endpoint) -> Result<TlsSocket, ConfigError> {
            Ok(TlsSocket::new(
                endpoint,
                vec![TlsVersion::Tls10],
                vec![TlsVersion::Tls10],
            ))
        }
    }

    fn options(platform: Platform, sink: Arc<RecordingSink>) -> HandlerOptions {
        HandlerOptions {
            cache: None,
            platform,
            socket_factory: None,
            diagnostics: sink,
        }
    }

    #[test]
    fn patched_platform_pins_tls12() {
        let sink = Arc::new(RecordingSink::default());
        let handler = MapHttpHandler::with_options(options(Platform::android(19), sink.clone()))
            .unwrap();
        let client = handler.client();

        assert_eq!(client.tls_versions(), Some(&[TlsVersion::Tls12][..]));
        assert_eq!(
            client.connection_specs(),
            &[
                ConnectionSpec::modern_tls()
                    .with_tls_versions(&[TlsVersion::Tls12])
                    .unwrap(),
                ConnectionSpec::compatible_tls(),
                ConnectionSpec::cleartext(),
            ]
        );
        let socket = client.socket_factory().create_socket(Endpoint::Plain).unwrap();
        assert_eq!(socket.enabled_protocols(), &[TlsVersion::Tls12]);
        assert!(sink.messages().is_empty());
    }

    #[test]
    fn patch_boundaries() {
        for (level, pinned) in [(15, false), (16, true), (21, true), (22, false), (23, false)] {
            let sink = Arc::new(RecordingSink::default());
            let handler =
                MapHttpHandler::with_options(options(Platform::android(level), sink)).unwrap();
            let socket = handler
                .client()
                .socket_factory()
                .create_socket(Endpoint::Plain)
                .unwrap();
            let expected = Platform::android(level).default_tls_versions();
            if pinned {
                assert_eq!(socket.enabled_protocols(), &[TlsVersion::Tls12], "level {level}");
            } else {
                assert_eq!(socket.enabled_protocols(), expected.as_slice(), "level {level}");
            }
        }
    }

    #[test]
    fn failed_patch_is_reported_and_skipped() {
        let sink = Arc::new(RecordingSink::default());
        let handler = MapHttpHandler::with_options(HandlerOptions {
            socket_factory: Some(Arc::new(Tls10OnlyFactory)),
            ..options(Platform::android(19), sink.clone())
        })
        .unwrap();

        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("Error while setting TLS 1.2"));
        let socket = handler
            .client()
            .socket_factory()
            .create_socket(Endpoint::Plain)
            .unwrap();
        assert_eq!(socket.enabled_protocols(), &[TlsVersion::Tls10]);
    }

    #[test]
    fn unopenable_cache_is_reported_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let sink = Arc::new(RecordingSink::default());
        let handler = MapHttpHandler::with_options(HandlerOptions {
            cache: CacheConfig::resolve(Some(blocker), 1024),
            ..options(Platform::host(), sink.clone())
        })
        .unwrap();

        assert!(handler.client().cache().is_none());
        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("Unable to open response cache"));
    }

    #[test]
    fn cache_needs_positive_size() {
        let dir = tempfile::tempdir().unwrap();
        for size in [0, -1] {
            let handler = MapHttpHandler::with_cache(dir.path(), size).unwrap();
            assert!(handler.client().cache().is_none());
        }
        let handler = MapHttpHandler::with_cache(dir.path(), 1 << 20).unwrap();
        assert_eq!(handler.client().cache().unwrap().max_size(), 1 << 20);
    }

    #[test]
    fn fixed_timeouts_apply() {
        let handler = MapHttpHandler::new().unwrap();
        let client = handler.client();
        assert_eq!(client.connect_timeout(), CONNECT_TIMEOUT);
        assert_eq!(client.write_timeout(), WRITE_TIMEOUT);
        assert_eq!(client.read_timeout(), READ_TIMEOUT);
    }

    #[test]
    fn config_selects_platform() {
        let handler = MapHttpHandler::from_config(HandlerConfig {
            platform_api_level: Some(20),
            ..HandlerConfig::default()
        })
        .unwrap();
        assert_eq!(handler.client().tls_versions(), Some(&[TlsVersion::Tls12][..]));
    }

    #[test]
    fn invalid_url_fails_through_callback() {
        let handler = MapHttpHandler::new().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let accepted = handler.on_request(
            "not a url",
            &HashMap::new(),
            Box::new(move |outcome: crate::call::Outcome| {
                tx.send(outcome).unwrap();
            }),
        );
        assert!(!accepted);
        let outcome = rx.try_recv().unwrap();
        assert!(matches!(outcome, Err(crate::error::FetchError::InvalidUrl { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cancel_without_matches_is_a_no_op() {
        let handler = MapHttpHandler::new().unwrap();
        handler.on_cancel("https://tiles.example.com/0/0/0.png");
        handler.on_cancel("::not a url::");
        assert_eq!(handler.client().dispatcher().running_calls_count(), 0);
    }
}
