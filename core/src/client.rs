//! The HTTP client the adapter configures.
//!
//! # Design
//! `ClientBuilder` collects immutable settings, and `build` turns them into a
//! reqwest transport, a dispatcher, and a private tokio runtime. The TLS range
//! handed to reqwest comes from probing the socket factory and resolving it
//! against the connection specs (see `tls::TlsPolicy`). The runtime is
//! dropped with `shutdown_background`, so a client can be released from any
//! thread, including one of its own callbacks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;

use crate::cache::DiskCache;
use crate::call::{Call, Callback};
use crate::dispatcher::{Dispatcher, DEFAULT_MAX_REQUESTS, DEFAULT_MAX_REQUESTS_PER_HOST};
use crate::error::ConfigError;
use crate::exchange::Exchange;
use crate::http::HttpRequest;
use crate::tls::{
    default_connection_specs, ConnectionSpec, Endpoint, SocketFactory, SystemSocketFactory,
    TlsPolicy, TlsVersion,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const WORKER_THREADS: usize = 2;

/// Settings for an `HttpClient`.
#[derive(Clone)]
pub struct ClientBuilder {
    connect_timeout: Duration,
    write_timeout: Duration,
    read_timeout: Duration,
    cache: Option<Arc<DiskCache>>,
    socket_factory: Arc<dyn SocketFactory>,
    connection_specs: Vec<ConnectionSpec>,
    max_requests: usize,
    max_requests_per_host: usize,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_TIMEOUT,
            cache: None,
            socket_factory: Arc::new(SystemSocketFactory::default()),
            connection_specs: default_connection_specs(),
            max_requests: DEFAULT_MAX_REQUESTS,
            max_requests_per_host: DEFAULT_MAX_REQUESTS_PER_HOST,
        }
    }
}

impl ClientBuilder {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn cache(mut self, cache: DiskCache) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    pub fn socket_factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.socket_factory = factory;
        self
    }

    pub fn connection_specs(mut self, specs: Vec<ConnectionSpec>) -> Self {
        self.connection_specs = specs;
        self
    }

    pub fn max_requests(mut self, max: usize) -> Self {
        self.max_requests = max;
        self
    }

    pub fn max_requests_per_host(mut self, max: usize) -> Self {
        self.max_requests_per_host = max;
        self
    }

    pub fn build(self) -> Result<HttpClient, ConfigError> {
        let socket = self.socket_factory.create_socket(Endpoint::Plain)?;
        let tls_policy = TlsPolicy::resolve(&self.connection_specs, &socket);

        let mut transport = reqwest::Client::builder()
            .use_rustls_tls()
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout)
            .https_only(!tls_policy.allows_cleartext);
        if let (Some(min), Some(max)) = (tls_policy.min_version(), tls_policy.max_version()) {
            transport = transport
                .min_tls_version(min.to_reqwest())
                .max_tls_version(max.to_reqwest());
        }
        let transport = transport.build()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .thread_name("maphttp-dispatcher")
            .enable_all()
            .build()
            .map_err(ConfigError::Runtime)?;

        let exchange = Arc::new(Exchange {
            transport,
            cache: self.cache.clone(),
            tls_policy,
            response_deadline: self.write_timeout + self.read_timeout,
        });
        let dispatcher = Dispatcher::new(
            exchange.clone(),
            runtime.handle().clone(),
            self.max_requests,
            self.max_requests_per_host,
        );

        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                connect_timeout: self.connect_timeout,
                write_timeout: self.write_timeout,
                read_timeout: self.read_timeout,
                socket_factory: self.socket_factory,
                connection_specs: self.connection_specs,
                exchange,
                dispatcher,
                _runtime: RuntimeGuard(Some(runtime)),
            }),
        })
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("connect_timeout", &self.connect_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("cache", &self.cache.as_ref().map(|c| c.directory()))
            .field("socket_factory", &self.socket_factory)
            .field("connection_specs", &self.connection_specs)
            .finish()
    }
}

struct RuntimeGuard(Option<Runtime>);

impl Drop for RuntimeGuard {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

struct ClientInner {
    connect_timeout: Duration,
    write_timeout: Duration,
    read_timeout: Duration,
    socket_factory: Arc<dyn SocketFactory>,
    connection_specs: Vec<ConnectionSpec>,
    exchange: Arc<Exchange>,
    dispatcher: Dispatcher,
    _runtime: RuntimeGuard,
}

/// A configured HTTP client. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl HttpClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Queue `request` for asynchronous execution. `callback` fires exactly
    /// once, on a dispatcher thread.
    pub fn enqueue(&self, request: HttpRequest, callback: Box<dyn Callback>) -> Arc<Call> {
        let call = Arc::new(Call::new(request));
        self.inner.dispatcher.enqueue(call.clone(), callback);
        call
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn connect_timeout(&self) -> Duration {
        self.inner.connect_timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.inner.write_timeout
    }

    pub fn read_timeout(&self) -> Duration {
        self.inner.read_timeout
    }

    pub fn cache(&self) -> Option<&DiskCache> {
        self.inner.exchange.cache.as_deref()
    }

    pub fn socket_factory(&self) -> &dyn SocketFactory {
        self.inner.socket_factory.as_ref()
    }

    pub fn connection_specs(&self) -> &[ConnectionSpec] {
        &self.inner.connection_specs
    }

    /// TLS versions the transport may negotiate, ascending. `None` means
    /// https is unavailable.
    pub fn tls_versions(&self) -> Option<&[TlsVersion]> {
        self.inner.exchange.tls_policy.tls_versions.as_deref()
    }

    pub fn allows_cleartext(&self) -> bool {
        self.inner.exchange.tls_policy.allows_cleartext
    }
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("connect_timeout", &self.inner.connect_timeout)
            .field("write_timeout", &self.inner.write_timeout)
            .field("read_timeout", &self.inner.read_timeout)
            .field("cache", &self.cache().map(|c| c.directory()))
            .field("tls_versions", &self.tls_versions())
            .field("dispatcher", &self.inner.dispatcher)
            .finish()
    }
}
