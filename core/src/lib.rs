//! HTTP adapter for a map-rendering engine.
//!
//! # Overview
//! The renderer asks for resources through the `HttpHandler` trait: start a
//! GET with `on_request`, abandon it with `on_cancel`. `MapHttpHandler`
//! answers both on top of an `HttpClient` that carries fixed timeouts, an
//! optional disk cache, and a TLS 1.2 workaround for old platform versions.
//!
//! # Design
//! - `client`, `dispatcher`, `call`, and `exchange` form the client layer: a
//!   builder-configured reqwest transport whose calls are scheduled by a
//!   dispatcher with global and per-host limits on a private tokio runtime.
//! - `tls` models sockets, socket factories, and connection specs, and
//!   `platform` decides when sockets get pinned to TLS 1.2.
//! - `cache` persists responses to disk under an LRU size bound.
//! - Request outcomes always travel through the callback. Setup problems
//!   go to a `DiagnosticSink` and never stop a handler from being built.

pub mod cache;
pub mod call;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
mod exchange;
pub mod handler;
pub mod http;
pub mod platform;
pub mod tls;

pub use cache::DiskCache;
pub use call::{Call, Callback, Outcome};
pub use client::{ClientBuilder, HttpClient};
pub use config::{CacheConfig, HandlerConfig};
pub use error::{ConfigError, FetchError};
pub use handler::{DiagnosticSink, HandlerOptions, HttpHandler, MapHttpHandler, TracingDiagnostics};
pub use http::{HttpRequest, HttpResponse};
pub use platform::Platform;
pub use tls::{ConnectionSpec, SocketFactory, TlsVersion};
