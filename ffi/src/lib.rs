//! C-ABI wrapper around `maphttp-core`.
//!
//! # Overview
//! Exposes the map HTTP adapter through `extern "C"` functions so a C or C++
//! map engine can start and cancel tile requests without linking against
//! Rust's async runtime directly.
//!
//! # Design
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - A handler is an opaque heap object created by `maphttp_handler_new*`
//!   and released with `maphttp_handler_free`.
//! - Results are pushed to a C callback together with the caller's
//!   `user_data`. The `FfiHttpResult` and everything it points to are
//!   borrowed for the duration of the callback only.

pub mod types;

use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;

use maphttp_core::{ConfigError, HandlerConfig, HttpHandler, MapHttpHandler, Outcome};

use types::*;

/// Completion callback. Invoked exactly once per accepted request, on a
/// dispatcher thread. `result` is only valid during the call.
pub type FfiRequestCallback = extern "C" fn(user_data: *mut c_void, result: *const FfiHttpResult);

/// Caller context carried to the dispatcher thread. The C side guarantees
/// it stays valid until the callback has run.
struct UserData(*mut c_void);

unsafe impl Send for UserData {}

impl UserData {
    fn as_ptr(&self) -> *mut c_void {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Handler lifecycle
// ---------------------------------------------------------------------------

/// Create a handler.
///
/// `cache_dir` may be null for no cache. A `max_cache_size` of zero or less
/// also disables caching. A negative `platform_api_level` means detect the
/// running platform.
/// Returns null if an internal panic occurs or the client cannot be built.
/// The caller must free the returned pointer with `maphttp_handler_free`.
#[unsafe(no_mangle)]
pub extern "C" fn maphttp_handler_new(
    cache_dir: *const c_char,
    max_cache_size: i64,
    platform_api_level: i32,
) -> *mut FfiHttpHandler {
    catch_unwind(|| {
        let cache_directory = if cache_dir.is_null() {
            None
        } else {
            let dir = unsafe { CStr::from_ptr(cache_dir) }.to_string_lossy();
            Some(PathBuf::from(dir.into_owned()))
        };
        let config = HandlerConfig {
            cache_directory,
            max_cache_size,
            platform_api_level: u32::try_from(platform_api_level).ok(),
        };
        into_handle(MapHttpHandler::from_config(config))
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Create a handler from a JSON document, for example
/// `{"cache_directory": "/data/tiles", "max_cache_size": 52428800}`.
///
/// Returns null if `config_json` is null, malformed, or the client cannot
/// be built.
#[unsafe(no_mangle)]
pub extern "C" fn maphttp_handler_new_from_json(config_json: *const c_char) -> *mut FfiHttpHandler {
    catch_unwind(|| {
        if config_json.is_null() {
            return std::ptr::null_mut();
        }
        let json = unsafe { CStr::from_ptr(config_json) }.to_string_lossy();
        into_handle(HandlerConfig::from_json(&json).and_then(MapHttpHandler::from_config))
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Free a handler. Safe to call with null. Requests still in flight are
/// cancelled and their callbacks invoked before or shortly after this
/// returns.
#[unsafe(no_mangle)]
pub extern "C" fn maphttp_handler_free(handler: *mut FfiHttpHandler) {
    if !handler.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(handler) });
        }));
    }
}

fn into_handle(handler: Result<MapHttpHandler, ConfigError>) -> *mut FfiHttpHandler {
    match handler {
        Ok(inner) => Box::into_raw(Box::new(FfiHttpHandler { inner })),
        Err(e) => {
            tracing::error!(error = %e, "failed to create HTTP handler");
            std::ptr::null_mut()
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Start a GET request for `url`.
///
/// Returns true once the request is queued; `callback` then fires exactly
/// once with the outcome. Returns false if an argument is null, in which
/// case the callback never fires, or if `url` or a header is invalid, in
/// which case the callback has already fired with the error.
/// Header entries with a null name or value are ignored.
#[unsafe(no_mangle)]
pub extern "C" fn maphttp_request(
    handler: *const FfiHttpHandler,
    url: *const c_char,
    headers: *const FfiHeader,
    headers_len: u32,
    callback: Option<FfiRequestCallback>,
    user_data: *mut c_void,
) -> bool {
    catch_unwind(AssertUnwindSafe(|| {
        let Some(callback) = callback else {
            return false;
        };
        if handler.is_null() || url.is_null() || (headers.is_null() && headers_len > 0) {
            return false;
        }
        let handler = unsafe { &*handler };
        let url = unsafe { CStr::from_ptr(url) }.to_string_lossy();
        let headers = unsafe { read_headers(headers, headers_len) };
        let user_data = UserData(user_data);

        handler.inner.on_request(
            &url,
            &headers,
            Box::new(move |outcome: Outcome| deliver(callback, &user_data, outcome)),
        )
    }))
    .unwrap_or(false)
}

/// Cancel every running or queued request for exactly `url`. No-op if
/// `handler` or `url` is null or nothing matches.
#[unsafe(no_mangle)]
pub extern "C" fn maphttp_cancel(handler: *const FfiHttpHandler, url: *const c_char) {
    if handler.is_null() || url.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let handler = unsafe { &*handler };
        let url = unsafe { CStr::from_ptr(url) }.to_string_lossy();
        handler.inner.on_cancel(&url);
    }));
}

unsafe fn read_headers(headers: *const FfiHeader, len: u32) -> HashMap<String, String> {
    if headers.is_null() || len == 0 {
        return HashMap::new();
    }
    let entries = unsafe { std::slice::from_raw_parts(headers, len as usize) };
    entries
        .iter()
        .filter(|h| !h.name.is_null() && !h.value.is_null())
        .map(|h| {
            let name = unsafe { CStr::from_ptr(h.name) }.to_string_lossy().into_owned();
            let value = unsafe { CStr::from_ptr(h.value) }.to_string_lossy().into_owned();
            (name, value)
        })
        .collect()
}

fn deliver(callback: FfiRequestCallback, user_data: &UserData, outcome: Outcome) {
    let storage = ResultStorage::from_outcome(outcome);
    let result = storage.as_ffi();
    callback(user_data.as_ptr(), &result);
}
