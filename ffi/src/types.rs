//! `#[repr(C)]` types for the FFI boundary.
//!
//! # Design
//! Results flow from Rust to C only through the request callback, so every
//! pointer inside an `FfiHttpResult` is borrowed: `ResultStorage` owns the
//! C strings and arrays, and the result is only valid while the callback
//! runs. C code that wants to keep anything must copy it out.

use std::ffi::CString;
use std::os::raw::c_char;

use maphttp_core::{FetchError, MapHttpHandler, Outcome};

/// Opaque handle to a `MapHttpHandler`. C callers receive a pointer to this
/// and pass it back into every FFI function.
pub struct FfiHttpHandler {
    pub(crate) inner: MapHttpHandler,
}

/// A single HTTP header as a name-value pair of C strings.
#[repr(C)]
pub struct FfiHeader {
    pub name: *const c_char,
    pub value: *const c_char,
}

/// Failure category of a request. `Ok` means `status` and `body` are set.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiErrorCode {
    Ok = 0,
    Canceled = 1,
    Timeout = 2,
    Connect = 3,
    ProtocolNotPermitted = 4,
    InvalidUrl = 5,
    InvalidHeader = 6,
    Transport = 7,
}

impl From<&FetchError> for FfiErrorCode {
    fn from(err: &FetchError) -> Self {
        match err {
            FetchError::Canceled => FfiErrorCode::Canceled,
            FetchError::Timeout => FfiErrorCode::Timeout,
            FetchError::Connect(_) => FfiErrorCode::Connect,
            FetchError::ProtocolNotPermitted { .. } => FfiErrorCode::ProtocolNotPermitted,
            FetchError::InvalidUrl { .. } => FfiErrorCode::InvalidUrl,
            FetchError::InvalidHeader { .. } => FfiErrorCode::InvalidHeader,
            FetchError::Transport(_) => FfiErrorCode::Transport,
        }
    }
}

/// Outcome of one request, as handed to the C callback.
///
/// On success `error_code` is `Ok` and `error_message` is null.
/// On failure `error_code` describes the category, `error_message` is a
/// human-readable C string, and the response fields are zero or null.
#[repr(C)]
pub struct FfiHttpResult {
    pub error_code: FfiErrorCode,
    pub error_message: *const c_char,
    pub status: u16,
    pub from_cache: bool,
    pub body: *const u8,
    pub body_len: usize,
    pub headers: *const FfiHeader,
    pub headers_len: u32,
}

/// Owns everything an `FfiHttpResult` points into.
pub(crate) struct ResultStorage {
    error_code: FfiErrorCode,
    error_message: Option<CString>,
    status: u16,
    from_cache: bool,
    body: Vec<u8>,
    _header_strings: Vec<(CString, CString)>,
    headers: Vec<FfiHeader>,
}

impl ResultStorage {
    pub(crate) fn from_outcome(outcome: Outcome) -> Self {
        match outcome {
            Ok(response) => {
                let header_strings: Vec<(CString, CString)> = response
                    .headers
                    .into_iter()
                    .filter_map(|(name, value)| Some((CString::new(name).ok()?, CString::new(value).ok()?)))
                    .collect();
                let headers = header_strings
                    .iter()
                    .map(|(name, value)| FfiHeader {
                        name: name.as_ptr(),
                        value: value.as_ptr(),
                    })
                    .collect();
                Self {
                    error_code: FfiErrorCode::Ok,
                    error_message: None,
                    status: response.status,
                    from_cache: response.from_cache,
                    body: response.body,
                    _header_strings: header_strings,
                    headers,
                }
            }
            Err(err) => Self::error(FfiErrorCode::from(&err), &err.to_string()),
        }
    }

    fn error(code: FfiErrorCode, message: &str) -> Self {
        Self {
            error_code: code,
            error_message: Some(c_string_lossy(message)),
            status: 0,
            from_cache: false,
            body: Vec::new(),
            _header_strings: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// A view whose pointers live as long as `self`.
    pub(crate) fn as_ffi(&self) -> FfiHttpResult {
        FfiHttpResult {
            error_code: self.error_code,
            error_message: self
                .error_message
                .as_ref()
                .map_or(std::ptr::null(), |m| m.as_ptr()),
            status: self.status,
            from_cache: self.from_cache,
            body: if self.body.is_empty() {
                std::ptr::null()
            } else {
                self.body.as_ptr()
            },
            body_len: self.body.len(),
            headers: if self.headers.is_empty() {
                std::ptr::null()
            } else {
                self.headers.as_ptr()
            },
            headers_len: self.headers.len() as u32,
        }
    }
}

/// Interior NULs are stripped rather than failing the conversion.
fn c_string_lossy(s: &str) -> CString {
    CString::new(s.replace('\0', "")).unwrap_or_default()
}
