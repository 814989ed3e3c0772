//! Request and response values passed between the adapter and the client.
//!
//! # Design
//! `HttpRequest` is validated at construction: the URL is parsed into its
//! canonical form and every header is checked against HTTP grammar, so
//! anything that reaches the dispatcher can be sent as-is. Cancellation
//! compares its raw argument against the canonical URL string (`Url::as_str`).
//!
//! `HttpResponse` is plain owned data so it can be handed to any callback,
//! including one on the far side of a C boundary.

use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, IF_MODIFIED_SINCE, IF_NONE_MATCH,
};
use url::Url;

use crate::error::FetchError;

/// A body-less GET request for a single resource.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    url: Url,
    headers: HeaderMap,
}

impl HttpRequest {
    /// Build a GET request, validating the URL and every header.
    pub fn get<I, K, V>(url: &str, headers: I) -> Result<Self, FetchError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {:?}", parsed.scheme()),
            });
        }

        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let (name, value) = (name.as_ref(), value.as_ref());
            let invalid = || FetchError::InvalidHeader {
                name: name.to_string(),
            };
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
            let header_value = HeaderValue::from_str(value).map_err(|_| invalid())?;
            header_map.insert(header_name, header_value);
        }

        Ok(Self {
            url: parsed,
            headers: header_map,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Host used for per-host concurrency accounting.
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// True when the caller asked to skip stored responses.
    pub fn bypasses_cache(&self) -> bool {
        cache_directives(self.headers.get_all(CACHE_CONTROL).iter().filter_map(|v| v.to_str().ok()))
            .any(|d| d == "no-cache" || d == "no-store")
    }

    pub(crate) fn forbids_storage(&self) -> bool {
        cache_directives(self.headers.get_all(CACHE_CONTROL).iter().filter_map(|v| v.to_str().ok()))
            .any(|d| d == "no-store")
    }

    /// True when the caller sent its own `If-None-Match` or `If-Modified-Since`.
    pub(crate) fn is_conditional(&self) -> bool {
        self.headers.contains_key(IF_NONE_MATCH) || self.headers.contains_key(IF_MODIFIED_SINCE)
    }
}

/// A completed exchange. Non-2xx statuses are still responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Served from the disk cache, either fresh or after a 304 revalidation.
    pub from_cache: bool,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First value of `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Split `Cache-Control` values into lowercase directive tokens
/// (`max-age=60` stays one token).
pub(crate) fn cache_directives<'a, I>(values: I) -> impl Iterator<Item = String> + 'a
where
    I: Iterator<Item = &'a str> + 'a,
{
    values
        .flat_map(|v| v.split(','))
        .map(|d| d.trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_headers() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn get_parses_url_into_canonical_form() {
        let req = HttpRequest::get("HTTPS://Example.com", no_headers()).unwrap();
        assert_eq!(req.url().as_str(), "https://example.com/");
        assert_eq!(req.host(), "example.com");
        assert!(req.headers().is_empty());
    }

    #[test]
    fn get_keeps_headers() {
        let req = HttpRequest::get(
            "https://tiles.example.com/1/2/3.mvt",
            [("User-Agent", "maphttp"), ("X-Api-Key", "k")],
        )
        .unwrap();
        assert_eq!(req.headers()["user-agent"], "maphttp");
        assert_eq!(req.headers()["x-api-key"], "k");
    }

    #[test]
    fn get_rejects_relative_url() {
        let err = HttpRequest::get("/tile/1", no_headers()).unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
    }

    #[test]
    fn get_rejects_non_http_scheme() {
        let err = HttpRequest::get("ftp://example.com/tile", no_headers()).unwrap_err();
        match err {
            FetchError::InvalidUrl { reason, .. } => assert!(reason.contains("ftp")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn get_rejects_illegal_header_name() {
        let err = HttpRequest::get("https://example.com/", [("bad header", "v")]).unwrap_err();
        assert!(matches!(err, FetchError::InvalidHeader { name } if name == "bad header"));
    }

    #[test]
    fn get_rejects_header_value_with_newline() {
        let err = HttpRequest::get("https://example.com/", [("x-key", "a\nb")]).unwrap_err();
        assert!(matches!(err, FetchError::InvalidHeader { .. }));
    }

    #[test]
    fn no_cache_request_bypasses_cache() {
        let req = HttpRequest::get("https://example.com/", [("Cache-Control", "max-age=0, No-Cache")]).unwrap();
        assert!(req.bypasses_cache());
        assert!(!req.forbids_storage());
    }

    #[test]
    fn no_store_request_forbids_storage() {
        let req = HttpRequest::get("https://example.com/", [("cache-control", "no-store")]).unwrap();
        assert!(req.bypasses_cache());
        assert!(req.forbids_storage());
    }

    #[test]
    fn validator_headers_make_request_conditional() {
        let plain = HttpRequest::get("https://example.com/", no_headers()).unwrap();
        assert!(!plain.is_conditional());
        let etag = HttpRequest::get("https://example.com/", [("If-None-Match", "\"v2\"")]).unwrap();
        assert!(etag.is_conditional());
        let date = HttpRequest::get(
            "https://example.com/",
            [("if-modified-since", "Wed, 21 Oct 2015 07:28:00 GMT")],
        )
        .unwrap();
        assert!(date.is_conditional());
    }

    #[test]
    fn directives_are_split_and_lowercased() {
        let directives: Vec<String> = cache_directives(["No-Cache, max-age=60", " ,private"].into_iter()).collect();
        assert_eq!(directives, ["no-cache", "max-age=60", "private"]);
    }

    #[test]
    fn response_header_lookup_is_case_insensitive() {
        let resp = HttpResponse {
            status: 200,
            headers: vec![("Content-Type".to_string(), "image/png".to_string())],
            body: Vec::new(),
            from_cache: false,
        };
        assert_eq!(resp.header("content-type"), Some("image/png"));
        assert_eq!(resp.header("etag"), None);
        assert!(resp.is_success());
    }

    #[test]
    fn not_found_is_not_success() {
        let resp = HttpResponse {
            status: 404,
            headers: Vec::new(),
            body: Vec::new(),
            from_cache: false,
        };
        assert!(!resp.is_success());
    }
}
