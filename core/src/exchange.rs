//! Executes one call: cache lookup, network transfer, cache store.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH};

use crate::cache::{now_secs, CachedResponse, DiskCache};
use crate::call::{Call, Outcome};
use crate::error::FetchError;
use crate::http::{HttpRequest, HttpResponse};
use crate::tls::TlsPolicy;

/// Shared by every call of one client.
#[derive(Debug)]
pub(crate) struct Exchange {
    pub(crate) transport: reqwest::Client,
    pub(crate) cache: Option<Arc<DiskCache>>,
    pub(crate) tls_policy: TlsPolicy,
    /// Deadline for the request head to go out and the response head to come back.
    pub(crate) response_deadline: Duration,
}

impl Exchange {
    /// Run `call` to completion, racing it against cancellation.
    pub(crate) async fn execute(&self, call: &Call) -> Outcome {
        if call.is_canceled() {
            return Err(FetchError::Canceled);
        }
        tokio::select! {
            biased;
            () = call.canceled() => Err(FetchError::Canceled),
            outcome = self.fetch(call.request()) => outcome,
        }
    }

    async fn fetch(&self, request: &HttpRequest) -> Outcome {
        let url = request.url();
        if !self.tls_policy.permits_scheme(url.scheme()) {
            return Err(FetchError::ProtocolNotPermitted {
                scheme: url.scheme().to_string(),
            });
        }

        // A caller-supplied validator is answered for the caller's copy, not ours.
        let cache = self
            .cache
            .as_ref()
            .filter(|_| !request.bypasses_cache() && !request.is_conditional());

        let cached = match cache {
            Some(cache) => {
                let key = url.to_string();
                on_cache(cache, move |cache| Ok(cache.get(&key)))
                    .await
                    .unwrap_or_else(|e| {
                        tracing::warn!(url = %url, error = %e, "cache lookup failed");
                        None
                    })
            }
            None => None,
        };
        if let Some(entry) = &cached {
            if entry.is_fresh(now_secs()) {
                tracing::debug!(url = %url, "serving fresh cached response");
                return Ok(entry.clone().into_response());
            }
        }

        let mut headers = request.headers().clone();
        if let Some(entry) = &cached {
            add_validators(&mut headers, entry);
        }

        let send = self.transport.get(url.clone()).headers(headers).send();
        let response = tokio::time::timeout(self.response_deadline, send)
            .await
            .map_err(|_| FetchError::Timeout)??;

        let status = response.status().as_u16();
        let response_headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        if let (304, Some(mut entry), Some(cache)) = (status, cached, cache) {
            tracing::debug!(url = %url, "cached response revalidated");
            entry.merge_headers(&response_headers);
            let key = url.to_string();
            if let Err(e) = on_cache(cache, move |cache| cache.mark_revalidated(&key, &response_headers)).await {
                tracing::warn!(url = %url, error = %e, "failed to refresh cache entry");
            }
            return Ok(entry.into_response());
        }

        let body = response.bytes().await?.to_vec();
        let response = HttpResponse {
            status,
            headers: response_headers,
            body,
            from_cache: false,
        };

        if let Some(cache) = &self.cache {
            if status != 304 && !request.forbids_storage() {
                let key = url.to_string();
                let stored = response.clone();
                if let Err(e) = on_cache(cache, move |cache| cache.put(&key, &stored)).await {
                    tracing::warn!(url = %url, error = %e, "failed to store response in cache");
                }
            }
        }
        Ok(response)
    }
}

/// Run blocking cache work off the async workers.
async fn on_cache<T, F>(cache: &Arc<DiskCache>, work: F) -> io::Result<T>
where
    F: FnOnce(&DiskCache) -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let cache = Arc::clone(cache);
    tokio::task::spawn_blocking(move || work(&cache))
        .await
        .map_err(|e| io::Error::other(e.to_string()))?
}

/// Add the entry's validators to a request the caller sent unconditionally.
fn add_validators(headers: &mut reqwest::header::HeaderMap, entry: &CachedResponse) {
    if let Some(etag) = entry.etag().and_then(|v| HeaderValue::from_str(v).ok()) {
        headers.insert(IF_NONE_MATCH, etag);
    }
    if let Some(date) = entry.last_modified().and_then(|v| HeaderValue::from_str(v).ok()) {
        headers.insert(IF_MODIFIED_SINCE, date);
    }
}
