//! Size-bounded on-disk response cache.
//!
//! # Design
//! Each entry is two files named after the SHA-256 of its URL:
//! `<key>.meta` (JSON: URL, status, headers, store time) and `<key>.body`
//! (raw bytes). An in-memory `LruCache` of entry sizes tracks recency. The
//! index is rebuilt from the directory on `open`, ordered by file modification
//! time, and stray `.tmp` files from interrupted writes are deleted. After
//! every `put`, least-recently-used entries are evicted until the directory is
//! back under `max_size`.
//!
//! Every method does blocking file I/O. Async callers run them through
//! `tokio::task::spawn_blocking`.
//!
//! Freshness follows `Cache-Control: max-age`. Entries without it, or marked
//! `no-cache`, are always revalidated with their `ETag` / `Last-Modified`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::http::{cache_directives, HttpResponse};

/// Statuses whose responses may be stored.
const CACHEABLE_STATUSES: &[u16] = &[200, 203, 204, 300, 301, 404, 405, 410, 414, 501];

const META_EXT: &str = "meta";
const BODY_EXT: &str = "body";
const TMP_EXT: &str = "tmp";

/// Response headers that describe the 304 itself rather than the stored body.
const UNMERGED_HEADERS: &[&str] = &["content-length", "transfer-encoding", "connection"];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
    stored_at: u64,
}

/// A response read back from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Seconds since the Unix epoch when the entry was stored or last revalidated.
    pub stored_at: u64,
}

impl CachedResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn directives(&self) -> impl Iterator<Item = String> + '_ {
        cache_directives(
            self.headers
                .iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case("cache-control"))
                .map(|(_, v)| v.as_str()),
        )
    }

    /// `max-age` in seconds, if the response carried one.
    pub fn max_age(&self) -> Option<u64> {
        self.directives()
            .find_map(|d| d.strip_prefix("max-age=").and_then(|v| v.parse().ok()))
    }

    /// Whether the entry can be served at `now` without asking the server.
    pub fn is_fresh(&self, now: u64) -> bool {
        if self.directives().any(|d| d == "no-cache") {
            return false;
        }
        self.max_age()
            .is_some_and(|max_age| now.saturating_sub(self.stored_at) < max_age)
    }

    pub fn etag(&self) -> Option<&str> {
        self.header("etag")
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.header("last-modified")
    }

    /// Apply the headers of a 304 that revalidated this entry.
    pub fn merge_headers(&mut self, headers: &[(String, String)]) {
        merge_headers(&mut self.headers, headers);
    }

    pub fn into_response(self) -> HttpResponse {
        HttpResponse {
            status: self.status,
            headers: self.headers,
            body: self.body,
            from_cache: true,
        }
    }
}

/// Whether a response with `status` and `headers` may be stored at all.
pub fn is_cacheable(status: u16, headers: &[(String, String)]) -> bool {
    if !CACHEABLE_STATUSES.contains(&status) {
        return false;
    }
    let mut directives = cache_directives(
        headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("cache-control"))
            .map(|(_, v)| v.as_str()),
    );
    !directives.any(|d| d == "no-store")
}

/// Replace stored headers with same-named ones from `updates`, appending
/// the rest.
fn merge_headers(stored: &mut Vec<(String, String)>, updates: &[(String, String)]) {
    let updates: Vec<&(String, String)> = updates
        .iter()
        .filter(|(name, _)| !UNMERGED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)))
        .collect();
    stored.retain(|(name, _)| !updates.iter().any(|(n, _)| n.eq_ignore_ascii_case(name)));
    stored.extend(updates.into_iter().cloned());
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Entry sizes in recency order, plus their running total.
#[derive(Debug)]
struct CacheIndex {
    entries: LruCache<String, u64>,
    total_size: u64,
}

impl CacheIndex {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            total_size: 0,
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    fn insert(&mut self, key: String, size: u64) {
        if let Some(old) = self.entries.put(key, size) {
            self.total_size -= old;
        }
        self.total_size += size;
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.pop(key) {
            Some(old) => {
                self.total_size -= old;
                true
            }
            None => false,
        }
    }

    fn touch(&mut self, key: &str) {
        self.entries.promote(key);
    }

    fn pop_least_recently_used(&mut self) -> Option<String> {
        let (key, size) = self.entries.pop_lru()?;
        self.total_size -= size;
        Some(key)
    }
}

/// Persistent response cache rooted at one directory.
#[derive(Debug)]
pub struct DiskCache {
    directory: PathBuf,
    max_size: u64,
    index: Mutex<CacheIndex>,
}

impl DiskCache {
    /// Open (creating if needed) the cache at `directory`, trimming it to
    /// `max_size` bytes.
    pub fn open(directory: impl Into<PathBuf>, max_size: u64) -> io::Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;

        let mut found = Vec::new();
        for dir_entry in fs::read_dir(&directory)? {
            let path = dir_entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(META_EXT) => {}
                Some(TMP_EXT) => {
                    // Left behind by a write that never reached its rename.
                    if let Err(e) = fs::remove_file(&path) {
                        tracing::warn!(path = %path.display(), error = %e, "failed to delete stray cache file");
                    }
                    continue;
                }
                _ => continue,
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let body_path = path.with_extension(BODY_EXT);
            let (Ok(meta), Ok(body)) = (fs::metadata(&path), fs::metadata(&body_path)) else {
                // Half-written entry from an interrupted put.
                let _ = fs::remove_file(&path);
                let _ = fs::remove_file(&body_path);
                continue;
            };
            let modified = meta.modified().unwrap_or(UNIX_EPOCH);
            found.push((modified, key, meta.len() + body.len()));
        }
        found.sort();

        let mut index = CacheIndex::new();
        for (_, key, size) in found {
            index.insert(key, size);
        }

        let cache = Self {
            directory,
            max_size,
            index: Mutex::new(index),
        };
        {
            let mut index = cache.lock();
            cache.trim(&mut index);
        }
        Ok(cache)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Bytes currently stored.
    pub fn size(&self) -> u64 {
        self.lock().total_size
    }

    pub fn entry_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Read the entry for `url`. Unreadable or corrupt entries are dropped.
    pub fn get(&self, url: &str) -> Option<CachedResponse> {
        let key = cache_key(url);
        let mut index = self.lock();
        if !index.contains(&key) {
            return None;
        }
        match self.read_entry(&key) {
            Ok((meta, body)) if meta.url == url => {
                index.touch(&key);
                Some(CachedResponse {
                    url: meta.url,
                    status: meta.status,
                    headers: meta.headers,
                    body,
                    stored_at: meta.stored_at,
                })
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(%url, error = %e, "dropping unreadable cache entry");
                self.remove_files(&key);
                index.remove(&key);
                None
            }
        }
    }

    /// Store `response` for `url`. Returns `Ok(false)` when the response is
    /// not cacheable or would not fit.
    pub fn put(&self, url: &str, response: &HttpResponse) -> io::Result<bool> {
        if !is_cacheable(response.status, &response.headers) {
            self.remove(url)?;
            return Ok(false);
        }
        let meta = EntryMeta {
            url: url.to_string(),
            status: response.status,
            headers: response.headers.clone(),
            stored_at: now_secs(),
        };
        let meta_bytes = serde_json::to_vec(&meta)?;
        let size = (meta_bytes.len() + response.body.len()) as u64;

        let key = cache_key(url);
        let mut index = self.lock();
        if size > self.max_size {
            self.remove_files(&key);
            index.remove(&key);
            return Ok(false);
        }

        write_atomically(&self.path_for(&key, BODY_EXT), &response.body)?;
        write_atomically(&self.path_for(&key, META_EXT), &meta_bytes)?;
        index.insert(key, size);
        self.trim(&mut index);
        Ok(true)
    }

    /// Reset the store time of `url` after a successful revalidation and
    /// fold in the headers the 304 carried, so a new `max-age` or `ETag`
    /// applies from now on.
    pub fn mark_revalidated(&self, url: &str, headers: &[(String, String)]) -> io::Result<()> {
        let key = cache_key(url);
        let mut index = self.lock();
        if !index.contains(&key) {
            return Ok(());
        }
        let mut meta = self.read_meta(&key)?;
        merge_headers(&mut meta.headers, headers);
        meta.stored_at = now_secs();
        let meta_bytes = serde_json::to_vec(&meta)?;
        let body_len = fs::metadata(self.path_for(&key, BODY_EXT))?.len();
        write_atomically(&self.path_for(&key, META_EXT), &meta_bytes)?;
        index.insert(key, meta_bytes.len() as u64 + body_len);
        self.trim(&mut index);
        Ok(())
    }

    pub fn remove(&self, url: &str) -> io::Result<()> {
        let key = cache_key(url);
        let mut index = self.lock();
        if index.remove(&key) {
            fs::remove_file(self.path_for(&key, META_EXT))?;
            fs::remove_file(self.path_for(&key, BODY_EXT))?;
        }
        Ok(())
    }

    fn trim(&self, index: &mut CacheIndex) {
        while index.total_size > self.max_size {
            let Some(key) = index.pop_least_recently_used() else {
                break;
            };
            self.remove_files(&key);
        }
    }

    fn read_meta(&self, key: &str) -> io::Result<EntryMeta> {
        let raw = fs::read(self.path_for(key, META_EXT))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn read_entry(&self, key: &str) -> io::Result<(EntryMeta, Vec<u8>)> {
        let meta = self.read_meta(key)?;
        let body = fs::read(self.path_for(key, BODY_EXT))?;
        Ok((meta, body))
    }

    fn remove_files(&self, key: &str) {
        for ext in [META_EXT, BODY_EXT] {
            if let Err(e) = fs::remove_file(self.path_for(key, ext)) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(key, error = %e, "failed to delete cache file");
                }
            }
        }
    }

    fn path_for(&self, key: &str, ext: &str) -> PathBuf {
        self.directory.join(format!("{key}.{ext}"))
    }

    fn lock(&self) -> MutexGuard<'_, CacheIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn cache_key(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".");
    tmp.push(TMP_EXT);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &[u8], cache_control: &str) -> HttpResponse {
        HttpResponse {
            status: 200,
            headers: vec![
                ("cache-control".to_string(), cache_control.to_string()),
                ("etag".to_string(), "\"v1\"".to_string()),
            ],
            body: body.to_vec(),
            from_cache: false,
        }
    }

    #[test]
    fn put_then_get_returns_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 1_000_000).unwrap();

        assert!(cache.put("https://t.example.com/1/1/1", &response(b"tile", "max-age=60")).unwrap());
        let entry = cache.get("https://t.example.com/1/1/1").unwrap();
        assert_eq!(entry.body, b"tile");
        assert_eq!(entry.status, 200);
        assert_eq!(entry.etag(), Some("\"v1\""));
        assert_eq!(entry.max_age(), Some(60));
        assert!(entry.is_fresh(now_secs()));
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn get_unknown_url_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 1_000).unwrap();
        assert!(cache.get("https://t.example.com/missing").is_none());
    }

    #[test]
    fn no_store_response_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 1_000_000).unwrap();
        assert!(!cache.put("https://t.example.com/a", &response(b"x", "no-store")).unwrap());
        assert!(cache.get("https://t.example.com/a").is_none());
    }

    #[test]
    fn server_error_is_not_cached() {
        let mut resp = response(b"oops", "max-age=60");
        resp.status = 500;
        assert!(!is_cacheable(resp.status, &resp.headers));
    }

    #[test]
    fn not_found_is_cacheable() {
        assert!(is_cacheable(404, &[]));
    }

    #[test]
    fn entry_larger_than_cache_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 16).unwrap();
        assert!(!cache.put("https://t.example.com/big", &response(&[0u8; 64], "max-age=60")).unwrap());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn eviction_removes_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let sizing = DiskCache::open(dir.path().join("sizing"), u64::MAX).unwrap();
        sizing.put("https://t.example.com/0", &response(&[1u8; 100], "max-age=60")).unwrap();
        let one_entry = sizing.size();

        let cache = DiskCache::open(dir.path().join("lru"), one_entry * 2 + one_entry / 2).unwrap();
        cache.put("https://t.example.com/0", &response(&[1u8; 100], "max-age=60")).unwrap();
        cache.put("https://t.example.com/1", &response(&[1u8; 100], "max-age=60")).unwrap();
        // Touch /0 so /1 becomes the eviction candidate.
        assert!(cache.get("https://t.example.com/0").is_some());
        cache.put("https://t.example.com/2", &response(&[1u8; 100], "max-age=60")).unwrap();

        assert!(cache.size() <= cache.max_size());
        assert!(cache.get("https://t.example.com/0").is_some());
        assert!(cache.get("https://t.example.com/1").is_none());
        assert!(cache.get("https://t.example.com/2").is_some());
    }

    #[test]
    fn reopen_restores_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = DiskCache::open(dir.path(), 1_000_000).unwrap();
            cache.put("https://t.example.com/keep", &response(b"kept", "max-age=60")).unwrap();
        }
        let cache = DiskCache::open(dir.path(), 1_000_000).unwrap();
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.get("https://t.example.com/keep").unwrap().body, b"kept");
    }

    #[test]
    fn reopen_with_smaller_limit_trims() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = DiskCache::open(dir.path(), 1_000_000).unwrap();
            cache.put("https://t.example.com/a", &response(&[0u8; 500], "max-age=60")).unwrap();
        }
        let cache = DiskCache::open(dir.path(), 10).unwrap();
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn corrupt_meta_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 1_000_000).unwrap();
        let url = "https://t.example.com/corrupt";
        cache.put(url, &response(b"x", "max-age=60")).unwrap();
        fs::write(dir.path().join(format!("{}.meta", cache_key(url))), b"{not json").unwrap();

        assert!(cache.get(url).is_none());
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn no_cache_entry_is_never_fresh() {
        let entry = CachedResponse {
            url: "u".to_string(),
            status: 200,
            headers: vec![("Cache-Control".to_string(), "no-cache, max-age=600".to_string())],
            body: Vec::new(),
            stored_at: now_secs(),
        };
        assert!(!entry.is_fresh(now_secs()));
    }

    #[test]
    fn entry_goes_stale_after_max_age() {
        let entry = CachedResponse {
            url: "u".to_string(),
            status: 200,
            headers: vec![("cache-control".to_string(), "max-age=60".to_string())],
            body: Vec::new(),
            stored_at: 1_000,
        };
        assert!(entry.is_fresh(1_059));
        assert!(!entry.is_fresh(1_060));
    }

    #[test]
    fn mark_revalidated_refreshes_store_time() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 1_000_000).unwrap();
        let url = "https://t.example.com/reval";
        cache.put(url, &response(b"x", "no-cache")).unwrap();

        let key = cache_key(url);
        let mut meta = cache.read_meta(&key).unwrap();
        meta.stored_at = 5;
        fs::write(cache.path_for(&key, META_EXT), serde_json::to_vec(&meta).unwrap()).unwrap();

        cache.mark_revalidated(url, &[]).unwrap();
        assert!(cache.get(url).unwrap().stored_at > 5);
    }

    #[test]
    fn mark_revalidated_merges_new_headers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 1_000_000).unwrap();
        let url = "https://t.example.com/merge";
        cache.put(url, &response(b"x", "no-cache")).unwrap();

        let not_modified = vec![
            ("Cache-Control".to_string(), "max-age=120".to_string()),
            ("ETag".to_string(), "\"v2\"".to_string()),
            ("content-length".to_string(), "0".to_string()),
        ];
        cache.mark_revalidated(url, &not_modified).unwrap();

        let entry = cache.get(url).unwrap();
        assert_eq!(entry.etag(), Some("\"v2\""));
        assert_eq!(entry.max_age(), Some(120));
        assert!(entry.is_fresh(now_secs()));
        assert_eq!(entry.headers.len(), 2);
        assert_eq!(entry.body, b"x");
    }

    #[test]
    fn merge_keeps_headers_the_update_lacks() {
        let mut entry = CachedResponse {
            url: "u".to_string(),
            status: 200,
            headers: vec![
                ("content-type".to_string(), "image/png".to_string()),
                ("etag".to_string(), "\"v1\"".to_string()),
            ],
            body: Vec::new(),
            stored_at: 0,
        };
        entry.merge_headers(&[("ETag".to_string(), "\"v2\"".to_string())]);
        assert_eq!(entry.header("content-type"), Some("image/png"));
        assert_eq!(entry.etag(), Some("\"v2\""));
        assert_eq!(entry.headers.len(), 2);
    }

    #[test]
    fn eviction_cascades_until_under_limit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 1_000_000).unwrap();
        for i in 0..5 {
            cache
                .put(&format!("https://t.example.com/small/{i}"), &response(&[0u8; 10], "max-age=60"))
                .unwrap();
        }
        let big = 1_000_000 - cache.size() / 2;
        let big_body = vec![0u8; big as usize - 200];
        assert!(cache.put("https://t.example.com/big", &response(&big_body, "max-age=60")).unwrap());

        assert!(cache.size() <= cache.max_size());
        assert!(cache.get("https://t.example.com/big").is_some());
        assert!(cache.get("https://t.example.com/small/0").is_none());
        assert!(cache.get("https://t.example.com/small/4").is_some());
    }

    #[test]
    fn open_deletes_stray_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let stray = dir.path().join("deadbeef.body.tmp");
        fs::write(&stray, b"partial").unwrap();
        {
            let cache = DiskCache::open(dir.path(), 1_000_000).unwrap();
            cache.put("https://t.example.com/ok", &response(b"ok", "max-age=60")).unwrap();
        }

        let cache = DiskCache::open(dir.path(), 1_000_000).unwrap();
        assert!(!stray.exists());
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn into_response_marks_from_cache() {
        let entry = CachedResponse {
            url: "u".to_string(),
            status: 200,
            headers: Vec::new(),
            body: b"b".to_vec(),
            stored_at: 0,
        };
        let resp = entry.into_response();
        assert!(resp.from_cache);
        assert_eq!(resp.body, b"b");
    }
}
