//! In-memory response cache for the cached route.
//!
//! Chromium mapping: net/http/http_cache.h (simplified in-memory version)
//!
//! Only `200` GET responses are kept, keyed by request path. An entry needs a
//! validator (`ETag`) or a `max-age` to be worth storing, and its body must
//! fit `max_object_size`. Fresh entries are served directly; stale ones are
//! revalidated with `If-None-Match`.

use crate::config::CacheSettings;
use bytes::Bytes;
use dashmap::DashMap;
use http::header::{CACHE_CONTROL, DATE, ETAG, EXPIRES};
use http::{HeaderMap, HeaderValue, StatusCode};
use std::time::{Duration, Instant};

/// Cached response entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub headers: HeaderMap,
    pub body: Bytes,
    /// When this entry was stored or last revalidated
    pub cached_at: Instant,
    /// From `max-age`; `None` means revalidate on every use
    pub ttl: Option<Duration>,
    /// Raw `ETag` header value, quotes included
    pub etag: Option<HeaderValue>,
}

impl CacheEntry {
    pub fn is_fresh(&self) -> bool {
        match self.ttl {
            Some(ttl) => self.cached_at.elapsed() < ttl,
            None => false,
        }
    }
}

/// Result of a cache lookup.
#[derive(Debug)]
pub enum Lookup {
    /// Serve without touching the network.
    Fresh(CacheEntry),
    /// Send the request with this `If-None-Match` value.
    Revalidate(HeaderValue),
    Miss,
}

/// Bounded cache of GET responses, safe for concurrent use.
#[derive(Debug)]
pub struct HttpCache {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
    max_object_size: usize,
}

impl HttpCache {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: settings.max_entries.max(1),
            max_object_size: settings.max_object_size,
        }
    }

    pub fn lookup(&self, path: &str) -> Lookup {
        let Some(entry) = self.entries.get(path) else {
            return Lookup::Miss;
        };
        if entry.is_fresh() {
            return Lookup::Fresh(entry.clone());
        }
        match &entry.etag {
            Some(etag) => Lookup::Revalidate(etag.clone()),
            None => {
                drop(entry);
                self.entries.remove(path);
                Lookup::Miss
            }
        }
    }

    /// Whether a response with this status and these headers should be read
    /// into memory and stored. Needs a declared length within the size limit.
    pub fn admits(&self, status: StatusCode, headers: &HeaderMap, content_length: Option<u64>) -> bool {
        if status != StatusCode::OK {
            return false;
        }
        match content_length {
            Some(len) if len <= self.max_object_size as u64 => {}
            _ => return false,
        }
        let cc = parse_cache_control(headers);
        if cc.no_store {
            return false;
        }
        headers.contains_key(ETAG) || cc.max_age.is_some()
    }

    /// Store a response body already read in full.
    pub fn store(&self, path: &str, headers: &HeaderMap, body: Bytes) {
        if body.len() > self.max_object_size {
            return;
        }
        let cc = parse_cache_control(headers);
        let entry = CacheEntry {
            headers: headers.clone(),
            body,
            cached_at: Instant::now(),
            ttl: cc.max_age.map(Duration::from_secs),
            etag: headers.get(ETAG).cloned(),
        };

        if !self.entries.contains_key(path) {
            self.maybe_evict();
        }
        tracing::trace!(path, size = entry.body.len(), "cached response");
        self.entries.insert(path.to_string(), entry);
    }

    /// Refresh an entry from a 304 and return it for serving.
    pub fn update_from_not_modified(&self, path: &str, headers: &HeaderMap) -> Option<CacheEntry> {
        let mut entry = self.entries.get_mut(path)?;
        for name in [CACHE_CONTROL, ETAG, EXPIRES, DATE] {
            if let Some(value) = headers.get(&name) {
                entry.headers.insert(name, value.clone());
            }
        }
        if let Some(max_age) = parse_cache_control(headers).max_age {
            entry.ttl = Some(Duration::from_secs(max_age));
        }
        if let Some(etag) = headers.get(ETAG) {
            entry.etag = Some(etag.clone());
        }
        entry.cached_at = Instant::now();
        Some(entry.clone())
    }

    /// Drop every entry for the document behind `path`, whatever the query
    /// string, e.g. after a write to it.
    pub fn invalidate(&self, path: &str) {
        let resource = resource_path(path);
        let before = self.entries.len();
        self.entries.retain(|key, _| resource_path(key) != resource);
        if self.entries.len() < before {
            tracing::trace!(path, "invalidated cached response");
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn maybe_evict(&self) {
        while self.entries.len() >= self.max_entries {
            // Stale entries go first, then whichever the map yields.
            let stale = self.entries.iter().find(|e| !e.is_fresh()).map(|e| e.key().clone());
            let victim =
                stale.or_else(|| self.entries.iter().next().map(|e| e.key().clone()));
            match victim {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// `path` without its query string.
fn resource_path(path: &str) -> &str {
    path.split_once('?').map_or(path, |(resource, _)| resource)
}

/// Parsed Cache-Control directive.
#[derive(Debug, Default)]
struct CacheControl {
    no_store: bool,
    max_age: Option<u64>,
}

fn parse_cache_control(headers: &HeaderMap) -> CacheControl {
    let mut cc = CacheControl::default();
    for value in headers.get_all(CACHE_CONTROL) {
        let Ok(value) = value.to_str() else { continue };
        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            if directive == "no-store" {
                cc.no_store = true;
            } else if let Some(age) = directive.strip_prefix("max-age=") {
                cc.max_age = age.trim_matches('"').parse().ok();
            }
        }
    }
    cc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_entries: usize) -> CacheSettings {
        CacheSettings { max_entries, max_object_size: 64 }
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_fresh_entry_served() {
        let cache = HttpCache::new(&settings(10));
        let h = headers(&[("cache-control", "max-age=3600")]);
        cache.store("/db/doc", &h, Bytes::from_static(b"{}"));
        match cache.lookup("/db/doc") {
            Lookup::Fresh(entry) => assert_eq!(entry.body, Bytes::from_static(b"{}")),
            other => panic!("expected fresh entry, got {other:?}"),
        }
    }

    #[test]
    fn test_invalidate_ignores_query() {
        let cache = HttpCache::new(&settings(10));
        let h = headers(&[("cache-control", "max-age=3600")]);
        cache.store("/db/doc", &h, Bytes::from_static(b"{}"));
        cache.store("/db/doc?revs=true", &h, Bytes::from_static(b"{}"));
        cache.store("/db/doc2", &h, Bytes::from_static(b"{}"));

        cache.invalidate("/db/doc?rev=1-abc");
        assert!(matches!(cache.lookup("/db/doc"), Lookup::Miss));
        assert!(matches!(cache.lookup("/db/doc?revs=true"), Lookup::Miss));
        assert!(matches!(cache.lookup("/db/doc2"), Lookup::Fresh(_)));
    }

    #[test]
    fn test_etag_only_entry_revalidates() {
        let cache = HttpCache::new(&settings(10));
        cache.store("/db/doc", &headers(&[("etag", "\"1-abc\"")]), Bytes::from_static(b"{}"));
        match cache.lookup("/db/doc") {
            Lookup::Revalidate(etag) => assert_eq!(etag, "\"1-abc\""),
            other => panic!("expected revalidation, got {other:?}"),
        }
    }

    #[test]
    fn test_not_modified_refreshes_entry() {
        let cache = HttpCache::new(&settings(10));
        cache.store("/db/doc", &headers(&[("etag", "\"1-abc\"")]), Bytes::from_static(b"body"));
        let entry = cache
            .update_from_not_modified("/db/doc", &headers(&[("cache-control", "max-age=60")]))
            .unwrap();
        assert_eq!(entry.body, Bytes::from_static(b"body"));
        assert!(entry.is_fresh());
        assert!(matches!(cache.lookup("/db/doc"), Lookup::Fresh(_)));
    }

    #[test]
    fn test_admission_rules() {
        let cache = HttpCache::new(&settings(10));
        let tagged = headers(&[("etag", "\"1-a\"")]);
        assert!(cache.admits(StatusCode::OK, &tagged, Some(10)));
        assert!(!cache.admits(StatusCode::OK, &tagged, Some(65)));
        assert!(!cache.admits(StatusCode::OK, &tagged, None));
        assert!(!cache.admits(StatusCode::NOT_FOUND, &tagged, Some(10)));
        assert!(!cache.admits(StatusCode::OK, &HeaderMap::new(), Some(10)));
        let no_store = headers(&[("etag", "\"1-a\""), ("cache-control", "no-store")]);
        assert!(!cache.admits(StatusCode::OK, &no_store, Some(10)));
    }

    #[test]
    fn test_entry_limit_evicts() {
        let cache = HttpCache::new(&settings(2));
        let h = headers(&[("etag", "\"1\"")]);
        cache.store("/a", &h, Bytes::from_static(b"a"));
        cache.store("/b", &h, Bytes::from_static(b"b"));
        cache.store("/c", &h, Bytes::from_static(b"c"));
        assert_eq!(cache.len(), 2);
        assert!(matches!(cache.lookup("/c"), Lookup::Revalidate(_)));
    }

    #[test]
    fn test_invalidate() {
        let cache = HttpCache::new(&settings(10));
        cache.store("/db/doc", &headers(&[("etag", "\"1\"")]), Bytes::from_static(b"x"));
        cache.invalidate("/db/doc");
        assert!(cache.is_empty());
        assert!(matches!(cache.lookup("/db/doc"), Lookup::Miss));
    }

    #[test]
    fn test_parse_cache_control() {
        let cc = parse_cache_control(&headers(&[("cache-control", "public, max-age=30")]));
        assert_eq!(cc.max_age, Some(30));
        assert!(!cc.no_store);
    }
}
