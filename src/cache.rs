//! A client-side LRU cache of `GET` responses.
//!
//! Only `200` responses with fully buffered bodies are stored. Freshness comes from
//! `Cache-Control: max-age` or `Expires` relative to `Date`. Stale entries carrying an `ETag` or `Last-Modified`
//! are revalidated with a conditional request, and a `304 Not Modified` answer is served from the cache.

use std::{
    collections::{HashMap, VecDeque},
    fmt::Debug,
    sync::{Mutex, MutexGuard},
    time::{Duration, SystemTime},
};

use http::{Method, StatusCode};

use crate::{
    body::Body,
    error::HttpError,
    message::{Headers, RequestHeader, Response, ResponseHeader},
};

/// Parsed `Cache-Control` directives that matter to a private cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub no_store: bool,
    pub no_cache: bool,
    pub max_age: Option<u64>,
}
impl CacheControl {
    pub fn parse(headers: &Headers) -> Self {
        let mut control = Self::default();
        for value in headers.get_all("Cache-Control") {
            for directive in value.split(',') {
                let directive = directive.trim();
                let (name, arg) = match directive.split_once('=') {
                    Some((n, a)) => (n.trim(), Some(a.trim().trim_matches('"'))),
                    None => (directive, None),
                };
                match name.to_ascii_lowercase().as_str() {
                    "no-store" => control.no_store = true,
                    "no-cache" => control.no_cache = true,
                    "max-age" => control.max_age = arg.and_then(|x| x.parse().ok()),
                    _ => {}
                }
            }
        }
        control
    }
}

/// Result of looking a request up in the cache.
#[derive(Debug)]
pub enum CacheLookup {
    /// A fresh copy, served without contacting the server
    Fresh(Response),
    /// A stale copy that may be revalidated with these conditional headers
    Stale(Headers),
    Miss,
}

struct CacheEntry {
    header: ResponseHeader,
    body: Vec<u8>,
    fresh_until: Option<SystemTime>,
}
impl CacheEntry {
    fn response(&self) -> Response {
        Response::from_parts(self.header.clone(), Body::Full(self.body.clone()))
    }

    fn validators(&self) -> Headers {
        let mut headers = Headers::new();
        if let Some(etag) = self.header.headers.get("ETag") {
            let _ = headers.insert("If-None-Match", etag);
        }
        if let Some(modified) = self.header.headers.get("Last-Modified") {
            let _ = headers.insert("If-Modified-Since", modified);
        }
        headers
    }

    fn is_fresh_at(&self, now: SystemTime) -> bool {
        self.fresh_until.map(|x| now < x).unwrap_or(false)
    }
}

fn has_validator(headers: &Headers) -> bool {
    headers.contains("ETag") || headers.contains("Last-Modified")
}

/// When a response stops being fresh, or `None` when it must always be revalidated.
fn fresh_until(headers: &Headers, control: &CacheControl, now: SystemTime) -> Option<SystemTime> {
    if control.no_cache {
        return None;
    }
    if let Some(max_age) = control.max_age {
        let age = headers
            .get("Age")
            .and_then(|x| x.trim().parse::<u64>().ok())
            .unwrap_or(0);
        return Some(now + Duration::from_secs(max_age.saturating_sub(age)));
    }
    let expires = httpdate::parse_http_date(headers.get("Expires")?).ok()?;
    let date = headers
        .get("Date")
        .and_then(|x| httpdate::parse_http_date(x).ok())
        .unwrap_or(now);
    let lifetime = expires.duration_since(date).unwrap_or(Duration::ZERO);
    Some(now + lifetime)
}

/// True for requests the cache may answer or store.
pub fn is_cacheable_request(header: &RequestHeader) -> bool {
    header.method == Method::GET
        && !header.headers.contains("Authorization")
        && !header.headers.contains("Range")
        && !CacheControl::parse(&header.headers).no_store
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Least recently used first
    order: VecDeque<String>,
}
impl CacheState {
    fn touch(&mut self, key: &str) {
        if let Some(index) = self.order.iter().position(|x| x == key) {
            if let Some(key) = self.order.remove(index) {
                self.order.push_back(key);
            }
        }
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|x| x != key);
    }
}

/// An LRU cache of responses keyed by absolute request URL.
pub struct ResponseCache {
    capacity: usize,
    state: Mutex<CacheState>,
}
impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
    }

    pub fn lookup(&self, key: &str) -> CacheLookup {
        let now = SystemTime::now();
        let mut state = self.lock();
        let (lookup, fresh) = match state.entries.get(key) {
            None => return CacheLookup::Miss,
            Some(entry) if entry.is_fresh_at(now) => (CacheLookup::Fresh(entry.response()), true),
            Some(entry) => match entry.validators() {
                x if x.is_empty() => (CacheLookup::Miss, false),
                x => (CacheLookup::Stale(x), false),
            },
        };
        if fresh {
            state.touch(key);
        }
        lookup
    }

    /// Store a response if it is cacheable, returning true if it was stored.
    pub fn store(&self, key: &str, request: &RequestHeader, response: &Response) -> bool {
        if self.capacity == 0
            || !is_cacheable_request(request)
            || response.status() != StatusCode::OK
        {
            return false;
        }
        let Some(body) = response.body().as_bytes() else {
            return false;
        };
        let headers = response.headers();
        let control = CacheControl::parse(headers);
        if control.no_store {
            return false;
        }
        let now = SystemTime::now();
        let fresh_until = fresh_until(headers, &control, now);
        if fresh_until.is_none() && !has_validator(headers) {
            return false;
        }
        let entry = CacheEntry {
            header: response.header().clone(),
            body: body.to_vec(),
            fresh_until,
        };
        let mut state = self.lock();
        state.remove(key);
        state.entries.insert(key.to_owned(), entry);
        state.order.push_back(key.to_owned());
        while state.entries.len() > self.capacity {
            match state.order.pop_front() {
                Some(oldest) => {
                    state.entries.remove(&oldest);
                }
                None => break,
            }
        }
        true
    }

    /// Answer a `304 Not Modified` from the cached copy, refreshing its headers and freshness.
    pub fn revalidated(&self, key: &str, not_modified: &ResponseHeader) -> Result<Option<Response>, HttpError> {
        let now = SystemTime::now();
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            return Ok(None);
        };
        for name in ["Cache-Control", "Date", "ETag", "Expires", "Last-Modified"] {
            if let Some(value) = not_modified.headers.get(name) {
                entry.header.headers.insert(name, value)?;
            }
        }
        let control = CacheControl::parse(&entry.header.headers);
        entry.fresh_until = fresh_until(&entry.header.headers, &control, now);
        let response = entry.response();
        state.touch(key);
        Ok(Some(response))
    }

    pub fn remove(&self, key: &str) {
        self.lock().remove(key);
    }
}
impl Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("capacity", &self.capacity)
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use http::{Method, StatusCode};

    use super::{CacheControl, CacheLookup, ResponseCache};
    use crate::message::{RequestHeader, Response, ResponseHeader};

    fn get() -> RequestHeader {
        RequestHeader::new(Method::GET, "/doc")
    }

    fn response(cache_control: &str) -> Response {
        Response::text(200, "cached")
            .with_header("Cache-Control", cache_control)
            .unwrap()
    }

    #[test]
    fn test_cache_control_parsing() {
        let response = response("private, max-age=60, no-cache");
        let control = CacheControl::parse(response.headers());
        assert_eq!(control.max_age, Some(60));
        assert!(control.no_cache);
        assert!(!control.no_store);
    }

    #[test]
    fn test_fresh_hit_and_no_store() {
        let cache = ResponseCache::new(4);
        assert!(cache.store("http://x/doc", &get(), &response("max-age=60")));
        match cache.lookup("http://x/doc") {
            CacheLookup::Fresh(x) => assert_eq!(x.body().as_text(), Some("cached")),
            other => panic!("expected a fresh hit, got {other:?}"),
        }
        assert!(!cache.store("http://x/other", &get(), &response("no-store")));
        assert!(matches!(cache.lookup("http://x/other"), CacheLookup::Miss));

        let post = RequestHeader::new(Method::POST, "/doc");
        assert!(!cache.store("http://x/post", &post, &response("max-age=60")));
    }

    #[test]
    fn test_revalidation() {
        let cache = ResponseCache::new(4);
        let stored = response("no-cache").with_header("ETag", "\"v1\"").unwrap();
        assert!(cache.store("http://x/doc", &get(), &stored));
        let CacheLookup::Stale(conditional) = cache.lookup("http://x/doc") else {
            panic!("expected a stale entry");
        };
        assert_eq!(conditional.get("If-None-Match"), Some("\"v1\""));

        let mut not_modified = ResponseHeader::new(StatusCode::NOT_MODIFIED);
        not_modified.headers.insert("Cache-Control", "max-age=60").unwrap();
        let served = cache.revalidated("http://x/doc", &not_modified).unwrap().unwrap();
        assert_eq!(served.status(), StatusCode::OK);
        assert_eq!(served.body().as_text(), Some("cached"));
        assert!(matches!(cache.lookup("http://x/doc"), CacheLookup::Fresh(_)));
    }

    #[test]
    fn test_least_recently_used_is_evicted() {
        let cache = ResponseCache::new(2);
        cache.store("a", &get(), &response("max-age=60"));
        cache.store("b", &get(), &response("max-age=60"));
        assert!(matches!(cache.lookup("a"), CacheLookup::Fresh(_)));
        cache.store("c", &get(), &response("max-age=60"));
        assert_eq!(cache.len(), 2);
        assert!(matches!(cache.lookup("b"), CacheLookup::Miss));
        assert!(matches!(cache.lookup("a"), CacheLookup::Fresh(_)));
    }
}
