//! Cookie parsing and a client-side cookie store.
//!
//! [`CookieStore`] keeps the cookies set by `Set-Cookie` response headers and produces the
//! `Cookie` header for later requests, honoring domain, path, expiry and the `Secure` flag.

use std::{
    fmt::Debug,
    sync::{Mutex, MutexGuard},
    time::{Duration, SystemTime},
};

use http::Uri;

use crate::{error::HttpError, log::debug, message::Headers};

/// Name/value pairs of a `Cookie` request header.
pub fn parse_cookie_header(header: &str) -> impl Iterator<Item = (&str, &str)> {
    header.split(';').filter_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some((name, value.trim().trim_matches('"')))
    })
}

/// One cookie as set by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Lowercased, without a leading dot
    pub domain: Option<String>,
    pub path: Option<String>,
    pub expires: Option<SystemTime>,
    pub secure: bool,
    pub http_only: bool,
}
impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            expires: None,
            secure: false,
            http_only: false,
        }
    }

    /// Parse a `Set-Cookie` header value.
    ///
    /// `Max-Age` wins over `Expires`. A `Max-Age` of zero or less yields a cookie that is already expired.
    pub fn parse_set_cookie(header: &str) -> Result<Self, HttpError> {
        let mut parts = header.split(';');
        let (name, value) = parts
            .next()
            .and_then(|x| x.split_once('='))
            .ok_or_else(|| HttpError::MalformedHeader(format!("invalid Set-Cookie {header:?}")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(HttpError::MalformedHeader(format!(
                "Set-Cookie without a name: {header:?}"
            )));
        }
        let mut cookie = Cookie::new(name, value.trim().trim_matches('"'));
        let mut max_age = None;
        for attribute in parts {
            let (key, value) = match attribute.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attribute.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" if !value.is_empty() => {
                    cookie.domain = Some(value.trim_start_matches('.').to_ascii_lowercase())
                }
                "path" if value.starts_with('/') => cookie.path = Some(value.to_owned()),
                "expires" => cookie.expires = httpdate::parse_http_date(value).ok(),
                "max-age" => max_age = value.parse::<i64>().ok(),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                _ => {}
            }
        }
        if let Some(seconds) = max_age {
            cookie.expires = if seconds <= 0 {
                Some(SystemTime::UNIX_EPOCH)
            } else {
                SystemTime::now().checked_add(Duration::from_secs(seconds as u64))
            };
        }
        Ok(cookie)
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires.map(|x| x <= now).unwrap_or(false)
    }

    /// The `Set-Cookie` form of this cookie.
    pub fn to_set_cookie(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(expires) = self.expires {
            out.push_str("; Expires=");
            out.push_str(&httpdate::fmt_http_date(expires));
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        out
    }
}

struct StoredCookie {
    cookie: Cookie,
    /// Domain the cookie applies to
    domain: String,
    /// Set without a `Domain` attribute, so only the exact host matches
    host_only: bool,
    path: String,
}
impl StoredCookie {
    fn matches(&self, host: &str, path: &str, secure: bool, now: SystemTime) -> bool {
        if self.cookie.secure && !secure {
            return false;
        }
        if self.cookie.is_expired_at(now) {
            return false;
        }
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_matches(host, &self.domain)
        };
        domain_ok && path_matches(path, &self.path)
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    request_path == cookie_path
        || (request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/')
                || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/')))
}

/// The directory of a request path, used when a cookie carries no `Path`.
fn default_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(x) => request_path[..x].to_owned(),
    }
}

/// Cookies received by a client, replayed on matching requests.
#[derive(Default)]
pub struct CookieStore {
    cookies: Mutex<Vec<StoredCookie>>,
}
impl CookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<StoredCookie>> {
        self.cookies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store every `Set-Cookie` of a response to a request for `uri`.
    pub fn store_response(&self, uri: &Uri, headers: &Headers) {
        for value in headers.get_all("Set-Cookie") {
            match Cookie::parse_set_cookie(value) {
                Ok(cookie) => self.insert(uri, cookie),
                Err(err) => {
                    debug!("ignoring cookie: {err}");
                }
            }
        }
    }

    /// Store a cookie received from `uri`, replacing one with the same name, domain and path.
    ///
    /// A cookie whose domain does not cover the host of `uri` is rejected, and an expired
    /// cookie only removes its predecessor.
    pub fn insert(&self, uri: &Uri, cookie: Cookie) {
        let Some(host) = uri.host().map(|x| x.to_ascii_lowercase()) else {
            return;
        };
        let (domain, host_only) = match &cookie.domain {
            Some(domain) if domain_matches(&host, domain) => (domain.clone(), false),
            Some(domain) => {
                debug!("rejecting cookie {} for domain {domain} from {host}", cookie.name);
                return;
            }
            None => (host, true),
        };
        let path = cookie
            .path
            .clone()
            .unwrap_or_else(|| default_path(uri.path()));
        let mut cookies = self.lock();
        cookies.retain(|x| !(x.cookie.name == cookie.name && x.domain == domain && x.path == path));
        if !cookie.is_expired_at(SystemTime::now()) {
            cookies.push(StoredCookie {
                cookie,
                domain,
                host_only,
                path,
            });
        }
    }

    /// The `Cookie` header value for a request to `uri`, longest paths first.
    pub fn cookie_header(&self, uri: &Uri) -> Option<String> {
        let host = uri.host()?.to_ascii_lowercase();
        let secure = uri.scheme_str() == Some("https");
        let path = match uri.path() {
            "" => "/",
            x => x,
        };
        let now = SystemTime::now();
        let mut cookies = self.lock();
        cookies.retain(|x| !x.cookie.is_expired_at(now));
        let mut matching: Vec<&StoredCookie> = cookies
            .iter()
            .filter(|x| x.matches(&host, path, secure, now))
            .collect();
        if matching.is_empty() {
            return None;
        }
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        let pairs: Vec<String> = matching
            .iter()
            .map(|x| format!("{}={}", x.cookie.name, x.cookie.value))
            .collect();
        Some(pairs.join("; "))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
impl Debug for CookieStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieStore")
            .field("cookies", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::time::SystemTime;

    use http::Uri;

    use super::{parse_cookie_header, Cookie, CookieStore};
    use crate::message::Headers;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_cookie_header() {
        let pairs: Vec<_> = parse_cookie_header("sessionid=abc; theme=\"dark\";bad").collect();
        assert_eq!(pairs, vec![("sessionid", "abc"), ("theme", "dark")]);
    }

    #[test]
    fn test_parse_set_cookie_attributes() {
        let cookie = Cookie::parse_set_cookie(
            "id=42; Domain=.Example.com; Path=/app; Secure; HttpOnly; Expires=Wed, 21 Oct 2099 07:28:00 GMT",
        )
        .unwrap();
        assert_eq!(cookie.name, "id");
        assert_eq!(cookie.value, "42");
        assert_eq!(cookie.domain.as_deref(), Some("example.com"));
        assert_eq!(cookie.path.as_deref(), Some("/app"));
        assert!(cookie.secure && cookie.http_only);
        assert!(!cookie.is_expired_at(SystemTime::now()));

        let gone = Cookie::parse_set_cookie("id=; Max-Age=0; Expires=Wed, 21 Oct 2099 07:28:00 GMT").unwrap();
        assert!(gone.is_expired_at(SystemTime::now()));
        assert!(Cookie::parse_set_cookie("novalue").is_err());
    }

    #[test]
    fn test_store_matches_domain_and_path() {
        let store = CookieStore::new();
        let mut headers = Headers::new();
        headers.append("Set-Cookie", "a=1; Path=/").unwrap();
        headers.append("Set-Cookie", "b=2; Path=/docs").unwrap();
        headers.append("Set-Cookie", "c=3; Domain=example.com; Path=/").unwrap();
        headers.append("Set-Cookie", "d=4; Domain=other.org").unwrap();
        store.store_response(&uri("http://www.example.com/docs/index.html"), &headers);
        assert_eq!(store.len(), 3);

        assert_eq!(
            store.cookie_header(&uri("http://www.example.com/docs/api")).as_deref(),
            Some("b=2; a=1; c=3")
        );
        assert_eq!(
            store.cookie_header(&uri("http://www.example.com/docsearch")).as_deref(),
            Some("a=1; c=3")
        );
        // host-only cookies do not leak to siblings, domain cookies do
        assert_eq!(
            store.cookie_header(&uri("http://api.example.com/")).as_deref(),
            Some("c=3")
        );
        assert_eq!(store.cookie_header(&uri("http://other.org/")), None);
    }

    #[test]
    fn test_secure_and_replacement() {
        let store = CookieStore::new();
        let site = uri("https://example.com/");
        store.insert(&site, Cookie::parse_set_cookie("token=old; Secure").unwrap());
        store.insert(&site, Cookie::parse_set_cookie("token=new; Secure").unwrap());
        assert_eq!(store.len(), 1);
        assert_eq!(store.cookie_header(&site).as_deref(), Some("token=new"));
        assert_eq!(store.cookie_header(&uri("http://example.com/")), None);

        store.insert(&site, Cookie::parse_set_cookie("token=; Max-Age=-1; Secure").unwrap());
        assert!(store.is_empty());
    }
}
