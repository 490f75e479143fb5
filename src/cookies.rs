//! RFC-6265 cookie storage, keyed the way a curl-backed cookie jar is:
//! `(domain, path, name)`.
//!
//! Grounded on `ReceivedHeaders`'s multimap shape (cookies arrive as
//! repeated `Set-Cookie` headers) and on `http.rs`'s
//! `HttpClient`/mock pairing -- `CookieStore` here plays the same "shared,
//! injectable collaborator" role that `HttpClient` does, using the `cookie`
//! crate (absent from the batching stack, pulled in from the pack) for
//! RFC-6265 parsing rather than hand-rolling `Set-Cookie` parsing.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::Path;

use cookie::Cookie as ParsedCookie;
use parking_lot::Mutex;

use crate::error::Result;
use crate::headers::ReceivedHeaders;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CookieKey {
    domain: String,
    path: String,
    name: String,
}

#[derive(Debug, Clone)]
struct StoredCookie {
    value: String,
    expires: Option<time::OffsetDateTime>,
    secure: bool,
    http_only: bool,
    /// Set when the cookie arrived with no explicit `Domain` attribute:
    /// per RFC 6265 such a cookie is scoped to the exact issuing host
    /// only, never to subdomains.
    host_only: bool,
}

/// An in-memory cookie jar. Clone + Send + Sync via interior mutability so
/// it can be shared between an `HttpTransport`'s dispatch loop and any
/// other code (e.g. login flows) that wants to inspect cookies directly.
#[derive(Debug, Clone, Default)]
pub struct CookieStore {
    inner: std::sync::Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    cookies: HashMap<CookieKey, StoredCookie>,
    /// Keys touched since the last `get_changed_cookies` call.
    dirty: std::collections::HashSet<CookieKey>,
}

impl CookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse any `Set-Cookie` headers in `received` and store them,
    /// scoped to `request_host`/`request_path` for cookies that omit an
    /// explicit `Domain`/`Path` attribute.
    pub fn set_cookies_from_headers(&self, received: &ReceivedHeaders, request_host: &str, request_path: &str) {
        let mut inner = self.inner.lock();
        for raw in received.get_values("Set-Cookie") {
            let Ok(parsed) = ParsedCookie::parse(raw.to_string()) else {
                continue;
            };
            let host_only = parsed.domain().is_none();
            let domain = parsed
                .domain()
                .map(str::to_string)
                .unwrap_or_else(|| request_host.to_string());
            let path = parsed
                .path()
                .map(str::to_string)
                .unwrap_or_else(|| request_path.to_string());
            let key = CookieKey {
                domain,
                path,
                name: parsed.name().to_string(),
            };
            let expires = parsed.expires_datetime();

            inner.dirty.insert(key.clone());
            inner.cookies.insert(
                key,
                StoredCookie {
                    value: parsed.value().to_string(),
                    expires,
                    secure: parsed.secure().unwrap_or(false),
                    http_only: parsed.http_only().unwrap_or(false),
                    host_only,
                },
            );
        }
    }

    /// Build the `Cookie:` header value to attach to an outbound request
    /// for `host`/`path`/`is_secure`. Expired cookies are skipped and
    /// lazily evicted.
    pub fn cookies_for_request(&self, host: &str, path: &str, is_secure: bool) -> Option<String> {
        let mut inner = self.inner.lock();
        let now = time::OffsetDateTime::now_utc();
        inner.cookies.retain(|_, c| c.expires.map(|exp| exp > now).unwrap_or(true));

        let mut pairs = Vec::new();
        for (key, cookie) in inner.cookies.iter() {
            if !domain_matches(&key.domain, host, cookie.host_only) {
                continue;
            }
            if !path_matches(&key.path, path) {
                continue;
            }
            if cookie.secure && !is_secure {
                continue;
            }
            pairs.push(format!("{}={}", key.name, cookie.value));
        }

        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Consume and return the set of cookies changed since the last call.
    /// Kept for callers that want delta semantics; prefer
    /// `all_cookies_snapshot` when the consuming contract isn't required
    /// (see the cookie-delta-race note in the design ledger).
    pub fn get_changed_cookies(&self) -> Vec<(String, String, String)> {
        let mut inner = self.inner.lock();
        let dirty = std::mem::take(&mut inner.dirty);
        dirty
            .into_iter()
            .filter_map(|key| {
                inner
                    .cookies
                    .get(&key)
                    .map(|c| (key.domain.clone(), key.name.clone(), c.value.clone()))
            })
            .collect()
    }

    /// Non-consuming full snapshot: every stored cookie, independent of
    /// dirty tracking. `HttpTransport` uses this rather than
    /// `get_changed_cookies` so a concurrent writer flushing cookies to
    /// disk does not race a reader building an outbound `Cookie:` header
    /// and steal the dirty flag out from under it.
    pub fn all_cookies_snapshot(&self) -> Vec<(String, String, String)> {
        let inner = self.inner.lock();
        inner
            .cookies
            .iter()
            .map(|(key, c)| (key.domain.clone(), key.name.clone(), c.value.clone()))
            .collect()
    }

    /// Load cookies from a line-delimited RFC-6265 cookie file (one
    /// `Set-Cookie`-style line per cookie, `domain\tpath\tname\tvalue`
    /// fields). Cookie file format beyond this is out of scope.
    pub fn load_from_file(&self, path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!(e))?;
        let mut inner = self.inner.lock();
        for line in contents.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 4 {
                continue;
            }
            let key = CookieKey {
                domain: fields[0].to_string(),
                path: fields[1].to_string(),
                name: fields[2].to_string(),
            };
            inner.cookies.insert(
                key,
                StoredCookie {
                    value: fields[3].to_string(),
                    expires: None,
                    secure: false,
                    http_only: false,
                    host_only: false,
                },
            );
        }
        Ok(())
    }

    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let inner = self.inner.lock();
        let mut file = std::fs::File::create(path).map_err(|e| anyhow::anyhow!(e))?;
        for (key, cookie) in inner.cookies.iter() {
            writeln!(file, "{}\t{}\t{}\t{}", key.domain, key.path, key.name, cookie.value)
                .map_err(|e| anyhow::anyhow!(e))?;
        }
        Ok(())
    }
}

fn domain_matches(cookie_domain: &str, request_host: &str, host_only: bool) -> bool {
    if host_only {
        return request_host == cookie_domain;
    }
    request_host == cookie_domain || request_host.ends_with(&format!(".{cookie_domain}"))
}

fn path_matches(cookie_path: &str, request_path: &str) -> bool {
    request_path.starts_with(cookie_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received_with_set_cookie(raw: &str) -> ReceivedHeaders {
        let mut headers = ReceivedHeaders::new();
        headers.add_header("Set-Cookie", raw);
        headers
    }

    #[test]
    fn stores_and_retrieves_simple_cookie() {
        let store = CookieStore::new();
        store.set_cookies_from_headers(&received_with_set_cookie("sid=abc123; Path=/"), "example.com", "/");

        let header = store.cookies_for_request("example.com", "/dashboard", false).unwrap();
        assert_eq!(header, "sid=abc123");
    }

    #[test]
    fn secure_cookie_not_sent_over_plain_http() {
        let store = CookieStore::new();
        store.set_cookies_from_headers(
            &received_with_set_cookie("sid=abc123; Path=/; Secure"),
            "example.com",
            "/",
        );

        assert!(store.cookies_for_request("example.com", "/", false).is_none());
        assert!(store.cookies_for_request("example.com", "/", true).is_some());
    }

    #[test]
    fn path_scoping_is_respected() {
        let store = CookieStore::new();
        store.set_cookies_from_headers(
            &received_with_set_cookie("sid=abc123; Path=/admin"),
            "example.com",
            "/admin",
        );

        assert!(store.cookies_for_request("example.com", "/admin/users", false).is_some());
        assert!(store.cookies_for_request("example.com", "/public", false).is_none());
    }

    #[test]
    fn get_changed_cookies_is_consuming() {
        let store = CookieStore::new();
        store.set_cookies_from_headers(&received_with_set_cookie("a=1; Path=/"), "example.com", "/");

        let first = store.get_changed_cookies();
        assert_eq!(first.len(), 1);
        let second = store.get_changed_cookies();
        assert!(second.is_empty());
    }

    #[test]
    fn host_only_cookie_is_not_sent_to_a_subdomain() {
        let store = CookieStore::new();
        store.set_cookies_from_headers(&received_with_set_cookie("sid=abc123; Path=/"), "example.com", "/");

        assert!(store.cookies_for_request("example.com", "/", false).is_some());
        assert!(
            store.cookies_for_request("sub.example.com", "/", false).is_none(),
            "a cookie with no explicit Domain attribute is host-only per RFC 6265"
        );
    }

    #[test]
    fn explicit_domain_cookie_is_sent_to_subdomains() {
        let store = CookieStore::new();
        store.set_cookies_from_headers(
            &received_with_set_cookie("sid=abc123; Path=/; Domain=example.com"),
            "example.com",
            "/",
        );

        assert!(store.cookies_for_request("sub.example.com", "/", false).is_some());
    }

    #[test]
    fn all_cookies_snapshot_is_non_consuming() {
        let store = CookieStore::new();
        store.set_cookies_from_headers(&received_with_set_cookie("a=1; Path=/"), "example.com", "/");

        assert_eq!(store.all_cookies_snapshot().len(), 1);
        assert_eq!(store.all_cookies_snapshot().len(), 1);
    }
}
