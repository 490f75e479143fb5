use std::fmt;

use url::Url;

/// Canonical `scheme://host:port` identity of a service, with the default
/// port for the scheme elided so `https://example.com` and
/// `https://example.com:443` are the same accounting bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey(String);

impl ServiceKey {
    /// Parse a full request URL down to its service identity.
    pub fn parse(url: &str) -> crate::error::Result<Self> {
        let parsed = Url::parse(url)?;
        Self::from_url(&parsed)
    }

    pub fn from_url(url: &Url) -> crate::error::Result<Self> {
        let scheme = url.scheme();
        let host = url
            .host_str()
            .ok_or_else(|| crate::error::CoreError::Protocol(format!("URL has no host: {url}")))?;

        let key = match url.port() {
            Some(port) if Some(port) != default_port(scheme) => {
                format!("{scheme}://{host}:{port}")
            }
            _ => format!("{scheme}://{host}"),
        };
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_elided() {
        let a = ServiceKey::parse("https://example.com:443/foo").unwrap();
        let b = ServiceKey::parse("https://example.com/bar").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "https://example.com");
    }

    #[test]
    fn non_default_port_is_preserved() {
        let a = ServiceKey::parse("https://example.com:8443/foo").unwrap();
        assert_eq!(a.as_str(), "https://example.com:8443");
    }

    #[test]
    fn different_hosts_are_distinct() {
        let a = ServiceKey::parse("https://a.example.com").unwrap();
        let b = ServiceKey::parse("https://b.example.com").unwrap();
        assert_ne!(a, b);
    }
}
