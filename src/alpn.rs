//! ALPN protocol tags and the per-origin negotiation cache.
//!
//! The cache remembers which application protocol an origin advertised
//! during a TLS handshake so repeat requests skip the probing handshake
//! entirely. Entries are bounded by an LRU limit and a max age.

use std::{
    fmt,
    sync::Mutex,
    time::{Duration, Instant},
};

use schnellru::{ByLength, LruMap};
use url::Url;

/// An application protocol negotiated via ALPN (or implied by the URL
/// scheme for cleartext connections).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlpnProtocol {
    /// HTTP/2 over TLS.
    H2,
    /// HTTP/2 over cleartext TCP (prior knowledge).
    H2c,
    /// HTTP/1.1.
    Http11,
    /// HTTP/1.0.
    Http10,
}

/// HTTP/2 over TLS, the `h2` ALPN identifier.
pub const ALPN_HTTP2: AlpnProtocol = AlpnProtocol::H2;
/// HTTP/2 over cleartext TCP, the `h2c` identifier.
pub const ALPN_HTTP2C: AlpnProtocol = AlpnProtocol::H2c;
/// HTTP/1.1, the `http/1.1` ALPN identifier.
pub const ALPN_HTTP1_1: AlpnProtocol = AlpnProtocol::Http11;
/// HTTP/1.0, the `http/1.0` identifier.
pub const ALPN_HTTP1_0: AlpnProtocol = AlpnProtocol::Http10;

impl AlpnProtocol {
    /// The identifier as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlpnProtocol::H2 => "h2",
            AlpnProtocol::H2c => "h2c",
            AlpnProtocol::Http11 => "http/1.1",
            AlpnProtocol::Http10 => "http/1.0",
        }
    }

    pub(crate) fn as_bytes(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    pub(crate) fn from_wire(bytes: &[u8]) -> Option<AlpnProtocol> {
        match bytes {
            b"h2" => Some(AlpnProtocol::H2),
            b"h2c" => Some(AlpnProtocol::H2c),
            b"http/1.1" => Some(AlpnProtocol::Http11),
            b"http/1.0" => Some(AlpnProtocol::Http10),
            _ => None,
        }
    }

}

impl fmt::Display for AlpnProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (scheme, host, port) triple used as cache, pool and session key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Origin {
    scheme: Box<str>,
    host: Box<str>,
    port: u16,
}

impl Origin {
    pub(crate) fn from_url(url: &Url) -> crate::Result<Origin> {
        let host = url
            .host_str()
            .ok_or_else(|| crate::Error::url_bad_scheme(url.clone()))?;
        let port = url
            .port_or_known_default()
            .unwrap_or_else(|| match url.scheme() {
                "https" => 443,
                _ => 80,
            });
        Ok(Origin {
            scheme: url.scheme().into(),
            host: host.into(),
            port,
        })
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn is_https(&self) -> bool {
        &*self.scheme == "https"
    }

    pub(crate) fn addr(&self) -> (String, u16) {
        (self.host.to_string(), self.port)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

struct CacheEntry {
    protocol: AlpnProtocol,
    expires_at: Instant,
}

/// Bounded LRU + TTL map of origin to negotiated protocol.
pub(crate) struct AlpnCache {
    entries: Mutex<LruMap<Origin, CacheEntry, ByLength>>,
    ttl: Duration,
    capacity: u32,
}

impl AlpnCache {
    pub(crate) fn new(capacity: usize, ttl: Duration) -> AlpnCache {
        let capacity = capacity.max(1) as u32;
        AlpnCache {
            entries: Mutex::new(LruMap::new(ByLength::new(capacity))),
            ttl,
            capacity,
        }
    }

    /// Returns the cached protocol for `origin`, dropping the entry when it
    /// has outlived its TTL. Expired entries are never returned.
    pub(crate) fn get(&self, origin: &Origin) -> Option<AlpnProtocol> {
        let mut entries = self.entries.lock().expect("alpn cache poisoned");
        let expired = match entries.get(origin) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.protocol),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(origin);
        }
        None
    }

    pub(crate) fn set(&self, origin: Origin, protocol: AlpnProtocol) {
        let mut entries = self.entries.lock().expect("alpn cache poisoned");
        entries.insert(
            origin,
            CacheEntry {
                protocol,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub(crate) fn clear(&self) {
        let mut entries = self.entries.lock().expect("alpn cache poisoned");
        *entries = LruMap::new(ByLength::new(self.capacity));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(host: &str) -> Origin {
        Origin::from_url(&Url::parse(&format!("https://{host}/")).unwrap()).unwrap()
    }

    #[test]
    fn origin_default_ports() {
        let https = Origin::from_url(&Url::parse("https://example.com/x").unwrap()).unwrap();
        assert_eq!(https.port(), 443);

        let http = Origin::from_url(&Url::parse("http://example.com/x").unwrap()).unwrap();
        assert_eq!(http.port(), 80);

        let h2c = Origin::from_url(&Url::parse("http2://example.com/x").unwrap()).unwrap();
        assert_eq!(h2c.port(), 80);

        let custom = Origin::from_url(&Url::parse("https://example.com:8443/").unwrap()).unwrap();
        assert_eq!(custom.port(), 8443);
    }

    #[test]
    fn hit_and_miss() {
        let cache = AlpnCache::new(4, Duration::from_secs(60));
        let key = origin("a.example");

        assert_eq!(cache.get(&key), None);
        cache.set(key.clone(), AlpnProtocol::H2);
        assert_eq!(cache.get(&key), Some(AlpnProtocol::H2));
        assert_eq!(cache.get(&origin("b.example")), None);
    }

    #[test]
    fn lru_eviction() {
        let cache = AlpnCache::new(2, Duration::from_secs(60));
        cache.set(origin("a.example"), AlpnProtocol::H2);
        cache.set(origin("b.example"), AlpnProtocol::Http11);
        // Touch "a" so "b" is the least recently used.
        assert_eq!(cache.get(&origin("a.example")), Some(AlpnProtocol::H2));
        cache.set(origin("c.example"), AlpnProtocol::H2);

        assert_eq!(cache.get(&origin("a.example")), Some(AlpnProtocol::H2));
        assert_eq!(cache.get(&origin("b.example")), None);
        assert_eq!(cache.get(&origin("c.example")), Some(AlpnProtocol::H2));
    }

    #[test]
    fn ttl_expiry() {
        let cache = AlpnCache::new(4, Duration::from_millis(20));
        let key = origin("a.example");
        cache.set(key.clone(), AlpnProtocol::H2);
        assert_eq!(cache.get(&key), Some(AlpnProtocol::H2));

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&key), None);
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = AlpnCache::new(4, Duration::from_secs(60));
        cache.set(origin("a.example"), AlpnProtocol::H2);
        cache.clear();
        assert_eq!(cache.get(&origin("a.example")), None);
    }

    #[test]
    fn wire_names_round_trip() {
        for proto in [
            AlpnProtocol::H2,
            AlpnProtocol::H2c,
            AlpnProtocol::Http11,
            AlpnProtocol::Http10,
        ] {
            assert_eq!(AlpnProtocol::from_wire(proto.as_bytes()), Some(proto));
        }
        assert_eq!(AlpnProtocol::from_wire(b"spdy/3"), None);
    }
}
