use std::{
    convert::TryFrom,
    error::Error as StdError,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use http::{
    header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST,
        USER_AGENT},
    Method, Version,
};
use futures_util::StreamExt;
use log::{debug, trace};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    alpn::{AlpnCache, AlpnProtocol, Origin},
    body::{Body, ResponseBody},
    connect::{Connector, ConnectorConfig},
    decoder::Accepts,
    error::Error,
    h1::{H1Transport, Http1Options},
    h2::{H2Transport, Http2Options},
    into_url::IntoUrl,
    redirect::{self, RedirectMode},
    request::{Request, RequestBuilder},
    response::Response,
};

/// A `Client` to make Requests with.
///
/// The client negotiates HTTP/1.0, HTTP/1.1 or HTTP/2 per origin via
/// ALPN, caches the outcome, and reuses persistent connections: an
/// HTTP/1 keep-alive pool and at most one multiplexed HTTP/2 session per
/// origin. Distinct clients are fully isolated from each other.
///
/// The `Client` holds all of that state internally, so it is advised
/// that you create one and **reuse** it.
///
/// You do **not** have to wrap the `Client` in an [`Rc`] or [`Arc`] to
/// **reuse** it, because it already uses an [`Arc`] internally.
///
/// [`Rc`]: std::rc::Rc
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

/// A `ClientBuilder` can be used to create a `Client` with custom
/// configuration.
#[must_use]
pub struct ClientBuilder {
    config: Config,
}

struct Config {
    error: Option<Error>,
    user_agent: Option<HeaderValue>,
    overwrite_user_agent: bool,
    alpn_protocols: Vec<AlpnProtocol>,
    alpn_cache_ttl: Duration,
    alpn_cache_size: usize,
    connect_timeout: Option<Duration>,
    reject_unauthorized: bool,
    max_cached_sessions: usize,
    http1: Http1Options,
    http2: Http2Options,
}

struct ClientRef {
    user_agent: Option<HeaderValue>,
    overwrite_user_agent: bool,
    accepts: Accepts,
    alpn: AlpnCache,
    connector: Arc<Connector>,
    h1: H1Transport,
    h2: H2Transport,
    /// Swapped (and the old one fired) on every `reset()` so in-flight
    /// requests fail with an abort error instead of lingering.
    shutdown: Mutex<CancellationToken>,
}

const DEFAULT_USER_AGENT: &str = concat!("polyglot-fetch/", env!("CARGO_PKG_VERSION"));

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    /// Constructs a new `ClientBuilder`.
    ///
    /// This is the same as `Client::builder()`.
    pub fn new() -> ClientBuilder {
        ClientBuilder {
            config: Config {
                error: None,
                user_agent: Some(HeaderValue::from_static(DEFAULT_USER_AGENT)),
                overwrite_user_agent: false,
                alpn_protocols: vec![
                    AlpnProtocol::H2,
                    AlpnProtocol::Http11,
                    AlpnProtocol::Http10,
                ],
                alpn_cache_ttl: Duration::from_millis(3_600_000),
                alpn_cache_size: 100,
                connect_timeout: None,
                reject_unauthorized: true,
                max_cached_sessions: 100,
                http1: Http1Options::default(),
                http2: Http2Options::default(),
            },
        }
    }

    /// Sets the `user-agent` applied to requests that don't carry one.
    /// Defaults to `polyglot-fetch/<version>`.
    pub fn user_agent<V>(mut self, value: V) -> ClientBuilder
    where
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        match HeaderValue::try_from(value) {
            Ok(value) => self.config.user_agent = Some(value),
            Err(e) => self.config.error = Some(Error::builder(e.into())),
        };
        self
    }

    /// When enabled, the configured user agent replaces one already set
    /// on a request. Default is to only fill in a missing header.
    pub fn overwrite_user_agent(mut self, enabled: bool) -> ClientBuilder {
        self.config.overwrite_user_agent = enabled;
        self
    }

    /// The ordered ALPN preference list offered during TLS handshakes.
    /// Defaults to `[h2, http/1.1, http/1.0]`.
    pub fn alpn_protocols(mut self, protocols: Vec<AlpnProtocol>) -> ClientBuilder {
        if protocols.is_empty() {
            self.config.error = Some(Error::builder("alpn_protocols must not be empty"));
        } else {
            self.config.alpn_protocols = protocols;
        }
        self
    }

    /// How long a negotiated protocol stays cached per origin. Defaults
    /// to one hour.
    pub fn alpn_cache_ttl(mut self, ttl: Duration) -> ClientBuilder {
        self.config.alpn_cache_ttl = ttl;
        self
    }

    /// How many origins the ALPN cache remembers. Defaults to 100.
    pub fn alpn_cache_size(mut self, size: usize) -> ClientBuilder {
        self.config.alpn_cache_size = size;
        self
    }

    /// Bounds TCP connect plus TLS handshake time. No bound by default.
    pub fn connect_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.config.connect_timeout = Some(timeout);
        self
    }

    /// Controls server certificate verification. Defaults to verifying.
    ///
    /// # Warning
    ///
    /// Disabling verification makes connections vulnerable to
    /// man-in-the-middle attacks; only do this for testing.
    pub fn reject_unauthorized(mut self, enabled: bool) -> ClientBuilder {
        self.config.reject_unauthorized = enabled;
        self
    }

    /// How many TLS sessions are cached for resumption. Defaults to 100.
    pub fn max_cached_sessions(mut self, max: usize) -> ClientBuilder {
        self.config.max_cached_sessions = max;
        self
    }

    /// HTTP/1.x pool options.
    pub fn http1(mut self, options: Http1Options) -> ClientBuilder {
        self.config.http1 = options;
        self
    }

    /// HTTP/2 session options, including push handlers.
    pub fn http2(mut self, options: Http2Options) -> ClientBuilder {
        self.config.http2 = options;
        self
    }

    /// Returns a `Client` that uses this `ClientBuilder` configuration.
    ///
    /// # Errors
    ///
    /// This method fails if the TLS backend cannot be initialized or an
    /// option was invalid.
    pub fn build(self) -> crate::Result<Client> {
        let config = self.config;

        if let Some(err) = config.error {
            return Err(err);
        }

        let connector = Arc::new(Connector::new(ConnectorConfig {
            alpn_protocols: config.alpn_protocols,
            reject_unauthorized: config.reject_unauthorized,
            max_cached_sessions: config.max_cached_sessions,
            connect_timeout: config.connect_timeout,
        })?);

        let accepts = Accepts::default();

        Ok(Client {
            inner: Arc::new(ClientRef {
                user_agent: config.user_agent,
                overwrite_user_agent: config.overwrite_user_agent,
                accepts,
                alpn: AlpnCache::new(config.alpn_cache_size, config.alpn_cache_ttl),
                h1: H1Transport::new(connector.clone(), config.http1),
                h2: H2Transport::new(connector.clone(), config.http2, accepts),
                connector,
                shutdown: Mutex::new(CancellationToken::new()),
            }),
        })
    }
}

impl Client {
    /// Constructs a new `Client` with the default configuration.
    ///
    /// # Panics
    ///
    /// This method panics if the TLS backend cannot be initialized. Use
    /// `Client::builder()` if you wish to handle the failure as an
    /// `Error` instead of panicking.
    pub fn new() -> Client {
        ClientBuilder::new().build().expect("Client::new()")
    }

    /// Creates a `ClientBuilder` to configure a `Client`.
    ///
    /// This is the same as `ClientBuilder::new()`.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Starts a `GET` request to a URL; change the method and options on
    /// the returned builder.
    ///
    /// # Errors
    ///
    /// The builder carries the error if `url` fails to parse; it
    /// surfaces when the request is sent.
    pub fn fetch<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        let req = url.into_url().map(|url| Request::new(Method::GET, url));
        RequestBuilder::new(self.clone(), req)
    }

    /// Starts a request with an explicit method.
    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        let req = url.into_url().map(|url| Request::new(method, url));
        RequestBuilder::new(self.clone(), req)
    }

    /// Executes a `Request`, driving protocol negotiation, connection
    /// reuse and the redirect rules.
    ///
    /// # Errors
    ///
    /// This method fails if there was an error while sending the request,
    /// a redirect was disallowed, or the redirect limit was exhausted.
    pub async fn execute(&self, request: Request) -> crate::Result<Response> {
        self.execute_request(request).await
    }

    /// Closes every pooled connection and cached session and clears the
    /// ALPN cache. In-flight requests fail with an abort error; the next
    /// request re-establishes connections. Safe to call repeatedly.
    pub async fn reset(&self) {
        let old = {
            let mut shutdown = self.inner.shutdown.lock().expect("shutdown token poisoned");
            std::mem::replace(&mut *shutdown, CancellationToken::new())
        };
        old.cancel();

        self.inner.h1.reset();
        self.inner.h2.reset().await;
        self.inner.alpn.clear();
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.inner
            .shutdown
            .lock()
            .expect("shutdown token poisoned")
            .clone()
    }

    fn accepts_for(&self, compress: bool) -> Accepts {
        if compress {
            self.inner.accepts
        } else {
            Accepts::none()
        }
    }

    async fn execute_request(&self, req: Request) -> crate::Result<Response> {
        let (method, mut url, mut headers, body, redirect_mode, follow, compress, signal) =
            req.pieces();

        if !matches!(url.scheme(), "http" | "https" | "http2") {
            return Err(Error::url_bad_scheme(url));
        }

        let mut method = normalize_method(method)?;
        let signal = signal.unwrap_or_default();
        let shutdown = self.shutdown_token();

        // Buffered bodies are remembered for replay across redirect hops;
        // a streaming body is marked non-replayable instead.
        let (mut reusable, mut first_body) = match body {
            Some(body) => {
                let (reusable, body) = body.try_reuse();
                (Some(reusable), Some(body))
            }
            None => (None, None),
        };

        let mut redirects: u32 = 0;

        loop {
            if signal.is_cancelled() || shutdown.is_cancelled() {
                return Err(Error::abort().with_url(url));
            }

            let send_body = match first_body.take() {
                Some(body) => body,
                None => match &reusable {
                    Some(Some(bytes)) => Body::reusable(bytes.clone()),
                    _ => Body::empty(),
                },
            };

            let res = match self
                .dispatch(&method, &url, &mut headers, send_body, compress, &signal, &shutdown)
                .await
            {
                Ok(res) => res,
                Err(err) => return Err(err.with_url(url)),
            };

            let status = res.status();
            if redirect::is_redirect(status) {
                match redirect_mode {
                    RedirectMode::Error => {
                        return Err(Error::redirect(redirect::NoRedirect, url));
                    }
                    RedirectMode::Manual => {
                        let (mut parts, body) = res.into_parts();
                        redirect::absolutize_location(&url, &mut parts.headers);
                        let res = http::Response::from_parts(parts, body);
                        return Ok(Response::new(res, url, self.accepts_for(compress)));
                    }
                    RedirectMode::Follow => {
                        if let Some(loc) = redirect::location(&url, res.headers()) {
                            if redirects >= follow {
                                return Err(Error::redirect(redirect::TooManyRedirects, url));
                            }
                            // A consumed stream cannot be replayed; only a
                            // 303 (which drops the body) may proceed.
                            if status != http::StatusCode::SEE_OTHER
                                && matches!(reusable, Some(None))
                            {
                                return Err(Error::redirect(redirect::UnsupportedRedirect, url));
                            }
                            if !matches!(loc.scheme(), "http" | "https" | "http2") {
                                return Err(Error::url_bad_scheme(loc));
                            }

                            if redirect::step(status, &method) == redirect::Step::RewriteToGet {
                                method = Method::GET;
                                reusable = None;
                                redirect::remove_body_headers(&mut headers);
                            }

                            debug!("redirecting '{url}' to '{loc}'");
                            redirect::remove_sensitive_headers(&mut headers, &loc, &url);
                            // The host header is re-derived for the target.
                            headers.remove(HOST);
                            redirects += 1;
                            url = loc;
                            drain_body(res).await;
                            continue;
                        }
                        // No usable location: hand the 3xx back as-is.
                    }
                }
            }

            return Ok(Response::new(res, url, self.accepts_for(compress)));
        }
    }

    /// Normalizes the request and routes it to the transport selected by
    /// the ALPN cache, negotiating (and handing the fresh socket off)
    /// on a cache miss.
    async fn dispatch(
        &self,
        method: &Method,
        url: &Url,
        headers: &mut HeaderMap,
        body: Body,
        compress: bool,
        signal: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> crate::Result<http::Response<ResponseBody>> {
        // The h2c scheme variant is cleartext http with prior-knowledge
        // HTTP/2.
        let seed_origin = Origin::from_url(url)?;
        let (target, proto_hint) = if url.scheme() == "http2" {
            (rewrite_h2c(url)?, Some(AlpnProtocol::H2c))
        } else {
            (url.clone(), None)
        };
        let origin = Origin::from_url(&target)?;

        if !headers.contains_key(HOST) {
            if let Some(host) = host_header(&target) {
                headers.insert(HOST, host);
            }
        }
        if let Some(agent) = &self.inner.user_agent {
            if self.inner.overwrite_user_agent || !headers.contains_key(USER_AGENT) {
                headers.insert(USER_AGENT, agent.clone());
            }
        }
        if body.is_text() && !headers.contains_key(CONTENT_TYPE) {
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain;charset=UTF-8"),
            );
        }
        if compress && !headers.contains_key(ACCEPT_ENCODING) {
            if let Some(encodings) = self.inner.accepts.as_str() {
                headers.insert(ACCEPT_ENCODING, HeaderValue::from_static(encodings));
            }
        }
        if !headers.contains_key(CONTENT_LENGTH) {
            if let Some(len) = body.content_length().filter(|len| *len > 0) {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
            }
        }

        let (protocol, handoff) = match target.scheme() {
            "http" => {
                let protocol = proto_hint.unwrap_or(AlpnProtocol::Http11);
                if self.inner.alpn.get(&seed_origin).is_none() {
                    self.inner.alpn.set(seed_origin.clone(), protocol);
                }
                (protocol, None)
            }
            "https" => match self.inner.alpn.get(&origin) {
                Some(protocol) => (protocol, None),
                None => {
                    // Serialize the probing handshake per origin and
                    // re-check the cache once the lock is held, so a herd
                    // of first requests costs one handshake.
                    let lock = self.inner.connector.origin_lock(&origin);
                    let _guard = lock.lock().await;
                    match self.inner.alpn.get(&origin) {
                        Some(protocol) => (protocol, None),
                        None => {
                            let (io, protocol) = self
                                .inner
                                .connector
                                .connect_negotiate(&origin, signal)
                                .await?;
                            self.inner.alpn.set(origin.clone(), protocol);
                            (protocol, Some(io))
                        }
                    }
                }
            },
            _ => return Err(Error::url_bad_scheme(target)),
        };

        trace!("dispatching {method} {target} over {protocol}");

        match protocol {
            AlpnProtocol::H2 | AlpnProtocol::H2c => {
                let retry_body = body.try_clone();
                let first = self
                    .inner
                    .h2
                    .request(
                        &origin,
                        &target,
                        method.clone(),
                        headers,
                        body,
                        handoff,
                        signal,
                        shutdown,
                    )
                    .await;
                match first {
                    // The peer shut the session down gracefully under us;
                    // one retry on a fresh session is safe for replayable
                    // bodies.
                    Err(err) if is_retryable_error(&err) => match retry_body {
                        Some(body) => {
                            debug!("retrying {method} {target} after graceful goaway");
                            self.inner
                                .h2
                                .request(
                                    &origin,
                                    &target,
                                    method.clone(),
                                    headers,
                                    body,
                                    None,
                                    signal,
                                    shutdown,
                                )
                                .await
                        }
                        None => Err(err),
                    },
                    other => other,
                }
            }
            AlpnProtocol::Http11 | AlpnProtocol::Http10 => {
                let req = h1_request(&target, method, headers, body, protocol)?;
                self.inner
                    .h1
                    .request(&origin, req, handoff, signal, shutdown)
                    .await
            }
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Client").finish()
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("alpn_protocols", &self.config.alpn_protocols)
            .field("alpn_cache_size", &self.config.alpn_cache_size)
            .field("http1", &self.config.http1)
            .field("http2", &self.config.http2)
            .finish()
    }
}

/// Reads a 3xx body to EOF so its HTTP/1 connection can be reused for
/// the next hop. Oversized bodies are abandoned (closing the connection)
/// rather than buffered.
async fn drain_body(res: http::Response<ResponseBody>) {
    const DRAIN_LIMIT: usize = 64 * 1024;

    let mut body = res.into_body();
    let mut drained = 0;
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(chunk) => {
                drained += chunk.len();
                if drained > DRAIN_LIMIT {
                    return;
                }
            }
            Err(_) => return,
        }
    }
}

fn normalize_method(method: Method) -> crate::Result<Method> {
    let name = method.as_str();
    if !name.bytes().any(|b| b.is_ascii_lowercase()) {
        return Ok(method);
    }
    Method::from_bytes(name.to_ascii_uppercase().as_bytes()).map_err(Error::builder)
}

fn host_header(url: &Url) -> Option<HeaderValue> {
    let host = url.host_str()?;
    let value = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };
    HeaderValue::from_str(&value).ok()
}

/// Re-parses an `http2:` URL as `http:`. The url crate refuses to switch
/// a non-special scheme to a special one in place.
fn rewrite_h2c(url: &Url) -> crate::Result<Url> {
    let raw = url.as_str();
    let rest = &raw["http2".len()..];
    Url::parse(&format!("http{rest}")).map_err(Error::builder)
}

fn h1_request(
    url: &Url,
    method: &Method,
    headers: &HeaderMap,
    body: Body,
    protocol: AlpnProtocol,
) -> crate::Result<http::Request<hyper::Body>> {
    let mut path = url.path().to_owned();
    if path.is_empty() {
        path.push('/');
    }
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    let uri: http::Uri = path.parse().map_err(Error::builder)?;

    let mut builder = http::Request::builder().method(method.clone()).uri(uri);
    if protocol == AlpnProtocol::Http10 {
        builder = builder.version(Version::HTTP_10);
    }
    let mut req = builder.body(body.into_hyper()).map_err(Error::builder)?;
    *req.headers_mut() = headers.clone();
    Ok(req)
}

/// A request that died because the server sent a graceful shutdown can be
/// retried on a new session.
fn is_retryable_error(err: &Error) -> bool {
    if let Some(cause) = err.source() {
        if let Some(err) = cause.downcast_ref::<h2::Error>() {
            return err.is_go_away()
                && err.is_remote()
                && err.reason() == Some(h2::Reason::NO_ERROR);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_method_uppercases() {
        let method = Method::from_bytes(b"get").unwrap();
        assert_eq!(normalize_method(method).unwrap(), Method::GET);

        let method = Method::from_bytes(b"purge").unwrap();
        assert_eq!(normalize_method(method).unwrap().as_str(), "PURGE");

        assert_eq!(normalize_method(Method::POST).unwrap(), Method::POST);
    }

    #[test]
    fn host_header_includes_explicit_port() {
        let url = Url::parse("http://example.com:8080/a").unwrap();
        assert_eq!(host_header(&url).unwrap(), "example.com:8080");

        // Default ports are not repeated.
        let url = Url::parse("https://example.com/a").unwrap();
        assert_eq!(host_header(&url).unwrap(), "example.com");
    }

    #[test]
    fn rewrite_h2c_changes_scheme_only() {
        let url = Url::parse("http2://example.com:8080/path?x=1").unwrap();
        let rewritten = rewrite_h2c(&url).unwrap();
        assert_eq!(rewritten.as_str(), "http://example.com:8080/path?x=1");
    }

    #[test]
    fn unsupported_scheme_is_a_builder_error() {
        let client = Client::new();
        let err = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(client.fetch("ftp://example.com/file").send())
            .unwrap_err();
        assert!(err.is_builder());
    }

    #[test]
    fn builder_rejects_empty_alpn_list() {
        let err = Client::builder()
            .alpn_protocols(Vec::new())
            .build()
            .unwrap_err();
        assert!(err.is_builder());
    }
}
