//! HTTP/2 transport: one multiplexed session per origin, with push
//! promise handling and idle timers.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use futures_util::{future::poll_fn, StreamExt};
use h2::{client::SendRequest, Reason};
use http::{
    header::{HeaderName, CONNECTION, HOST, TRANSFER_ENCODING, UPGRADE},
    HeaderMap, Method, Version,
};
use log::{debug, trace};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    alpn::Origin,
    body::{Body, BodyKind, PushedSlot, ResponseBody},
    connect::{Connector, MaybeTls},
    decoder::Accepts,
    error::Error,
    response::Response,
    Url,
};

/// How long `reset()` waits for a session driver to wind down before
/// moving on; the driver tears the connection down either way.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Decision returned by a push promise handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushAction {
    /// Receive the pushed response and deliver it to the push handler.
    Accept,
    /// Cancel the pushed stream before any body is delivered.
    Reject,
}

/// Inspects a push promise (`url`, request headers) before the pushed
/// response exists and may reject it.
pub type PushPromiseHandler = Arc<dyn Fn(&Url, &HeaderMap) -> PushAction + Send + Sync>;

/// Receives a pushed response. The handler owns the response and is
/// responsible for consuming its body before the pushed-stream idle
/// timeout evicts it.
pub type PushHandler = Arc<dyn Fn(Url, HeaderMap, Response) + Send + Sync>;

/// HTTP/2 session options.
#[derive(Clone)]
pub struct Http2Options {
    pub(crate) idle_session_timeout: Duration,
    pub(crate) pushed_stream_idle_timeout: Duration,
    pub(crate) push_promise_handler: Option<PushPromiseHandler>,
    pub(crate) push_handler: Option<PushHandler>,
}

impl Default for Http2Options {
    fn default() -> Http2Options {
        Http2Options {
            idle_session_timeout: Duration::from_secs(300),
            pushed_stream_idle_timeout: Duration::from_secs(5),
            push_promise_handler: None,
            push_handler: None,
        }
    }
}

impl Http2Options {
    /// Creates the default option set.
    pub fn new() -> Http2Options {
        Http2Options::default()
    }

    /// How long a session with no active streams stays open. Default 300s.
    pub fn idle_session_timeout(mut self, timeout: Duration) -> Http2Options {
        self.idle_session_timeout = timeout;
        self
    }

    /// How long an unconsumed pushed stream survives after its response
    /// headers arrive. Default 5s.
    pub fn pushed_stream_idle_timeout(mut self, timeout: Duration) -> Http2Options {
        self.pushed_stream_idle_timeout = timeout;
        self
    }

    /// Registers a handler consulted for every push promise. Registering
    /// any push handler enables server push on new sessions.
    pub fn push_promise_handler<F>(mut self, handler: F) -> Http2Options
    where
        F: Fn(&Url, &HeaderMap) -> PushAction + Send + Sync + 'static,
    {
        self.push_promise_handler = Some(Arc::new(handler));
        self
    }

    /// Registers a handler receiving accepted pushed responses.
    pub fn push_handler<F>(mut self, handler: F) -> Http2Options
    where
        F: Fn(Url, HeaderMap, Response) + Send + Sync + 'static,
    {
        self.push_handler = Some(Arc::new(handler));
        self
    }

    fn push_enabled(&self) -> bool {
        self.push_promise_handler.is_some() || self.push_handler.is_some()
    }
}

impl fmt::Debug for Http2Options {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Http2Options")
            .field("idle_session_timeout", &self.idle_session_timeout)
            .field(
                "pushed_stream_idle_timeout",
                &self.pushed_stream_idle_timeout,
            )
            .field("push_promise_handler", &self.push_promise_handler.is_some())
            .field("push_handler", &self.push_handler.is_some())
            .finish()
    }
}

/// The HTTP/2 transport: a per-origin cache of multiplexed sessions.
pub(crate) struct H2Transport {
    inner: Arc<H2Inner>,
}

struct H2Inner {
    connector: Arc<Connector>,
    opts: Http2Options,
    accepts: Accepts,
    sessions: Mutex<HashMap<Origin, Session>>,
}

#[derive(Clone)]
struct Session {
    sender: SendRequest<Bytes>,
    shared: Arc<SessionShared>,
}

struct SessionShared {
    origin: Origin,
    closed: AtomicBool,
    active: AtomicUsize,
    last_used: Mutex<Instant>,
    /// Fired to ask the driver to tear the connection down.
    close: CancellationToken,
    /// Fired by the driver once the connection is gone.
    done: CancellationToken,
}

/// Keeps a session's active-stream count while a request or its response
/// body is alive; the idle timer only runs when the count is zero.
pub(crate) struct ActiveGuard {
    shared: Arc<SessionShared>,
}

impl ActiveGuard {
    fn new(shared: Arc<SessionShared>) -> ActiveGuard {
        shared.active.fetch_add(1, Ordering::SeqCst);
        shared.touch();
        ActiveGuard { shared }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.shared.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.touch();
        }
    }
}

impl SessionShared {
    fn touch(&self) {
        *self.last_used.lock().expect("session timer poisoned") = Instant::now();
    }

    fn idle_deadline(&self, timeout: Duration) -> Instant {
        *self.last_used.lock().expect("session timer poisoned") + timeout
    }
}

impl H2Transport {
    pub(crate) fn new(connector: Arc<Connector>, opts: Http2Options, accepts: Accepts) -> H2Transport {
        H2Transport {
            inner: Arc::new(H2Inner {
                connector,
                opts,
                accepts,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Issues one request over the origin's session, opening a session
    /// first when none is cached.
    pub(crate) async fn request(
        &self,
        origin: &Origin,
        url: &Url,
        method: Method,
        headers: &HeaderMap,
        body: Body,
        handoff: Option<MaybeTls>,
        signal: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> crate::Result<http::Response<ResponseBody>> {
        let session = self.session(origin, handoff, signal, shutdown).await?;
        let guard = ActiveGuard::new(session.shared.clone());

        let req = build_request(url, method, headers)?;
        let kind = body.into_kind();
        let end_of_stream = matches!(&kind, BodyKind::Buf(bytes) if bytes.is_empty());

        let mut sender = match session.sender.clone().ready().await {
            Ok(sender) => sender,
            Err(e) => {
                self.fail_session(&session);
                return Err(Error::protocol(e));
            }
        };
        let (mut response, send_stream) = match sender.send_request(req, end_of_stream) {
            Ok(pair) => pair,
            Err(e) => {
                self.fail_session(&session);
                return Err(Error::protocol(e));
            }
        };

        if self.inner.opts.push_enabled() {
            self.spawn_push_listener(url, response.push_promises());
        }

        let body_cancel = CancellationToken::new();
        if !end_of_stream {
            tokio::spawn(send_body(send_stream, kind, body_cancel.clone()));
        } else {
            drop(send_stream);
        }

        let res = tokio::select! {
            _ = signal.cancelled() => {
                // Resets the stream with CANCEL: the body writer observes
                // the token, and dropping the response future covers a
                // request whose body is already fully written.
                body_cancel.cancel();
                return Err(Error::abort());
            }
            _ = shutdown.cancelled() => {
                body_cancel.cancel();
                return Err(Error::abort());
            }
            res = &mut response => match res {
                Ok(res) => res,
                Err(e) => {
                    // A dead session must leave the cache before the error
                    // surfaces, so the next request opens a fresh one.
                    if e.is_go_away() {
                        self.fail_session(&session);
                    }
                    return Err(Error::protocol(e));
                }
            },
        };

        let (parts, recv) = res.into_parts();
        let body = ResponseBody::h2(recv, Some(guard), &[signal, shutdown]);
        Ok(http::Response::from_parts(parts, body))
    }

    fn live_session(&self, origin: &Origin) -> Option<Session> {
        let sessions = self.inner.sessions.lock().expect("h2 session cache poisoned");
        sessions
            .get(origin)
            .filter(|s| !s.shared.closed.load(Ordering::SeqCst))
            .cloned()
    }

    /// Returns the origin's live session, creating it when needed. A
    /// handed-off socket seeds the new session; when a live session
    /// already exists the socket is redundant and destroyed.
    async fn session(
        &self,
        origin: &Origin,
        handoff: Option<MaybeTls>,
        signal: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> crate::Result<Session> {
        if let Some(session) = self.live_session(origin) {
            if handoff.is_some() {
                trace!("discarding redundant negotiated socket for {origin}");
            }
            return Ok(session);
        }

        // Serialize session creation per origin so simultaneous first
        // requests end up multiplexed onto one session.
        let lock = self.inner.connector.origin_lock(origin);
        let _guard = lock.lock().await;

        if let Some(session) = self.live_session(origin) {
            return Ok(session);
        }

        let io = match handoff {
            Some(io) => io,
            None => self.inner.connector.connect_h2(origin, signal).await?,
        };

        let mut builder = h2::client::Builder::new();
        builder.enable_push(self.inner.opts.push_enabled());
        let handshake = builder.handshake::<MaybeTls, Bytes>(io);

        let (sender, connection) = tokio::select! {
            _ = signal.cancelled() => return Err(Error::abort()),
            _ = shutdown.cancelled() => return Err(Error::abort()),
            res = handshake => res.map_err(Error::connect)?,
        };

        let shared = Arc::new(SessionShared {
            origin: origin.clone(),
            closed: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
            close: CancellationToken::new(),
            done: CancellationToken::new(),
        });
        let session = Session {
            sender,
            shared: shared.clone(),
        };

        // Connection driver: pumps frames until the peer goes away, a
        // fatal error occurs, or close is requested. It owns removing the
        // session from the cache before anyone can observe it as closed.
        let transport = Arc::downgrade(&self.inner);
        let driver_shared = shared.clone();
        tokio::spawn(async move {
            tokio::select! {
                res = connection => match res {
                    Ok(()) => trace!("http/2 session to {} closed", driver_shared.origin),
                    Err(e) => debug!("http/2 session to {} failed: {e}", driver_shared.origin),
                },
                _ = driver_shared.close.cancelled() => {
                    trace!("http/2 session to {} shut down", driver_shared.origin);
                }
            }
            driver_shared.closed.store(true, Ordering::SeqCst);
            if let Some(inner) = transport.upgrade() {
                let mut sessions = inner.sessions.lock().expect("h2 session cache poisoned");
                let stale = sessions
                    .get(&driver_shared.origin)
                    .map(|s| Arc::ptr_eq(&s.shared, &driver_shared))
                    .unwrap_or(false);
                if stale {
                    sessions.remove(&driver_shared.origin);
                }
            }
            driver_shared.done.cancel();
        });

        // Idle watchdog: closes the session once it has had no active
        // streams for the idle timeout.
        let idle_timeout = self.inner.opts.idle_session_timeout;
        let watchdog_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                // While streams are active the deadline sits in the past;
                // re-arm a full period instead of spinning.
                let deadline = watchdog_shared.idle_deadline(idle_timeout);
                let now = Instant::now();
                let deadline = if deadline <= now {
                    now + idle_timeout
                } else {
                    deadline
                };
                tokio::select! {
                    _ = watchdog_shared.done.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {}
                }
                let idle_for = watchdog_shared
                    .last_used
                    .lock()
                    .expect("session timer poisoned")
                    .elapsed();
                if watchdog_shared.active.load(Ordering::SeqCst) == 0 && idle_for >= idle_timeout {
                    debug!("closing idle http/2 session to {}", watchdog_shared.origin);
                    watchdog_shared.close.cancel();
                    return;
                }
            }
        });

        let mut sessions = self.inner.sessions.lock().expect("h2 session cache poisoned");
        sessions.insert(origin.clone(), session.clone());
        trace!("opened http/2 session to {origin}");
        Ok(session)
    }

    /// Tears a session down after a request-level failure so the next
    /// request opens a fresh one.
    fn fail_session(&self, session: &Session) {
        session.shared.close.cancel();
    }

    fn spawn_push_listener(&self, url: &Url, mut pushes: h2::client::PushPromises) {
        let promise_handler = self.inner.opts.push_promise_handler.clone();
        let push_handler = self.inner.opts.push_handler.clone();
        let idle_timeout = self.inner.opts.pushed_stream_idle_timeout;
        let accepts = self.inner.accepts;
        let base = url.clone();

        tokio::spawn(async move {
            while let Some(result) = pushes.push_promise().await {
                let push = match result {
                    Ok(push) => push,
                    Err(e) => {
                        debug!("push promise stream for {base} ended: {e}");
                        break;
                    }
                };
                let (req, response) = push.into_parts();

                let url = match Url::parse(&req.uri().to_string()) {
                    Ok(url) => url,
                    Err(e) => {
                        debug!("ignoring push promise with unusable uri: {e}");
                        continue;
                    }
                };

                if let Some(handler) = &promise_handler {
                    if handler(&url, req.headers()) == PushAction::Reject {
                        trace!("pushed stream for {url} rejected");
                        // Dropping the pushed response future resets the
                        // stream with CANCEL before any body arrives.
                        drop(response);
                        continue;
                    }
                }

                match push_handler.clone() {
                    Some(handler) => {
                        let (parts, ()) = req.into_parts();
                        tokio::spawn(deliver_push(
                            response,
                            url,
                            parts.headers,
                            handler,
                            idle_timeout,
                            accepts,
                        ));
                    }
                    None => drop(response),
                }
            }
        });
    }

    /// Closes every cached session and waits (briefly) for each driver to
    /// finish. Pushed streams cannot block this: tearing the connection
    /// down cancels them wholesale.
    pub(crate) async fn reset(&self) {
        let sessions: Vec<Session> = {
            let mut map = self.inner.sessions.lock().expect("h2 session cache poisoned");
            map.drain().map(|(_, s)| s).collect()
        };

        for session in &sessions {
            session.shared.close.cancel();
        }
        for session in sessions {
            if tokio::time::timeout(SHUTDOWN_GRACE, session.shared.done.cancelled())
                .await
                .is_err()
            {
                debug!(
                    "http/2 session to {} did not close within grace period",
                    session.shared.origin
                );
            }
        }
    }
}

/// Builds the HTTP/2 request head: `:authority` comes from the logical
/// `host` header when present (which is then dropped so the authority is
/// not sent twice), and connection-level headers are stripped per RFC
/// 7540.
fn build_request(
    url: &Url,
    method: Method,
    headers: &HeaderMap,
) -> crate::Result<http::Request<()>> {
    let authority = match headers.get(HOST).and_then(|v| v.to_str().ok()) {
        Some(host) => host.to_owned(),
        None => match url.port() {
            Some(port) => format!("{}:{port}", url.host_str().unwrap_or_default()),
            None => url.host_str().unwrap_or_default().to_owned(),
        },
    };

    let mut path = url.path().to_owned();
    if path.is_empty() {
        path.push('/');
    }
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    let uri = http::Uri::builder()
        .scheme(if url.scheme() == "https" { "https" } else { "http" })
        .authority(authority)
        .path_and_query(path)
        .build()
        .map_err(Error::builder)?;

    let mut req = http::Request::builder()
        .method(method)
        .uri(uri)
        .version(Version::HTTP_2)
        .body(())
        .map_err(Error::builder)?;

    let connection_headers = [
        HOST,
        CONNECTION,
        TRANSFER_ENCODING,
        UPGRADE,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-connection"),
    ];
    let out = req.headers_mut();
    for (name, value) in headers {
        if connection_headers.iter().any(|skip| skip == name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    Ok(req)
}

enum SendOutcome {
    Done,
    Cancelled,
    Failed(h2::Error),
}

/// Writes the request body respecting the connection's flow control.
async fn send_body(mut stream: h2::SendStream<Bytes>, body: BodyKind, cancel: CancellationToken) {
    match send_body_inner(&mut stream, body, &cancel).await {
        SendOutcome::Done => {}
        SendOutcome::Cancelled => stream.send_reset(Reason::CANCEL),
        SendOutcome::Failed(e) => debug!("request body write failed: {e}"),
    }
}

async fn send_body_inner(
    stream: &mut h2::SendStream<Bytes>,
    body: BodyKind,
    cancel: &CancellationToken,
) -> SendOutcome {
    match body {
        BodyKind::Buf(bytes) => {
            tokio::select! {
                _ = cancel.cancelled() => SendOutcome::Cancelled,
                res = write_chunk(stream, bytes, true) => match res {
                    Ok(()) => SendOutcome::Done,
                    Err(e) => SendOutcome::Failed(e),
                },
            }
        }
        BodyKind::Stream(mut chunks) => {
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => return SendOutcome::Cancelled,
                    chunk = chunks.next() => chunk,
                };
                match chunk {
                    Some(Ok(chunk)) => {
                        let write = tokio::select! {
                            _ = cancel.cancelled() => return SendOutcome::Cancelled,
                            res = write_chunk(stream, chunk, false) => res,
                        };
                        if let Err(e) = write {
                            return SendOutcome::Failed(e);
                        }
                    }
                    Some(Err(e)) => {
                        debug!("request body stream failed: {e}");
                        stream.send_reset(Reason::INTERNAL_ERROR);
                        return SendOutcome::Done;
                    }
                    None => {
                        return match stream.send_data(Bytes::new(), true) {
                            Ok(()) => SendOutcome::Done,
                            Err(e) => SendOutcome::Failed(e),
                        };
                    }
                }
            }
        }
    }
}

async fn write_chunk(
    stream: &mut h2::SendStream<Bytes>,
    mut chunk: Bytes,
    end_of_stream: bool,
) -> Result<(), h2::Error> {
    if chunk.is_empty() {
        return if end_of_stream {
            stream.send_data(chunk, true)
        } else {
            Ok(())
        };
    }

    while !chunk.is_empty() {
        stream.reserve_capacity(chunk.len());
        match poll_fn(|cx| stream.poll_capacity(cx)).await {
            Some(Ok(capacity)) => {
                let len = capacity.min(chunk.len());
                let data = chunk.split_to(len);
                let end = end_of_stream && chunk.is_empty();
                stream.send_data(data, end)?;
            }
            Some(Err(e)) => return Err(e),
            // The stream was reset; nothing more to write.
            None => return Ok(()),
        }
    }
    Ok(())
}

/// Receives one pushed response, arms its idle eviction timer, and hands
/// it to the push handler.
async fn deliver_push(
    response: h2::client::PushedResponseFuture,
    url: Url,
    request_headers: HeaderMap,
    handler: PushHandler,
    idle_timeout: Duration,
    accepts: Accepts,
) {
    let res = match response.await {
        Ok(res) => res,
        Err(e) => {
            debug!("pushed stream for {url} failed: {e}");
            return;
        }
    };

    let (parts, recv) = res.into_parts();
    let slot: PushedSlot = Arc::new(Mutex::new(Some(recv)));

    // Consuming the body takes the stream out of the slot; whatever is
    // still in it when the timer fires gets cancelled.
    let evict_slot = slot.clone();
    let evict_url = url.clone();
    tokio::spawn(async move {
        tokio::time::sleep(idle_timeout).await;
        if let Some(stream) = evict_slot.lock().expect("pushed stream slot poisoned").take() {
            debug!("pushed stream for {evict_url} not consumed in time, cancelling");
            drop(stream);
        }
    });

    let body = ResponseBody::h2_pushed(slot);
    let res = http::Response::from_parts(parts, body);
    let response = Response::new(res, url.clone(), accepts);
    handler(url, request_headers, response);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let opts = Http2Options::default();
        assert_eq!(opts.idle_session_timeout, Duration::from_secs(300));
        assert_eq!(opts.pushed_stream_idle_timeout, Duration::from_secs(5));
        assert!(!opts.push_enabled());
    }

    #[test]
    fn push_handlers_enable_push() {
        let opts = Http2Options::new().push_handler(|_, _, _| {});
        assert!(opts.push_enabled());

        let opts = Http2Options::new().push_promise_handler(|_, _| PushAction::Accept);
        assert!(opts.push_enabled());
    }

    #[test]
    fn authority_prefers_host_header() {
        let url = Url::parse("https://example.com/a/b?q=1").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "override.example:8443".parse().unwrap());
        headers.insert(CONNECTION, "keep-alive".parse().unwrap());
        headers.insert("x-custom", "1".parse().unwrap());

        let req = build_request(&url, Method::GET, &headers).unwrap();
        assert_eq!(req.uri().authority().unwrap().as_str(), "override.example:8443");
        assert_eq!(req.uri().path_and_query().unwrap().as_str(), "/a/b?q=1");
        // The host header maps to :authority and is not sent again.
        assert!(req.headers().get(HOST).is_none());
        assert!(req.headers().get(CONNECTION).is_none());
        assert_eq!(req.headers().get("x-custom").unwrap(), "1");
    }

    #[test]
    fn empty_path_defaults_to_root() {
        let url = Url::parse("https://example.com").unwrap();
        let req = build_request(&url, Method::GET, &HeaderMap::new()).unwrap();
        assert_eq!(req.uri().path_and_query().unwrap().as_str(), "/");
    }
}
