//! HTTP/1.x transport: a keep-alive connection pool over
//! `hyper::client::conn`.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, Weak},
    task::{Context, Poll},
    time::{Duration, Instant},
};

use futures_util::{future::poll_fn, task::noop_waker_ref};
use hyper::client::conn::{self, SendRequest};
use log::{debug, trace};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{
    alpn::Origin,
    body::ResponseBody,
    connect::{Connector, MaybeTls},
    error::{Error, TimedOut},
};

/// Reports whether a pooled `SendRequest` has been closed, without blocking.
fn sender_is_closed<B>(sender: &mut SendRequest<B>) -> bool {
    let mut cx = Context::from_waker(noop_waker_ref());
    matches!(sender.poll_ready(&mut cx), Poll::Ready(Err(_)))
}

/// Scheduling order for idle pooled connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduling {
    /// Oldest idle connection is reused first.
    Fifo,
    /// Most recently parked connection is reused first.
    Lifo,
}

/// HTTP/1.x pool and connection options.
#[derive(Debug, Clone)]
pub struct Http1Options {
    pub(crate) keep_alive: bool,
    pub(crate) keep_alive_timeout: Duration,
    pub(crate) max_sockets: Option<usize>,
    pub(crate) max_total_sockets: Option<usize>,
    pub(crate) max_free_sockets: usize,
    pub(crate) socket_timeout: Option<Duration>,
    pub(crate) scheduling: Scheduling,
}

impl Default for Http1Options {
    fn default() -> Http1Options {
        Http1Options {
            keep_alive: true,
            keep_alive_timeout: Duration::from_millis(1_000),
            max_sockets: None,
            max_total_sockets: None,
            max_free_sockets: 256,
            socket_timeout: None,
            scheduling: Scheduling::Fifo,
        }
    }
}

impl Http1Options {
    /// Creates the default option set.
    pub fn new() -> Http1Options {
        Http1Options::default()
    }

    /// Enables or disables connection reuse. Default is enabled.
    pub fn keep_alive(mut self, enabled: bool) -> Http1Options {
        self.keep_alive = enabled;
        self
    }

    /// How long an idle connection stays eligible for reuse. Default 1s.
    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Http1Options {
        self.keep_alive_timeout = timeout;
        self
    }

    /// Caps concurrent connections per origin. Default unlimited.
    pub fn max_sockets(mut self, max: usize) -> Http1Options {
        self.max_sockets = Some(max);
        self
    }

    /// Caps concurrent connections across all origins. Default unlimited.
    pub fn max_total_sockets(mut self, max: usize) -> Http1Options {
        self.max_total_sockets = Some(max);
        self
    }

    /// Caps idle connections kept per origin. Default 256.
    pub fn max_free_sockets(mut self, max: usize) -> Http1Options {
        self.max_free_sockets = max;
        self
    }

    /// Bounds the wait for response headers on one request.
    pub fn socket_timeout(mut self, timeout: Duration) -> Http1Options {
        self.socket_timeout = Some(timeout);
        self
    }

    /// Selects the idle reuse order. Default FIFO.
    pub fn scheduling(mut self, scheduling: Scheduling) -> Http1Options {
        self.scheduling = scheduling;
        self
    }
}

/// The HTTP/1.x transport: one request at a time per connection, pooled
/// per origin.
pub(crate) struct H1Transport {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    connector: Arc<Connector>,
    opts: Http1Options,
    total: Option<Arc<Semaphore>>,
    pools: Mutex<HashMap<Origin, PerOrigin>>,
}

struct PerOrigin {
    idle: VecDeque<Idle>,
    limit: Option<Arc<Semaphore>>,
}

struct Idle {
    conn: PooledConn,
    since: Instant,
}

/// A connection checked out of (or dialed for) the pool. Exactly one
/// in-flight request may use it; it returns to the pool through
/// [`PooledConn::release`] once the response body is fully consumed, and
/// is destroyed on drop otherwise.
pub(crate) struct PooledConn {
    sender: SendRequest<hyper::Body>,
    origin: Origin,
    pool: Weak<PoolInner>,
    _permits: Permits,
}

struct Permits {
    _per_origin: Option<OwnedSemaphorePermit>,
    _total: Option<OwnedSemaphorePermit>,
}

impl H1Transport {
    pub(crate) fn new(connector: Arc<Connector>, opts: Http1Options) -> H1Transport {
        let total = opts
            .max_total_sockets
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        H1Transport {
            inner: Arc::new(PoolInner {
                connector,
                opts,
                total,
                pools: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Issues one request. A pre-negotiated socket from the ALPN probe is
    /// used directly (still billed against the pool); otherwise a pooled
    /// or fresh connection is used.
    pub(crate) async fn request(
        &self,
        origin: &Origin,
        req: http::Request<hyper::Body>,
        handoff: Option<MaybeTls>,
        signal: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> crate::Result<http::Response<ResponseBody>> {
        let mut conn = match handoff {
            Some(io) => {
                let permits = self.billing(origin, signal, shutdown).await?;
                self.handshake(origin, io, permits).await?
            }
            None => self.acquire(origin, signal, shutdown).await?,
        };

        let in_flight = conn.sender.send_request(req);
        let socket_timeout = self.inner.opts.socket_timeout;
        let response = async move {
            match socket_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, in_flight).await {
                    Ok(res) => res.map_err(Error::request),
                    Err(_) => Err(Error::request(TimedOut)),
                },
                None => in_flight.await.map_err(Error::request),
            }
        };

        let res = tokio::select! {
            // Dropping `conn` here closes the socket; an aborted request
            // never returns its connection to the pool.
            _ = signal.cancelled() => return Err(Error::abort()),
            _ = shutdown.cancelled() => return Err(Error::abort()),
            res = response => res?,
        };

        let (parts, body) = res.into_parts();
        let body = ResponseBody::h1(body, Some(conn), &[signal, shutdown]);
        Ok(http::Response::from_parts(parts, body))
    }

    async fn acquire(
        &self,
        origin: &Origin,
        signal: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> crate::Result<PooledConn> {
        while let Some(mut conn) = self.pop_idle(origin) {
            match poll_fn(|cx| conn.sender.poll_ready(cx)).await {
                Ok(()) => {
                    trace!("reusing http/1 connection to {origin}");
                    return Ok(conn);
                }
                Err(e) => trace!("discarding broken idle connection to {origin}: {e}"),
            }
        }

        let permits = self.billing(origin, signal, shutdown).await?;
        let io = self.inner.connector.connect_h1(origin, signal).await?;
        self.handshake(origin, io, permits).await
    }

    fn pop_idle(&self, origin: &Origin) -> Option<PooledConn> {
        let mut pools = self.inner.pools.lock().expect("h1 pool poisoned");
        let per = pools.get_mut(origin)?;
        loop {
            let mut idle = match self.inner.opts.scheduling {
                Scheduling::Fifo => per.idle.pop_front(),
                Scheduling::Lifo => per.idle.pop_back(),
            }?;
            if sender_is_closed(&mut idle.conn.sender) {
                trace!("dropping closed idle connection to {origin}");
                continue;
            }
            if idle.since.elapsed() > self.inner.opts.keep_alive_timeout {
                trace!("dropping expired idle connection to {origin}");
                continue;
            }
            return Some(idle.conn);
        }
    }

    /// Accounts a new connection against the per-origin and global caps,
    /// waiting for capacity when a cap is reached.
    async fn billing(
        &self,
        origin: &Origin,
        signal: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> crate::Result<Permits> {
        let per_origin = {
            let mut pools = self.inner.pools.lock().expect("h1 pool poisoned");
            let per = pools
                .entry(origin.clone())
                .or_insert_with(|| PerOrigin::new(self.inner.opts.max_sockets));
            per.limit.clone()
        };

        let acquire = async {
            let per_origin = match per_origin {
                Some(sem) => Some(
                    sem.acquire_owned()
                        .await
                        .map_err(|_| Error::abort())?,
                ),
                None => None,
            };
            let total = match &self.inner.total {
                Some(sem) => Some(
                    sem.clone()
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::abort())?,
                ),
                None => None,
            };
            Ok(Permits {
                _per_origin: per_origin,
                _total: total,
            })
        };

        tokio::select! {
            _ = signal.cancelled() => Err(Error::abort()),
            _ = shutdown.cancelled() => Err(Error::abort()),
            permits = acquire => permits,
        }
    }

    async fn handshake(
        &self,
        origin: &Origin,
        io: MaybeTls,
        permits: Permits,
    ) -> crate::Result<PooledConn> {
        let (sender, connection) = conn::Builder::new()
            .handshake::<MaybeTls, hyper::Body>(io)
            .await
            .map_err(Error::connect)?;

        let log_origin = origin.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("http/1 connection to {log_origin} ended with error: {e}");
            }
        });

        trace!("opened http/1 connection to {origin}");
        Ok(PooledConn {
            sender,
            origin: origin.clone(),
            pool: Arc::downgrade(&self.inner),
            _permits: permits,
        })
    }

    /// Closes every idle connection. Checked-out connections die when
    /// their in-flight request observes the shutdown token.
    pub(crate) fn reset(&self) {
        let mut pools = self.inner.pools.lock().expect("h1 pool poisoned");
        for (origin, per) in pools.iter() {
            if !per.idle.is_empty() {
                trace!("closing {} idle connection(s) to {origin}", per.idle.len());
            }
        }
        pools.clear();
    }
}

impl PerOrigin {
    fn new(max_sockets: Option<usize>) -> PerOrigin {
        PerOrigin {
            idle: VecDeque::new(),
            limit: max_sockets.map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }
}

impl PooledConn {
    /// Parks the connection for reuse. Called when a response body reaches
    /// EOF with the connection still healthy; any other path drops the
    /// connection instead.
    pub(crate) fn release(mut self) {
        let pool = match self.pool.upgrade() {
            Some(pool) => pool,
            None => return,
        };
        if !pool.opts.keep_alive || sender_is_closed(&mut self.sender) {
            return;
        }

        let mut pools = pool.pools.lock().expect("h1 pool poisoned");
        let per = match pools.get_mut(&self.origin) {
            Some(per) => per,
            // The pool was reset while this request was in flight.
            None => return,
        };
        if per.idle.len() >= pool.opts.max_free_sockets {
            trace!("idle pool for {} full, closing connection", self.origin);
            return;
        }
        per.idle.push_back(Idle {
            conn: self,
            since: Instant::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let opts = Http1Options::default();
        assert!(opts.keep_alive);
        assert_eq!(opts.keep_alive_timeout, Duration::from_millis(1_000));
        assert_eq!(opts.max_sockets, None);
        assert_eq!(opts.max_total_sockets, None);
        assert_eq!(opts.max_free_sockets, 256);
        assert_eq!(opts.socket_timeout, None);
        assert_eq!(opts.scheduling, Scheduling::Fifo);
    }

    #[test]
    fn option_setters_chain() {
        let opts = Http1Options::new()
            .keep_alive(false)
            .max_sockets(4)
            .max_total_sockets(16)
            .max_free_sockets(2)
            .socket_timeout(Duration::from_secs(5))
            .scheduling(Scheduling::Lifo);
        assert!(!opts.keep_alive);
        assert_eq!(opts.max_sockets, Some(4));
        assert_eq!(opts.max_total_sockets, Some(16));
        assert_eq!(opts.max_free_sockets, 2);
        assert_eq!(opts.socket_timeout, Some(Duration::from_secs(5)));
        assert_eq!(opts.scheduling, Scheduling::Lifo);
    }
}
