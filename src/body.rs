use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_core::Stream;
use http_body::Body as HttpBody;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::{
    error::{BoxError, Error},
    h1::PooledConn,
    h2::ActiveGuard,
};

pub(crate) type BoxStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send + Sync>>;

/// A request body.
pub struct Body {
    inner: Inner,
    text: bool,
}

enum Inner {
    Reusable(Bytes),
    Streaming(BoxStream),
}

/// The raw shape a transport writes to the wire.
pub(crate) enum BodyKind {
    Buf(Bytes),
    Stream(BoxStream),
}

// ===== impl Body =====

impl Body {
    /// Returns a reference to the internal data of the `Body`.
    ///
    /// `None` is returned, if the underlying data is a stream.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.inner {
            Inner::Reusable(bytes) => Some(bytes.as_ref()),
            Inner::Streaming(..) => None,
        }
    }

    /// Wrap a futures `Stream` in a box inside `Body`.
    ///
    /// A streaming body is sent as-is and cannot be replayed, so a
    /// redirect that would need to resend it fails (see the redirect
    /// rules on [`RequestBuilder`](crate::RequestBuilder)).
    ///
    /// # Example
    ///
    /// ```
    /// # use polyglot_fetch::Body;
    /// # fn main() {
    /// let chunks: Vec<Result<_, ::std::io::Error>> = vec![Ok("hello"), Ok(" "), Ok("world")];
    ///
    /// let stream = futures_util::stream::iter(chunks);
    ///
    /// let body = Body::wrap_stream(stream);
    /// # }
    /// ```
    pub fn wrap_stream<S>(stream: S) -> Body
    where
        S: futures_util::stream::TryStream + Send + Sync + 'static,
        S::Error: Into<BoxError>,
        Bytes: From<S::Ok>,
    {
        use futures_util::TryStreamExt;

        let stream: BoxStream = Box::pin(stream.map_ok(Bytes::from).map_err(Into::into));
        Body {
            inner: Inner::Streaming(stream),
            text: false,
        }
    }

    pub(crate) fn empty() -> Body {
        Body::reusable(Bytes::new())
    }

    pub(crate) fn reusable(chunk: Bytes) -> Body {
        Body {
            inner: Inner::Reusable(chunk),
            text: false,
        }
    }

    pub(crate) fn text(chunk: Bytes) -> Body {
        Body {
            inner: Inner::Reusable(chunk),
            text: true,
        }
    }

    /// True for bodies built from strings, which get an implicit
    /// `text/plain` content type during dispatch.
    pub(crate) fn is_text(&self) -> bool {
        self.text
    }

    pub(crate) fn is_stream(&self) -> bool {
        matches!(self.inner, Inner::Streaming(..))
    }

    pub(crate) fn try_clone(&self) -> Option<Body> {
        match self.inner {
            Inner::Reusable(ref chunk) => Some(Body {
                inner: Inner::Reusable(chunk.clone()),
                text: self.text,
            }),
            Inner::Streaming { .. } => None,
        }
    }

    /// Splits into the replayable bytes (if any) and the body itself, so
    /// the redirect loop can resend buffered bodies.
    pub(crate) fn try_reuse(self) -> (Option<Bytes>, Body) {
        let reusable = match self.inner {
            Inner::Reusable(ref chunk) => Some(chunk.clone()),
            Inner::Streaming { .. } => None,
        };
        (reusable, self)
    }

    pub(crate) fn content_length(&self) -> Option<u64> {
        match self.inner {
            Inner::Reusable(ref bytes) => Some(bytes.len() as u64),
            Inner::Streaming(..) => None,
        }
    }

    pub(crate) fn into_kind(self) -> BodyKind {
        match self.inner {
            Inner::Reusable(bytes) => BodyKind::Buf(bytes),
            Inner::Streaming(stream) => BodyKind::Stream(stream),
        }
    }

    pub(crate) fn into_hyper(self) -> hyper::Body {
        match self.inner {
            Inner::Reusable(bytes) if bytes.is_empty() => hyper::Body::empty(),
            Inner::Reusable(bytes) => hyper::Body::from(bytes),
            Inner::Streaming(stream) => hyper::Body::wrap_stream(stream),
        }
    }
}

impl Default for Body {
    #[inline]
    fn default() -> Body {
        Body::empty()
    }
}

impl From<Bytes> for Body {
    #[inline]
    fn from(bytes: Bytes) -> Body {
        Body::reusable(bytes)
    }
}

impl From<Vec<u8>> for Body {
    #[inline]
    fn from(vec: Vec<u8>) -> Body {
        Body::reusable(vec.into())
    }
}

impl From<&'static [u8]> for Body {
    #[inline]
    fn from(s: &'static [u8]) -> Body {
        Body::reusable(Bytes::from_static(s))
    }
}

impl From<String> for Body {
    #[inline]
    fn from(s: String) -> Body {
        Body::text(s.into())
    }
}

impl From<&'static str> for Body {
    #[inline]
    fn from(s: &'static str) -> Body {
        Body::text(Bytes::from_static(s.as_bytes()))
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Body").finish()
    }
}

// ===== ResponseBody =====

/// Shared slot a pushed stream waits in until it is consumed or evicted.
pub(crate) type PushedSlot = Arc<Mutex<Option<h2::RecvStream>>>;

enum RespKind {
    Empty,
    H1 {
        body: hyper::Body,
        pooled: Option<PooledConn>,
    },
    H2 {
        recv: Option<h2::RecvStream>,
        _active: Option<ActiveGuard>,
    },
    H2Pushed {
        recv: Option<h2::RecvStream>,
        slot: PushedSlot,
        taken: bool,
    },
}

/// The raw transport-level response body: a byte stream backed by either
/// an HTTP/1 connection (returned to its pool on clean EOF) or an HTTP/2
/// stream (flow-control capacity released as data is read).
///
/// Cancellation is observed while streaming: a fired abort signal or a
/// client reset fails the stream and tears the underlying connection or
/// stream down instead of letting it linger.
pub(crate) struct ResponseBody {
    kind: RespKind,
    cancel: Vec<Pin<Box<WaitForCancellationFutureOwned>>>,
}

impl ResponseBody {
    pub(crate) fn h1(
        body: hyper::Body,
        pooled: Option<PooledConn>,
        tokens: &[&CancellationToken],
    ) -> ResponseBody {
        ResponseBody {
            kind: RespKind::H1 { body, pooled },
            cancel: watch_tokens(tokens),
        }
    }

    pub(crate) fn h2(
        recv: h2::RecvStream,
        active: Option<ActiveGuard>,
        tokens: &[&CancellationToken],
    ) -> ResponseBody {
        ResponseBody {
            kind: RespKind::H2 {
                recv: Some(recv),
                _active: active,
            },
            cancel: watch_tokens(tokens),
        }
    }

    pub(crate) fn empty() -> ResponseBody {
        ResponseBody {
            kind: RespKind::Empty,
            cancel: Vec::new(),
        }
    }

    pub(crate) fn h2_pushed(slot: PushedSlot) -> ResponseBody {
        ResponseBody {
            kind: RespKind::H2Pushed {
                recv: None,
                slot,
                taken: false,
            },
            cancel: Vec::new(),
        }
    }

    /// Drops whatever keeps the connection or stream alive. An HTTP/1
    /// connection is destroyed rather than repooled; an HTTP/2 stream is
    /// reset by dropping its receive half.
    fn teardown(&mut self) {
        match &mut self.kind {
            RespKind::Empty => {}
            RespKind::H1 { pooled, .. } => {
                pooled.take();
            }
            RespKind::H2 { recv, .. } => {
                recv.take();
            }
            RespKind::H2Pushed { recv, .. } => {
                recv.take();
            }
        }
    }
}

fn watch_tokens(tokens: &[&CancellationToken]) -> Vec<Pin<Box<WaitForCancellationFutureOwned>>> {
    tokens
        .iter()
        .map(|t| Box::pin((*t).clone().cancelled_owned()))
        .collect()
}

impl Stream for ResponseBody {
    type Item = crate::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        let mut cancelled = false;
        for cancel in &mut this.cancel {
            if cancel.as_mut().poll(cx).is_ready() {
                cancelled = true;
                break;
            }
        }
        if cancelled {
            this.cancel.clear();
            this.teardown();
            return Poll::Ready(Some(Err(Error::abort())));
        }

        match &mut this.kind {
            RespKind::Empty => Poll::Ready(None),
            RespKind::H1 { body, pooled } => match futures_core::ready!(
                Pin::new(body).poll_data(cx)
            ) {
                Some(Ok(chunk)) => Poll::Ready(Some(Ok(chunk))),
                Some(Err(e)) => {
                    pooled.take();
                    Poll::Ready(Some(Err(Error::body(e))))
                }
                None => {
                    if let Some(conn) = pooled.take() {
                        conn.release();
                    }
                    Poll::Ready(None)
                }
            },
            RespKind::H2 { recv, .. } => poll_recv(recv, cx),
            RespKind::H2Pushed { recv, slot, taken } => {
                if !*taken {
                    *taken = true;
                    *recv = slot.lock().expect("pushed stream slot poisoned").take();
                    if recv.is_none() {
                        // The idle watchdog already cancelled the stream.
                        return Poll::Ready(Some(Err(Error::abort())));
                    }
                }
                poll_recv(recv, cx)
            }
        }
    }
}

fn poll_recv(
    recv: &mut Option<h2::RecvStream>,
    cx: &mut Context<'_>,
) -> Poll<Option<crate::Result<Bytes>>> {
    let stream = match recv {
        Some(stream) => stream,
        // Torn down by cancellation; the error was already yielded.
        None => return Poll::Ready(None),
    };
    match futures_core::ready!(stream.poll_data(cx)) {
        Some(Ok(chunk)) => {
            let _ = stream.flow_control().release_capacity(chunk.len());
            Poll::Ready(Some(Ok(chunk)))
        }
        Some(Err(e)) => {
            recv.take();
            Poll::Ready(Some(Err(Error::body(e))))
        }
        None => Poll::Ready(None),
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            RespKind::Empty => "empty",
            RespKind::H1 { .. } => "h1",
            RespKind::H2 { .. } => "h2",
            RespKind::H2Pushed { .. } => "h2-pushed",
        };
        f.debug_struct("ResponseBody").field("kind", &kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Body;

    #[test]
    fn test_as_bytes() {
        let test_data = b"Test body";
        let body = Body::from(&test_data[..]);
        assert_eq!(body.as_bytes(), Some(&test_data[..]));
    }

    #[test]
    fn string_bodies_are_textual() {
        assert!(Body::from("hello").is_text());
        assert!(Body::from(String::from("hello")).is_text());
        assert!(!Body::from(b"hello".to_vec()).is_text());
    }

    #[test]
    fn stream_bodies_cannot_be_replayed() {
        let stream =
            futures_util::stream::iter(vec![Ok::<_, std::io::Error>("hello"), Ok(" world")]);
        let body = Body::wrap_stream(stream);
        assert!(body.is_stream());
        assert!(body.try_clone().is_none());
        assert_eq!(body.content_length(), None);

        let (reusable, _body) = body.try_reuse();
        assert!(reusable.is_none());
    }

    #[test]
    fn buffered_bodies_replay() {
        let body = Body::from("abc");
        let clone = body.try_clone().expect("buffered body clones");
        assert_eq!(clone.as_bytes(), body.as_bytes());
        assert_eq!(body.content_length(), Some(3));
    }
}
