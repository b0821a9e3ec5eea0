//! Transparent response body decompression.

use std::{
    fmt,
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use async_compression::tokio::bufread::{BrotliDecoder, GzipDecoder, ZlibDecoder};
use bytes::Bytes;
use futures_core::Stream;
use futures_util::{stream::Peekable, StreamExt};
use http::{
    header::{CONTENT_ENCODING, CONTENT_LENGTH},
    HeaderMap, StatusCode,
};
use log::warn;
use tokio_util::{
    codec::{BytesCodec, FramedRead},
    io::StreamReader,
};

use crate::{body::ResponseBody, error::Error};

/// Which content codings the client advertises and decodes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Accepts {
    pub(crate) gzip: bool,
    pub(crate) deflate: bool,
    pub(crate) brotli: bool,
}

impl Accepts {
    pub(crate) fn none() -> Accepts {
        Accepts {
            gzip: false,
            deflate: false,
            brotli: false,
        }
    }

    /// The `accept-encoding` value matching the enabled codings.
    pub(crate) fn as_str(&self) -> Option<&'static str> {
        match (self.gzip, self.deflate, self.brotli) {
            (true, true, true) => Some("gzip,deflate,br"),
            (true, true, false) => Some("gzip,deflate"),
            (true, false, true) => Some("gzip,br"),
            (true, false, false) => Some("gzip"),
            (false, true, true) => Some("deflate,br"),
            (false, true, false) => Some("deflate"),
            (false, false, true) => Some("br"),
            (false, false, false) => None,
        }
    }
}

impl Default for Accepts {
    fn default() -> Accepts {
        Accepts {
            gzip: true,
            deflate: true,
            brotli: true,
        }
    }
}

/// A response body stream, decompressed on the fly when the response's
/// `content-encoding` calls for it.
pub struct Decoder {
    inner: Inner,
}

type PeekableIoStream = Peekable<IoStream>;

enum Inner {
    /// A response body passed through untouched.
    PlainText(ResponseBody),
    /// A gzip-encoded body being inflated.
    Gzip(Pin<Box<FramedRead<GzipDecoder<StreamReader<PeekableIoStream, Bytes>>, BytesCodec>>>),
    /// A brotli-encoded body being inflated.
    Brotli(Pin<Box<FramedRead<BrotliDecoder<StreamReader<PeekableIoStream, Bytes>>, BytesCodec>>>),
    /// A deflate-encoded body being inflated.
    Deflate(Pin<Box<FramedRead<ZlibDecoder<StreamReader<PeekableIoStream, Bytes>>, BytesCodec>>>),
    /// A decoder selected, waiting for the first bytes to arrive so an
    /// empty body does not wedge the decompressor.
    Pending(Pin<Box<Pending>>),
}

#[derive(Clone, Copy, Debug)]
enum DecoderType {
    Gzip,
    Brotli,
    Deflate,
}

struct Pending(PeekableIoStream, DecoderType);

struct IoStream(ResponseBody);

impl Decoder {
    fn plain_text(body: ResponseBody) -> Decoder {
        Decoder {
            inner: Inner::PlainText(body),
        }
    }

    fn pending(body: ResponseBody, decoder: DecoderType) -> Decoder {
        Decoder {
            inner: Inner::Pending(Box::pin(Pending(IoStream(body).peekable(), decoder))),
        }
    }

    /// Wraps `body` with the decoder selected by the response headers.
    ///
    /// The body is passed through unchanged when the status cannot carry a
    /// body (204, 304), when `content-length` is 0, or when
    /// `content-encoding` is absent, unrecognized, or not accepted. When a
    /// decoder engages, the `content-encoding` and `content-length`
    /// headers no longer describe the bytes the caller will see and are
    /// removed.
    pub(crate) fn detect(
        headers: &mut HeaderMap,
        body: ResponseBody,
        accepts: Accepts,
        status: StatusCode,
    ) -> Decoder {
        if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
            return Decoder::plain_text(body);
        }

        if headers
            .get(CONTENT_LENGTH)
            .and_then(|len| len.to_str().ok())
            .map(|len| len.trim() == "0")
            .unwrap_or(false)
        {
            return Decoder::plain_text(body);
        }

        let decoder = headers
            .get(CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .and_then(|coding| match coding.trim().to_ascii_lowercase().as_str() {
                "gzip" | "x-gzip" if accepts.gzip => Some(DecoderType::Gzip),
                "deflate" | "x-deflate" if accepts.deflate => Some(DecoderType::Deflate),
                "br" if accepts.brotli => Some(DecoderType::Brotli),
                _ => None,
            });

        match decoder {
            Some(decoder) => {
                headers.remove(CONTENT_ENCODING);
                headers.remove(CONTENT_LENGTH);
                Decoder::pending(body, decoder)
            }
            None => Decoder::plain_text(body),
        }
    }
}

impl Stream for Decoder {
    type Item = crate::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // Do a read or poll for a pending decoder value.
        match self.inner {
            Inner::Pending(ref mut future) => match futures_core::ready!(future.as_mut().poll(cx))
            {
                Ok(inner) => {
                    self.inner = inner;
                    self.poll_next(cx)
                }
                Err(e) => {
                    let err = Error::decode_io(e);
                    warn!("response decode failed: {err}");
                    Poll::Ready(Some(Err(err)))
                }
            },
            Inner::PlainText(ref mut body) => Pin::new(body).poll_next(cx),
            Inner::Gzip(ref mut decoder) => match futures_core::ready!(decoder.as_mut().poll_next(cx)) {
                Some(Ok(bytes)) => Poll::Ready(Some(Ok(bytes.freeze()))),
                Some(Err(e)) => {
                    let err = Error::decode_io(e);
                    warn!("gzip decode failed: {err}");
                    Poll::Ready(Some(Err(err)))
                }
                None => Poll::Ready(None),
            },
            Inner::Brotli(ref mut decoder) => match futures_core::ready!(decoder.as_mut().poll_next(cx)) {
                Some(Ok(bytes)) => Poll::Ready(Some(Ok(bytes.freeze()))),
                Some(Err(e)) => {
                    let err = Error::decode_io(e);
                    warn!("brotli decode failed: {err}");
                    Poll::Ready(Some(Err(err)))
                }
                None => Poll::Ready(None),
            },
            Inner::Deflate(ref mut decoder) => match futures_core::ready!(decoder.as_mut().poll_next(cx)) {
                Some(Ok(bytes)) => Poll::Ready(Some(Ok(bytes.freeze()))),
                Some(Err(e)) => {
                    let err = Error::decode_io(e);
                    warn!("deflate decode failed: {err}");
                    Poll::Ready(Some(Err(err)))
                }
                None => Poll::Ready(None),
            },
        }
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let coding = match self.inner {
            Inner::PlainText(..) => "identity",
            Inner::Gzip(..) => "gzip",
            Inner::Brotli(..) => "br",
            Inner::Deflate(..) => "deflate",
            Inner::Pending(..) => "pending",
        };
        f.debug_struct("Decoder").field("coding", &coding).finish()
    }
}

impl Future for Pending {
    type Output = Result<Inner, io::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match futures_core::ready!(Pin::new(&mut self.0).poll_peek(cx)) {
            Some(Ok(_)) => {
                // fall through
            }
            Some(Err(_)) => {
                // The error is pulled out of the stream below.
                return match futures_core::ready!(Pin::new(&mut self.0).poll_next(cx)) {
                    Some(Err(e)) => Poll::Ready(Err(e)),
                    None | Some(Ok(_)) => unreachable!("peek saw an error"),
                };
            }
            None => {
                // An empty compressed body decodes to an empty body.
                return Poll::Ready(Ok(Inner::PlainText(ResponseBody::empty())));
            }
        };

        let body = std::mem::replace(
            &mut self.0,
            IoStream(ResponseBody::empty()).peekable(),
        );

        let inner = match self.1 {
            DecoderType::Gzip => Inner::Gzip(Box::pin(FramedRead::new(
                GzipDecoder::new(StreamReader::new(body)),
                BytesCodec::new(),
            ))),
            DecoderType::Brotli => Inner::Brotli(Box::pin(FramedRead::new(
                BrotliDecoder::new(StreamReader::new(body)),
                BytesCodec::new(),
            ))),
            DecoderType::Deflate => Inner::Deflate(Box::pin(FramedRead::new(
                ZlibDecoder::new(StreamReader::new(body)),
                BytesCodec::new(),
            ))),
        };

        Poll::Ready(Ok(inner))
    }
}

impl Stream for IoStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match futures_core::ready!(Pin::new(&mut self.0).poll_next(cx)) {
            Some(Ok(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Some(Err(err)) => Poll::Ready(Some(Err(err.into_io()))),
            None => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    fn coding(decoder: &Decoder) -> &'static str {
        match decoder.inner {
            Inner::PlainText(..) => "identity",
            Inner::Pending(ref pending) => match pending.1 {
                DecoderType::Gzip => "gzip",
                DecoderType::Brotli => "br",
                DecoderType::Deflate => "deflate",
            },
            _ => "started",
        }
    }

    #[test]
    fn detects_gzip_aliases() {
        for value in ["gzip", "x-gzip", "GZIP"] {
            let mut h = headers(&[("content-encoding", value)]);
            let decoder = Decoder::detect(
                &mut h,
                ResponseBody::empty(),
                Accepts::default(),
                StatusCode::OK,
            );
            assert_eq!(coding(&decoder), "gzip");
            assert!(h.get(CONTENT_ENCODING).is_none());
        }
    }

    #[test]
    fn detects_deflate_and_brotli() {
        let mut h = headers(&[("content-encoding", "x-deflate")]);
        let decoder = Decoder::detect(
            &mut h,
            ResponseBody::empty(),
            Accepts::default(),
            StatusCode::OK,
        );
        assert_eq!(coding(&decoder), "deflate");

        let mut h = headers(&[("content-encoding", "br")]);
        let decoder = Decoder::detect(
            &mut h,
            ResponseBody::empty(),
            Accepts::default(),
            StatusCode::OK,
        );
        assert_eq!(coding(&decoder), "br");
    }

    #[test]
    fn passthrough_when_no_body_possible() {
        for status in [StatusCode::NO_CONTENT, StatusCode::NOT_MODIFIED] {
            let mut h = headers(&[("content-encoding", "gzip")]);
            let decoder =
                Decoder::detect(&mut h, ResponseBody::empty(), Accepts::default(), status);
            assert_eq!(coding(&decoder), "identity");
            // Headers are left alone when nothing is decoded.
            assert!(h.get(CONTENT_ENCODING).is_some());
        }
    }

    #[test]
    fn passthrough_on_empty_or_unknown() {
        let mut h = headers(&[("content-encoding", "gzip"), ("content-length", "0")]);
        let decoder = Decoder::detect(
            &mut h,
            ResponseBody::empty(),
            Accepts::default(),
            StatusCode::OK,
        );
        assert_eq!(coding(&decoder), "identity");

        let mut h = headers(&[("content-encoding", "zstd")]);
        let decoder = Decoder::detect(
            &mut h,
            ResponseBody::empty(),
            Accepts::default(),
            StatusCode::OK,
        );
        assert_eq!(coding(&decoder), "identity");

        let mut h = headers(&[("content-encoding", "gzip")]);
        let decoder =
            Decoder::detect(&mut h, ResponseBody::empty(), Accepts::none(), StatusCode::OK);
        assert_eq!(coding(&decoder), "identity");
    }

    #[test]
    fn accept_encoding_value() {
        assert_eq!(Accepts::default().as_str(), Some("gzip,deflate,br"));
        assert_eq!(Accepts::none().as_str(), None);
        assert_eq!(
            Accepts {
                gzip: true,
                deflate: false,
                brotli: false
            }
            .as_str(),
            Some("gzip")
        );
    }
}
