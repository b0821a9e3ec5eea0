use std::fmt;

use bytes::{Bytes, BytesMut};
use encoding_rs::{Encoding, UTF_8};
use futures_util::StreamExt;
use http::{header::CONTENT_LENGTH, HeaderMap, StatusCode, Version};
use mime::Mime;
use serde::de::DeserializeOwned;
use url::Url;

use crate::{
    body::ResponseBody,
    decoder::{Accepts, Decoder},
    Error,
};

/// A Response to a submitted `Request`.
pub struct Response {
    res: http::Response<Decoder>,
    url: Url,
}

impl Response {
    pub(crate) fn new(res: http::Response<ResponseBody>, url: Url, accepts: Accepts) -> Response {
        let (mut parts, body) = res.into_parts();
        let decoder = Decoder::detect(&mut parts.headers, body, accepts, parts.status);
        Response {
            res: http::Response::from_parts(parts, decoder),
            url,
        }
    }

    /// Get the final `Url` of this `Response`.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the `StatusCode` of this `Response`.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.res.status()
    }

    /// Whether the status is in the 200-299 range.
    #[inline]
    pub fn ok(&self) -> bool {
        self.res.status().is_success()
    }

    /// Get the HTTP `Version` that carried this `Response`.
    ///
    /// HTTP/2 responses carry no status line text, so only the version
    /// itself is reported.
    #[inline]
    pub fn version(&self) -> Version {
        self.res.version()
    }

    /// Get the `Headers` of this `Response`.
    ///
    /// Header names are lowercase. When a body was transparently
    /// decompressed, `content-encoding` and `content-length` have been
    /// removed since they no longer describe the delivered bytes.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        self.res.headers()
    }

    /// Get a mutable reference to the `Headers` of this `Response`.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.res.headers_mut()
    }

    /// Get the content length of the response, if it is known.
    ///
    /// Reasons it may not be known:
    ///
    /// - The response did not carry a `content-length` header.
    /// - The response was compressed and automatically decoded (thus
    ///   changing the actual decoded length).
    pub fn content_length(&self) -> Option<u64> {
        self.res
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|len| len.to_str().ok())
            .and_then(|len| len.trim().parse().ok())
    }

    // body methods

    /// Get the full response text.
    ///
    /// Encoding is determined from the `charset` parameter of the
    /// `Content-Type` header, and defaults to `utf-8` if not presented.
    pub async fn text(self) -> crate::Result<String> {
        let content_type = self
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<Mime>().ok());
        let encoding_name = content_type
            .as_ref()
            .and_then(|mime| mime.get_param("charset").map(|charset| charset.as_str()))
            .unwrap_or("utf-8");
        let encoding = Encoding::for_label(encoding_name.as_bytes()).unwrap_or(UTF_8);

        let full = self.bytes().await?;

        let (text, _, _) = encoding.decode(&full);
        Ok(text.into_owned())
    }

    /// Try to deserialize the response body as JSON.
    ///
    /// # Errors
    ///
    /// This method fails whenever the response body is not in JSON format
    /// or it cannot be properly deserialized to the target type `T`.
    pub async fn json<T: DeserializeOwned>(self) -> crate::Result<T> {
        let full = self.bytes().await?;

        serde_json::from_slice(&full).map_err(Error::decode)
    }

    /// Get the full response body as `Bytes`.
    ///
    /// # Example
    ///
    /// ```
    /// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
    /// let bytes = polyglot_fetch::fetch("http://httpbin.org/ip").send().await?.bytes().await?;
    ///
    /// println!("bytes: {bytes:?}");
    /// # Ok(())
    /// # }
    /// ```
    pub async fn bytes(self) -> crate::Result<Bytes> {
        let mut body = self.res.into_body();
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Stream a chunk of the response body.
    ///
    /// When the response body has been exhausted, this will return `None`.
    pub async fn chunk(&mut self) -> crate::Result<Option<Bytes>> {
        self.res.body_mut().next().await.transpose()
    }

    /// Convert the response into a `Stream` of `Bytes` from the body.
    ///
    /// # Example
    ///
    /// ```
    /// use futures_util::StreamExt;
    ///
    /// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut stream = polyglot_fetch::fetch("http://httpbin.org/ip")
    ///     .send()
    ///     .await?
    ///     .bytes_stream();
    ///
    /// while let Some(item) = stream.next().await {
    ///     println!("Chunk: {:?}", item?);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn bytes_stream(self) -> impl futures_core::Stream<Item = crate::Result<Bytes>> {
        self.res.into_body()
    }

    // util methods

    /// Turn a response into an error if the server returned an error.
    ///
    /// # Example
    ///
    /// ```
    /// # use polyglot_fetch::Response;
    /// fn on_response(res: Response) {
    ///     match res.error_for_status() {
    ///         Ok(_res) => (),
    ///         Err(err) => {
    ///             // asserting a 400 as an example
    ///             // it could be any status between 400...599
    ///             assert_eq!(err.status(), Some(polyglot_fetch::StatusCode::BAD_REQUEST));
    ///         }
    ///     }
    /// }
    /// # fn main() {}
    /// ```
    pub fn error_for_status(self) -> crate::Result<Self> {
        let status = self.status();
        if status.is_client_error() || status.is_server_error() {
            Err(Error::status_code(self.url, status))
        } else {
            Ok(self)
        }
    }

    /// Turn a reference to a response into an error if the server
    /// returned an error.
    pub fn error_for_status_ref(&self) -> crate::Result<&Self> {
        let status = self.status();
        if status.is_client_error() || status.is_server_error() {
            Err(Error::status_code(self.url.clone(), status))
        } else {
            Ok(self)
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url.as_str())
            .field("status", &self.status())
            .field("headers", self.headers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::ResponseBody;

    fn response(status: StatusCode, headers: &[(&str, &str)]) -> Response {
        let mut builder = http::Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let res = builder.body(ResponseBody::empty()).unwrap();
        Response::new(
            res,
            Url::parse("http://example.com/").unwrap(),
            Accepts::default(),
        )
    }

    #[test]
    fn ok_tracks_status() {
        assert!(response(StatusCode::NO_CONTENT, &[]).ok());
        assert!(!response(StatusCode::NOT_FOUND, &[]).ok());
    }

    #[test]
    fn content_length_from_header() {
        let res = response(StatusCode::OK, &[("content-length", "42")]);
        assert_eq!(res.content_length(), Some(42));

        // Decoding strips the length, so it reads as unknown.
        let res = response(
            StatusCode::OK,
            &[("content-length", "42"), ("content-encoding", "gzip")],
        );
        assert_eq!(res.content_length(), None);
    }

    #[test]
    fn error_for_status_maps_4xx_and_5xx() {
        let err = response(StatusCode::BAD_REQUEST, &[])
            .error_for_status()
            .unwrap_err();
        assert!(err.is_status());
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));

        assert!(response(StatusCode::OK, &[]).error_for_status().is_ok());
    }

    #[tokio::test]
    async fn empty_body_collects_empty() {
        let bytes = response(StatusCode::NO_CONTENT, &[]).bytes().await.unwrap();
        assert!(bytes.is_empty());
    }
}
