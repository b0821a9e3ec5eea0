use std::{convert::TryFrom, fmt};

use http::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Method,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{body::Body, client::Client, redirect::RedirectMode, response::Response, Error};

/// A request which can be executed with `Client::execute()`.
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Body>,
    redirect: RedirectMode,
    follow: u32,
    compress: bool,
    signal: Option<CancellationToken>,
}

/// A builder to construct the properties of a `Request`.
///
/// To construct a `RequestBuilder`, refer to the `Client` documentation.
#[must_use = "RequestBuilder does nothing until you 'send' it"]
pub struct RequestBuilder {
    client: Client,
    request: crate::Result<Request>,
}

impl Request {
    /// Constructs a new request.
    #[inline]
    pub fn new(method: Method, url: Url) -> Self {
        Request {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            redirect: RedirectMode::default(),
            follow: 20,
            compress: true,
            signal: None,
        }
    }

    /// Get the method.
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Get a mutable reference to the method.
    #[inline]
    pub fn method_mut(&mut self) -> &mut Method {
        &mut self.method
    }

    /// Get the url.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get a mutable reference to the url.
    #[inline]
    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    /// Get the headers.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the headers.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get the body.
    #[inline]
    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Get a mutable reference to the body.
    #[inline]
    pub fn body_mut(&mut self) -> &mut Option<Body> {
        &mut self.body
    }

    /// Get the redirect mode.
    #[inline]
    pub fn redirect(&self) -> RedirectMode {
        self.redirect
    }

    /// Get the redirect hop limit.
    #[inline]
    pub fn follow(&self) -> u32 {
        self.follow
    }

    /// Whether transparent decompression is requested.
    #[inline]
    pub fn compress(&self) -> bool {
        self.compress
    }

    /// Get the abort signal, if one was attached.
    #[inline]
    pub fn signal(&self) -> Option<&CancellationToken> {
        self.signal.as_ref()
    }

    /// Attempt to clone the request.
    ///
    /// `None` is returned if the request can not be cloned, i.e. if the
    /// body is a stream.
    pub fn try_clone(&self) -> Option<Request> {
        let body = match self.body() {
            Some(body) => Some(body.try_clone()?),
            None => None,
        };
        let mut req = Request::new(self.method().clone(), self.url().clone());
        *req.headers_mut() = self.headers().clone();
        req.body = body;
        req.redirect = self.redirect;
        req.follow = self.follow;
        req.compress = self.compress;
        req.signal = self.signal.clone();
        Some(req)
    }

    #[allow(clippy::type_complexity)]
    pub(crate) fn pieces(
        self,
    ) -> (
        Method,
        Url,
        HeaderMap,
        Option<Body>,
        RedirectMode,
        u32,
        bool,
        Option<CancellationToken>,
    ) {
        (
            self.method,
            self.url,
            self.headers,
            self.body,
            self.redirect,
            self.follow,
            self.compress,
            self.signal,
        )
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .finish()
    }
}

impl RequestBuilder {
    pub(crate) fn new(client: Client, request: crate::Result<Request>) -> RequestBuilder {
        RequestBuilder { client, request }
    }

    /// Add a `Header` to this Request.
    ///
    /// If the header is already present, the value will be replaced.
    pub fn header<K, V>(mut self, key: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match <HeaderName as TryFrom<K>>::try_from(key) {
                Ok(key) => match <HeaderValue as TryFrom<V>>::try_from(value) {
                    Ok(value) => {
                        req.headers_mut().insert(key, value);
                    }
                    Err(e) => error = Some(Error::builder(e.into())),
                },
                Err(e) => error = Some(Error::builder(e.into())),
            };
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Add a set of Headers to the existing ones on this Request.
    ///
    /// The headers will be merged in to any already set.
    pub fn headers(mut self, headers: HeaderMap) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            // The first value of each name replaces, the rest append.
            let mut prev_name = None;
            for (key, value) in headers {
                match key {
                    Some(key) => {
                        req.headers_mut().insert(key.clone(), value);
                        prev_name = Some(key);
                    }
                    None => {
                        if let Some(ref key) = prev_name {
                            req.headers_mut().append(key.clone(), value);
                        }
                    }
                }
            }
        }
        self
    }

    /// Set the request body.
    pub fn body<T: Into<Body>>(mut self, body: T) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.body_mut() = Some(body.into());
        }
        self
    }

    /// Send a form body.
    ///
    /// Sets the body to the url-encoded serialization of the passed value,
    /// and the `content-type` header to
    /// `application/x-www-form-urlencoded;charset=UTF-8` unless one is
    /// already set.
    ///
    /// ```rust
    /// # use polyglot_fetch::Error;
    /// #
    /// # async fn run() -> Result<(), Error> {
    /// let params = [("lang", "rust"), ("body", "form")];
    /// let client = polyglot_fetch::Client::new();
    /// let res = client
    ///     .fetch("http://httpbin.org/post")
    ///     .method(polyglot_fetch::Method::POST)
    ///     .form(&params)
    ///     .send()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn form<T: Serialize + ?Sized>(mut self, form: &T) -> RequestBuilder {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match serde_urlencoded::to_string(form) {
                Ok(body) => {
                    if !req.headers().contains_key(CONTENT_TYPE) {
                        req.headers_mut().insert(
                            CONTENT_TYPE,
                            HeaderValue::from_static(
                                "application/x-www-form-urlencoded;charset=UTF-8",
                            ),
                        );
                    }
                    *req.body_mut() = Some(Body::reusable(body.into()));
                }
                Err(err) => error = Some(Error::builder(err)),
            }
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Send a JSON body.
    ///
    /// Sets the body to the JSON serialization of the passed value, and
    /// the `content-type` header to `application/json` unless one is
    /// already set.
    pub fn json<T: Serialize + ?Sized>(mut self, json: &T) -> RequestBuilder {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match serde_json::to_vec(json) {
                Ok(body) => {
                    if !req.headers().contains_key(CONTENT_TYPE) {
                        req.headers_mut()
                            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                    }
                    *req.body_mut() = Some(Body::reusable(body.into()));
                }
                Err(err) => error = Some(Error::builder(err)),
            }
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Set the request method. The method is uppercased during dispatch.
    pub fn method(mut self, method: Method) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.method_mut() = method;
        }
        self
    }

    /// Set how 3xx responses are handled. Default is
    /// [`RedirectMode::Follow`].
    pub fn redirect(mut self, mode: RedirectMode) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.redirect = mode;
        }
        self
    }

    /// Set the maximum number of redirect hops to follow. Default is 20;
    /// 0 disallows any redirect.
    pub fn follow(mut self, follow: u32) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.follow = follow;
        }
        self
    }

    /// Enable or disable transparent response decompression for this
    /// request. Default is enabled.
    pub fn compress(mut self, compress: bool) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.compress = compress;
        }
        self
    }

    /// Attach an abort signal. Cancelling the token aborts the request:
    /// in-flight transfers are torn down and the request fails with an
    /// abort error.
    pub fn signal(mut self, signal: CancellationToken) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.signal = Some(signal);
        }
        self
    }

    /// Build a `Request`, which can be inspected, modified and executed
    /// with `Client::execute()`.
    pub fn build(self) -> crate::Result<Request> {
        self.request
    }

    /// Constructs the `Request` and sends it to the target URL, returning
    /// a future `Response`.
    ///
    /// # Errors
    ///
    /// This method fails if there was an error while sending request,
    /// or a redirect limit was exhausted.
    pub async fn send(self) -> crate::Result<Response> {
        match self.request {
            Ok(req) => self.client.execute(req).await,
            Err(err) => Err(err),
        }
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("RequestBuilder");
        match self.request {
            Ok(ref req) => builder
                .field("method", req.method())
                .field("url", &req.url().as_str())
                .finish(),
            Err(ref err) => builder.field("error", err).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Client;

    fn builder(url: &str) -> RequestBuilder {
        Client::new().fetch(url)
    }

    #[test]
    fn defaults() {
        let req = builder("http://example.com/").build().unwrap();
        assert_eq!(req.method(), &Method::GET);
        assert_eq!(req.redirect(), RedirectMode::Follow);
        assert_eq!(req.follow(), 20);
        assert!(req.compress());
        assert!(req.body().is_none());
        assert!(req.signal().is_none());
    }

    #[test]
    fn form_sets_body_and_content_type() {
        let req = builder("http://example.com/")
            .method(Method::POST)
            .form(&[("foo", "bar"), ("baz", "quux")])
            .build()
            .unwrap();
        assert_eq!(
            req.headers().get(CONTENT_TYPE).unwrap(),
            "application/x-www-form-urlencoded;charset=UTF-8"
        );
        assert_eq!(
            req.body().unwrap().as_bytes(),
            Some(&b"foo=bar&baz=quux"[..])
        );
    }

    #[test]
    fn json_respects_existing_content_type() {
        let req = builder("http://example.com/")
            .header(CONTENT_TYPE, "application/vnd.custom+json")
            .json(&serde_json::json!({ "foo": "bar" }))
            .build()
            .unwrap();
        assert_eq!(
            req.headers().get(CONTENT_TYPE).unwrap(),
            "application/vnd.custom+json"
        );
    }

    #[test]
    fn invalid_header_surfaces_at_build() {
        let err = builder("http://example.com/")
            .header("bad name", "x")
            .build()
            .unwrap_err();
        assert!(err.is_builder());
    }

    #[test]
    fn try_clone_copies_options() {
        let signal = CancellationToken::new();
        let req = builder("http://example.com/")
            .method(Method::POST)
            .body("payload")
            .follow(3)
            .compress(false)
            .redirect(RedirectMode::Manual)
            .signal(signal)
            .build()
            .unwrap();

        let clone = req.try_clone().unwrap();
        assert_eq!(clone.method(), &Method::POST);
        assert_eq!(clone.follow(), 3);
        assert!(!clone.compress());
        assert_eq!(clone.redirect(), RedirectMode::Manual);
        assert!(clone.signal().is_some());
        assert_eq!(clone.body().unwrap().as_bytes(), Some(&b"payload"[..]));
    }
}
