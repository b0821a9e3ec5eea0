#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(warnings))]

//! # polyglot-fetch
//!
//! A transparent HTTP client: issue a logical request and let the client
//! pick the wire protocol. Per origin it negotiates HTTP/2, HTTP/1.1 or
//! HTTP/1.0 via ALPN, caches the outcome, and reuses persistent
//! connections — a keep-alive pool for HTTP/1.x and one multiplexed
//! session per origin for HTTP/2.
//!
//! - Protocol negotiation with a bounded, TTL'd ALPN cache
//! - Connection reuse: HTTP/1 pooling, HTTP/2 session caching
//! - Server push handling with per-stream idle eviction
//! - Streaming bodies with transparent gzip/deflate/brotli decoding
//! - Fetch-style redirects (`follow` / `manual` / `error`)
//! - Cancellation via abort signals, down to the body stream
//!
//! ## Making a GET request
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), polyglot_fetch::Error> {
//! let body = polyglot_fetch::fetch("https://www.rust-lang.org")
//!     .send()
//!     .await?
//!     .text()
//!     .await?;
//!
//! println!("body = {body:?}");
//! # Ok(())
//! # }
//! ```
//!
//! **NOTE**: If you plan to perform multiple requests, it is best to
//! create a [`Client`] and reuse it, taking advantage of the connection
//! caches. The crate-level [`fetch`] uses a process-wide default client.
//!
//! ## Posting a body
//!
//! ```rust,no_run
//! # use polyglot_fetch::{Client, Method};
//! # async fn run() -> Result<(), polyglot_fetch::Error> {
//! let client = Client::new();
//! let res = client
//!     .fetch("http://httpbin.org/post")
//!     .method(Method::POST)
//!     .body("the exact body that is sent")
//!     .send()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Cleartext HTTP/2
//!
//! A `http2:` URL speaks HTTP/2 over plain TCP with prior knowledge:
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), polyglot_fetch::Error> {
//! let res = polyglot_fetch::fetch("http2://nghttp2.org/httpbin/status/204")
//!     .send()
//!     .await?;
//! assert_eq!(res.version(), polyglot_fetch::Version::HTTP_2);
//! # Ok(())
//! # }
//! ```
//!
//! ## Server push
//!
//! ```rust,no_run
//! use polyglot_fetch::{Client, Http2Options};
//!
//! # async fn run() -> Result<(), polyglot_fetch::Error> {
//! let client = Client::builder()
//!     .http2(Http2Options::new().push_handler(|url, _headers, response| {
//!         println!("pushed: {url} ({})", response.status());
//!         tokio::spawn(async move {
//!             let _ = response.bytes().await;
//!         });
//!     }))
//!     .build()?;
//!
//! client.fetch("https://nghttp2.org").send().await?;
//! # Ok(())
//! # }
//! ```

pub use http::header;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use tokio_util::sync::CancellationToken;
pub use url::Url;

mod error;

mod alpn;
mod body;
mod client;
mod connect;
mod decoder;
mod h1;
mod h2;
mod into_url;
mod redirect;
mod request;
mod response;

pub use self::alpn::{
    AlpnProtocol, ALPN_HTTP1_0, ALPN_HTTP1_1, ALPN_HTTP2, ALPN_HTTP2C,
};
pub use self::body::Body;
pub use self::client::{Client, ClientBuilder};
pub use self::error::{Error, Result};
pub use self::h1::{Http1Options, Scheduling};
pub use self::h2::{Http2Options, PushAction, PushHandler, PushPromiseHandler};
pub use self::into_url::IntoUrl;
pub use self::redirect::RedirectMode;
pub use self::request::{Request, RequestBuilder};
pub use self::response::Response;

use once_cell::sync::Lazy;

static DEFAULT_CLIENT: Lazy<Client> = Lazy::new(Client::new);

/// Starts a request on the process-wide default client.
///
/// Prefer constructing a [`Client`] explicitly when you need your own
/// options or isolation; this convenience exists for one-off calls.
///
/// # Panics
///
/// Panics if the default client cannot be initialized (see
/// [`Client::new`]).
pub fn fetch<U: IntoUrl>(url: U) -> RequestBuilder {
    DEFAULT_CLIENT.fetch(url)
}

/// Resets the process-wide default client: closes its pooled
/// connections and sessions and clears its caches.
pub async fn reset() {
    DEFAULT_CLIENT.reset().await;
}

fn _assert_impls() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    fn assert_clone<T: Clone>() {}

    assert_send::<Client>();
    assert_sync::<Client>();
    assert_clone::<Client>();

    assert_send::<Request>();
    assert_send::<RequestBuilder>();
    assert_send::<Response>();

    assert_send::<Error>();
    assert_sync::<Error>();
}
