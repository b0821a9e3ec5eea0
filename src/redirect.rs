//! Redirect Handling
//!
//! By default, a client follows HTTP redirects (301, 302, 303, 307, 308)
//! up to a maximum chain of 20 hops, per the Fetch rules. Use
//! [`RedirectMode`] and [`RequestBuilder::follow`](crate::RequestBuilder::follow)
//! to change this per request.

use std::{error::Error as StdError, fmt, str};

use http::{
    header::{
        HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE,
        COOKIE, LOCATION, PROXY_AUTHORIZATION, TRANSFER_ENCODING, WWW_AUTHENTICATE,
    },
    Method, StatusCode,
};
use log::debug;
use url::Url;

/// How a 3xx response is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectMode {
    /// Follow redirects up to the configured hop limit.
    #[default]
    Follow,
    /// Return the 3xx response with its `location` header resolved to an
    /// absolute URL.
    Manual,
    /// Fail any redirect with an error.
    Error,
}

/// What to do with the request when following one redirect hop.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step {
    /// Keep the method and resend the body.
    KeepMethod,
    /// Switch to `GET`, drop the body and its entity headers.
    RewriteToGet,
}

pub(crate) fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Decides how one redirect hop treats the request: a 303 always becomes
/// a `GET`, as does a `POST` answered with 301 or 302; everything else
/// keeps its method and body.
pub(crate) fn step(status: StatusCode, method: &Method) -> Step {
    match status {
        StatusCode::SEE_OTHER => Step::RewriteToGet,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND if *method == Method::POST => {
            Step::RewriteToGet
        }
        _ => Step::KeepMethod,
    }
}

/// Resolves the response's `location` header against the request URL.
/// Returns `None` when the header is missing or unusable.
pub(crate) fn location(url: &Url, headers: &HeaderMap) -> Option<Url> {
    let value = headers.get(LOCATION)?;
    // Some sites send a utf-8 location header even though the bytes are
    // supposed to be opaque; insist on utf-8 here.
    let loc = str::from_utf8(value.as_bytes()).ok()?;
    match url.join(loc) {
        Ok(loc) => Some(loc),
        Err(e) => {
            debug!("location header had an invalid url ({loc:?}): {e}");
            None
        }
    }
}

/// Rewrites the `location` header of a response returned in `Manual`
/// mode so the caller always sees an absolute URL.
pub(crate) fn absolutize_location(url: &Url, headers: &mut HeaderMap) {
    if let Some(loc) = location(url, headers) {
        if let Ok(value) = HeaderValue::from_str(loc.as_str()) {
            headers.insert(LOCATION, value);
        }
    }
}

/// Strips the entity headers describing a body that a rewritten-to-GET
/// hop no longer sends.
pub(crate) fn remove_body_headers(headers: &mut HeaderMap) {
    for header in &[
        TRANSFER_ENCODING,
        CONTENT_ENCODING,
        CONTENT_TYPE,
        CONTENT_LENGTH,
    ] {
        headers.remove(header);
    }
}

/// Strips credentials when a redirect hops across origins.
pub(crate) fn remove_sensitive_headers(headers: &mut HeaderMap, next: &Url, previous: &Url) {
    let cross_host = next.host_str() != previous.host_str()
        || next.port_or_known_default() != previous.port_or_known_default()
        || next.scheme() != previous.scheme();
    if cross_host {
        headers.remove(AUTHORIZATION);
        headers.remove(COOKIE);
        headers.remove("cookie2");
        headers.remove(PROXY_AUTHORIZATION);
        headers.remove(WWW_AUTHENTICATE);
    }
}

#[derive(Debug)]
pub(crate) struct NoRedirect;

impl fmt::Display for NoRedirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("redirect mode is set to error")
    }
}

impl StdError for NoRedirect {}

#[derive(Debug)]
pub(crate) struct TooManyRedirects;

impl fmt::Display for TooManyRedirects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("maximum redirect reached")
    }
}

impl StdError for TooManyRedirects {}

#[derive(Debug)]
pub(crate) struct UnsupportedRedirect;

impl fmt::Display for UnsupportedRedirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("streamed request body cannot be replayed")
    }
}

impl StdError for UnsupportedRedirect {}
