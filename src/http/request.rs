//! Immutable HTTP request and the parser sink that assembles it.

use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};

use super::parser::ParserCallbacks;
use super::{Headers, Method};

/// A fully received HTTP request.
///
/// Built once per message by [`RequestBuilder`] and never mutated afterwards.
/// Route matching uses [`path`](Self::path), the percent-decoded path without
/// the query string.
///
/// # Examples
///
/// ```
/// use corvid::http::{Method, Request};
///
/// let req = Request::new(Method::Get, "/hello%20there?name=world&x=1+2")
///     .with_header("Host", "localhost");
///
/// assert_eq!(req.url(), "/hello%20there?name=world&x=1+2");
/// assert_eq!(req.path(), "/hello there");
/// assert_eq!(req.query_param("name"), Some("world"));
/// assert_eq!(req.query_param("x"), Some("1 2"));
/// assert_eq!(req.header("host"), Some("localhost"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: String,
    path: String,
    query: HashMap<String, String>,
    version: (u8, u8),
    headers: Headers,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
}

impl Request {
    /// Creates an HTTP/1.1 request with no headers and an empty body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        let url = url.into();
        let (raw_path, raw_query) = match url.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (url.as_str(), None),
        };
        let path = decode_path(raw_path).into_owned();
        let query = raw_query.map(parse_query_string).unwrap_or_default();

        Self {
            method,
            path,
            query,
            url,
            version: (1, 1),
            headers: Headers::new(),
            body: Bytes::new(),
            remote_addr: None,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_version(mut self, major: u8, minor: u8) -> Self {
        self.version = (major, minor);
        self
    }

    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// The request target exactly as received, query string included.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Percent-decoded path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `(major, minor)` HTTP version.
    pub fn version(&self) -> (u8, u8) {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// First value of the named header (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Returns a decoded query parameter by key.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn query_params(&self) -> &HashMap<String, String> {
        &self.query
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The body as UTF-8, replacing invalid sequences.
    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Deserializes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns the [`serde_json::Error`] when the body is not valid JSON for `T`.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(&self.body)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

fn decode_path(raw: &str) -> Cow<'_, str> {
    // A path with an invalid escape is matched as received.
    urlencoding::decode(raw).unwrap_or(Cow::Borrowed(raw))
}

fn parse_query_string(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

/// [`ParserCallbacks`] sink that accumulates one message into a [`Request`].
///
/// The connection keeps one builder and reuses it across keep-alive
/// iterations; [`take`](Self::take) hands out the finished request and
/// resets the builder.
#[derive(Debug, Default)]
pub struct RequestBuilder {
    method: Option<Method>,
    url: String,
    headers: Headers,
    body: BytesMut,
    version: (u8, u8),
    upgrade: bool,
    headers_done: bool,
    complete: bool,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the head of the current message has been parsed.
    pub fn headers_complete(&self) -> bool {
        self.headers_done
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_upgrade(&self) -> bool {
        self.upgrade
    }

    /// Headers received so far for the current message.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn version(&self) -> (u8, u8) {
        self.version
    }

    /// Builds the request from the current message and resets the builder.
    ///
    /// Returns `None` if no message has started.
    pub fn take(&mut self, remote_addr: Option<SocketAddr>) -> Option<Request> {
        let state = std::mem::take(self);
        let method = state.method?;
        let mut req = Request::new(method, state.url);
        req.headers = state.headers;
        req.body = state.body.freeze();
        req.version = state.version;
        req.remote_addr = remote_addr;
        Some(req)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

impl ParserCallbacks for RequestBuilder {
    fn on_message_begin(&mut self, method: Method) {
        self.clear();
        self.method = Some(method);
    }

    fn on_url(&mut self, url: &str) {
        self.url.push_str(url);
    }

    fn on_header(&mut self, name: &str, value: &[u8]) {
        self.headers
            .append(name, String::from_utf8_lossy(value).into_owned());
    }

    fn on_headers_complete(&mut self, version: (u8, u8), upgrade: bool) {
        self.version = version;
        self.upgrade = upgrade;
        self.headers_done = true;
    }

    fn on_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    fn on_message_complete(&mut self) {
        self.complete = true;
    }
}
