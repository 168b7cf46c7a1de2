//! HTTP/1.1 response: mutable until [`Response::end`], then frozen.
//!
//! Handlers and middleware share one `Response` per request. Once any of them
//! calls [`end`](Response::end) the response is *completed*: further mutation
//! is ignored and the middleware chain stops descending.

use std::fmt::Display;

use bytes::{BufMut, Bytes, BytesMut};

use super::{Headers, StatusCode};

/// An HTTP/1.1 response under construction.
///
/// # Examples
///
/// ```
/// use corvid::http::{Response, StatusCode};
///
/// let mut res = Response::new(StatusCode::Ok);
/// res.set_header("Content-Type", "application/json");
/// res.write(r#"{"status":"ok"}"#);
/// res.end();
///
/// res.write("ignored");
/// assert!(res.is_completed());
/// assert_eq!(res.body(), br#"{"status":"ok"}"#);
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    code: u16,
    headers: Headers,
    body: Vec<u8>,
    completed: bool,
    manual_length_header: bool,
    head_response: bool,
}

impl Response {
    /// Creates a response with the given status and an empty body.
    pub fn new(status: impl Into<u16>) -> Self {
        Self {
            code: status.into(),
            headers: Headers::new(),
            body: Vec::new(),
            completed: false,
            manual_length_header: false,
            head_response: false,
        }
    }

    /// A `200 OK` with a text body.
    pub fn text(body: impl Into<String>) -> Self {
        let mut res = Self::new(StatusCode::Ok);
        res.body = body.into().into_bytes();
        res
    }

    /// A `200 OK` carrying `value` serialized as JSON.
    pub fn json<T: serde::Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => {
                let mut res = Self::new(StatusCode::Ok);
                res.headers.set("Content-Type", "application/json");
                res.body = body;
                res
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize JSON response");
                Self::new(StatusCode::InternalServerError)
            }
        }
    }

    /// A redirect to `location` with the given 3xx status.
    pub fn redirect(status: StatusCode, location: impl Into<String>) -> Self {
        let mut res = Self::new(status);
        res.headers.set("Location", location);
        res
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn set_code(&mut self, code: impl Into<u16>) {
        if !self.completed {
            self.code = code.into();
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Appends a header, keeping existing values for the same name.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if !self.completed {
            self.headers.append(name, value);
        }
    }

    /// Replaces all values of a header.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if !self.completed {
            self.headers.set(name, value);
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Appends to the body.
    pub fn write(&mut self, data: impl AsRef<[u8]>) {
        if !self.completed {
            self.body.extend_from_slice(data.as_ref());
        }
    }

    /// Suppresses the automatic `Content-Length` header.
    pub fn set_manual_length_header(&mut self, manual: bool) {
        if !self.completed {
            self.manual_length_header = manual;
        }
    }

    /// Marks the response as an answer to `HEAD`: headers are sent, the body is not.
    pub fn set_head_response(&mut self, head: bool) {
        self.head_response = head;
    }

    pub fn is_head_response(&self) -> bool {
        self.head_response
    }

    /// Resets status, headers and body. Has no effect once completed.
    pub fn clear(&mut self) {
        if !self.completed {
            self.code = StatusCode::Ok.as_u16();
            self.headers.clear();
            self.body.clear();
            self.manual_length_header = false;
        }
    }

    /// Replaces this response with `other` unless already completed.
    pub fn replace(&mut self, other: Response) {
        if !self.completed {
            let head = self.head_response;
            *self = other;
            self.head_response = head;
        }
    }

    /// Completes the response.
    pub fn end(&mut self) {
        self.completed = true;
    }

    /// Appends `data` and completes the response.
    pub fn end_with(&mut self, data: impl AsRef<[u8]>) {
        self.write(data);
        self.end();
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Makes a completed response writable again for after-handlers.
    pub(crate) fn reopen(&mut self) {
        self.completed = false;
    }

    /// Serializes the status line and headers; returns them with the body to send.
    ///
    /// Unknown status codes become `500`. An error response without a body
    /// gets the reason phrase as its body. `Content-Length`, `Server` and
    /// `Date` are added unless already present, and `Connection: Keep-Alive`
    /// is appended when `keep_alive_header` is set.
    pub fn serialize(
        &mut self,
        server_name: &str,
        date: &str,
        keep_alive_header: bool,
    ) -> (BytesMut, Bytes) {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::InternalServerError);
        self.code = status.as_u16();
        if self.code >= 400 && self.body.is_empty() {
            self.body = status.canonical_reason().as_bytes().to_vec();
        }

        let mut head = BytesMut::with_capacity(128 + self.headers.len() * 48);
        head.put(format!("HTTP/1.1 {} {}\r\n", status.as_u16(), status.canonical_reason()).as_bytes());
        for (name, value) in self.headers.iter() {
            put_header(&mut head, name, value);
        }
        if !self.manual_length_header && !self.headers.contains("content-length") {
            put_header(&mut head, "Content-Length", &self.body.len().to_string());
        }
        if !self.headers.contains("server") {
            put_header(&mut head, "Server", server_name);
        }
        if !self.headers.contains("date") {
            put_header(&mut head, "Date", date);
        }
        if keep_alive_header {
            put_header(&mut head, "Connection", "Keep-Alive");
        }
        head.put_slice(b"\r\n");

        let body = if self.head_response {
            Bytes::new()
        } else {
            Bytes::from(std::mem::take(&mut self.body))
        };
        (head, body)
    }
}

fn put_header(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_slice(b"\r\n");
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

/// Conversion from handler return values into a [`Response`].
pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    fn into_response(self) -> Response {
        self
    }
}

impl IntoResponse for StatusCode {
    fn into_response(self) -> Response {
        Response::new(self)
    }
}

impl IntoResponse for String {
    fn into_response(self) -> Response {
        Response::text(self)
    }
}

impl IntoResponse for &'static str {
    fn into_response(self) -> Response {
        Response::text(self)
    }
}

impl IntoResponse for serde_json::Value {
    fn into_response(self) -> Response {
        Response::json(&self)
    }
}

impl<T: IntoResponse> IntoResponse for (StatusCode, T) {
    fn into_response(self) -> Response {
        let mut res = self.1.into_response();
        res.code = self.0.as_u16();
        res
    }
}

impl IntoResponse for () {
    fn into_response(self) -> Response {
        Response::default()
    }
}

/// Errors become a logged `500 Internal Server Error`.
impl<T, E> IntoResponse for Result<T, E>
where
    T: IntoResponse,
    E: Display,
{
    fn into_response(self) -> Response {
        match self {
            Ok(value) => value.into_response(),
            Err(e) => {
                tracing::error!(error = %e, "handler returned an error");
                Response::new(StatusCode::InternalServerError)
            }
        }
    }
}
