//! HTTP/1.x protocol types and parsing.
//!
//! This module provides the core HTTP primitives:
//! [`Method`], [`StatusCode`], [`Headers`], [`Request`], and [`Response`],
//! plus the byte-level [`parser`] boundary the connection feeds.

use std::fmt;

use thiserror::Error;

pub mod headers;
pub mod parser;
pub mod request;
pub mod response;

pub use headers::Headers;
pub use request::Request;
pub use response::{IntoResponse, Response};

/// An HTTP response status code from the table the serializer knows.
///
/// Responses store their code as a plain `u16` so handlers can set anything;
/// codes missing from this table are coerced to `500` when the response is
/// written.
///
/// # Examples
///
/// ```
/// use corvid::http::StatusCode;
///
/// let status = StatusCode::Ok;
/// assert_eq!(status.as_u16(), 200);
/// assert_eq!(status.canonical_reason(), "OK");
/// assert_eq!(StatusCode::from_u16(418), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    // 2xx Success
    Ok = 200,
    Created = 201,
    Accepted = 202,
    NoContent = 204,

    // 3xx Redirection
    MultipleChoices = 300,
    MovedPermanently = 301,
    Found = 302,
    SeeOther = 303,
    NotModified = 304,
    TemporaryRedirect = 307,
    PermanentRedirect = 308,

    // 4xx Client Error
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    PayloadTooLarge = 413,
    UnprocessableEntity = 422,
    TooManyRequests = 429,

    // 5xx Server Error
    InternalServerError = 500,
    NotImplemented = 501,
    BadGateway = 502,
    ServiceUnavailable = 503,
}

impl StatusCode {
    const ALL: [StatusCode; 23] = [
        Self::Ok,
        Self::Created,
        Self::Accepted,
        Self::NoContent,
        Self::MultipleChoices,
        Self::MovedPermanently,
        Self::Found,
        Self::SeeOther,
        Self::NotModified,
        Self::TemporaryRedirect,
        Self::PermanentRedirect,
        Self::BadRequest,
        Self::Unauthorized,
        Self::Forbidden,
        Self::NotFound,
        Self::MethodNotAllowed,
        Self::PayloadTooLarge,
        Self::UnprocessableEntity,
        Self::TooManyRequests,
        Self::InternalServerError,
        Self::NotImplemented,
        Self::BadGateway,
        Self::ServiceUnavailable,
    ];

    /// Returns the numeric status code as a `u16`.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Looks a numeric code up in the supported table.
    pub fn from_u16(code: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_u16() == code)
    }

    /// Returns the canonical reason phrase for this status code.
    pub fn canonical_reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Created => "Created",
            Self::Accepted => "Accepted",
            Self::NoContent => "No Content",
            Self::MultipleChoices => "Multiple Choices",
            Self::MovedPermanently => "Moved Permanently",
            Self::Found => "Found",
            Self::SeeOther => "See Other",
            Self::NotModified => "Not Modified",
            Self::TemporaryRedirect => "Temporary Redirect",
            Self::PermanentRedirect => "Permanent Redirect",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::UnprocessableEntity => "Unprocessable Entity",
            Self::TooManyRequests => "Too Many Requests",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
            Self::BadGateway => "Bad Gateway",
            Self::ServiceUnavailable => "Service Unavailable",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> u16 {
        code.as_u16()
    }
}

/// Returned when a request line carries a method outside the supported set.
#[derive(Debug, Clone, Error)]
#[error("unsupported HTTP method: {0}")]
pub struct UnknownMethod(pub String);

/// An HTTP request method.
///
/// Every method owns one bit in a [`MethodSet`], so a route can be bound to
/// any combination of them.
///
/// # Examples
///
/// ```
/// use corvid::http::Method;
///
/// let method: Method = "GET".parse().unwrap();
/// assert_eq!(method, Method::Get);
/// assert_eq!(method.as_str(), "GET");
/// assert!(method.is_safe());
/// assert!("BREW".parse::<Method>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    /// DELETE: remove the association between the target resource and its functionality.
    Delete,
    /// GET: retrieve a representation of the target resource.
    Get,
    /// HEAD: identical to GET but without a response body.
    Head,
    /// POST: perform resource-specific processing on the request payload.
    Post,
    /// PUT: replace the target resource's current representation.
    Put,
    /// CONNECT: establish a tunnel to the server identified by the target resource.
    Connect,
    /// OPTIONS: describe the communication options for the target resource.
    Options,
    /// TRACE: perform a message loop-back test along the path to the target resource.
    Trace,
    /// PATCH: apply partial modifications to a resource.
    Patch,
    /// PURGE: evict the target resource from caches.
    Purge,
}

impl Method {
    /// Number of supported methods; also the number of per-method tries a router keeps.
    pub const COUNT: usize = 10;

    /// All methods in bit order.
    pub const ALL: [Method; Method::COUNT] = [
        Self::Delete,
        Self::Get,
        Self::Head,
        Self::Post,
        Self::Put,
        Self::Connect,
        Self::Options,
        Self::Trace,
        Self::Patch,
        Self::Purge,
    ];

    /// Returns the method as a string slice.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delete => "DELETE",
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Connect => "CONNECT",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Patch => "PATCH",
            Self::Purge => "PURGE",
        }
    }

    /// Position of this method in [`Method::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// The single-bit mask for this method.
    pub fn bit(self) -> u32 {
        1 << self.index()
    }

    /// Returns `true` if this method is considered "safe" (no side effects per RFC 9110 §9.2.1).
    pub fn is_safe(self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Options | Self::Trace)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownMethod(s.to_owned()))
    }
}

impl AsRef<str> for Method {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// A bitmask of [`Method`]s.
///
/// ```
/// use corvid::http::{Method, MethodSet};
///
/// let set = MethodSet::from(Method::Get) | Method::Post;
/// assert!(set.contains(Method::Post));
/// assert!(!set.contains(Method::Put));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MethodSet(u32);

impl MethodSet {
    /// The empty set.
    pub const EMPTY: MethodSet = MethodSet(0);

    pub fn contains(self, method: Method) -> bool {
        self.0 & method.bit() != 0
    }

    pub fn insert(&mut self, method: Method) {
        self.0 |= method.bit();
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates the members in bit order.
    pub fn iter(self) -> impl Iterator<Item = Method> {
        Method::ALL.into_iter().filter(move |m| self.contains(*m))
    }
}

impl From<Method> for MethodSet {
    fn from(method: Method) -> Self {
        MethodSet(method.bit())
    }
}

impl std::ops::BitOr<Method> for MethodSet {
    type Output = MethodSet;

    fn bitor(self, rhs: Method) -> MethodSet {
        MethodSet(self.0 | rhs.bit())
    }
}

impl FromIterator<Method> for MethodSet {
    fn from_iter<I: IntoIterator<Item = Method>>(iter: I) -> Self {
        let mut set = MethodSet::EMPTY;
        for m in iter {
            set.insert(m);
        }
        set
    }
}
