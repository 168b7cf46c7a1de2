//! [`BasicAuth`] and [`Cors`] as chain middleware.

use base64::{Engine as _, engine::general_purpose};
use tracing::debug;

use crate::http::{Method, Request, Response, StatusCode};
use crate::middleware::{Middleware, RequestContext};

/// HTTP Basic authentication against a single user.
///
/// Requests without a matching `Authorization` header are answered with
/// `401 Unauthorized` and a `WWW-Authenticate` challenge; the handler does
/// not run.
///
/// # Examples
///
/// ```
/// use corvid::security::BasicAuth;
///
/// let auth = BasicAuth::new("admin", "secret").realm("Explorer");
/// assert_eq!(auth.challenge(), r#"Basic realm="Explorer""#);
/// ```
#[derive(Debug, Clone)]
pub struct BasicAuth {
    username: String,
    expected: String,
    realm: String,
}

impl Default for BasicAuth {
    fn default() -> Self {
        Self::new("default", "password")
    }
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl AsRef<str>) -> Self {
        let username = username.into();
        let encoded = general_purpose::STANDARD.encode(format!("{}:{}", username, password.as_ref()));
        Self {
            username,
            expected: format!("Basic {encoded}"),
            realm: "Authorization Required".to_owned(),
        }
    }

    #[must_use]
    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    /// The `WWW-Authenticate` value sent with a `401`.
    pub fn challenge(&self) -> String {
        format!("Basic realm=\"{}\"", self.realm)
    }

    fn accepts(&self, header: Option<&str>) -> bool {
        header.is_some_and(|value| value.trim() == self.expected)
    }
}

/// Set by [`BasicAuth`] for authenticated requests.
#[derive(Debug, Default, Clone)]
pub struct AuthContext {
    pub user: Option<String>,
}

impl Middleware for BasicAuth {
    type Context = AuthContext;

    fn before_handle(
        &self,
        req: &Request,
        res: &mut Response,
        ctx: &mut AuthContext,
        _all: &RequestContext,
    ) {
        if self.accepts(req.header("authorization")) {
            ctx.user = Some(self.username.clone());
            return;
        }

        debug!(path = %req.path(), "basic auth rejected");
        res.clear();
        res.set_code(StatusCode::Unauthorized);
        res.add_header("WWW-Authenticate", self.challenge());
        res.end();
    }
}

/// Cross-Origin Resource Sharing.
///
/// Validates the `Origin` header against an allow-list, answers `OPTIONS`
/// preflight requests with `204 No Content`, and adds `Access-Control-*`
/// headers to every other response for an allowed origin. A specific origin
/// is echoed with `Vary: Origin`; the wildcard is not.
///
/// | Setting          | Default                         |
/// |------------------|---------------------------------|
/// | Allowed origins  | `*`                             |
/// | Allowed methods  | `GET`, `POST`, `PUT`, `DELETE`  |
/// | Allowed headers  | `Content-Type`, `Authorization` |
///
/// ```
/// use corvid::security::Cors;
///
/// let cors = Cors::new()
///     .allow_origin("https://example.com")
///     .allow_method("PATCH")
///     .allow_header("X-Request-ID");
/// ```
#[derive(Debug, Clone)]
pub struct Cors {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
}

impl Default for Cors {
    fn default() -> Self {
        Self::new()
    }
}

impl Cors {
    pub fn new() -> Self {
        Self {
            allowed_origins: vec!["*".to_owned()],
            allowed_methods: ["GET", "POST", "PUT", "DELETE"].map(String::from).to_vec(),
            allowed_headers: vec!["Content-Type".to_owned(), "Authorization".to_owned()],
        }
    }

    /// Restricts the allow-list to the given origins.
    #[must_use]
    pub fn only_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        self.allowed_methods.push(method.into());
        self
    }

    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allowed_headers.push(header.into());
        self
    }

    fn resolve_origin(&self, origin: &str) -> Option<String> {
        if self.allowed_origins.iter().any(|o| o == "*") {
            Some("*".to_owned())
        } else if self.allowed_origins.iter().any(|o| o == origin) {
            Some(origin.to_owned())
        } else {
            None
        }
    }

    fn apply(&self, res: &mut Response, allow_origin: &str) {
        res.set_header("Access-Control-Allow-Origin", allow_origin);
        res.set_header("Access-Control-Allow-Methods", self.allowed_methods.join(", "));
        res.set_header("Access-Control-Allow-Headers", self.allowed_headers.join(", "));
        if allow_origin != "*" {
            res.add_header("Vary", "Origin");
        }
    }
}

/// Origin decision made by [`Cors`] before the handler runs.
#[derive(Debug, Default, Clone)]
pub struct CorsContext {
    allow_origin: Option<String>,
    preflight: bool,
}

impl Middleware for Cors {
    type Context = CorsContext;

    fn before_handle(
        &self,
        req: &Request,
        res: &mut Response,
        ctx: &mut CorsContext,
        _all: &RequestContext,
    ) {
        let Some(allow_origin) = req.header("origin").and_then(|o| self.resolve_origin(o)) else {
            return;
        };

        if req.method() == Method::Options {
            ctx.preflight = true;
            res.replace(Response::new(StatusCode::NoContent));
            self.apply(res, &allow_origin);
            res.set_header("Access-Control-Max-Age", "3600");
            res.set_manual_length_header(true);
            res.end();
            return;
        }
        ctx.allow_origin = Some(allow_origin);
    }

    fn after_handle(
        &self,
        _req: &Request,
        res: &mut Response,
        ctx: &mut CorsContext,
        _all: &RequestContext,
    ) {
        if ctx.preflight {
            return;
        }
        if let Some(origin) = &ctx.allow_origin {
            self.apply(res, origin);
        }
    }
}
