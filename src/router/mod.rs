//! Request routing: typed URL patterns per HTTP method.
//!
//! Patterns are literal text mixed with placeholders:
//!
//! | Placeholder            | Matches                          | Handler type        |
//! |------------------------|----------------------------------|---------------------|
//! | `<int>`                | optional `+`/`-`, digits         | `i64` and narrower  |
//! | `<uint>`               | optional `+`, digits             | `u64` and narrower  |
//! | `<float>` / `<double>` | a decimal number                 | `f64`, `f32`        |
//! | `<str>` / `<string>`   | one segment, up to the next `/`  | `String`            |
//! | `<path>`               | the rest of the path             | `String`            |
//!
//! Rules are registered with [`Router::route`], bound to a handler, and
//! compiled into one [`Trie`] per method by [`Router::validate`]. A pattern
//! that ends in `/` also answers the path without the slash with a `301`.

pub mod params;
pub mod rule;
pub mod trie;

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use thiserror::Error;
use tracing::{debug, error};

use crate::http::{IntoResponse, Method, Request, Response, StatusCode};

pub use params::{FromParam, ParamType, RoutingParams, Value, ValueKind};
pub use rule::{BoxedHandler, Handler, Rule, UpgradeHandler, WithRequest};
pub use trie::Trie;

use trie::{NO_RULE, REDIRECT_SLASH};

/// Trie indices `0` and `1` are reserved; rule `n` is stored as `n + RULE_BASE`.
const RULE_BASE: usize = 2;

/// Errors raised while registering or compiling routes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("unclosed placeholder in route `{pattern}`")]
    UnclosedPlaceholder { pattern: String },

    #[error("unknown placeholder `{tag}` in route `{pattern}`")]
    UnknownPlaceholder { pattern: String, tag: String },

    #[error("route `{pattern}` must start with `/`")]
    InvalidPattern { pattern: String },

    #[error("handler already exists for `{pattern}`")]
    Duplicate { pattern: String },

    #[error("no handler for route `{pattern}`")]
    MissingHandler { pattern: String },

    #[error("handler for `{pattern}` takes {found}, route captures {expected}")]
    SignatureMismatch {
        pattern: String,
        expected: String,
        found: String,
    },

    #[error("route `{pattern}` is already an upgrade rule")]
    AlreadyUpgraded { pattern: String },
}

/// Maps `(method, path)` to rules.
///
/// # Examples
///
/// ```
/// use corvid::http::{Method, Request, Response};
/// use corvid::router::Router;
///
/// let mut router = Router::new();
/// router.route("/page/<uint>").unwrap()
///     .to(|n: u64| format!("page:{n}")).unwrap();
/// router.validate().unwrap();
///
/// let req = Request::new(Method::Get, "/page/3").with_header("Host", "localhost");
/// let mut res = Response::default();
/// router.handle(&req, &mut res);
/// assert_eq!(res.body(), b"page:3");
/// assert!(res.is_completed());
/// ```
#[derive(Default)]
pub struct Router {
    rules: Vec<Rule>,
    tries: [Trie; Method::COUNT],
    catch_all: Option<BoxedHandler>,
}

impl Router {
    /// An empty router with no rules and no catch-all.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new rule for `pattern` (method `GET` until changed).
    ///
    /// # Errors
    ///
    /// [`RouteError::InvalidPattern`] for a pattern that does not start with
    /// `/`, and the placeholder errors of [`params::signature`].
    pub fn route(&mut self, pattern: &str) -> Result<&mut Rule, RouteError> {
        let rule = Rule::new(pattern)?;
        self.rules.push(rule);
        let last = self.rules.len() - 1;
        Ok(&mut self.rules[last])
    }

    /// Sets the handler for requests no rule matches.
    pub fn catch_all<H, Args>(&mut self, handler: H)
    where
        H: Handler<Args>,
    {
        self.catch_all = Some(rule::erase(handler));
    }

    /// Rules in registration order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Looks up a rule by the name given with [`Rule::name`].
    ///
    /// # Examples
    ///
    /// ```
    /// use corvid::Router;
    ///
    /// let mut router = Router::new();
    /// router.route("/block/<uint>").unwrap()
    ///     .name("block")
    ///     .to(|height: u64| format!("block {height}")).unwrap();
    ///
    /// let rule = router.rule_by_name("block").unwrap();
    /// assert_eq!(rule.pattern(), "/block/<uint>");
    /// assert!(router.rule_by_name("tx").is_none());
    /// ```
    pub fn rule_by_name(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.rule_name() == Some(name))
    }

    /// Compiles all rules into the per-method tries.
    ///
    /// Safe to call again after adding rules; the tries are rebuilt.
    ///
    /// # Errors
    ///
    /// [`RouteError::MissingHandler`] for a rule with no handler and
    /// [`RouteError::Duplicate`] when two rules share a method and pattern.
    pub fn validate(&mut self) -> Result<(), RouteError> {
        let mut tries: [Trie; Method::COUNT] = Default::default();

        for (i, rule) in self.rules.iter().enumerate() {
            rule.validate()?;
            let pattern = rule.pattern();
            for method in rule.method_set().iter() {
                let trie = &mut tries[method.index()];
                trie.add_over_redirect(pattern, i + RULE_BASE)?;
                if pattern.len() > 1 && pattern.ends_with('/') {
                    trie.add_redirect(&pattern[..pattern.len() - 1])?;
                }
            }
        }
        for trie in &mut tries {
            trie.optimize();
        }

        self.tries = tries;
        debug!(rules = self.rules.len(), "routes compiled");
        Ok(())
    }

    /// Dispatches a request and leaves `res` completed.
    ///
    /// `HEAD` is routed as `GET` with the body suppressed. `OPTIONS` without a
    /// matching `OPTIONS` rule is answered with the allowed methods. A path
    /// that matches only under another method gets `405`; anything else
    /// unmatched goes to the catch-all handler, or `404` without one.
    pub fn handle(&self, req: &Request, res: &mut Response) {
        let method = match req.method() {
            Method::Head => {
                res.set_head_response(true);
                Method::Get
            }
            m => m,
        };

        let (index, params) = self.tries[method.index()].find(req.path());
        match index {
            NO_RULE if method == Method::Options => self.handle_options(req, res),
            NO_RULE if self.matches_other_method(method, req.path()) => {
                debug!(method = %method, path = %req.path(), "method not allowed");
                res.replace(Response::new(StatusCode::MethodNotAllowed));
            }
            NO_RULE => match &self.catch_all {
                Some(handler) => guarded(req, res, |req, res| handler(req, res, Vec::new())),
                None => {
                    debug!(path = %req.path(), "no route matched");
                    res.replace(Response::new(StatusCode::NotFound));
                }
            },
            REDIRECT_SLASH => redirect_with_slash(req, res),
            i => {
                let rule = &self.rules[i - RULE_BASE];
                guarded(req, res, |req, res| rule.handle(req, res, &params));
            }
        }
        res.end();
    }

    /// Resolves an upgrade request to its upgrade handler.
    ///
    /// Only upgrade rules qualify and the catch-all is never consulted. When
    /// `None` is returned, `res` holds the completed error response.
    pub fn handle_upgrade(&self, req: &Request, res: &mut Response) -> Option<UpgradeHandler> {
        let (index, _) = self.tries[req.method().index()].find(req.path());
        let found = match index {
            NO_RULE => None,
            REDIRECT_SLASH => {
                redirect_with_slash(req, res);
                res.end();
                return None;
            }
            i => self.rules[i - RULE_BASE].upgrade_handler().cloned(),
        };
        if found.is_none() {
            debug!(path = %req.path(), "no upgrade route matched");
            res.replace(Response::new(StatusCode::NotFound));
            res.end();
        }
        found
    }

    fn matches_other_method(&self, method: Method, path: &str) -> bool {
        Method::ALL
            .iter()
            .filter(|m| **m != method)
            .any(|m| self.tries[m.index()].find(path).0 != NO_RULE)
    }

    fn handle_options(&self, req: &Request, res: &mut Response) {
        let server_wide = matches!(req.path(), "*" | "/*");
        let mut allow = vec!["OPTIONS", "HEAD"];
        let mut matched = false;
        for method in Method::ALL {
            let trie = &self.tries[method.index()];
            let hit = if server_wide {
                !trie.is_empty()
            } else {
                trie.find(req.path()).0 != NO_RULE
            };
            if hit {
                matched = true;
                if !matches!(method, Method::Head | Method::Options) {
                    allow.push(method.as_str());
                }
            }
        }

        if server_wide || matched {
            let mut out = Response::new(StatusCode::NoContent);
            out.set_header("Allow", allow.join(", "));
            out.set_manual_length_header(true);
            res.replace(out);
        } else {
            debug!(path = %req.path(), "no route matched for OPTIONS");
            res.replace(Response::new(StatusCode::NotFound));
        }
    }
}

fn redirect_with_slash(req: &Request, res: &mut Response) {
    let raw_path = req.url().split('?').next().unwrap_or_default();
    let location = match req.header("host") {
        Some(host) => format!("http://{host}{raw_path}/"),
        None => format!("{raw_path}/"),
    };
    debug!(location = %location, "redirecting to trailing slash");
    res.replace(Response::redirect(StatusCode::MovedPermanently, location));
}

/// Runs `f`, turning a panic into a logged `500`.
fn guarded<F>(req: &Request, res: &mut Response, f: F)
where
    F: FnOnce(&Request, &mut Response),
{
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| f(req, res))) {
        error!(
            method = %req.method(),
            path = %req.path(),
            panic = %panic_message(panic.as_ref()),
            "handler panicked"
        );
        let head = res.is_head_response();
        *res = StatusCode::InternalServerError.into_response();
        res.set_head_response(head);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
