//! The application: routes, middleware and server settings in one place.

use std::net::IpAddr;

use crate::config::ServerConfig;
use crate::http::{Method, Request, Response};
use crate::middleware::{Middleware, MiddlewareChain, RequestContext};
use crate::router::{Handler, RouteError, Router, Rule};
use crate::server::{Server, ServerError};

/// Routes, middleware and configuration for one server.
///
/// Settings are chained by value; routes are added through `&mut`.
///
/// # Examples
///
/// ```rust,no_run
/// use corvid::App;
/// use corvid::middleware::Logger;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut app = App::new().port(18080).workers(4).middleware(Logger);
///     app.route("/page/<uint>")?.to(|n: u64| format!("page:{n}"))?;
///     app.run().await?;
///     Ok(())
/// }
/// ```
#[derive(Default)]
pub struct App {
    router: Router,
    middleware: MiddlewareChain,
    config: ServerConfig,
}

impl App {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    #[must_use]
    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Idle deadline in seconds.
    #[must_use]
    pub fn timeout(mut self, secs: u64) -> Self {
        self.config.timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    /// Appends `middleware` as the innermost layer.
    #[must_use]
    pub fn middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Registers a rule; see [`Router::route`].
    ///
    /// # Errors
    ///
    /// As [`Router::route`].
    pub fn route(&mut self, pattern: &str) -> Result<&mut Rule, RouteError> {
        self.router.route(pattern)
    }

    pub fn catch_all<H, Args>(&mut self, handler: H)
    where
        H: Handler<Args>,
    {
        self.router.catch_all(handler);
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The registered middleware of type `M`.
    pub fn get_middleware<M: Middleware>(&self) -> Option<&M> {
        self.middleware.get::<M>()
    }

    /// Checks the configuration and compiles the routes.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] or [`ServerError::Route`].
    pub fn validate(&mut self) -> Result<(), ServerError> {
        self.config.validate()?;
        self.router.validate()?;
        Ok(())
    }

    /// Runs one request through the middleware chain and the router.
    ///
    /// `res` is completed on return.
    pub fn handle(&self, req: &Request, res: &mut Response) -> RequestContext {
        res.set_head_response(req.method() == Method::Head);
        let all = self
            .middleware
            .run(req, res, |req, res| self.router.handle(req, res));
        res.end();
        all
    }

    /// Binds and serves until the process ends.
    ///
    /// # Errors
    ///
    /// As [`Server::bind`] and [`Server::run`].
    pub async fn run(self) -> Result<(), ServerError> {
        Server::bind(self).await?.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;
    use crate::security::BasicAuth;

    fn app() -> App {
        let mut app = App::new().middleware(BasicAuth::new("admin", "secret"));
        app.route("/private").unwrap().to(|| "secret stuff").unwrap();
        app.validate().unwrap();
        app
    }

    #[test]
    fn middleware_short_circuit_skips_router() {
        let app = app();
        let req = Request::new(Method::Get, "/private").with_header("Host", "x");
        let mut res = Response::default();
        app.handle(&req, &mut res);
        assert_eq!(res.code(), StatusCode::Unauthorized.as_u16());
        assert!(res.is_completed());
    }

    #[test]
    fn authorized_request_reaches_handler() {
        let app = app();
        let req = Request::new(Method::Get, "/private")
            .with_header("Host", "x")
            .with_header("Authorization", "Basic YWRtaW46c2VjcmV0");
        let mut res = Response::default();
        let ctx = app.handle(&req, &mut res);
        assert_eq!(res.body(), b"secret stuff");
        assert!(ctx.get::<BasicAuth>().is_some());
        assert!(app.get_middleware::<BasicAuth>().is_some());
    }

    #[test]
    fn head_rejected_by_middleware_has_no_body() {
        let app = app();
        let req = Request::new(Method::Head, "/private").with_header("Host", "x");
        let mut res = Response::default();
        app.handle(&req, &mut res);
        assert_eq!(res.code(), StatusCode::Unauthorized.as_u16());

        let (head, body) = res.serialize("corvid", "Thu, 01 Jan 1970 00:00:00 GMT", false);
        assert!(body.is_empty());
        let head = String::from_utf8(head.to_vec()).unwrap();
        assert!(head.contains("Content-Length: 12\r\n"));
    }

    #[test]
    fn builder_settings_land_in_config() {
        let app = App::new().port(9000).workers(3).timeout(7).server_name("explorer");
        assert_eq!(app.config().port, 9000);
        assert_eq!(app.config().workers, 3);
        assert_eq!(app.config().timeout_secs, 7);
        assert_eq!(app.config().server_name, "explorer");
    }
}
