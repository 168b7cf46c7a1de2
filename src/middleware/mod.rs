//! Middleware chain: before/after interceptors around the route handler.
//!
//! Each [`Middleware`] declares a per-request `Context` type. The chain keeps
//! one value of every middleware's context in a [`RequestContext`] for the
//! lifetime of a request, so a later middleware can read what an earlier one
//! stored.
//!
//! ## Ordering
//!
//! `before_handle` runs outer to inner in registration order. When a
//! `before_handle` completes the response, no further middleware or the
//! handler runs; only the middlewares whose `before_handle` already ran get
//! their `after_handle`, inner to outer. Otherwise the handler runs and every
//! `after_handle` runs, inner to outer.
//!
//! After-handlers see the response reopened so they can decorate it; the
//! connection completes it again before serializing.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use tracing::info;

use crate::http::{Request, Response};

/// Per-request storage for middleware contexts, keyed by middleware type.
#[derive(Default)]
pub struct RequestContext {
    map: HashMap<TypeId, Box<dyn Any>>,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("len", &self.map.len())
            .finish()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The context stored by middleware `M`, if it has run for this request.
    pub fn get<M: Middleware>(&self) -> Option<&M::Context> {
        self.map
            .get(&TypeId::of::<M>())
            .and_then(|value| value.downcast_ref::<M::Context>())
    }

    pub fn get_mut<M: Middleware>(&mut self) -> Option<&mut M::Context> {
        self.map
            .get_mut(&TypeId::of::<M>())
            .and_then(|value| value.downcast_mut::<M::Context>())
    }

    fn insert<M: Middleware>(&mut self, ctx: M::Context) {
        self.map.insert(TypeId::of::<M>(), Box::new(ctx));
    }

    fn take<M: Middleware>(&mut self) -> M::Context {
        self.map
            .remove(&TypeId::of::<M>())
            .and_then(|value| value.downcast::<M::Context>().ok())
            .map(|value| *value)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// A request interceptor with its own per-request context.
///
/// Both hooks receive the middleware's own context mutably and the other
/// middlewares' contexts through `all`. Completing `res` in `before_handle`
/// short-circuits the chain.
///
/// # Examples
///
/// ```
/// use corvid::http::{Request, Response, StatusCode};
/// use corvid::middleware::{Middleware, RequestContext};
///
/// struct RequireJson;
///
/// impl Middleware for RequireJson {
///     type Context = ();
///
///     fn before_handle(&self, req: &Request, res: &mut Response, _: &mut (), _: &RequestContext) {
///         if req.header("content-type") != Some("application/json") {
///             res.set_code(StatusCode::BadRequest);
///             res.end();
///         }
///     }
/// }
/// ```
pub trait Middleware: Send + Sync + 'static {
    type Context: Default + 'static;

    fn before_handle(
        &self,
        _req: &Request,
        _res: &mut Response,
        _ctx: &mut Self::Context,
        _all: &RequestContext,
    ) {
    }

    fn after_handle(
        &self,
        _req: &Request,
        _res: &mut Response,
        _ctx: &mut Self::Context,
        _all: &RequestContext,
    ) {
    }
}

trait Layer: Send + Sync {
    fn before(&self, req: &Request, res: &mut Response, all: &mut RequestContext);
    fn after(&self, req: &Request, res: &mut Response, all: &mut RequestContext);
    fn as_any(&self) -> &dyn Any;
}

impl<M: Middleware> Layer for M {
    fn before(&self, req: &Request, res: &mut Response, all: &mut RequestContext) {
        let mut ctx = all.take::<M>();
        self.before_handle(req, res, &mut ctx, all);
        all.insert::<M>(ctx);
    }

    fn after(&self, req: &Request, res: &mut Response, all: &mut RequestContext) {
        let mut ctx = all.take::<M>();
        self.after_handle(req, res, &mut ctx, all);
        all.insert::<M>(ctx);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The ordered middleware list of an application.
#[derive(Default)]
pub struct MiddlewareChain {
    layers: Vec<Box<dyn Layer>>,
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("len", &self.layers.len())
            .finish()
    }
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `middleware` as the innermost layer.
    pub fn push<M: Middleware>(&mut self, middleware: M) {
        self.layers.push(Box::new(middleware));
    }

    /// The registered middleware of type `M`, for reading its configuration.
    pub fn get<M: Middleware>(&self) -> Option<&M> {
        self.layers
            .iter()
            .find_map(|layer| layer.as_any().downcast_ref::<M>())
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Runs the chain around `handler` and returns the middleware contexts.
    pub fn run<F>(&self, req: &Request, res: &mut Response, handler: F) -> RequestContext
    where
        F: FnOnce(&Request, &mut Response),
    {
        let mut all = RequestContext::new();
        self.run_from(0, req, res, &mut all, handler);
        all
    }

    fn run_from<F>(
        &self,
        index: usize,
        req: &Request,
        res: &mut Response,
        all: &mut RequestContext,
        handler: F,
    ) where
        F: FnOnce(&Request, &mut Response),
    {
        let Some(layer) = self.layers.get(index) else {
            handler(req, res);
            return;
        };

        layer.before(req, res, all);
        if !res.is_completed() {
            self.run_from(index + 1, req, res, all, handler);
        }
        res.reopen();
        layer.after(req, res, all);
    }
}

/// Logs each request's method, path, status and duration once it is handled.
///
/// ```text
/// GET /page/3 - 200 (41.2µs)
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct Logger;

/// Start time recorded by [`Logger`].
#[derive(Debug, Default)]
pub struct LoggerContext {
    started: Option<Instant>,
}

impl Middleware for Logger {
    type Context = LoggerContext;

    fn before_handle(
        &self,
        _req: &Request,
        _res: &mut Response,
        ctx: &mut LoggerContext,
        _all: &RequestContext,
    ) {
        ctx.started = Some(Instant::now());
    }

    fn after_handle(
        &self,
        req: &Request,
        res: &mut Response,
        ctx: &mut LoggerContext,
        _all: &RequestContext,
    ) {
        let duration = ctx.started.map(|t| t.elapsed()).unwrap_or_default();
        info!(
            "{} {} - {} ({:?})",
            req.method(),
            req.path(),
            res.code(),
            duration
        );
    }
}
