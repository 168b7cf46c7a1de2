//! Rules: one route pattern, a method set, and the handler bound to them.

use std::fmt;
use std::sync::Arc;

use crate::connection::Upgraded;
use crate::http::{IntoResponse, Method, MethodSet, Request, Response, StatusCode};

use super::RouteError;
use super::params::{FromParam, ParamType, RoutingParams, Value, ValueKind, signature};

/// Marker for handlers whose first argument is the [`Request`].
pub struct WithRequest;

/// A function that can serve a rule, with its parameter types known up front.
///
/// Implemented for `Fn(A, B, ..) -> R` and `Fn(&Request, A, B, ..) -> R`
/// with up to five [`FromParam`] arguments and any [`IntoResponse`] result.
/// Closure arguments need type annotations so the right implementation is
/// picked.
pub trait Handler<Args>: Send + Sync + 'static {
    /// Value kinds of the route parameters, in order.
    fn signature() -> Vec<ValueKind>;

    /// Invokes the handler; `None` if `values` does not fit the signature.
    fn call(&self, req: &Request, values: Vec<Value>) -> Option<Response>;
}

macro_rules! impl_handler {
    ($($arg:ident),*) => {
        impl<F, R, $($arg,)*> Handler<($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> R + Send + Sync + 'static,
            R: IntoResponse,
            $($arg: FromParam,)*
        {
            fn signature() -> Vec<ValueKind> {
                vec![$(<$arg as FromParam>::KIND),*]
            }

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn call(&self, _req: &Request, values: Vec<Value>) -> Option<Response> {
                let mut values = values.into_iter();
                $(let $arg = <$arg as FromParam>::from_value(values.next()?)?;)*
                Some((self)($($arg),*).into_response())
            }
        }

        impl<F, R, $($arg,)*> Handler<(WithRequest, $($arg,)*)> for F
        where
            F: Fn(&Request, $($arg),*) -> R + Send + Sync + 'static,
            R: IntoResponse,
            $($arg: FromParam,)*
        {
            fn signature() -> Vec<ValueKind> {
                vec![$(<$arg as FromParam>::KIND),*]
            }

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn call(&self, req: &Request, values: Vec<Value>) -> Option<Response> {
                let mut values = values.into_iter();
                $(let $arg = <$arg as FromParam>::from_value(values.next()?)?;)*
                Some((self)(req, $($arg),*).into_response())
            }
        }
    };
}

impl_handler!();
impl_handler!(A);
impl_handler!(A, B);
impl_handler!(A, B, C);
impl_handler!(A, B, C, D);
impl_handler!(A, B, C, D, E);

/// A type-erased handler: request, response to fill, positional parameters.
pub type BoxedHandler = Arc<dyn Fn(&Request, &mut Response, Vec<Value>) + Send + Sync>;

/// Receives a connection after a successful protocol-upgrade match.
pub type UpgradeHandler = Arc<dyn Fn(Request, Upgraded) + Send + Sync>;

pub(crate) fn erase<H, Args>(handler: H) -> BoxedHandler
where
    H: Handler<Args>,
{
    Arc::new(move |req: &Request, res: &mut Response, values: Vec<Value>| {
        match handler.call(req, values) {
            Some(out) => res.replace(out),
            None => res.replace(Response::new(StatusCode::InternalServerError)),
        }
    })
}

fn kinds_to_string(kinds: &[ValueKind]) -> String {
    let list: Vec<String> = kinds.iter().map(ToString::to_string).collect();
    format!("({})", list.join(", "))
}

#[derive(Clone)]
enum RuleKind {
    Unbound,
    /// Parameters checked against the pattern when the handler was attached.
    Tagged(BoxedHandler),
    /// Parameters handed over as a runtime list.
    Dynamic(BoxedHandler),
    Upgrade(UpgradeHandler),
}

/// One registered route.
///
/// Created through [`Router::route`](super::Router::route); bound to a
/// handler with [`to`](Self::to), [`to_dynamic`](Self::to_dynamic) or
/// [`websocket`](Self::websocket).
#[derive(Clone)]
pub struct Rule {
    pattern: String,
    signature: Vec<ParamType>,
    methods: MethodSet,
    name: Option<String>,
    kind: RuleKind,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RuleKind::Unbound => "unbound",
            RuleKind::Tagged(_) => "tagged",
            RuleKind::Dynamic(_) => "dynamic",
            RuleKind::Upgrade(_) => "upgrade",
        };
        f.debug_struct("Rule")
            .field("pattern", &self.pattern)
            .field("methods", &self.methods)
            .field("name", &self.name)
            .field("kind", &kind)
            .finish()
    }
}

impl Rule {
    pub(crate) fn new(pattern: &str) -> Result<Self, RouteError> {
        if !pattern.starts_with('/') {
            return Err(RouteError::InvalidPattern {
                pattern: pattern.to_owned(),
            });
        }
        Ok(Self {
            signature: signature(pattern)?,
            pattern: pattern.to_owned(),
            methods: MethodSet::from(Method::Get),
            name: None,
            kind: RuleKind::Unbound,
        })
    }

    /// The pattern as registered, placeholders included.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn signature(&self) -> &[ParamType] {
        &self.signature
    }

    pub fn method_set(&self) -> MethodSet {
        self.methods
    }

    /// The name set with [`Rule::name`], if any.
    pub fn rule_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_upgrade(&self) -> bool {
        matches!(self.kind, RuleKind::Upgrade(_))
    }

    /// Replaces the method set (default: `GET` only).
    pub fn methods(&mut self, methods: impl IntoIterator<Item = Method>) -> &mut Self {
        self.methods = methods.into_iter().collect();
        self
    }

    /// Names the rule so it can be found with
    /// [`Router::rule_by_name`](super::Router::rule_by_name).
    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    /// Binds a typed handler.
    ///
    /// # Errors
    ///
    /// [`RouteError::SignatureMismatch`] if the handler's parameter types do
    /// not match the pattern's placeholders in number, kind, and order.
    pub fn to<H, Args>(&mut self, handler: H) -> Result<&mut Self, RouteError>
    where
        H: Handler<Args>,
    {
        let expected: Vec<ValueKind> = self.signature.iter().map(|t| t.kind()).collect();
        let found = H::signature();
        if expected != found {
            return Err(RouteError::SignatureMismatch {
                pattern: self.pattern.clone(),
                expected: kinds_to_string(&expected),
                found: kinds_to_string(&found),
            });
        }
        self.kind = RuleKind::Tagged(erase(handler));
        Ok(self)
    }

    /// Binds a handler that receives the parameters as a runtime list.
    pub fn to_dynamic<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&Request, &mut Response, Vec<Value>) + Send + Sync + 'static,
    {
        self.kind = RuleKind::Dynamic(Arc::new(handler));
        self
    }

    /// Turns this rule into a protocol-upgrade rule.
    ///
    /// # Errors
    ///
    /// [`RouteError::AlreadyUpgraded`] if called twice on the same rule.
    pub fn websocket<F>(&mut self, handler: F) -> Result<&mut Self, RouteError>
    where
        F: Fn(Request, Upgraded) + Send + Sync + 'static,
    {
        if self.is_upgrade() {
            return Err(RouteError::AlreadyUpgraded {
                pattern: self.pattern.clone(),
            });
        }
        self.kind = RuleKind::Upgrade(Arc::new(handler));
        Ok(self)
    }

    pub(crate) fn validate(&self) -> Result<(), RouteError> {
        match self.kind {
            RuleKind::Unbound => Err(RouteError::MissingHandler {
                pattern: self.pattern.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Runs the handler for a request that matched this rule.
    pub(crate) fn handle(&self, req: &Request, res: &mut Response, params: &RoutingParams) {
        let handler = match &self.kind {
            RuleKind::Tagged(h) | RuleKind::Dynamic(h) => h,
            RuleKind::Upgrade(_) | RuleKind::Unbound => {
                res.replace(Response::new(StatusCode::NotFound));
                return;
            }
        };
        match params.to_values(&self.signature) {
            Some(values) => handler(req, res, values),
            None => {
                tracing::error!(
                    pattern = %self.pattern,
                    "captured parameters do not fit the route signature"
                );
                res.replace(Response::new(StatusCode::InternalServerError));
            }
        }
    }

    pub(crate) fn upgrade_handler(&self) -> Option<&UpgradeHandler> {
        match &self.kind {
            RuleKind::Upgrade(h) => Some(h),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(uints: Vec<u64>, strings: Vec<&str>) -> RoutingParams {
        RoutingParams {
            uints,
            strings: strings.into_iter().map(str::to_owned).collect(),
            ..RoutingParams::default()
        }
    }

    #[test]
    fn typed_handler_receives_params_in_order() {
        let mut rule = Rule::new("/tx/<string>/<uint>").unwrap();
        rule.to(|hash: String, n: u64| format!("{hash}:{n}")).unwrap();

        let req = Request::new(Method::Get, "/tx/ab/1");
        let mut res = Response::default();
        rule.handle(&req, &mut res, &params(vec![1], vec!["ab"]));
        assert_eq!(res.body(), b"ab:1");
    }

    #[test]
    fn handler_with_request() {
        let mut rule = Rule::new("/page/<uint>").unwrap();
        rule.to(|req: &Request, n: u32| format!("{} {n}", req.path()))
            .unwrap();

        let req = Request::new(Method::Get, "/page/3");
        let mut res = Response::default();
        rule.handle(&req, &mut res, &params(vec![3], vec![]));
        assert_eq!(res.body(), b"/page/3 3");
    }

    #[test]
    fn signature_mismatch_is_reported_at_registration() {
        let mut rule = Rule::new("/page/<uint>").unwrap();
        let err = rule.to(|s: String| s).unwrap_err();
        match err {
            RouteError::SignatureMismatch { expected, found, .. } => {
                assert_eq!(expected, "(uint)");
                assert_eq!(found, "(string)");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let mut rule = Rule::new("/a/<int>/<int>").unwrap();
        assert!(rule.to(|a: i64| a.to_string()).is_err());
        assert!(rule.to(|a: i64, b: i32| (a + i64::from(b)).to_string()).is_ok());
    }

    #[test]
    fn path_placeholder_takes_string() {
        let mut rule = Rule::new("/static/<path>").unwrap();
        assert!(rule.to(|p: String| p).is_ok());
    }

    #[test]
    fn dynamic_handler_gets_values() {
        let mut rule = Rule::new("/d/<uint>/<string>").unwrap();
        rule.to_dynamic(|_req: &Request, res: &mut Response, values: Vec<Value>| {
            res.write(format!("{:?}", values));
        });

        let req = Request::new(Method::Get, "/d/5/x");
        let mut res = Response::default();
        rule.handle(&req, &mut res, &params(vec![5], vec!["x"]));
        assert_eq!(res.body(), br#"[Uint(5), String("x")]"#);
    }

    #[test]
    fn unbound_rule_fails_validation() {
        let rule = Rule::new("/nothing").unwrap();
        assert!(matches!(rule.validate(), Err(RouteError::MissingHandler { .. })));
    }

    #[test]
    fn invalid_patterns() {
        assert!(matches!(Rule::new("no-slash"), Err(RouteError::InvalidPattern { .. })));
        assert!(matches!(Rule::new("/x/<int"), Err(RouteError::UnclosedPlaceholder { .. })));
    }

    #[test]
    fn websocket_upgrade_once() {
        let mut rule = Rule::new("/ws").unwrap();
        rule.websocket(|_req, _io| {}).unwrap();
        assert!(rule.is_upgrade());
        assert!(rule.validate().is_ok());
        assert!(matches!(
            rule.websocket(|_req, _io| {}),
            Err(RouteError::AlreadyUpgraded { .. })
        ));
    }

    #[test]
    fn methods_replace_default() {
        let mut rule = Rule::new("/m").unwrap();
        assert!(rule.method_set().contains(Method::Get));
        rule.methods([Method::Post, Method::Put]).name("m");
        assert!(!rule.method_set().contains(Method::Get));
        assert!(rule.method_set().contains(Method::Put));
        assert_eq!(rule.rule_name(), Some("m"));
    }
}
