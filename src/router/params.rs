//! Route placeholders, the values they capture, and typed extraction.
//!
//! A route pattern such as `/tx/<string>/<uint>` has the signature
//! `[String, Uint]`. The trie fills a [`RoutingParams`] while matching, one
//! sequence per value kind, and the matched rule reads them back
//! positionally using that signature.

use std::fmt;

use super::RouteError;

/// Placeholder kinds, in the order the trie tries them when matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
    Int = 1,
    Uint = 2,
    Double = 3,
    String = 4,
    Path = 5,
}

impl ParamType {
    /// Recognized placeholder spellings.
    pub(crate) const TOKENS: [(&'static str, ParamType); 7] = [
        ("<int>", ParamType::Int),
        ("<uint>", ParamType::Uint),
        ("<float>", ParamType::Double),
        ("<double>", ParamType::Double),
        ("<str>", ParamType::String),
        ("<string>", ParamType::String),
        ("<path>", ParamType::Path),
    ];

    /// Slot in a trie node's typed-children array.
    pub(crate) fn slot(self) -> usize {
        self as usize - 1
    }

    /// Matches a placeholder token at the start of `s`.
    pub(crate) fn match_token(s: &str) -> Option<(ParamType, usize)> {
        Self::TOKENS
            .iter()
            .find(|(token, _)| s.starts_with(token))
            .map(|(token, ty)| (*ty, token.len()))
    }

    /// The kind of value this placeholder captures.
    pub fn kind(self) -> ValueKind {
        match self {
            ParamType::Int => ValueKind::Int,
            ParamType::Uint => ValueKind::Uint,
            ParamType::Double => ValueKind::Double,
            ParamType::String | ParamType::Path => ValueKind::String,
        }
    }
}

/// Parses the placeholder signature of `pattern`.
///
/// # Errors
///
/// [`RouteError::UnclosedPlaceholder`] when a `<` has no matching `>`, and
/// [`RouteError::UnknownPlaceholder`] for a tag outside the supported set.
///
/// ```
/// use corvid::router::params::{signature, ParamType};
///
/// assert_eq!(
///     signature("/tx/<string>/<uint>").unwrap(),
///     vec![ParamType::String, ParamType::Uint],
/// );
/// assert!(signature("/broken/<int").is_err());
/// ```
pub fn signature(pattern: &str) -> Result<Vec<ParamType>, RouteError> {
    let mut sig = Vec::new();
    let mut rest = pattern;
    while let Some(start) = rest.find('<') {
        let tail = &rest[start..];
        let Some(end) = tail.find('>') else {
            return Err(RouteError::UnclosedPlaceholder {
                pattern: pattern.to_owned(),
            });
        };
        let (ty, len) = ParamType::match_token(tail).ok_or_else(|| RouteError::UnknownPlaceholder {
            pattern: pattern.to_owned(),
            tag: tail[..=end].to_owned(),
        })?;
        sig.push(ty);
        rest = &tail[len..];
    }
    Ok(sig)
}

/// The four value sequences a handler can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Int,
    Uint,
    Double,
    String,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueKind::Int => "int",
            ValueKind::Uint => "uint",
            ValueKind::Double => "double",
            ValueKind::String => "string",
        })
    }
}

/// A single captured route parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Uint(u64),
    Double(f64),
    String(String),
}

impl Value {
    /// The kind tag a handler argument must declare to accept this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Int,
            Value::Uint(_) => ValueKind::Uint,
            Value::Double(_) => ValueKind::Double,
            Value::String(_) => ValueKind::String,
        }
    }

    /// The integer, if this is [`Value::Int`].
    ///
    /// # Examples
    ///
    /// ```
    /// use corvid::router::Value;
    ///
    /// assert_eq!(Value::Int(-3).as_i64(), Some(-3));
    /// assert_eq!(Value::Uint(3).as_i64(), None);
    /// ```
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The unsigned integer, if this is [`Value::Uint`].
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    /// The float, if this is [`Value::Double`].
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// The text, if this is [`Value::String`]. `<path>` captures land here too.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }
}

/// Parameters captured by one trie match, grouped by kind in match order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingParams {
    pub ints: Vec<i64>,
    pub uints: Vec<u64>,
    pub doubles: Vec<f64>,
    pub strings: Vec<String>,
}

impl RoutingParams {
    /// Returns `true` if nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.ints.is_empty()
            && self.uints.is_empty()
            && self.doubles.is_empty()
            && self.strings.is_empty()
    }

    /// Rebuilds the positional value list for a route signature.
    ///
    /// Returns `None` if the captured counts do not fit the signature.
    pub fn to_values(&self, sig: &[ParamType]) -> Option<Vec<Value>> {
        let mut cursor = ParamCursor::new(self);
        sig.iter().map(|ty| cursor.next(ty.kind())).collect()
    }
}

/// Reads values out of a [`RoutingParams`] in order, one sequence per kind.
#[derive(Debug)]
pub struct ParamCursor<'a> {
    params: &'a RoutingParams,
    ints: usize,
    uints: usize,
    doubles: usize,
    strings: usize,
}

impl<'a> ParamCursor<'a> {
    /// Starts at the first value of every kind.
    pub fn new(params: &'a RoutingParams) -> Self {
        Self {
            params,
            ints: 0,
            uints: 0,
            doubles: 0,
            strings: 0,
        }
    }

    /// Takes the next value of `kind`.
    pub fn next(&mut self, kind: ValueKind) -> Option<Value> {
        let p = self.params;
        let value = match kind {
            ValueKind::Int => Value::Int(*p.ints.get(self.ints)?),
            ValueKind::Uint => Value::Uint(*p.uints.get(self.uints)?),
            ValueKind::Double => Value::Double(*p.doubles.get(self.doubles)?),
            ValueKind::String => Value::String(p.strings.get(self.strings)?.clone()),
        };
        match kind {
            ValueKind::Int => self.ints += 1,
            ValueKind::Uint => self.uints += 1,
            ValueKind::Double => self.doubles += 1,
            ValueKind::String => self.strings += 1,
        }
        Some(value)
    }
}

/// A handler argument type that can be filled from a captured parameter.
///
/// `KIND` is compared against the route signature when the handler is
/// attached, so a mismatch is reported at registration, not per request.
pub trait FromParam: Sized {
    const KIND: ValueKind;

    /// Converts a captured value; `None` if it is the wrong kind or out of range.
    fn from_value(value: Value) -> Option<Self>;
}

macro_rules! from_param_int {
    ($kind:ident, $variant:ident, $($ty:ty),+) => {
        $(
            impl FromParam for $ty {
                const KIND: ValueKind = ValueKind::$kind;

                fn from_value(value: Value) -> Option<Self> {
                    match value {
                        Value::$variant(v) => <$ty>::try_from(v).ok(),
                        _ => None,
                    }
                }
            }
        )+
    };
}

from_param_int!(Int, Int, i64, i32, i16, i8, isize);
from_param_int!(Uint, Uint, u64, u32, u16, u8, usize);

impl FromParam for f64 {
    const KIND: ValueKind = ValueKind::Double;

    fn from_value(value: Value) -> Option<Self> {
        value.as_f64()
    }
}

impl FromParam for f32 {
    const KIND: ValueKind = ValueKind::Double;

    fn from_value(value: Value) -> Option<Self> {
        value.as_f64().map(|v| v as f32)
    }
}

impl FromParam for String {
    const KIND: ValueKind = ValueKind::String;

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}
