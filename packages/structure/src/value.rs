//! The Value type - an object graph that can cross the process boundary.
//!
//! Unlike a plain tree, a `Value` graph can share nodes and contain cycles:
//! containers are reference-counted handles, and the identity of a handle
//! (its allocation) is what the codec uses to detect revisits.
//!
//! # Design Notes
//!
//! - Containers that can be mutated after creation (`Array`, `Object`,
//!   `Buffer`, `Map`, `Set`) are [`Shared`] handles; this is what makes
//!   cycles expressible.
//! - `Date`, `RegExp` and `Error` are immutable once created, so they are
//!   plain `Arc`s. They still have identity.
//! - Objects use `BTreeMap` for deterministic ordering; key order carries no
//!   meaning on the wire.
//! - Reference cycles are never collected. Break them (e.g. clear a field)
//!   when a cyclic graph must be freed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use parking_lot::{Mutex, MutexGuard};

use crate::buffer::Buffer;
use crate::channel::MessagePort;

/// A reference-counted, interior-mutable node of a value graph.
pub struct Shared<T>(Arc<Mutex<T>>);

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(Mutex::new(value)))
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock()
    }

    /// Whether both handles point at the same node.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Stable identity key of the node for the lifetime of the handle.
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl<T: Clone> Shared<T> {
    /// Copy of the current contents.
    pub fn snapshot(&self) -> T {
        self.0.lock().clone()
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Keyed record with unique string keys.
pub type Object = BTreeMap<String, Value>;

/// A regular expression, carried as its source and flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegExp {
    pub source: String,
    pub flags: String,
}

impl RegExp {
    pub fn new(source: impl Into<String>, flags: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            flags: flags.into(),
        }
    }
}

/// The built-in error kinds an error can be reconstructed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Error,
    EvalError,
    RangeError,
    ReferenceError,
    SyntaxError,
    TypeError,
    UriError,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::EvalError => "EvalError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::UriError => "URIError",
        }
    }

    /// Closest built-in kind for an error name; unknown names map to `Error`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "EvalError" => ErrorKind::EvalError,
            "RangeError" => ErrorKind::RangeError,
            "ReferenceError" => ErrorKind::ReferenceError,
            "SyntaxError" => ErrorKind::SyntaxError,
            "TypeError" => ErrorKind::TypeError,
            "URIError" => ErrorKind::UriError,
            _ => ErrorKind::Error,
        }
    }
}

/// An error object.
///
/// `name` may hold any string when sending; decoding only recovers the
/// built-in kinds, so custom names come back as `"Error"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    pub name: String,
    pub message: Option<String>,
    pub stack: Option<String>,
}

impl ErrorValue {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            name: kind.name().to_string(),
            message: Some(message.into()),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_name(&self.name)
    }
}

/// Any datum that can be passed across the boundary.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    BigInt(BigInt),
    Array(Shared<Vec<Value>>),
    Object(Shared<Object>),
    Buffer(Shared<Buffer>),
    Date(Arc<DateTime<Utc>>),
    RegExp(Arc<RegExp>),
    /// Ordered entries; keys may be any value.
    Map(Shared<Vec<(Value, Value)>>),
    Set(Shared<Vec<Value>>),
    Error(Arc<ErrorValue>),
    Port(MessagePort),
}

impl Value {
    pub fn array(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Array(Shared::new(items.into_iter().collect()))
    }

    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(Shared::new(
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn map(entries: impl IntoIterator<Item = (Value, Value)>) -> Self {
        Value::Map(Shared::new(entries.into_iter().collect()))
    }

    pub fn set(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Set(Shared::new(items.into_iter().collect()))
    }

    pub fn date(at: DateTime<Utc>) -> Self {
        Value::Date(Arc::new(at))
    }

    /// Primitives are copied by value and never enter a refs table.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Value::Undefined | Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
        )
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_port(&self) -> Option<&MessagePort> {
        match self {
            Value::Port(p) => Some(p),
            _ => None,
        }
    }

    /// Field `key` of an object.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Value::Object(o) => o.lock().get(key).cloned(),
            _ => None,
        }
    }

    /// Element `index` of an array.
    pub fn at(&self, index: usize) -> Option<Value> {
        match self {
            Value::Array(a) => a.lock().get(index).cloned(),
            _ => None,
        }
    }

    /// Identity key of reference kinds; `None` for primitives and BigInt.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::Array(a) => Some(a.addr()),
            Value::Object(o) => Some(o.addr()),
            Value::Buffer(b) => Some(b.addr()),
            Value::Date(d) => Some(Arc::as_ptr(d) as *const () as usize),
            Value::RegExp(r) => Some(Arc::as_ptr(r) as *const () as usize),
            Value::Map(m) => Some(m.addr()),
            Value::Set(s) => Some(s.addr()),
            Value::Error(e) => Some(Arc::as_ptr(e) as *const () as usize),
            Value::Port(p) => Some(p.addr()),
            _ => None,
        }
    }

    /// Whether both values are the same node of a graph.
    pub fn ptr_eq(&self, other: &Value) -> bool {
        match (self.identity(), other.identity()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn debug(&self, f: &mut fmt::Formatter<'_>, stack: &mut Vec<usize>) -> fmt::Result {
        if let Some(id) = self.identity() {
            if stack.contains(&id) {
                return f.write_str("<cycle>");
            }
            stack.push(id);
        }
        let result = match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", s),
            Value::BigInt(n) => write!(f, "{}n", n),
            Value::Array(a) => {
                let items = a.snapshot();
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    item.debug(f, stack)?;
                }
                f.write_str("]")
            }
            Value::Object(o) => {
                let fields = o.snapshot();
                f.write_str("{")?;
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: ", key)?;
                    value.debug(f, stack)?;
                }
                f.write_str("}")
            }
            Value::Buffer(b) => {
                let b = b.lock();
                write!(f, "{:?}({} bytes)", b.kind(), b.bytes().len())
            }
            Value::Date(d) => write!(f, "Date({})", d.to_rfc3339()),
            Value::RegExp(r) => write!(f, "/{}/{}", r.source, r.flags),
            Value::Map(m) => {
                let entries = m.snapshot();
                f.write_str("Map{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    key.debug(f, stack)?;
                    f.write_str(" => ")?;
                    value.debug(f, stack)?;
                }
                f.write_str("}")
            }
            Value::Set(s) => {
                let items = s.snapshot();
                f.write_str("Set{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    item.debug(f, stack)?;
                }
                f.write_str("}")
            }
            Value::Error(e) => write!(
                f,
                "{}({:?})",
                e.name,
                e.message.as_deref().unwrap_or_default()
            ),
            Value::Port(p) => write!(f, "MessagePort({})", p.channel_id()),
        };
        if self.identity().is_some() {
            stack.pop();
        }
        result
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.debug(f, &mut Vec::new())
    }
}

/// Structural equality with an identity short-circuit.
///
/// Comparing two distinct cyclic graphs does not terminate; use
/// [`Value::ptr_eq`] to check cycle structure.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a.snapshot() == b.snapshot(),
            (Value::Object(a), Value::Object(b)) => a.snapshot() == b.snapshot(),
            (Value::Buffer(a), Value::Buffer(b)) => a.snapshot() == b.snapshot(),
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::RegExp(a), Value::RegExp(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a.snapshot() == b.snapshot(),
            (Value::Set(a), Value::Set(b)) => a.snapshot() == b.snapshot(),
            (Value::Error(a), Value::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n.into())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<BigInt> for Value {
    fn from(n: BigInt) -> Self {
        Value::BigInt(n)
    }
}

impl From<Buffer> for Value {
    fn from(b: Buffer) -> Self {
        Value::Buffer(Shared::new(b))
    }
}

impl From<RegExp> for Value {
    fn from(r: RegExp) -> Self {
        Value::RegExp(Arc::new(r))
    }
}

impl From<ErrorValue> for Value {
    fn from(e: ErrorValue) -> Self {
        Value::Error(Arc::new(e))
    }
}

impl From<MessagePort> for Value {
    fn from(p: MessagePort) -> Self {
        Value::Port(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_are_primitive() {
        assert!(Value::Undefined.is_primitive());
        assert!(Value::from("s").is_primitive());
        assert!(!Value::BigInt(1.into()).is_primitive());
        assert!(!Value::array([]).is_primitive());
    }

    #[test]
    fn clones_share_identity() {
        let a = Value::object([("x", Value::from(1))]);
        let b = a.clone();
        let c = Value::object([("x", Value::from(1))]);
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(a, c);
    }

    #[test]
    fn error_kind_lookup_falls_back() {
        assert_eq!(ErrorKind::from_name("TypeError"), ErrorKind::TypeError);
        assert_eq!(ErrorKind::from_name("URIError"), ErrorKind::UriError);
        assert_eq!(ErrorKind::from_name("MyCustomError"), ErrorKind::Error);
    }

    #[test]
    fn debug_stops_at_cycles() {
        let list = Value::array([Value::from(1)]);
        if let Value::Array(items) = &list {
            items.lock().push(list.clone());
        }
        assert_eq!(format!("{:?}", list), "[1, <cycle>]");
    }

    #[test]
    fn map_equality_is_ordered_and_structural() {
        let a = Value::map([(Value::from("k"), Value::from(1))]);
        let b = Value::map([(Value::from("k"), Value::from(1))]);
        assert_eq!(a, b);
        let c = Value::map([(Value::from("k"), Value::from(2))]);
        assert_ne!(a, c);
    }
}
