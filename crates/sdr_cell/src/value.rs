//! Dynamic values and the type constraints cells declare over them.
//!
//! Remote state arrives untyped, so every cell stores a [`Value`] and carries
//! a [`ValueType`] that decides which values it admits. Scalars compare by
//! value; blocks and opaque host objects compare by identity.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::block::BlockRef;
use crate::error::CellError;

/// A host object carried through the graph without interpretation (for
/// example the audio analyser handed in by the embedding UI).
#[derive(Clone)]
pub struct Opaque {
    label: &'static str,
    inner: Rc<dyn Any>,
}

impl Opaque {
    /// Wrap a host object under a short label used in diagnostics.
    #[must_use]
    pub fn new<T: Any>(label: &'static str, value: T) -> Self {
        Self {
            label,
            inner: Rc::new(value),
        }
    }

    /// Returns the diagnostic label.
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Borrow the wrapped object if it is a `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }

    /// Identity comparison.
    #[must_use]
    pub fn ptr_eq(&self, other: &Opaque) -> bool {
        std::ptr::addr_eq(Rc::as_ptr(&self.inner), Rc::as_ptr(&other.inner))
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque({})", self.label)
    }
}

/// The value stored in a cell.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// No value (also the empty state of a composite slot).
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// An ordered sequence, used by index views.
    List(Vec<Value>),
    /// A composite of named child cells.
    Block(BlockRef),
    /// A host object compared by identity.
    Opaque(Opaque),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            // NaN == NaN so that re-publishing NaN is not a change.
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Block(a), Value::Block(b)) => a.ptr_eq(b),
            (Value::Opaque(a), Value::Opaque(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl Value {
    /// Short human-readable description used in error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => format!("bool {b}"),
            Value::Int(i) => format!("int {i}"),
            Value::Float(x) => format!("float {x}"),
            Value::Str(s) => format!("string {s:?}"),
            Value::List(items) => format!("list of {}", items.len()),
            Value::Block(block) => format!("block {}", block.kind()),
            Value::Opaque(o) => format!("opaque {}", o.label()),
        }
    }

    /// Numeric view of `Int` and `Float` values.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_block(&self) -> Option<&BlockRef> {
        match self {
            Value::Block(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Same identity for blocks and opaque objects. Scalars have no identity.
    #[must_use]
    pub fn same_identity(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Block(a), Value::Block(b)) => a.ptr_eq(b),
            (Value::Opaque(a), Value::Opaque(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Convert a JSON scalar or array into a value.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::TypeMismatch`] for JSON objects, which have no
    /// cell representation (composites travel as block descriptions).
    pub fn from_json(json: &serde_json::Value) -> Result<Value, CellError> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => Value::List(
                items
                    .iter()
                    .map(Value::from_json)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            serde_json::Value::Object(_) => {
                return Err(CellError::TypeMismatch {
                    expected: "scalar or list".to_string(),
                    found: "object".to_string(),
                });
            }
        })
    }

    /// Convert into JSON. Returns `None` for blocks, opaque objects and
    /// non-finite floats, none of which can be sent over the wire.
    #[must_use]
    pub fn to_json(&self) -> Option<serde_json::Value> {
        Some(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(x) => serde_json::Value::Number(serde_json::Number::from_f64(*x)?),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(
                items.iter().map(Value::to_json).collect::<Option<Vec<_>>>()?,
            ),
            Value::Block(_) | Value::Opaque(_) => return None,
        })
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<BlockRef> for Value {
    fn from(b: BlockRef) -> Self {
        Value::Block(b)
    }
}

// ── Constraints ─────────────────────────────────────────────────────────────

/// The declared constraint of a cell. Travels in state snapshots, so it is
/// serialisable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Any,
    Bool,
    Int,
    /// Floating point; integers are widened on admission.
    Float,
    Str,
    /// A numeric interval. Non-strict ranges describe the usual span but
    /// admit values outside it.
    Range {
        min: f64,
        max: f64,
        strict: bool,
        integer: bool,
    },
    /// One of a fixed set of strings.
    Enum { values: Vec<String> },
    /// A composite slot: a block, or null while unpopulated.
    Block,
    List,
    Opaque,
}

impl ValueType {
    /// A strict floating point range.
    #[must_use]
    pub fn range(min: f64, max: f64) -> Self {
        ValueType::Range {
            min,
            max,
            strict: true,
            integer: false,
        }
    }

    /// A floating point range that admits values outside `[min, max]`.
    #[must_use]
    pub fn loose_range(min: f64, max: f64) -> Self {
        ValueType::Range {
            min,
            max,
            strict: false,
            integer: false,
        }
    }

    /// A strict integer range.
    #[must_use]
    pub fn integer_range(min: i64, max: i64) -> Self {
        ValueType::Range {
            min: min as f64,
            max: max as f64,
            strict: true,
            integer: true,
        }
    }

    /// An enumeration of allowed strings.
    #[must_use]
    pub fn enumeration<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ValueType::Enum {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// The narrowest constraint describing an existing value.
    #[must_use]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueType::Any,
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Str(_) => ValueType::Str,
            Value::List(_) => ValueType::List,
            Value::Block(_) => ValueType::Block,
            Value::Opaque(_) => ValueType::Opaque,
        }
    }

    /// Whether cells of this type are traversed as composites.
    #[must_use]
    pub fn is_composite(&self) -> bool {
        matches!(self, ValueType::Block)
    }

    /// Admit `value` under this constraint, applying numeric widening.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::TypeMismatch`] if the value violates the
    /// constraint.
    pub fn admit(&self, value: Value) -> Result<Value, CellError> {
        match (self, value) {
            (ValueType::Any, v) => Ok(v),
            (ValueType::Bool, v @ Value::Bool(_)) => Ok(v),
            (ValueType::Int, v @ Value::Int(_)) => Ok(v),
            (ValueType::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (ValueType::Float, v @ Value::Float(_)) => Ok(v),
            (ValueType::Str, v @ Value::Str(_)) => Ok(v),
            (
                ValueType::Range {
                    min,
                    max,
                    strict,
                    integer,
                },
                v @ (Value::Int(_) | Value::Float(_)),
            ) => {
                let n = v.as_f64().unwrap_or(f64::NAN);
                if !n.is_finite() {
                    return Err(self.mismatch(&v));
                }
                // i64::MAX as f64 rounds up to 2^63, which is already out of range.
                if *integer && (n.fract() != 0.0 || n < i64::MIN as f64 || n >= i64::MAX as f64) {
                    return Err(self.mismatch(&v));
                }
                if *strict && !(*min <= n && n <= *max) {
                    return Err(self.mismatch(&v));
                }
                Ok(if *integer {
                    Value::Int(n as i64)
                } else {
                    Value::Float(n)
                })
            }
            (ValueType::Enum { values }, Value::Str(s)) if values.contains(&s) => Ok(Value::Str(s)),
            (ValueType::Block, v @ (Value::Block(_) | Value::Null)) => Ok(v),
            (ValueType::List, v @ Value::List(_)) => Ok(v),
            (ValueType::Opaque, v @ Value::Opaque(_)) => Ok(v),
            (_, v) => Err(self.mismatch(&v)),
        }
    }

    /// Check `value` without keeping the admitted form.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::TypeMismatch`] if the value violates the
    /// constraint.
    pub fn check(&self, value: &Value) -> Result<(), CellError> {
        self.admit(value.clone()).map(|_| ())
    }

    fn mismatch(&self, value: &Value) -> CellError {
        CellError::TypeMismatch {
            expected: self.to_string(),
            found: value.describe(),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Any => write!(f, "any"),
            ValueType::Bool => write!(f, "bool"),
            ValueType::Int => write!(f, "int"),
            ValueType::Float => write!(f, "float"),
            ValueType::Str => write!(f, "string"),
            ValueType::Range {
                min,
                max,
                strict,
                integer,
            } => {
                let kind = if *integer { "integer" } else { "number" };
                let bound = if *strict { "" } else { " (advisory)" };
                write!(f, "{kind} in [{min}, {max}]{bound}")
            }
            ValueType::Enum { values } => write!(f, "one of {}", values.join(", ")),
            ValueType::Block => write!(f, "block"),
            ValueType::List => write!(f, "list"),
            ValueType::Opaque => write!(f, "opaque"),
        }
    }
}
