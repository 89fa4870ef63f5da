//! Values flowing through stateful function calls.

use std::collections::BTreeMap;
use std::fmt::Display;

use num::ToPrimitive;
use serde::Deserialize;
use serde::Serialize;

/// A single datum handed to or returned from a function.
///
/// Integer widths collapse into [`Value::Int`] and float widths into
/// [`Value::Float`] on the way in; the `From` impls do the widening.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(#[serde(with = "float_repr")] f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric coercion used when folding values into accumulators.
    ///
    /// Only numbers coerce; strings and bools do not.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => i.to_f64(),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Strict integer conversion.
    ///
    /// Floats convert only if they hold an integral value that fits.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => f.to_i64(),
            _ => None,
        }
    }
}

/// Serde representation of an `f64` that survives JSON.
///
/// Finite values are plain numbers. `NaN` and the infinities are
/// written as the strings `"NaN"`, `"inf"` and `"-inf"`, since JSON
/// has no literal for them.
pub(crate) mod float_repr {
    use serde::de::Error;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub(crate) fn serialize<S: Serializer>(x: &f64, s: S) -> Result<S::Ok, S::Error> {
        if x.is_nan() {
            s.serialize_str("NaN")
        } else if *x == f64::INFINITY {
            s.serialize_str("inf")
        } else if *x == f64::NEG_INFINITY {
            s.serialize_str("-inf")
        } else {
            s.serialize_f64(*x)
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Special(String),
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        match Repr::deserialize(d)? {
            Repr::Number(x) => Ok(x),
            Repr::Special(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("invalid float {other:?}"))),
            },
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Object(fields) => {
                f.write_str("{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::Int(i64::from(v))
                }
            }
        )*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[test]
fn numeric_widths_coerce() {
    assert_eq!(Value::from(3i32).as_f64(), Some(3.0));
    assert_eq!(Value::from(3i64).as_f64(), Some(3.0));
    assert_eq!(Value::from(1.5f32).as_f64(), Some(1.5));
    assert_eq!(Value::from("3").as_f64(), None);
    assert_eq!(Value::from(true).as_f64(), None);
}

#[test]
fn strict_int_rejects_fractions() {
    assert_eq!(Value::from(4.0).as_i64(), Some(4));
    assert_eq!(Value::from(4.5).as_i64(), None);
    assert_eq!(Value::from(f64::NAN).as_i64(), None);
    assert_eq!(Value::from("4").as_i64(), None);
}

#[test]
fn display_nested() {
    let v = Value::Array(vec![1.into(), "a".into(), Value::Null]);
    assert_eq!(v.to_string(), r#"[1, "a", null]"#);
}

#[test]
fn non_finite_floats_survive_json() {
    for x in [f64::INFINITY, f64::NEG_INFINITY, 1e308, -0.5] {
        let bytes = serde_json::to_vec(&Value::Float(x)).expect("encode");
        let back: Value = serde_json::from_slice(&bytes).expect("decode");
        assert_eq!(back, Value::Float(x));
    }

    let bytes = serde_json::to_vec(&Value::Float(f64::NAN)).expect("encode");
    assert_eq!(bytes, br#"{"Float":"NaN"}"#);
    let back: Value = serde_json::from_slice(&bytes).expect("decode");
    assert!(matches!(back, Value::Float(x) if x.is_nan()));

    let bad: Result<Value, _> = serde_json::from_slice(br#"{"Float":"huge"}"#);
    assert!(bad.is_err());
}
