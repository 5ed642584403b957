//! Typed task arguments and results
//!
//! Signatures carry their arguments as `{Type, Value}` pairs where `Type`
//! is a textual type name from a closed set and `Value` is the generic
//! JSON form. Decoding turns a pair into a [`Value`] with width checks;
//! [`coerce`] adapts decoded values to a handler's declared parameter
//! types through an explicit conversion table. No runtime reflection of
//! user types is involved.

use serde::{Deserialize, Serialize};

use crate::error::{TaskError, TaskResult};

/// Scalar kinds an argument or result may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    Bool,
    String,
}

impl Kind {
    /// Parse a wire type name into a kind
    pub fn parse(name: &str) -> TaskResult<Self> {
        match name {
            "int" => Ok(Kind::Int),
            "int8" => Ok(Kind::Int8),
            "int16" => Ok(Kind::Int16),
            "int32" => Ok(Kind::Int32),
            "int64" => Ok(Kind::Int64),
            "uint" => Ok(Kind::Uint),
            "uint8" => Ok(Kind::Uint8),
            "uint16" => Ok(Kind::Uint16),
            "uint32" => Ok(Kind::Uint32),
            "uint64" => Ok(Kind::Uint64),
            "float32" => Ok(Kind::Float32),
            "float64" => Ok(Kind::Float64),
            "bool" => Ok(Kind::Bool),
            "string" => Ok(Kind::String),
            other => Err(TaskError::coercion(format!("unknown type name: {other}"))),
        }
    }

    /// Wire name of this kind
    pub fn name(&self) -> &'static str {
        match self {
            Kind::Int => "int",
            Kind::Int8 => "int8",
            Kind::Int16 => "int16",
            Kind::Int32 => "int32",
            Kind::Int64 => "int64",
            Kind::Uint => "uint",
            Kind::Uint8 => "uint8",
            Kind::Uint16 => "uint16",
            Kind::Uint32 => "uint32",
            Kind::Uint64 => "uint64",
            Kind::Float32 => "float32",
            Kind::Float64 => "float64",
            Kind::Bool => "bool",
            Kind::String => "string",
        }
    }
}

/// Type descriptor: a scalar kind or a one-level slice of one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeDesc {
    Scalar(Kind),
    Slice(Kind),
}

impl TypeDesc {
    /// Parse a wire type name, e.g. `"int64"` or `"[]string"`
    pub fn parse(name: &str) -> TaskResult<Self> {
        match name.strip_prefix("[]") {
            Some(elem) => Ok(TypeDesc::Slice(Kind::parse(elem)?)),
            None => Ok(TypeDesc::Scalar(Kind::parse(name)?)),
        }
    }

    /// Wire name of this descriptor
    pub fn name(&self) -> String {
        match self {
            TypeDesc::Scalar(kind) => kind.name().to_string(),
            TypeDesc::Slice(kind) => format!("[]{}", kind.name()),
        }
    }
}

/// A decoded dynamic value
///
/// Integer widths collapse into the widest signed/unsigned families once
/// the declared width has been checked; the declared kind still governs
/// later coercions through [`coerce`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Bool(bool),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    /// Read the value as a signed integer
    pub fn as_i64(&self) -> TaskResult<i64> {
        match self {
            Value::Signed(v) => Ok(*v),
            Value::Unsigned(v) if *v <= i64::MAX as u64 => Ok(*v as i64),
            other => Err(TaskError::coercion(format!("not a signed integer: {other:?}"))),
        }
    }

    /// Read the value as an unsigned integer
    pub fn as_u64(&self) -> TaskResult<u64> {
        match self {
            Value::Unsigned(v) => Ok(*v),
            Value::Signed(v) if *v >= 0 => Ok(*v as u64),
            other => Err(TaskError::coercion(format!("not an unsigned integer: {other:?}"))),
        }
    }

    /// Read the value as a float
    pub fn as_f64(&self) -> TaskResult<f64> {
        match self {
            Value::Float(v) => Ok(*v),
            Value::Signed(v) => Ok(*v as f64),
            Value::Unsigned(v) => Ok(*v as f64),
            other => Err(TaskError::coercion(format!("not a float: {other:?}"))),
        }
    }

    /// Read the value as a bool
    pub fn as_bool(&self) -> TaskResult<bool> {
        match self {
            Value::Bool(v) => Ok(*v),
            other => Err(TaskError::coercion(format!("not a bool: {other:?}"))),
        }
    }

    /// Read the value as a string slice
    pub fn as_str(&self) -> TaskResult<&str> {
        match self {
            Value::Text(v) => Ok(v),
            other => Err(TaskError::coercion(format!("not a string: {other:?}"))),
        }
    }

    /// Read the value as a list
    pub fn as_list(&self) -> TaskResult<&[Value]> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(TaskError::coercion(format!("not a slice: {other:?}"))),
        }
    }
}

/// A `{Type, Value}` pair as carried on the wire, used for both signature
/// arguments and task results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    #[serde(rename = "Type")]
    pub type_name: String,
    #[serde(rename = "Value")]
    pub value: serde_json::Value,
}

impl TypedValue {
    /// Create a typed value from a wire type name and a JSON value
    pub fn new(type_name: &str, value: serde_json::Value) -> Self {
        Self {
            type_name: type_name.to_string(),
            value,
        }
    }

    /// Create an `int64` value
    pub fn int64(v: i64) -> Self {
        Self::new("int64", serde_json::json!(v))
    }

    /// Create a `uint64` value
    pub fn uint64(v: u64) -> Self {
        Self::new("uint64", serde_json::json!(v))
    }

    /// Create a `float64` value
    pub fn float64(v: f64) -> Self {
        Self::new("float64", serde_json::json!(v))
    }

    /// Create a `bool` value
    pub fn boolean(v: bool) -> Self {
        Self::new("bool", serde_json::json!(v))
    }

    /// Create a `string` value
    pub fn string(v: &str) -> Self {
        Self::new("string", serde_json::json!(v))
    }

    /// Create an `[]int64` value
    pub fn int64_slice(v: &[i64]) -> Self {
        Self::new("[]int64", serde_json::json!(v))
    }

    /// Create a `[]string` value
    pub fn string_slice(v: &[&str]) -> Self {
        Self::new("[]string", serde_json::json!(v))
    }

    /// Decode the wire pair into a dynamic value, checking the declared
    /// type
    pub fn decode(&self) -> TaskResult<Value> {
        let desc = TypeDesc::parse(&self.type_name)?;
        decode(desc, &self.value)
    }
}

/// Decode a generic JSON value against a type descriptor
pub fn decode(desc: TypeDesc, raw: &serde_json::Value) -> TaskResult<Value> {
    match desc {
        TypeDesc::Scalar(kind) => decode_scalar(kind, raw),
        TypeDesc::Slice(kind) => {
            let items = raw.as_array().ok_or_else(|| {
                TaskError::coercion(format!("cannot decode {raw} as []{}", kind.name()))
            })?;
            let decoded = items
                .iter()
                .map(|item| decode_scalar(kind, item))
                .collect::<TaskResult<Vec<Value>>>()?;
            Ok(Value::List(decoded))
        }
    }
}

fn decode_scalar(kind: Kind, raw: &serde_json::Value) -> TaskResult<Value> {
    let fail = || TaskError::coercion(format!("cannot decode {raw} as {}", kind.name()));

    match kind {
        Kind::Int | Kind::Int8 | Kind::Int16 | Kind::Int32 | Kind::Int64 => {
            let v = raw.as_i64().ok_or_else(fail)?;
            if !signed_fits(v, kind) {
                return Err(fail());
            }
            Ok(Value::Signed(v))
        }
        Kind::Uint | Kind::Uint8 | Kind::Uint16 | Kind::Uint32 | Kind::Uint64 => {
            let v = raw.as_u64().ok_or_else(fail)?;
            if !unsigned_fits(v, kind) {
                return Err(fail());
            }
            Ok(Value::Unsigned(v))
        }
        Kind::Float32 => {
            let v = raw.as_f64().ok_or_else(fail)?;
            if v.abs() > f32::MAX as f64 {
                return Err(fail());
            }
            // The declared width is f32; keep the value at f32 precision.
            Ok(Value::Float((v as f32) as f64))
        }
        Kind::Float64 => Ok(Value::Float(raw.as_f64().ok_or_else(fail)?)),
        Kind::Bool => Ok(Value::Bool(raw.as_bool().ok_or_else(fail)?)),
        Kind::String => Ok(Value::Text(raw.as_str().ok_or_else(fail)?.to_string())),
    }
}

/// Adapt a decoded value to a target type descriptor.
///
/// Numeric conversions are permitted only when the target kind losslessly
/// represents the source value; strings convert to strings, bools to
/// bools, slices element-wise. Everything else is a coercion error.
pub fn coerce(value: &Value, desc: TypeDesc) -> TaskResult<Value> {
    match desc {
        TypeDesc::Scalar(kind) => coerce_scalar(value, kind),
        TypeDesc::Slice(kind) => match value {
            Value::List(items) => {
                let coerced = items
                    .iter()
                    .map(|item| coerce_scalar(item, kind))
                    .collect::<TaskResult<Vec<Value>>>()?;
                Ok(Value::List(coerced))
            }
            other => Err(TaskError::coercion(format!(
                "cannot convert {other:?} to []{}",
                kind.name()
            ))),
        },
    }
}

fn coerce_scalar(value: &Value, kind: Kind) -> TaskResult<Value> {
    let fail = || {
        TaskError::coercion(format!(
            "cannot convert {value:?} to {} without losing information",
            kind.name()
        ))
    };

    match kind {
        Kind::Int | Kind::Int8 | Kind::Int16 | Kind::Int32 | Kind::Int64 => {
            let v = match value {
                Value::Signed(v) => *v,
                Value::Unsigned(v) if *v <= i64::MAX as u64 => *v as i64,
                Value::Float(f) if f.fract() == 0.0 && in_i64_range(*f) => *f as i64,
                _ => return Err(fail()),
            };
            if !signed_fits(v, kind) {
                return Err(fail());
            }
            Ok(Value::Signed(v))
        }
        Kind::Uint | Kind::Uint8 | Kind::Uint16 | Kind::Uint32 | Kind::Uint64 => {
            let v = match value {
                Value::Unsigned(v) => *v,
                Value::Signed(v) if *v >= 0 => *v as u64,
                Value::Float(f) if f.fract() == 0.0 && *f >= 0.0 && *f <= u64::MAX as f64 => {
                    *f as u64
                }
                _ => return Err(fail()),
            };
            if !unsigned_fits(v, kind) {
                return Err(fail());
            }
            Ok(Value::Unsigned(v))
        }
        Kind::Float32 => {
            let v = numeric_as_f64(value).ok_or_else(fail)?;
            if (v as f32) as f64 != v {
                return Err(fail());
            }
            Ok(Value::Float(v))
        }
        Kind::Float64 => {
            let v = match value {
                Value::Float(f) => *f,
                Value::Signed(i) if (*i as f64) as i64 == *i => *i as f64,
                Value::Unsigned(u) if (*u as f64) as u64 == *u => *u as f64,
                _ => return Err(fail()),
            };
            Ok(Value::Float(v))
        }
        Kind::Bool => match value {
            Value::Bool(v) => Ok(Value::Bool(*v)),
            _ => Err(fail()),
        },
        Kind::String => match value {
            Value::Text(v) => Ok(Value::Text(v.clone())),
            _ => Err(fail()),
        },
    }
}

fn numeric_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Float(f) => Some(*f),
        Value::Signed(i) if (*i as f64) as i64 == *i => Some(*i as f64),
        Value::Unsigned(u) if (*u as f64) as u64 == *u => Some(*u as f64),
        _ => None,
    }
}

fn in_i64_range(f: f64) -> bool {
    f >= i64::MIN as f64 && f < i64::MAX as f64
}

fn signed_fits(v: i64, kind: Kind) -> bool {
    match kind {
        Kind::Int8 => v >= i8::MIN as i64 && v <= i8::MAX as i64,
        Kind::Int16 => v >= i16::MIN as i64 && v <= i16::MAX as i64,
        Kind::Int32 => v >= i32::MIN as i64 && v <= i32::MAX as i64,
        _ => true,
    }
}

fn unsigned_fits(v: u64, kind: Kind) -> bool {
    match kind {
        Kind::Uint8 => v <= u8::MAX as u64,
        Kind::Uint16 => v <= u16::MAX as u64,
        Kind::Uint32 => v <= u32::MAX as u64,
        _ => true,
    }
}
