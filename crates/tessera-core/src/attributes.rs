//! Kernel attribute payloads.
//!
//! Attributes arrive as a string-keyed map when a kernel instance is created.
//! Each kernel family parses them into its own typed value on first
//! invocation.

use crate::error::{Error, Result};
use std::collections::HashMap;

/// Create an [`Attributes`] map with key-value pairs.
///
/// # Example
/// ```ignore
/// let attrs = attrs! {
///     "axis" => -1,
///     "epsilon" => 1e-5,
/// };
/// ```
#[macro_export]
macro_rules! attrs {
    ($($key:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut map = $crate::Attributes::new();
        $(
            map.insert($key.to_string(), $value.into());
        )*
        map
    }};
}

/// Raw attribute payload.
pub type Attributes = HashMap<String, AttributeValue>;

/// Attribute value types
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
}

impl AttributeValue {
    /// Convert to f64 if possible
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        self.as_f64().map(|f| f as f32)
    }

    /// Convert to i64 if possible. Floats are only accepted when integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Self::Ints(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn as_floats(&self) -> Option<&[f64]> {
        match self {
            Self::Floats(v) => Some(v.as_slice()),
            _ => None,
        }
    }
}

impl From<f64> for AttributeValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<f32> for AttributeValue {
    fn from(f: f32) -> Self {
        Self::Float(f as f64)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for AttributeValue {
    fn from(i: i32) -> Self {
        Self::Int(i as i64)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<Vec<i64>> for AttributeValue {
    fn from(v: Vec<i64>) -> Self {
        Self::Ints(v)
    }
}

impl From<Vec<f64>> for AttributeValue {
    fn from(v: Vec<f64>) -> Self {
        Self::Floats(v)
    }
}

/// Helper to get a required attribute
pub fn get_attr<T>(
    attrs: &Attributes,
    name: &str,
    convert: impl FnOnce(&AttributeValue) -> Option<T>,
) -> Result<T> {
    attrs
        .get(name)
        .ok_or_else(|| Error::MissingAttribute(name.to_string()))
        .and_then(|v| {
            convert(v)
                .ok_or_else(|| Error::InvalidAttribute(name.to_string(), format!("{:?}", v)))
        })
}

/// Helper to get an optional attribute with default
pub fn get_attr_or<T>(
    attrs: &Attributes,
    name: &str,
    default: T,
    convert: impl FnOnce(&AttributeValue) -> Option<T>,
) -> T {
    attrs.get(name).and_then(convert).unwrap_or(default)
}
