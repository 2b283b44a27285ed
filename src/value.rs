//! Freeform values carried by declarations.
//!
//! `init`, `metadata` and `properties` are schema-free in a model file: a
//! camera takes a device path string, a stage takes a mapping of axis ranges,
//! a light takes a list of emission bands. [`Value`] keeps that flexibility
//! behind a closed set of variants, so consumers match on the shape they
//! expect instead of guessing at a dynamic type.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Mapping of string keys to values, as found under `init`, `metadata` and
/// `properties`.
pub type ValueMap = BTreeMap<String, Value>;

/// A scalar, sequence or mapping value from a parsed model document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    /// Explicit `null` (or `~` in YAML).
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Sequence(Vec<Value>),
    Mapping(ValueMap),
}

/// Failure to coerce text into the type of an existing value.
#[derive(Debug, Error, PartialEq)]
pub enum ValueError {
    #[error("Not a boolean value: '{0}'")]
    NotBoolean(String),
    #[error("Not an integer value: '{0}'")]
    NotInteger(String),
    #[error("Not a number: '{0}'")]
    NotFloat(String),
    #[error("Mapping entry '{0}' is not of the form key:value")]
    BadMappingEntry(String),
    #[error("Cannot convert '{0}' to a null value")]
    Unsupported(String),
}

impl Value {
    /// Short name of the variant, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Sequence(_) => "sequence",
            Value::Mapping(_) => "mapping",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view; integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&ValueMap> {
        match self {
            Value::Mapping(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Parse `text` into a value of the same type as `self`.
    ///
    /// Sequences are comma-separated and every item takes the type of the
    /// first element of `self` (strings when `self` is empty). Mappings are
    /// `key:value` pairs separated by commas, with exactly one `:` each; keys
    /// stay strings and values take the type of the first value in `self`.
    pub fn parse_like(&self, text: &str) -> Result<Value, ValueError> {
        match self {
            Value::Bool(_) => match text {
                "true" | "True" => Ok(Value::Bool(true)),
                "false" | "False" => Ok(Value::Bool(false)),
                _ => Err(ValueError::NotBoolean(text.to_string())),
            },
            Value::Int(_) => text
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| ValueError::NotInteger(text.to_string())),
            Value::Float(_) => text
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| ValueError::NotFloat(text.to_string())),
            Value::String(_) => Ok(Value::String(text.to_string())),
            Value::Sequence(items) => {
                let template = items.first().cloned().unwrap_or_else(|| {
                    warn!("Empty sequence, parsing '{}' as strings", text);
                    Value::String(String::new())
                });
                text.split(',')
                    .map(|item| template.parse_like(item))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Sequence)
            }
            Value::Mapping(map) => {
                let template = map.values().next().cloned().unwrap_or_else(|| {
                    warn!("Empty mapping, parsing '{}' values as strings", text);
                    Value::String(String::new())
                });
                let mut parsed = ValueMap::new();
                for entry in text.split(',') {
                    let parts: Vec<&str> = entry.split(':').collect();
                    let [key, value] = parts.as_slice() else {
                        return Err(ValueError::BadMappingEntry(entry.to_string()));
                    };
                    parsed.insert(key.to_string(), template.parse_like(value)?);
                }
                Ok(Value::Mapping(parsed))
            }
            Value::Null => Err(ValueError::Unsupported(text.to_string())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{}", s),
            Value::Sequence(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Mapping(map) => {
                write!(f, "{{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
        }
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
