//! Universal value and schema types shared by every source adapter
//!
//! Physical sources produce rows of [`Value`]s typed per physical column;
//! the adapter layer coerces them into the declared [`LogicalType`] of the
//! federated schema.

use std::cmp::Ordering;
use std::fmt;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Universal value representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
    Array(Vec<Value>),
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short type label used in log lines and conversion errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Json(_) => "json",
            Value::Array(_) => "array",
        }
    }

    /// Converts this value into the given logical type.
    ///
    /// `Null` converts to `Null` for every type. Lossy conversions (a
    /// fractional float into an integer, non-UTF-8 bytes into text) fail.
    pub fn coerce(&self, target: LogicalType) -> EngineResult<Value> {
        let fail = || {
            EngineError::type_conversion(
                target.as_str(),
                format!("cannot convert {} value {} to {}", self.type_name(), self, target),
            )
        };

        let converted = match (target, self) {
            (_, Value::Null) => Value::Null,

            (LogicalType::Boolean, Value::Bool(b)) => Value::Bool(*b),
            (LogicalType::Boolean, Value::Int(0)) => Value::Bool(false),
            (LogicalType::Boolean, Value::Int(1)) => Value::Bool(true),
            (LogicalType::Boolean, Value::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" | "yes" => Value::Bool(true),
                "false" | "f" | "0" | "no" => Value::Bool(false),
                _ => return Err(fail()),
            },

            (LogicalType::Integer, Value::Int(i)) => Value::Int(*i),
            (LogicalType::Integer, Value::Bool(b)) => Value::Int(i64::from(*b)),
            (LogicalType::Integer, Value::Float(f)) => {
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Value::Int(*f as i64)
                } else {
                    return Err(fail());
                }
            }
            (LogicalType::Integer, Value::Text(s)) => {
                Value::Int(s.trim().parse::<i64>().map_err(|_| fail())?)
            }

            (LogicalType::Double, Value::Float(f)) => Value::Float(*f),
            (LogicalType::Double, Value::Int(i)) => Value::Float(*i as f64),
            (LogicalType::Double, Value::Text(s)) => {
                Value::Float(s.trim().parse::<f64>().map_err(|_| fail())?)
            }

            (LogicalType::Text, Value::Text(s)) => Value::Text(s.clone()),
            (LogicalType::Text, Value::Bytes(b)) => {
                Value::Text(String::from_utf8(b.clone()).map_err(|_| fail())?)
            }
            (LogicalType::Text, Value::Json(j)) => Value::Text(j.to_string()),
            (LogicalType::Text, Value::Array(_)) => return Err(fail()),
            (LogicalType::Text, other) => Value::Text(other.to_string()),

            (LogicalType::Bytes, Value::Bytes(b)) => Value::Bytes(b.clone()),
            (LogicalType::Bytes, Value::Text(s)) => Value::Bytes(s.as_bytes().to_vec()),

            (LogicalType::Json, Value::Json(j)) => Value::Json(j.clone()),
            (LogicalType::Json, Value::Text(s)) => {
                Value::Json(serde_json::from_str(s).map_err(|_| fail())?)
            }
            (LogicalType::Json, Value::Bool(b)) => Value::Json(serde_json::Value::Bool(*b)),
            (LogicalType::Json, Value::Int(i)) => Value::Json(serde_json::Value::from(*i)),
            (LogicalType::Json, Value::Float(f)) => serde_json::Number::from_f64(*f)
                .map(|n| Value::Json(serde_json::Value::Number(n)))
                .ok_or_else(fail)?,
            (LogicalType::Json, Value::Array(_)) => {
                Value::Json(serde_json::to_value(self).map_err(|_| fail())?)
            }

            _ => return Err(fail()),
        };

        Ok(converted)
    }

    /// SQL-style comparison of two non-null values.
    ///
    /// Returns `None` when either side is null or the types are not comparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => Some(a.total_cmp(b)),
            (Value::Int(a), Value::Float(b)) => Some((*a as f64).total_cmp(b)),
            (Value::Float(a), Value::Int(b)) => Some(a.total_cmp(&(*b as f64))),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Json(a), Value::Json(b)) => Some(a.to_string().cmp(&b.to_string())),
            _ => None,
        }
    }

    /// Total order usable as a sorted-map key: nulls first, then by type rank,
    /// then by [`Value::compare`] within a type.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        if let Some(ordering) = self.compare(other) {
            return ordering;
        }
        match self.rank().cmp(&other.rank()) {
            Ordering::Equal => match (self, other) {
                (Value::Array(a), Value::Array(b)) => {
                    for (x, y) in a.iter().zip(b.iter()) {
                        let ordering = x.total_cmp(y);
                        if ordering != Ordering::Equal {
                            return ordering;
                        }
                    }
                    a.len().cmp(&b.len())
                }
                _ => Ordering::Equal,
            },
            ordering => ordering,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Text(_) => 3,
            Value::Bytes(_) => 4,
            Value::Json(_) => 5,
            Value::Array(_) => 6,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Json(j) => write!(f, "{}", j),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Declared type of a logical (federated) column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalType {
    Boolean,
    Integer,
    Double,
    Text,
    Bytes,
    Json,
}

impl LogicalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalType::Boolean => "BOOLEAN",
            LogicalType::Integer => "BIGINT",
            LogicalType::Double => "DOUBLE",
            LogicalType::Text => "VARCHAR",
            LogicalType::Bytes => "BLOB",
            LogicalType::Json => "JSON",
        }
    }

    /// Best-effort mapping from a driver-reported type name.
    ///
    /// Unknown names fall back to `Text`.
    pub fn from_type_name(name: &str) -> Self {
        let upper = name.trim().to_ascii_uppercase();
        let base = upper.split('(').next().unwrap_or("").trim();
        match base {
            "BOOL" | "BOOLEAN" => LogicalType::Boolean,
            "INT" | "INTEGER" | "BIGINT" | "SMALLINT" | "TINYINT" | "INT2" | "INT4" | "INT8"
            | "MEDIUMINT" => LogicalType::Integer,
            "REAL" | "FLOAT" | "FLOAT4" | "FLOAT8" | "DOUBLE" | "DOUBLE PRECISION" | "NUMERIC"
            | "DECIMAL" => LogicalType::Double,
            "BLOB" | "BYTEA" | "BINARY" | "VARBINARY" => LogicalType::Bytes,
            "JSON" | "JSONB" => LogicalType::Json,
            _ => LogicalType::Text,
        }
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A column of the federated schema. Its position is its index in the
/// logical table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalColumn {
    pub name: CompactString,
    pub logical_type: LogicalType,
}

impl LogicalColumn {
    pub fn new(name: impl Into<CompactString>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
        }
    }
}

/// A column as reported by a physical source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalColumn {
    pub name: CompactString,
    /// Raw type name reported by the source (e.g. `INTEGER`, `TEXT`)
    pub data_type: CompactString,
    pub nullable: bool,
}

impl PhysicalColumn {
    pub fn new(name: impl Into<CompactString>, data_type: impl Into<CompactString>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        }
    }

    pub fn logical_type(&self) -> LogicalType {
        LogicalType::from_type_name(&self.data_type)
    }
}
