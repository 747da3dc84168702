//! Scalar constants carried by expression DAG nodes.

use crate::DataType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single constant value. Decimals carry the raw scaled integer; the
/// scale lives in the accompanying `DataType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    UInt8(u8),
    UInt32(u32),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    /// Days since epoch.
    Date(i32),
    /// Microseconds since epoch.
    Timestamp(i64),
    Decimal32(i32),
    Decimal64(i64),
    Decimal128(i128),
    Array(Vec<ScalarValue>),
    /// Finite constant set for membership tests.
    Set(Vec<ScalarValue>),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::UInt8(v) => write!(f, "{v}"),
            ScalarValue::UInt32(v) => write!(f, "{v}"),
            ScalarValue::Int8(v) => write!(f, "{v}"),
            ScalarValue::Int16(v) => write!(f, "{v}"),
            ScalarValue::Int32(v) => write!(f, "{v}"),
            ScalarValue::Int64(v) => write!(f, "{v}"),
            ScalarValue::Float32(v) => write!(f, "{v}"),
            ScalarValue::Float64(v) => write!(f, "{v}"),
            ScalarValue::String(v) => write!(f, "'{v}'"),
            ScalarValue::Date(v) => write!(f, "{v}"),
            ScalarValue::Timestamp(v) => write!(f, "{v}"),
            ScalarValue::Decimal32(v) => write!(f, "{v}"),
            ScalarValue::Decimal64(v) => write!(f, "{v}"),
            ScalarValue::Decimal128(v) => write!(f, "{v}"),
            ScalarValue::Array(vs) | ScalarValue::Set(vs) => {
                write!(f, "[")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl ScalarValue {
    /// `true` for the values a filter treats as "keep the row".
    pub fn is_truthy(&self) -> bool {
        !matches!(self, ScalarValue::Null | ScalarValue::UInt8(0))
    }
}

/// A constant together with its declared type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    pub data_type: DataType,
    pub value: ScalarValue,
}

impl TypedValue {
    pub fn new(data_type: DataType, value: ScalarValue) -> Self {
        Self { data_type, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_compact() {
        assert_eq!(ScalarValue::Int64(42).to_string(), "42");
        assert_eq!(ScalarValue::String("x".into()).to_string(), "'x'");
        assert_eq!(
            ScalarValue::Array(vec![ScalarValue::Int32(1), ScalarValue::Int32(2)]).to_string(),
            "[1,2]"
        );
    }
}
