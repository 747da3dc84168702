//! Internal type descriptors
//!
//! A closed variant type so that every new kind is a compile-time-checked
//! addition. Nullability is a wrapper variant, not a flag on each base
//! type, so the same wrapping logic applies uniformly everywhere.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest decimal precision backed by a 32-bit integer.
pub const DECIMAL32_MAX_PRECISION: u32 = 9;
/// Largest decimal precision backed by a 64-bit integer.
pub const DECIMAL64_MAX_PRECISION: u32 = 18;
/// Largest decimal precision the engine supports at all.
pub const DECIMAL128_MAX_PRECISION: u32 = 38;

/// Width class of a decimal, derived from its precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecimalWidth {
    W32,
    W64,
    W128,
}

impl DecimalWidth {
    /// Narrowest width that can hold `precision` digits, or `None` when the
    /// precision exceeds the widest supported decimal.
    pub fn for_precision(precision: u32) -> Option<DecimalWidth> {
        if precision <= DECIMAL32_MAX_PRECISION {
            Some(DecimalWidth::W32)
        } else if precision <= DECIMAL64_MAX_PRECISION {
            Some(DecimalWidth::W64)
        } else if precision <= DECIMAL128_MAX_PRECISION {
            Some(DecimalWidth::W128)
        } else {
            None
        }
    }

    /// Byte width of the backing integer.
    pub fn byte_len(self) -> usize {
        match self {
            DecimalWidth::W32 => 4,
            DecimalWidth::W64 => 8,
            DecimalWidth::W128 => 16,
        }
    }
}

/// A named (or positional) struct field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructField {
    pub name: Option<String>,
    pub data_type: DataType,
}

/// Internal engine type descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    // Booleans are carried as UInt8, matching the columnar runtime.
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Date,
    Timestamp { precision: u32 },
    Decimal { precision: u32, scale: u32 },
    Array(Box<DataType>),
    Map { key: Box<DataType>, value: Box<DataType> },
    Struct(Vec<StructField>),
    Nullable(Box<DataType>),
    /// Intermediate state of a partially computed aggregate.
    AggregateState { function: String, argument: Box<DataType> },
    /// Constant set used by membership tests; never a column type.
    Set(Box<DataType>),
}

impl DataType {
    pub fn is_nullable(&self) -> bool {
        matches!(self, DataType::Nullable(_))
    }

    pub fn is_aggregate_state(&self) -> bool {
        matches!(self.strip_nullable(), DataType::AggregateState { .. })
    }

    pub fn is_decimal(&self) -> bool {
        matches!(self.strip_nullable(), DataType::Decimal { .. })
    }

    /// Wraps in `Nullable` when `nullable` is set; already-nullable types
    /// are left as they are.
    pub fn wrap_nullable(self, nullable: bool) -> DataType {
        if nullable && !self.is_nullable() {
            DataType::Nullable(Box::new(self))
        } else {
            self
        }
    }

    /// The type with any `Nullable` wrapper removed.
    pub fn strip_nullable(&self) -> &DataType {
        match self {
            DataType::Nullable(inner) => inner.strip_nullable(),
            other => other,
        }
    }

    /// Common supertype of two types, used to reconcile join key columns.
    ///
    /// Equal types are their own supertype; nullability is contagious;
    /// integers and floats widen to the wider side. Anything else has no
    /// common supertype at this layer.
    pub fn common_supertype(&self, other: &DataType) -> Option<DataType> {
        if self == other {
            return Some(self.clone());
        }
        let nullable = self.is_nullable() || other.is_nullable();
        let base = match (self.strip_nullable(), other.strip_nullable()) {
            (a, b) if a == b => a.clone(),
            (a, b) if a.int_rank().is_some() && b.int_rank().is_some() => {
                if a.int_rank() >= b.int_rank() {
                    a.clone()
                } else {
                    b.clone()
                }
            }
            (DataType::Float32, DataType::Float64) | (DataType::Float64, DataType::Float32) => {
                DataType::Float64
            }
            _ => return None,
        };
        Some(base.wrap_nullable(nullable))
    }

    fn int_rank(&self) -> Option<u8> {
        match self {
            DataType::UInt8 | DataType::Int8 => Some(1),
            DataType::UInt16 | DataType::Int16 => Some(2),
            DataType::UInt32 | DataType::Int32 => Some(3),
            DataType::UInt64 | DataType::Int64 => Some(4),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::UInt8 => write!(f, "UInt8"),
            DataType::UInt16 => write!(f, "UInt16"),
            DataType::UInt32 => write!(f, "UInt32"),
            DataType::UInt64 => write!(f, "UInt64"),
            DataType::Int8 => write!(f, "Int8"),
            DataType::Int16 => write!(f, "Int16"),
            DataType::Int32 => write!(f, "Int32"),
            DataType::Int64 => write!(f, "Int64"),
            DataType::Float32 => write!(f, "Float32"),
            DataType::Float64 => write!(f, "Float64"),
            DataType::String => write!(f, "String"),
            DataType::Date => write!(f, "Date32"),
            DataType::Timestamp { precision } => write!(f, "DateTime64({precision})"),
            DataType::Decimal { precision, scale } => write!(f, "Decimal({precision}, {scale})"),
            DataType::Array(inner) => write!(f, "Array({inner})"),
            DataType::Map { key, value } => write!(f, "Map({key}, {value})"),
            DataType::Struct(fields) => {
                write!(f, "Tuple(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match &field.name {
                        Some(name) => write!(f, "{name} {}", field.data_type)?,
                        None => write!(f, "{}", field.data_type)?,
                    }
                }
                write!(f, ")")
            }
            DataType::Nullable(inner) => write!(f, "Nullable({inner})"),
            DataType::AggregateState { function, argument } => {
                write!(f, "AggregateState({function}, {argument})")
            }
            DataType::Set(elem) => write!(f, "Set({elem})"),
        }
    }
}
