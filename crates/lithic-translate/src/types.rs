//! Mapping between the external plan's type descriptors and engine types
//!
//! The two type systems evolved independently: the external side flags
//! nullability on every descriptor, the engine wraps it; the external side
//! has one decimal with a precision, the engine picks a backing width from
//! that precision. Composite types recurse; struct field names arrive in a
//! separate flat name stream that is consumed in declaration order.

use crate::TranslateError;
use lithic_plan::{Column, DataType, Schema, StructField, DECIMAL128_MAX_PRECISION};
use lithic_registry::AggregateFunctions;
use std::collections::VecDeque;
use substrait::proto::r#type::{Kind, Nullability};
use substrait::proto::{NamedStruct, Type};

fn is_external_nullable(nullability: i32) -> bool {
    nullability == Nullability::Nullable as i32
}

fn external_nullability(nullable: bool) -> i32 {
    if nullable { Nullability::Nullable as i32 } else { Nullability::Required as i32 }
}

/// Maps an external type descriptor to the engine type.
pub fn external_to_internal(ty: &Type) -> Result<DataType, TranslateError> {
    external_to_internal_named(ty, None)
}

/// As [`external_to_internal`], consuming one name per struct field from
/// `names` when a stream is supplied.
pub fn external_to_internal_named(
    ty: &Type,
    mut names: Option<&mut VecDeque<String>>,
) -> Result<DataType, TranslateError> {
    let kind = ty
        .kind
        .as_ref()
        .ok_or_else(|| TranslateError::MalformedPlan("type descriptor without a kind".into()))?;

    let (base, nullability) = match kind {
        // Booleans are carried as UInt8 by the engine.
        Kind::Bool(t) => (DataType::UInt8, t.nullability),
        Kind::I8(t) => (DataType::Int8, t.nullability),
        Kind::I16(t) => (DataType::Int16, t.nullability),
        Kind::I32(t) => (DataType::Int32, t.nullability),
        Kind::I64(t) => (DataType::Int64, t.nullability),
        Kind::Fp32(t) => (DataType::Float32, t.nullability),
        Kind::Fp64(t) => (DataType::Float64, t.nullability),
        Kind::String(t) => (DataType::String, t.nullability),
        // Binary data is carried in the engine's byte-string columns.
        Kind::Binary(t) => (DataType::String, t.nullability),
        Kind::Date(t) => (DataType::Date, t.nullability),
        // External timestamps are microsecond-precision.
        Kind::Timestamp(t) => (DataType::Timestamp { precision: 6 }, t.nullability),
        Kind::Decimal(t) => {
            let precision = t.precision as u32;
            if precision > DECIMAL128_MAX_PRECISION {
                return Err(TranslateError::UnsupportedType(format!(
                    "decimal precision {precision} exceeds the widest supported decimal"
                )));
            }
            (DataType::Decimal { precision, scale: t.scale as u32 }, t.nullability)
        }
        Kind::Struct(t) => {
            let mut fields = Vec::with_capacity(t.types.len());
            for field_ty in &t.types {
                let name = names.as_deref_mut().map(|ns| {
                    ns.pop_front().ok_or_else(|| {
                        TranslateError::MalformedPlan("name stream exhausted".into())
                    })
                });
                let name = name.transpose()?;
                let data_type = external_to_internal_named(field_ty, names.as_deref_mut())?;
                fields.push(StructField { name, data_type });
            }
            (DataType::Struct(fields), t.nullability)
        }
        Kind::List(t) => {
            let element = t
                .r#type
                .as_deref()
                .ok_or_else(|| TranslateError::MalformedPlan("list without element type".into()))?;
            (DataType::Array(Box::new(external_to_internal(element)?)), t.nullability)
        }
        Kind::Map(t) => {
            let key = t
                .key
                .as_deref()
                .ok_or_else(|| TranslateError::MalformedPlan("map without key type".into()))?;
            let value = t
                .value
                .as_deref()
                .ok_or_else(|| TranslateError::MalformedPlan("map without value type".into()))?;
            (
                DataType::Map {
                    key: Box::new(external_to_internal(key)?),
                    value: Box::new(external_to_internal(value)?),
                },
                t.nullability,
            )
        }
        other => {
            return Err(TranslateError::UnsupportedType(format!(
                "unrecognized external type {other:?}"
            )))
        }
    };

    Ok(base.wrap_nullable(is_external_nullable(nullability)))
}

/// Resolves the small fixed table of external type keywords, used where
/// only a type name string is available rather than a descriptor.
pub fn external_name_to_internal(name: &str) -> Result<DataType, TranslateError> {
    let ty = match name {
        "BooleanType" => DataType::UInt8,
        "ByteType" => DataType::Int8,
        "ShortType" => DataType::Int16,
        "IntegerType" => DataType::Int32,
        "LongType" => DataType::Int64,
        "FloatType" => DataType::Float32,
        "DoubleType" => DataType::Float64,
        "StringType" => DataType::String,
        "DateType" => DataType::Date,
        other => {
            return Err(TranslateError::UnsupportedType(format!("unrecognized type name {other}")))
        }
    };
    Ok(ty)
}

/// Maps an engine type back to the external descriptor shape. Unsigned
/// integers widen to the signed external kind of the same rank; engine-only
/// types (sets, aggregate states) have no external shape.
pub fn internal_to_external(ty: &DataType) -> Result<Type, TranslateError> {
    use substrait::proto::r#type;

    let nullable = ty.is_nullable();
    let nb = external_nullability(nullable);
    let kind = match ty.strip_nullable() {
        DataType::UInt8 => Kind::Bool(r#type::Boolean { nullability: nb, ..Default::default() }),
        DataType::Int8 => Kind::I8(r#type::I8 { nullability: nb, ..Default::default() }),
        DataType::Int16 | DataType::UInt16 => {
            Kind::I16(r#type::I16 { nullability: nb, ..Default::default() })
        }
        DataType::Int32 | DataType::UInt32 => {
            Kind::I32(r#type::I32 { nullability: nb, ..Default::default() })
        }
        DataType::Int64 | DataType::UInt64 => {
            Kind::I64(r#type::I64 { nullability: nb, ..Default::default() })
        }
        DataType::Float32 => Kind::Fp32(r#type::Fp32 { nullability: nb, ..Default::default() }),
        DataType::Float64 => Kind::Fp64(r#type::Fp64 { nullability: nb, ..Default::default() }),
        DataType::String => {
            Kind::String(r#type::String { nullability: nb, ..Default::default() })
        }
        DataType::Date => Kind::Date(r#type::Date { nullability: nb, ..Default::default() }),
        DataType::Timestamp { .. } => {
            Kind::Timestamp(r#type::Timestamp { nullability: nb, ..Default::default() })
        }
        DataType::Decimal { precision, scale } => Kind::Decimal(r#type::Decimal {
            precision: *precision as i32,
            scale: *scale as i32,
            nullability: nb,
            ..Default::default()
        }),
        DataType::Array(inner) => Kind::List(Box::new(r#type::List {
            r#type: Some(Box::new(internal_to_external(inner)?)),
            nullability: nb,
            ..Default::default()
        })),
        DataType::Map { key, value } => Kind::Map(Box::new(r#type::Map {
            key: Some(Box::new(internal_to_external(key)?)),
            value: Some(Box::new(internal_to_external(value)?)),
            nullability: nb,
            ..Default::default()
        })),
        DataType::Struct(fields) => Kind::Struct(r#type::Struct {
            types: fields
                .iter()
                .map(|f| internal_to_external(&f.data_type))
                .collect::<Result<Vec<_>, _>>()?,
            nullability: nb,
            ..Default::default()
        }),
        other => {
            return Err(TranslateError::UnsupportedType(format!(
                "engine type {other} has no external shape"
            )))
        }
    };
    Ok(Type { kind: Some(kind) })
}

/// Whether the external descriptor maps exactly to the given engine type.
pub fn is_type_matched(external: &Type, internal: &DataType) -> bool {
    matches!(external_to_internal(external), Ok(ty) if &ty == internal)
}

/// Builds the scan header from a declared named struct.
///
/// Column names with four `#`-separated parts denote columns carrying a
/// partially computed aggregate: the last part names the aggregate
/// function, and the column's type is that function's state type over the
/// declared value type.
pub fn parse_named_struct(
    named: &NamedStruct,
    aggregates: &dyn AggregateFunctions,
) -> Result<Schema, TranslateError> {
    let strukt = named
        .r#struct
        .as_ref()
        .ok_or_else(|| TranslateError::MalformedPlan("named struct without struct type".into()))?;
    let mut names: VecDeque<String> = named.names.iter().cloned().collect();

    let mut columns = Vec::with_capacity(strukt.types.len());
    for ty in &strukt.types {
        let name = names
            .pop_front()
            .ok_or_else(|| TranslateError::MalformedPlan("named struct short on names".into()))?;
        let mut data_type = external_to_internal_named(ty, Some(&mut names))?;
        let parts: Vec<&str> = name.split('#').collect();
        if parts.len() == 4 {
            data_type = aggregates.resolve(parts[3], &data_type)?.state_type;
        }
        columns.push(Column::new(name, data_type));
    }
    Ok(Schema::new(columns))
}
