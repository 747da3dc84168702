//! Aggregate function registry
//!
//! Aggregates surface twice during translation: once with their plain name
//! over a raw argument, and once with a `PartialMerge` suffix over an
//! already-partial state column. Resolving the suffixed form strips the
//! suffix, checks the argument really is a state of that function, and
//! reuses the base function's result type.

use crate::RegistryError;
use lithic_plan::DataType;

const PARTIAL_MERGE_SUFFIX: &str = "PartialMerge";

/// A resolved aggregate: its state type over the given argument and the
/// type of the finished result.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateFunction {
    pub name: String,
    pub state_type: DataType,
    pub result_type: DataType,
}

pub trait AggregateFunctions: Send + Sync {
    fn resolve(&self, name: &str, argument: &DataType) -> Result<AggregateFunction, RegistryError>;
}

/// The built-in repertoire of the columnar runtime.
#[derive(Debug, Default)]
pub struct BuiltinAggregateFunctions;

impl BuiltinAggregateFunctions {
    fn result_type(&self, name: &str, argument: &DataType) -> Result<DataType, RegistryError> {
        let base = argument.strip_nullable();
        let ty = match name {
            "count" => DataType::UInt64,
            "sum" => match base {
                DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64 => {
                    DataType::UInt64
                }
                DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => {
                    DataType::Int64
                }
                DataType::Float32 | DataType::Float64 => DataType::Float64,
                DataType::Decimal { precision: _, scale } => DataType::Decimal {
                    precision: lithic_plan::DECIMAL128_MAX_PRECISION,
                    scale: *scale,
                },
                _ => return Err(self.mismatch(name, argument)),
            },
            "avg" => match base {
                DataType::UInt8
                | DataType::UInt16
                | DataType::UInt32
                | DataType::UInt64
                | DataType::Int8
                | DataType::Int16
                | DataType::Int32
                | DataType::Int64
                | DataType::Float32
                | DataType::Float64
                | DataType::Decimal { .. } => DataType::Float64,
                _ => return Err(self.mismatch(name, argument)),
            },
            "min" | "max" => argument.clone(),
            _ => return Err(RegistryError::UnknownFunction(name.to_string())),
        };
        // An aggregate over a nullable column is null when every input in
        // the group was null; count is the exception.
        if name != "count" && argument.is_nullable() {
            Ok(ty.wrap_nullable(true))
        } else {
            Ok(ty)
        }
    }

    fn mismatch(&self, function: &str, argument: &DataType) -> RegistryError {
        RegistryError::TypeMismatch {
            function: function.to_string(),
            arguments: argument.to_string(),
        }
    }
}

impl AggregateFunctions for BuiltinAggregateFunctions {
    fn resolve(&self, name: &str, argument: &DataType) -> Result<AggregateFunction, RegistryError> {
        if let Some(base_name) = name.strip_suffix(PARTIAL_MERGE_SUFFIX) {
            // The argument must be the state of the same base function.
            let DataType::AggregateState { function, argument: inner } =
                argument.strip_nullable()
            else {
                return Err(self.mismatch(name, argument));
            };
            if function != base_name {
                return Err(self.mismatch(name, argument));
            }
            let result_type = self.result_type(base_name, inner)?;
            return Ok(AggregateFunction {
                name: name.to_string(),
                state_type: argument.clone(),
                result_type,
            });
        }

        let result_type = self.result_type(name, argument)?;
        Ok(AggregateFunction {
            name: name.to_string(),
            state_type: DataType::AggregateState {
                function: name.to_string(),
                argument: Box::new(argument.clone()),
            },
            result_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_widens_to_int64() {
        let r = BuiltinAggregateFunctions.resolve("sum", &DataType::Int32).unwrap();
        assert_eq!(r.result_type, DataType::Int64);
        assert!(r.state_type.is_aggregate_state());
    }

    #[test]
    fn partial_merge_requires_matching_state() {
        let reg = BuiltinAggregateFunctions;
        let state = DataType::AggregateState {
            function: "sum".into(),
            argument: Box::new(DataType::Int32),
        };
        let r = reg.resolve("sumPartialMerge", &state).unwrap();
        assert_eq!(r.name, "sumPartialMerge");
        assert_eq!(r.state_type, state);
        assert_eq!(r.result_type, DataType::Int64);

        assert!(reg.resolve("avgPartialMerge", &state).is_err());
        assert!(reg.resolve("sumPartialMerge", &DataType::Int32).is_err());
    }

    #[test]
    fn count_ignores_argument_nullability() {
        let r = BuiltinAggregateFunctions
            .resolve("count", &DataType::Nullable(Box::new(DataType::String)))
            .unwrap();
        assert_eq!(r.result_type, DataType::UInt64);
    }
}
