//! Scalar function registry
//!
//! Translation only needs to know that a function exists and what type it
//! returns for given argument types. The registry mirrors the execution
//! runtime's repertoire; an entry here without a runtime implementation is
//! a deployment bug, not a translation concern.

use crate::RegistryError;
use lithic_plan::DataType;

pub trait ScalarFunctions: Send + Sync {
    /// Result type of `function` applied to `args`, or an error when the
    /// function is unknown or the argument shape is unsupported.
    fn result_type(&self, function: &str, args: &[DataType]) -> Result<DataType, RegistryError>;
}

/// The built-in repertoire of the columnar runtime.
#[derive(Debug, Default)]
pub struct BuiltinScalarFunctions;

impl BuiltinScalarFunctions {
    fn base_result(&self, function: &str, args: &[DataType]) -> Result<DataType, RegistryError> {
        let stripped: Vec<&DataType> = args.iter().map(|a| a.strip_nullable()).collect();
        let arg0 = || -> Result<DataType, RegistryError> {
            stripped
                .first()
                .map(|t| (*t).clone())
                .ok_or_else(|| self.mismatch(function, args))
        };

        let ty = match function {
            // Predicates and comparisons evaluate to UInt8.
            "equals" | "notEquals" | "less" | "lessOrEquals" | "greater" | "greaterOrEquals"
            | "and" | "or" | "xor" | "not" | "like" | "notLike" | "match" | "startsWith"
            | "endsWith" | "isNull" | "isNotNull" | "in" | "notIn" => DataType::UInt8,

            "plus" | "minus" | "multiply" | "modulo" | "greatest" | "least" => {
                let a = arg0()?;
                let b = stripped
                    .get(1)
                    .map(|t| (*t).clone())
                    .ok_or_else(|| self.mismatch(function, args))?;
                a.common_supertype(&b).ok_or_else(|| self.mismatch(function, args))?
            }
            "divide" | "sqrt" | "exp" | "ln" | "log10" | "power" | "round" | "floor" | "ceil" => {
                DataType::Float64
            }
            "abs" | "negate" => arg0()?,

            "lower" | "upper" | "trimBoth" | "trimLeft" | "trimRight" | "reverse" | "concat"
            | "substring" | "replaceAll" | "replaceRegexpAll" | "repeat" => DataType::String,
            "length" | "lengthUTF8" | "position" | "countSubstrings" => DataType::UInt64,
            "splitByRegexp" => DataType::Array(Box::new(DataType::String)),

            "toYear" | "toISOYear" => DataType::UInt16,
            "toQuarter" | "toMonth" | "toDayOfMonth" | "toHour" | "toMinute" | "toSecond" => {
                DataType::UInt8
            }
            "toISOWeek" => DataType::UInt8,
            "toDayOfYear" => DataType::UInt16,

            "toNullable" => return Ok(arg0()?.wrap_nullable(true)),
            "assumeNotNull" => return Ok(arg0()?),

            "coalesce" | "ifNull" => arg0()?,

            // Variadic (cond, value)* + else; result is the common type of
            // the value branches.
            "multiIf" => {
                if args.len() < 3 || args.len() % 2 == 0 {
                    return Err(self.mismatch(function, args));
                }
                let mut branches: Vec<&DataType> =
                    args.iter().skip(1).step_by(2).collect();
                let else_branch =
                    args.last().ok_or_else(|| self.mismatch(function, args))?;
                branches.push(else_branch);
                let mut ty = branches[0].clone();
                for b in &branches[1..] {
                    ty = ty
                        .common_supertype(b)
                        .ok_or_else(|| self.mismatch(function, args))?;
                }
                return Ok(ty);
            }

            _ => return Err(RegistryError::UnknownFunction(function.to_string())),
        };
        Ok(ty)
    }

    fn mismatch(&self, function: &str, args: &[DataType]) -> RegistryError {
        RegistryError::TypeMismatch {
            function: function.to_string(),
            arguments: args
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// Functions whose result never carries nullability from their arguments.
const NULL_OPAQUE: &[&str] = &["isNull", "isNotNull", "in", "notIn", "assumeNotNull", "coalesce", "ifNull"];

impl ScalarFunctions for BuiltinScalarFunctions {
    fn result_type(&self, function: &str, args: &[DataType]) -> Result<DataType, RegistryError> {
        let base = self.base_result(function, args)?;
        if NULL_OPAQUE.contains(&function) || function == "toNullable" || function == "multiIf" {
            return Ok(base);
        }
        let nullable = args.iter().any(DataType::is_nullable);
        Ok(base.wrap_nullable(nullable))
    }
}
