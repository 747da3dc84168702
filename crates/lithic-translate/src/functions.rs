//! Resolving external function references to engine function names
//!
//! Expressions reference functions by an integer anchor; the plan's
//! extension declarations map each anchor to a `name:argkinds` signature
//! string. The signature's bare name then maps through a fixed table to
//! the engine function name, with three special cases (`cast`, `extract`,
//! `check_overflow`) whose engine name depends on the call itself.

use crate::TranslateError;
use lithic_plan::{DecimalWidth, DECIMAL128_MAX_PRECISION};
use std::collections::HashMap;
use substrait::proto::expression::literal::LiteralType;
use substrait::proto::expression::{RexType, ScalarFunction};
use substrait::proto::extensions::simple_extension_declaration::MappingType;
use substrait::proto::function_argument::ArgType;
use substrait::proto::r#type::Kind;
use substrait::proto::{Expression, Plan, Type};

/// Per-plan anchor → signature table, built once from the extension
/// declarations and read-only afterwards.
#[derive(Debug, Default)]
pub struct FunctionAnchors {
    table: HashMap<u32, String>,
}

impl FunctionAnchors {
    /// Collects function declarations; other declaration kinds are
    /// ignored.
    pub fn from_plan(plan: &Plan) -> Self {
        let mut table = HashMap::new();
        for declaration in &plan.extensions {
            if let Some(MappingType::ExtensionFunction(f)) = &declaration.mapping_type {
                table.insert(f.function_anchor, f.name.clone());
            }
        }
        Self { table }
    }

    /// The signature declared for `anchor`. A missing anchor means the
    /// plan references a function it never declared.
    pub fn resolve(&self, anchor: u32) -> Result<&str, TranslateError> {
        self.table
            .get(&anchor)
            .map(String::as_str)
            .ok_or_else(|| {
                TranslateError::MalformedPlan(format!("function anchor {anchor} not declared"))
            })
    }
}

/// The bare function name of a `name:argkinds` signature.
pub fn base_name(signature: &str) -> &str {
    signature.split(':').next().unwrap_or(signature)
}

/// External scalar function names the engine supports, mapped to engine
/// names. `cast`, `extract` and `check_overflow` are present but resolved
/// per call site.
fn lookup(external: &str) -> Option<&'static str> {
    let internal = match external {
        "is_not_null" => "isNotNull",
        "is_null" => "isNull",
        "gte" => "greaterOrEquals",
        "gt" => "greater",
        "lte" => "lessOrEquals",
        "lt" => "less",
        "equal" => "equals",
        "not_equal" => "notEquals",
        "and" => "and",
        "or" => "or",
        "not" => "not",
        "xor" => "xor",
        "alias" => "alias",
        "add" => "plus",
        "subtract" => "minus",
        "multiply" => "multiply",
        "divide" => "divide",
        "modulus" => "modulo",
        "greatest" => "greatest",
        "least" => "least",
        "like" => "like",
        "not_like" => "notLike",
        "starts_with" => "startsWith",
        "ends_with" => "endsWith",
        "substring" => "substring",
        "lower" => "lower",
        "upper" => "upper",
        "trim" => "trimBoth",
        "ltrim" => "trimLeft",
        "rtrim" => "trimRight",
        "concat" => "concat",
        "char_length" => "lengthUTF8",
        "strlen" => "length",
        "replace" => "replaceAll",
        "regexp_replace" => "replaceRegexpAll",
        "split" => "splitByRegexp",
        "abs" => "abs",
        "negative" => "negate",
        "ceil" => "ceil",
        "floor" => "floor",
        "round" => "round",
        "sqrt" => "sqrt",
        "exp" => "exp",
        "ln" => "ln",
        "log10" => "log10",
        "power" => "power",
        "coalesce" => "ifNull",
        "in" => "in",
        "explode" => "arrayJoin",
        "extract" | "cast" | "check_overflow" => "",
        _ => return None,
    };
    Some(internal)
}

/// Functions whose nested scalar-function arguments stay in the output
/// index instead of being dropped as intermediates.
pub fn keeps_arguments(internal_name: &str) -> bool {
    matches!(internal_name, "alias" | "arrayJoin")
}

fn argument_expression(func: &ScalarFunction, index: usize) -> Option<&Expression> {
    match func.arguments.get(index)?.arg_type.as_ref()? {
        ArgType::Value(e) => Some(e),
        _ => None,
    }
}

fn literal_string(expr: &Expression) -> Option<&str> {
    match expr.rex_type.as_ref()? {
        RexType::Literal(lit) => match lit.literal_type.as_ref()? {
            LiteralType::String(s) => Some(s),
            _ => None,
        },
        _ => None,
    }
}

pub(crate) fn literal_bool(expr: &Expression) -> Option<bool> {
    match expr.rex_type.as_ref()? {
        RexType::Literal(lit) => match lit.literal_type.as_ref()? {
            LiteralType::Boolean(b) => Some(*b),
            _ => None,
        },
        _ => None,
    }
}

/// The decimal conversion function for the given precision; the tolerant
/// variant yields null on overflow instead of failing.
pub fn decimal_conversion(precision: u32, tolerant: bool) -> Result<String, TranslateError> {
    let base = match DecimalWidth::for_precision(precision) {
        Some(DecimalWidth::W32) => "toDecimal32",
        Some(DecimalWidth::W64) => "toDecimal64",
        Some(DecimalWidth::W128) => "toDecimal128",
        None => {
            return Err(TranslateError::UnsupportedType(format!(
                "decimal precision {precision} exceeds {DECIMAL128_MAX_PRECISION}"
            )))
        }
    };
    Ok(if tolerant { format!("{base}OrNull") } else { base.to_string() })
}

/// The engine conversion function for casting into `ty`.
pub fn conversion_function(ty: &Type) -> Result<String, TranslateError> {
    let kind = ty
        .kind
        .as_ref()
        .ok_or_else(|| TranslateError::MalformedPlan("cast destination without a kind".into()))?;
    let name = match kind {
        Kind::Fp64(_) => "toFloat64",
        Kind::Fp32(_) => "toFloat32",
        Kind::String(_) | Kind::Binary(_) => "toString",
        Kind::I64(_) => "toInt64",
        Kind::I32(_) => "toInt32",
        Kind::I16(_) => "toInt16",
        Kind::I8(_) => "toInt8",
        Kind::Date(_) => "toDate32",
        Kind::Timestamp(_) => "toDateTime64",
        Kind::Bool(_) => "toUInt8",
        Kind::Decimal(d) => return decimal_conversion(d.precision as u32, false),
        other => {
            return Err(TranslateError::UnsupportedType(format!(
                "no conversion into external type {other:?}"
            )))
        }
    };
    Ok(name.to_string())
}

/// The engine name for a resolved scalar-function call.
pub fn target_name(signature: &str, func: &ScalarFunction) -> Result<String, TranslateError> {
    let name = base_name(signature);
    let Some(mapped) = lookup(name) else {
        return Err(TranslateError::UnknownFunction(name.to_string()));
    };

    match name {
        "cast" => {
            let output = func.output_type.as_ref().ok_or_else(|| {
                TranslateError::MalformedPlan("cast call without output type".into())
            })?;
            conversion_function(output)
        }
        "extract" => {
            if func.arguments.len() != 2 {
                return Err(TranslateError::MalformedPlan(format!(
                    "extract takes two arguments: {func:?}"
                )));
            }
            let field = argument_expression(func, 0)
                .and_then(literal_string)
                .ok_or_else(|| {
                    TranslateError::MalformedPlan(
                        "first extract argument must be a date-part string literal".into(),
                    )
                })?;
            let internal = match field {
                "YEAR" => "toYear",
                "YEAR_OF_WEEK" => "toISOYear",
                "QUARTER" => "toQuarter",
                "MONTH" => "toMonth",
                "WEEK_OF_YEAR" => "toISOWeek",
                "DAY" => "toDayOfMonth",
                "DAY_OF_YEAR" => "toDayOfYear",
                "HOUR" => "toHour",
                "MINUTE" => "toMinute",
                "SECOND" => "toSecond",
                "WEEK_DAY" | "DAY_OF_WEEK" => {
                    return Err(TranslateError::NotImplemented(format!(
                        "extract date part {field}"
                    )))
                }
                other => {
                    return Err(TranslateError::UnknownFunction(format!(
                        "extract date part {other}"
                    )))
                }
            };
            Ok(internal.to_string())
        }
        "check_overflow" => {
            if func.arguments.len() != 2 {
                return Err(TranslateError::MalformedPlan(format!(
                    "check_overflow takes two arguments: {func:?}"
                )));
            }
            let tolerant = argument_expression(func, 1)
                .and_then(literal_bool)
                .ok_or_else(|| {
                    TranslateError::MalformedPlan(
                        "second check_overflow argument must be a boolean literal".into(),
                    )
                })?;
            let output = func.output_type.as_ref().and_then(|t| t.kind.as_ref());
            let Some(Kind::Decimal(d)) = output else {
                return Err(TranslateError::MalformedPlan(
                    "check_overflow output must be a decimal".into(),
                ));
            };
            decimal_conversion(d.precision as u32, tolerant)
        }
        _ => Ok(mapped.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use substrait::proto::expression::Literal;
    use substrait::proto::r#type;
    use substrait::proto::FunctionArgument;

    fn string_literal_arg(value: &str) -> FunctionArgument {
        FunctionArgument {
            arg_type: Some(ArgType::Value(Expression {
                rex_type: Some(RexType::Literal(Literal {
                    literal_type: Some(LiteralType::String(value.to_string())),
                    ..Default::default()
                })),
            })),
        }
    }

    fn bool_literal_arg(value: bool) -> FunctionArgument {
        FunctionArgument {
            arg_type: Some(ArgType::Value(Expression {
                rex_type: Some(RexType::Literal(Literal {
                    literal_type: Some(LiteralType::Boolean(value)),
                    ..Default::default()
                })),
            })),
        }
    }

    #[test]
    fn extract_vocabulary() {
        let func = ScalarFunction {
            arguments: vec![string_literal_arg("MONTH"), FunctionArgument::default()],
            ..Default::default()
        };
        assert_eq!(target_name("extract:req_str_date", &func).unwrap(), "toMonth");

        let weekday = ScalarFunction {
            arguments: vec![string_literal_arg("WEEK_DAY"), FunctionArgument::default()],
            ..Default::default()
        };
        assert!(matches!(
            target_name("extract:req_str_date", &weekday),
            Err(TranslateError::NotImplemented(_))
        ));
    }

    #[test]
    fn check_overflow_picks_tolerance_from_literal() {
        let output = Type {
            kind: Some(Kind::Decimal(r#type::Decimal {
                precision: 10,
                scale: 2,
                ..Default::default()
            })),
        };
        let mut func = ScalarFunction {
            arguments: vec![FunctionArgument::default(), bool_literal_arg(true)],
            output_type: Some(output),
            ..Default::default()
        };
        assert_eq!(target_name("check_overflow:dec", &func).unwrap(), "toDecimal64OrNull");

        func.arguments[1] = bool_literal_arg(false);
        assert_eq!(target_name("check_overflow:dec", &func).unwrap(), "toDecimal64");
    }

    #[test]
    fn unknown_names_fail_immediately() {
        let func = ScalarFunction::default();
        assert!(matches!(
            target_name("frobnicate:i64", &func),
            Err(TranslateError::UnknownFunction(_))
        ));
    }

    #[test]
    fn anchors_resolve_through_extensions() {
        use substrait::proto::extensions::{
            simple_extension_declaration::ExtensionFunction, SimpleExtensionDeclaration,
        };
        let plan = Plan {
            extensions: vec![SimpleExtensionDeclaration {
                mapping_type: Some(MappingType::ExtensionFunction(ExtensionFunction {
                    extension_uri_reference: 0,
                    function_anchor: 7,
                    name: "equal:i64_i64".into(),
                    ..Default::default()
                })),
            }],
            ..Default::default()
        };
        let anchors = FunctionAnchors::from_plan(&plan);
        assert_eq!(anchors.resolve(7).unwrap(), "equal:i64_i64");
        assert!(anchors.resolve(8).is_err());
    }
}
