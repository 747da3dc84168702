//! Scalar expression → DAG compilation
//!
//! Compiles the external expression tree (selections, literals, casts,
//! conditionals, scalar calls, set membership) into nodes of an
//! append-only [`Dag`]. Compilation either succeeds with a node handle or
//! fails; a partially built DAG is never handed back to the caller.

use crate::functions::{self, FunctionAnchors};
use crate::types::{external_to_internal, is_type_matched};
use crate::TranslateError;
use lithic_plan::{
    unique_name, DataType, Dag, DagError, DecimalWidth, NodeId, ScalarValue, Schema, TypedValue,
};
use lithic_registry::ScalarFunctions;
use std::collections::HashSet;
use substrait::proto::expression::field_reference::ReferenceType;
use substrait::proto::expression::literal::LiteralType;
use substrait::proto::expression::reference_segment;
use substrait::proto::expression::{FieldReference, Literal, RexType};
use substrait::proto::function_argument::ArgType;
use substrait::proto::Expression;

/// Resolves a direct field reference to its positional index.
pub fn selection_position(reference: &FieldReference) -> Result<usize, TranslateError> {
    let Some(ReferenceType::DirectReference(segment)) = &reference.reference_type else {
        return Err(TranslateError::MalformedPlan(
            "only direct struct references are supported in selections".into(),
        ));
    };
    let Some(reference_segment::ReferenceType::StructField(field)) = &segment.reference_type
    else {
        return Err(TranslateError::MalformedPlan(
            "only struct-field reference segments are supported".into(),
        ));
    };
    Ok(field.field as usize)
}

/// The positional index of an expression that must be a direct column
/// reference.
pub fn expression_position(expr: &Expression) -> Result<usize, TranslateError> {
    match &expr.rex_type {
        Some(RexType::Selection(reference)) => selection_position(reference),
        _ => Err(TranslateError::MalformedPlan(format!(
            "expected a direct column reference, got {expr:?}"
        ))),
    }
}

fn le_i32(bytes: &[u8]) -> Result<i32, TranslateError> {
    bytes
        .get(..4)
        .and_then(|b| <[u8; 4]>::try_from(b).ok())
        .map(i32::from_le_bytes)
        .ok_or_else(|| TranslateError::MalformedPlan("decimal literal shorter than its width".into()))
}

fn le_i64(bytes: &[u8]) -> Result<i64, TranslateError> {
    bytes
        .get(..8)
        .and_then(|b| <[u8; 8]>::try_from(b).ok())
        .map(i64::from_le_bytes)
        .ok_or_else(|| TranslateError::MalformedPlan("decimal literal shorter than its width".into()))
}

fn le_i128(bytes: &[u8]) -> Result<i128, TranslateError> {
    bytes
        .get(..16)
        .and_then(|b| <[u8; 16]>::try_from(b).ok())
        .map(i128::from_le_bytes)
        .ok_or_else(|| TranslateError::MalformedPlan("decimal literal shorter than its width".into()))
}

/// Decodes a literal into a typed constant. Decimal payloads are
/// fixed-width little-endian integers sized by the precision's width
/// class; list literals must agree on a single element type.
pub fn parse_literal(literal: &Literal) -> Result<TypedValue, TranslateError> {
    let kind = literal
        .literal_type
        .as_ref()
        .ok_or_else(|| TranslateError::MalformedPlan("literal without a value".into()))?;

    let typed = match kind {
        LiteralType::Boolean(b) => {
            TypedValue::new(DataType::UInt8, ScalarValue::UInt8(u8::from(*b)))
        }
        LiteralType::I8(v) => TypedValue::new(DataType::Int8, ScalarValue::Int8(*v as i8)),
        LiteralType::I16(v) => TypedValue::new(DataType::Int16, ScalarValue::Int16(*v as i16)),
        LiteralType::I32(v) => TypedValue::new(DataType::Int32, ScalarValue::Int32(*v)),
        LiteralType::I64(v) => TypedValue::new(DataType::Int64, ScalarValue::Int64(*v)),
        LiteralType::Fp32(v) => TypedValue::new(DataType::Float32, ScalarValue::Float32(*v)),
        LiteralType::Fp64(v) => TypedValue::new(DataType::Float64, ScalarValue::Float64(*v)),
        LiteralType::String(v) => {
            TypedValue::new(DataType::String, ScalarValue::String(v.clone()))
        }
        LiteralType::Binary(v) => {
            let text = std::str::from_utf8(v.as_ref()).map_err(|_| {
                TranslateError::MalformedPlan("binary literal is not valid UTF-8".into())
            })?;
            TypedValue::new(DataType::String, ScalarValue::String(text.to_owned()))
        }
        LiteralType::Date(v) => TypedValue::new(DataType::Date, ScalarValue::Date(*v)),
        LiteralType::Timestamp(v) => TypedValue::new(
            DataType::Timestamp { precision: 6 },
            ScalarValue::Timestamp(*v),
        ),
        LiteralType::Decimal(d) => {
            let precision = d.precision as u32;
            let scale = d.scale as u32;
            let width = DecimalWidth::for_precision(precision).ok_or_else(|| {
                TranslateError::UnsupportedType(format!(
                    "decimal literal precision {precision} out of range"
                ))
            })?;
            let bytes: &[u8] = d.value.as_ref();
            let value = match width {
                DecimalWidth::W32 => ScalarValue::Decimal32(le_i32(bytes)?),
                DecimalWidth::W64 => ScalarValue::Decimal64(le_i64(bytes)?),
                DecimalWidth::W128 => ScalarValue::Decimal128(le_i128(bytes)?),
            };
            TypedValue::new(DataType::Decimal { precision, scale }, value)
        }
        LiteralType::List(list) => {
            let mut values = Vec::with_capacity(list.values.len());
            let mut element_type: Option<DataType> = None;
            for value in &list.values {
                let item = parse_literal(value)?;
                match &element_type {
                    None => element_type = Some(item.data_type.clone()),
                    Some(t) if *t != item.data_type => {
                        return Err(TranslateError::MalformedPlan(format!(
                            "literal list mixes element types {t} and {}",
                            item.data_type
                        )))
                    }
                    Some(_) => {}
                }
                values.push(item.value);
            }
            let element_type = element_type.ok_or_else(|| {
                TranslateError::MalformedPlan("literal list without elements".into())
            })?;
            TypedValue::new(
                DataType::Array(Box::new(element_type)),
                ScalarValue::Array(values),
            )
        }
        LiteralType::EmptyList(_) => {
            return Err(TranslateError::NotImplemented("empty list literal".into()))
        }
        LiteralType::Null(ty) => TypedValue::new(external_to_internal(ty)?, ScalarValue::Null),
        other => {
            return Err(TranslateError::UnsupportedType(format!(
                "unsupported literal {other:?}"
            )))
        }
    };
    Ok(typed)
}

/// Compiles expressions against one DAG, resolving function anchors
/// through the per-plan table and result types through the scalar
/// registry.
pub struct ExprCompiler<'a> {
    anchors: &'a FunctionAnchors,
    scalars: &'a dyn ScalarFunctions,
}

/// Conversion functions synthesized by the compiler itself. Their result
/// type comes from the call's declared output, not from the registry.
fn is_conversion(name: &str) -> bool {
    name.starts_with("toDecimal")
        || matches!(
            name,
            "toString"
                | "toInt8"
                | "toInt16"
                | "toInt32"
                | "toInt64"
                | "toFloat32"
                | "toFloat64"
                | "toDate32"
                | "toDateTime64"
                | "toUInt8"
        )
}

impl<'a> ExprCompiler<'a> {
    pub fn new(anchors: &'a FunctionAnchors, scalars: &'a dyn ScalarFunctions) -> Self {
        Self { anchors, scalars }
    }

    /// Compiles one expression. Scalar calls go through the full
    /// function path; everything else through the argument path, published
    /// when `keep_result` is set. Returns the node and its result name.
    pub fn compile(
        &self,
        dag: &mut Dag,
        expr: &Expression,
        required_columns: &mut Vec<String>,
        keep_result: bool,
    ) -> Result<(NodeId, String), TranslateError> {
        if matches!(expr.rex_type, Some(RexType::ScalarFunction(_))) {
            return self.compile_function(dag, expr, required_columns, keep_result);
        }
        let node = self.compile_argument(dag, expr)?;
        if keep_result {
            dag.add_or_replace_output(node);
        }
        let name = dag.node(node).result_name.clone();
        Ok((node, name))
    }

    fn add_literal(&self, dag: &mut Dag, value: TypedValue) -> NodeId {
        let name = unique_name(&value.value.to_string());
        dag.add_constant(value, name)
    }

    fn scale_constant(&self, dag: &mut Dag, scale: u32) -> NodeId {
        self.add_literal(
            dag,
            TypedValue::new(DataType::UInt32, ScalarValue::UInt32(scale)),
        )
    }

    fn args_label(&self, dag: &Dag, args: &[NodeId]) -> String {
        args.iter()
            .map(|id| dag.node(*id).result_name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn arg_types(&self, dag: &Dag, args: &[NodeId]) -> Vec<DataType> {
        args.iter().map(|id| dag.node(*id).result_type.clone()).collect()
    }

    /// Compiles a non-function expression position: selection, literal,
    /// cast, conditional or set membership.
    pub fn compile_argument(
        &self,
        dag: &mut Dag,
        expr: &Expression,
    ) -> Result<NodeId, TranslateError> {
        let rex = expr
            .rex_type
            .as_ref()
            .ok_or_else(|| TranslateError::MalformedPlan("expression without a kind".into()))?;

        match rex {
            RexType::Literal(literal) => {
                let value = parse_literal(literal)?;
                Ok(self.add_literal(dag, value))
            }

            RexType::Selection(reference) => {
                let position = selection_position(reference)?;
                let input = dag.input_at(position)?;
                let name = dag.node(input).result_name.clone();
                dag.find_in_output(&name)
                    .ok_or_else(|| DagError::MissingColumn(name).into())
            }

            RexType::Cast(cast) => {
                let destination = cast.r#type.as_ref().ok_or_else(|| {
                    TranslateError::MalformedPlan("cast without destination type".into())
                })?;
                let input = cast.input.as_deref().ok_or_else(|| {
                    TranslateError::MalformedPlan("cast without input".into())
                })?;
                let function = functions::conversion_function(destination)?;

                let mut args = vec![match input.rex_type {
                    Some(RexType::ScalarFunction(_)) => {
                        let mut scratch = Vec::new();
                        self.compile_function(dag, input, &mut scratch, false)?.0
                    }
                    _ => self.compile_argument(dag, input)?,
                }];

                // Decimal and fixed-precision timestamp conversions take
                // the scale as an extra constant argument.
                if function.starts_with("toDecimal") {
                    let scale = match destination.kind.as_ref() {
                        Some(substrait::proto::r#type::Kind::Decimal(d)) => d.scale as u32,
                        _ => 0,
                    };
                    args.push(self.scale_constant(dag, scale));
                } else if function.starts_with("toDateTime64") {
                    args.push(self.scale_constant(dag, 6));
                }

                let result_type = external_to_internal(destination)?;
                let name = format!("{function}({})", self.args_label(dag, &args));
                let node = dag.add_function(function, args, result_type, name);
                dag.add_or_replace_output(node);
                Ok(node)
            }

            RexType::IfThen(if_then) => {
                if if_then.ifs.is_empty() {
                    return Err(TranslateError::MalformedPlan(
                        "conditional without branches".into(),
                    ));
                }
                let mut args = Vec::with_capacity(if_then.ifs.len() * 2 + 1);
                for clause in &if_then.ifs {
                    let condition = clause.r#if.as_ref().ok_or_else(|| {
                        TranslateError::MalformedPlan("conditional branch without condition".into())
                    })?;
                    let value = clause.then.as_ref().ok_or_else(|| {
                        TranslateError::MalformedPlan("conditional branch without value".into())
                    })?;
                    args.push(self.compile_argument(dag, condition)?);
                    args.push(self.compile_argument(dag, value)?);
                }
                let otherwise = if_then.r#else.as_deref().ok_or_else(|| {
                    TranslateError::MalformedPlan("conditional without else branch".into())
                })?;
                args.push(self.compile_argument(dag, otherwise)?);

                let result_type = self.scalars.result_type("multiIf", &self.arg_types(dag, &args))?;
                let name = format!("multiIf({})", self.args_label(dag, &args));
                let node = dag.add_function("multiIf", args, result_type, name);
                dag.add_or_replace_output(node);
                Ok(node)
            }

            RexType::ScalarFunction(_) => {
                let mut scratch = Vec::new();
                Ok(self.compile_function(dag, expr, &mut scratch, false)?.0)
            }

            RexType::SingularOrList(sol) => {
                // An empty option list can never match.
                if sol.options.is_empty() {
                    return Ok(self.add_literal(
                        dag,
                        TypedValue::new(DataType::UInt8, ScalarValue::UInt8(0)),
                    ));
                }
                let value = sol.value.as_deref().ok_or_else(|| {
                    TranslateError::MalformedPlan("membership test without a value".into())
                })?;
                let probe = self.compile_argument(dag, value)?;

                let mut element_type: Option<DataType> = None;
                let mut elements = Vec::with_capacity(sol.options.len());
                for option in &sol.options {
                    let Some(RexType::Literal(literal)) = &option.rex_type else {
                        return Err(TranslateError::MalformedPlan(
                            "membership options must be literals".into(),
                        ));
                    };
                    let item = parse_literal(literal)?;
                    match &element_type {
                        None => element_type = Some(item.data_type.clone()),
                        Some(t) if *t != item.data_type => {
                            return Err(TranslateError::MalformedPlan(format!(
                                "membership options mix types {t} and {}",
                                item.data_type
                            )))
                        }
                        Some(_) => {}
                    }
                    elements.push(item.value);
                }
                let element_type = element_type.ok_or_else(|| {
                    TranslateError::MalformedPlan("membership options without a type".into())
                })?;
                let set = self.add_literal(
                    dag,
                    TypedValue::new(
                        DataType::Set(Box::new(element_type)),
                        ScalarValue::Set(elements),
                    ),
                );

                let args = vec![probe, set];
                let result_type = self.scalars.result_type("in", &self.arg_types(dag, &args))?;
                let name = format!("in({})", self.args_label(dag, &args));
                let node = dag.add_function("in", args, result_type, name);
                dag.add_or_replace_output(node);
                Ok(node)
            }

            other => Err(TranslateError::MalformedPlan(format!(
                "unsupported expression kind {other:?}"
            ))),
        }
    }

    /// Compiles a scalar-function call, applying the call-site rewrites
    /// and the implicit result cast. Columns proven non-null through
    /// `isNotNull` are collected into `required_columns`.
    pub fn compile_function(
        &self,
        dag: &mut Dag,
        expr: &Expression,
        required_columns: &mut Vec<String>,
        keep_result: bool,
    ) -> Result<(NodeId, String), TranslateError> {
        let Some(RexType::ScalarFunction(func)) = &expr.rex_type else {
            return Err(TranslateError::MalformedPlan(format!(
                "expected a scalar function at the expression root: {expr:?}"
            )));
        };

        let signature = self.anchors.resolve(func.function_reference)?.to_string();
        let function = functions::target_name(&signature, func)?;

        let mut args = Vec::with_capacity(func.arguments.len());
        for argument in &func.arguments {
            let value = match argument.arg_type.as_ref() {
                Some(ArgType::Value(e)) => e,
                other => {
                    return Err(TranslateError::MalformedPlan(format!(
                        "unsupported function argument {other:?}"
                    )))
                }
            };
            if matches!(value.rex_type, Some(RexType::ScalarFunction(_))) {
                let keep_arg = functions::keeps_arguments(&function);
                let (node, _) = self.compile_function(dag, value, required_columns, keep_arg)?;
                args.push(node);
            } else {
                args.push(self.compile_argument(dag, value)?);
            }
        }

        if function == "alias" {
            let source = *args.first().ok_or_else(|| {
                TranslateError::MalformedPlan("alias without an argument".into())
            })?;
            let result_name = dag.node(source).result_name.clone();
            dag.add_or_replace_output(source);
            let node = dag.add_alias(source, result_name.clone());
            return Ok((node, result_name));
        }

        if function == "arrayJoin" {
            let source = *args.first().ok_or_else(|| {
                TranslateError::MalformedPlan("arrayJoin without an argument".into())
            })?;
            let source_type = dag.node(source).result_type.clone();
            let DataType::Array(element) = source_type.strip_nullable().clone() else {
                return Err(TranslateError::MalformedPlan(format!(
                    "arrayJoin over non-array type {source_type}"
                )));
            };
            let result_name = format!("arrayJoin({})", self.args_label(dag, &args));
            let node = dag.add_explode(source, *element, result_name.clone());
            if keep_result {
                dag.add_or_replace_output(node);
            }
            return Ok((node, result_name));
        }

        if function == "isNotNull" {
            if let Some(first) = args.first() {
                required_columns.push(dag.node(*first).result_name.clone());
            }
        } else if function == "splitByRegexp" && args.len() >= 2 {
            // External order is (string, pattern); the engine takes the
            // pattern first.
            args.swap(0, 1);
        }

        if signature.starts_with("extract:") {
            // The date part already selected the function; drop it.
            args.remove(0);
        }

        if signature.starts_with("check_overflow:") {
            if func.arguments.len() != 2 {
                return Err(TranslateError::MalformedPlan(
                    "check_overflow takes two arguments".into(),
                ));
            }
            // The tolerant conversion parses from string.
            if function.ends_with("OrNull") {
                let source = args[0];
                let source_nullable = dag.node(source).result_type.is_nullable();
                let name = format!("toString({})", self.args_label(dag, &args[..1]));
                let node = dag.add_function(
                    "toString",
                    vec![source],
                    DataType::String.wrap_nullable(source_nullable),
                    name,
                );
                args[0] = node;
            }
            // Replace the boolean flag with the scale the conversion
            // function expects.
            args.pop();
            let scale = match func.output_type.as_ref().and_then(|t| t.kind.as_ref()) {
                Some(substrait::proto::r#type::Kind::Decimal(d)) => d.scale as u32,
                _ => {
                    return Err(TranslateError::MalformedPlan(
                        "check_overflow output must be a decimal".into(),
                    ))
                }
            };
            args.push(self.scale_constant(dag, scale));
        }

        let result_type = if is_conversion(&function) {
            let declared = func.output_type.as_ref().ok_or_else(|| {
                TranslateError::MalformedPlan(format!(
                    "conversion {function} without declared output type"
                ))
            })?;
            external_to_internal(declared)?.wrap_nullable(function.ends_with("OrNull"))
        } else {
            self.scalars.result_type(&function, &self.arg_types(dag, &args))?
        };

        let mut result_name = format!("{function}({})", self.args_label(dag, &args));
        let mut node = dag.add_function(function, args, result_type.clone(), result_name.clone());

        // Reconcile with the declared output type when they disagree.
        if let Some(declared) = func.output_type.as_ref() {
            if !is_type_matched(declared, &result_type) {
                let cast = functions::conversion_function(declared)?;
                let mut cast_args = vec![node];
                if cast.starts_with("toDecimal") {
                    let scale = match declared.kind.as_ref() {
                        Some(substrait::proto::r#type::Kind::Decimal(d)) => d.scale as u32,
                        _ => 0,
                    };
                    cast_args.push(self.scale_constant(dag, scale));
                }
                let cast_type = external_to_internal(declared)?;
                result_name = format!("{cast}({})", self.args_label(dag, &cast_args));
                node = dag.add_function(cast, cast_args, cast_type, result_name.clone());
            }
        }

        if keep_result {
            dag.add_or_replace_output(node);
        }
        Ok((node, result_name))
    }

    /// Compiles an ordered projection list into a DAG whose output index
    /// is exactly the projected columns, with duplicate output names
    /// uniquified.
    pub fn compile_projection(
        &self,
        expressions: &[Expression],
        input_schema: &Schema,
        read_schema: &Schema,
    ) -> Result<Dag, TranslateError> {
        let mut dag = Dag::from_schema(input_schema);
        let mut aliases: Vec<(String, String)> = Vec::with_capacity(expressions.len());
        let mut distinct: HashSet<String> = HashSet::new();

        for expr in expressions {
            let name = match &expr.rex_type {
                Some(RexType::Selection(reference)) => {
                    let position = selection_position(reference)?;
                    let column = read_schema.column_at(position).ok_or_else(|| {
                        TranslateError::MalformedPlan(format!(
                            "projection references column {position} of a {}-column input",
                            read_schema.len()
                        ))
                    })?;
                    column.name.clone()
                }
                Some(RexType::ScalarFunction(_)) => {
                    let mut scratch = Vec::new();
                    self.compile_function(&mut dag, expr, &mut scratch, true)?.1
                }
                Some(
                    RexType::Cast(_)
                    | RexType::IfThen(_)
                    | RexType::Literal(_)
                    | RexType::SingularOrList(_),
                ) => {
                    let node = self.compile_argument(&mut dag, expr)?;
                    dag.add_or_replace_output(node);
                    dag.node(node).result_name.clone()
                }
                other => {
                    return Err(TranslateError::MalformedPlan(format!(
                        "unsupported projection expression {other:?}"
                    )))
                }
            };

            if distinct.contains(&name) {
                let unique = unique_name(&name);
                aliases.push((name, unique.clone()));
                distinct.insert(unique);
            } else {
                distinct.insert(name.clone());
                aliases.push((name.clone(), name));
            }
        }

        dag.project(&aliases)?;
        Ok(dag)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use substrait::proto::expression::{FieldReference, ReferenceSegment, ScalarFunction};
    use substrait::proto::extensions::simple_extension_declaration::{
        ExtensionFunction, MappingType,
    };
    use substrait::proto::extensions::SimpleExtensionDeclaration;
    use substrait::proto::{FunctionArgument, Plan, Type};

    pub fn anchors(pairs: &[(u32, &str)]) -> FunctionAnchors {
        let plan = Plan {
            extensions: pairs
                .iter()
                .map(|(anchor, name)| SimpleExtensionDeclaration {
                    mapping_type: Some(MappingType::ExtensionFunction(ExtensionFunction {
                        extension_uri_reference: 0,
                        function_anchor: *anchor,
                        name: (*name).to_string(),
                        ..Default::default()
                    })),
                })
                .collect(),
            ..Default::default()
        };
        FunctionAnchors::from_plan(&plan)
    }

    pub fn selection(position: i32) -> Expression {
        Expression {
            rex_type: Some(RexType::Selection(Box::new(FieldReference {
                reference_type: Some(ReferenceType::DirectReference(ReferenceSegment {
                    reference_type: Some(reference_segment::ReferenceType::StructField(
                        Box::new(reference_segment::StructField {
                            field: position,
                            child: None,
                        }),
                    )),
                })),
                root_type: None,
            }))),
        }
    }

    pub fn string_literal(value: &str) -> Expression {
        Expression {
            rex_type: Some(RexType::Literal(Literal {
                literal_type: Some(LiteralType::String(value.to_string())),
                ..Default::default()
            })),
        }
    }

    pub fn i64_literal(value: i64) -> Expression {
        Expression {
            rex_type: Some(RexType::Literal(Literal {
                literal_type: Some(LiteralType::I64(value)),
                ..Default::default()
            })),
        }
    }

    pub fn scalar_call(
        anchor: u32,
        arguments: Vec<Expression>,
        output_type: Option<Type>,
    ) -> Expression {
        Expression {
            rex_type: Some(RexType::ScalarFunction(ScalarFunction {
                function_reference: anchor,
                arguments: arguments
                    .into_iter()
                    .map(|e| FunctionArgument { arg_type: Some(ArgType::Value(e)) })
                    .collect(),
                output_type,
                ..Default::default()
            })),
        }
    }
}
