//! Join planning
//!
//! Reconciles the two sides of a join relation into one step: key pairs
//! extracted from the conjunctive equality condition, right-side column
//! names qualified against the left, key types converted to a common
//! supertype on each side, and the output reordered to the positional
//! contract (left columns, then the registered right columns). A broadcast
//! hint in the relation's optimization side channel switches to probing a
//! pre-built side table instead of building a fresh hash join.

use crate::expr::{expression_position, ExprCompiler};
use crate::functions::{self, FunctionAnchors};
use crate::proto::decode_string_payload;
use crate::TranslateError;
use lithic_plan::{
    unique_name, Column, DataType, Dag, ExecPlan, JoinKind, JoinStrictness, Schema, Step,
    StepKind,
};
use lithic_registry::{BroadcastTables, ScalarFunctions};
use substrait::proto::expression::RexType;
use substrait::proto::function_argument::ArgType;
use substrait::proto::{join_rel, Expression, JoinRel};
use tracing::debug;

/// Planner hints carried in the join's optimization side channel.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct JoinOptimization {
    pub is_broadcast: bool,
    pub side_table_key: String,
}

/// Parses the `key=value` line format of the optimization blob. Unknown
/// keys are ignored.
pub fn parse_join_optimization(blob: &str) -> JoinOptimization {
    let mut info = JoinOptimization::default();
    let blob = blob.strip_prefix("JoinParameters:").unwrap_or(blob);
    for line in blob.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "isBHJ" => info.is_broadcast = matches!(value.trim(), "1" | "true"),
            "buildHashTableId" => info.side_table_key = value.trim().to_string(),
            _ => {}
        }
    }
    info
}

pub struct JoinPlanner<'a> {
    anchors: &'a FunctionAnchors,
    scalars: &'a dyn ScalarFunctions,
    broadcast: &'a dyn BroadcastTables,
}

/// The conversion function that produces `target`'s base type, plus the
/// scale constant it takes, if any.
fn internal_conversion(target: &DataType) -> Result<(&'static str, Option<u32>), TranslateError> {
    let pair = match target.strip_nullable() {
        DataType::UInt8 => ("toUInt8", None),
        DataType::UInt16 => ("toUInt16", None),
        DataType::UInt32 => ("toUInt32", None),
        DataType::UInt64 => ("toUInt64", None),
        DataType::Int8 => ("toInt8", None),
        DataType::Int16 => ("toInt16", None),
        DataType::Int32 => ("toInt32", None),
        DataType::Int64 => ("toInt64", None),
        DataType::Float32 => ("toFloat32", None),
        DataType::Float64 => ("toFloat64", None),
        DataType::String => ("toString", None),
        DataType::Date => ("toDate32", None),
        DataType::Timestamp { precision } => ("toDateTime64", Some(*precision)),
        DataType::Decimal { precision, scale } => {
            let name = functions::decimal_conversion(*precision, false)?;
            let name: &'static str = match name.as_str() {
                "toDecimal32" => "toDecimal32",
                "toDecimal64" => "toDecimal64",
                _ => "toDecimal128",
            };
            return Ok((name, Some(*scale)));
        }
        other => {
            return Err(TranslateError::UnsupportedType(format!(
                "no conversion into engine type {other}"
            )))
        }
    };
    Ok(pair)
}

/// Appends a position-wise conversion step so the plan's output matches
/// `target` exactly (names, types, nullability). No step is appended when
/// it already does.
fn convert_to_schema(
    plan: &mut ExecPlan,
    target: &Schema,
    description: &str,
) -> Result<(), TranslateError> {
    let source = plan.schema().clone();
    if source == *target {
        return Ok(());
    }
    if source.len() != target.len() {
        return Err(TranslateError::MalformedPlan(format!(
            "cannot convert a {}-column row into {} columns",
            source.len(),
            target.len()
        )));
    }

    let mut dag = Dag::from_schema(&source);
    let mut aliases = Vec::with_capacity(target.len());
    for (position, want) in target.iter().enumerate() {
        let have = &source.columns()[position];
        let mut node = dag.input_at(position)?;

        if have.data_type.strip_nullable() != want.data_type.strip_nullable() {
            let (conversion, scale) = internal_conversion(&want.data_type)?;
            let mut args = vec![node];
            if let Some(scale) = scale {
                args.push(dag.add_constant(
                    lithic_plan::TypedValue::new(
                        DataType::UInt32,
                        lithic_plan::ScalarValue::UInt32(scale),
                    ),
                    unique_name(&scale.to_string()),
                ));
            }
            let name = format!("{conversion}({})", dag.node(node).result_name);
            let base = want.data_type.strip_nullable().clone();
            let converted =
                base.wrap_nullable(dag.node(node).result_type.is_nullable());
            node = dag.add_function(conversion, args, converted, name);
        }
        if want.data_type.is_nullable() && !dag.node(node).result_type.is_nullable() {
            let name = format!("toNullable({})", dag.node(node).result_name);
            let wrapped = dag.node(node).result_type.clone().wrap_nullable(true);
            node = dag.add_function("toNullable", vec![node], wrapped, name);
        }

        dag.add_or_replace_output(node);
        aliases.push((dag.node(node).result_name.clone(), want.name.clone()));
    }
    dag.project(&aliases)?;
    let output = dag.output_schema();
    plan.push(Step::new(description, StepKind::Expression { dag }, output));
    Ok(())
}

/// Extracts equality key pairs from an `and`/`equals` condition tree.
/// Right positions arrive offset by the left side's width and are
/// normalized here.
pub fn collect_join_keys(
    anchors: &FunctionAnchors,
    condition: &Expression,
    keys: &mut Vec<(usize, usize)>,
    right_offset: usize,
) -> Result<(), TranslateError> {
    let Some(RexType::ScalarFunction(func)) = &condition.rex_type else {
        return Err(TranslateError::MalformedPlan(format!(
            "join condition must be a function call: {condition:?}"
        )));
    };
    let signature = anchors.resolve(func.function_reference)?;
    let name = functions::target_name(signature, func)?;

    let argument = |index: usize| -> Result<&Expression, TranslateError> {
        match func.arguments.get(index).and_then(|a| a.arg_type.as_ref()) {
            Some(ArgType::Value(e)) => Ok(e),
            _ => Err(TranslateError::MalformedPlan(format!(
                "join condition argument {index} missing"
            ))),
        }
    };

    match name.as_str() {
        "and" => {
            collect_join_keys(anchors, argument(0)?, keys, right_offset)?;
            collect_join_keys(anchors, argument(1)?, keys, right_offset)?;
        }
        "equals" => {
            let left = expression_position(argument(0)?)?;
            let right = expression_position(argument(1)?)?;
            let right = right.checked_sub(right_offset).ok_or_else(|| {
                TranslateError::MalformedPlan(format!(
                    "right join key {right} references the left side"
                ))
            })?;
            keys.push((left, right));
        }
        other => {
            return Err(TranslateError::MalformedPlan(format!(
                "unsupported join condition operator {other}"
            )))
        }
    }
    Ok(())
}

impl<'a> JoinPlanner<'a> {
    pub fn new(
        anchors: &'a FunctionAnchors,
        scalars: &'a dyn ScalarFunctions,
        broadcast: &'a dyn BroadcastTables,
    ) -> Self {
        Self { anchors, scalars, broadcast }
    }

    pub fn plan(
        &self,
        rel: &JoinRel,
        mut left: ExecPlan,
        mut right: ExecPlan,
    ) -> Result<ExecPlan, TranslateError> {
        let optimization = rel
            .advanced_extension
            .as_ref()
            .and_then(|ext| ext.optimization.iter().next())
            .map(|any| decode_string_payload(any.value.as_ref()))
            .transpose()?
            .map(|blob| parse_join_optimization(&blob))
            .unwrap_or_default();

        let (kind, strictness) = match join_rel::JoinType::try_from(rel.r#type) {
            Ok(join_rel::JoinType::Inner) => (JoinKind::Inner, JoinStrictness::All),
            Ok(join_rel::JoinType::Left) => (JoinKind::Left, JoinStrictness::All),
            Ok(join_rel::JoinType::LeftSemi) => (JoinKind::Left, JoinStrictness::Semi),
            Ok(join_rel::JoinType::LeftAnti) => (JoinKind::Left, JoinStrictness::Anti),
            other => {
                return Err(TranslateError::NotImplemented(format!(
                    "join type {other:?}"
                )))
            }
        };

        if optimization.is_broadcast {
            let side = self.broadcast.get(&optimization.side_table_key).ok_or_else(|| {
                TranslateError::MalformedPlan(format!(
                    "broadcast table {} not registered",
                    optimization.side_table_key
                ))
            })?;
            convert_to_schema(&mut right, &side.schema, "Rename Broadcast Table")?;
        }

        // Qualify right-side names that collide with the left side.
        let prefix = format!("{}.", unique_name("right"));
        let mut renames = Vec::new();
        let mut registered = Schema::default();
        for column in right.schema().iter() {
            if left.schema().contains(&column.name) || registered.contains(&column.name) {
                let qualified = format!("{prefix}{}", column.name);
                renames.push((column.name.clone(), qualified.clone()));
                registered.push(Column::new(qualified, column.data_type.clone()));
            } else {
                registered.push(column.clone());
            }
        }
        if !renames.is_empty() {
            let source = right.schema().clone();
            let mut dag = Dag::from_schema(&source);
            let aliases: Vec<(String, String)> = source
                .iter()
                .map(|c| {
                    let renamed = renames
                        .iter()
                        .find(|(from, _)| *from == c.name)
                        .map(|(_, to)| to.clone())
                        .unwrap_or_else(|| c.name.clone());
                    (c.name.clone(), renamed)
                })
                .collect();
            dag.project(&aliases)?;
            let output = dag.output_schema();
            right.push(Step::new("Right Table Rename", StepKind::Expression { dag }, output));
        }

        let condition = rel.expression.as_deref().ok_or_else(|| {
            TranslateError::MalformedPlan("join without a key condition".into())
        })?;
        let mut key_positions = Vec::new();
        collect_join_keys(self.anchors, condition, &mut key_positions, left.schema().len())?;

        // Each side converts its own key columns to the pair's common
        // supertype.
        let mut left_target = left.schema().clone();
        let mut right_target = right.schema().clone();
        let mut keys = Vec::with_capacity(key_positions.len());
        for (l, r) in &key_positions {
            let left_column = left_target.column_at(*l).cloned().ok_or_else(|| {
                TranslateError::MalformedPlan(format!("left join key {l} out of range"))
            })?;
            let right_column = right_target.column_at(*r).cloned().ok_or_else(|| {
                TranslateError::MalformedPlan(format!("right join key {r} out of range"))
            })?;
            let common = left_column
                .data_type
                .common_supertype(&right_column.data_type)
                .ok_or_else(|| {
                    TranslateError::MalformedPlan(format!(
                        "join keys {} and {} have no common type",
                        left_column.data_type, right_column.data_type
                    ))
                })?;
            set_column_type(&mut left_target, *l, common.clone());
            set_column_type(&mut right_target, *r, common);
            keys.push((left_column.name, right_column.name));
        }
        convert_to_schema(&mut left, &left_target, "Convert Joined Columns")?;
        convert_to_schema(&mut right, &right_target, "Convert Joined Columns")?;

        let mut output = Schema::default();
        for column in left.schema().iter() {
            output.push(column.clone());
        }
        for column in registered.iter() {
            output.push(column.clone());
        }

        debug!(
            broadcast = optimization.is_broadcast,
            keys = keys.len(),
            "building join step"
        );
        let mut plan = if optimization.is_broadcast {
            let step = Step::new(
                "Broadcast Join",
                StepKind::BroadcastJoin {
                    kind,
                    strictness,
                    keys,
                    side_table: optimization.side_table_key,
                },
                output.clone(),
            );
            left.push(step);
            left
        } else {
            ExecPlan::unite(
                Step::new("Join", StepKind::Join { kind, strictness, keys }, output.clone()),
                vec![left, right],
            )
        };

        // Output order is a positional contract; make it explicit.
        let mut dag = Dag::from_schema(plan.schema());
        let aliases: Vec<(String, String)> =
            output.iter().map(|c| (c.name.clone(), c.name.clone())).collect();
        dag.project(&aliases)?;
        let reordered = dag.output_schema();
        plan.push(Step::new("Reorder Join Output", StepKind::Expression { dag }, reordered));

        if let Some(filter) = rel.post_join_filter.as_deref() {
            let schema = plan.schema().clone();
            let compiler = ExprCompiler::new(self.anchors, self.scalars);
            let mut dag = Dag::from_schema(&schema);
            let mut scratch = Vec::new();
            let (_, condition_name) = compiler.compile(&mut dag, filter, &mut scratch, true)?;
            plan.push(Step::new(
                "Post Join Filter",
                StepKind::Filter { dag, condition: condition_name, remove_condition: true },
                schema,
            ));
        }
        Ok(plan)
    }
}

fn set_column_type(schema: &mut Schema, position: usize, data_type: DataType) {
    let mut columns: Vec<Column> = schema.columns().to_vec();
    if let Some(column) = columns.get_mut(position) {
        column.data_type = data_type;
    }
    *schema = Schema::new(columns);
}
