//! Aggregation planning
//!
//! An aggregate relation arrives split across distributed phases: the same
//! logical aggregation appears once computing partial states and again
//! merging them. This module validates the phase combination, builds the
//! pre-projection the aggregate step needs (literal arguments and
//! nullability wrapping), resolves each measure to a plain or
//! `PartialMerge` aggregate instance, and reconciles the final phase's
//! output types with what the plan declares.

use crate::expr::{expression_position, ExprCompiler};
use crate::functions::{self, FunctionAnchors};
use crate::types::{external_to_internal, is_type_matched};
use crate::TranslateError;
use lithic_plan::{
    AggregateCall, Column, Dag, ExecPlan, Schema, Step, StepKind,
};
use lithic_registry::{AggregateFunctions, ScalarFunctions};
use std::collections::{BTreeSet, HashMap};
use substrait::proto::function_argument::ArgType;
use substrait::proto::{aggregate_rel, AggregateRel, AggregationPhase, Expression};
use tracing::debug;

pub struct AggregatePlanner<'a> {
    anchors: &'a FunctionAnchors,
    scalars: &'a dyn ScalarFunctions,
    aggregates: &'a dyn AggregateFunctions,
}

fn measure_function(
    measure: &aggregate_rel::Measure,
) -> Result<&substrait::proto::AggregateFunction, TranslateError> {
    measure
        .measure
        .as_ref()
        .ok_or_else(|| TranslateError::MalformedPlan("aggregate measure without function".into()))
}

fn measure_argument(
    function: &substrait::proto::AggregateFunction,
) -> Result<&Expression, TranslateError> {
    if function.arguments.len() != 1 {
        return Err(TranslateError::MalformedPlan(
            "only single-argument aggregate functions are supported".into(),
        ));
    }
    match function.arguments[0].arg_type.as_ref() {
        Some(ArgType::Value(e)) => Ok(e),
        other => Err(TranslateError::MalformedPlan(format!(
            "unsupported aggregate argument {other:?}"
        ))),
    }
}

/// Group-key positions of the relation's single grouping set. Every
/// grouping expression must be a direct column reference.
fn grouping_positions(rel: &AggregateRel) -> Result<Vec<usize>, TranslateError> {
    match rel.groupings.len() {
        0 => Ok(Vec::new()),
        1 => {
            let grouping = &rel.groupings[0];
            let mut keys = Vec::new();
            // The older encoding carries expressions inline; the newer one
            // references the relation-level expression list.
            #[allow(deprecated)]
            if !grouping.grouping_expressions.is_empty() {
                for expr in &grouping.grouping_expressions {
                    keys.push(expression_position(expr)?);
                }
            } else {
                for reference in &grouping.expression_references {
                    let expr =
                        rel.grouping_expressions.get(*reference as usize).ok_or_else(|| {
                            TranslateError::MalformedPlan(format!(
                                "grouping expression reference {reference} out of range"
                            ))
                        })?;
                    keys.push(expression_position(expr)?);
                }
            }
            Ok(keys)
        }
        n => Err(TranslateError::MalformedPlan(format!(
            "too many groupings: {n}"
        ))),
    }
}

impl<'a> AggregatePlanner<'a> {
    pub fn new(
        anchors: &'a FunctionAnchors,
        scalars: &'a dyn ScalarFunctions,
        aggregates: &'a dyn AggregateFunctions,
    ) -> Self {
        Self { anchors, scalars, aggregates }
    }

    /// Appends the aggregation (and any projection steps it needs) to
    /// `plan`. Returns whether this relation produces final results.
    pub fn plan(&self, plan: &mut ExecPlan, rel: &AggregateRel) -> Result<bool, TranslateError> {
        let mut phases = BTreeSet::new();
        for measure in &rel.measures {
            phases.insert(measure_function(measure)?.phase);
        }
        let has_first = phases.contains(&(AggregationPhase::InitialToIntermediate as i32));
        let has_inter = phases.contains(&(AggregationPhase::IntermediateToIntermediate as i32));
        let has_final = phases.contains(&(AggregationPhase::IntermediateToResult as i32));

        if phases.len() > 1 && !(phases.len() == 2 && has_first && has_inter) {
            // Initial alongside intermediate-merge is the only legal pair.
            return Err(TranslateError::MalformedPlan("too many aggregate phases".into()));
        }

        let (measure_names, nullable_measure_names) = self.pre_project(plan, rel)?;

        let keys = grouping_positions(rel)?;

        let current = plan.schema().clone();
        let mut calls = Vec::with_capacity(rel.measures.len());
        for (i, measure) in rel.measures.iter().enumerate() {
            let function = measure_function(measure)?;
            let signature = self.anchors.resolve(function.function_reference)?;
            let name = functions::base_name(signature).to_string();

            let initial = function.phase == AggregationPhase::InitialToIntermediate as i32;
            let column_name = if initial {
                format!("{name}({})", measure_names[i])
            } else {
                measure_names[i].clone()
            };

            let input_column = nullable_measure_names
                .get(&measure_names[i])
                .unwrap_or(&measure_names[i]);
            let position = current.position_of(input_column).ok_or_else(|| {
                TranslateError::MalformedPlan(format!(
                    "aggregate argument column {input_column} not in input"
                ))
            })?;
            let argument_type = &current.columns()[position].data_type;

            let resolved = if argument_type.is_aggregate_state() {
                self.aggregates.resolve(&format!("{name}PartialMerge"), argument_type)?
            } else if !initial {
                // Later phases merge the state the plain function would
                // have produced over this argument.
                let plain = self.aggregates.resolve(&name, argument_type)?;
                self.aggregates
                    .resolve(&format!("{name}PartialMerge"), &plain.state_type)?
            } else {
                self.aggregates.resolve(&name, argument_type)?
            };

            calls.push(AggregateCall {
                column_name,
                function: resolved.name,
                argument: position,
                state_type: resolved.state_type,
                result_type: resolved.result_type,
            });
        }

        let mut output = Schema::default();
        for key in &keys {
            let column = current.column_at(*key).ok_or_else(|| {
                TranslateError::MalformedPlan(format!("group key {key} out of range"))
            })?;
            output.push(column.clone());
        }
        for call in &calls {
            let data_type =
                if has_final { call.result_type.clone() } else { call.state_type.clone() };
            output.push(Column::new(call.column_name.clone(), data_type));
        }

        let description = if has_final { "Merging Aggregate" } else { "Aggregate" };
        debug!(step = description, keys = keys.len(), measures = calls.len());
        plan.push(Step::new(
            description,
            StepKind::Aggregate { keys, aggregates: calls, merging: has_final },
            output,
        ));

        if has_final {
            self.convert_final_output(plan, rel)?;
        }
        Ok(has_final)
    }

    /// Materializes literal measure arguments and wraps not-yet-nullable
    /// arguments whose initial-phase measure declares a nullable result.
    /// Returns the per-measure argument names and the substitutions made
    /// by the wrapping.
    fn pre_project(
        &self,
        plan: &mut ExecPlan,
        rel: &AggregateRel,
    ) -> Result<(Vec<String>, HashMap<String, String>), TranslateError> {
        let input = plan.schema().clone();
        let compiler = ExprCompiler::new(self.anchors, self.scalars);
        let mut dag = Dag::from_schema(&input);

        let mut measure_names = Vec::with_capacity(rel.measures.len());
        let mut to_wrap = Vec::new();
        let mut need_pre_project = false;

        for measure in &rel.measures {
            let function = measure_function(measure)?;
            let declared = function.output_type.as_ref().ok_or_else(|| {
                TranslateError::MalformedPlan("aggregate measure without output type".into())
            })?;
            let declared_type = external_to_internal(declared)?;
            let argument = measure_argument(function)?;

            let name = match &argument.rex_type {
                Some(substrait::proto::expression::RexType::Selection(reference)) => {
                    let position = crate::expr::selection_position(reference)?;
                    input
                        .column_at(position)
                        .ok_or_else(|| {
                            TranslateError::MalformedPlan(format!(
                                "aggregate argument {position} out of range"
                            ))
                        })?
                        .name
                        .clone()
                }
                Some(substrait::proto::expression::RexType::Literal(_)) => {
                    let node = compiler.compile_argument(&mut dag, argument)?;
                    dag.add_or_replace_output(node);
                    need_pre_project = true;
                    dag.node(node).result_name.clone()
                }
                other => {
                    return Err(TranslateError::MalformedPlan(format!(
                        "unsupported aggregate argument kind {other:?}"
                    )))
                }
            };

            let current_nullable = dag
                .find_in_output(&name)
                .map(|id| dag.node(id).result_type.is_nullable())
                .unwrap_or(false);
            if declared_type.is_nullable()
                && function.phase == AggregationPhase::InitialToIntermediate as i32
                && !current_nullable
            {
                to_wrap.push(name.clone());
                need_pre_project = true;
            }
            measure_names.push(name);
        }

        let mut nullable_measure_names = HashMap::new();
        for name in to_wrap {
            let source = dag
                .find_in_output(&name)
                .ok_or_else(|| TranslateError::MalformedPlan(format!("column {name} vanished")))?;
            let wrapped_type = dag.node(source).result_type.clone().wrap_nullable(true);
            let wrapped_name = format!("toNullable({name})");
            let node = dag.add_function("toNullable", vec![source], wrapped_type, wrapped_name.clone());
            dag.add_or_replace_output(node);
            nullable_measure_names.insert(name, wrapped_name);
        }

        if need_pre_project {
            let output = dag.output_schema();
            plan.push(Step::new("Before Aggregate", StepKind::Expression { dag }, output));
        }
        Ok((measure_names, nullable_measure_names))
    }

    /// Position-wise conversion of the merged output to the declared
    /// measure types, appended only when some column disagrees.
    fn convert_final_output(
        &self,
        plan: &mut ExecPlan,
        rel: &AggregateRel,
    ) -> Result<(), TranslateError> {
        let source = plan.schema().clone();
        let mut dag = Dag::from_schema(&source);
        let mut need_convert = false;

        for measure in &rel.measures {
            let function = measure_function(measure)?;
            let position = expression_position(measure_argument(function)?)?;
            let declared = function.output_type.as_ref().ok_or_else(|| {
                TranslateError::MalformedPlan("aggregate measure without output type".into())
            })?;
            let column = source.column_at(position).ok_or_else(|| {
                TranslateError::MalformedPlan(format!(
                    "measure position {position} out of merged output range"
                ))
            })?;
            if is_type_matched(declared, &column.data_type) {
                continue;
            }

            let conversion = functions::conversion_function(declared)?;
            let input = dag.input_at(position)?;
            let mut args = vec![input];
            if conversion.starts_with("toDecimal") {
                let scale = match declared.kind.as_ref() {
                    Some(substrait::proto::r#type::Kind::Decimal(d)) => d.scale as u32,
                    _ => 0,
                };
                let scale_node = dag.add_constant(
                    lithic_plan::TypedValue::new(
                        lithic_plan::DataType::UInt32,
                        lithic_plan::ScalarValue::UInt32(scale),
                    ),
                    lithic_plan::unique_name(&scale.to_string()),
                );
                args.push(scale_node);
            }
            let target_type = external_to_internal(declared)?;
            // Same name, converted type, same position in the output.
            let node = dag.add_function(conversion, args, target_type, column.name.clone());
            dag.add_or_replace_output(node);
            need_convert = true;
        }

        if need_convert {
            let output = dag.output_schema();
            plan.push(Step::new(
                "Convert Aggregate Output",
                StepKind::Expression { dag },
                output,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::test_support::{anchors, selection};
    use lithic_plan::DataType;
    use lithic_registry::{BuiltinAggregateFunctions, BuiltinScalarFunctions};
    use substrait::proto::r#type::{Kind, Nullability};
    use substrait::proto::{AggregateFunction, FunctionArgument, Type};

    fn i64_output(nullable: bool) -> Type {
        Type {
            kind: Some(Kind::I64(substrait::proto::r#type::I64 {
                nullability: if nullable {
                    Nullability::Nullable as i32
                } else {
                    Nullability::Required as i32
                },
                ..Default::default()
            })),
        }
    }

    fn measure(anchor: u32, argument: usize, phase: AggregationPhase) -> aggregate_rel::Measure {
        aggregate_rel::Measure {
            measure: Some(AggregateFunction {
                function_reference: anchor,
                arguments: vec![FunctionArgument {
                    arg_type: Some(ArgType::Value(selection(argument as i32))),
                }],
                output_type: Some(i64_output(false)),
                phase: phase as i32,
                ..Default::default()
            }),
            filter: None,
        }
    }

    fn source_plan() -> ExecPlan {
        ExecPlan::leaf(Step::new(
            "scan",
            StepKind::FileScan { paths: vec!["/data/t.col".into()] },
            Schema::new(vec![
                Column::new("k", DataType::Int32),
                Column::new("v", DataType::Int64),
            ]),
        ))
    }

    #[test]
    fn initial_phase_names_and_state_output() {
        let anchors = anchors(&[(1, "sum:i64")]);
        let scalars = BuiltinScalarFunctions;
        let aggs = BuiltinAggregateFunctions;
        let planner = AggregatePlanner::new(&anchors, &scalars, &aggs);
        let mut plan = source_plan();
        let rel = AggregateRel {
            measures: vec![measure(1, 1, AggregationPhase::InitialToIntermediate)],
            ..Default::default()
        };
        let is_final = planner.plan(&mut plan, &rel).unwrap();
        assert!(!is_final);
        let schema = plan.schema();
        assert_eq!(schema.names(), vec!["sum(v)"]);
        assert!(schema.column_at(0).unwrap().data_type.is_aggregate_state());
    }

    #[test]
    fn mixed_initial_and_result_phases_are_rejected() {
        let anchors = anchors(&[(1, "sum:i64"), (2, "count:i64")]);
        let scalars = BuiltinScalarFunctions;
        let aggs = BuiltinAggregateFunctions;
        let planner = AggregatePlanner::new(&anchors, &scalars, &aggs);
        let mut plan = source_plan();
        let rel = AggregateRel {
            measures: vec![
                measure(1, 1, AggregationPhase::InitialToIntermediate),
                measure(2, 1, AggregationPhase::IntermediateToResult),
            ],
            ..Default::default()
        };
        let err = planner.plan(&mut plan, &rel).unwrap_err();
        assert!(matches!(err, TranslateError::MalformedPlan(m) if m.contains("too many aggregate phases")));
    }

    #[test]
    fn merging_phase_resolves_partial_merge_over_state() {
        let anchors = anchors(&[(1, "sum:i64")]);
        let scalars = BuiltinScalarFunctions;
        let aggs = BuiltinAggregateFunctions;
        let planner = AggregatePlanner::new(&anchors, &scalars, &aggs);
        let state = DataType::AggregateState {
            function: "sum".into(),
            argument: Box::new(DataType::Int64),
        };
        let mut plan = ExecPlan::leaf(Step::new(
            "scan",
            StepKind::IteratorSource { index: 0 },
            Schema::new(vec![Column::new("sum(v)", state)]),
        ));
        let rel = AggregateRel {
            measures: vec![measure(1, 0, AggregationPhase::IntermediateToResult)],
            ..Default::default()
        };
        let is_final = planner.plan(&mut plan, &rel).unwrap();
        assert!(is_final);
        let schema = plan.schema();
        assert_eq!(schema.names(), vec!["sum(v)"]);
        assert_eq!(schema.column_at(0).unwrap().data_type, DataType::Int64);
    }

    #[test]
    fn group_keys_lead_the_output() {
        #[allow(deprecated)]
        let grouping = aggregate_rel::Grouping {
            grouping_expressions: vec![selection(0)],
            ..Default::default()
        };
        let anchors = anchors(&[(1, "sum:i64")]);
        let scalars = BuiltinScalarFunctions;
        let aggs = BuiltinAggregateFunctions;
        let planner = AggregatePlanner::new(&anchors, &scalars, &aggs);
        let mut plan = source_plan();
        let rel = AggregateRel {
            groupings: vec![grouping],
            measures: vec![measure(1, 1, AggregationPhase::InitialToIntermediate)],
            ..Default::default()
        };
        planner.plan(&mut plan, &rel).unwrap();
        assert_eq!(plan.schema().names(), vec!["k", "sum(v)"]);
    }
}
