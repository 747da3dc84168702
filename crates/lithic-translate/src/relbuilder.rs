//! Pluggable builders for the ordering-style relations
//!
//! Sort and window relations share a shape: they keep the input header
//! (windows append computed columns) and are described entirely by sort
//! fields and function references. Each gets a builder trait with a
//! default implementation, collected in a factory so embedders can swap
//! either without touching the translator's dispatch.

use crate::expr::expression_position;
use crate::functions::{base_name, FunctionAnchors};
use crate::types::external_to_internal;
use crate::TranslateError;
use lithic_plan::{Column, ExecPlan, Schema, SortColumn, Step, StepKind, WindowCall};
use substrait::proto::function_argument::ArgType;
use substrait::proto::sort_field::{SortDirection, SortKind};
use substrait::proto::{ConsistentPartitionWindowRel, SortField, SortRel};

fn sort_column(schema: &Schema, field: &SortField) -> Result<SortColumn, TranslateError> {
    let expr = field
        .expr
        .as_ref()
        .ok_or_else(|| TranslateError::MalformedPlan("sort field without expression".into()))?;
    let position = expression_position(expr)?;
    let column = schema.column_at(position).ok_or_else(|| {
        TranslateError::MalformedPlan(format!("sort key {position} out of range"))
    })?;

    let direction = match field.sort_kind.as_ref() {
        Some(SortKind::Direction(direction)) => *direction,
        _ => {
            return Err(TranslateError::NotImplemented(
                "comparison-function sort keys".into(),
            ))
        }
    };
    let (descending, nulls_first) = match SortDirection::try_from(direction) {
        Ok(SortDirection::AscNullsFirst) => (false, true),
        Ok(SortDirection::AscNullsLast) => (false, false),
        Ok(SortDirection::DescNullsFirst) => (true, true),
        Ok(SortDirection::DescNullsLast) => (true, false),
        other => {
            return Err(TranslateError::MalformedPlan(format!(
                "unrecognized sort direction {other:?}"
            )))
        }
    };
    Ok(SortColumn { column: column.name.clone(), descending, nulls_first })
}

pub trait SortStepBuilder: Send + Sync {
    fn build(
        &self,
        anchors: &FunctionAnchors,
        rel: &SortRel,
        plan: &mut ExecPlan,
    ) -> Result<(), TranslateError>;
}

pub trait WindowStepBuilder: Send + Sync {
    fn build(
        &self,
        anchors: &FunctionAnchors,
        rel: &ConsistentPartitionWindowRel,
        plan: &mut ExecPlan,
    ) -> Result<(), TranslateError>;
}

struct DefaultSortStepBuilder;

impl SortStepBuilder for DefaultSortStepBuilder {
    fn build(
        &self,
        _anchors: &FunctionAnchors,
        rel: &SortRel,
        plan: &mut ExecPlan,
    ) -> Result<(), TranslateError> {
        let keys = rel
            .sorts
            .iter()
            .map(|field| sort_column(plan.schema(), field))
            .collect::<Result<Vec<_>, _>>()?;
        let output = plan.schema().clone();
        plan.push(Step::new("Sort", StepKind::Sort { keys }, output));
        Ok(())
    }
}

struct DefaultWindowStepBuilder;

impl WindowStepBuilder for DefaultWindowStepBuilder {
    fn build(
        &self,
        anchors: &FunctionAnchors,
        rel: &ConsistentPartitionWindowRel,
        plan: &mut ExecPlan,
    ) -> Result<(), TranslateError> {
        let schema = plan.schema().clone();

        let mut functions = Vec::with_capacity(rel.window_functions.len());
        for call in &rel.window_functions {
            let signature = anchors.resolve(call.function_reference)?;
            let function = base_name(signature).to_string();

            let mut arguments = Vec::with_capacity(call.arguments.len());
            for argument in &call.arguments {
                let Some(ArgType::Value(expr)) = argument.arg_type.as_ref() else {
                    return Err(TranslateError::MalformedPlan(
                        "window function argument without a value".into(),
                    ));
                };
                let position = expression_position(expr)?;
                let column = schema.column_at(position).ok_or_else(|| {
                    TranslateError::MalformedPlan(format!(
                        "window argument {position} out of range"
                    ))
                })?;
                arguments.push(column.name.clone());
            }

            let output_type = call.output_type.as_ref().ok_or_else(|| {
                TranslateError::MalformedPlan("window function without output type".into())
            })?;
            let result_type = external_to_internal(output_type)?;
            let column_name = format!("{function}({})", arguments.join(","));
            functions.push(WindowCall { column_name, function, arguments, result_type });
        }

        let partition_by = rel
            .partition_expressions
            .iter()
            .map(|expr| {
                let position = expression_position(expr)?;
                schema
                    .column_at(position)
                    .map(|c| c.name.clone())
                    .ok_or_else(|| {
                        TranslateError::MalformedPlan(format!(
                            "partition key {position} out of range"
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let order_by = rel
            .sorts
            .iter()
            .map(|field| sort_column(&schema, field))
            .collect::<Result<Vec<_>, _>>()?;

        let mut output = schema;
        for call in &functions {
            output.push(Column::new(call.column_name.clone(), call.result_type.clone()));
        }
        plan.push(Step::new(
            "Window",
            StepKind::Window { functions, partition_by, order_by },
            output,
        ));
        Ok(())
    }
}

/// The builder set used by one translation.
pub struct RelStepBuilders {
    sort: Box<dyn SortStepBuilder>,
    window: Box<dyn WindowStepBuilder>,
}

impl Default for RelStepBuilders {
    fn default() -> Self {
        Self {
            sort: Box::new(DefaultSortStepBuilder),
            window: Box::new(DefaultWindowStepBuilder),
        }
    }
}

impl RelStepBuilders {
    pub fn with_sort(mut self, builder: Box<dyn SortStepBuilder>) -> Self {
        self.sort = builder;
        self
    }

    pub fn with_window(mut self, builder: Box<dyn WindowStepBuilder>) -> Self {
        self.window = builder;
        self
    }

    pub fn sort(&self) -> &dyn SortStepBuilder {
        self.sort.as_ref()
    }

    pub fn window(&self) -> &dyn WindowStepBuilder {
        self.window.as_ref()
    }
}
