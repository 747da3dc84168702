//! Executable operator plan
//!
//! A tree of steps: linear chains of single-input steps, with joins
//! uniting two sub-plans. Every step carries a human-readable description
//! label and the schema of its output, which is the contract downstream
//! consumers rely on positionally and by declared type.

use crate::{DataType, Dag, Schema};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinStrictness {
    All,
    Semi,
    Anti,
}

/// One resolved aggregate in an aggregation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateCall {
    /// Output column name.
    pub column_name: String,
    /// Resolved internal function, possibly the `PartialMerge` variant.
    pub function: String,
    /// Input column position of the single argument.
    pub argument: usize,
    pub state_type: DataType,
    pub result_type: DataType,
}

/// A filter evaluated at scan time, before full row materialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushdownFilter {
    pub dag: Dag,
    /// Name of the condition column inside `dag`.
    pub condition: String,
    /// Columns restored after the filter is applied.
    pub keep: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortColumn {
    pub column: String,
    pub descending: bool,
    pub nulls_first: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowCall {
    pub column_name: String,
    pub function: String,
    pub arguments: Vec<String>,
    pub result_type: DataType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StepKind {
    /// Rows pulled from a host-provided iterator, bound by index.
    IteratorSource { index: usize },
    /// Columnar file scan.
    FileScan { paths: Vec<String> },
    /// Table-backed store scan restricted to the selected parts.
    TableScan {
        namespace: String,
        table: String,
        parts: Vec<String>,
        pushdown: Option<PushdownFilter>,
    },
    /// Row-wise expression evaluation (projections, renames, conversions).
    Expression { dag: Dag },
    /// Keeps rows for which the condition column is truthy.
    Filter {
        dag: Dag,
        condition: String,
        remove_condition: bool,
    },
    Limit { count: i64, offset: i64 },
    Aggregate {
        keys: Vec<usize>,
        aggregates: Vec<AggregateCall>,
        /// Merging steps consume intermediate states and emit results.
        merging: bool,
    },
    /// Two-input hash join; the plan node has exactly two children.
    Join {
        kind: JoinKind,
        strictness: JoinStrictness,
        keys: Vec<(String, String)>,
    },
    /// Probe of a pre-built broadcast side table; single input.
    BroadcastJoin {
        kind: JoinKind,
        strictness: JoinStrictness,
        keys: Vec<(String, String)>,
        side_table: String,
    },
    Sort { keys: Vec<SortColumn> },
    Window {
        functions: Vec<WindowCall>,
        partition_by: Vec<String>,
        order_by: Vec<SortColumn>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub description: String,
    pub kind: StepKind,
    pub output: Schema,
}

impl Step {
    pub fn new(description: impl Into<String>, kind: StepKind, output: Schema) -> Self {
        Self { description: description.into(), kind, output }
    }
}

/// The executable plan: a step tree built bottom-up during translation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecPlan {
    children: Vec<ExecPlan>,
    steps: Vec<Step>,
}

impl ExecPlan {
    /// A plan rooted at a leaf step (a scan).
    pub fn leaf(step: Step) -> Self {
        Self { children: Vec::new(), steps: vec![step] }
    }

    /// Unites sub-plans under a multi-input step (the join case).
    pub fn unite(step: Step, children: Vec<ExecPlan>) -> Self {
        Self { children, steps: vec![step] }
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// The current output schema: what the next appended step will see.
    pub fn schema(&self) -> &Schema {
        &self
            .steps
            .last()
            .expect("an ExecPlan always holds at least one step")
            .output
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn children(&self) -> &[ExecPlan] {
        &self.children
    }

    pub fn last_step(&self) -> &Step {
        self.steps.last().expect("an ExecPlan always holds at least one step")
    }
}
