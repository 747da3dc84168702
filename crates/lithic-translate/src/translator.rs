//! Top-level plan walk
//!
//! [`PlanTranslator`] owns the per-call dispatch over relation kinds and
//! the little state that crosses relations: the function anchor table and
//! the most recent projection, which a table scan below it uses to decide
//! which columns survive a pushed-down filter.

use crate::aggregate::AggregatePlanner;
use crate::expr::{expression_position, ExprCompiler};
use crate::functions::FunctionAnchors;
use crate::join::JoinPlanner;
use crate::proto::{
    decode_generate_detail, decode_plan, decode_plan_json, GENERATE_DETAIL_TYPE_URL,
};
use crate::read::{is_local_files_read, remove_nullable_columns, ReadPlanner};
use crate::relbuilder::RelStepBuilders;
use crate::types::parse_named_struct;
use crate::TranslateError;
use lithic_plan::{Dag, ExecPlan, Schema, Step, StepKind};
use lithic_registry::{AggregateFunctions, BroadcastTables, ScalarFunctions, StoreCatalog};
use substrait::proto::fetch_rel::{CountMode, OffsetMode};
use substrait::proto::plan_rel::RelType as PlanRelType;
use substrait::proto::rel::RelType;
use substrait::proto::{
    AggregateRel, ConsistentPartitionWindowRel, Expression, ExtensionSingleRel, FetchRel,
    FilterRel, JoinRel, Plan, ProjectRel, ReadRel, Rel, RelRoot, SortRel,
};
use tracing::debug;

/// The shared lookup surfaces one translation works against.
#[derive(Clone, Copy)]
pub struct Registries<'a> {
    pub scalars: &'a dyn ScalarFunctions,
    pub aggregates: &'a dyn AggregateFunctions,
    pub stores: &'a dyn StoreCatalog,
    pub broadcast: &'a dyn BroadcastTables,
}

pub struct PlanTranslator<'a> {
    registries: Registries<'a>,
    builders: RelStepBuilders,
}

impl<'a> PlanTranslator<'a> {
    pub fn new(registries: Registries<'a>) -> Self {
        Self { registries, builders: RelStepBuilders::default() }
    }

    pub fn with_builders(registries: Registries<'a>, builders: RelStepBuilders) -> Self {
        Self { registries, builders }
    }

    /// Translates a binary-encoded plan.
    pub fn translate_bytes(&self, bytes: &[u8]) -> Result<ExecPlan, TranslateError> {
        self.translate(&decode_plan(bytes)?)
    }

    /// Translates a JSON-encoded plan.
    pub fn translate_json(&self, json: &str) -> Result<ExecPlan, TranslateError> {
        self.translate(&decode_plan_json(json)?)
    }

    pub fn translate(&self, plan: &Plan) -> Result<ExecPlan, TranslateError> {
        if tracing::enabled!(tracing::Level::DEBUG) {
            if let Ok(json) = serde_json::to_string(plan) {
                debug!(plan = %json, "translating plan");
            }
        }

        if plan.relations.len() != 1 {
            return Err(TranslateError::MalformedPlan(format!(
                "expected exactly one relation, got {}",
                plan.relations.len()
            )));
        }
        let Some(PlanRelType::Root(root)) = &plan.relations[0].rel_type else {
            return Err(TranslateError::MalformedPlan(
                "plan must end in a root relation".into(),
            ));
        };
        let input = root
            .input
            .as_ref()
            .ok_or_else(|| TranslateError::MalformedPlan("root relation without input".into()))?;

        let mut session = Session {
            anchors: FunctionAnchors::from_plan(plan),
            registries: self.registries,
            builders: &self.builders,
            last_project: None,
        };
        let mut exec = session.parse_rel(input)?;
        rename_output(&mut exec, root)?;
        Ok(exec)
    }
}

struct Session<'a> {
    anchors: FunctionAnchors,
    registries: Registries<'a>,
    builders: &'a RelStepBuilders,
    last_project: Option<&'a ProjectRel>,
}

impl<'a> Session<'a> {
    fn parse_rel(&mut self, rel: &'a Rel) -> Result<ExecPlan, TranslateError> {
        match rel.rel_type.as_ref() {
            Some(RelType::Read(read)) => self.parse_read(read),
            Some(RelType::Filter(filter)) => self.parse_filter(filter),
            Some(RelType::Project(project)) => self.parse_project(project),
            Some(RelType::ExtensionSingle(generate)) => self.parse_generate(generate),
            Some(RelType::Fetch(fetch)) => self.parse_fetch(fetch),
            Some(RelType::Aggregate(aggregate)) => self.parse_aggregate(aggregate),
            Some(RelType::Join(join)) => self.parse_join(join),
            Some(RelType::Sort(sort)) => self.parse_sort(sort),
            Some(RelType::Window(window)) => self.parse_window(window),
            other => Err(TranslateError::NotImplemented(format!(
                "relation kind {other:?}"
            ))),
        }
    }

    fn child(&mut self, input: Option<&'a Rel>, of: &str) -> Result<ExecPlan, TranslateError> {
        let input = input.ok_or_else(|| {
            TranslateError::MalformedPlan(format!("{of} relation without input"))
        })?;
        self.parse_rel(input)
    }

    fn compiler(&self) -> ExprCompiler<'_> {
        ExprCompiler::new(&self.anchors, self.registries.scalars)
    }

    fn parse_read(&mut self, rel: &ReadRel) -> Result<ExecPlan, TranslateError> {
        let restore: Option<Vec<usize>> = self.last_project.map(|project| {
            project
                .expressions
                .iter()
                .filter_map(|e| expression_position(e).ok())
                .collect()
        });
        self.last_project = None;
        let planner = ReadPlanner::new(
            &self.anchors,
            self.registries.scalars,
            self.registries.aggregates,
            self.registries.stores,
        );
        planner.plan(rel, restore.as_deref())
    }

    fn parse_filter(&mut self, rel: &'a FilterRel) -> Result<ExecPlan, TranslateError> {
        let mut plan = self.child(rel.input.as_deref(), "filter")?;
        let condition = rel.condition.as_deref().ok_or_else(|| {
            TranslateError::MalformedPlan("filter relation without condition".into())
        })?;

        let schema = plan.schema().clone();
        let mut dag = Dag::from_schema(&schema);
        let mut not_null_columns = Vec::new();
        let compiler = self.compiler();
        let (_, condition_name) = compiler.compile(&mut dag, condition, &mut not_null_columns, true)?;
        plan.push(Step::new(
            "Filter",
            StepKind::Filter { dag, condition: condition_name, remove_condition: true },
            schema,
        ));
        // A filter on a column proves it holds no nulls afterwards.
        remove_nullable_columns(&mut plan, &not_null_columns);
        Ok(plan)
    }

    /// The schema projection field references resolve against: reads that
    /// go through the store declare it explicitly, everything else exposes
    /// its current header.
    fn projection_read_schema(
        &self,
        input: &Rel,
        current: &Schema,
    ) -> Result<Schema, TranslateError> {
        match input.rel_type.as_ref() {
            Some(RelType::Read(read)) if !is_local_files_read(read) => {
                let named = read.base_schema.as_ref().ok_or_else(|| {
                    TranslateError::MalformedPlan("read relation without base schema".into())
                })?;
                parse_named_struct(named, self.registries.aggregates)
            }
            _ => Ok(current.clone()),
        }
    }

    fn parse_project(&mut self, rel: &'a ProjectRel) -> Result<ExecPlan, TranslateError> {
        let input = rel.input.as_deref().ok_or_else(|| {
            TranslateError::MalformedPlan("project relation without input".into())
        })?;
        // A read beneath this projection narrows its pushed-down scan to
        // the columns referenced here, so record it before descending.
        self.last_project = Some(rel);
        let mut plan = self.parse_rel(input)?;
        let read_schema = self.projection_read_schema(input, plan.schema())?;
        let dag = self
            .compiler()
            .compile_projection(&rel.expressions, plan.schema(), &read_schema)?;
        let output = dag.output_schema();
        plan.push(Step::new("Project", StepKind::Expression { dag }, output));
        Ok(plan)
    }

    fn parse_generate(&mut self, rel: &'a ExtensionSingleRel) -> Result<ExecPlan, TranslateError> {
        let detail = rel.detail.as_ref().ok_or_else(|| {
            TranslateError::MalformedPlan("extension relation without detail".into())
        })?;
        if detail.type_url != GENERATE_DETAIL_TYPE_URL {
            return Err(TranslateError::NotImplemented(format!(
                "extension relation {}",
                detail.type_url
            )));
        }
        let generate = decode_generate_detail(detail.value.as_ref())?;
        let generator = generate.generator.ok_or_else(|| {
            TranslateError::MalformedPlan("generate relation without generator".into())
        })?;

        let input = rel.input.as_deref().ok_or_else(|| {
            TranslateError::MalformedPlan("generate relation without input".into())
        })?;
        let mut plan = self.parse_rel(input)?;
        let read_schema = self.projection_read_schema(input, plan.schema())?;

        // The generator column always comes last.
        let mut expressions = generate.child_output;
        expressions.push(generator);
        let dag = self
            .compiler()
            .compile_projection(&expressions, plan.schema(), &read_schema)?;
        let output = dag.output_schema();
        plan.push(Step::new("Generate", StepKind::Expression { dag }, output));
        Ok(plan)
    }

    fn parse_fetch(&mut self, rel: &'a FetchRel) -> Result<ExecPlan, TranslateError> {
        let mut plan = self.child(rel.input.as_deref(), "fetch")?;
        let offset = match rel.offset_mode.as_ref() {
            Some(OffsetMode::Offset(offset)) => *offset,
            Some(OffsetMode::OffsetExpr(_)) => {
                return Err(TranslateError::NotImplemented("expression fetch offset".into()))
            }
            None => 0,
        };
        let count = match rel.count_mode.as_ref() {
            Some(CountMode::Count(count)) => *count,
            Some(CountMode::CountExpr(_)) => {
                return Err(TranslateError::NotImplemented("expression fetch count".into()))
            }
            None => -1,
        };
        let output = plan.schema().clone();
        plan.push(Step::new("Limit", StepKind::Limit { count, offset }, output));
        Ok(plan)
    }

    fn parse_aggregate(&mut self, rel: &'a AggregateRel) -> Result<ExecPlan, TranslateError> {
        let mut plan = self.child(rel.input.as_deref(), "aggregate")?;
        let planner = AggregatePlanner::new(
            &self.anchors,
            self.registries.scalars,
            self.registries.aggregates,
        );
        planner.plan(&mut plan, rel)?;
        self.last_project = None;
        Ok(plan)
    }

    fn parse_join(&mut self, rel: &'a JoinRel) -> Result<ExecPlan, TranslateError> {
        // A projection above the join must not leak into either scan.
        self.last_project = None;
        let left = self.child(rel.left.as_deref(), "join")?;
        self.last_project = None;
        let right = self.child(rel.right.as_deref(), "join")?;
        self.last_project = None;
        let planner = JoinPlanner::new(
            &self.anchors,
            self.registries.scalars,
            self.registries.broadcast,
        );
        planner.plan(rel, left, right)
    }

    fn parse_sort(&mut self, rel: &'a SortRel) -> Result<ExecPlan, TranslateError> {
        let mut plan = self.child(rel.input.as_deref(), "sort")?;
        self.builders.sort().build(&self.anchors, rel, &mut plan)?;
        Ok(plan)
    }

    fn parse_window(
        &mut self,
        rel: &'a ConsistentPartitionWindowRel,
    ) -> Result<ExecPlan, TranslateError> {
        let mut plan = self.child(rel.input.as_deref(), "window")?;
        self.builders.window().build(&self.anchors, rel, &mut plan)?;
        Ok(plan)
    }
}

/// The root relation names the output columns positionally; a final
/// projection renames the translated header to match.
fn rename_output(plan: &mut ExecPlan, root: &RelRoot) -> Result<(), TranslateError> {
    if root.names.is_empty() {
        return Ok(());
    }
    let schema = plan.schema().clone();
    if schema.len() != root.names.len() {
        return Err(TranslateError::MalformedPlan(format!(
            "root names {} columns, plan produces {}",
            root.names.len(),
            schema.len()
        )));
    }
    let mut dag = Dag::from_schema(&schema);
    let aliases: Vec<(String, String)> = schema
        .iter()
        .zip(&root.names)
        .map(|(column, name)| (column.name.clone(), name.clone()))
        .collect();
    dag.project(&aliases)?;
    let output = dag.output_schema();
    plan.push(Step::new("Rename Output", StepKind::Expression { dag }, output));
    Ok(())
}

/// Compile an expression list against an explicit read schema. Exposed for
/// embedders that drive projection compilation outside a full plan walk.
pub fn compile_expressions(
    anchors: &FunctionAnchors,
    scalars: &dyn ScalarFunctions,
    expressions: &[Expression],
    input_schema: &Schema,
    read_schema: &Schema,
) -> Result<Dag, TranslateError> {
    ExprCompiler::new(anchors, scalars).compile_projection(expressions, input_schema, read_schema)
}
