//! Source relations: iterator bindings, file scans and table stores
//!
//! A read relation resolves to one of three leaf steps. A single local
//! file whose URI starts with `iterator` binds a host-provided row
//! iterator by index and never touches the store catalog. Other local
//! files become a columnar file scan. An extension table carries a JSON
//! detail blob naming a table store; the scan is restricted to the parts
//! whose block range the blob selects, and the relation's filter is pushed
//! down to scan time.

use crate::expr::ExprCompiler;
use crate::functions::FunctionAnchors;
use crate::proto::decode_string_payload;
use crate::types::parse_named_struct;
use crate::TranslateError;
use lithic_plan::{Dag, ExecPlan, PushdownFilter, Schema, Step, StepKind};
use lithic_registry::{AggregateFunctions, ScalarFunctions, StoreCatalog};
use serde::Deserialize;
use substrait::proto::expression::RexType;
use substrait::proto::read_rel::local_files::file_or_files::PathType;
use substrait::proto::read_rel::{ExtensionTable, LocalFiles, ReadType};
use substrait::proto::{Expression, ReadRel};
use tracing::debug;

const ITERATOR_PREFIX: &str = "iterator";

/// The table-store detail blob carried by an extension-table read.
#[derive(Debug, Deserialize)]
struct StoreTableDetail {
    database: String,
    table: String,
    relative_path: String,
    #[serde(default)]
    settings: serde_json::Value,
    min_block: i64,
    max_block: i64,
}

fn uri_file(files: &LocalFiles, index: usize) -> Option<&str> {
    match files.items.get(index)?.path_type.as_ref()? {
        PathType::UriFile(uri) => Some(uri),
        _ => None,
    }
}

/// Whether the read binds a host iterator rather than scanning storage.
pub fn is_iterator_read(rel: &ReadRel) -> bool {
    match &rel.read_type {
        Some(ReadType::LocalFiles(files)) => {
            files.items.len() == 1
                && uri_file(files, 0).is_some_and(|uri| uri.starts_with(ITERATOR_PREFIX))
        }
        _ => false,
    }
}

/// Whether the relation reads from local files (including the iterator
/// form). Projections above any other read resolve their field references
/// against the declared base schema instead of the current header.
pub fn is_local_files_read(rel: &ReadRel) -> bool {
    matches!(&rel.read_type, Some(ReadType::LocalFiles(_)))
}

pub struct ReadPlanner<'a> {
    anchors: &'a FunctionAnchors,
    scalars: &'a dyn ScalarFunctions,
    aggregates: &'a dyn AggregateFunctions,
    stores: &'a dyn StoreCatalog,
}

impl<'a> ReadPlanner<'a> {
    pub fn new(
        anchors: &'a FunctionAnchors,
        scalars: &'a dyn ScalarFunctions,
        aggregates: &'a dyn AggregateFunctions,
        stores: &'a dyn StoreCatalog,
    ) -> Self {
        Self { anchors, scalars, aggregates, stores }
    }

    /// `restore` restricts which header positions survive a pushed-down
    /// filter; `None` keeps the whole header.
    pub fn plan(
        &self,
        rel: &ReadRel,
        restore: Option<&[usize]>,
    ) -> Result<ExecPlan, TranslateError> {
        match &rel.read_type {
            Some(ReadType::LocalFiles(files)) if is_iterator_read(rel) => {
                self.plan_iterator(rel, files)
            }
            Some(ReadType::LocalFiles(files)) => self.plan_local_files(rel, files),
            Some(ReadType::ExtensionTable(table)) => self.plan_table(rel, table, restore),
            other => Err(TranslateError::NotImplemented(format!(
                "read type {other:?}"
            ))),
        }
    }

    fn declared_header(&self, rel: &ReadRel) -> Result<Schema, TranslateError> {
        let named = rel.base_schema.as_ref().ok_or_else(|| {
            TranslateError::MalformedPlan("read relation without base schema".into())
        })?;
        parse_named_struct(named, self.aggregates)
    }

    fn plan_iterator(
        &self,
        rel: &ReadRel,
        files: &LocalFiles,
    ) -> Result<ExecPlan, TranslateError> {
        let uri = uri_file(files, 0).ok_or_else(|| {
            TranslateError::MalformedPlan("iterator read without a URI".into())
        })?;
        let index: usize = uri
            .split_once(':')
            .map(|(_, index)| index)
            .unwrap_or_default()
            .parse()
            .map_err(|_| {
                TranslateError::MalformedPlan(format!("malformed iterator binding {uri}"))
            })?;
        let header = self.declared_header(rel)?;
        debug!(index, columns = header.len(), "binding iterator source");
        Ok(ExecPlan::leaf(Step::new(
            "Iterator Source",
            StepKind::IteratorSource { index },
            header,
        )))
    }

    fn plan_local_files(
        &self,
        rel: &ReadRel,
        files: &LocalFiles,
    ) -> Result<ExecPlan, TranslateError> {
        let mut paths = Vec::with_capacity(files.items.len());
        for position in 0..files.items.len() {
            let uri = uri_file(files, position).ok_or_else(|| {
                TranslateError::MalformedPlan("local file item without a URI path".into())
            })?;
            paths.push(uri.to_string());
        }
        let header = self.declared_header(rel)?;
        Ok(ExecPlan::leaf(Step::new("Read File", StepKind::FileScan { paths }, header)))
    }

    fn plan_table(
        &self,
        rel: &ReadRel,
        table: &ExtensionTable,
        restore: Option<&[usize]>,
    ) -> Result<ExecPlan, TranslateError> {
        let detail = table.detail.as_ref().ok_or_else(|| {
            TranslateError::MalformedPlan("extension table without detail".into())
        })?;
        let blob = decode_string_payload(detail.value.as_ref())?;
        let detail: StoreTableDetail = serde_json::from_str(&blob)?;

        let settings_blob =
            if detail.settings.is_null() { String::new() } else { detail.settings.to_string() };
        let handle = self.stores.get_or_load(
            &detail.database,
            &detail.table,
            &detail.relative_path,
            &settings_blob,
        )?;

        // An empty declared schema still has to produce rows; scan the
        // narrowest physical column instead.
        let declared = self.declared_header(rel)?;
        let header = if declared.is_empty() {
            let first = handle.schema.column_at(0).ok_or_else(|| {
                TranslateError::MalformedPlan(format!(
                    "table {}.{} has no columns",
                    detail.database, detail.table
                ))
            })?;
            debug!(column = %first.name, "reading one physical column instead of an empty header");
            Schema::new(vec![first.clone()])
        } else {
            declared
        };

        let parts: Vec<String> = handle
            .parts
            .iter()
            .filter(|p| p.min_block >= detail.min_block && p.max_block < detail.max_block)
            .map(|p| p.name.clone())
            .collect();
        if parts.is_empty() {
            return Err(TranslateError::NoMatchingParts {
                table: format!("{}.{}", detail.database, detail.table),
                lo: detail.min_block,
                hi: detail.max_block,
            });
        }

        let mut not_null_columns = Vec::new();
        let pushdown = match rel.filter.as_deref() {
            Some(filter) => {
                Some(self.build_pushdown(filter, &header, restore, &mut not_null_columns)?)
            }
            None => None,
        };
        let output = match &pushdown {
            Some(p) => {
                let mut kept = Schema::default();
                for column in header.iter() {
                    if p.keep.iter().any(|k| k == &column.name) {
                        kept.push(column.clone());
                    }
                }
                kept
            }
            None => header.clone(),
        };

        let mut plan = ExecPlan::leaf(Step::new(
            "Read Table Store",
            StepKind::TableScan {
                namespace: detail.database,
                table: detail.table,
                parts,
                pushdown,
            },
            output,
        ));
        remove_nullable_columns(&mut plan, &not_null_columns);
        Ok(plan)
    }

    fn build_pushdown(
        &self,
        filter: &Expression,
        header: &Schema,
        restore: Option<&[usize]>,
        not_null_columns: &mut Vec<String>,
    ) -> Result<PushdownFilter, TranslateError> {
        let compiler = ExprCompiler::new(self.anchors, self.scalars);
        let mut dag = Dag::from_schema(header);
        let condition = match &filter.rex_type {
            Some(RexType::SingularOrList(_)) => {
                let node = compiler.compile_argument(&mut dag, filter)?;
                dag.node(node).result_name.clone()
            }
            _ => {
                let (_, name) = compiler.compile(&mut dag, filter, not_null_columns, true)?;
                name
            }
        };
        let keep = match restore {
            Some(positions) => positions
                .iter()
                .filter_map(|p| header.column_at(*p))
                .map(|c| c.name.clone())
                .collect(),
            None => header.names(),
        };
        Ok(PushdownFilter { dag, condition, keep })
    }
}

/// Appends a step stripping the nullability wrapper from the named
/// columns, re-published under their own names. Columns absent from the
/// current header or already non-nullable are skipped.
pub(crate) fn remove_nullable_columns(plan: &mut ExecPlan, columns: &[String]) {
    let schema = plan.schema().clone();
    let targets: Vec<&str> = columns
        .iter()
        .map(String::as_str)
        .filter(|name| {
            schema.column_by_name(name).is_some_and(|c| c.data_type.is_nullable())
        })
        .collect();
    if targets.is_empty() {
        return;
    }

    let mut dag = Dag::from_schema(&schema);
    for name in targets {
        // Columns from the current header are always findable.
        let Some(node) = dag.find_in_output(name) else {
            continue;
        };
        let stripped = dag.node(node).result_type.strip_nullable().clone();
        let wrapped = dag.add_function("assumeNotNull", vec![node], stripped, name.to_string());
        dag.add_or_replace_output(wrapped);
    }
    let output = dag.output_schema();
    plan.push(Step::new(
        "Remove Nullable Properties",
        StepKind::Expression { dag },
        output,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::test_support::anchors;
    use lithic_plan::{Column, DataType};
    use lithic_registry::{
        BuiltinAggregateFunctions, BuiltinScalarFunctions, InMemoryStoreCatalog, PartMeta,
        RegistryError, StoreCatalog, TableHandle,
    };
    use prost::Message;
    use substrait::proto::r#type::{self, Kind, Nullability};
    use substrait::proto::read_rel::local_files::FileOrFiles;
    use substrait::proto::{NamedStruct, Type};

    fn i64_named_struct(names: &[&str]) -> NamedStruct {
        NamedStruct {
            names: names.iter().map(|n| n.to_string()).collect(),
            r#struct: Some(r#type::Struct {
                types: names
                    .iter()
                    .map(|_| Type {
                        kind: Some(Kind::I64(r#type::I64 {
                            nullability: Nullability::Required as i32,
                            ..Default::default()
                        })),
                    })
                    .collect(),
                ..Default::default()
            }),
        }
    }

    fn local_files_read(uri: &str, names: &[&str]) -> ReadRel {
        ReadRel {
            base_schema: Some(i64_named_struct(names)),
            read_type: Some(ReadType::LocalFiles(LocalFiles {
                items: vec![FileOrFiles {
                    path_type: Some(PathType::UriFile(uri.to_string())),
                    ..Default::default()
                }],
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    /// A catalog that fails the test if the translation ever consults it.
    struct UntouchableCatalog;

    impl StoreCatalog for UntouchableCatalog {
        fn get_or_load(
            &self,
            namespace: &str,
            name: &str,
            _relative_path: &str,
            _settings_blob: &str,
        ) -> Result<std::sync::Arc<TableHandle>, RegistryError> {
            panic!("store catalog consulted for {namespace}.{name}");
        }
    }

    fn planner<'a>(anchors: &'a FunctionAnchors, stores: &'a dyn StoreCatalog) -> ReadPlanner<'a> {
        ReadPlanner::new(anchors, &BuiltinScalarFunctions, &BuiltinAggregateFunctions, stores)
    }

    #[test]
    fn iterator_reads_bind_by_index_without_the_catalog() {
        let anchors = anchors(&[]);
        let rel = local_files_read("iterator:3", &["x", "y"]);
        let plan = planner(&anchors, &UntouchableCatalog).plan(&rel, None).unwrap();
        let StepKind::IteratorSource { index } = &plan.last_step().kind else {
            panic!("expected an iterator source");
        };
        assert_eq!(*index, 3);
        assert_eq!(plan.schema().names(), vec!["x", "y"]);
    }

    #[test]
    fn plain_local_files_become_a_file_scan() {
        let anchors = anchors(&[]);
        let rel = local_files_read("file:///data/part-0.col", &["x"]);
        let plan = planner(&anchors, &UntouchableCatalog).plan(&rel, None).unwrap();
        let StepKind::FileScan { paths } = &plan.last_step().kind else {
            panic!("expected a file scan");
        };
        assert_eq!(paths, &["file:///data/part-0.col"]);
    }

    fn store_read(names: &[&str], min_block: i64, max_block: i64) -> ReadRel {
        let detail = serde_json::json!({
            "database": "db",
            "table": "events",
            "relative_path": "store/events",
            "min_block": min_block,
            "max_block": max_block,
        });
        let payload = crate::proto::StringPayload { value: detail.to_string() };
        let mut table = ExtensionTable::default();
        let mut any = table.detail.take().unwrap_or_default();
        any.value = payload.encode_to_vec().into();
        table.detail = Some(any);
        ReadRel {
            base_schema: Some(i64_named_struct(names)),
            read_type: Some(ReadType::ExtensionTable(table)),
            ..Default::default()
        }
    }

    fn catalog() -> InMemoryStoreCatalog {
        let catalog = InMemoryStoreCatalog::new();
        catalog.register(TableHandle {
            namespace: "db".into(),
            name: "events".into(),
            schema: Schema::new(vec![
                Column::new("id", DataType::Int64),
                Column::new("v", DataType::Int64),
            ]),
            parts: vec![
                PartMeta { name: "p_0_4".into(), min_block: 0, max_block: 4 },
                PartMeta { name: "p_5_9".into(), min_block: 5, max_block: 9 },
            ],
        });
        catalog
    }

    #[test]
    fn part_selection_is_a_half_open_block_range() {
        let anchors = anchors(&[]);
        let stores = catalog();
        let rel = store_read(&["id", "v"], 0, 5);
        let plan = planner(&anchors, &stores).plan(&rel, None).unwrap();
        let StepKind::TableScan { parts, .. } = &plan.last_step().kind else {
            panic!("expected a table scan");
        };
        assert_eq!(parts, &["p_0_4"]);

        let rel = store_read(&["id", "v"], 20, 30);
        let err = planner(&anchors, &stores).plan(&rel, None).unwrap_err();
        assert!(matches!(err, TranslateError::NoMatchingParts { .. }));
    }

    #[test]
    fn empty_declared_schema_falls_back_to_one_physical_column() {
        let anchors = anchors(&[]);
        let stores = catalog();
        let rel = store_read(&[], 0, 10);
        let plan = planner(&anchors, &stores).plan(&rel, None).unwrap();
        assert_eq!(plan.schema().names(), vec!["id"]);
    }
}
