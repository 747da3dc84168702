//! End-to-end translations of hand-built serialized plans.

use lithic_plan::{Column, DataType, NodeKind, ScalarValue, Schema, StepKind};
use lithic_registry::{
    BuiltinAggregateFunctions, BuiltinScalarFunctions, InMemoryBroadcastTables,
    InMemoryStoreCatalog, PartMeta, RegistryError, SideTable, StoreCatalog, TableHandle,
};
use lithic_translate::proto::StringPayload;
use lithic_translate::{PlanTranslator, Registries, TranslateError};
use prost::Message;
use substrait::proto::expression::reference_segment;
use substrait::proto::expression::{
    FieldReference, Literal, ReferenceSegment, RexType, ScalarFunction,
};
use substrait::proto::extensions::simple_extension_declaration::{
    ExtensionFunction, MappingType,
};
use substrait::proto::extensions::SimpleExtensionDeclaration;
use substrait::proto::function_argument::ArgType;
use substrait::proto::plan_rel::RelType as PlanRelType;
use substrait::proto::r#type::{self, Kind, Nullability};
use substrait::proto::read_rel::local_files::file_or_files::PathType;
use substrait::proto::read_rel::local_files::FileOrFiles;
use substrait::proto::read_rel::{LocalFiles, ReadType};
use substrait::proto::rel::RelType;
use substrait::proto::{
    expression, join_rel, Expression, FetchRel, FilterRel, FunctionArgument, JoinRel, NamedStruct,
    Plan, PlanRel, ProjectRel, ReadRel, Rel, RelRoot, Type,
};

fn declarations(pairs: &[(u32, &str)]) -> Vec<SimpleExtensionDeclaration> {
    pairs
        .iter()
        .map(|(anchor, name)| SimpleExtensionDeclaration {
            mapping_type: Some(MappingType::ExtensionFunction(ExtensionFunction {
                extension_uri_reference: 0,
                function_anchor: *anchor,
                name: (*name).to_string(),
                ..Default::default()
            })),
        })
        .collect()
}

fn selection(position: i32) -> Expression {
    Expression {
        rex_type: Some(RexType::Selection(Box::new(FieldReference {
            reference_type: Some(
                substrait::proto::expression::field_reference::ReferenceType::DirectReference(
                    ReferenceSegment {
                        reference_type: Some(reference_segment::ReferenceType::StructField(
                            Box::new(reference_segment::StructField {
                                field: position,
                                child: None,
                            }),
                        )),
                    },
                ),
            ),
            root_type: None,
        }))),
    }
}

fn scalar_call(anchor: u32, arguments: Vec<Expression>, output_type: Option<Type>) -> Expression {
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

fn i64_type(nullable: bool) -> Type {
    let nullability =
        if nullable { Nullability::Nullable as i32 } else { Nullability::Required as i32 };
    Type {
        kind: Some(Kind::I64(r#type::I64 { nullability, ..Default::default() })),
    }
}

fn named_struct(columns: &[(&str, bool)]) -> NamedStruct {
    NamedStruct {
        names: columns.iter().map(|(name, _)| name.to_string()).collect(),
        r#struct: Some(r#type::Struct {
            types: columns.iter().map(|(_, nullable)| i64_type(*nullable)).collect(),
            ..Default::default()
        }),
    }
}

fn iterator_read(index: usize, columns: &[(&str, bool)]) -> Rel {
    let read = ReadRel {
        base_schema: Some(named_struct(columns)),
        read_type: Some(ReadType::LocalFiles(LocalFiles {
            items: vec![FileOrFiles {
                path_type: Some(PathType::UriFile(format!("iterator:{index}"))),
                ..Default::default()
            }],
            ..Default::default()
        })),
        ..Default::default()
    };
    Rel { rel_type: Some(RelType::Read(Box::new(read))) }
}

fn i64_literal(value: i64) -> Expression {
    Expression {
        rex_type: Some(RexType::Literal(Literal {
            literal_type: Some(expression::literal::LiteralType::I64(value)),
            ..Default::default()
        })),
    }
}

fn store_read(columns: &[(&str, bool)], filter: Option<Expression>) -> Rel {
    let detail = serde_json::json!({
        "database": "db",
        "table": "events",
        "relative_path": "store/events",
        "min_block": 0,
        "max_block": 100,
    });
    let payload = StringPayload { value: detail.to_string() };
    let mut table = substrait::proto::read_rel::ExtensionTable::default();
    let mut any = table.detail.take().unwrap_or_default();
    any.value = payload.encode_to_vec().into();
    table.detail = Some(any);
    let read = ReadRel {
        base_schema: Some(named_struct(columns)),
        read_type: Some(ReadType::ExtensionTable(table)),
        filter: filter.map(Box::new),
        ..Default::default()
    };
    Rel { rel_type: Some(RelType::Read(Box::new(read))) }
}

fn rooted(extensions: Vec<SimpleExtensionDeclaration>, rel: Rel, names: &[&str]) -> Plan {
    Plan {
        extensions,
        relations: vec![PlanRel {
            rel_type: Some(PlanRelType::Root(RelRoot {
                input: Some(rel),
                names: names.iter().map(|n| n.to_string()).collect(),
            })),
        }],
        ..Default::default()
    }
}

struct Fixtures {
    stores: InMemoryStoreCatalog,
    broadcast: InMemoryBroadcastTables,
}

impl Fixtures {
    fn new() -> Self {
        Self { stores: InMemoryStoreCatalog::new(), broadcast: InMemoryBroadcastTables::new() }
    }

    fn registries(&self) -> Registries<'_> {
        Registries {
            scalars: &BuiltinScalarFunctions,
            aggregates: &BuiltinAggregateFunctions,
            stores: &self.stores,
            broadcast: &self.broadcast,
        }
    }
}

#[test]
fn projection_renames_through_the_root() {
    let fixtures = Fixtures::new();
    let project = Rel {
        rel_type: Some(RelType::Project(Box::new(ProjectRel {
            input: Some(Box::new(iterator_read(0, &[("a", false), ("b", false)]))),
            expressions: vec![selection(1), selection(0)],
            ..Default::default()
        }))),
    };
    let plan = rooted(vec![], project, &["x", "y"]);

    let exec = PlanTranslator::new(fixtures.registries()).translate(&plan).unwrap();
    assert_eq!(exec.schema().names(), vec!["x", "y"]);
    assert_eq!(exec.last_step().description, "Rename Output");
    let StepKind::IteratorSource { index } = &exec.steps()[0].kind else {
        panic!("expected the plan to start at the iterator source");
    };
    assert_eq!(*index, 0);
}

#[test]
fn iterator_binding_never_consults_the_store_catalog() {
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

    let broadcast = InMemoryBroadcastTables::new();
    let registries = Registries {
        scalars: &BuiltinScalarFunctions,
        aggregates: &BuiltinAggregateFunctions,
        stores: &UntouchableCatalog,
        broadcast: &broadcast,
    };
    let plan = rooted(vec![], iterator_read(3, &[("a", false)]), &["a"]);
    let exec = PlanTranslator::new(registries).translate(&plan).unwrap();
    let StepKind::IteratorSource { index } = &exec.steps()[0].kind else {
        panic!("expected an iterator source");
    };
    assert_eq!(*index, 3);
}

#[test]
fn projection_narrows_the_pushed_down_scan_columns() {
    let fixtures = Fixtures::new();
    fixtures.stores.register(TableHandle {
        namespace: "db".into(),
        name: "events".into(),
        schema: Schema::new(vec![
            Column::new("id", DataType::Int64),
            Column::new("v", DataType::Int64),
        ]),
        parts: vec![PartMeta { name: "p_0_9".into(), min_block: 0, max_block: 9 }],
    });

    let read = store_read(
        &[("id", false), ("v", false)],
        Some(scalar_call(1, vec![selection(0), i64_literal(5)], None)),
    );
    let project = Rel {
        rel_type: Some(RelType::Project(Box::new(ProjectRel {
            input: Some(Box::new(read)),
            expressions: vec![selection(0)],
            ..Default::default()
        }))),
    };
    let plan = rooted(declarations(&[(1, "gt:i64_i64")]), project, &[]);

    let exec = PlanTranslator::new(fixtures.registries()).translate(&plan).unwrap();
    let StepKind::TableScan { pushdown, .. } = &exec.steps()[0].kind else {
        panic!("expected the plan to start at the table scan");
    };
    let pushdown = pushdown.as_ref().expect("expected a pushed-down filter");
    // Only the projected column survives the scan.
    assert_eq!(pushdown.keep, vec!["id"]);
    assert_eq!(exec.steps()[0].output.names(), vec!["id"]);
    assert_eq!(exec.schema().names(), vec!["id"]);
}

fn join_plan(advanced_extension: Option<substrait::proto::extensions::AdvancedExtension>) -> Plan {
    let join = Rel {
        rel_type: Some(RelType::Join(Box::new(JoinRel {
            left: Some(Box::new(iterator_read(0, &[("id", false), ("v", false)]))),
            right: Some(Box::new(iterator_read(1, &[("id", false), ("w", false)]))),
            r#type: join_rel::JoinType::Inner as i32,
            expression: Some(Box::new(scalar_call(
                1,
                vec![selection(0), selection(2)],
                None,
            ))),
            advanced_extension,
            ..Default::default()
        }))),
    };
    rooted(declarations(&[(1, "equal:i64_i64")]), join, &[])
}

fn assert_left_then_right(names: &[String]) {
    assert_eq!(names.len(), 4);
    assert_eq!(names[0], "id");
    assert_eq!(names[1], "v");
    // The colliding right-side name is qualified, the other kept.
    assert!(names[2].starts_with("right") && names[2].ends_with(".id"), "got {}", names[2]);
    assert_eq!(names[3], "w");
}

#[test]
fn shuffle_join_output_is_left_then_registered_right() {
    let fixtures = Fixtures::new();
    let plan = join_plan(None);
    let exec = PlanTranslator::new(fixtures.registries()).translate(&plan).unwrap();

    assert_eq!(exec.children().len(), 2);
    assert!(matches!(exec.steps()[0].kind, StepKind::Join { .. }));
    assert_eq!(exec.last_step().description, "Reorder Join Output");
    assert_left_then_right(&exec.schema().names());

    let StepKind::Join { keys, .. } = &exec.steps()[0].kind else { unreachable!() };
    assert_eq!(keys[0].0, "id");
    assert!(keys[0].1.ends_with(".id"));
}

#[test]
fn broadcast_join_probes_the_registered_side_table() {
    let fixtures = Fixtures::new();
    fixtures.broadcast.register(SideTable {
        key: "bhj-1".into(),
        schema: Schema::new(vec![
            Column::new("id", DataType::Int64),
            Column::new("w", DataType::Int64),
        ]),
    });

    let mut ext = substrait::proto::extensions::AdvancedExtension::default();
    let mut any = ext.optimization.pop().unwrap_or_default();
    let payload = StringPayload { value: "JoinParameters:isBHJ=1\nbuildHashTableId=bhj-1".into() };
    any.value = payload.encode_to_vec().into();
    ext.optimization.push(any);

    let plan = join_plan(Some(ext));
    let exec = PlanTranslator::new(fixtures.registries()).translate(&plan).unwrap();

    // The probe side is the only input; the built table comes from the
    // registry.
    assert!(exec.children().is_empty());
    let broadcast = exec
        .steps()
        .iter()
        .find_map(|s| match &s.kind {
            StepKind::BroadcastJoin { side_table, .. } => Some(side_table.clone()),
            _ => None,
        })
        .expect("expected a broadcast join step");
    assert_eq!(broadcast, "bhj-1");
    assert_left_then_right(&exec.schema().names());
}

#[test]
fn missing_broadcast_registration_is_fatal() {
    let fixtures = Fixtures::new();
    let mut ext = substrait::proto::extensions::AdvancedExtension::default();
    let mut any = ext.optimization.pop().unwrap_or_default();
    let payload = StringPayload { value: "JoinParameters:isBHJ=1\nbuildHashTableId=gone".into() };
    any.value = payload.encode_to_vec().into();
    ext.optimization.push(any);

    let plan = join_plan(Some(ext));
    let err = PlanTranslator::new(fixtures.registries()).translate(&plan).unwrap_err();
    assert!(matches!(err, TranslateError::MalformedPlan(_)));
}

#[test]
fn cast_to_decimal_picks_width_from_precision_and_carries_scale() {
    let fixtures = Fixtures::new();
    let cast = Expression {
        rex_type: Some(RexType::Cast(Box::new(expression::Cast {
            r#type: Some(Type {
                kind: Some(Kind::Decimal(r#type::Decimal {
                    precision: 10,
                    scale: 2,
                    nullability: Nullability::Required as i32,
                    ..Default::default()
                })),
            }),
            input: Some(Box::new(selection(0))),
            failure_behavior: 0,
        }))),
    };
    let project = Rel {
        rel_type: Some(RelType::Project(Box::new(ProjectRel {
            input: Some(Box::new(iterator_read(0, &[("v", false)]))),
            expressions: vec![cast],
            ..Default::default()
        }))),
    };
    let plan = rooted(vec![], project, &[]);

    let exec = PlanTranslator::new(fixtures.registries()).translate(&plan).unwrap();
    assert_eq!(
        exec.schema().column_at(0).unwrap().data_type,
        DataType::Decimal { precision: 10, scale: 2 }
    );

    let StepKind::Expression { dag } = &exec.last_step().kind else {
        panic!("expected the projection step");
    };
    let (_, node) = dag
        .nodes()
        .find(|(_, n)| matches!(&n.kind, NodeKind::Function { function, .. } if function == "toDecimal64"))
        .expect("expected a 64-bit decimal conversion");
    let NodeKind::Function { args, .. } = &node.kind else { unreachable!() };
    assert_eq!(args.len(), 2);
    let NodeKind::Constant(scale) = &dag.node(args[1]).kind else {
        panic!("expected the scale constant");
    };
    assert_eq!(scale.value, ScalarValue::UInt32(2));
}

#[test]
fn filter_strips_nullability_of_proven_columns() {
    let fixtures = Fixtures::new();
    let filter = Rel {
        rel_type: Some(RelType::Filter(Box::new(FilterRel {
            input: Some(Box::new(iterator_read(0, &[("id", true), ("v", true)]))),
            condition: Some(Box::new(scalar_call(1, vec![selection(0)], None))),
            ..Default::default()
        }))),
    };
    let plan = rooted(declarations(&[(1, "is_not_null:i64")]), filter, &[]);

    let exec = PlanTranslator::new(fixtures.registries()).translate(&plan).unwrap();
    assert_eq!(exec.last_step().description, "Remove Nullable Properties");
    let schema = exec.schema();
    assert!(!schema.column_by_name("id").unwrap().data_type.is_nullable());
    assert!(schema.column_by_name("v").unwrap().data_type.is_nullable());
}

#[test]
fn fetch_becomes_a_limit_step() {
    let fixtures = Fixtures::new();
    let fetch = Rel {
        rel_type: Some(RelType::Fetch(Box::new(FetchRel {
            input: Some(Box::new(iterator_read(0, &[("a", false)]))),
            offset_mode: Some(substrait::proto::fetch_rel::OffsetMode::Offset(5)),
            count_mode: Some(substrait::proto::fetch_rel::CountMode::Count(10)),
            ..Default::default()
        }))),
    };
    let plan = rooted(vec![], fetch, &[]);

    let exec = PlanTranslator::new(fixtures.registries()).translate(&plan).unwrap();
    let StepKind::Limit { count, offset } = &exec.last_step().kind else {
        panic!("expected a limit step");
    };
    assert_eq!((*count, *offset), (10, 5));
}

#[test]
fn root_name_count_must_match_the_output() {
    let fixtures = Fixtures::new();
    let plan = rooted(vec![], iterator_read(0, &[("a", false), ("b", false)]), &["only"]);
    let err = PlanTranslator::new(fixtures.registries()).translate(&plan).unwrap_err();
    assert!(matches!(err, TranslateError::MalformedPlan(_)));
}
