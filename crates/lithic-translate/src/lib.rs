//! Serialized relational plan → executable columnar plan translation
//!
//! The entry point is [`PlanTranslator`]: it takes a decoded external plan
//! (the Substrait relational algebra, binary or JSON), walks the single
//! top-level relation and produces an [`lithic_plan::ExecPlan`] whose
//! column names, order and nullability are the contract downstream
//! consumers rely on.
//!
//! Translation is synchronous and owns all intermediate state; the only
//! shared resources are the registry handles passed in at construction
//! (scalar/aggregate function registries, the table store catalog and the
//! broadcast side-table registry). A failed translation leaves no visible
//! side effects.

mod aggregate;
mod expr;
mod functions;
mod join;
pub mod proto;
mod read;
mod relbuilder;
mod translator;
mod types;

pub use functions::FunctionAnchors;
pub use relbuilder::{RelStepBuilders, SortStepBuilder, WindowStepBuilder};
pub use translator::{compile_expressions, PlanTranslator, Registries};

use lithic_plan::DagError;
use lithic_registry::RegistryError;
use thiserror::Error;

/// Everything that can go wrong while translating one plan. All variants
/// are fatal for the translation that raised them.
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    #[error("unknown or unsupported function: {0}")]
    UnknownFunction(String),

    #[error("malformed plan: {0}")]
    MalformedPlan(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("no data part of {table} covers blocks [{lo}, {hi})")]
    NoMatchingParts { table: String, lo: i64, hi: i64 },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error("failed to decode plan: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("failed to decode JSON plan: {0}")]
    Json(#[from] serde_json::Error),
}
