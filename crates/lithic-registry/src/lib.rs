//! Process-wide registries consulted by plan translation
//!
//! These are the translator's external dependency handles: a scalar
//! function registry (result-type inference only; function bodies live in
//! the execution runtime), an aggregate function registry (state and
//! result types), the table store catalog and the broadcast side-table
//! registry. All are traits so a translation can be tested against fakes.
//!
//! Concurrent translations may share one registry; implementations must be
//! safe for concurrent read and lazy-construct-once semantics.

mod aggregates;
mod broadcast;
mod functions;
mod stores;

pub use aggregates::*;
pub use broadcast::*;
pub use functions::*;
pub use stores::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("function {function} does not accept arguments ({arguments})")]
    TypeMismatch { function: String, arguments: String },

    #[error("table {namespace}.{name} not found and no loader produced it")]
    UnknownTable { namespace: String, name: String },

    #[error("failed to load table store: {0}")]
    StoreLoad(String),
}
