//! Engine-side plan substrate for Lithic
//!
//! Internal type descriptors, ordered schemas, scalar constants, the
//! append-only expression DAG and the executable step model that the
//! plan translator produces. Nothing in this crate executes anything;
//! it is the data model the execution runtime walks.

mod dag;
mod schema;
mod step;
mod types;
mod value;

pub use dag::*;
pub use schema::*;
pub use step::*;
pub use types::*;
pub use value::*;

use std::sync::atomic::{AtomicU64, Ordering};

static NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-wide uniquifying suffix generator.
///
/// Every component that emits a new named output goes through this when a
/// collision is detected, so two translations running in one process can
/// never mint the same name twice.
pub fn unique_name(prefix: &str) -> String {
    let n = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{n}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_names_are_distinct() {
        let a = unique_name("col");
        let b = unique_name("col");
        assert_ne!(a, b);
        assert!(a.starts_with("col_"));
    }
}
