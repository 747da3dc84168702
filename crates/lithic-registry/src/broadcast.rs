//! Broadcast side-table registry
//!
//! Broadcast joins probe a hash table that the host built out-of-band and
//! registered under an opaque key carried in the plan. Translation only
//! needs the side table's schema; the rows stay with the runtime.

use lithic_plan::Schema;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A pre-built join side table, identified by its registration key.
#[derive(Debug, Clone)]
pub struct SideTable {
    pub key: String,
    pub schema: Schema,
}

pub trait BroadcastTables: Send + Sync {
    fn get(&self, key: &str) -> Option<Arc<SideTable>>;
}

#[derive(Default)]
pub struct InMemoryBroadcastTables {
    tables: Mutex<HashMap<String, Arc<SideTable>>>,
}

impl InMemoryBroadcastTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, table: SideTable) {
        self.tables
            .lock()
            .expect("broadcast registry lock")
            .insert(table.key.clone(), Arc::new(table));
    }
}

impl BroadcastTables for InMemoryBroadcastTables {
    fn get(&self, key: &str) -> Option<Arc<SideTable>> {
        self.tables.lock().expect("broadcast registry lock").get(key).map(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lithic_plan::{Column, DataType};

    #[test]
    fn registered_tables_resolve_by_key() {
        let reg = InMemoryBroadcastTables::new();
        reg.register(SideTable {
            key: "bhj-42".into(),
            schema: Schema::new(vec![Column::new("k", DataType::Int64)]),
        });
        assert!(reg.get("bhj-42").is_some());
        assert!(reg.get("bhj-7").is_none());
    }
}
