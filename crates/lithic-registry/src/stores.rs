//! Table store catalog
//!
//! Table-backed scans resolve through a process-wide catalog keyed by
//! `namespace.table`. A handle is loaded at most once; concurrent
//! translations that race on the same table all end up sharing the first
//! successfully loaded handle.

use crate::RegistryError;
use lithic_plan::Schema;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Metadata of one immutable data part within a table store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartMeta {
    pub name: String,
    /// First block number covered by this part.
    pub min_block: i64,
    /// Last block number covered by this part.
    pub max_block: i64,
}

/// A loaded table store: its physical schema and the parts it holds.
#[derive(Debug, Clone)]
pub struct TableHandle {
    pub namespace: String,
    pub name: String,
    pub schema: Schema,
    pub parts: Vec<PartMeta>,
}

/// Store settings carried in the serialized plan as a JSON blob.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub storage_policy: Option<String>,
}

impl StoreSettings {
    pub fn from_blob(blob: &str) -> Result<StoreSettings, RegistryError> {
        if blob.trim().is_empty() {
            return Ok(StoreSettings::default());
        }
        serde_json::from_str(blob).map_err(|e| RegistryError::StoreLoad(e.to_string()))
    }
}

pub trait StoreCatalog: Send + Sync {
    /// The handle for `namespace.name`, loading it on first use. The
    /// relative path and settings blob come from the serialized plan and
    /// only matter on that first load.
    fn get_or_load(
        &self,
        namespace: &str,
        name: &str,
        relative_path: &str,
        settings_blob: &str,
    ) -> Result<Arc<TableHandle>, RegistryError>;
}

type Loader =
    dyn Fn(&str, &str, &str, &StoreSettings) -> Result<TableHandle, RegistryError> + Send + Sync;

/// Catalog backed by a map plus an optional loader for cache misses.
pub struct InMemoryStoreCatalog {
    tables: Mutex<HashMap<(String, String), Arc<TableHandle>>>,
    loader: Option<Box<Loader>>,
}

impl Default for InMemoryStoreCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStoreCatalog {
    pub fn new() -> Self {
        Self { tables: Mutex::new(HashMap::new()), loader: None }
    }

    pub fn with_loader(
        loader: impl Fn(&str, &str, &str, &StoreSettings) -> Result<TableHandle, RegistryError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self { tables: Mutex::new(HashMap::new()), loader: Some(Box::new(loader)) }
    }

    pub fn register(&self, handle: TableHandle) {
        let key = (handle.namespace.clone(), handle.name.clone());
        self.tables.lock().expect("catalog lock").insert(key, Arc::new(handle));
    }
}

impl StoreCatalog for InMemoryStoreCatalog {
    fn get_or_load(
        &self,
        namespace: &str,
        name: &str,
        relative_path: &str,
        settings_blob: &str,
    ) -> Result<Arc<TableHandle>, RegistryError> {
        let key = (namespace.to_string(), name.to_string());
        let mut tables = self.tables.lock().expect("catalog lock");
        if let Some(handle) = tables.get(&key) {
            return Ok(Arc::clone(handle));
        }
        let Some(loader) = &self.loader else {
            return Err(RegistryError::UnknownTable {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        };
        let settings = StoreSettings::from_blob(settings_blob)?;
        let handle = Arc::new(loader(namespace, name, relative_path, &settings)?);
        tables.insert(key, Arc::clone(&handle));
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lithic_plan::{Column, DataType};

    fn handle(namespace: &str, name: &str) -> TableHandle {
        TableHandle {
            namespace: namespace.into(),
            name: name.into(),
            schema: Schema::new(vec![Column::new("id", DataType::Int64)]),
            parts: vec![PartMeta { name: "p0_0_1".into(), min_block: 0, max_block: 1 }],
        }
    }

    #[test]
    fn registered_handles_are_shared() {
        let catalog = InMemoryStoreCatalog::new();
        catalog.register(handle("db", "events"));
        let a = catalog.get_or_load("db", "events", "", "").unwrap();
        let b = catalog.get_or_load("db", "events", "", "").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn loader_runs_once_per_table() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let catalog = InMemoryStoreCatalog::with_loader(move |ns, name, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(handle(ns, name))
        });
        catalog.get_or_load("db", "events", "store/events", "{}").unwrap();
        catalog.get_or_load("db", "events", "store/events", "{}").unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_table_without_loader_errors() {
        let catalog = InMemoryStoreCatalog::new();
        assert!(matches!(
            catalog.get_or_load("db", "absent", "", ""),
            Err(RegistryError::UnknownTable { .. })
        ));
    }

    #[test]
    fn settings_blob_parses_or_defaults() {
        let s = StoreSettings::from_blob("").unwrap();
        assert!(s.storage_policy.is_none());
        let s = StoreSettings::from_blob(r#"{"storage_policy":"hot"}"#).unwrap();
        assert_eq!(s.storage_policy.as_deref(), Some("hot"));
        assert!(StoreSettings::from_blob("not json").is_err());
    }
}
