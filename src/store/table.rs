//! Copy-on-write tables.

use crate::error::{Result, StoreError};
use crate::types::Index;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A stored row. Rows are immutable once written; updates replace them.
pub type Row = Arc<serde_json::Value>;

/// The set of tables a store holds.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    tables: BTreeSet<String>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a table.
    pub fn with_table(mut self, name: impl Into<String>) -> Self {
        self.tables.insert(name.into());
        self
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(String::as_str)
    }
}

/// One table: rows by primary key plus the index of the last commit that
/// touched it.
#[derive(Clone, Default)]
pub(crate) struct Table {
    rows: Arc<BTreeMap<String, Row>>,
    index: Index,
}

impl Table {
    pub(crate) fn get(&self, key: &str) -> Option<&Row> {
        self.rows.get(key)
    }

    pub(crate) fn rows(&self) -> &BTreeMap<String, Row> {
        &self.rows
    }

    pub(crate) fn index(&self) -> Index {
        self.index
    }

    /// Insert or replace a row, cloning the row map if a reader still
    /// shares it.
    pub(crate) fn put(&mut self, key: String, row: Row, index: Index) -> Option<Row> {
        self.index = index;
        Arc::make_mut(&mut self.rows).insert(key, row)
    }

    pub(crate) fn remove(&mut self, key: &str, index: Index) -> Option<Row> {
        if !self.rows.contains_key(key) {
            return None;
        }
        self.index = index;
        Arc::make_mut(&mut self.rows).remove(key)
    }
}

/// A complete, immutable-once-published version of every table.
#[derive(Clone, Default)]
pub(crate) struct Root {
    pub(crate) index: Index,
    /// Ordinal of the commit that produced this root; the empty store is 0.
    /// Unlike `index` it grows on every commit, even at a repeated index.
    pub(crate) commit: u64,
    tables: BTreeMap<String, Table>,
}

impl Root {
    pub(crate) fn from_schema(schema: &Schema) -> Self {
        Self {
            index: Index::ZERO,
            commit: 0,
            tables: schema
                .tables()
                .map(|name| (name.to_string(), Table::default()))
                .collect(),
        }
    }

    pub(crate) fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
    }

    pub(crate) fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_writes_do_not_leak_into_shared_copy() {
        let schema = Schema::new().with_table("services");
        let mut root = Root::from_schema(&schema);
        root.table_mut("services")
            .unwrap()
            .put("web".into(), Arc::new(json!({"port": 80})), Index(1));

        let published = root.clone();
        root.table_mut("services")
            .unwrap()
            .put("db".into(), Arc::new(json!({"port": 5432})), Index(2));

        assert!(published.table("services").unwrap().get("db").is_none());
        assert_eq!(published.table("services").unwrap().index(), Index(1));
        assert_eq!(root.table("services").unwrap().rows().len(), 2);
    }

    #[test]
    fn test_unknown_table() {
        let root = Root::from_schema(&Schema::new());
        assert!(matches!(
            root.table("missing"),
            Err(StoreError::UnknownTable(_))
        ));
    }

    #[test]
    fn test_remove_missing_row_keeps_index() {
        let schema = Schema::new().with_table("kv");
        let mut root = Root::from_schema(&schema);
        let table = root.table_mut("kv").unwrap();
        assert!(table.remove("nope", Index(9)).is_none());
        assert_eq!(table.index(), Index::ZERO);
    }
}
