//! Row mutations captured during a write transaction.

use super::table::Row;
use std::collections::HashMap;

/// One row change: the value before and after the transaction.
#[derive(Clone, Debug)]
pub struct Mutation {
    pub table: String,
    pub key: String,
    pub before: Option<Row>,
    pub after: Option<Row>,
}

impl Mutation {
    pub fn created(&self) -> bool {
        self.before.is_none() && self.after.is_some()
    }

    pub fn deleted(&self) -> bool {
        self.before.is_some() && self.after.is_none()
    }

    pub fn updated(&self) -> bool {
        self.before.is_some() && self.after.is_some()
    }

    /// The row as it is after the change, or as it was before a delete.
    pub fn row(&self) -> Option<&Row> {
        self.after.as_ref().or(self.before.as_ref())
    }

    fn is_noop(&self) -> bool {
        self.before.is_none() && self.after.is_none()
    }
}

/// Ordered mutations of exactly one write transaction.
///
/// Repeated writes to the same row are coalesced: the first `before` and the
/// last `after` are kept, in the position of the first write.
#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    mutations: Vec<Mutation>,
    positions: HashMap<(String, String), usize>,
}

impl ChangeSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(
        &mut self,
        table: &str,
        key: &str,
        before: Option<Row>,
        after: Option<Row>,
    ) {
        let slot = (table.to_string(), key.to_string());
        if let Some(&pos) = self.positions.get(&slot) {
            self.mutations[pos].after = after;
            return;
        }

        self.positions.insert(slot, self.mutations.len());
        self.mutations.push(Mutation {
            table: table.to_string(),
            key: key.to_string(),
            before,
            after,
        });
    }

    /// Drop rows that were created and deleted inside the transaction.
    pub(crate) fn seal(&mut self) {
        self.mutations.retain(|m| !m.is_noop());
        self.positions.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mutation> {
        self.mutations.iter().filter(|m| !m.is_noop())
    }

    /// Mutations for a single table, in transaction order.
    pub fn for_table<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a Mutation> + 'a {
        self.iter().filter(move |m| m.table == table)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn row(v: serde_json::Value) -> Option<Row> {
        Some(Arc::new(v))
    }

    #[test]
    fn test_mutation_kinds() {
        let mut changes = ChangeSet::new();
        changes.record("t", "a", None, row(json!(1)));
        changes.record("t", "b", row(json!(1)), row(json!(2)));
        changes.record("t", "c", row(json!(1)), None);

        let kinds: Vec<_> = changes
            .iter()
            .map(|m| (m.created(), m.updated(), m.deleted()))
            .collect();
        assert_eq!(
            kinds,
            vec![(true, false, false), (false, true, false), (false, false, true)]
        );
    }

    #[test]
    fn test_repeated_writes_coalesce() {
        let mut changes = ChangeSet::new();
        changes.record("t", "a", row(json!(1)), row(json!(2)));
        changes.record("t", "other", None, row(json!(0)));
        changes.record("t", "a", row(json!(2)), row(json!(3)));

        assert_eq!(changes.len(), 2);
        let first = changes.iter().next().unwrap();
        assert_eq!(first.key, "a");
        assert_eq!(**first.before.as_ref().unwrap(), json!(1));
        assert_eq!(**first.after.as_ref().unwrap(), json!(3));
    }

    #[test]
    fn test_insert_then_delete_is_dropped() {
        let mut changes = ChangeSet::new();
        changes.record("t", "tmp", None, row(json!(1)));
        changes.record("t", "tmp", row(json!(1)), None);
        changes.seal();

        assert!(changes.is_empty());
    }

    #[test]
    fn test_for_table_filters() {
        let mut changes = ChangeSet::new();
        changes.record("services", "web", None, row(json!({})));
        changes.record("nodes", "n1", None, row(json!({})));

        let keys: Vec<_> = changes.for_table("nodes").map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["n1"]);
    }
}
