//! Read and write transactions over the versioned store.

use super::changes::ChangeSet;
use super::table::{Root, Row};
use super::Store;
use crate::error::{Result, StoreError};
use crate::types::Index;
use parking_lot::MutexGuard;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, warn};

/// A consistent, immutable view of every table at one index.
///
/// Cloning is cheap; the view stays valid no matter how many commits
/// happen after it was taken.
#[derive(Clone)]
pub struct ReadTxn {
    root: Arc<Root>,
}

impl ReadTxn {
    pub(crate) fn new(root: Arc<Root>) -> Self {
        Self { root }
    }

    pub(crate) fn root(&self) -> &Arc<Root> {
        &self.root
    }

    /// Ordinal of the last commit visible in this view.
    pub(crate) fn commit(&self) -> u64 {
        self.root.commit
    }

    /// Index of the last commit visible in this view.
    pub fn index(&self) -> Index {
        self.root.index
    }

    /// Index of the last commit that touched `table`.
    pub fn table_index(&self, table: &str) -> Result<Index> {
        Ok(self.root.table(table)?.index())
    }

    pub fn get(&self, table: &str, key: &str) -> Result<Option<Row>> {
        Ok(self.root.table(table)?.get(key).cloned())
    }

    /// Get a row decoded into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, table: &str, key: &str) -> Result<Option<T>> {
        match self.root.table(table)?.get(key) {
            Some(row) => serde_json::from_value(row.as_ref().clone())
                .map(Some)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// All rows of a table in key order.
    pub fn iter(&self, table: &str) -> Result<impl Iterator<Item = (&str, &Row)> + '_> {
        let rows = self.root.table(table)?.rows();
        Ok(rows.iter().map(|(k, v)| (k.as_str(), v)))
    }

    /// Rows whose key starts with `prefix`, in key order.
    pub fn iter_prefix<'a>(
        &'a self,
        table: &str,
        prefix: &'a str,
    ) -> Result<impl Iterator<Item = (&'a str, &'a Row)> + 'a> {
        let rows = self.root.table(table)?.rows();
        Ok(rows
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_str(), v)))
    }

    pub fn len(&self, table: &str) -> Result<usize> {
        Ok(self.root.table(table)?.rows().len())
    }
}

/// The single in-flight write against a store.
///
/// Mutations are applied to a private copy of the tables and tracked in a
/// [`ChangeSet`]. Nothing is visible to readers until [`WriteTxn::commit`];
/// dropping the transaction discards it.
pub struct WriteTxn<'a> {
    store: &'a Store,
    _guard: MutexGuard<'a, ()>,
    root: Root,
    changes: ChangeSet,
    index: Index,
}

impl<'a> WriteTxn<'a> {
    pub(crate) fn new(store: &'a Store, guard: MutexGuard<'a, ()>, root: Root, index: Index) -> Self {
        Self {
            store,
            _guard: guard,
            root,
            changes: ChangeSet::new(),
            index,
        }
    }

    /// Index this transaction will commit at.
    pub fn index(&self) -> Index {
        self.index
    }

    /// Read a row, including writes made earlier in this transaction.
    pub fn get(&self, table: &str, key: &str) -> Result<Option<Row>> {
        Ok(self.root.table(table)?.get(key).cloned())
    }

    pub fn insert(&mut self, table: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let row: Row = Arc::new(value);
        let before = self
            .root
            .table_mut(table)?
            .put(key.to_string(), Arc::clone(&row), self.index);
        self.changes.record(table, key, before, Some(row));
        Ok(())
    }

    /// Insert a serializable value as a row.
    pub fn insert_json<T: Serialize>(&mut self, table: &str, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.insert(table, key, value)
    }

    /// Delete a row. Returns whether it existed.
    pub fn delete(&mut self, table: &str, key: &str) -> Result<bool> {
        match self.root.table_mut(table)?.remove(key, self.index) {
            Some(before) => {
                self.changes.record(table, key, Some(before), None);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Mutations made so far.
    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    /// Discard the transaction.
    pub fn abort(self) {
        debug!(index = %self.index, mutations = self.changes.len(), "write aborted");
    }

    /// Derive events for every mutation, publish the new tables, then stage
    /// the events for the event bus.
    ///
    /// If any topic handler fails the whole transaction is discarded and no
    /// reader ever observes it. Staging does not wait for subscribers.
    pub fn commit(mut self) -> Result<Index> {
        self.changes.seal();
        let index = self.index;
        self.root.index = index;
        self.root.commit += 1;
        let view = ReadTxn::new(Arc::new(self.root));

        let events = if self.changes.is_empty() {
            Vec::new()
        } else {
            self.store.registry.derive_events(&view, &self.changes)?
        };

        // The root goes out before its events: a subscriber that splices
        // in ahead of these events must already read this root.
        self.store.committed.publish(Arc::clone(view.root()));

        if !events.is_empty() {
            let count = events.len();
            match self.store.bus.stage(view, events) {
                Ok(()) => debug!(index = %index, events = count, "staged commit events"),
                Err(err) => warn!(index = %index, %err, "commit events dropped"),
            }
        }

        Ok(index)
    }
}
