//! In-memory, versioned table store with change-tracked commits.
//!
//! Readers take a [`ReadTxn`], an immutable view of every table at one
//! index. A single writer at a time builds a [`WriteTxn`] on a private copy
//! of the tables; committing derives the commit's events, publishes the new
//! tables and stages the events on the store's [`EventBus`].

mod changes;
mod table;
mod txn;

pub use changes::{ChangeSet, Mutation};
pub use table::{Row, Schema};
pub use txn::{ReadTxn, WriteTxn};

use crate::config::EventBusConfig;
use crate::error::{Result, StoreError};
use crate::stream::{Context, EventBus, HandlerRegistry, SubscribeRequest, Subscription};
use crate::types::Index;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use table::Root;
use tracing::info;

/// The latest committed tables, swapped in whole on every commit.
pub(crate) struct CommittedState {
    root: RwLock<Arc<Root>>,
}

impl CommittedState {
    fn new(root: Root) -> Self {
        Self {
            root: RwLock::new(Arc::new(root)),
        }
    }

    pub(crate) fn view(&self) -> ReadTxn {
        ReadTxn::new(Arc::clone(&self.root.read()))
    }

    pub(crate) fn publish(&self, root: Arc<Root>) {
        *self.root.write() = root;
    }

    pub(crate) fn index(&self) -> Index {
        self.root.read().index
    }
}

/// The versioned store and its event bus.
pub struct Store {
    schema: Schema,
    pub(crate) committed: Arc<CommittedState>,
    pub(crate) registry: HandlerRegistry,
    pub(crate) bus: EventBus,
    /// Serializes writers.
    write_lock: Mutex<()>,
}

impl Store {
    /// Create an empty store with the given tables and start its event bus.
    pub fn new(schema: Schema, registry: HandlerRegistry, config: EventBusConfig) -> Result<Self> {
        let committed = Arc::new(CommittedState::new(Root::from_schema(&schema)));
        let bus = EventBus::start(registry.clone(), Arc::clone(&committed), config)?;
        info!(tables = schema.tables().count(), "store created");
        Ok(Self {
            schema,
            committed,
            registry,
            bus,
            write_lock: Mutex::new(()),
        })
    }

    /// A consistent view of the latest commit.
    pub fn read(&self) -> ReadTxn {
        self.committed.view()
    }

    /// Start the write that will commit at `index`.
    ///
    /// Blocks while another write is in progress. `index` must not be lower
    /// than the last committed index.
    pub fn write(&self, index: Index) -> Result<WriteTxn<'_>> {
        let guard = self.write_lock.lock();
        let root = self.committed.view().root().as_ref().clone();
        if index < root.index {
            return Err(StoreError::InvalidIndex {
                index,
                current: root.index,
            });
        }
        Ok(WriteTxn::new(self, guard, root, index))
    }

    /// Open a subscription on the store's event bus.
    pub fn subscribe(&self, req: SubscribeRequest, ctx: &Context) -> Result<Subscription> {
        self.bus.subscribe(req, ctx)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Index of the latest commit.
    pub fn last_index(&self) -> Index {
        self.committed.index()
    }

    /// Stop the event bus and close every subscription. Reads and writes
    /// keep working; commits just stop producing events.
    pub fn shutdown(&self) {
        self.bus.shutdown();
    }
}
