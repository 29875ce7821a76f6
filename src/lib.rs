//! # Statestream
//!
//! An in-memory, versioned state store whose commits are streamed to
//! long-lived subscribers.
//!
//! ## Core Concepts
//!
//! - **Store**: Copy-on-write tables with one writer and many readers, every
//!   commit tagged with an external index
//! - **Topics**: Domain handlers turn each commit's mutations into typed events
//! - **Event bus**: Per-topic buffers filled by one background publisher
//! - **Subscriptions**: Snapshot first, then live events; resumable by index
//!   and reset when the credential they were opened with changes
//!
//! ## Example
//!
//! ```ignore
//! use statestream::{Context, HandlerRegistry, Schema, Store, SubscribeRequest, TopicHandler};
//!
//! let mut registry = HandlerRegistry::builder();
//! registry.register_handler(SERVICES, TopicHandler::new(derive_services, snapshot_services))?;
//!
//! let store = Store::new(
//!     Schema::new().with_table("services"),
//!     registry.build(),
//!     Default::default(),
//! )?;
//!
//! let mut sub = store.subscribe(
//!     SubscribeRequest::new(SERVICES, Subject::key("web")).with_token(secret),
//!     &Context::background(),
//! )?;
//!
//! let mut tx = store.write(Index(5))?;
//! tx.insert("services", "web", json!({"port": 80}))?;
//! tx.commit()?;
//!
//! let event = sub.next(&Context::background())?;
//! ```

pub mod config;
pub mod error;
pub mod store;
pub mod stream;
pub mod types;

// Re-exports
pub use config::EventBusConfig;
pub use error::{Result, StoreError};
pub use store::{ChangeSet, Mutation, ReadTxn, Row, Schema, Store, WriteTxn};
pub use stream::{
    AclChange, AclResolver, AllowAll, Authorizer, CancelHandle, Context, DenyAll, Event, EventBus,
    EventPayload, HandlerRegistry, HandlerRegistryBuilder, Payload, SnapshotAppender,
    SubscribeRequest, Subscription, TopicHandler,
};
pub use types::*;
