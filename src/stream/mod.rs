//! Change streaming on top of the versioned store.
//!
//! Commits turn their mutations into [`Event`]s through the topic handlers in
//! a [`HandlerRegistry`]. The [`EventBus`] appends those events to per-topic
//! buffers from a single publisher thread, and each [`Subscription`] walks a
//! buffer from the point its snapshot was taken.
//!
//! - Snapshots are built once per (topic, subject) and shared for a short TTL
//! - A client that still holds the newest index resumes without a snapshot
//! - Changes to credentials, policies or roles reset affected subscriptions
//!
//! # Example
//!
//! ```ignore
//! let mut sub = store.subscribe(
//!     SubscribeRequest::new(SERVICES, Subject::key("web")).with_token(secret),
//!     &Context::background(),
//! )?;
//!
//! loop {
//!     match sub.next(&Context::background()) {
//!         Ok(event) if event.is_end_of_snapshot() => println!("caught up"),
//!         Ok(event) => println!("{:?}", event),
//!         Err(err) if err.is_retryable() => break, // resubscribe
//!         Err(_) => break,
//!     }
//! }
//! ```

mod acl;
mod buffer;
mod context;
mod event;
mod publisher;
mod registry;
mod snapshot;
mod subscription;

pub use acl::AclResolver;
pub use buffer::{BufferItem, TopicBuffer};
pub use context::{CancelHandle, Context};
pub use event::{AclChange, AllowAll, AsAny, Authorizer, DenyAll, Event, EventPayload, Payload};
pub use publisher::EventBus;
pub use registry::{DeriveFn, HandlerRegistry, HandlerRegistryBuilder, SnapshotFn, TopicHandler};
pub use snapshot::SnapshotAppender;
pub use subscription::{SubscribeRequest, Subscription};
