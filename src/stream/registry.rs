//! Static mapping from topic to its event derivation and snapshot functions.

use super::acl::AclResolver;
use super::event::{Event, Payload};
use super::snapshot::SnapshotAppender;
use crate::error::{Result, StoreError};
use crate::store::{ChangeSet, ReadTxn};
use crate::types::{Index, Subject, Topic};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Turns the mutations of one commit into events for a topic.
///
/// Receives the committing transaction for read-only lookups of related
/// rows.
pub type DeriveFn = Arc<dyn Fn(&ReadTxn, &ChangeSet) -> Result<Vec<Event>> + Send + Sync>;

/// Appends the current state for a subject and returns the index it
/// represents.
pub type SnapshotFn =
    Arc<dyn Fn(&ReadTxn, &Subject, &mut SnapshotAppender) -> Result<Index> + Send + Sync>;

#[derive(Clone)]
enum HandlerKind {
    Data {
        snapshot: SnapshotFn,
        supports_wildcard: bool,
    },
    Acl,
}

/// Functions supplied by a domain collaborator for one topic.
#[derive(Clone)]
pub struct TopicHandler {
    derive: DeriveFn,
    kind: HandlerKind,
}

impl TopicHandler {
    /// Handler for a subscribable data topic.
    pub fn new<D, S>(derive: D, snapshot: S) -> Self
    where
        D: Fn(&ReadTxn, &ChangeSet) -> Result<Vec<Event>> + Send + Sync + 'static,
        S: Fn(&ReadTxn, &Subject, &mut SnapshotAppender) -> Result<Index> + Send + Sync + 'static,
    {
        Self {
            derive: Arc::new(derive),
            kind: HandlerKind::Data {
                snapshot: Arc::new(snapshot),
                supports_wildcard: false,
            },
        }
    }

    /// Handler for an identity/permission topic. Its events drive
    /// subscription invalidation and are never delivered.
    pub fn acl<D>(derive: D) -> Self
    where
        D: Fn(&ReadTxn, &ChangeSet) -> Result<Vec<Event>> + Send + Sync + 'static,
    {
        Self {
            derive: Arc::new(derive),
            kind: HandlerKind::Acl,
        }
    }

    /// Allow subscriptions to every subject of the topic at once.
    pub fn with_wildcard(mut self) -> Self {
        if let HandlerKind::Data {
            supports_wildcard, ..
        } = &mut self.kind
        {
            *supports_wildcard = true;
        }
        self
    }

    fn is_acl(&self) -> bool {
        matches!(self.kind, HandlerKind::Acl)
    }
}

impl fmt::Debug for TopicHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            HandlerKind::Data {
                supports_wildcard, ..
            } => f
                .debug_struct("TopicHandler")
                .field("acl", &false)
                .field("supports_wildcard", supports_wildcard)
                .finish(),
            HandlerKind::Acl => f.debug_struct("TopicHandler").field("acl", &true).finish(),
        }
    }
}

/// Builds a [`HandlerRegistry`] at startup.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: BTreeMap<Topic, TopicHandler>,
    resolver: Option<Arc<dyn AclResolver>>,
}

impl HandlerRegistryBuilder {
    /// Register the handler for a topic. Each topic has exactly one.
    pub fn register_handler(&mut self, topic: Topic, handler: TopicHandler) -> Result<&mut Self> {
        if self.handlers.contains_key(&topic) {
            return Err(StoreError::DuplicateHandler(topic));
        }
        self.handlers.insert(topic, handler);
        Ok(self)
    }

    /// Register an identity/permission topic.
    pub fn register_acl_topic<D>(&mut self, topic: Topic, derive: D) -> Result<&mut Self>
    where
        D: Fn(&ReadTxn, &ChangeSet) -> Result<Vec<Event>> + Send + Sync + 'static,
    {
        self.register_handler(topic, TopicHandler::acl(derive))
    }

    /// Lookup used to find credentials affected by policy and role changes.
    pub fn acl_resolver(&mut self, resolver: Arc<dyn AclResolver>) -> &mut Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(&mut self) -> HandlerRegistry {
        HandlerRegistry {
            inner: Arc::new(RegistryInner {
                handlers: std::mem::take(&mut self.handlers),
                resolver: self.resolver.take(),
            }),
        }
    }
}

struct RegistryInner {
    handlers: BTreeMap<Topic, TopicHandler>,
    resolver: Option<Arc<dyn AclResolver>>,
}

/// Read-only table of topic handlers, shared by the store and its bus.
#[derive(Clone)]
pub struct HandlerRegistry {
    inner: Arc<RegistryInner>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// A registry with no topics.
    pub fn empty() -> Self {
        Self::builder().build()
    }

    pub fn topics(&self) -> impl Iterator<Item = &Topic> {
        self.inner.handlers.keys()
    }

    pub fn is_acl(&self, topic: &Topic) -> bool {
        self.inner
            .handlers
            .get(topic)
            .map_or(false, TopicHandler::is_acl)
    }

    pub(crate) fn resolver(&self) -> Option<&dyn AclResolver> {
        self.inner.resolver.as_deref()
    }

    fn handler(&self, topic: &Topic) -> Result<&TopicHandler> {
        self.inner
            .handlers
            .get(topic)
            .ok_or_else(|| StoreError::UnknownTopic(topic.clone()))
    }

    /// Snapshot function for a subscribe request, after checking that the
    /// topic can be subscribed to with this subject.
    pub(crate) fn snapshot_fn(&self, topic: &Topic, subject: &Subject) -> Result<SnapshotFn> {
        match &self.handler(topic)?.kind {
            HandlerKind::Acl => Err(StoreError::InvalidSubject {
                topic: topic.clone(),
                reason: "topic does not support subscriptions".into(),
            }),
            HandlerKind::Data {
                supports_wildcard: false,
                ..
            } if subject.is_wildcard() => Err(StoreError::InvalidSubject {
                topic: topic.clone(),
                reason: "topic does not support wildcard subscriptions".into(),
            }),
            HandlerKind::Data { snapshot, .. } => Ok(Arc::clone(snapshot)),
        }
    }

    /// Run every handler over one commit's mutations.
    ///
    /// Events are stamped with the commit index. Any handler error, or any
    /// event that does not belong to the handler's topic, fails the commit.
    pub(crate) fn derive_events(&self, tx: &ReadTxn, changes: &ChangeSet) -> Result<Vec<Event>> {
        let mut all = Vec::new();
        for (topic, handler) in &self.inner.handlers {
            let events = (handler.derive)(tx, changes).map_err(|e| StoreError::EventDerivation {
                topic: topic.clone(),
                reason: e.to_string(),
            })?;

            for mut event in events {
                if &event.topic != topic {
                    return Err(StoreError::InvalidEvent(format!(
                        "handler for {} produced an event for {}",
                        topic, event.topic
                    )));
                }
                self.check_event(handler, &event)?;
                event.index = tx.index();
                all.push(event);
            }
        }
        Ok(all)
    }

    /// Validate events published directly, outside a commit.
    pub(crate) fn validate(&self, events: &[Event]) -> Result<()> {
        for event in events {
            let handler = self.handler(&event.topic)?;
            self.check_event(handler, event)?;
        }
        Ok(())
    }

    fn check_event(&self, handler: &TopicHandler, event: &Event) -> Result<()> {
        match (&event.payload, handler.is_acl()) {
            (Payload::Acl(_), true) => Ok(()),
            (Payload::Data(_), false) if event.subject().is_wildcard() => {
                Err(StoreError::InvalidEvent(format!(
                    "event on {} uses the wildcard subject",
                    event.topic
                )))
            }
            (Payload::Data(_), false) => Ok(()),
            (_, true) => Err(StoreError::InvalidEvent(format!(
                "{} only carries ACL changes",
                event.topic
            ))),
            (_, false) => Err(StoreError::InvalidEvent(format!(
                "{} cannot carry {:?}",
                event.topic, event.payload
            ))),
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.inner.handlers.iter()).finish()
    }
}
