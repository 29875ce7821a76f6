//! Events, payloads and the per-event read filter.

use crate::types::{Index, Operation, Subject, Topic};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Read permissions of the principal a subscription serves.
pub trait Authorizer: Send + Sync {
    /// Whether events for `subject` on `topic` may be shown.
    fn can_read(&self, topic: &Topic, subject: &Subject) -> bool;
}

/// Authorizer that allows everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn can_read(&self, _topic: &Topic, _subject: &Subject) -> bool {
        true
    }
}

/// Authorizer that allows nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn can_read(&self, _topic: &Topic, _subject: &Subject) -> bool {
        false
    }
}

/// Downcast support for payload trait objects.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Domain payload carried by a data event.
///
/// Implementations must not mutate after construction; one payload is shared
/// by every subscriber that receives the event.
pub trait EventPayload: AsAny + fmt::Debug + Send + Sync {
    /// Routing key of this payload within its topic.
    fn subject(&self) -> Subject;

    /// Whether the holder of `authz` may see this payload.
    fn has_read_permission(&self, authz: &dyn Authorizer) -> bool;
}

/// A change to an identity or permission object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AclChange {
    /// A credential was created, changed or deleted.
    Token { secret: String },
    /// A permission policy changed.
    Policy { id: String },
    /// A permission role changed.
    Role { id: String },
}

/// What an event carries.
#[derive(Clone)]
pub enum Payload {
    /// A domain change routed by the payload's subject.
    Data(Arc<dyn EventPayload>),
    /// An identity/permission change. Consumed by invalidation, never
    /// delivered to subscribers.
    Acl(AclChange),
    /// Marks the end of the initial snapshot; live events follow.
    EndOfSnapshot,
    /// The requested resume index could not be honoured; the client must
    /// discard its view because a full snapshot follows.
    NewSnapshotToFollow,
    /// The requested resume index was honoured; live events follow.
    ResumeStream,
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Data(p) => f.debug_tuple("Data").field(p).finish(),
            Payload::Acl(change) => f.debug_tuple("Acl").field(change).finish(),
            Payload::EndOfSnapshot => f.write_str("EndOfSnapshot"),
            Payload::NewSnapshotToFollow => f.write_str("NewSnapshotToFollow"),
            Payload::ResumeStream => f.write_str("ResumeStream"),
        }
    }
}

/// An immutable change notification.
///
/// All events derived from one commit share that commit's index.
#[derive(Clone, Debug)]
pub struct Event {
    pub topic: Topic,
    pub index: Index,
    pub operation: Operation,
    pub payload: Payload,
}

impl Event {
    /// A data event. The index is stamped when the event is committed.
    pub fn new(topic: Topic, operation: Operation, payload: impl EventPayload + 'static) -> Self {
        Self {
            topic,
            index: Index::ZERO,
            operation,
            payload: Payload::Data(Arc::new(payload)),
        }
    }

    /// An identity/permission change event.
    pub fn acl(topic: Topic, operation: Operation, change: AclChange) -> Self {
        Self {
            topic,
            index: Index::ZERO,
            operation,
            payload: Payload::Acl(change),
        }
    }

    pub(crate) fn framing(topic: Topic, index: Index, payload: Payload) -> Self {
        Self {
            topic,
            index,
            operation: Operation::Upsert,
            payload,
        }
    }

    pub fn with_index(mut self, index: Index) -> Self {
        self.index = index;
        self
    }

    /// Routing key. Framing and ACL events have none.
    pub fn subject(&self) -> Subject {
        match &self.payload {
            Payload::Data(p) => p.subject(),
            _ => Subject::None,
        }
    }

    /// Borrow the data payload as its concrete type.
    pub fn payload_as<T: EventPayload + 'static>(&self) -> Option<&T> {
        match &self.payload {
            Payload::Data(p) => (**p).as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn is_end_of_snapshot(&self) -> bool {
        matches!(self.payload, Payload::EndOfSnapshot)
    }

    pub fn is_new_snapshot_to_follow(&self) -> bool {
        matches!(self.payload, Payload::NewSnapshotToFollow)
    }

    pub fn is_resume_stream(&self) -> bool {
        matches!(self.payload, Payload::ResumeStream)
    }

    /// Whether the event is stream framing rather than data.
    pub fn is_framing(&self) -> bool {
        matches!(
            self.payload,
            Payload::EndOfSnapshot | Payload::NewSnapshotToFollow | Payload::ResumeStream
        )
    }

    pub(crate) fn visible_to(&self, authz: Option<&dyn Authorizer>) -> bool {
        match (&self.payload, authz) {
            (Payload::Data(p), Some(authz)) => p.has_read_permission(authz),
            (Payload::Acl(_), _) => false,
            _ => true,
        }
    }
}
