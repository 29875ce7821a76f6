//! Subscribe requests and the per-consumer cursor they return.

use super::acl::SubscriptionState;
use super::buffer::BufferCursor;
use super::context::Context;
use super::event::{Authorizer, Event};
use super::publisher::BusInner;
use super::snapshot::TopicKey;
use crate::error::{Result, StoreError};
use crate::types::{Index, Subject, SubscriptionId, Topic};
use crossbeam_channel::select;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// What to watch, as whom, and from where.
#[derive(Clone)]
pub struct SubscribeRequest {
    pub topic: Topic,
    pub subject: Subject,
    /// Credential secret. Only its hash is kept.
    pub token: String,
    /// Last index the client has seen, or zero for a fresh start.
    pub index: Index,
    /// Per-event read filter; `None` delivers everything.
    pub authorizer: Option<Arc<dyn Authorizer>>,
}

impl SubscribeRequest {
    pub fn new(topic: Topic, subject: Subject) -> Self {
        Self {
            topic,
            subject,
            token: String::new(),
            index: Index::ZERO,
            authorizer: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Resume after `index` if the bus still holds it.
    pub fn with_index(mut self, index: Index) -> Self {
        self.index = index;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }
}

impl fmt::Debug for SubscribeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeRequest")
            .field("topic", &self.topic)
            .field("subject", &self.subject)
            .field("index", &self.index)
            .field("authorizer", &self.authorizer.is_some())
            .finish_non_exhaustive()
    }
}

/// Where a new subscription starts reading.
pub(crate) struct Start {
    /// Framing events delivered first.
    pub(crate) framing: Vec<Event>,
    /// Snapshot events delivered after the framing.
    pub(crate) replay: Arc<[Event]>,
    /// Live events, positioned after whatever the replay already covers.
    pub(crate) cursor: BufferCursor,
}

/// A consumer's stream of events for one (topic, subject).
///
/// Delivers the initial snapshot (or a resume marker), then live events in
/// commit order. Dropping the subscription releases it.
pub struct Subscription {
    bus: Arc<BusInner>,
    state: Arc<SubscriptionState>,
    key: TopicKey,
    /// Lifetime of the subscription; once it ends the subscription is
    /// closed and released.
    ctx: Context,
    authorizer: Option<Arc<dyn Authorizer>>,
    framing: VecDeque<Event>,
    replay: Arc<[Event]>,
    replay_pos: usize,
    cursor: BufferCursor,
}

impl Subscription {
    pub(crate) fn new(
        bus: Arc<BusInner>,
        state: Arc<SubscriptionState>,
        key: TopicKey,
        ctx: Context,
        authorizer: Option<Arc<dyn Authorizer>>,
        start: Start,
    ) -> Self {
        Self {
            bus,
            state,
            key,
            ctx,
            authorizer,
            framing: start.framing.into(),
            replay: start.replay,
            replay_pos: 0,
            cursor: start.cursor,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.state.id()
    }

    pub fn topic(&self) -> &Topic {
        &self.key.0
    }

    pub fn subject(&self) -> &Subject {
        &self.key.1
    }

    /// Block until the next visible event.
    ///
    /// Fails with the reason the subscription was closed (`ForcedReset`,
    /// `Unsubscribed`, `ShuttingDown`), with `Cancelled` once the subscribe
    /// context is cancelled, or with the error of `ctx` if this call's own
    /// context ends first. Only the last case leaves the subscription usable.
    pub fn next(&mut self, ctx: &Context) -> Result<Event> {
        loop {
            if let Some(reason) = self.state.closed_reason() {
                self.release();
                return Err(reason);
            }
            if let Some(err) = self.ctx.err() {
                self.close(err.clone());
                return Err(err);
            }
            if let Some(err) = ctx.err() {
                return Err(err);
            }

            if let Some(event) = self.framing.pop_front() {
                return Ok(event);
            }
            if let Some(event) = self.next_replayed() {
                return Ok(event);
            }

            match self.cursor.try_next() {
                Ok(Some(event)) => {
                    if !self.visible(&event) {
                        continue;
                    }
                    return Ok(event);
                }
                Ok(None) => self.wait(ctx),
                Err(err) => {
                    warn!(
                        subscription = ?self.state.id(),
                        topic = %self.key.0,
                        subject = %self.key.1,
                        "subscriber fell behind the topic buffer, resetting"
                    );
                    self.close(err.clone());
                    return Err(err);
                }
            }
        }
    }

    fn next_replayed(&mut self) -> Option<Event> {
        while let Some(event) = self.replay.get(self.replay_pos) {
            self.replay_pos += 1;
            if self.visible(event) {
                return Some(event.clone());
            }
        }
        None
    }

    fn visible(&self, event: &Event) -> bool {
        event.visible_to(self.authorizer.as_deref())
    }

    // Wake on a new batch, a close, or either context ending.
    fn wait(&self, ctx: &Context) {
        let own_deadline = self.ctx.deadline_timer();
        let call_deadline = ctx.deadline_timer();
        select! {
            recv(self.cursor.link()) -> _ => {}
            recv(self.state.closed_signal()) -> _ => {}
            recv(self.ctx.done()) -> _ => {}
            recv(ctx.done()) -> _ => {}
            recv(own_deadline) -> _ => {}
            recv(call_deadline) -> _ => {}
        }
    }

    /// Close the subscription. Later calls to [`Subscription::next`] fail
    /// with `Unsubscribed`.
    pub fn unsubscribe(&mut self) {
        self.close(StoreError::Unsubscribed);
    }

    /// Whether the subscription was closed, and why.
    pub fn closed_reason(&self) -> Option<StoreError> {
        self.state.closed_reason()
    }

    fn close(&mut self, reason: StoreError) {
        if self.state.close(reason.clone()) {
            debug!(subscription = ?self.state.id(), topic = %self.key.0, %reason, "subscription closed");
        }
        self.release();
    }

    fn release(&self) {
        self.bus.release(&self.key, &self.state);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.state.close(StoreError::Unsubscribed);
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.state.id())
            .field("topic", &self.key.0)
            .field("subject", &self.key.1)
            .field("closed", &self.state.closed_reason())
            .finish()
    }
}
