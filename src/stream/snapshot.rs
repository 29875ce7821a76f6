//! Materialized initial-state snapshots and their short-lived cache.

use super::buffer::{BufferItem, TopicBuffer};
use super::context::Context;
use super::event::{Event, Payload};
use crate::error::{Result, StoreError};
use crate::types::{Index, Subject, Topic};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

pub(crate) type TopicKey = (Topic, Subject);

/// Collects the events a snapshot function produces.
#[derive(Debug, Default)]
pub struct SnapshotAppender {
    events: Vec<Event>,
}

impl SnapshotAppender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, events: impl IntoIterator<Item = Event>) {
        self.events.extend(events);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// A finished snapshot: its events (ending in `EndOfSnapshot`) and the index
/// they represent.
#[derive(Clone, Debug)]
pub(crate) struct SnapshotData {
    pub(crate) events: Arc<[Event]>,
    pub(crate) index: Index,
    /// Store commit the snapshot was read from. Live batches from that
    /// commit or earlier are already reflected in the snapshot.
    pub(crate) commit: u64,
}

/// Snapshot for one (topic, subject), built at most once.
///
/// Concurrent subscribers share a single build: the first one runs it, the
/// rest wait on `done`, which is disconnected when the result is set.
pub(crate) struct EventSnapshot {
    /// Topic buffer position captured together with the snapshot; live
    /// events continue after it.
    splice: Arc<BufferItem>,
    result: OnceLock<Result<SnapshotData>>,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
}

impl EventSnapshot {
    pub(crate) fn new(splice: Arc<BufferItem>) -> Self {
        let (done_tx, done_rx) = bounded(0);
        Self {
            splice,
            result: OnceLock::new(),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
        }
    }

    pub(crate) fn splice(&self) -> &Arc<BufferItem> {
        &self.splice
    }

    fn is_complete(&self) -> bool {
        self.result.get().is_some()
    }

    fn failed(&self) -> bool {
        matches!(self.result.get(), Some(Err(_)))
    }

    /// Run the snapshot function and publish its result to every waiter.
    pub(crate) fn build<F>(&self, topic: &Topic, commit: u64, build: F)
    where
        F: FnOnce(&mut SnapshotAppender) -> Result<Index>,
    {
        // Waiters must never hang, even if `build` unwinds.
        struct Completion<'a>(&'a EventSnapshot);
        impl Drop for Completion<'_> {
            fn drop(&mut self) {
                let _ = self.0.result.set(Err(StoreError::SnapshotBuildFailed(
                    "snapshot build did not complete".into(),
                )));
                self.0.done_tx.lock().take();
            }
        }
        let _completion = Completion(self);

        let mut appender = SnapshotAppender::new();
        let result = build(&mut appender).map(|index| {
            let mut events = appender.events;
            // Clients treat index 0 as "no index"; never hand it out.
            let end_index = Index(index.0.max(1));
            events.push(Event::framing(topic.clone(), end_index, Payload::EndOfSnapshot));
            SnapshotData {
                events: events.into(),
                index,
                commit,
            }
        });
        let result = result.map_err(|err| match err {
            StoreError::SnapshotBuildFailed(_) => err,
            other => StoreError::SnapshotBuildFailed(other.to_string()),
        });
        let _ = self.result.set(result);
    }

    /// Block until the snapshot is built or `ctx` ends.
    pub(crate) fn wait(&self, ctx: &Context) -> Result<SnapshotData> {
        loop {
            if let Some(result) = self.result.get() {
                return result.clone();
            }
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            let deadline = ctx.deadline_timer();
            select! {
                recv(self.done_rx) -> _ => {}
                recv(ctx.done()) -> _ => {}
                recv(deadline) -> _ => {}
            }
        }
    }
}

struct CachedSnapshot {
    snapshot: Arc<EventSnapshot>,
    created: Instant,
}

/// Snapshots by (topic, subject), reused for `ttl` after creation.
///
/// An entry that is still being built is always joined, so concurrent
/// subscribers share one build even when the TTL is zero. A failed build is
/// never reused.
pub(crate) struct SnapshotCache {
    entries: Mutex<LruCache<TopicKey, CachedSnapshot>>,
    ttl: Duration,
}

impl SnapshotCache {
    pub(crate) fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Cached snapshot for `key`, or a new unbuilt one spliced at `head`.
    ///
    /// The flag is true when the caller created the entry and must build it.
    pub(crate) fn get_or_insert(
        &self,
        key: &TopicKey,
        buffer: &TopicBuffer,
        head: Arc<BufferItem>,
    ) -> (Arc<EventSnapshot>, bool) {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        if let Some(cached) = entries.get(key) {
            if self.reusable(cached, buffer, now) {
                return (Arc::clone(&cached.snapshot), false);
            }
        }

        let snapshot = Arc::new(EventSnapshot::new(head));
        entries.put(
            key.clone(),
            CachedSnapshot {
                snapshot: Arc::clone(&snapshot),
                created: now,
            },
        );
        (snapshot, true)
    }

    fn reusable(&self, cached: &CachedSnapshot, buffer: &TopicBuffer, now: Instant) -> bool {
        let snapshot = &cached.snapshot;
        if !snapshot.is_complete() {
            return true;
        }
        !snapshot.failed()
            && now.duration_since(cached.created) < self.ttl
            && !buffer.is_truncated(snapshot.splice())
    }

    pub(crate) fn remove(&self, key: &TopicKey) {
        self.entries.lock().pop(key);
    }

    /// Drop finished entries older than the TTL.
    pub(crate) fn evict_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let expired: Vec<TopicKey> = entries
            .iter()
            .filter(|(_, c)| c.snapshot.is_complete() && now.duration_since(c.created) >= self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    pub(crate) fn contains(&self, key: &TopicKey) -> bool {
        self.entries.lock().contains(key)
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }
}
