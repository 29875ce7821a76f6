//! Append-only, singly linked buffer of event batches.
//!
//! The buffer only holds its tail. Readers keep an `Arc` to the item they
//! are positioned at and walk forward; items nobody references any more are
//! freed. Each item's `next` is assigned at most once and readers wait for
//! it on the item's link channel, which is disconnected when `next` is set.

use super::event::Event;
use crate::error::{Result, StoreError};
use crate::types::Index;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// One batch of events in a topic buffer.
pub struct BufferItem {
    events: Vec<Event>,
    /// Position in the buffer; the initial empty item is 0.
    seq: u64,
    /// Store commit the batch was derived from; `None` for events published
    /// outside a commit.
    commit: Option<u64>,
    next: OnceLock<Arc<BufferItem>>,
    link_tx: Mutex<Option<Sender<()>>>,
    link_rx: Receiver<()>,
}

impl BufferItem {
    fn new(events: Vec<Event>, seq: u64, commit: Option<u64>) -> Self {
        let (link_tx, link_rx) = bounded(0);
        Self {
            events,
            seq,
            commit,
            next: OnceLock::new(),
            link_tx: Mutex::new(Some(link_tx)),
            link_rx,
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// The following item, if it has been appended yet.
    pub fn next(&self) -> Option<&Arc<BufferItem>> {
        self.next.get()
    }

    /// Disconnected once `next` is set. Meant for `select!`.
    pub(crate) fn link(&self) -> &Receiver<()> {
        &self.link_rx
    }

    /// Whether this batch came from a commit at or before `commit`.
    fn covered_by(&self, commit: u64) -> bool {
        self.commit.map_or(false, |c| c <= commit)
    }

    /// Whether this item's batch was committed at `index`.
    pub fn has_event_index(&self, index: Index) -> bool {
        self.events.first().map_or(false, |e| e.index == index)
    }

    fn set_next(&self, item: Arc<BufferItem>) -> Result<()> {
        self.next
            .set(item)
            .map_err(|_| StoreError::InvalidEvent("buffer item linked twice".into()))?;
        self.link_tx.lock().take();
        Ok(())
    }
}

impl Drop for BufferItem {
    // Unlink iteratively so dropping a long unreferenced chain cannot
    // overflow the stack.
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(item) = next {
            match Arc::try_unwrap(item) {
                Ok(mut item) => next = item.next.take(),
                Err(_) => break,
            }
        }
    }
}

/// Buffer of event batches for one (topic, subject).
///
/// `append` must only be called from the single publisher thread; `head`
/// and reads are safe from anywhere.
pub struct TopicBuffer {
    tail: Mutex<Arc<BufferItem>>,
    tail_seq: AtomicU64,
    retention: u64,
}

impl TopicBuffer {
    pub fn new(retention: usize) -> Self {
        Self {
            tail: Mutex::new(Arc::new(BufferItem::new(Vec::new(), 0, None))),
            tail_seq: AtomicU64::new(0),
            retention: retention.max(1) as u64,
        }
    }

    /// The most recently appended item. Following it yields only events
    /// appended from now on.
    pub fn head(&self) -> Arc<BufferItem> {
        Arc::clone(&self.tail.lock())
    }

    /// Append one batch, derived from store commit `commit` if any, and wake
    /// every reader waiting on the old tail.
    pub fn append(&self, events: Vec<Event>, commit: Option<u64>) -> Result<()> {
        let mut tail = self.tail.lock();
        let item = Arc::new(BufferItem::new(events, tail.seq + 1, commit));
        tail.set_next(Arc::clone(&item))?;
        self.tail_seq.store(item.seq, Ordering::Release);
        *tail = item;
        Ok(())
    }

    /// How many batches `item` trails the tail by.
    pub fn lag(&self, item: &BufferItem) -> u64 {
        self.tail_seq.load(Ordering::Acquire).saturating_sub(item.seq)
    }

    /// Whether `item` has fallen out of the retained window.
    pub fn is_truncated(&self, item: &BufferItem) -> bool {
        self.lag(item) > self.retention
    }
}

/// Reader position in a topic buffer.
pub(crate) struct BufferCursor {
    buffer: Arc<TopicBuffer>,
    item: Arc<BufferItem>,
    pos: usize,
    /// Batches from commits up to this one are already known to the reader.
    covered: u64,
}

impl BufferCursor {
    /// Cursor yielding every event appended strictly after `item`.
    pub(crate) fn follow_after(buffer: Arc<TopicBuffer>, item: Arc<BufferItem>) -> Self {
        let pos = item.events.len();
        Self {
            buffer,
            item,
            pos,
            covered: 0,
        }
    }

    /// Skip batches from store commits up to and including `commit`, such
    /// as those a snapshot read from that commit already reflects.
    pub(crate) fn skipping_through(mut self, commit: u64) -> Self {
        self.covered = commit;
        self
    }

    /// Next event without blocking. `Ok(None)` means wait on [`Self::link`].
    ///
    /// Fails with `ForcedReset` if the reader fell out of the retained window.
    pub(crate) fn try_next(&mut self) -> Result<Option<Event>> {
        loop {
            if let Some(event) = self.item.events.get(self.pos) {
                self.pos += 1;
                return Ok(Some(event.clone()));
            }

            let next = match self.item.next() {
                Some(next) => Arc::clone(next),
                None => return Ok(None),
            };
            if self.buffer.is_truncated(&next) {
                return Err(StoreError::ForcedReset);
            }
            self.pos = if next.covered_by(self.covered) {
                next.events.len()
            } else {
                0
            };
            self.item = next;
        }
    }

    pub(crate) fn link(&self) -> &Receiver<()> {
        self.item.link()
    }
}
