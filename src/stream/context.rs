//! Cancellation and deadlines for blocking calls.

use crate::error::StoreError;
use crossbeam_channel::{at, bounded, never, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Carries a cancellation signal and an optional deadline into blocking
/// operations such as [`Subscription::next`](super::Subscription::next).
///
/// Cancellation is observed as the `done` channel disconnecting. Clones share
/// the same signal.
#[derive(Clone)]
pub struct Context {
    done: Receiver<()>,
    // Keeps the sender alive until cancelled, even once the handle is gone.
    slot: Option<Arc<Mutex<Option<Sender<()>>>>>,
    deadline: Option<Instant>,
}

/// Cancels the [`Context`] it was created with.
#[derive(Clone)]
pub struct CancelHandle {
    slot: Arc<Mutex<Option<Sender<()>>>>,
}

impl CancelHandle {
    /// Cancel the context. Idempotent.
    pub fn cancel(&self) {
        self.slot.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            done: never(),
            slot: None,
            deadline: None,
        }
    }

    /// A context cancelled through the returned handle.
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = bounded(0);
        let slot = Arc::new(Mutex::new(Some(tx)));
        let ctx = Self {
            done: rx,
            slot: Some(Arc::clone(&slot)),
            deadline: None,
        };
        (ctx, CancelHandle { slot })
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self::background().deadline_at(deadline)
    }

    /// This context with a deadline `timeout` from now, or its existing
    /// deadline if that is sooner.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline_at(Instant::now() + timeout)
    }

    /// This context with a deadline at `deadline`, or its existing deadline
    /// if that is sooner.
    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether this context can ever be cancelled or run out of time.
    pub(crate) fn can_end(&self) -> bool {
        self.slot.is_some() || self.deadline.is_some()
    }

    /// Why the context ended, or `None` while it is live.
    pub fn err(&self) -> Option<StoreError> {
        if let Err(TryRecvError::Disconnected) = self.done.try_recv() {
            return Some(StoreError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(StoreError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Disconnected on cancellation. Meant for `select!`.
    pub fn done(&self) -> &Receiver<()> {
        &self.done
    }

    /// Fires at the deadline, or never. Meant for `select!`.
    pub fn deadline_timer(&self) -> Receiver<Instant> {
        match self.deadline {
            Some(deadline) => at(deadline),
            None => never(),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.deadline)
            .field("err", &self.err())
            .finish()
    }
}
