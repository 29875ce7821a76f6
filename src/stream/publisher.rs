//! The event bus: one background publisher that appends staged commit events
//! to topic buffers, plus the subscribe path that splices snapshots onto
//! those buffers. A second thread releases subscriptions whose subscribe
//! context ends.

use super::acl::{affected_tokens, SubscriptionRegistry, SubscriptionState};
use super::buffer::{BufferCursor, TopicBuffer};
use super::context::Context;
use super::event::{Event, Payload};
use super::registry::HandlerRegistry;
use super::snapshot::{SnapshotCache, TopicKey};
use super::subscription::{Start, SubscribeRequest, Subscription};
use crate::config::EventBusConfig;
use crate::error::{Result, StoreError};
use crate::store::{CommittedState, ReadTxn};
use crate::types::{Subject, SubscriptionId, TokenHash, Topic};
use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Select, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Shortest interval between sweeps of expired snapshots.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

enum Staged {
    /// Events and the store view they were derived from. `commit` is the
    /// view's commit ordinal, or `None` for events published directly.
    Events {
        view: ReadTxn,
        commit: Option<u64>,
        events: Vec<Event>,
    },
    /// Answered once everything staged before it has been appended.
    Flush(Sender<()>),
}

struct TopicEntry {
    buffer: Arc<TopicBuffer>,
    subscribers: usize,
}

/// A subscription whose subscribe context can end.
struct Watched {
    key: TopicKey,
    state: Arc<SubscriptionState>,
    ctx: Context,
}

/// State shared by the bus handle, its publisher thread and subscriptions.
pub(crate) struct BusInner {
    registry: HandlerRegistry,
    committed: Arc<CommittedState>,
    config: EventBusConfig,
    /// Buffers by (topic, subject); present while anyone subscribes to them.
    topics: RwLock<HashMap<TopicKey, TopicEntry>>,
    snapshots: SnapshotCache,
    subscriptions: SubscriptionRegistry,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
    watch_tx: Sender<Watched>,
}

/// Fans committed events out to subscribers.
///
/// Lock order: topic buffers, then the snapshot cache, then the committed
/// root or the subscription registry.
pub struct EventBus {
    inner: Arc<BusInner>,
    staged_tx: Sender<Staged>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Start the publisher and reaper threads.
    pub(crate) fn start(
        registry: HandlerRegistry,
        committed: Arc<CommittedState>,
        config: EventBusConfig,
    ) -> Result<Self> {
        let (staged_tx, staged_rx) = bounded(config.publish_queue_depth.max(1));
        let (shutdown_tx, shutdown_rx) = bounded(0);
        let (watch_tx, watch_rx) = unbounded();

        let inner = Arc::new(BusInner {
            snapshots: SnapshotCache::new(config.snapshot_cache_ttl, config.snapshot_cache_capacity),
            registry,
            committed,
            config,
            topics: RwLock::new(HashMap::new()),
            subscriptions: SubscriptionRegistry::new(),
            next_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            watch_tx,
        });

        let worker_inner = Arc::clone(&inner);
        let worker_shutdown = shutdown_rx.clone();
        let worker = thread::Builder::new()
            .name("statestream-publisher".into())
            .spawn(move || worker_inner.run(staged_rx, worker_shutdown))
            .map_err(|e| StoreError::PublisherStart(e.to_string()))?;

        let reaper_inner = Arc::clone(&inner);
        let reaper = thread::Builder::new()
            .name("statestream-reaper".into())
            .spawn(move || reaper_inner.reap(watch_rx, shutdown_rx));
        let reaper = match reaper {
            Ok(reaper) => reaper,
            Err(e) => {
                // Stop the publisher that did start.
                inner.shutting_down.store(true, Ordering::SeqCst);
                drop(shutdown_tx);
                let _ = worker.join();
                return Err(StoreError::PublisherStart(e.to_string()));
            }
        };

        info!(
            topics = inner.registry.topics().count(),
            queue_depth = inner.config.publish_queue_depth,
            "event publisher started"
        );

        Ok(Self {
            inner,
            staged_tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            worker: Mutex::new(Some(worker)),
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Open a subscription.
    ///
    /// Resumes after `req.index` if the topic buffer's newest batch carries
    /// that index; otherwise delivers a snapshot first (preceded by
    /// `NewSnapshotToFollow` when a resume was asked for). May block while
    /// the snapshot is built. Once `ctx` is cancelled or its deadline passes
    /// the subscription is closed and released, whether or not anyone is
    /// calling [`Subscription::next`].
    pub fn subscribe(&self, req: SubscribeRequest, ctx: &Context) -> Result<Subscription> {
        self.inner.subscribe(req, ctx)
    }

    /// Publish events that did not come from a commit, such as ACL changes
    /// decided elsewhere. Events keep the index they carry.
    pub fn publish(&self, events: Vec<Event>) -> Result<()> {
        self.inner.registry.validate(&events)?;
        self.enqueue(self.inner.committed.view(), None, events)
    }

    /// Hand one commit's events to the publisher thread. Blocks only while
    /// the publish queue is full.
    pub(crate) fn stage(&self, view: ReadTxn, events: Vec<Event>) -> Result<()> {
        let commit = view.commit();
        self.enqueue(view, Some(commit), events)
    }

    fn enqueue(&self, view: ReadTxn, commit: Option<u64>, events: Vec<Event>) -> Result<()> {
        if self.inner.is_shutting_down() {
            return Err(StoreError::ShuttingDown);
        }
        self.staged_tx
            .send(Staged::Events {
                view,
                commit,
                events,
            })
            .map_err(|_| StoreError::ShuttingDown)
    }

    /// Wait until every event staged so far has been appended.
    pub fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = bounded(1);
        self.staged_tx
            .send(Staged::Flush(done_tx))
            .map_err(|_| StoreError::ShuttingDown)?;
        done_rx.recv().map_err(|_| StoreError::ShuttingDown)
    }

    /// Stop the publisher and close every subscription with `ShuttingDown`.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("event publisher thread panicked");
            }
        }
        if let Some(reaper) = self.reaper.lock().take() {
            if reaper.join().is_err() {
                error!("subscription reaper thread panicked");
            }
        }
        let closed = self.inner.subscriptions.close_all(StoreError::ShuttingDown);
        self.inner.snapshots.clear();
        info!(closed_subscriptions = closed, "event publisher stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    /// Open subscriptions across all credentials.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.count()
    }

    /// Open subscriptions created with the credential `secret`.
    pub fn subscriptions_for_token(&self, secret: &str) -> usize {
        self.inner.subscriptions.count_for(&TokenHash::of(secret))
    }

    /// Whether a buffer is held for `(topic, subject)`.
    pub fn has_topic_buffer(&self, topic: &Topic, subject: &Subject) -> bool {
        self.inner
            .topics
            .read()
            .contains_key(&(topic.clone(), subject.clone()))
    }

    /// Whether a snapshot for `(topic, subject)` is cached.
    pub fn has_cached_snapshot(&self, topic: &Topic, subject: &Subject) -> bool {
        self.inner
            .snapshots
            .contains(&(topic.clone(), subject.clone()))
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl BusInner {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn run(&self, staged: Receiver<Staged>, shutdown: Receiver<()>) {
        let sweep = tick(self.config.snapshot_cache_ttl.max(MIN_SWEEP_INTERVAL));
        loop {
            select! {
                recv(staged) -> msg => match msg {
                    Ok(Staged::Events { view, commit, events }) => {
                        self.publish_batch(&view, commit, events)
                    }
                    Ok(Staged::Flush(done)) => {
                        let _ = done.send(());
                    }
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
                recv(sweep) -> _ => {
                    let evicted = self.snapshots.evict_expired();
                    if evicted > 0 {
                        trace!(evicted, "swept expired snapshots");
                    }
                }
            }
        }
        debug!("event publisher loop exited");
    }

    /// Apply one commit: ACL changes first, then data events.
    fn publish_batch(&self, view: &ReadTxn, commit: Option<u64>, events: Vec<Event>) {
        let (acl, data): (Vec<Event>, Vec<Event>) = events
            .into_iter()
            .partition(|e| matches!(e.payload, Payload::Acl(_)));

        for event in &acl {
            self.handle_acl(view, event);
        }
        if !data.is_empty() {
            self.append(data, commit);
        }
    }

    fn handle_acl(&self, view: &ReadTxn, event: &Event) {
        let Payload::Acl(change) = &event.payload else {
            return;
        };
        match affected_tokens(self.registry.resolver(), view, change) {
            Ok(tokens) => {
                let closed = self.subscriptions.close_for_tokens(&tokens);
                if closed > 0 {
                    info!(
                        topic = %event.topic,
                        index = %event.index,
                        credentials = tokens.len(),
                        closed,
                        "reset subscriptions after ACL change"
                    );
                }
            }
            Err(err) => {
                // Unknown reach of the change: reset everyone rather than
                // risk serving a revoked credential.
                let closed = self.subscriptions.close_all(StoreError::ForcedReset);
                error!(
                    topic = %event.topic,
                    index = %event.index,
                    %err,
                    closed,
                    "ACL change could not be resolved, reset all subscriptions"
                );
            }
        }
    }

    /// Append data events, one batch per (topic, subject) buffer, plus one
    /// per topic for wildcard subscribers.
    fn append(&self, events: Vec<Event>, commit: Option<u64>) {
        let mut keyed: Vec<(TopicKey, Vec<Event>)> = Vec::new();
        let mut wildcard: Vec<(TopicKey, Vec<Event>)> = Vec::new();
        for event in events {
            let key = (event.topic.clone(), event.subject());
            push_grouped(&mut wildcard, (event.topic.clone(), Subject::Wildcard), event.clone());
            push_grouped(&mut keyed, key, event);
        }

        let topics = self.topics.read();
        for (key, batch) in keyed.into_iter().chain(wildcard) {
            let Some(entry) = topics.get(&key) else {
                continue;
            };
            let count = batch.len();
            match entry.buffer.append(batch, commit) {
                Ok(()) => trace!(topic = %key.0, subject = %key.1, events = count, "appended"),
                Err(err) => warn!(topic = %key.0, subject = %key.1, %err, "append failed"),
            }
        }
    }

    fn subscribe(self: &Arc<Self>, req: SubscribeRequest, ctx: &Context) -> Result<Subscription> {
        if self.is_shutting_down() {
            return Err(StoreError::ShuttingDown);
        }
        let snapshot_fn = self.registry.snapshot_fn(&req.topic, &req.subject)?;
        let key: TopicKey = (req.topic.clone(), req.subject.clone());
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let state = Arc::new(SubscriptionState::new(id, TokenHash::of(&req.token)));

        // Buffer head, snapshot splice and the view a new snapshot reads are
        // captured together under the bus lock.
        let (buffer, head, snapshot) = {
            let mut topics = self.topics.write();
            let entry = topics.entry(key.clone()).or_insert_with(|| TopicEntry {
                buffer: Arc::new(TopicBuffer::new(self.config.buffer_retention)),
                subscribers: 0,
            });
            entry.subscribers += 1;
            let buffer = Arc::clone(&entry.buffer);
            let head = buffer.head();

            let resume = !req.index.is_zero() && head.has_event_index(req.index);
            let snapshot = if resume {
                None
            } else {
                let (snapshot, fresh) =
                    self.snapshots.get_or_insert(&key, &buffer, Arc::clone(&head));
                Some((snapshot, fresh.then(|| self.committed.view())))
            };
            self.subscriptions.add(Arc::clone(&state));
            (buffer, head, snapshot)
        };

        if self.is_shutting_down() {
            self.release(&key, &state);
            return Err(StoreError::ShuttingDown);
        }

        let start = match snapshot {
            None => {
                debug!(topic = %key.0, subject = %key.1, index = %req.index, "resuming stream");
                Start {
                    framing: vec![Event::framing(
                        key.0.clone(),
                        req.index,
                        Payload::ResumeStream,
                    )],
                    replay: Arc::new([]),
                    cursor: BufferCursor::follow_after(buffer, head),
                }
            }
            Some((snapshot, view)) => {
                if let Some(view) = view {
                    debug!(topic = %key.0, subject = %key.1, index = %view.index(), "building snapshot");
                    snapshot.build(&key.0, view.commit(), |appender| {
                        snapshot_fn(&view, &key.1, appender)
                    });
                } else {
                    debug!(topic = %key.0, subject = %key.1, "joining cached snapshot");
                }

                let data = match snapshot.wait(ctx) {
                    Ok(data) => data,
                    Err(err) => {
                        warn!(topic = %key.0, subject = %key.1, %err, "subscribe failed");
                        self.release(&key, &state);
                        return Err(err);
                    }
                };

                trace!(
                    topic = %key.0,
                    subject = %key.1,
                    index = %data.index,
                    events = data.events.len(),
                    "snapshot ready"
                );

                let mut framing = Vec::new();
                if !req.index.is_zero() {
                    framing.push(Event::framing(
                        key.0.clone(),
                        req.index,
                        Payload::NewSnapshotToFollow,
                    ));
                }
                Start {
                    framing,
                    replay: data.events,
                    cursor: BufferCursor::follow_after(buffer, Arc::clone(snapshot.splice()))
                        .skipping_through(data.commit),
                }
            }
        };

        if ctx.can_end() {
            let watched = Watched {
                key: key.clone(),
                state: Arc::clone(&state),
                ctx: ctx.clone(),
            };
            // Only fails once the reaper has stopped at shutdown.
            let _ = self.watch_tx.send(watched);
        }

        debug!(subscription = ?id, topic = %key.0, subject = %key.1, "subscribed");
        Ok(Subscription::new(
            Arc::clone(self),
            state,
            key,
            ctx.clone(),
            req.authorizer,
            start,
        ))
    }

    /// Drop a subscription's registrations; frees the topic buffer and its
    /// snapshot once nobody subscribes to them. Idempotent.
    pub(crate) fn release(&self, key: &TopicKey, state: &SubscriptionState) {
        if !state.mark_released() {
            return;
        }
        let mut topics = self.topics.write();
        if let Some(entry) = topics.get_mut(key) {
            entry.subscribers = entry.subscribers.saturating_sub(1);
            if entry.subscribers == 0 {
                topics.remove(key);
                self.snapshots.remove(key);
                debug!(topic = %key.0, subject = %key.1, "freed topic buffer");
            }
        }
        self.subscriptions.remove(state.token(), state.id());
    }
}

impl BusInner {
    /// Close and release watched subscriptions as their subscribe contexts
    /// end. Runs until shutdown.
    fn reap(&self, watch: Receiver<Watched>, shutdown: Receiver<()>) {
        let mut watched: Vec<Watched> = Vec::new();
        loop {
            {
                let timers: Vec<Receiver<Instant>> =
                    watched.iter().map(|w| w.ctx.deadline_timer()).collect();
                let mut sel = Select::new();
                sel.recv(&watch);
                sel.recv(&shutdown);
                for w in &watched {
                    sel.recv(w.ctx.done());
                    sel.recv(w.state.closed_signal());
                }
                for timer in &timers {
                    sel.recv(timer);
                }
                sel.ready();
            }

            if let Err(TryRecvError::Disconnected) = shutdown.try_recv() {
                break;
            }
            watched.extend(watch.try_iter());
            watched.retain(|w| self.reap_one(w));
        }
        debug!(watched = watched.len(), "subscription reaper exited");
    }

    /// Returns whether `w` still needs watching.
    fn reap_one(&self, w: &Watched) -> bool {
        if w.state.is_released() {
            return false;
        }
        if let Some(err) = w.ctx.err() {
            if w.state.close(err.clone()) {
                debug!(subscription = ?w.state.id(), topic = %w.key.0, %err, "subscribe context ended");
            }
        }
        if w.state.closed_reason().is_some() {
            self.release(&w.key, &w.state);
            return false;
        }
        true
    }
}

fn push_grouped(groups: &mut Vec<(TopicKey, Vec<Event>)>, key: TopicKey, event: Event) {
    match groups.iter_mut().find(|(k, _)| *k == key) {
        Some((_, batch)) => batch.push(event),
        None => groups.push((key, vec![event])),
    }
}
