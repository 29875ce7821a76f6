//! Shared fixture: a small service catalog and identity tables wired to the
//! event bus the way a domain collaborator would.

#![allow(dead_code)]

use serde_json::json;
use statestream::{
    AclChange, AclResolver, Authorizer, ChangeSet, Context, Event, EventBusConfig, EventPayload,
    HandlerRegistry, Index, Operation, ReadTxn, Result, Schema, SnapshotAppender, Store,
    StoreError, SubscribeRequest, Subject, Subscription, Topic, TopicHandler,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const SERVICES: Topic = Topic::from_static("service-health");
pub const NODES: Topic = Topic::from_static("nodes");
pub const TOKENS: Topic = Topic::from_static("acl-token");
pub const POLICIES: Topic = Topic::from_static("acl-policy");
pub const ROLES: Topic = Topic::from_static("acl-role");

pub const SERVICES_TABLE: &str = "services";
pub const NODES_TABLE: &str = "nodes";
pub const TOKENS_TABLE: &str = "acl-tokens";
pub const POLICIES_TABLE: &str = "acl-policies";
pub const ROLES_TABLE: &str = "acl-roles";

const NEXT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceHealth {
    pub name: String,
    pub port: Option<u64>,
}

impl EventPayload for ServiceHealth {
    fn subject(&self) -> Subject {
        Subject::key(self.name.clone())
    }

    fn has_read_permission(&self, authz: &dyn Authorizer) -> bool {
        authz.can_read(&SERVICES, &self.subject())
    }
}

#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node: String,
}

impl EventPayload for NodeStatus {
    fn subject(&self) -> Subject {
        Subject::key(self.node.clone())
    }

    fn has_read_permission(&self, authz: &dyn Authorizer) -> bool {
        authz.can_read(&NODES, &self.subject())
    }
}

/// Allows a fixed set of service names.
pub struct ServiceNames(pub Vec<String>);

impl Authorizer for ServiceNames {
    fn can_read(&self, _topic: &Topic, subject: &Subject) -> bool {
        matches!(subject, Subject::Key(name) if self.0.contains(name))
    }
}

fn service_event(tx: &ReadTxn, op: Operation, name: &str) -> Result<Event> {
    let port = match op {
        Operation::Upsert => tx
            .get(SERVICES_TABLE, name)?
            .and_then(|row| row["port"].as_u64()),
        Operation::Delete => None,
    };
    Ok(Event::new(
        SERVICES,
        op,
        ServiceHealth {
            name: name.to_string(),
            port,
        },
    ))
}

fn derive_services(tx: &ReadTxn, changes: &ChangeSet) -> Result<Vec<Event>> {
    changes
        .for_table(SERVICES_TABLE)
        .map(|m| {
            if m.row().map_or(false, |row| row["poison"] == json!(true)) {
                return Err(StoreError::InvalidEvent(format!("poisoned row {}", m.key)));
            }
            let op = if m.deleted() {
                Operation::Delete
            } else {
                Operation::Upsert
            };
            service_event(tx, op, &m.key)
        })
        .collect()
}

fn snapshot_services(
    tx: &ReadTxn,
    subject: &Subject,
    appender: &mut SnapshotAppender,
) -> Result<Index> {
    let index = tx.table_index(SERVICES_TABLE)?;
    let names: Vec<String> = match subject {
        Subject::Key(name) => tx
            .get(SERVICES_TABLE, name)?
            .map(|_| vec![name.clone()])
            .unwrap_or_default(),
        _ => tx.iter(SERVICES_TABLE)?.map(|(k, _)| k.to_string()).collect(),
    };
    for name in names {
        appender.append([service_event(tx, Operation::Upsert, &name)?.with_index(index)]);
    }
    Ok(index)
}

fn derive_nodes(_tx: &ReadTxn, changes: &ChangeSet) -> Result<Vec<Event>> {
    Ok(changes
        .for_table(NODES_TABLE)
        .map(|m| {
            let op = if m.deleted() {
                Operation::Delete
            } else {
                Operation::Upsert
            };
            Event::new(NODES, op, NodeStatus { node: m.key.clone() })
        })
        .collect())
}

fn acl_events(
    topic: Topic,
    table: &'static str,
    change: fn(String) -> AclChange,
) -> impl Fn(&ReadTxn, &ChangeSet) -> Result<Vec<Event>> + Send + Sync + 'static {
    move |_tx: &ReadTxn, changes: &ChangeSet| {
        Ok(changes
            .for_table(table)
            .map(|m| {
                let op = if m.deleted() {
                    Operation::Delete
                } else {
                    Operation::Upsert
                };
                Event::acl(topic.clone(), op, change(m.key.clone()))
            })
            .collect())
    }
}

fn list(row: &serde_json::Value, field: &str) -> Vec<String> {
    row[field]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Resolves links from the identity tables.
pub struct TableResolver;

impl TableResolver {
    fn keys_linking(tx: &ReadTxn, table: &str, field: &str, id: &str) -> Result<Vec<String>> {
        Ok(tx
            .iter(table)?
            .filter(|(_, row)| list(row, field).iter().any(|p| p == id))
            .map(|(k, _)| k.to_string())
            .collect())
    }
}

impl AclResolver for TableResolver {
    fn tokens_with_policy(&self, tx: &ReadTxn, policy_id: &str) -> Result<Vec<String>> {
        Self::keys_linking(tx, TOKENS_TABLE, "policies", policy_id)
    }

    fn roles_with_policy(&self, tx: &ReadTxn, policy_id: &str) -> Result<Vec<String>> {
        Self::keys_linking(tx, ROLES_TABLE, "policies", policy_id)
    }

    fn tokens_with_role(&self, tx: &ReadTxn, role_id: &str) -> Result<Vec<String>> {
        Self::keys_linking(tx, TOKENS_TABLE, "roles", role_id)
    }
}

/// A resolver whose lookups always fail.
pub struct BrokenResolver;

impl AclResolver for BrokenResolver {
    fn tokens_with_policy(&self, _tx: &ReadTxn, _policy_id: &str) -> Result<Vec<String>> {
        Err(StoreError::AclResolution("policy index unavailable".into()))
    }

    fn roles_with_policy(&self, _tx: &ReadTxn, _policy_id: &str) -> Result<Vec<String>> {
        Err(StoreError::AclResolution("policy index unavailable".into()))
    }

    fn tokens_with_role(&self, _tx: &ReadTxn, _role_id: &str) -> Result<Vec<String>> {
        Err(StoreError::AclResolution("role index unavailable".into()))
    }
}

pub struct Fixture {
    pub store: Store,
    pub snapshot_calls: Arc<AtomicUsize>,
}

pub struct FixtureOptions {
    pub config: EventBusConfig,
    pub resolver: Arc<dyn AclResolver>,
    pub snapshot_delay: Duration,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            config: EventBusConfig::default(),
            resolver: Arc::new(TableResolver),
            snapshot_delay: Duration::ZERO,
        }
    }
}

pub fn fixture() -> Fixture {
    fixture_with(FixtureOptions::default())
}

pub fn fixture_with(options: FixtureOptions) -> Fixture {
    init_tracing();

    let snapshot_calls = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&snapshot_calls);
    let delay = options.snapshot_delay;

    let services = TopicHandler::new(derive_services, move |tx, subject, appender| {
        calls.fetch_add(1, Ordering::SeqCst);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        snapshot_services(tx, subject, appender)
    })
    .with_wildcard();
    let nodes = TopicHandler::new(derive_nodes, |_, _, _| Ok(Index::ZERO));

    let mut builder = HandlerRegistry::builder();
    builder
        .register_handler(SERVICES, services)
        .unwrap()
        .register_handler(NODES, nodes)
        .unwrap()
        .register_acl_topic(TOKENS, acl_events(TOKENS, TOKENS_TABLE, |secret| {
            AclChange::Token { secret }
        }))
        .unwrap()
        .register_acl_topic(POLICIES, acl_events(POLICIES, POLICIES_TABLE, |id| {
            AclChange::Policy { id }
        }))
        .unwrap()
        .register_acl_topic(ROLES, acl_events(ROLES, ROLES_TABLE, |id| AclChange::Role { id }))
        .unwrap()
        .acl_resolver(options.resolver);

    let schema = Schema::new()
        .with_table(SERVICES_TABLE)
        .with_table(NODES_TABLE)
        .with_table(TOKENS_TABLE)
        .with_table(POLICIES_TABLE)
        .with_table(ROLES_TABLE);

    Fixture {
        store: Store::new(schema, builder.build(), options.config).unwrap(),
        snapshot_calls,
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn upsert(store: &Store, index: u64, name: &str, port: u64) {
    let mut tx = store.write(Index(index)).unwrap();
    tx.insert(SERVICES_TABLE, name, json!({ "port": port })).unwrap();
    tx.commit().unwrap();
}

pub fn delete(store: &Store, index: u64, name: &str) {
    let mut tx = store.write(Index(index)).unwrap();
    assert!(tx.delete(SERVICES_TABLE, name).unwrap());
    tx.commit().unwrap();
}

pub fn put_row(store: &Store, index: u64, table: &str, key: &str, row: serde_json::Value) {
    let mut tx = store.write(Index(index)).unwrap();
    tx.insert(table, key, row).unwrap();
    tx.commit().unwrap();
}

pub fn subscribe(store: &Store, subject: Subject, token: &str) -> Subscription {
    store
        .subscribe(
            SubscribeRequest::new(SERVICES, subject).with_token(token),
            &Context::background(),
        )
        .unwrap()
}

pub fn next(sub: &mut Subscription) -> Event {
    sub.next(&Context::with_timeout(NEXT_TIMEOUT)).unwrap()
}

pub fn next_err(sub: &mut Subscription) -> StoreError {
    sub.next(&Context::with_timeout(NEXT_TIMEOUT)).unwrap_err()
}

/// Drain the snapshot, returning its data events.
pub fn drain_snapshot(sub: &mut Subscription) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let event = next(sub);
        if event.is_end_of_snapshot() {
            return events;
        }
        events.push(event);
    }
}

pub fn assert_quiet(sub: &mut Subscription) {
    let err = sub
        .next(&Context::with_timeout(Duration::from_millis(50)))
        .unwrap_err();
    assert_eq!(err, StoreError::DeadlineExceeded);
}

/// Poll `cond` until it holds, failing after `NEXT_TIMEOUT`.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + NEXT_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn service(event: &Event) -> &ServiceHealth {
    event.payload_as::<ServiceHealth>().unwrap()
}
