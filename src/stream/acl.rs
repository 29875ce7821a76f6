//! Subscriptions indexed by credential, and the invalidation that follows
//! identity and permission changes.

use super::event::AclChange;
use crate::error::{Result, StoreError};
use crate::store::ReadTxn;
use crate::types::{SubscriptionId, TokenHash};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Finds the credentials that depend on a policy or role.
///
/// Implemented by the collaborator that owns the identity tables. Every
/// method sees the store as of the commit being processed and returns
/// credential secrets.
pub trait AclResolver: Send + Sync {
    /// Credentials that reference `policy_id` directly.
    fn tokens_with_policy(&self, tx: &ReadTxn, policy_id: &str) -> Result<Vec<String>>;

    /// Roles that reference `policy_id`.
    fn roles_with_policy(&self, tx: &ReadTxn, policy_id: &str) -> Result<Vec<String>>;

    /// Credentials that reference `role_id`.
    fn tokens_with_role(&self, tx: &ReadTxn, role_id: &str) -> Result<Vec<String>>;
}

/// Every credential whose subscriptions must be reset because of `change`.
pub(crate) fn affected_tokens(
    resolver: Option<&dyn AclResolver>,
    tx: &ReadTxn,
    change: &AclChange,
) -> Result<HashSet<TokenHash>> {
    let secrets = match change {
        AclChange::Token { secret } => vec![secret.clone()],
        AclChange::Policy { id } => {
            let resolver = require(resolver)?;
            let mut secrets = resolver.tokens_with_policy(tx, id)?;
            for role in resolver.roles_with_policy(tx, id)? {
                secrets.extend(resolver.tokens_with_role(tx, &role)?);
            }
            secrets
        }
        AclChange::Role { id } => require(resolver)?.tokens_with_role(tx, id)?,
    };
    Ok(secrets.iter().map(|s| TokenHash::of(s)).collect())
}

fn require(resolver: Option<&dyn AclResolver>) -> Result<&dyn AclResolver> {
    resolver.ok_or_else(|| StoreError::AclResolution("no ACL resolver registered".into()))
}

struct CloseState {
    notify: Option<Sender<()>>,
    reason: Option<StoreError>,
}

/// Shared between a [`Subscription`](super::Subscription) and the registry.
pub(crate) struct SubscriptionState {
    id: SubscriptionId,
    token: TokenHash,
    close: Mutex<CloseState>,
    closed_rx: Receiver<()>,
    released: AtomicBool,
}

impl SubscriptionState {
    pub(crate) fn new(id: SubscriptionId, token: TokenHash) -> Self {
        let (tx, rx) = bounded(0);
        Self {
            id,
            token,
            close: Mutex::new(CloseState {
                notify: Some(tx),
                reason: None,
            }),
            closed_rx: rx,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn token(&self) -> &TokenHash {
        &self.token
    }

    /// Close with `reason`. Only the first close is recorded; returns whether
    /// this call closed it.
    pub(crate) fn close(&self, reason: StoreError) -> bool {
        let mut state = self.close.lock();
        if state.reason.is_some() {
            return false;
        }
        state.reason = Some(reason);
        state.notify.take();
        true
    }

    pub(crate) fn closed_reason(&self) -> Option<StoreError> {
        self.close.lock().reason.clone()
    }

    /// Disconnected once closed. Meant for `select!`.
    pub(crate) fn closed_signal(&self) -> &Receiver<()> {
        &self.closed_rx
    }

    /// Mark the bus registrations as dropped. True only for the first call.
    pub(crate) fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

type ByToken = HashMap<TokenHash, HashMap<SubscriptionId, Arc<SubscriptionState>>>;

/// Live subscriptions by credential hash.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    by_token: RwLock<ByToken>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, state: Arc<SubscriptionState>) {
        self.by_token
            .write()
            .entry(state.token().clone())
            .or_default()
            .insert(state.id(), state);
    }

    /// Remove one subscription, pruning the credential once it has none.
    pub(crate) fn remove(&self, token: &TokenHash, id: SubscriptionId) -> bool {
        let mut by_token = self.by_token.write();
        let Some(subs) = by_token.get_mut(token) else {
            return false;
        };
        let removed = subs.remove(&id).is_some();
        if subs.is_empty() {
            by_token.remove(token);
        }
        removed
    }

    /// Reset every subscription created with one of `tokens`. Returns how
    /// many were closed.
    pub(crate) fn close_for_tokens(&self, tokens: &HashSet<TokenHash>) -> usize {
        let mut by_token = self.by_token.write();
        let mut closed = 0;
        for token in tokens {
            if let Some(subs) = by_token.remove(token) {
                for state in subs.values() {
                    if state.close(StoreError::ForcedReset) {
                        closed += 1;
                    }
                }
                debug!(token_hash = ?token, subscriptions = subs.len(), "reset subscriptions for credential");
            }
        }
        closed
    }

    /// Close every subscription with `reason` and empty the registry.
    pub(crate) fn close_all(&self, reason: StoreError) -> usize {
        let drained = std::mem::take(&mut *self.by_token.write());
        drained
            .values()
            .flat_map(HashMap::values)
            .filter(|state| state.close(reason.clone()))
            .count()
    }

    pub(crate) fn count(&self) -> usize {
        self.by_token.read().values().map(HashMap::len).sum()
    }

    pub(crate) fn count_for(&self, token: &TokenHash) -> usize {
        self.by_token.read().get(token).map_or(0, HashMap::len)
    }
}
