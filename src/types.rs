//! Core types shared by the store and the event stream.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::fmt;

/// External sequence number assigned to a committed write.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Index(pub u64);

impl Index {
    pub const ZERO: Index = Index(0);

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// The following index, saturating at `u64::MAX`.
    pub fn next(self) -> Self {
        Index(self.0.saturating_add(1))
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Index({})", self.0)
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Index {
    fn from(value: u64) -> Self {
        Index(value)
    }
}

/// A named category of events (e.g. "service-health").
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Topic(Cow<'static, str>);

impl Topic {
    /// Topic from a static name, usable in `const` items.
    pub const fn from_static(name: &'static str) -> Self {
        Topic(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Topic(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.0)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Routing key within a topic.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Subject {
    /// The topic has no per-key routing.
    None,
    /// Every subject of the topic. Only valid in subscribe requests.
    Wildcard,
    /// A single routing key.
    Key(String),
}

impl Subject {
    pub fn key(key: impl Into<String>) -> Self {
        Subject::Key(key.into())
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Subject::Wildcard)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::None => Ok(()),
            Subject::Wildcard => f.write_str("*"),
            Subject::Key(key) => f.write_str(key),
        }
    }
}

/// What happened to the entity an event describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Upsert,
    Delete,
}

/// SHA-256 hex digest of a credential secret.
///
/// Subscriptions are indexed by this value so that raw secrets are never
/// kept in the subscription registry.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenHash(String);

impl TokenHash {
    pub fn of(secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        TokenHash(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TokenHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenHash({}...)", self.0.get(..8).unwrap_or(&self.0))
    }
}

impl fmt::Display for TokenHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_hash_is_stable_hex() {
        let a = TokenHash::of("secret-1");
        let b = TokenHash::of("secret-1");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_ne!(a, TokenHash::of("secret-2"));
    }

    #[test]
    fn test_topic_static_and_owned_compare_equal() {
        const HEALTH: Topic = Topic::from_static("service-health");
        assert_eq!(HEALTH, Topic::new("service-health"));
        assert_eq!(HEALTH.to_string(), "service-health");
    }

    #[test]
    fn test_subject_display() {
        assert_eq!(Subject::key("web").to_string(), "web");
        assert_eq!(Subject::Wildcard.to_string(), "*");
        assert_eq!(Subject::None.to_string(), "");
    }

    #[test]
    fn test_index_navigation() {
        assert!(Index::ZERO.is_zero());
        assert_eq!(Index(5).next(), Index(6));
        assert_eq!(Index(u64::MAX).next(), Index(u64::MAX));
        assert!(Index(3) < Index(4));
    }
}
