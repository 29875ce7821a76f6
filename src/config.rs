//! Event bus configuration.

use serde::Deserialize;
use std::time::Duration;

/// Tuning knobs for the event bus.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// How long a materialized snapshot is reused by new subscribers.
    /// Zero disables caching: every subscriber builds its own snapshot,
    /// except that concurrent builds for one (topic, subject) are still shared.
    /// Default: 10s
    pub snapshot_cache_ttl: Duration,

    /// Max cached snapshots before the least recently used one is dropped.
    /// Default: 1024
    pub snapshot_cache_capacity: usize,

    /// Max batches a reader may fall behind a topic buffer's tail before it
    /// is force-reset.
    /// Default: 4096
    pub buffer_retention: usize,

    /// Max commits staged for the background publisher. A full queue makes
    /// writers wait.
    /// Default: 1024
    pub publish_queue_depth: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            snapshot_cache_ttl: Duration::from_secs(10),
            snapshot_cache_capacity: 1024,
            buffer_retention: 4096,
            publish_queue_depth: 1024,
        }
    }
}
