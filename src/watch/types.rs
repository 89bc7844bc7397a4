//! Handle and configuration types for watchers.

use crate::error::{Result, WatchError};
use crate::types::WatchId;
use crossbeam_channel::Receiver;
use std::fmt;
use std::sync::Weak;
use std::time::Duration;

/// Configuration for a registry.
#[derive(Clone, Debug)]
pub struct WatchConfig {
    /// Number of independently locked shards keys are hashed across.
    /// Default: 1 (a single lock covers every key)
    pub shards: usize,

    /// Key capacity to reserve up front, split across shards.
    /// Default: 0
    pub initial_key_capacity: usize,

    /// Buffer size used by `watch_channel_default`.
    /// Default: 1000
    pub default_channel_buffer: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            shards: 1,
            initial_key_capacity: 0,
            default_channel_buffer: 1000,
        }
    }
}

impl WatchConfig {
    /// Config with `shards` lock shards and defaults elsewhere.
    pub fn sharded(shards: usize) -> Self {
        Self {
            shards,
            ..Default::default()
        }
    }

    /// Check the config can back a registry.
    pub fn validate(&self) -> Result<()> {
        if self.shards == 0 {
            return Err(WatchError::InvalidConfig(
                "shards must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Removal side of the registry, as seen by an `Unwatch` handle.
pub(crate) trait Detach<K>: Send + Sync {
    /// Remove watcher `id` from `key`. Returns true if it was present.
    fn detach(&self, key: &K, id: WatchId) -> bool;
}

/// Handle that removes one watcher from its registry.
///
/// Dropping the handle does not unwatch. Calling `unwatch` more than once, or
/// after the registry is gone, is a no-op.
#[must_use = "dropping an Unwatch leaves the watcher registered"]
pub struct Unwatch<K> {
    key: K,
    id: WatchId,
    registry: Weak<dyn Detach<K>>,
}

impl<K> Unwatch<K> {
    pub(crate) fn new(key: K, id: WatchId, registry: Weak<dyn Detach<K>>) -> Self {
        Self { key, id, registry }
    }

    /// Id of the watcher this handle removes.
    pub fn id(&self) -> WatchId {
        self.id
    }

    /// Key the watcher is registered under.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Remove the watcher.
    ///
    /// Returns true only for the call that actually removed it.
    pub fn unwatch(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let removed = registry.detach(&self.key, self.id);
        tracing::trace!(id = %self.id, removed, "unwatch");
        removed
    }
}

impl<K: Clone> Clone for Unwatch<K> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            id: self.id,
            registry: Weak::clone(&self.registry),
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for Unwatch<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unwatch")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

/// Watcher that forwards changes into a bounded channel.
pub struct ChannelWatch<K, C> {
    /// Handle removing the forwarding watcher.
    pub unwatch: Unwatch<K>,
    /// Channel to receive changes.
    pub receiver: Receiver<C>,
}

impl<K, C> ChannelWatch<K, C> {
    /// Id of the forwarding watcher.
    pub fn id(&self) -> WatchId {
        self.unwatch.id()
    }

    /// Stop forwarding. Changes already buffered stay receivable.
    pub fn unwatch(&self) -> bool {
        self.unwatch.unwatch()
    }

    /// Receive the next change (blocking).
    pub fn recv(&self) -> std::result::Result<C, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a change (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<C, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<C, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
