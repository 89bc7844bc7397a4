//! Keyed watcher registry with snapshot dispatch.

use crate::error::{Result, WatchError};
use crate::types::{FileChangeType, WatchId};
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::any::Any;
use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use super::types::{ChannelWatch, Detach, Unwatch, WatchConfig};

/// Callback invoked with each change to a watched key.
///
/// Returns true if the change was relevant to the watcher.
pub type WatchCallback<C> = Arc<dyn Fn(&C) -> bool + Send + Sync>;

/// One registered callback.
struct Watcher<C> {
    id: WatchId,
    callback: WatchCallback<C>,
}

impl<C> Clone for Watcher<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: Arc::clone(&self.callback),
        }
    }
}

/// Keys hashed to one lock.
struct Shard<K, C> {
    watchers: HashMap<K, Vec<Watcher<C>>>,
}

/// State shared by the registry and its `Unwatch` handles.
struct Shared<K, C> {
    shards: Box<[Mutex<Shard<K, C>>]>,
    /// Counter for generating watcher IDs.
    next_id: AtomicU64,
    hasher: RandomState,
}

impl<K: Eq + Hash, C> Shared<K, C> {
    fn shard<Q>(&self, key: &Q) -> &Mutex<Shard<K, C>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if self.shards.len() == 1 {
            return &self.shards[0];
        }
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Copy the watchers of `key` so callbacks can run unlocked.
    fn snapshot<Q>(&self, key: &Q) -> Vec<Watcher<C>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let shard = self.shard(key).lock();
        shard.watchers.get(key).cloned().unwrap_or_default()
    }
}

impl<K, C> Detach<K> for Shared<K, C>
where
    K: Eq + Hash + Send + Sync,
{
    fn detach(&self, key: &K, id: WatchId) -> bool {
        let mut shard = self.shard(key).lock();
        let Some(watchers) = shard.watchers.get_mut(key) else {
            return false;
        };
        match watchers.iter().position(|w| w.id == id) {
            Some(index) => {
                // Survivor order is not preserved.
                watchers.swap_remove(index);
                true
            }
            None => false,
        }
    }
}

/// Thread-safe registry of change callbacks grouped by key.
///
/// Callbacks never run while a registry lock is held: `notify` copies the
/// key's watcher list, releases the lock and only then invokes them. A
/// callback may therefore watch, unwatch (itself included) or notify on the
/// same registry.
///
/// Cloning the registry yields another handle to the same watchers. A
/// callback that captures a clone keeps the registry alive until it is
/// unwatched.
pub struct WatchRegistry<K, C = FileChangeType> {
    shared: Arc<Shared<K, C>>,
    config: WatchConfig,
}

impl<K, C> WatchRegistry<K, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    C: 'static,
{
    /// Create a registry guarded by a single lock.
    pub fn new() -> Self {
        Self::build(WatchConfig::default())
    }

    /// Create a registry from a config.
    pub fn with_config(config: WatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: WatchConfig) -> Self {
        let per_shard = config.initial_key_capacity / config.shards;
        let shards = (0..config.shards)
            .map(|_| {
                Mutex::new(Shard {
                    watchers: HashMap::with_capacity(per_shard),
                })
            })
            .collect();

        Self {
            shared: Arc::new(Shared {
                shards,
                next_id: AtomicU64::new(0),
                hasher: RandomState::new(),
            }),
            config,
        }
    }

    /// Configuration this registry was built with.
    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Register `callback` for changes to `key`.
    ///
    /// The returned handle removes exactly this watcher.
    pub fn watch<F>(&self, key: K, callback: F) -> Unwatch<K>
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        let id = {
            let mut shard = self.shared.shard(&key).lock();
            // Allocated under the shard lock so each key's list stays in id order.
            let id = WatchId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
            shard.watchers.entry(key.clone()).or_default().push(Watcher {
                id,
                callback: Arc::new(callback),
            });
            id
        };
        trace!(%id, "watch");

        let registry = Arc::downgrade(&self.shared) as Weak<dyn Detach<K>>;
        Unwatch::new(key, id, registry)
    }

    /// Register a watcher that forwards every change into a bounded channel.
    ///
    /// The forwarding callback reports a match when the change was queued and
    /// no match when the buffer is full or the receiver was dropped.
    pub fn watch_channel(&self, key: K, buffer_size: usize) -> ChannelWatch<K, C>
    where
        C: Clone + Send,
    {
        let (sender, receiver) = bounded(buffer_size);
        let unwatch = self.watch(key, move |change: &C| {
            sender.try_send(change.clone()).is_ok()
        });
        ChannelWatch { unwatch, receiver }
    }

    /// `watch_channel` with the configured default buffer size.
    pub fn watch_channel_default(&self, key: K) -> ChannelWatch<K, C>
    where
        C: Clone + Send,
    {
        self.watch_channel(key, self.config.default_channel_buffer)
    }

    /// Invoke every watcher of `key` with `change`.
    ///
    /// Returns the OR of all callback results, false if nobody watches `key`.
    /// All callbacks run even after one returns true. A panicking callback
    /// unwinds out of this call and the remaining callbacks are skipped; use
    /// `try_notify` to keep going.
    pub fn notify<Q>(&self, key: &Q, change: &C) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let watchers = self.shared.snapshot(key);

        let mut matched = false;
        for watcher in &watchers {
            matched = (watcher.callback)(change) || matched;
        }

        debug!(watchers = watchers.len(), matched, "notify");
        matched
    }

    /// Like `notify`, but a panicking callback does not stop the dispatch.
    ///
    /// Panics are caught per callback and the rest of the snapshot still
    /// runs. If any callback panicked the result is
    /// `WatchError::CallbackPanicked`, which still carries the OR of the
    /// callbacks that returned.
    pub fn try_notify<Q>(&self, key: &Q, change: &C) -> Result<bool>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + fmt::Debug + ?Sized,
    {
        let watchers = self.shared.snapshot(key);

        let mut matched = false;
        let mut failed = 0;
        let mut messages = Vec::new();
        for watcher in &watchers {
            match panic::catch_unwind(AssertUnwindSafe(|| (watcher.callback)(change))) {
                Ok(hit) => matched = hit || matched,
                Err(payload) => {
                    failed += 1;
                    let message = panic_message(payload.as_ref());
                    warn!(
                        id = %watcher.id,
                        panic = message.as_deref().unwrap_or("<non-string payload>"),
                        "watcher callback panicked"
                    );
                    messages.extend(message);
                }
            }
        }

        debug!(watchers = watchers.len(), matched, failed, "try_notify");
        if failed > 0 {
            return Err(WatchError::CallbackPanicked {
                key: format!("{:?}", key),
                failed,
                matched,
                messages,
            });
        }
        Ok(matched)
    }

    /// Number of watchers currently registered for `key`.
    pub fn watcher_count<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared
            .shard(key)
            .lock()
            .watchers
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Whether at least one watcher is registered for `key`.
    pub fn is_watched<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.watcher_count(key) > 0
    }

    /// Number of watchers across all keys.
    pub fn total_watchers(&self) -> usize {
        self.shared
            .shards
            .iter()
            .map(|shard| shard.lock().watchers.values().map(Vec::len).sum::<usize>())
            .sum()
    }

    /// Number of keys with a watcher list, including lists left empty by
    /// unwatching.
    pub fn key_count(&self) -> usize {
        self.shared
            .shards
            .iter()
            .map(|shard| shard.lock().watchers.len())
            .sum()
    }

    /// Drop keys whose watcher list is empty. Returns how many were dropped.
    ///
    /// Never runs implicitly.
    pub fn prune_empty(&self) -> usize {
        let mut pruned = 0;
        for shard in self.shared.shards.iter() {
            let mut shard = shard.lock();
            let before = shard.watchers.len();
            shard.watchers.retain(|_, watchers| !watchers.is_empty());
            pruned += before - shard.watchers.len();
        }
        debug!(pruned, "prune_empty");
        pruned
    }
}

impl<K, C> Default for WatchRegistry<K, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    C: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, C> Clone for WatchRegistry<K, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            config: self.config.clone(),
        }
    }
}

impl<K, C> fmt::Debug for WatchRegistry<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchRegistry")
            .field("config", &self.config)
            .field("next_id", &self.shared.next_id.load(Ordering::SeqCst))
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> Option<String> {
    if let Some(s) = payload.downcast_ref::<&str>() {
        Some((*s).to_string())
    } else {
        payload.downcast_ref::<String>().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicUsize;

    fn registry() -> WatchRegistry<String> {
        WatchRegistry::new()
    }

    fn recorder(
        log: &Arc<PlMutex<Vec<&'static str>>>,
        name: &'static str,
        hit: bool,
    ) -> impl Fn(&FileChangeType) -> bool + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |_: &FileChangeType| {
            log.lock().push(name);
            hit
        }
    }

    #[test]
    fn test_ids_start_at_zero_and_increase() {
        let registry = registry();

        let a = registry.watch("a".to_string(), |_| true);
        let b = registry.watch("b".to_string(), |_| true);
        let c = registry.watch("a".to_string(), |_| true);

        assert_eq!(a.id(), WatchId(0));
        assert_eq!(b.id(), WatchId(1));
        assert_eq!(c.id(), WatchId(2));
    }

    #[test]
    fn test_ids_not_reused_after_unwatch() {
        let registry = registry();

        let a = registry.watch("a".to_string(), |_| true);
        assert!(a.unwatch());
        let b = registry.watch("a".to_string(), |_| true);

        assert_eq!(b.id(), WatchId(1));
    }

    #[test]
    fn test_notify_in_insertion_order() {
        let registry = registry();
        let log = Arc::new(PlMutex::new(Vec::new()));

        let _u1 = registry.watch("f1".to_string(), recorder(&log, "cb1", false));
        let _u2 = registry.watch("f1".to_string(), recorder(&log, "cb2", false));
        let _u3 = registry.watch("f1".to_string(), recorder(&log, "cb3", false));

        assert!(!registry.notify("f1", &FileChangeType::Changed));
        assert_eq!(*log.lock(), vec!["cb1", "cb2", "cb3"]);
    }

    #[test]
    fn test_notify_runs_all_after_match() {
        let registry = registry();
        let log = Arc::new(PlMutex::new(Vec::new()));

        let _u1 = registry.watch("f1".to_string(), recorder(&log, "cb1", true));
        let _u2 = registry.watch("f1".to_string(), recorder(&log, "cb2", false));

        assert!(registry.notify("f1", &FileChangeType::Changed));
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn test_unwatch_swaps_last_into_place() {
        let registry = registry();
        let log = Arc::new(PlMutex::new(Vec::new()));

        let u1 = registry.watch("f1".to_string(), recorder(&log, "cb1", false));
        let _u2 = registry.watch("f1".to_string(), recorder(&log, "cb2", false));
        let _u3 = registry.watch("f1".to_string(), recorder(&log, "cb3", false));

        assert!(u1.unwatch());
        registry.notify("f1", &FileChangeType::Changed);

        assert_eq!(*log.lock(), vec!["cb3", "cb2"]);
    }

    #[test]
    fn test_unwatch_is_idempotent() {
        let registry = registry();

        let u1 = registry.watch("f1".to_string(), |_| true);
        let _u2 = registry.watch("f1".to_string(), |_| true);

        assert!(u1.unwatch());
        assert!(!u1.unwatch());
        assert_eq!(registry.watcher_count("f1"), 1);
    }

    #[test]
    fn test_unknown_key_allocates_nothing() {
        let registry = registry();

        assert!(!registry.notify("missing", &FileChangeType::Created));
        assert_eq!(registry.key_count(), 0);
    }

    #[test]
    fn test_empty_lists_kept_until_pruned() {
        let registry = registry();

        let u = registry.watch("f1".to_string(), |_| true);
        let _keep = registry.watch("f2".to_string(), |_| true);
        u.unwatch();

        assert_eq!(registry.key_count(), 2);
        assert!(!registry.is_watched("f1"));

        assert_eq!(registry.prune_empty(), 1);
        assert_eq!(registry.key_count(), 1);
        assert_eq!(registry.total_watchers(), 1);
    }

    #[test]
    fn test_unwatch_after_registry_dropped() {
        let registry = registry();
        let u = registry.watch("f1".to_string(), |_| true);

        drop(registry);
        assert!(!u.unwatch());
    }

    #[test]
    fn test_clone_shares_watchers() {
        let registry = registry();
        let other = registry.clone();

        let _u = other.watch("f1".to_string(), |_| true);
        assert!(registry.notify("f1", &FileChangeType::Deleted));
    }

    #[test]
    fn test_self_unwatch_inside_callback() {
        let registry = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let handle: Arc<PlMutex<Option<Unwatch<String>>>> = Arc::new(PlMutex::new(None));

        let unwatch = {
            let calls = Arc::clone(&calls);
            let handle = Arc::clone(&handle);
            registry.watch("f1".to_string(), move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(u) = handle.lock().as_ref() {
                    u.unwatch();
                }
                true
            })
        };
        *handle.lock() = Some(unwatch);

        assert!(registry.notify("f1", &FileChangeType::Changed));
        assert!(!registry.notify("f1", &FileChangeType::Changed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_watch_during_dispatch_seen_next_time() {
        let registry = registry();
        let added = Arc::new(AtomicUsize::new(0));
        let late_calls = Arc::new(AtomicUsize::new(0));

        let _u = {
            let inner = registry.clone();
            let added = Arc::clone(&added);
            let late_calls = Arc::clone(&late_calls);
            registry.watch("f1".to_string(), move |_| {
                if added.fetch_add(1, Ordering::SeqCst) == 0 {
                    let late_calls = Arc::clone(&late_calls);
                    let _ = inner.watch("f1".to_string(), move |_| {
                        late_calls.fetch_add(1, Ordering::SeqCst);
                        true
                    });
                }
                false
            })
        };

        assert!(!registry.notify("f1", &FileChangeType::Created));
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);

        assert!(registry.notify("f1", &FileChangeType::Changed));
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unwatched_during_dispatch_still_called_once() {
        let registry = registry();
        let second_calls = Arc::new(AtomicUsize::new(0));
        let victim: Arc<PlMutex<Option<Unwatch<String>>>> = Arc::new(PlMutex::new(None));

        let _first = {
            let victim = Arc::clone(&victim);
            registry.watch("f1".to_string(), move |_| {
                if let Some(u) = victim.lock().as_ref() {
                    u.unwatch();
                }
                false
            })
        };
        let second = {
            let second_calls = Arc::clone(&second_calls);
            registry.watch("f1".to_string(), move |_| {
                second_calls.fetch_add(1, Ordering::SeqCst);
                true
            })
        };
        *victim.lock() = Some(second);

        // Already in the snapshot.
        assert!(registry.notify("f1", &FileChangeType::Changed));
        assert!(!registry.notify("f1", &FileChangeType::Changed));
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sharded_registry() {
        let registry: WatchRegistry<String> =
            WatchRegistry::with_config(WatchConfig::sharded(8)).unwrap();

        let handles: Vec<_> = (0..64)
            .map(|i| registry.watch(format!("file-{}", i % 16), |_| true))
            .collect();

        assert_eq!(registry.total_watchers(), 64);
        assert_eq!(registry.key_count(), 16);
        assert_eq!(registry.watcher_count("file-3"), 4);

        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(handle.id(), WatchId(i as u64));
            assert!(handle.unwatch());
        }
        assert_eq!(registry.total_watchers(), 0);
        assert!(!registry.notify("file-3", &FileChangeType::Changed));
    }

    #[test]
    fn test_zero_shards_rejected() {
        let result: Result<WatchRegistry<String>> =
            WatchRegistry::with_config(WatchConfig::sharded(0));
        assert!(matches!(result, Err(WatchError::InvalidConfig(_))));
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()).as_deref(), Some("boom"));

        let payload = panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()).as_deref(), Some("code 7"));

        let payload = panic::catch_unwind(|| std::panic::panic_any(42u32)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), None);
    }
}
