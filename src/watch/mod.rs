//! Keyed watchers for cache invalidation.
//!
//! Callers watch a key (typically a file path) and get told when something
//! happens to it:
//! - `watch` registers a callback and returns an `Unwatch` handle
//! - `notify` runs every callback registered for a key
//! - `Unwatch::unwatch` removes one callback, idempotently
//!
//! Dispatch copies the key's callbacks under the lock and runs them after
//! releasing it, so callbacks are free to call back into the registry.
//!
//! # Example
//!
//! ```ignore
//! let registry: WatchRegistry<PathBuf> = WatchRegistry::new();
//!
//! let unwatch = registry.watch(path.clone(), |change| {
//!     matches!(change, FileChangeType::Changed | FileChangeType::Deleted)
//! });
//!
//! // From the file-system event source
//! if registry.notify(&path, &FileChangeType::Changed) {
//!     println!("cache entry invalidated");
//! }
//!
//! unwatch.unwatch();
//! ```

mod registry;
mod types;

pub use registry::{WatchCallback, WatchRegistry};
pub use types::{ChannelWatch, Unwatch, WatchConfig};
