//! # Keywatch
//!
//! A thread-safe registry of change watchers grouped by key, used to fan
//! file-change notifications out to cache entries.
//!
//! ## Core Concepts
//!
//! - **Keys**: Any `Eq + Hash` value identifying a cached artifact
//! - **Watchers**: Callbacks registered on a key, each with a unique id
//! - **Change types**: Opaque payload passed to callbacks (`FileChangeType` by default)
//! - **Snapshot dispatch**: Callbacks run after the registry lock is released
//!
//! ## Example
//!
//! ```ignore
//! use keywatch::{FileChangeType, WatchRegistry};
//!
//! let registry: WatchRegistry<String> = WatchRegistry::new();
//!
//! let unwatch = registry.watch("src/main.rs".to_string(), |change| {
//!     *change != FileChangeType::Created
//! });
//!
//! assert!(registry.notify("src/main.rs", &FileChangeType::Changed));
//!
//! unwatch.unwatch();
//! assert!(!registry.notify("src/main.rs", &FileChangeType::Changed));
//! ```

pub mod error;
pub mod types;
pub mod watch;

// Re-exports
pub use error::{Result, WatchError};
pub use types::*;
pub use watch::{ChannelWatch, Unwatch, WatchCallback, WatchConfig, WatchRegistry};
