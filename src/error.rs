//! Error types for the watch registry.

use thiserror::Error;

/// Main error type for registry operations.
///
/// The core `watch` / `notify` / `unwatch` path is total; these errors only
/// come from the isolating dispatch, configuration checks, and decoding
/// change types.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("{failed} watcher callback(s) panicked while notifying {key}")]
    CallbackPanicked {
        /// Debug rendering of the notified key.
        key: String,
        /// Number of callbacks that panicked.
        failed: usize,
        /// OR of the results of callbacks that returned normally.
        matched: bool,
        /// Panic payloads, when they were strings.
        messages: Vec<String>,
    },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Unknown change type: {0}")]
    UnknownChangeType(u8),
}

impl WatchError {
    /// Whether any callback that did return reported a match.
    ///
    /// Always false for errors that are not a dispatch failure.
    pub fn matched(&self) -> bool {
        match self {
            WatchError::CallbackPanicked { matched, .. } => *matched,
            _ => false,
        }
    }
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, WatchError>;
