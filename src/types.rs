//! Core types shared by the registry and its callers.

use crate::error::WatchError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a watcher.
///
/// Issued strictly increasing from 0 and never reused within a registry.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WatchId(pub u64);

impl fmt::Debug for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WatchId({})", self.0)
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of change reported for a watched key.
///
/// Numbering follows the LSP `FileChangeType` enumeration. The registry never
/// looks inside it; what a change means is up to the callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeType {
    Created = 1,
    Changed = 2,
    Deleted = 3,
}

impl FileChangeType {
    /// LSP wire code for this change type.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for FileChangeType {
    type Error = WatchError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(FileChangeType::Created),
            2 => Ok(FileChangeType::Changed),
            3 => Ok(FileChangeType::Deleted),
            other => Err(WatchError::UnknownChangeType(other)),
        }
    }
}

impl fmt::Display for FileChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileChangeType::Created => "created",
            FileChangeType::Changed => "changed",
            FileChangeType::Deleted => "deleted",
        };
        f.write_str(name)
    }
}
