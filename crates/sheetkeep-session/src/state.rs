//! Serializable projection of a session for the distributed cache.
//!
//! Holds no in-process references or live locks: sheets travel as their
//! serialized bytes tagged with their [`SheetKind`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::sheet::{EventContext, SheetKind};

/// Where a session's sheet lives in the asset repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetEntry {
    /// Repository path of the sheet.
    pub path: String,
    /// Kind of sheet stored at `path`.
    pub kind: SheetKind,
}

impl SheetEntry {
    pub fn new(path: impl Into<String>, kind: SheetKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// One checkpoint as mirrored to the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub kind: SheetKind,
    /// Serialized sheet; `None` for a checkpoint that could not be read.
    pub payload: Option<Vec<u8>>,
    pub context: EventContext,
}

/// A session as mirrored to the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    pub entry: SheetEntry,
    pub user: String,
    pub editable: bool,
    pub lock_owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub sheet_kind: SheetKind,
    pub sheet: Vec<u8>,
    pub checkpoints: Vec<CheckpointState>,
    pub pointer: Option<usize>,
    pub save_point: Option<usize>,
    pub max_checkpoints: usize,
}

impl SessionState {
    /// Encode for storage in a byte-oriented cache.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
