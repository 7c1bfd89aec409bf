//! Runtime sheet state: checkpoint history with disk swap and a two-tier
//! session directory.
//!
//! This crate provides:
//! - Per-session undo/redo over a bounded checkpoint history
//! - Swapping cold checkpoints to compressed files under memory pressure
//! - A local session map mirrored into a distributed cache, with preview
//!   eviction, periodic flushing and cluster rebalance handling
//!
//! # Example
//!
//! ```rust,ignore
//! use sheetkeep_session::{DirectoryConfig, MemoryGrid, SessionDirectory, SheetRegistry};
//!
//! let registry = Arc::new(SheetRegistry::new().with(SheetKind::Report, decode_report));
//! let config = DirectoryConfig::default().with_resident_cap(500);
//! let directory = SessionDirectory::new(MemoryGrid::new("node-a"), registry, config)?;
//!
//! let session = directory.open_session("s1", entry, "ana", sheet).await;
//! session.add_checkpoint(EventContext::new("rename column"));
//! session.undo();
//! ```

mod checkpoint;
mod config;
mod directory;
mod error;
mod grid;
mod history;
mod session;
mod sheet;
mod state;
mod swap;
pub mod telemetry;
mod undo;

#[cfg(test)]
mod test_support;

pub use checkpoint::{Checkpoint, SwapPriority};
pub use config::{DEFAULT_IDLE_SWEEP_INTERVAL, DirectoryConfig};
pub use directory::{DirectoryStats, RebalanceOutcome, SessionDirectory};
pub use error::{Error, Result};
pub use grid::{DistributedCache, MemoryGrid, RebalanceEvent};
pub use history::{CheckpointStore, HistoryResources};
pub use session::{RestoreInfo, SessionHandle, SheetSession};
pub use sheet::{EventContext, Sheet, SheetDecoder, SheetKind, SheetRegistry};
pub use state::{CheckpointState, SessionState, SheetEntry};
pub use swap::{SwapFile, SwapStore};
pub use telemetry::init_tracing;
pub use undo::{Restored, UndoController};
