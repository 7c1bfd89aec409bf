//! Bounded, per-session sequence of checkpoints.
//!
//! Invariants:
//! - `len() <= max()`
//! - `pointer()` is `None` iff the store is empty, otherwise `< len()`
//! - `save_point()` is `None` or `< len()`

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::checkpoint::{Checkpoint, SwapPriority};
use crate::sheet::{EventContext, Sheet, SheetRegistry};
use crate::state::CheckpointState;
use crate::swap::SwapStore;

/// Runtime collaborators every checkpoint store needs.
#[derive(Debug, Clone)]
pub struct HistoryResources {
    /// Maximum checkpoints kept per session.
    pub max_checkpoints: usize,
    /// Decoders for swapped or mirrored sheets.
    pub registry: Arc<SheetRegistry>,
    /// Where checkpoints are swapped under memory pressure.
    pub swap: SwapStore,
}

impl HistoryResources {
    pub fn new(max_checkpoints: usize, registry: Arc<SheetRegistry>, swap: SwapStore) -> Self {
        Self {
            max_checkpoints: max_checkpoints.max(1),
            registry,
            swap,
        }
    }
}

/// Ordered checkpoints with a current pointer and a save point.
#[derive(Debug)]
pub struct CheckpointStore {
    checkpoints: VecDeque<Checkpoint>,
    pointer: Option<usize>,
    save_point: Option<usize>,
    resources: HistoryResources,
    disposed: bool,
}

impl CheckpointStore {
    pub fn new(resources: HistoryResources) -> Self {
        Self {
            checkpoints: VecDeque::with_capacity(resources.max_checkpoints),
            pointer: None,
            save_point: None,
            resources,
            disposed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn max(&self) -> usize {
        self.resources.max_checkpoints
    }

    pub fn pointer(&self) -> Option<usize> {
        self.pointer
    }

    pub fn save_point(&self) -> Option<usize> {
        self.save_point
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn resources(&self) -> &HistoryResources {
        &self.resources
    }

    /// Append a snapshot, discarding the redo branch and evicting the
    /// oldest checkpoint at capacity. `sheet` must already be an isolated
    /// copy. Returns the new index, or `None` once disposed.
    pub fn add(&mut self, sheet: Box<dyn Sheet>, context: EventContext) -> Option<usize> {
        if self.disposed {
            return None;
        }

        let keep = self.pointer.map_or(0, |p| p + 1);
        if keep < self.checkpoints.len() {
            trace!(discarded = self.checkpoints.len() - keep, "Discarding redo branch");
            for mut checkpoint in self.checkpoints.drain(keep..) {
                checkpoint.dispose();
            }
            if self.save_point.is_some_and(|s| s >= keep) {
                self.save_point = None;
            }
        }

        if self.checkpoints.len() >= self.resources.max_checkpoints
            && let Some(mut oldest) = self.checkpoints.pop_front()
        {
            debug!(event = %oldest.context().event_name, "Evicting oldest checkpoint");
            oldest.dispose();
            self.save_point = match self.save_point {
                Some(0) | None => None,
                Some(s) => Some(s - 1),
            };
        }

        self.checkpoints.push_back(Checkpoint::new(sheet, context));
        let index = self.checkpoints.len() - 1;
        self.pointer = Some(index);
        Some(index)
    }

    /// Overwrite the last checkpoint in place, leaving length and pointer
    /// alone. Behaves like [`CheckpointStore::add`] when empty.
    pub fn replace(&mut self, sheet: Box<dyn Sheet>, context: EventContext) -> Option<usize> {
        if self.disposed {
            return None;
        }
        if self.checkpoints.is_empty() {
            return self.add(sheet, context);
        }

        let index = self.checkpoints.len() - 1;
        let mut previous =
            std::mem::replace(&mut self.checkpoints[index], Checkpoint::new(sheet, context));
        previous.dispose();
        if self.save_point == Some(index) {
            self.save_point = None;
        }
        Some(index)
    }

    /// A copy of the sheet at `index`, reloading it from disk if swapped.
    ///
    /// `None` means the checkpoint cannot be restored.
    pub fn get(&mut self, index: usize) -> Option<Box<dyn Sheet>> {
        if self.disposed {
            return None;
        }
        let registry = Arc::clone(&self.resources.registry);
        self.checkpoints
            .get_mut(index)?
            .sheet(&registry)
            .map(|sheet| sheet.clone_sheet())
    }

    /// Event metadata for the checkpoint at `index`.
    pub fn context(&self, index: usize) -> Option<&EventContext> {
        self.checkpoints.get(index).map(Checkpoint::context)
    }

    /// Remove the checkpoint at `index` and delete its swap file.
    pub fn remove(&mut self, index: usize) -> bool {
        if self.disposed {
            return false;
        }
        let Some(mut checkpoint) = self.checkpoints.remove(index) else {
            return false;
        };
        checkpoint.dispose();

        let len = self.checkpoints.len();
        self.pointer = match self.pointer {
            _ if len == 0 => None,
            Some(p) if p > index || p >= len => Some(p - 1),
            other => other,
        };
        self.save_point = match self.save_point {
            Some(s) if s == index => None,
            Some(s) if s > index => Some(s - 1),
            other => other,
        };
        true
    }

    pub(crate) fn set_pointer(&mut self, index: usize) {
        if index < self.checkpoints.len() {
            self.pointer = Some(index);
        }
    }

    pub fn swap_priority(&self, index: usize) -> SwapPriority {
        if self.disposed {
            return SwapPriority::Never;
        }
        self.checkpoints
            .get(index)
            .map_or(SwapPriority::Never, Checkpoint::swap_priority)
    }

    /// Swap one checkpoint to disk. Failures are logged, not returned.
    pub fn swap(&mut self, index: usize) -> bool {
        if self.disposed {
            return false;
        }
        let swap = self.resources.swap.clone();
        let Some(checkpoint) = self.checkpoints.get_mut(index) else {
            return false;
        };
        match checkpoint.swap(&swap) {
            Ok(swapped) => swapped,
            Err(e) => {
                warn!(index, error = %e, "Failed to swap checkpoint");
                false
            }
        }
    }

    /// Swap every candidate checkpoint; returns how many were released.
    pub fn swap_all(&mut self) -> usize {
        let candidates: Vec<usize> = (0..self.checkpoints.len())
            .filter(|&i| self.swap_priority(i) == SwapPriority::Always)
            .collect();
        candidates.into_iter().filter(|&i| self.swap(i)).count()
    }

    /// Record the current pointer as the saved state.
    pub fn mark_saved(&mut self) {
        self.save_point = self.pointer;
    }

    /// Whether the current state differs from the last save point.
    pub fn is_modified(&self) -> bool {
        self.save_point != self.pointer
    }

    /// Release every checkpoint and its swap file. Further calls are no-ops.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        for checkpoint in self.checkpoints.iter_mut() {
            checkpoint.dispose();
        }
        self.checkpoints.clear();
        self.pointer = None;
        self.save_point = None;
    }

    /// Serializable projection of every checkpoint.
    ///
    /// Checkpoints whose bytes cannot be produced are exported as invalid
    /// rather than failing the whole export.
    pub(crate) fn export(&self) -> Vec<CheckpointState> {
        self.checkpoints
            .iter()
            .enumerate()
            .map(|(index, checkpoint)| {
                let payload = checkpoint.payload().unwrap_or_else(|e| {
                    warn!(index, error = %e, "Checkpoint could not be exported");
                    None
                });
                CheckpointState {
                    kind: checkpoint.kind(),
                    payload,
                    context: checkpoint.context().clone(),
                }
            })
            .collect()
    }

    /// Rebuild a store from its projection, clamping stale indices.
    pub(crate) fn import(
        resources: HistoryResources,
        states: Vec<CheckpointState>,
        pointer: Option<usize>,
        save_point: Option<usize>,
    ) -> Self {
        let mut store = Self::new(resources);
        let skip = states.len().saturating_sub(store.resources.max_checkpoints);
        for state in states.into_iter().skip(skip) {
            let checkpoint = match state.payload {
                Some(payload) => Checkpoint::decode(
                    state.kind,
                    &payload,
                    state.context,
                    &store.resources.registry,
                ),
                None => Checkpoint::invalid(state.kind, state.context),
            };
            store.checkpoints.push_back(checkpoint);
        }

        let len = store.checkpoints.len();
        let shift = |i: usize| i.checked_sub(skip).filter(|&i| i < len);
        store.pointer = if len == 0 {
            None
        } else {
            Some(pointer.and_then(shift).unwrap_or(len - 1))
        };
        store.save_point = save_point.and_then(shift);
        store
    }
}
