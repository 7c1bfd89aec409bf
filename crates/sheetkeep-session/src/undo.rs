//! Undo/redo state machine over a [`CheckpointStore`].

use tracing::{debug, trace};

use crate::history::CheckpointStore;
use crate::sheet::{EventContext, Sheet};

/// A sheet brought back from history.
#[derive(Debug)]
pub struct Restored {
    /// Isolated copy to install as the live sheet.
    pub sheet: Box<dyn Sheet>,
    /// Index the copy came from.
    pub index: usize,
    /// Derived runtime state must be rebuilt, not just the sheet swapped in.
    pub requires_reset: bool,
}

/// Moves the checkpoint pointer for undo, redo and rollback.
///
/// All operations on an empty or disposed store are no-ops returning
/// `None`. A checkpoint that cannot be restored also yields `None` and
/// leaves the pointer where it was.
#[derive(Debug)]
pub struct UndoController {
    store: CheckpointStore,
}

impl UndoController {
    pub fn new(store: CheckpointStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut CheckpointStore {
        &mut self.store
    }

    pub fn add(&mut self, sheet: Box<dyn Sheet>, context: EventContext) -> Option<usize> {
        self.store.add(sheet, context)
    }

    pub fn replace(&mut self, sheet: Box<dyn Sheet>, context: EventContext) -> Option<usize> {
        self.store.replace(sheet, context)
    }

    pub fn can_undo(&self) -> bool {
        self.store.pointer().is_some_and(|p| p >= 1 && p < self.store.len())
    }

    pub fn can_redo(&self) -> bool {
        self.store.pointer().is_some_and(|p| p + 1 < self.store.len())
    }

    /// Step back one checkpoint.
    pub fn undo(&mut self) -> Option<Restored> {
        if !self.can_undo() {
            trace!("Nothing to undo");
            return None;
        }
        let target = self.store.pointer()? - 1;
        self.restore(target, true)
    }

    /// Step forward one checkpoint.
    pub fn redo(&mut self) -> Option<Restored> {
        if !self.can_redo() {
            trace!("Nothing to redo");
            return None;
        }
        let target = self.store.pointer()? + 1;
        self.restore(target, true)
    }

    /// Restore the most recent checkpoint without moving the pointer,
    /// discarding live mutations made since it was taken.
    pub fn rollback(&mut self) -> Option<Restored> {
        let last = self.store.len().checked_sub(1)?;
        self.restore(last, false)
    }

    fn restore(&mut self, index: usize, move_pointer: bool) -> Option<Restored> {
        let sheet = self.store.get(index)?;
        let flagged = self.store.context(index).is_some_and(|c| c.requires_reset);
        let requires_reset = flagged || sheet.requires_reset();

        if move_pointer {
            self.store.set_pointer(index);
        }
        debug!(index, requires_reset, "Checkpoint restored");

        Some(Restored {
            sheet,
            index,
            requires_reset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryResources;
    use crate::swap::SwapStore;
    use crate::test_support::{NoteSheet, registry, title_of};
    use std::sync::Arc;
    use std::time::Duration;

    fn controller(max: usize) -> (tempfile::TempDir, UndoController) {
        let dir = tempfile::tempdir().unwrap();
        let swap = SwapStore::open(dir.path(), Duration::from_millis(10)).unwrap();
        let resources = HistoryResources::new(max, Arc::new(registry()), swap);
        (dir, UndoController::new(CheckpointStore::new(resources)))
    }

    fn add(c: &mut UndoController, title: &str) {
        c.add(NoteSheet::boxed(title), EventContext::new("edit"));
    }

    #[test]
    fn test_empty_store_is_noop() {
        let (_dir, mut c) = controller(3);
        assert!(c.undo().is_none());
        assert!(c.redo().is_none());
        assert!(c.rollback().is_none());
        assert_eq!(c.store().pointer(), None);
    }

    #[test]
    fn test_undo_at_first_checkpoint_is_noop() {
        let (_dir, mut c) = controller(3);
        add(&mut c, "A");
        assert!(!c.can_undo());
        assert!(c.undo().is_none());
        assert_eq!(c.store().pointer(), Some(0));
    }

    #[test]
    fn test_redo_at_last_checkpoint_is_noop() {
        let (_dir, mut c) = controller(3);
        add(&mut c, "A");
        add(&mut c, "B");
        assert!(c.redo().is_none());
        assert_eq!(c.store().pointer(), Some(1));
    }

    #[test]
    fn test_undo_then_redo_after_eviction() {
        let (_dir, mut c) = controller(3);
        for t in ["A", "B", "C", "D"] {
            add(&mut c, t);
        }
        assert_eq!(c.store().pointer(), Some(2));

        let restored = c.undo().unwrap();
        assert_eq!(title_of(restored.sheet.as_ref()), "C");
        assert_eq!(c.store().pointer(), Some(1));

        let restored = c.undo().unwrap();
        assert_eq!(title_of(restored.sheet.as_ref()), "B");
        assert_eq!(c.store().pointer(), Some(0));
        assert!(c.undo().is_none());

        let restored = c.redo().unwrap();
        assert_eq!(title_of(restored.sheet.as_ref()), "C");
        assert_eq!(c.store().pointer(), Some(1));
    }

    #[test]
    fn test_rollback_keeps_pointer() {
        let (_dir, mut c) = controller(3);
        add(&mut c, "A");
        add(&mut c, "B");
        c.undo().unwrap();

        let restored = c.rollback().unwrap();
        assert_eq!(restored.index, 1);
        assert_eq!(title_of(restored.sheet.as_ref()), "B");
        assert_eq!(c.store().pointer(), Some(0));
    }

    #[test]
    fn test_requires_reset_from_context_or_sheet() {
        let (_dir, mut c) = controller(4);
        c.add(NoteSheet::boxed("A"), EventContext::new("bind").with_reset(true));
        let mut stale = NoteSheet::new("B", &[]);
        stale.stale = true;
        c.add(Box::new(stale), EventContext::new("edit"));
        add(&mut c, "C");

        // B lost its bindings, A was produced by a rebinding event
        assert!(c.undo().unwrap().requires_reset);
        assert!(c.undo().unwrap().requires_reset);
        assert!(c.redo().unwrap().requires_reset);
        assert!(!c.redo().unwrap().requires_reset);
    }

    #[test]
    fn test_unrestorable_checkpoint_keeps_pointer() {
        let (_dir, mut c) = controller(3);
        add(&mut c, "A");
        add(&mut c, "B");
        assert!(c.store_mut().swap(0));
        let path = c.store().resources().swap.dir().to_path_buf();
        for entry in std::fs::read_dir(path).unwrap() {
            std::fs::write(entry.unwrap().path(), b"garbage").unwrap();
        }

        assert!(c.undo().is_none());
        assert_eq!(c.store().pointer(), Some(1));
    }
}
