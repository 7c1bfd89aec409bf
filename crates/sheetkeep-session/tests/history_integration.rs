//! Checkpoint history integration tests.
//!
//! These drive the store, the undo controller and a session through the
//! public API, including swapping checkpoints to disk and back.

mod common;

use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;

use common::{LedgerSheet, ledger};
use sheetkeep_session::{
    CheckpointStore, EventContext, HistoryResources, SheetSession, SwapPriority, SwapStore,
    UndoController,
};

fn resources(max: usize) -> Result<(TempDir, HistoryResources)> {
    let dir = TempDir::new()?;
    let swap = SwapStore::open(dir.path(), Duration::from_millis(10))?;
    Ok((dir, HistoryResources::new(max, common::registry(), swap)))
}

fn swap_files(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path()).unwrap().count()
}

#[test]
fn test_eviction_then_undo_redo() -> Result<()> {
    let (_dir, resources) = resources(3)?;
    let mut history = UndoController::new(CheckpointStore::new(resources));

    for name in ["A", "B", "C", "D"] {
        history.add(LedgerSheet::new(name).boxed(), EventContext::new("edit"));
    }
    assert_eq!(history.store().len(), 3);
    assert_eq!(history.store().pointer(), Some(2));

    let restored = history.undo().expect("undo from the newest checkpoint");
    assert_eq!(ledger(restored.sheet.as_ref()).name, "C");
    assert_eq!(history.store().pointer(), Some(1));

    let restored = history.redo().expect("redo back to the newest checkpoint");
    assert_eq!(ledger(restored.sheet.as_ref()).name, "D");
    assert_eq!(history.store().pointer(), Some(2));
    assert!(history.redo().is_none());

    Ok(())
}

#[test]
fn test_swapped_checkpoint_reads_back_byte_for_byte() -> Result<()> {
    let (dir, resources) = resources(5)?;
    let mut store = CheckpointStore::new(resources);

    let original = LedgerSheet::new("Q3")
        .with_row("rent", -1200)
        .with_row("sales", 5400);
    let expected = serde_json::to_vec(&original)?;
    store.add(original.boxed(), EventContext::new("open"));
    store.add(LedgerSheet::new("Q3 draft").boxed(), EventContext::new("edit"));

    assert_eq!(store.swap_priority(0), SwapPriority::Always);
    assert!(store.swap(0));
    assert_eq!(store.swap_priority(0), SwapPriority::Never);
    assert_eq!(swap_files(&dir), 1);

    let sheet = store.get(0).expect("swapped checkpoint restores");
    assert_eq!(sheet.serialize()?, expected);

    Ok(())
}

#[test]
fn test_evicting_swapped_checkpoint_deletes_file() -> Result<()> {
    let (dir, resources) = resources(2)?;
    let mut store = CheckpointStore::new(resources);

    store.add(LedgerSheet::new("A").boxed(), EventContext::new("edit"));
    assert!(store.swap(0));
    assert_eq!(swap_files(&dir), 1);

    store.add(LedgerSheet::new("B").boxed(), EventContext::new("edit"));
    store.add(LedgerSheet::new("C").boxed(), EventContext::new("edit"));
    assert_eq!(store.len(), 2);
    assert_eq!(swap_files(&dir), 0);

    Ok(())
}

#[test]
fn test_session_survives_swap_all_and_undo() -> Result<()> {
    let (dir, resources) = resources(4)?;
    let session = SheetSession::open(
        "s1",
        common::entry("s1"),
        "ana",
        LedgerSheet::new("v0").boxed(),
        resources,
    );
    for amount in [10, 20] {
        session.set_sheet(LedgerSheet::new("v").with_row("total", amount).boxed());
        session.add_checkpoint(EventContext::new("set total").with_affected(["total"]));
    }

    assert_eq!(session.swap_checkpoints(), 3);
    assert_eq!(swap_files(&dir), 3);

    let info = session.undo().expect("undo after swap");
    assert_eq!(info.index, 1);
    assert!(!info.requires_reset);
    let live = session.with_sheet(ledger).unwrap();
    assert_eq!(live.rows, vec![("total".to_string(), 10)]);

    assert!(session.dispose());
    assert_eq!(swap_files(&dir), 0);

    Ok(())
}
