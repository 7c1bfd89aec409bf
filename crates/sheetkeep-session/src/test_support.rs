//! Sample sheets shared by unit tests.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sheet::{Sheet, SheetKind, SheetRegistry};

/// A worksheet holding a title and a list of cell notes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteSheet {
    pub title: String,
    pub notes: Vec<String>,
    pub stale: bool,
}

impl NoteSheet {
    pub fn new(title: &str, notes: &[&str]) -> Self {
        Self {
            title: title.to_string(),
            notes: notes.iter().map(|n| n.to_string()).collect(),
            stale: false,
        }
    }

    pub fn boxed(title: &str) -> Box<dyn Sheet> {
        Box::new(Self::new(title, &[]))
    }

    pub fn decode(bytes: &[u8]) -> Result<Box<dyn Sheet>> {
        let sheet: NoteSheet =
            serde_json::from_slice(bytes).map_err(|e| Error::Sheet(e.to_string()))?;
        Ok(Box::new(sheet))
    }
}

impl Sheet for NoteSheet {
    fn kind(&self) -> SheetKind {
        SheetKind::Worksheet
    }

    fn clone_sheet(&self) -> Box<dyn Sheet> {
        Box::new(self.clone())
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Sheet(e.to_string()))
    }

    fn requires_reset(&self) -> bool {
        self.stale
    }
}

/// A report whose serializer always fails.
#[derive(Debug, Clone)]
pub struct BrokenSheet;

impl Sheet for BrokenSheet {
    fn kind(&self) -> SheetKind {
        SheetKind::Report
    }

    fn clone_sheet(&self) -> Box<dyn Sheet> {
        Box::new(BrokenSheet)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        Err(Error::Sheet("report bindings unavailable".to_string()))
    }
}

pub fn registry() -> SheetRegistry {
    SheetRegistry::new().with(SheetKind::Worksheet, NoteSheet::decode)
}

/// Title of a sheet produced by [`NoteSheet`], via its serialized form.
pub fn title_of(sheet: &dyn Sheet) -> String {
    let bytes = sheet.serialize().unwrap();
    let note: NoteSheet = serde_json::from_slice(&bytes).unwrap();
    note.title
}
