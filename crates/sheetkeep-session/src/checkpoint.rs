//! A single undo/redo snapshot.

use tracing::{debug, warn};

use crate::error::Result;
use crate::sheet::{EventContext, Sheet, SheetKind, SheetRegistry};
use crate::swap::{SwapFile, SwapStore};

/// How eagerly a checkpoint may be swapped to disk.
///
/// Every live resident checkpoint is an equally good candidate: checkpoints
/// only serve undo/redo, never the live edit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapPriority {
    /// Nothing to release (already swapped, invalid or disposed).
    Never,
    /// Resident and safe to swap at any time.
    Always,
}

/// Snapshot of a sheet plus the event that produced it.
///
/// The resident sheet is authoritative while present; otherwise the swap
/// file is. A disposed checkpoint holds neither.
#[derive(Debug)]
pub struct Checkpoint {
    kind: SheetKind,
    sheet: Option<Box<dyn Sheet>>,
    swap: Option<SwapFile>,
    context: EventContext,
    valid: bool,
    disposed: bool,
}

impl Checkpoint {
    /// Wrap an already-isolated copy of a sheet.
    pub fn new(sheet: Box<dyn Sheet>, context: EventContext) -> Self {
        Self {
            kind: sheet.kind(),
            sheet: Some(sheet),
            swap: None,
            context,
            valid: true,
            disposed: false,
        }
    }

    /// A placeholder for a snapshot that could not be reconstructed.
    pub fn invalid(kind: SheetKind, context: EventContext) -> Self {
        Self {
            kind,
            sheet: None,
            swap: None,
            context,
            valid: false,
            disposed: false,
        }
    }

    /// Rebuild from serialized bytes, falling back to an invalid checkpoint.
    pub fn decode(
        kind: SheetKind,
        payload: &[u8],
        context: EventContext,
        registry: &SheetRegistry,
    ) -> Self {
        match registry.deserialize(kind, payload) {
            Ok(sheet) => Self::new(sheet, context),
            Err(e) => {
                warn!(kind = %kind, event = %context.event_name, error = %e, "Checkpoint could not be decoded");
                Self::invalid(kind, context)
            }
        }
    }

    pub fn kind(&self) -> SheetKind {
        self.kind
    }

    pub fn context(&self) -> &EventContext {
        &self.context
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn is_resident(&self) -> bool {
        self.sheet.is_some()
    }

    pub fn is_swapped(&self) -> bool {
        !self.disposed && self.sheet.is_none() && self.swap.as_ref().is_some_and(|f| f.exists())
    }

    pub fn swap_file(&self) -> Option<&SwapFile> {
        self.swap.as_ref()
    }

    pub fn swap_priority(&self) -> SwapPriority {
        if self.valid && !self.disposed && self.sheet.is_some() {
            SwapPriority::Always
        } else {
            SwapPriority::Never
        }
    }

    /// Serialize the sheet to disk and release it from memory.
    ///
    /// A file written by an earlier swap is reused as is. Returns `false`
    /// when there was nothing to swap.
    pub fn swap(&mut self, store: &SwapStore) -> Result<bool> {
        if self.swap_priority() == SwapPriority::Never {
            return Ok(false);
        }
        let Some(sheet) = self.sheet.as_ref() else {
            return Ok(false);
        };

        let file = self.swap.get_or_insert_with(|| store.allocate());
        if !file.exists() {
            let payload = sheet.serialize()?;
            file.write(self.kind, &payload)?;
        }

        debug!(path = %file.path().display(), event = %self.context.event_name, "Checkpoint swapped out");
        self.sheet = None;
        Ok(true)
    }

    /// Borrow the sheet, reloading it from disk if it was swapped.
    ///
    /// A failed reload is logged, marks the checkpoint invalid and yields
    /// `None`.
    pub fn sheet(&mut self, registry: &SheetRegistry) -> Option<&dyn Sheet> {
        if self.disposed || !self.valid {
            return None;
        }

        if self.sheet.is_none() {
            let file = self.swap.as_ref()?;
            let restored = file
                .read()
                .and_then(|(kind, payload)| registry.deserialize(kind, &payload));
            match restored {
                Ok(sheet) => {
                    debug!(path = %file.path().display(), "Checkpoint swapped in");
                    self.sheet = Some(sheet);
                }
                Err(e) => {
                    warn!(path = %file.path().display(), error = %e, "Failed to restore swapped checkpoint");
                    self.valid = false;
                    return None;
                }
            }
        }

        self.sheet.as_deref()
    }

    /// Serialized sheet bytes without reconstructing a swapped sheet.
    pub fn payload(&self) -> Result<Option<Vec<u8>>> {
        if self.disposed || !self.valid {
            return Ok(None);
        }
        if let Some(sheet) = &self.sheet {
            return sheet.serialize().map(Some);
        }
        match &self.swap {
            Some(file) => file.read().map(|(_, payload)| Some(payload)),
            None => Ok(None),
        }
    }

    /// Release the sheet and delete any swap file. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.sheet = None;
        // Dropping the file handle deletes it.
        self.swap = None;
    }
}
