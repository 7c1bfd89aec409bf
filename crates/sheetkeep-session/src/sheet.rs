//! The sheet contract consumed by the checkpoint store.
//!
//! Sheets are opaque to this crate: they clone themselves, serialize to
//! bytes and report whether a restored copy needs its derived runtime
//! structures rebuilt. Reconstruction goes through a [`SheetRegistry`]
//! keyed by the closed [`SheetKind`] set rather than by type name.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The kinds of sheet an editor session can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SheetKind {
    /// A paginated report definition.
    Report,
    /// A data worksheet.
    Worksheet,
    /// A dashboard of assemblies.
    Dashboard,
}

impl SheetKind {
    /// Stable one-byte tag used in swap file headers.
    pub fn tag(self) -> u8 {
        match self {
            SheetKind::Report => 1,
            SheetKind::Worksheet => 2,
            SheetKind::Dashboard => 3,
        }
    }

    /// Inverse of [`SheetKind::tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(SheetKind::Report),
            2 => Some(SheetKind::Worksheet),
            3 => Some(SheetKind::Dashboard),
            _ => None,
        }
    }
}

impl fmt::Display for SheetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SheetKind::Report => write!(f, "report"),
            SheetKind::Worksheet => write!(f, "worksheet"),
            SheetKind::Dashboard => write!(f, "dashboard"),
        }
    }
}

/// An editable report or worksheet definition.
pub trait Sheet: Send + Sync + fmt::Debug {
    /// Which registry entry reconstructs this sheet.
    fn kind(&self) -> SheetKind;

    /// Deep copy, isolated from further edits to `self`.
    fn clone_sheet(&self) -> Box<dyn Sheet>;

    /// Serialize to bytes readable by the registered decoder for [`Sheet::kind`].
    fn serialize(&self) -> Result<Vec<u8>>;

    /// Whether this sheet lost its base-data bindings and needs a full
    /// reinitialization of derived runtime state after being restored.
    fn requires_reset(&self) -> bool {
        false
    }
}

impl Clone for Box<dyn Sheet> {
    fn clone(&self) -> Self {
        self.clone_sheet()
    }
}

/// Reconstructs a sheet from its serialized bytes.
pub type SheetDecoder = fn(&[u8]) -> Result<Box<dyn Sheet>>;

/// Maps each [`SheetKind`] to the function that rebuilds it.
#[derive(Clone, Default)]
pub struct SheetRegistry {
    decoders: HashMap<SheetKind, SheetDecoder>,
}

impl SheetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the decoder for `kind`.
    pub fn register(&mut self, kind: SheetKind, decoder: SheetDecoder) -> &mut Self {
        self.decoders.insert(kind, decoder);
        self
    }

    /// Builder-style [`SheetRegistry::register`].
    pub fn with(mut self, kind: SheetKind, decoder: SheetDecoder) -> Self {
        self.register(kind, decoder);
        self
    }

    pub fn contains(&self, kind: SheetKind) -> bool {
        self.decoders.contains_key(&kind)
    }

    /// Rebuild a sheet of `kind` from `bytes`.
    pub fn deserialize(&self, kind: SheetKind, bytes: &[u8]) -> Result<Box<dyn Sheet>> {
        let decoder = self.decoders.get(&kind).ok_or(Error::UnknownKind(kind))?;
        decoder(bytes)
    }
}

impl fmt::Debug for SheetRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.decoders.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        f.debug_struct("SheetRegistry").field("kinds", &kinds).finish()
    }
}

/// The edit that produced a checkpoint.
///
/// Passed explicitly to checkpoint operations by the request handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContext {
    /// Name of the user action (e.g. `"resize-column"`).
    pub event_name: String,
    /// Names of the assemblies or fields the action touched.
    pub affected_names: Vec<String>,
    /// Restoring this checkpoint requires a full runtime reinitialization.
    pub requires_reset: bool,
}

impl EventContext {
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            ..Default::default()
        }
    }

    pub fn with_affected(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.affected_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reset(mut self, requires_reset: bool) -> Self {
        self.requires_reset = requires_reset;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{NoteSheet, registry};

    #[test]
    fn test_kind_tags_roundtrip() {
        for kind in [SheetKind::Report, SheetKind::Worksheet, SheetKind::Dashboard] {
            assert_eq!(SheetKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(SheetKind::from_tag(0), None);
        assert_eq!(SheetKind::from_tag(200), None);
    }

    #[test]
    fn test_registry_rebuilds_registered_kind() {
        let sheet = NoteSheet::new("q1", &["a", "b"]);
        let bytes = Sheet::serialize(&sheet).unwrap();

        let rebuilt = registry().deserialize(SheetKind::Worksheet, &bytes).unwrap();
        assert_eq!(rebuilt.serialize().unwrap(), bytes);
    }

    #[test]
    fn test_registry_unknown_kind() {
        let result = SheetRegistry::new().deserialize(SheetKind::Dashboard, b"{}");
        assert!(matches!(result, Err(Error::UnknownKind(SheetKind::Dashboard))));
    }

    #[test]
    fn test_event_context_builder() {
        let ctx = EventContext::new("drag")
            .with_affected(["Chart1", "Table2"])
            .with_reset(true);
        assert_eq!(ctx.event_name, "drag");
        assert_eq!(ctx.affected_names, vec!["Chart1", "Table2"]);
        assert!(ctx.requires_reset);
    }
}
