//! A live editing session: one user, one sheet, one checkpoint history.
//!
//! Every operation takes the session's own lock, so checkpoint operations
//! on one session are strictly ordered and never block other sessions.
//!
//! After [`SheetSession::dispose`] the session is permanently inert: every
//! operation returns `false`/`None` and mutates nothing. The idle sweep can
//! dispose a session while a request still holds it, so this is the normal
//! outcome of that race rather than an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::Result;
use crate::history::{CheckpointStore, HistoryResources};
use crate::sheet::{EventContext, Sheet};
use crate::state::{SessionState, SheetEntry};
use crate::undo::{Restored, UndoController};

/// Outcome of a successful undo, redo or rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreInfo {
    /// Checkpoint the live sheet now mirrors.
    pub index: usize,
    /// The caller must rebuild derived runtime structures.
    pub requires_reset: bool,
}

struct SessionInner {
    entry: SheetEntry,
    user: String,
    editable: bool,
    lock_owner: Option<String>,
    created_at: DateTime<Utc>,
    accessed_at: DateTime<Utc>,
    heartbeat_at: DateTime<Utc>,
    disposed: bool,
    sheet: Option<Box<dyn Sheet>>,
    history: UndoController,
}

/// An open sheet bound to a user and its undo/redo history.
pub struct SheetSession {
    id: String,
    inner: Mutex<SessionInner>,
}

/// Shared handle to a session.
pub type SessionHandle = Arc<SheetSession>;

impl SheetSession {
    /// Open a session on `sheet`, recording it as the first checkpoint.
    pub fn open(
        id: impl Into<String>,
        entry: SheetEntry,
        user: impl Into<String>,
        sheet: Box<dyn Sheet>,
        resources: HistoryResources,
    ) -> Self {
        let now = Utc::now();
        let mut history = UndoController::new(CheckpointStore::new(resources));
        history.add(sheet.clone_sheet(), EventContext::new("open"));
        history.store_mut().mark_saved();

        let id = id.into();
        debug!(session_id = %id, path = %entry.path, "Session opened");
        Self {
            id,
            inner: Mutex::new(SessionInner {
                entry,
                user: user.into(),
                editable: true,
                lock_owner: None,
                created_at: now,
                accessed_at: now,
                heartbeat_at: now,
                disposed: false,
                sheet: Some(sheet),
                history,
            }),
        }
    }

    /// Rebuild a session from its mirrored state.
    ///
    /// Fails only if the live sheet itself cannot be decoded; unreadable
    /// checkpoints come back as invalid entries that refuse to restore.
    pub fn from_state(state: SessionState, resources: HistoryResources) -> Result<Self> {
        let sheet = resources.registry.deserialize(state.sheet_kind, &state.sheet)?;
        let resources = HistoryResources {
            max_checkpoints: state.max_checkpoints.max(1),
            ..resources
        };
        let store = CheckpointStore::import(
            resources,
            state.checkpoints,
            state.pointer,
            state.save_point,
        );

        trace!(session_id = %state.id, checkpoints = store.len(), "Session rebuilt from state");
        Ok(Self {
            id: state.id,
            inner: Mutex::new(SessionInner {
                entry: state.entry,
                user: state.user,
                editable: state.editable,
                lock_owner: state.lock_owner,
                created_at: state.created_at,
                accessed_at: state.accessed_at,
                heartbeat_at: state.heartbeat_at,
                disposed: false,
                sheet: Some(sheet),
                history: UndoController::new(store),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entry(&self) -> SheetEntry {
        self.inner.lock().entry.clone()
    }

    pub fn user(&self) -> String {
        self.inner.lock().user.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    pub fn is_editable(&self) -> bool {
        let inner = self.inner.lock();
        !inner.disposed && inner.editable
    }

    pub fn set_editable(&self, editable: bool) -> bool {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return false;
        }
        inner.editable = editable;
        true
    }

    pub fn lock_owner(&self) -> Option<String> {
        self.inner.lock().lock_owner.clone()
    }

    /// Take the edit lock for `user`. Re-entrant for the current owner.
    pub fn lock(&self, user: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return false;
        }
        match inner.lock_owner.as_deref() {
            Some(owner) if owner != user => false,
            _ => {
                inner.lock_owner = Some(user.to_string());
                true
            }
        }
    }

    /// Release the edit lock if `user` holds it.
    pub fn unlock(&self, user: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.disposed || inner.lock_owner.as_deref() != Some(user) {
            return false;
        }
        inner.lock_owner = None;
        true
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.lock().created_at
    }

    pub fn accessed_at(&self) -> DateTime<Utc> {
        self.inner.lock().accessed_at
    }

    pub fn heartbeat_at(&self) -> DateTime<Utc> {
        self.inner.lock().heartbeat_at
    }

    /// Record a request touching this session.
    pub fn touch(&self) {
        let mut inner = self.inner.lock();
        if !inner.disposed {
            inner.accessed_at = Utc::now();
        }
    }

    /// Record a client keep-alive.
    pub fn heartbeat(&self) {
        let mut inner = self.inner.lock();
        if !inner.disposed {
            inner.heartbeat_at = Utc::now();
        }
    }

    /// Time since the later of the last access and the last heartbeat.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        let inner = self.inner.lock();
        let last = inner.accessed_at.max(inner.heartbeat_at);
        (now - last).to_std().unwrap_or(Duration::ZERO)
    }

    /// Run `f` against the live sheet.
    pub fn with_sheet<R>(&self, f: impl FnOnce(&dyn Sheet) -> R) -> Option<R> {
        let inner = self.inner.lock();
        if inner.disposed {
            return None;
        }
        inner.sheet.as_deref().map(|sheet| f(sheet))
    }

    /// Install a new live sheet. Not checkpointed until
    /// [`SheetSession::add_checkpoint`] or [`SheetSession::replace_checkpoint`].
    pub fn set_sheet(&self, sheet: Box<dyn Sheet>) -> bool {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return false;
        }
        inner.sheet = Some(sheet);
        inner.accessed_at = Utc::now();
        true
    }

    /// Snapshot the live sheet as a new checkpoint.
    pub fn add_checkpoint(&self, context: EventContext) -> Option<usize> {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return None;
        }
        let snapshot = inner.sheet.as_ref()?.clone_sheet();
        inner.accessed_at = Utc::now();
        let index = inner.history.add(snapshot, context);
        trace!(session_id = %self.id, ?index, "Checkpoint added");
        index
    }

    /// Overwrite the newest checkpoint with the live sheet, for continuous
    /// edits that should not flood the history.
    pub fn replace_checkpoint(&self, context: EventContext) -> Option<usize> {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return None;
        }
        let snapshot = inner.sheet.as_ref()?.clone_sheet();
        inner.accessed_at = Utc::now();
        inner.history.replace(snapshot, context)
    }

    /// Step back one checkpoint and install it as the live sheet.
    pub fn undo(&self) -> Option<RestoreInfo> {
        self.step(UndoController::undo)
    }

    /// Step forward one checkpoint and install it as the live sheet.
    pub fn redo(&self) -> Option<RestoreInfo> {
        self.step(UndoController::redo)
    }

    /// Discard live mutations by reinstalling the newest checkpoint.
    pub fn rollback(&self) -> Option<RestoreInfo> {
        self.step(UndoController::rollback)
    }

    fn step(
        &self,
        op: impl FnOnce(&mut UndoController) -> Option<Restored>,
    ) -> Option<RestoreInfo> {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return None;
        }
        let restored = op(&mut inner.history)?;
        inner.sheet = Some(restored.sheet);
        inner.accessed_at = Utc::now();
        Some(RestoreInfo {
            index: restored.index,
            requires_reset: restored.requires_reset,
        })
    }

    pub fn can_undo(&self) -> bool {
        let inner = self.inner.lock();
        !inner.disposed && inner.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        let inner = self.inner.lock();
        !inner.disposed && inner.history.can_redo()
    }

    pub fn checkpoint_count(&self) -> usize {
        self.inner.lock().history.store().len()
    }

    pub fn pointer(&self) -> Option<usize> {
        self.inner.lock().history.store().pointer()
    }

    /// Event name of each checkpoint, oldest first.
    pub fn history_events(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let store = inner.history.store();
        (0..store.len())
            .filter_map(|i| store.context(i).map(|c| c.event_name.clone()))
            .collect()
    }

    /// Record the current checkpoint as persisted.
    pub fn mark_saved(&self) {
        let mut inner = self.inner.lock();
        if !inner.disposed {
            inner.history.store_mut().mark_saved();
        }
    }

    pub fn is_modified(&self) -> bool {
        let inner = self.inner.lock();
        !inner.disposed && inner.history.store().is_modified()
    }

    /// Swap one checkpoint to disk.
    pub fn swap_checkpoint(&self, index: usize) -> bool {
        let mut inner = self.inner.lock();
        !inner.disposed && inner.history.store_mut().swap(index)
    }

    /// Swap every resident checkpoint to disk; returns how many moved.
    pub fn swap_checkpoints(&self) -> usize {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return 0;
        }
        inner.history.store_mut().swap_all()
    }

    /// Serializable projection, or `None` once disposed.
    pub fn to_state(&self) -> Result<Option<SessionState>> {
        let inner = self.inner.lock();
        if inner.disposed {
            return Ok(None);
        }
        let Some(sheet) = inner.sheet.as_ref() else {
            return Ok(None);
        };
        let store = inner.history.store();

        Ok(Some(SessionState {
            id: self.id.clone(),
            entry: inner.entry.clone(),
            user: inner.user.clone(),
            editable: inner.editable,
            lock_owner: inner.lock_owner.clone(),
            created_at: inner.created_at,
            accessed_at: inner.accessed_at,
            heartbeat_at: inner.heartbeat_at,
            sheet_kind: sheet.kind(),
            sheet: sheet.serialize()?,
            checkpoints: store.export(),
            pointer: store.pointer(),
            save_point: store.save_point(),
            max_checkpoints: store.max(),
        }))
    }

    /// Release the sheet, the history and its swap files. Returns `true`
    /// only for the call that actually disposed the session.
    pub fn dispose(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return false;
        }
        inner.disposed = true;
        inner.sheet = None;
        inner.lock_owner = None;
        inner.history.store_mut().dispose();
        debug!(session_id = %self.id, "Session disposed");
        true
    }
}

impl std::fmt::Debug for SheetSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SheetSession")
            .field("id", &self.id)
            .field("path", &inner.entry.path)
            .field("user", &inner.user)
            .field("disposed", &inner.disposed)
            .field("checkpoints", &inner.history.store().len())
            .finish()
    }
}
