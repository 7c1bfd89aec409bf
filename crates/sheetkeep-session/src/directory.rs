//! Two-tier session directory: a local map mirrored into a distributed cache.
//!
//! The local tier is authoritative for every session it holds; the
//! distributed copy may lag until the next mirror or flush. One
//! reader-writer lock guards the local map. Session serialization happens
//! outside that lock except where a session is about to leave the local
//! tier (preview eviction, rebalance), in which case its state is written
//! back before it goes.
//!
//! Background mirrors are chained per session id: a later mirror waits for
//! the earlier one, and every awaited cache write or removal for an id
//! first waits for that id's pending mirror. A closed session therefore
//! cannot be written back into the cache by a mirror that lands late.
//!
//! Cache failures never reach the caller. They are logged and the local
//! state stays correct; the periodic [`SessionDirectory::flush_all`]
//! repairs the distributed copy. A session whose write-back fails stays
//! resident rather than being dropped from both tiers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sheetkeep_config::SheetkeepConfig;
use tokio::sync::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::DirectoryConfig;
use crate::error::{Error, Result};
use crate::grid::DistributedCache;
use crate::history::HistoryResources;
use crate::session::{SessionHandle, SheetSession};
use crate::sheet::{Sheet, SheetRegistry};
use crate::state::{SessionState, SheetEntry};
use crate::swap::SwapStore;

/// Floor for background task periods.
const MIN_TASK_PERIOD: std::time::Duration = std::time::Duration::from_millis(10);

/// Directory statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryStats {
    /// Sessions resident in the local tier.
    pub resident: usize,
    /// Resident sessions whose id carries the preview prefix.
    pub preview_resident: usize,
    /// Local residency cap, if enforced.
    pub cap: Option<usize>,
}

/// What a rebalance pass changed locally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceOutcome {
    /// Sessions dropped because another node now owns them.
    pub dropped: Vec<String>,
    /// Sessions hydrated because this node now owns them.
    pub hydrated: Vec<String>,
}

struct Shared<C: DistributedCache> {
    local: RwLock<HashMap<String, SessionHandle>>,
    cache: Arc<C>,
    config: DirectoryConfig,
    resources: HistoryResources,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Last background mirror started per session id.
    mirrors: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl<C: DistributedCache> Drop for Shared<C> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Local map of live sessions mirrored into a [`DistributedCache`].
///
/// Cloning yields another handle to the same directory. Background tasks
/// hold only weak references, so they stop once every handle is dropped
/// or [`SessionDirectory::close`] is called.
pub struct SessionDirectory<C: DistributedCache> {
    shared: Arc<Shared<C>>,
}

impl<C: DistributedCache> Clone for SessionDirectory<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: DistributedCache> SessionDirectory<C> {
    /// Create a directory over `cache`.
    ///
    /// Opens the swap directory. When background tasks are enabled they
    /// are spawned on the current Tokio runtime; outside a runtime they are
    /// skipped with a warning.
    pub fn new(cache: C, registry: Arc<SheetRegistry>, config: DirectoryConfig) -> Result<Self> {
        let swap = SwapStore::open(&config.swap_dir, config.delete_retry)?;
        let resources = HistoryResources::new(config.max_checkpoints, registry, swap);

        let directory = Self {
            shared: Arc::new(Shared {
                local: RwLock::new(HashMap::new()),
                cache: Arc::new(cache),
                config,
                resources,
                tasks: Mutex::new(Vec::new()),
                mirrors: Mutex::new(HashMap::new()),
            }),
        };

        if directory.shared.config.enable_background_tasks {
            directory.start_background_tasks();
        }

        debug!(
            cap = ?directory.shared.config.resident_cap,
            swap_dir = %directory.shared.config.swap_dir.display(),
            "Session directory created"
        );
        Ok(directory)
    }

    /// Create a directory from a loaded configuration file, rejecting
    /// settings the runtime cannot operate with.
    pub fn from_config(
        cache: C,
        registry: Arc<SheetRegistry>,
        config: &SheetkeepConfig,
    ) -> Result<Self> {
        config.validate()?;
        Self::new(cache, registry, DirectoryConfig::from_config(config))
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.shared.config
    }

    pub fn cache(&self) -> &C {
        &self.shared.cache
    }

    /// Resources new sessions should be opened with.
    pub fn resources(&self) -> &HistoryResources {
        &self.shared.resources
    }

    /// Open a new session on `sheet` and register it under `id`.
    pub async fn open_session(
        &self,
        id: &str,
        entry: SheetEntry,
        user: &str,
        sheet: Box<dyn Sheet>,
    ) -> SessionHandle {
        let session = Arc::new(SheetSession::open(
            id,
            entry,
            user,
            sheet,
            self.shared.resources.clone(),
        ));
        self.put(id, Arc::clone(&session)).await;
        session
    }

    /// Look up a session, hydrating it from the distributed cache on a
    /// local miss. Cache failures degrade to `None`.
    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        {
            let local = self.shared.local.read().await;
            if let Some(session) = local.get(id) {
                trace!(session_id = %id, "Session found locally");
                return Some(Arc::clone(session));
            }
        }

        match self.shared.cache.contains_key(id).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Distributed cache unavailable, treating as miss");
                return None;
            }
        }

        let mut local = self.shared.local.write().await;
        // Another task may have hydrated it while we waited for the lock
        if let Some(session) = local.get(id) {
            return Some(Arc::clone(session));
        }

        let session = self.hydrate(id).await?;
        local.insert(id.to_string(), Arc::clone(&session));
        debug!(session_id = %id, resident = local.len(), "Session hydrated from distributed cache");
        Some(session)
    }

    /// Like [`SessionDirectory::get`], but a miss is an error.
    pub async fn require(&self, id: &str) -> Result<SessionHandle> {
        self.get(id)
            .await
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Register `session` under `id` and mirror it in the background.
    ///
    /// When the residency cap is reached and `id` is new, one preview
    /// session is written back to the distributed cache and dropped from
    /// the local tier first.
    pub async fn put(&self, id: &str, session: SessionHandle) {
        let state = match session.to_state() {
            Ok(state) => state,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to serialize session, next flush will retry");
                None
            }
        };

        let mut local = self.shared.local.write().await;
        if let Some(cap) = self.shared.config.resident_cap
            && local.len() >= cap
            && !local.contains_key(id)
        {
            self.evict_preview(&mut local).await;
        }
        local.insert(id.to_string(), session);
        // Started under the lock so a concurrent close sees this mirror
        if let Some(state) = state {
            self.mirror(id, state);
        }
        trace!(session_id = %id, resident = local.len(), "Session registered");
    }

    /// Remove `id` from both tiers and hand the session to the caller.
    ///
    /// Unlike [`SessionDirectory::close_session`], this does not dispose
    /// the session: the caller takes ownership of a live session and may
    /// register it again. Its checkpoint swap files are released when the
    /// last handle drops or when the caller disposes it.
    ///
    /// A resident session's cache entry is removed in the background,
    /// after any mirror still pending for `id`. A session not resident
    /// locally is taken from the distributed cache in one atomic step.
    pub async fn remove(&self, id: &str) -> Option<SessionHandle> {
        let removed = self.shared.local.write().await.remove(id);
        if let Some(session) = removed {
            let directory = self.clone();
            let id = id.to_string();
            tokio::spawn(async move { directory.forget(&id).await });
            debug!(session_id = %session.id(), "Session removed");
            return Some(session);
        }
        self.take_from_cache(id).await
    }

    /// Remove `id` from both tiers and dispose it.
    ///
    /// The distributed entry is gone by the time this returns.
    pub async fn close_session(&self, id: &str) -> bool {
        let removed = self.shared.local.write().await.remove(id);
        let session = match removed {
            Some(session) => {
                self.forget(id).await;
                Some(session)
            }
            None => self.take_from_cache(id).await,
        };
        match session {
            Some(session) => {
                debug!(session_id = %id, "Session closed");
                session.dispose()
            }
            None => false,
        }
    }

    async fn take_from_cache(&self, id: &str) -> Option<SessionHandle> {
        self.settle_mirror(id).await;
        match self.shared.cache.get_and_remove(id).await {
            Ok(Some(state)) => match SheetSession::from_state(state, self.shared.resources.clone()) {
                Ok(session) => {
                    debug!(session_id = %id, "Session removed from distributed cache");
                    Some(Arc::new(session))
                }
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Removed session state could not be decoded");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to remove session from distributed cache");
                None
            }
        }
    }

    /// Write one session to the distributed cache now.
    ///
    /// A session that is not resident locally no longer exists on this
    /// node, so its cache entry is removed instead. Returns whether the
    /// cache accepted the update.
    pub async fn flush(&self, id: &str) -> bool {
        let session = self.shared.local.read().await.get(id).cloned();

        let state = match session {
            Some(session) => match session.to_state() {
                Ok(state) => state,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Failed to serialize session for flush");
                    return false;
                }
            },
            None => None,
        };

        self.settle_mirror(id).await;
        let outcome = match state {
            Some(state) => self.shared.cache.put(id, state).await,
            None => self.shared.cache.remove(id).await.map(|_| ()),
        };
        match outcome {
            Ok(()) => {
                trace!(session_id = %id, "Session flushed");
                true
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to flush session");
                false
            }
        }
    }

    /// Write every locally owned resident session to the distributed cache
    /// in one batch. Returns how many sessions were written.
    pub async fn flush_all(&self) -> usize {
        let cache_keys = match self.shared.cache.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to list distributed keys for flush");
                return 0;
            }
        };

        let targets: Vec<(String, SessionHandle)> = {
            let local = self.shared.local.write().await;
            let owned = self.owned_keys(local.keys().cloned(), cache_keys);
            owned
                .into_iter()
                .filter_map(|id| local.get(&id).map(|s| (id, Arc::clone(s))))
                .collect()
        };

        let mut batch = Vec::with_capacity(targets.len());
        for (id, session) in targets {
            self.settle_mirror(&id).await;
            match session.to_state() {
                Ok(Some(state)) => batch.push((id, state)),
                Ok(None) => {}
                Err(e) => warn!(session_id = %id, error = %e, "Failed to serialize session, skipping"),
            }
        }

        let count = batch.len();
        if count == 0 {
            return 0;
        }
        match self.shared.cache.put_all(batch).await {
            Ok(()) => {
                debug!(count, "Flushed sessions to distributed cache");
                count
            }
            Err(e) => {
                warn!(count, error = %e, "Batch flush failed");
                0
            }
        }
    }

    /// Reconcile the local tier with the current cluster partitioning.
    ///
    /// Sessions this node no longer owns are written back and dropped
    /// locally; owned sessions missing locally are hydrated. Running it
    /// twice without a topology change is a no-op.
    pub async fn handle_rebalance(&self) -> RebalanceOutcome {
        let cache_keys = match self.shared.cache.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to list distributed keys for rebalance");
                return RebalanceOutcome::default();
            }
        };
        let cached: HashSet<String> = cache_keys.iter().cloned().collect();

        let mut local = self.shared.local.write().await;
        let owned: HashSet<String> = self
            .owned_keys(local.keys().cloned(), cache_keys)
            .into_iter()
            .collect();
        let mut outcome = RebalanceOutcome::default();

        let unowned: Vec<String> = local
            .keys()
            .filter(|id| !owned.contains(*id))
            .cloned()
            .collect();
        for id in unowned {
            let Some(session) = local.get(&id).cloned() else {
                continue;
            };
            if self.write_back(&id, &session).await {
                local.remove(&id);
                outcome.dropped.push(id);
            } else {
                warn!(session_id = %id, "Keeping unowned session resident until it can be written back");
            }
        }

        let mut newly_owned: Vec<&String> = owned
            .iter()
            .filter(|id| !local.contains_key(*id) && cached.contains(*id))
            .collect();
        newly_owned.sort();
        for id in newly_owned {
            if let Some(session) = self.hydrate(id).await {
                local.insert(id.clone(), session);
                outcome.hydrated.push(id.clone());
            }
        }

        info!(
            dropped = outcome.dropped.len(),
            hydrated = outcome.hydrated.len(),
            resident = local.len(),
            "Rebalance handled"
        );
        outcome
    }

    /// Whether `id` exists in either tier.
    pub async fn contains_key(&self, id: &str) -> bool {
        if self.shared.local.read().await.contains_key(id) {
            return true;
        }
        self.shared.cache.contains_key(id).await.unwrap_or_else(|e| {
            warn!(session_id = %id, error = %e, "Distributed cache unavailable");
            false
        })
    }

    /// Whether `id` is resident in the local tier.
    pub async fn is_resident(&self, id: &str) -> bool {
        self.shared.local.read().await.contains_key(id)
    }

    /// Number of locally resident sessions.
    pub async fn len(&self) -> usize {
        self.shared.local.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.shared.local.read().await.is_empty()
    }

    /// Snapshot of locally resident ids.
    pub async fn keys(&self) -> Vec<String> {
        self.shared.local.read().await.keys().cloned().collect()
    }

    /// Snapshot of locally resident sessions.
    pub async fn values(&self) -> Vec<SessionHandle> {
        self.shared.local.read().await.values().cloned().collect()
    }

    /// Snapshot of locally resident `(id, session)` pairs.
    pub async fn entries(&self) -> Vec<(String, SessionHandle)> {
        self.shared
            .local
            .read()
            .await
            .iter()
            .map(|(id, s)| (id.clone(), Arc::clone(s)))
            .collect()
    }

    /// Keep only the resident sessions for which `keep` returns true.
    /// The rest are closed through both tiers. Returns how many were closed.
    pub async fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&str, &SheetSession) -> bool,
    {
        let rejected: Vec<String> = self
            .shared
            .local
            .read()
            .await
            .iter()
            .filter(|(id, session)| !keep(id, session))
            .map(|(id, _)| id.clone())
            .collect();

        let mut closed = 0;
        for id in rejected {
            if self.close_session(&id).await {
                closed += 1;
            }
        }
        closed
    }

    /// Dispose every resident session and delete it from both tiers.
    pub async fn clear(&self) -> usize {
        let drained: Vec<(String, SessionHandle)> =
            self.shared.local.write().await.drain().collect();
        let ids: Vec<String> = drained.iter().map(|(id, _)| id.clone()).collect();
        for id in &ids {
            self.settle_mirror(id).await;
        }

        if let Err(e) = self.shared.cache.remove_all(&ids).await {
            warn!(count = ids.len(), error = %e, "Failed to remove cleared sessions from distributed cache");
        }
        for (_, session) in &drained {
            session.dispose();
        }
        debug!(count = drained.len(), "Directory cleared");
        drained.len()
    }

    /// Drop local residency for every session. The distributed tier and
    /// the sessions themselves are untouched.
    pub async fn clear_local(&self) {
        self.shared.local.write().await.clear();
    }

    /// Close sessions idle for longer than the configured timeout, along
    /// with any that were disposed behind the directory's back.
    pub async fn sweep_idle(&self, now: DateTime<Utc>) -> usize {
        let timeout = self.shared.config.idle_timeout;
        let expired: Vec<String> = self
            .shared
            .local
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.is_disposed() || s.idle_for(now) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let mut closed = 0;
        for id in expired {
            let removed = self.shared.local.write().await.remove(&id);
            if let Some(session) = removed {
                self.forget(&id).await;
                session.dispose();
                closed += 1;
            }
        }
        if closed > 0 {
            info!(count = closed, "Idle sessions closed");
        }
        closed
    }

    /// Swap every resident checkpoint of every local session to disk.
    pub async fn swap_all_checkpoints(&self) -> usize {
        let sessions = self.values().await;
        let swapped: usize = sessions.iter().map(|s| s.swap_checkpoints()).sum();
        debug!(sessions = sessions.len(), swapped, "Checkpoints swapped under memory pressure");
        swapped
    }

    pub async fn stats(&self) -> DirectoryStats {
        let local = self.shared.local.read().await;
        DirectoryStats {
            resident: local.len(),
            preview_resident: local
                .keys()
                .filter(|id| self.shared.config.is_preview(id))
                .count(),
            cap: self.shared.config.resident_cap,
        }
    }

    /// Stop the background flush, idle sweep and rebalance tasks.
    ///
    /// Remaining sessions are not flushed; callers that need durability at
    /// shutdown call [`SessionDirectory::flush_all`] first.
    pub fn close(&self) {
        let tasks: Vec<JoinHandle<()>> = self.shared.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        debug!(tasks = tasks.len(), "Session directory closed");
    }

    /// Number of background tasks still running.
    pub fn running_tasks(&self) -> usize {
        self.shared
            .tasks
            .lock()
            .iter()
            .filter(|t| !t.is_finished())
            .count()
    }

    async fn hydrate(&self, id: &str) -> Option<SessionHandle> {
        let state = match self.shared.cache.get(id).await {
            Ok(Some(state)) => state,
            Ok(None) => return None,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to read session from distributed cache");
                return None;
            }
        };
        match SheetSession::from_state(state, self.shared.resources.clone()) {
            Ok(session) => Some(Arc::new(session)),
            Err(e) => {
                warn!(session_id = %id, error = %e, "Cached session state could not be decoded");
                None
            }
        }
    }

    /// Evict the least recently used preview that can be written back.
    /// A preview whose write-back fails stays resident and the next one is
    /// tried; when none can leave, the cap is exceeded.
    async fn evict_preview(&self, local: &mut HashMap<String, SessionHandle>) {
        let mut previews: Vec<(String, SessionHandle)> = local
            .iter()
            .filter(|(id, _)| self.shared.config.is_preview(id))
            .map(|(id, s)| (id.clone(), Arc::clone(s)))
            .collect();
        previews.sort_by_key(|(_, s)| s.accessed_at());

        for (victim, session) in previews {
            if self.write_back(&victim, &session).await {
                local.remove(&victim);
                debug!(session_id = %victim, "Preview session evicted from local tier");
                return;
            }
        }
        debug!(resident = local.len(), "Residency cap reached with no evictable preview session");
    }

    /// Persist a session that is leaving the local tier. A disposed
    /// session is no longer wanted, so its cache entry is dropped.
    /// Returns whether the cache accepted the update.
    async fn write_back(&self, id: &str, session: &SheetSession) -> bool {
        self.settle_mirror(id).await;
        let outcome = match session.to_state() {
            Ok(Some(state)) => self.shared.cache.put(id, state).await,
            Ok(None) => self.shared.cache.remove(id).await.map(|_| ()),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to write back session leaving local tier");
                false
            }
        }
    }

    /// Mirror `state` in the background once the previous mirror for `id`
    /// has landed.
    fn mirror(&self, id: &str, state: SessionState) {
        let cache = Arc::clone(&self.shared.cache);
        let key = id.to_string();
        let mut mirrors = self.shared.mirrors.lock();
        mirrors.retain(|_, task| !task.is_finished());
        let previous = mirrors.remove(id);

        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if let Err(e) = cache.put(&key, state).await {
                warn!(session_id = %key, error = %e, "Background mirror failed");
            }
        });
        mirrors.insert(id.to_string(), task);
    }

    /// Wait for the pending mirror of `id`, if any.
    async fn settle_mirror(&self, id: &str) {
        let pending = self.shared.mirrors.lock().remove(id);
        if let Some(task) = pending
            && let Err(e) = task.await
        {
            warn!(session_id = %id, error = %e, "Background mirror did not complete");
        }
    }

    /// Delete the cache entry of `id` after its pending mirror.
    async fn forget(&self, id: &str) {
        self.settle_mirror(id).await;
        if let Err(e) = self.shared.cache.remove(id).await {
            warn!(session_id = %id, error = %e, "Failed to remove session from distributed cache");
        }
    }

    fn owned_keys(&self, local: impl Iterator<Item = String>, cached: Vec<String>) -> Vec<String> {
        let mut union: Vec<String> = local.chain(cached).collect();
        union.sort();
        union.dedup();
        self.shared.cache.local_keys(&union)
    }

    fn start_background_tasks(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("No Tokio runtime, background tasks not started");
            return;
        }
        let config = &self.shared.config;
        let weak = Arc::downgrade(&self.shared);
        let mut events = self.shared.cache.subscribe();

        let flush = spawn_periodic(weak.clone(), config.flush_interval, |directory| async move {
            directory.flush_all().await;
        });
        let sweep = spawn_periodic(weak.clone(), config.idle_sweep_interval, |directory| async move {
            directory.sweep_idle(Utc::now()).await;
        });
        let rebalance = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        let Some(shared) = weak.upgrade() else { break };
                        SessionDirectory { shared }.handle_rebalance().await;
                    }
                    Err(RecvError::Closed) => {
                        debug!("Rebalance channel closed, stopping listener");
                        break;
                    }
                }
            }
        });

        self.shared.tasks.lock().extend([flush, sweep, rebalance]);
    }
}

fn spawn_periodic<C, F, Fut>(
    weak: Weak<Shared<C>>,
    period: std::time::Duration,
    mut run: F,
) -> JoinHandle<()>
where
    C: DistributedCache,
    F: FnMut(SessionDirectory<C>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(MIN_TASK_PERIOD));
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(shared) = weak.upgrade() else { break };
            run(SessionDirectory { shared }).await;
        }
    })
}

impl<C: DistributedCache> std::fmt::Debug for SessionDirectory<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDirectory")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}
