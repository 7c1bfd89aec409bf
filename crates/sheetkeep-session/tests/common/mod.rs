//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::sync::broadcast;

use sheetkeep_session::{
    DirectoryConfig, DistributedCache, Error, MemoryGrid, RebalanceEvent, Result,
    SessionDirectory, SessionHandle, SessionState, Sheet, SheetEntry, SheetKind, SheetRegistry,
};

/// A report with a name and a list of `(label, amount)` rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSheet {
    pub name: String,
    pub rows: Vec<(String, i64)>,
}

impl LedgerSheet {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn with_row(mut self, label: &str, amount: i64) -> Self {
        self.rows.push((label.to_string(), amount));
        self
    }

    pub fn boxed(self) -> Box<dyn Sheet> {
        Box::new(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Box<dyn Sheet>> {
        let sheet: LedgerSheet =
            serde_json::from_slice(bytes).map_err(|e| Error::Sheet(e.to_string()))?;
        Ok(Box::new(sheet))
    }
}

impl Sheet for LedgerSheet {
    fn kind(&self) -> SheetKind {
        SheetKind::Report
    }

    fn clone_sheet(&self) -> Box<dyn Sheet> {
        Box::new(self.clone())
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Sheet(e.to_string()))
    }
}

pub fn registry() -> Arc<SheetRegistry> {
    Arc::new(SheetRegistry::new().with(SheetKind::Report, LedgerSheet::decode))
}

/// Decode a live sheet back into a [`LedgerSheet`].
pub fn ledger(sheet: &dyn Sheet) -> LedgerSheet {
    serde_json::from_slice(&sheet.serialize().unwrap()).unwrap()
}

pub fn entry(id: &str) -> SheetEntry {
    SheetEntry::new(format!("/reports/{id}"), SheetKind::Report)
}

/// A directory with background tasks off and its own swap directory.
pub fn directory<C: DistributedCache>(
    cache: C,
    config: DirectoryConfig,
) -> (TempDir, SessionDirectory<C>) {
    let dir = TempDir::new().unwrap();
    let config = config
        .with_swap_dir(dir.path())
        .with_background_tasks(false);
    let directory = SessionDirectory::new(cache, registry(), config).unwrap();
    (dir, directory)
}

/// Open a session on a fresh ledger named after `id` and let its
/// background mirror land.
pub async fn open<C: DistributedCache>(directory: &SessionDirectory<C>, id: &str) -> SessionHandle {
    let session = directory
        .open_session(id, entry(id), "ana", LedgerSheet::new(id).boxed())
        .await;
    tokio::task::yield_now().await;
    session
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}

/// A [`MemoryGrid`] view whose writes can be slowed down or refused.
#[derive(Clone)]
pub struct FaultyGrid {
    inner: MemoryGrid,
    put_delay: Duration,
    reject_puts: Arc<AtomicBool>,
}

impl FaultyGrid {
    pub fn new(inner: MemoryGrid) -> Self {
        Self {
            inner,
            put_delay: Duration::ZERO,
            reject_puts: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = delay;
        self
    }

    /// Refuse every `put` and `put_all` while set; reads keep working.
    pub fn reject_puts(&self, reject: bool) {
        self.reject_puts.store(reject, Ordering::SeqCst);
    }

    async fn before_put(&self) -> Result<()> {
        if !self.put_delay.is_zero() {
            tokio::time::sleep(self.put_delay).await;
        }
        if self.reject_puts.load(Ordering::SeqCst) {
            return Err(Error::Cache("writes refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DistributedCache for FaultyGrid {
    async fn get(&self, key: &str) -> Result<Option<SessionState>> {
        self.inner.get(key).await
    }

    async fn contains_key(&self, key: &str) -> Result<bool> {
        self.inner.contains_key(key).await
    }

    async fn put(&self, key: &str, value: SessionState) -> Result<()> {
        self.before_put().await?;
        self.inner.put(key, value).await
    }

    async fn put_all(&self, entries: Vec<(String, SessionState)>) -> Result<()> {
        self.before_put().await?;
        self.inner.put_all(entries).await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.inner.remove(key).await
    }

    async fn get_and_remove(&self, key: &str) -> Result<Option<SessionState>> {
        self.inner.get_and_remove(key).await
    }

    async fn remove_all(&self, keys: &[String]) -> Result<()> {
        self.inner.remove_all(keys).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.inner.keys().await
    }

    fn local_keys(&self, keys: &[String]) -> Vec<String> {
        self.inner.local_keys(keys)
    }

    fn subscribe(&self) -> broadcast::Receiver<RebalanceEvent> {
        self.inner.subscribe()
    }
}
