//! Distributed cache contract and an in-process implementation.
//!
//! The session directory mirrors every session into a [`DistributedCache`]
//! so that other nodes can serve it after failover. The cache also owns
//! the cluster partitioning function ([`DistributedCache::local_keys`]) and
//! announces topology changes through [`DistributedCache::subscribe`].

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::state::SessionState;

/// Capacity of the rebalance notification channel.
const REBALANCE_CHANNEL_CAPACITY: usize = 64;

/// Cluster topology changed; key ownership must be recomputed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceEvent {
    /// Monotonic topology version.
    pub version: u64,
    /// Members after the change, sorted.
    pub members: Vec<String>,
}

/// Cluster-wide `session id -> SessionState` map.
///
/// Implementations are expected to be cheap to share across tasks. Writes
/// issued by the directory in the background are fire-and-forget; reads
/// used to hydrate a session are awaited.
#[async_trait]
pub trait DistributedCache: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<SessionState>>;

    async fn contains_key(&self, key: &str) -> Result<bool>;

    async fn put(&self, key: &str, value: SessionState) -> Result<()>;

    async fn put_all(&self, entries: Vec<(String, SessionState)>) -> Result<()>;

    /// Remove `key`; returns whether it was present.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Atomically remove `key` and return its last value.
    async fn get_and_remove(&self, key: &str) -> Result<Option<SessionState>>;

    async fn remove_all(&self, keys: &[String]) -> Result<()>;

    /// Every key in the cache, on all nodes.
    async fn keys(&self) -> Result<Vec<String>>;

    /// The subset of `keys` this node owns under the current partitioning.
    fn local_keys(&self, keys: &[String]) -> Vec<String>;

    /// Receive a notification on every topology change.
    fn subscribe(&self) -> broadcast::Receiver<RebalanceEvent>;
}

struct GridShared {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    members: RwLock<Vec<String>>,
    version: AtomicU64,
    events: broadcast::Sender<RebalanceEvent>,
    available: AtomicBool,
}

/// In-process [`DistributedCache`] shared by any number of node views.
///
/// Values are stored encoded, so every read yields an independent copy as
/// a networked cache would. Keys are hash-partitioned across the sorted
/// member list.
#[derive(Clone)]
pub struct MemoryGrid {
    node: String,
    shared: Arc<GridShared>,
}

impl MemoryGrid {
    /// A single-member grid.
    pub fn new(node: impl Into<String>) -> Self {
        let node = node.into();
        let (events, _) = broadcast::channel(REBALANCE_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(GridShared {
                entries: RwLock::new(HashMap::new()),
                members: RwLock::new(vec![node.clone()]),
                version: AtomicU64::new(1),
                events,
                available: AtomicBool::new(true),
            }),
            node,
        }
    }

    /// Add a member and return its view of the shared grid.
    pub fn join(&self, node: impl Into<String>) -> MemoryGrid {
        let node = node.into();
        {
            let mut members = self.shared.members.write();
            if !members.contains(&node) {
                members.push(node.clone());
                members.sort();
            }
        }
        info!(node = %node, "Node joined grid");
        self.announce();
        MemoryGrid {
            node,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Remove this view's member from the grid.
    pub fn leave(&self) {
        self.shared.members.write().retain(|m| m != &self.node);
        info!(node = %self.node, "Node left grid");
        self.announce();
    }

    pub fn node_id(&self) -> &str {
        &self.node
    }

    pub fn members(&self) -> Vec<String> {
        self.shared.members.read().clone()
    }

    pub fn len(&self) -> usize {
        self.shared.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.read().is_empty()
    }

    /// Simulate the grid becoming (un)reachable.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::Release);
    }

    /// Member owning `key`, if any members remain.
    pub fn owner_of(&self, key: &str) -> Option<String> {
        let members = self.shared.members.read();
        if members.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let slot = (hasher.finish() % members.len() as u64) as usize;
        Some(members[slot].clone())
    }

    fn announce(&self) {
        let event = RebalanceEvent {
            version: self.shared.version.fetch_add(1, Ordering::AcqRel) + 1,
            members: self.members(),
        };
        debug!(version = event.version, members = ?event.members, "Announcing rebalance");
        // No receivers is fine: nobody is listening yet.
        let _ = self.shared.events.send(event);
    }

    fn check_available(&self) -> Result<()> {
        if self.shared.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::Cache(format!("grid unreachable from {}", self.node)))
        }
    }

    fn decode(bytes: Option<Vec<u8>>) -> Result<Option<SessionState>> {
        bytes.map(|b| SessionState::decode(&b)).transpose()
    }
}

impl std::fmt::Debug for MemoryGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGrid")
            .field("node", &self.node)
            .field("members", &self.members())
            .field("entries", &self.len())
            .finish()
    }
}

#[async_trait]
impl DistributedCache for MemoryGrid {
    async fn get(&self, key: &str) -> Result<Option<SessionState>> {
        self.check_available()?;
        let bytes = self.shared.entries.read().get(key).cloned();
        Self::decode(bytes)
    }

    async fn contains_key(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.shared.entries.read().contains_key(key))
    }

    async fn put(&self, key: &str, value: SessionState) -> Result<()> {
        self.check_available()?;
        let bytes = value.encode()?;
        self.shared.entries.write().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn put_all(&self, entries: Vec<(String, SessionState)>) -> Result<()> {
        self.check_available()?;
        let encoded = entries
            .into_iter()
            .map(|(key, value)| value.encode().map(|bytes| (key, bytes)))
            .collect::<Result<Vec<_>>>()?;
        self.shared.entries.write().extend(encoded);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.shared.entries.write().remove(key).is_some())
    }

    async fn get_and_remove(&self, key: &str) -> Result<Option<SessionState>> {
        self.check_available()?;
        let bytes = self.shared.entries.write().remove(key);
        Self::decode(bytes)
    }

    async fn remove_all(&self, keys: &[String]) -> Result<()> {
        self.check_available()?;
        let mut entries = self.shared.entries.write();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(self.shared.entries.read().keys().cloned().collect())
    }

    fn local_keys(&self, keys: &[String]) -> Vec<String> {
        keys.iter()
            .filter(|key| self.owner_of(key).as_deref() == Some(self.node.as_str()))
            .cloned()
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<RebalanceEvent> {
        self.shared.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet::SheetKind;
    use crate::state::SheetEntry;
    use chrono::Utc;

    fn state(id: &str) -> SessionState {
        let now = Utc::now();
        SessionState {
            id: id.to_string(),
            entry: SheetEntry::new(format!("/sheets/{id}"), SheetKind::Worksheet),
            user: "ana".to_string(),
            editable: true,
            lock_owner: None,
            created_at: now,
            accessed_at: now,
            heartbeat_at: now,
            sheet_kind: SheetKind::Worksheet,
            sheet: b"{}".to_vec(),
            checkpoints: Vec::new(),
            pointer: None,
            save_point: None,
            max_checkpoints: 10,
        }
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let grid = MemoryGrid::new("n1");
        grid.put("s1", state("s1")).await.unwrap();

        assert!(grid.contains_key("s1").await.unwrap());
        assert_eq!(grid.get("s1").await.unwrap().unwrap().id, "s1");
        assert!(grid.remove("s1").await.unwrap());
        assert!(!grid.remove("s1").await.unwrap());
        assert!(grid.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_and_remove() {
        let grid = MemoryGrid::new("n1");
        grid.put_all(vec![("a".into(), state("a")), ("b".into(), state("b"))])
            .await
            .unwrap();

        let removed = grid.get_and_remove("a").await.unwrap().unwrap();
        assert_eq!(removed.id, "a");
        assert!(grid.get_and_remove("a").await.unwrap().is_none());
        assert_eq!(grid.keys().await.unwrap(), vec!["b".to_string()]);

        grid.remove_all(&["b".to_string()]).await.unwrap();
        assert!(grid.is_empty());
    }

    #[tokio::test]
    async fn test_single_member_owns_everything() {
        let grid = MemoryGrid::new("n1");
        let keys: Vec<String> = (0..10).map(|i| format!("s{i}")).collect();
        assert_eq!(grid.local_keys(&keys), keys);
    }

    #[tokio::test]
    async fn test_partition_splits_keys_between_members() {
        let n1 = MemoryGrid::new("n1");
        let n2 = n1.join("n2");
        let keys: Vec<String> = (0..50).map(|i| format!("s{i}")).collect();

        let mine = n1.local_keys(&keys);
        let theirs = n2.local_keys(&keys);
        assert_eq!(mine.len() + theirs.len(), keys.len());
        assert!(mine.iter().all(|k| !theirs.contains(k)));
        assert!(!mine.is_empty() && !theirs.is_empty());
    }

    #[tokio::test]
    async fn test_join_and_leave_notify_subscribers() {
        let n1 = MemoryGrid::new("n1");
        let mut events = n1.subscribe();

        let n2 = n1.join("n2");
        let joined = events.recv().await.unwrap();
        assert_eq!(joined.members, vec!["n1".to_string(), "n2".to_string()]);

        n2.leave();
        let left = events.recv().await.unwrap();
        assert_eq!(left.members, vec!["n1".to_string()]);
        assert!(left.version > joined.version);
    }

    #[tokio::test]
    async fn test_unavailable_grid_errors() {
        let grid = MemoryGrid::new("n1");
        grid.set_available(false);
        assert!(matches!(grid.get("s1").await, Err(Error::Cache(_))));
        assert!(matches!(grid.put("s1", state("s1")).await, Err(Error::Cache(_))));

        grid.set_available(true);
        assert!(grid.get("s1").await.unwrap().is_none());
    }
}
