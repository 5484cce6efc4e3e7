use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::records::{
    ItemVisibility, P2pOrder, PeerConnection, PeerInvitation, PeerRecord, Record,
};

/// Per-entity persistence contract. The core performs all filtering in
/// memory over `list()`; backends only need the five primitives.
#[async_trait]
pub trait RecordStore<T: Record>: Send + Sync {
    async fn add(&self, record: &T) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<T>>;
    async fn update(&self, record: &T) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<T>>;
}

/// Map-backed store. Adding an existing id overwrites (last write wins,
/// matching the upsert semantics callers rely on for visibility records).
pub struct MemoryStore<T: Record> {
    records: RwLock<HashMap<String, T>>,
}

impl<T: Record> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Record> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Record> RecordStore<T> for MemoryStore<T> {
    async fn add(&self, record: &T) -> Result<()> {
        self.records
            .write()
            .insert(record.id().to_string(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<T>> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn update(&self, record: &T) -> Result<()> {
        let mut records = self.records.write();
        if !records.contains_key(record.id()) {
            return Err(StoreError::NotFound(record.id().to_string()));
        }
        records.insert(record.id().to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.write().remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<T>> {
        Ok(self.records.read().values().cloned().collect())
    }
}

/// Single source of truth for all trust entities. The core never caches
/// a record across an operation boundary; status fields are re-read from
/// here at decision time.
#[derive(Clone)]
pub struct TrustStore {
    pub peers: Arc<dyn RecordStore<PeerRecord>>,
    pub connections: Arc<dyn RecordStore<PeerConnection>>,
    pub invitations: Arc<dyn RecordStore<PeerInvitation>>,
    pub visibilities: Arc<dyn RecordStore<ItemVisibility>>,
    pub orders: Arc<dyn RecordStore<P2pOrder>>,
}

impl TrustStore {
    pub fn in_memory() -> Self {
        Self {
            peers: Arc::new(MemoryStore::new()),
            connections: Arc::new(MemoryStore::new()),
            invitations: Arc::new(MemoryStore::new()),
            visibilities: Arc::new(MemoryStore::new()),
            orders: Arc::new(MemoryStore::new()),
        }
    }

    /// The single Peer record representing this installation, if any.
    pub async fn self_peer(&self) -> Result<Option<PeerRecord>> {
        Ok(self.peers.list().await?.into_iter().next())
    }

    /// Install a new self identity, superseding any previous one.
    pub async fn set_self_peer(&self, peer: &PeerRecord) -> Result<()> {
        for existing in self.peers.list().await? {
            self.peers.delete(existing.id()).await?;
        }
        self.peers.add(peer).await
    }

    /// Connection linking the unordered pair, regardless of orientation.
    pub async fn connection_between(&self, a: &str, b: &str) -> Result<Option<PeerConnection>> {
        Ok(self
            .connections
            .list()
            .await?
            .into_iter()
            .find(|c| c.links(a, b)))
    }

    pub async fn connections_involving(&self, peer_id: &str) -> Result<Vec<PeerConnection>> {
        Ok(self
            .connections
            .list()
            .await?
            .into_iter()
            .filter(|c| c.involves(peer_id))
            .collect())
    }

    pub async fn invitation_by_code(&self, code: &str) -> Result<Option<PeerInvitation>> {
        Ok(self
            .invitations
            .list()
            .await?
            .into_iter()
            .find(|inv| inv.invitation_code == code))
    }

    /// The authoritative visibility record for an item, if one exists.
    pub async fn visibility_for_item(&self, item_id: &str) -> Result<Option<ItemVisibility>> {
        Ok(self
            .visibilities
            .list()
            .await?
            .into_iter()
            .find(|v| v.item_id == item_id))
    }

    pub async fn orders_involving(&self, peer_id: &str) -> Result<Vec<P2pOrder>> {
        Ok(self
            .orders
            .list()
            .await?
            .into_iter()
            .filter(|o| o.from_peer_id == peer_id || o.to_peer_id == peer_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::AccessLevel;

    #[tokio::test]
    async fn test_memory_store_crud() {
        let store = MemoryStore::new();
        let peer = PeerRecord::new("alice", "pub".into(), "priv".into());
        store.add(&peer).await.unwrap();

        let loaded = store.get(peer.id()).await.unwrap().unwrap();
        assert_eq!(loaded.name, "alice");

        let mut updated = loaded.clone();
        updated.is_online = false;
        store.update(&updated).await.unwrap();
        assert!(!store.get(peer.id()).await.unwrap().unwrap().is_online);

        store.delete(peer.id()).await.unwrap();
        assert!(store.get(peer.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_record_fails() {
        let store: MemoryStore<PeerRecord> = MemoryStore::new();
        let peer = PeerRecord::new("ghost", "pub".into(), "priv".into());
        let err = store.update(&peer).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_set_self_peer_supersedes() {
        let store = TrustStore::in_memory();
        let first = PeerRecord::new("first", "pub1".into(), "priv1".into());
        let second = PeerRecord::new("second", "pub2".into(), "priv2".into());

        store.set_self_peer(&first).await.unwrap();
        store.set_self_peer(&second).await.unwrap();

        let peers = store.peers.list().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "second");
    }

    #[tokio::test]
    async fn test_connection_between_checks_both_fields() {
        let store = TrustStore::in_memory();
        let conn = PeerConnection::new("a", "b", "TW-XXXX-YYYY", AccessLevel::Order);
        store.connections.add(&conn).await.unwrap();

        assert!(store.connection_between("b", "a").await.unwrap().is_some());
        assert!(store.connection_between("a", "c").await.unwrap().is_none());
    }
}
