use chrono::Utc;
use tracing::debug;

use tradewire_store::{
    AccessLevel, ItemVisibility, PeerConnection, TrustStore, VisibilityType,
};

use crate::error::{Result, ServiceError};

/// Whether `requesting_peer` may see the item. Pure and fail-closed:
/// anything not explicitly granted is denied.
pub fn can_see(
    visibility: &ItemVisibility,
    requesting_peer: &str,
    connections: &[PeerConnection],
) -> bool {
    if visibility.owner_peer_id == requesting_peer {
        return true;
    }
    match visibility.visibility_type {
        VisibilityType::Public => true,
        VisibilityType::Private => visibility
            .allowed_peer_ids
            .iter()
            .any(|id| id == requesting_peer),
        VisibilityType::CustomerOnly => connections
            .iter()
            .any(|c| c.is_active() && c.links(&visibility.owner_peer_id, requesting_peer)),
    }
}

/// Owns the per-item visibility records. One record is authoritative
/// per item id; writes are upserts.
pub struct VisibilityManager {
    store: TrustStore,
}

impl VisibilityManager {
    pub fn new(store: TrustStore) -> Self {
        Self { store }
    }

    pub async fn set_item_visibility(
        &self,
        item_id: &str,
        visibility_type: VisibilityType,
        allowed_peer_ids: Vec<String>,
        access_level: AccessLevel,
    ) -> Result<ItemVisibility> {
        let me = self
            .store
            .self_peer()
            .await?
            .ok_or(ServiceError::NoIdentity)?;

        let record = match self.store.visibility_for_item(item_id).await? {
            Some(mut existing) => {
                existing.visibility_type = visibility_type;
                existing.allowed_peer_ids = allowed_peer_ids;
                existing.access_level = access_level;
                existing.updated_at = Utc::now();
                self.store.visibilities.update(&existing).await?;
                existing
            }
            None => {
                let created = ItemVisibility::new(
                    item_id,
                    me.peer_id,
                    visibility_type,
                    allowed_peer_ids,
                    access_level,
                );
                self.store.visibilities.add(&created).await?;
                created
            }
        };
        debug!("visibility for {} set to {:?}", item_id, visibility_type);
        Ok(record)
    }

    /// Idempotent: sharing with an already-allowed peer changes nothing.
    pub async fn share_item_with_peer(&self, item_id: &str, peer_id: &str) -> Result<()> {
        let Some(mut visibility) = self.store.visibility_for_item(item_id).await? else {
            return Ok(());
        };
        if !visibility.allowed_peer_ids.iter().any(|id| id == peer_id) {
            visibility.allowed_peer_ids.push(peer_id.to_string());
            visibility.updated_at = Utc::now();
            self.store.visibilities.update(&visibility).await?;
        }
        Ok(())
    }

    pub async fn unshare_item_with_peer(&self, item_id: &str, peer_id: &str) -> Result<()> {
        let Some(mut visibility) = self.store.visibility_for_item(item_id).await? else {
            return Ok(());
        };
        let before = visibility.allowed_peer_ids.len();
        visibility.allowed_peer_ids.retain(|id| id != peer_id);
        if visibility.allowed_peer_ids.len() != before {
            visibility.updated_at = Utc::now();
            self.store.visibilities.update(&visibility).await?;
        }
        Ok(())
    }

    /// Every visibility record the given peer may see.
    pub async fn visible_items_for(&self, peer_id: &str) -> Result<Vec<ItemVisibility>> {
        let connections = self.store.connections.list().await?;
        Ok(self
            .store
            .visibilities
            .list()
            .await?
            .into_iter()
            .filter(|v| can_see(v, peer_id, &connections))
            .collect())
    }
}
