use chrono::Utc;
use tracing::info;

use tradewire_store::{OrderStatus, P2pOrder, TrustStore};

use crate::error::{Result, ServiceError};

/// Order bookkeeping against the trust store. Persistence always comes
/// first; whether the counterparty is reachable is the caller's
/// best-effort concern.
pub struct OrderManager {
    store: TrustStore,
}

impl OrderManager {
    pub fn new(store: TrustStore) -> Self {
        Self { store }
    }

    /// Place an order toward `to_peer`. Requires an active connection;
    /// the order is persisted as pending regardless of whether the
    /// counterparty can currently be reached.
    pub async fn create_order(
        &self,
        to_peer: &str,
        item_id: &str,
        quantity: u32,
        price: f64,
        notes: Option<String>,
    ) -> Result<P2pOrder> {
        let me = self
            .store
            .self_peer()
            .await?
            .ok_or(ServiceError::NoIdentity)?;

        let active = self
            .store
            .connection_between(&me.peer_id, to_peer)
            .await?
            .map(|c| c.is_active())
            .unwrap_or(false);
        if !active {
            return Err(ServiceError::NoActiveConnection(to_peer.to_string()));
        }

        let order = P2pOrder::new(me.peer_id, to_peer, item_id, quantity, price, notes);
        self.store.orders.add(&order).await?;
        info!(
            "order {} created: {} x{} -> {}",
            order.order_id, item_id, quantity, to_peer
        );
        Ok(order)
    }

    /// Apply a status change. Delivery stamps `completed_at` exactly
    /// once; other statuses never touch it.
    pub async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<P2pOrder> {
        let mut order = self
            .store
            .orders
            .get(order_id)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(order_id.to_string()))?;

        order.status = status;
        order.updated_at = Utc::now();
        if status == OrderStatus::Delivered && order.completed_at.is_none() {
            order.completed_at = Some(Utc::now());
        }
        self.store.orders.update(&order).await?;
        info!("order {} -> {:?}", order_id, status);
        Ok(order)
    }

    /// Persist an order received from the counterparty. Order ids are
    /// globally unique, so a re-delivered order is an idempotent write.
    pub async fn record_remote_order(&self, order: &P2pOrder) -> Result<()> {
        self.store.orders.add(order).await?;
        info!(
            "order {} received from {}",
            order.order_id, order.from_peer_id
        );
        Ok(())
    }

    pub async fn orders_for(&self, peer_id: &str) -> Result<Vec<P2pOrder>> {
        Ok(self.store.orders_involving(peer_id).await?)
    }
}
