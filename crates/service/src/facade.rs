use std::net::SocketAddr;

use chrono::Utc;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tradewire_net::{
    Envelope, EnvelopeBody, NegotiatorConfig, PeerIdentity, RelayClient, RelayEvent,
    SessionEvent, SessionNegotiator, SignalMessage,
};
use tradewire_store::{
    AccessLevel, ItemVisibility, OrderStatus, P2pOrder, PeerConnection, PeerInvitation,
    PeerRecord, TrustStore, VisibilityType,
};

use crate::error::{Result, ServiceError};
use crate::events::{EventBus, P2pEvent, SubscriptionId};
use crate::invitation::InvitationManager;
use crate::order::OrderManager;
use crate::visibility::VisibilityManager;

#[derive(Debug, Clone)]
pub struct P2pServiceConfig {
    pub relay_addr: SocketAddr,
    pub negotiator: NegotiatorConfig,
}

impl P2pServiceConfig {
    pub fn new(relay_addr: SocketAddr) -> Self {
        Self {
            relay_addr,
            negotiator: NegotiatorConfig::default(),
        }
    }
}

/// Live networking, present only between `start` and `stop`.
struct NetHandle {
    self_id: String,
    relay: RelayClient,
    negotiator: SessionNegotiator,
    tasks: Vec<JoinHandle<()>>,
}

/// The single entry point for the presentation layer. Composes the
/// trust store, invitation/visibility/order managers and the session
/// negotiator behind one explicit start/stop lifecycle.
pub struct P2pService {
    store: TrustStore,
    config: P2pServiceConfig,
    events: EventBus,
    invitations: InvitationManager,
    visibility: VisibilityManager,
    orders: OrderManager,
    net: RwLock<Option<NetHandle>>,
}

impl P2pService {
    pub fn new(store: TrustStore, config: P2pServiceConfig) -> Self {
        Self {
            invitations: InvitationManager::new(store.clone()),
            visibility: VisibilityManager::new(store.clone()),
            orders: OrderManager::new(store.clone()),
            store,
            config,
            events: EventBus::new(),
            net: RwLock::new(None),
        }
    }

    // ---- identity ----

    /// Create the self identity, superseding any previous one. Takes
    /// effect on the network at the next `start`.
    pub async fn create_peer(&self, name: &str) -> Result<PeerRecord> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = hex::encode(signing_key.verifying_key().to_bytes());
        let private_key = hex::encode(signing_key.to_bytes());

        let peer = PeerRecord::new(name, public_key, private_key);
        self.store.set_self_peer(&peer).await?;
        if self.net.read().await.is_some() {
            warn!("identity replaced while running, restart to re-register");
        }
        info!("created peer {} ({})", peer.name, peer.peer_id);
        Ok(peer)
    }

    pub async fn get_current_peer(&self) -> Result<Option<PeerRecord>> {
        Ok(self.store.self_peer().await?)
    }

    pub async fn update_peer_status(&self, is_online: bool) -> Result<PeerRecord> {
        let mut peer = self
            .store
            .self_peer()
            .await?
            .ok_or(ServiceError::NoIdentity)?;
        peer.is_online = is_online;
        peer.last_seen = Utc::now();
        peer.updated_at = Utc::now();
        self.store.peers.update(&peer).await?;
        Ok(peer)
    }

    // ---- lifecycle ----

    /// Connect to the signaling relay and start accepting sessions.
    /// Idempotent while running.
    pub async fn start(&self) -> Result<()> {
        let mut net = self.net.write().await;
        if net.is_some() {
            return Ok(());
        }
        let me = self
            .store
            .self_peer()
            .await?
            .ok_or(ServiceError::NoIdentity)?;

        let identity = PeerIdentity {
            peer_id: me.peer_id.clone(),
            name: me.name.clone(),
            public_key: me.public_key.clone(),
        };
        let (relay, mut relay_events) = RelayClient::connect(self.config.relay_addr, identity).await?;

        let (negotiator, mut inbound, mut session_events) = SessionNegotiator::new(
            me.peer_id.clone(),
            relay.clone(),
            self.store.clone(),
            self.config.negotiator.clone(),
        );

        let mut tasks = Vec::new();

        let signal_negotiator = negotiator.clone();
        let signal_bus = self.events.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = relay_events.recv().await {
                match event {
                    RelayEvent::Message(msg) => {
                        route_signal(&signal_negotiator, &signal_bus, msg).await
                    }
                    RelayEvent::Lost => debug!("relay link lost, reconnecting"),
                    RelayEvent::Exhausted => {
                        warn!("relay reconnect attempts exhausted");
                        break;
                    }
                }
            }
        }));

        let session_bus = self.events.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = session_events.recv().await {
                session_bus.emit(match event {
                    SessionEvent::Opened { peer_id } => P2pEvent::SessionOpened { peer_id },
                    SessionEvent::Closed { peer_id } => P2pEvent::SessionClosed { peer_id },
                    SessionEvent::GaveUp { peer_id } => P2pEvent::NegotiationGaveUp { peer_id },
                });
            }
        }));

        let dispatch_orders = OrderManager::new(self.store.clone());
        let dispatch_bus = self.events.clone();
        let dispatch_negotiator = negotiator.clone();
        let dispatch_self_id = me.peer_id.clone();
        tasks.push(tokio::spawn(async move {
            while let Some((from, envelope)) = inbound.recv().await {
                dispatch_envelope(
                    &dispatch_orders,
                    &dispatch_bus,
                    &dispatch_negotiator,
                    &dispatch_self_id,
                    &from,
                    envelope,
                )
                .await;
            }
        }));

        *net = Some(NetHandle {
            self_id: me.peer_id.clone(),
            relay,
            negotiator,
            tasks,
        });
        info!("p2p service started as {}", me.peer_id);
        Ok(())
    }

    pub async fn stop(&self) {
        let Some(handle) = self.net.write().await.take() else {
            return;
        };
        handle.negotiator.shutdown().await;
        handle.relay.shutdown();
        for task in handle.tasks {
            task.abort();
        }
        if let Err(e) = self.update_peer_status(false).await {
            debug!("could not mark self offline: {}", e);
        }
        info!("p2p service stopped");
    }

    async fn net_parts(&self) -> Option<(String, SessionNegotiator)> {
        self.net
            .read()
            .await
            .as_ref()
            .map(|h| (h.self_id.clone(), h.negotiator.clone()))
    }

    // ---- invitations & connections ----

    pub async fn create_invitation(
        &self,
        access_level: AccessLevel,
        expires_in_hours: i64,
    ) -> Result<PeerInvitation> {
        self.invitations
            .create_invitation(access_level, expires_in_hours)
            .await
    }

    /// Accept an invitation code and, when the service is running,
    /// immediately negotiate a session toward the inviting peer.
    pub async fn accept_invitation(&self, code: &str) -> Result<PeerConnection> {
        let connection = self.invitations.accept_invitation(code).await?;

        if let Some((self_id, negotiator)) = self.net_parts().await {
            if let Some(other) = connection.other_peer(&self_id) {
                if let Err(e) = negotiator.connect_to_peer(other).await {
                    warn!("could not start session toward {}: {}", other, e);
                }
            }
        }
        Ok(connection)
    }

    pub async fn get_connections(&self) -> Result<Vec<PeerConnection>> {
        let me = self
            .store
            .self_peer()
            .await?
            .ok_or(ServiceError::NoIdentity)?;
        Ok(self.store.connections_involving(&me.peer_id).await?)
    }

    pub async fn get_active_connections(&self) -> Result<Vec<PeerConnection>> {
        Ok(self
            .get_connections()
            .await?
            .into_iter()
            .filter(|c| c.is_active())
            .collect())
    }

    pub async fn disconnect_peer(&self, connection_id: &str) -> Result<()> {
        let other = self.invitations.disconnect_peer(connection_id).await?;
        if let (Some(other), Some((_, negotiator))) = (other, self.net_parts().await) {
            negotiator.disconnect(&other).await;
        }
        Ok(())
    }

    // ---- visibility ----

    pub async fn set_item_visibility(
        &self,
        item_id: &str,
        visibility_type: VisibilityType,
        allowed_peer_ids: Vec<String>,
        access_level: AccessLevel,
    ) -> Result<ItemVisibility> {
        self.visibility
            .set_item_visibility(item_id, visibility_type, allowed_peer_ids, access_level)
            .await
    }

    pub async fn share_item_with_peer(&self, item_id: &str, peer_id: &str) -> Result<()> {
        self.visibility.share_item_with_peer(item_id, peer_id).await
    }

    pub async fn unshare_item_with_peer(&self, item_id: &str, peer_id: &str) -> Result<()> {
        self.visibility
            .unshare_item_with_peer(item_id, peer_id)
            .await
    }

    pub async fn get_visible_items(&self) -> Result<Vec<ItemVisibility>> {
        let me = self
            .store
            .self_peer()
            .await?
            .ok_or(ServiceError::NoIdentity)?;
        self.visibility.visible_items_for(&me.peer_id).await
    }

    // ---- orders ----

    /// Place an order. The record always persists locally; delivery to
    /// the counterparty is best-effort over the session channel.
    pub async fn create_p2p_order(
        &self,
        to_peer: &str,
        item_id: &str,
        quantity: u32,
        price: f64,
        notes: Option<String>,
    ) -> Result<P2pOrder> {
        let order = self
            .orders
            .create_order(to_peer, item_id, quantity, price, notes)
            .await?;

        if let Some((self_id, negotiator)) = self.net_parts().await {
            let envelope = Envelope::new(EnvelopeBody::Order(order.clone()), self_id, to_peer);
            if let Err(e) = negotiator.send_envelope(to_peer, envelope).await {
                warn!("order {} not delivered to {}: {}", order.order_id, to_peer, e);
            }
        }
        Ok(order)
    }

    pub async fn get_p2p_orders(&self) -> Result<Vec<P2pOrder>> {
        let me = self
            .store
            .self_peer()
            .await?
            .ok_or(ServiceError::NoIdentity)?;
        self.orders.orders_for(&me.peer_id).await
    }

    pub async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<P2pOrder> {
        let order = self.orders.update_order_status(order_id, status).await?;

        if let Some((self_id, negotiator)) = self.net_parts().await {
            let counterparty = if order.from_peer_id == self_id {
                order.to_peer_id.clone()
            } else {
                order.from_peer_id.clone()
            };
            let envelope = Envelope::new(
                EnvelopeBody::StatusUpdate {
                    order_id: order.order_id.clone(),
                    status,
                },
                self_id,
                counterparty.clone(),
            );
            if let Err(e) = negotiator.send_envelope(&counterparty, envelope).await {
                warn!(
                    "status update for {} not delivered to {}: {}",
                    order.order_id, counterparty, e
                );
            }
        }
        Ok(order)
    }

    // ---- sessions ----

    pub async fn connect_to_peer(&self, peer_id: &str) -> Result<()> {
        let (_, negotiator) = self.net_parts().await.ok_or(ServiceError::NotRunning)?;
        Ok(negotiator.connect_to_peer(peer_id).await?)
    }

    pub async fn get_connected_peers(&self) -> Vec<String> {
        match self.net_parts().await {
            Some((_, negotiator)) => negotiator.connected_peers().await,
            None => Vec::new(),
        }
    }

    pub async fn is_connected_to_peer(&self, peer_id: &str) -> bool {
        match self.net_parts().await {
            Some((_, negotiator)) => negotiator.is_connected(peer_id).await,
            None => false,
        }
    }

    // ---- events ----

    pub fn on(
        &self,
        kind: &'static str,
        handler: impl Fn(&P2pEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.events.on(kind, handler)
    }

    pub fn off(&self, subscription: SubscriptionId) {
        self.events.off(subscription);
    }
}

/// Relay traffic router: negotiation signals go to the negotiator,
/// directory updates to the event bus, everything else is noise.
async fn route_signal(negotiator: &SessionNegotiator, events: &EventBus, msg: SignalMessage) {
    match msg {
        SignalMessage::Offer { .. }
        | SignalMessage::Answer { .. }
        | SignalMessage::IceCandidate { .. } => negotiator.handle_signal(msg).await,
        SignalMessage::PeerList { peers } => {
            events.emit(P2pEvent::PeerListUpdated { peers });
        }
        SignalMessage::Registered { peer_id } => debug!("registered with relay as {}", peer_id),
        SignalMessage::Error { message } => warn!("relay error: {}", message),
        other => debug!("ignoring relay message: {}", other.kind()),
    }
}

/// Inbound envelope dispatch table. Unknown types never get here; they
/// already failed to decode and were dropped by the channel.
async fn dispatch_envelope(
    orders: &OrderManager,
    events: &EventBus,
    negotiator: &SessionNegotiator,
    self_id: &str,
    from: &str,
    envelope: Envelope,
) {
    match envelope.body {
        EnvelopeBody::Order(order) => {
            if let Err(e) = orders.record_remote_order(&order).await {
                warn!("could not record order from {}: {}", from, e);
                return;
            }
            events.emit(P2pEvent::OrderReceived { order });
        }
        EnvelopeBody::StatusUpdate { order_id, status } => {
            match orders.update_order_status(&order_id, status).await {
                Ok(_) => events.emit(P2pEvent::OrderStatusChanged { order_id, status }),
                Err(e) => warn!("status update from {} not applied: {}", from, e),
            }
        }
        EnvelopeBody::InventoryUpdate { item_id, quantity } => {
            events.emit(P2pEvent::InventoryUpdated { item_id, quantity });
        }
        EnvelopeBody::Ping => {
            let pong = Envelope::new(EnvelopeBody::Pong, self_id, from);
            if let Err(e) = negotiator.send_envelope(from, pong).await {
                debug!("pong to {} failed: {}", from, e);
            }
        }
        EnvelopeBody::Pong => debug!("pong from {}", from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> P2pService {
        let config = P2pServiceConfig::new("127.0.0.1:8080".parse().unwrap());
        P2pService::new(TrustStore::in_memory(), config)
    }

    #[tokio::test]
    async fn test_create_peer_supersedes_identity() {
        let svc = service();
        assert!(svc.get_current_peer().await.unwrap().is_none());

        let first = svc.create_peer("alice").await.unwrap();
        assert_eq!(first.public_key.len(), 64);
        assert_ne!(first.public_key, first.private_key);

        let second = svc.create_peer("alice-2").await.unwrap();
        let current = svc.get_current_peer().await.unwrap().unwrap();
        assert_eq!(current.peer_id, second.peer_id);
    }

    #[tokio::test]
    async fn test_update_peer_status() {
        let svc = service();
        assert!(matches!(
            svc.update_peer_status(false).await.unwrap_err(),
            ServiceError::NoIdentity
        ));

        svc.create_peer("alice").await.unwrap();
        let peer = svc.update_peer_status(false).await.unwrap();
        assert!(!peer.is_online);
    }

    #[tokio::test]
    async fn test_session_ops_require_running_service() {
        let svc = service();
        svc.create_peer("alice").await.unwrap();

        assert!(matches!(
            svc.connect_to_peer("peer_x").await.unwrap_err(),
            ServiceError::NotRunning
        ));
        assert!(svc.get_connected_peers().await.is_empty());
        assert!(!svc.is_connected_to_peer("peer_x").await);
    }

    #[tokio::test]
    async fn test_start_requires_identity() {
        let svc = service();
        assert!(matches!(
            svc.start().await.unwrap_err(),
            ServiceError::NoIdentity
        ));
    }
}
