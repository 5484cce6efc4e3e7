use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use tradewire_net::DirectoryEntry;
use tradewire_store::{OrderStatus, P2pOrder};

/// Everything the service reports to the presentation layer.
#[derive(Debug, Clone)]
pub enum P2pEvent {
    PeerListUpdated { peers: Vec<DirectoryEntry> },
    SessionOpened { peer_id: String },
    SessionClosed { peer_id: String },
    /// Reconnect attempts toward a peer were exhausted.
    NegotiationGaveUp { peer_id: String },
    OrderReceived { order: P2pOrder },
    OrderStatusChanged { order_id: String, status: OrderStatus },
    InventoryUpdated { item_id: String, quantity: u32 },
}

impl P2pEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            P2pEvent::PeerListUpdated { .. } => "peer-list-updated",
            P2pEvent::SessionOpened { .. } => "session-opened",
            P2pEvent::SessionClosed { .. } => "session-closed",
            P2pEvent::NegotiationGaveUp { .. } => "negotiation-gave-up",
            P2pEvent::OrderReceived { .. } => "order-received",
            P2pEvent::OrderStatusChanged { .. } => "order-status-changed",
            P2pEvent::InventoryUpdated { .. } => "inventory-updated",
        }
    }
}

type Handler = Box<dyn Fn(&P2pEvent) + Send + Sync>;

/// Token returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Handler registry keyed by event kind. Handlers run inline on the
/// emitting task, so they must be cheap and non-blocking.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

#[derive(Default)]
struct EventBusInner {
    handlers: RwLock<HashMap<&'static str, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event kind (see [`P2pEvent::kind`]).
    pub fn on(&self, kind: &'static str, handler: impl Fn(&P2pEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Box::new(handler)));
        SubscriptionId(id)
    }

    pub fn off(&self, subscription: SubscriptionId) {
        let mut handlers = self.inner.handlers.write();
        for entries in handlers.values_mut() {
            entries.retain(|(id, _)| *id != subscription.0);
        }
    }

    pub fn emit(&self, event: P2pEvent) {
        let handlers = self.inner.handlers.read();
        if let Some(entries) = handlers.get(event.kind()) {
            for (_, handler) in entries {
                handler(&event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_on_emit_off() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        let sub = bus.on("session-opened", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(P2pEvent::SessionOpened {
            peer_id: "peer_x".into(),
        });
        bus.emit(P2pEvent::SessionClosed {
            peer_id: "peer_x".into(),
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        bus.off(sub);
        bus.emit(P2pEvent::SessionOpened {
            peer_id: "peer_x".into(),
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
