use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tradewire_store::{OrderStatus, P2pOrder};

/// Payload of a session-level message, one closed variant per type.
/// Unknown tags fail to decode and are dropped by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EnvelopeBody {
    Order(P2pOrder),
    #[serde(rename_all = "camelCase")]
    InventoryUpdate { item_id: String, quantity: u32 },
    #[serde(rename_all = "camelCase")]
    StatusUpdate {
        order_id: String,
        status: OrderStatus,
    },
    Ping,
    Pong,
}

impl EnvelopeBody {
    pub fn kind(&self) -> &'static str {
        match self {
            EnvelopeBody::Order(_) => "order",
            EnvelopeBody::InventoryUpdate { .. } => "inventory_update",
            EnvelopeBody::StatusUpdate { .. } => "status_update",
            EnvelopeBody::Ping => "ping",
            EnvelopeBody::Pong => "pong",
        }
    }
}

/// Typed message carried over an established session channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(flatten)]
    pub body: EnvelopeBody,
    pub timestamp: DateTime<Utc>,
    pub from_peer_id: String,
    pub to_peer_id: String,
}

impl Envelope {
    pub fn new(body: EnvelopeBody, from_peer_id: impl Into<String>, to_peer_id: impl Into<String>) -> Self {
        Self {
            body,
            timestamp: Utc::now(),
            from_peer_id: from_peer_id.into(),
            to_peer_id: to_peer_id.into(),
        }
    }
}
