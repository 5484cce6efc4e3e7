use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coarse permission attached to an invitation or connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    View,
    Order,
    Manage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Pending,
    Active,
    Expired,
    Revoked,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityType {
    Public,
    Private,
    CustomerOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Shipped,
    Delivered,
    Cancelled,
}

/// Common contract for persisted records so one store implementation
/// can serve every entity type.
pub trait Record: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
}

/// One autonomous operator identity. Exactly one record represents
/// "self" per installation; creating a new peer supersedes it.
/// The private key never leaves the owning installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    pub name: String,
    pub public_key: String,
    pub private_key: String,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PeerRecord {
    pub fn new(name: impl Into<String>, public_key: String, private_key: String) -> Self {
        let now = Utc::now();
        Self {
            peer_id: format!("peer_{}", Uuid::new_v4()),
            name: name.into(),
            public_key,
            private_key,
            is_online: true,
            last_seen: now,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Record for PeerRecord {
    fn id(&self) -> &str {
        &self.peer_id
    }
}

/// Established trust between two peers. Symmetric: either endpoint may
/// appear as peer A or peer B.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConnection {
    pub connection_id: String,
    pub peer_a_id: String,
    pub peer_b_id: String,
    pub invitation_code: String,
    pub status: ConnectionStatus,
    pub access_level: AccessLevel,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl PeerConnection {
    pub fn new(
        peer_a_id: impl Into<String>,
        peer_b_id: impl Into<String>,
        invitation_code: impl Into<String>,
        access_level: AccessLevel,
    ) -> Self {
        let now = Utc::now();
        Self {
            connection_id: format!("conn_{}", Uuid::new_v4()),
            peer_a_id: peer_a_id.into(),
            peer_b_id: peer_b_id.into(),
            invitation_code: invitation_code.into(),
            status: ConnectionStatus::Active,
            access_level,
            created_at: now,
            updated_at: now,
            last_activity: now,
        }
    }

    pub fn involves(&self, peer_id: &str) -> bool {
        self.peer_a_id == peer_id || self.peer_b_id == peer_id
    }

    /// True when this connection links the given unordered peer pair.
    pub fn links(&self, a: &str, b: &str) -> bool {
        (self.peer_a_id == a && self.peer_b_id == b)
            || (self.peer_a_id == b && self.peer_b_id == a)
    }

    /// The endpoint that is not `peer_id`, if this connection involves it.
    pub fn other_peer(&self, peer_id: &str) -> Option<&str> {
        if self.peer_a_id == peer_id {
            Some(&self.peer_b_id)
        } else if self.peer_b_id == peer_id {
            Some(&self.peer_a_id)
        } else {
            None
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Active
    }
}

impl Record for PeerConnection {
    fn id(&self) -> &str {
        &self.connection_id
    }
}

/// Single-use invitation. `is_used = true` is terminal; expiry is a
/// derived state checked against the clock at acceptance time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInvitation {
    pub invitation_id: String,
    pub from_peer_id: String,
    pub invitation_code: String,
    pub access_level: AccessLevel,
    pub expires_at: DateTime<Utc>,
    pub is_used: bool,
    pub used_by_peer_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PeerInvitation {
    pub fn new(
        from_peer_id: impl Into<String>,
        invitation_code: impl Into<String>,
        access_level: AccessLevel,
        expires_in_hours: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            invitation_id: format!("inv_{}", Uuid::new_v4()),
            from_peer_id: from_peer_id.into(),
            invitation_code: invitation_code.into(),
            access_level,
            expires_at: now + Duration::hours(expires_in_hours),
            is_used: false,
            used_by_peer_id: None,
            created_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

impl Record for PeerInvitation {
    fn id(&self) -> &str {
        &self.invitation_id
    }
}

/// Per-item rule governing which remote peers may see that item.
/// One record is authoritative per item id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemVisibility {
    pub visibility_id: String,
    pub item_id: String,
    pub owner_peer_id: String,
    pub visibility_type: VisibilityType,
    pub allowed_peer_ids: Vec<String>,
    pub access_level: AccessLevel,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ItemVisibility {
    pub fn new(
        item_id: impl Into<String>,
        owner_peer_id: impl Into<String>,
        visibility_type: VisibilityType,
        allowed_peer_ids: Vec<String>,
        access_level: AccessLevel,
    ) -> Self {
        let now = Utc::now();
        Self {
            visibility_id: format!("vis_{}", Uuid::new_v4()),
            item_id: item_id.into(),
            owner_peer_id: owner_peer_id.into(),
            visibility_type,
            allowed_peer_ids,
            access_level,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Record for ItemVisibility {
    fn id(&self) -> &str {
        &self.visibility_id
    }
}

/// An order placed between two connected peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct P2pOrder {
    pub order_id: String,
    pub from_peer_id: String,
    pub to_peer_id: String,
    pub item_id: String,
    pub quantity: u32,
    pub price: f64,
    pub status: OrderStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl P2pOrder {
    pub fn new(
        from_peer_id: impl Into<String>,
        to_peer_id: impl Into<String>,
        item_id: impl Into<String>,
        quantity: u32,
        price: f64,
        notes: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            order_id: format!("order_{}", Uuid::new_v4()),
            from_peer_id: from_peer_id.into(),
            to_peer_id: to_peer_id.into(),
            item_id: item_id.into(),
            quantity,
            price,
            status: OrderStatus::Pending,
            notes,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

impl Record for P2pOrder {
    fn id(&self) -> &str {
        &self.order_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_links_both_orientations() {
        let conn = PeerConnection::new("peer_a", "peer_b", "TW-AAAA-BBBB", AccessLevel::Order);
        assert!(conn.links("peer_a", "peer_b"));
        assert!(conn.links("peer_b", "peer_a"));
        assert!(!conn.links("peer_a", "peer_c"));
        assert_eq!(conn.other_peer("peer_a"), Some("peer_b"));
        assert_eq!(conn.other_peer("peer_c"), None);
    }

    #[test]
    fn test_invitation_expiry_is_derived() {
        let inv = PeerInvitation::new("peer_a", "TW-AAAA-BBBB", AccessLevel::View, 24);
        assert!(!inv.is_expired(Utc::now()));
        assert!(inv.is_expired(Utc::now() + Duration::hours(25)));
    }

    #[test]
    fn test_visibility_type_serde_names() {
        let json = serde_json::to_string(&VisibilityType::CustomerOnly).unwrap();
        assert_eq!(json, "\"customer_only\"");
    }
}
