use chrono::Utc;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::info;

use tradewire_store::{
    AccessLevel, ConnectionStatus, PeerConnection, PeerInvitation, TrustStore,
};

use crate::error::{Result, ServiceError};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Short human-enterable code, `TW-CCCC-CCCC`. Eight symbols from a
/// 36-symbol alphabet give about 41 bits, enough against casual
/// guessing; invitations expire regardless.
fn generate_invitation_code() -> String {
    let mut rng = rand::thread_rng();
    let mut group = |n: usize| {
        (0..n)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect::<String>()
    };
    format!("TW-{}-{}", group(4), group(4))
}

/// Issues single-use invitation codes and converts accepted invitations
/// into connections. Every check is local and deterministic against the
/// trust store; possession of the code plus the authoritative record is
/// what establishes trust.
pub struct InvitationManager {
    store: TrustStore,
    /// Serializes acceptance so no two attempts for one code can both
    /// pass validation.
    accept_lock: Mutex<()>,
}

impl InvitationManager {
    pub fn new(store: TrustStore) -> Self {
        Self {
            store,
            accept_lock: Mutex::new(()),
        }
    }

    pub async fn create_invitation(
        &self,
        access_level: AccessLevel,
        expires_in_hours: i64,
    ) -> Result<PeerInvitation> {
        let me = self
            .store
            .self_peer()
            .await?
            .ok_or(ServiceError::NoIdentity)?;

        let invitation = PeerInvitation::new(
            me.peer_id,
            generate_invitation_code(),
            access_level,
            expires_in_hours,
        );
        self.store.invitations.add(&invitation).await?;
        info!(
            "created invitation {} ({:?}, {}h)",
            invitation.invitation_code, access_level, expires_in_hours
        );
        Ok(invitation)
    }

    /// Accept a code on behalf of the self peer. On success the
    /// invitation is terminally used and an active connection to the
    /// inviting peer exists. The invitation is re-read inside the
    /// critical section, never trusted from a stale read.
    pub async fn accept_invitation(&self, code: &str) -> Result<PeerConnection> {
        let me = self
            .store
            .self_peer()
            .await?
            .ok_or(ServiceError::NoIdentity)?;

        let _guard = self.accept_lock.lock().await;

        let mut invitation = self
            .store
            .invitation_by_code(code)
            .await?
            .ok_or(ServiceError::InvitationNotFound)?;
        if invitation.is_used {
            return Err(ServiceError::InvitationAlreadyUsed);
        }
        if invitation.is_expired(Utc::now()) {
            return Err(ServiceError::InvitationExpired);
        }

        invitation.is_used = true;
        invitation.used_by_peer_id = Some(me.peer_id.clone());
        self.store.invitations.update(&invitation).await?;

        let connection = PeerConnection::new(
            invitation.from_peer_id.clone(),
            me.peer_id,
            code,
            invitation.access_level,
        );
        self.store.connections.add(&connection).await?;
        info!(
            "invitation {} accepted, connection {} to {}",
            code, connection.connection_id, invitation.from_peer_id
        );
        Ok(connection)
    }

    /// Mark a connection disconnected. Returns the other endpoint's
    /// peer id so the caller can tear down the transport.
    pub async fn disconnect_peer(&self, connection_id: &str) -> Result<Option<String>> {
        let mut connection = self
            .store
            .connections
            .get(connection_id)
            .await?
            .ok_or_else(|| ServiceError::ConnectionNotFound(connection_id.to_string()))?;

        connection.status = ConnectionStatus::Disconnected;
        connection.updated_at = Utc::now();
        self.store.connections.update(&connection).await?;

        let other = match self.store.self_peer().await? {
            Some(me) => connection.other_peer(&me.peer_id).map(str::to_string),
            None => None,
        };
        info!("connection {} disconnected", connection_id);
        Ok(other)
    }
}
