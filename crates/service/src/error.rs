use thiserror::Error;

use tradewire_net::NetError;
use tradewire_store::StoreError;

/// Service-level failures. Validation errors surface to callers
/// verbatim; transport failures are retried by the lower layers and
/// only reach a caller once retries are exhausted.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Operation requires a self peer that does not exist yet
    #[error("no peer identity, create a peer first")]
    NoIdentity,

    #[error("invalid invitation code")]
    InvitationNotFound,

    #[error("invitation has already been used")]
    InvitationAlreadyUsed,

    #[error("invitation has expired")]
    InvitationExpired,

    /// Messaging or ordering attempted without an active connection
    #[error("no active connection with peer: {0}")]
    NoActiveConnection(String),

    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    /// Service is not started, so no networking is available
    #[error("service not running")]
    NotRunning,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Net(#[from] NetError),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
