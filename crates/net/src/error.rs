use thiserror::Error;

/// Errors raised by the signaling relay, relay client and session
/// negotiator. Validation errors are surfaced to callers verbatim;
/// transport failures are retried per the backoff policy before they
/// reach a caller.
#[derive(Error, Debug)]
pub enum NetError {
    /// A register message was missing a required field
    #[error("invalid registration")]
    InvalidRegistration,

    /// No answer or channel within the negotiation bound
    #[error("negotiation timed out with {0}")]
    NegotiationTimeout(String),

    /// Session channel closed mid-flight
    #[error("channel closed")]
    ChannelClosed,

    /// No open session channel to the target peer
    #[error("not connected to peer: {0}")]
    NotConnected(String),

    /// Relay could not be reached after retries were exhausted
    #[error("relay unreachable: {0}")]
    RelayUnreachable(String),

    /// Failed to establish a direct connection to a peer
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Wire message could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Inbound line exceeded the wire size cap
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;
