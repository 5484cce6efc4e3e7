//! Peer networking: the signaling relay, the relay client, and the
//! session negotiator that turns relayed offers into direct channels.

pub mod client;
pub mod envelope;
pub mod error;
pub mod negotiator;
pub mod relay;
pub mod session;
pub mod wire;

pub use client::{PeerIdentity, RelayClient, RelayEvent};
pub use envelope::{Envelope, EnvelopeBody};
pub use error::{NetError, Result};
pub use negotiator::{NegotiatorConfig, SessionEvent, SessionNegotiator, SessionState};
pub use relay::SignalingRelay;
pub use wire::{
    DirectoryEntry, SessionDescription, SignalMessage, TransportCandidate, DEFAULT_RELAY_PORT,
};
