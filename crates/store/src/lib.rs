pub mod error;
pub mod records;
pub mod store;

pub use error::StoreError;
pub use records::{
    AccessLevel, ConnectionStatus, ItemVisibility, OrderStatus, P2pOrder, PeerConnection,
    PeerInvitation, PeerRecord, Record, VisibilityType,
};
pub use store::{MemoryStore, RecordStore, TrustStore};
