//! Trade-layer services on top of the trust store and peer networking:
//! invitations, visibility rules, the order protocol and the facade the
//! presentation layer talks to.

pub mod error;
pub mod events;
pub mod facade;
pub mod invitation;
pub mod order;
pub mod visibility;

pub use error::{Result, ServiceError};
pub use events::{EventBus, P2pEvent, SubscriptionId};
pub use facade::{P2pService, P2pServiceConfig};
pub use invitation::InvitationManager;
pub use order::OrderManager;
pub use visibility::{can_see, VisibilityManager};
