//! Shared vocabulary for the hubmesh backplane: node identity, the wire
//! envelope and its recipient variants, and the collaborator traits the
//! engine is written against (local delivery, hub registry, broker).

pub mod broker;
pub mod delivery;
pub mod envelope;
pub mod errors;
pub mod hub;
pub mod ids;
pub mod recipient;

pub mod mock;

pub use broker::{Broker, Disposition, MessageHandler, ReceiverHandle, SubscriptionInfo, SubscriptionSpec};
pub use delivery::{HubRegistry, LocalDelivery};
pub use envelope::{Envelope, InvalidEnvelope};
pub use errors::{BrokerError, DeliveryError, EnvelopeError};
pub use hub::Hub;
pub use ids::{ConnectionId, NodeId};
pub use recipient::Recipient;
