//! In-process implementation of the hubmesh [`Broker`](hubmesh_core::Broker).
//!
//! Used by tests and by single-process clusters. Supports topic fanout,
//! message TTL, idle auto-delete of subscriptions, abandon/redelivery and a
//! switch to simulate outages.

mod memory;

pub use memory::{InMemoryBroker, InMemoryBrokerConfig, InMemoryReceiver, MEMORY_SCHEME};
