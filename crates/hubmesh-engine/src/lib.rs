//! # hubmesh-engine
//!
//! Cross-node fanout over a shared broker topic. A [`ClusterPublisher`]
//! delivers to this node's clients and then publishes an envelope; every other
//! node's [`Dispatcher`] receives it on its own subscription and replays the
//! recipients against the matching hub's local delivery service.

#![deny(unsafe_code)]

pub mod backplane;
pub mod dispatcher;
pub mod error;
pub mod publisher;
pub mod registry;
pub mod subscription;

pub use backplane::Backplane;
pub use dispatcher::{Dispatcher, DispatcherState, DropReason, PipelineOutcome, ReceivePipeline};
pub use error::{BackplaneError, Result};
pub use publisher::ClusterPublisher;
pub use registry::LazyHubRegistry;
pub use subscription::{SubscriptionManager, TeardownReport};
