//! The pub/sub broker seam.
//!
//! A broker offers one topic that many nodes publish to, and per-node named
//! subscriptions on that topic. Every subscription receives its own copy of
//! each message published after it was created. Subscriptions expire after a
//! period without a connected receiver, and queued messages expire after a
//! time-to-live.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::errors::BrokerError;

/// Parameters for creating a subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub topic: String,
    pub name: String,
    /// The broker deletes the subscription after this long with no receiver.
    pub idle_auto_delete: Duration,
    /// Queued messages older than this are discarded undelivered.
    pub message_ttl: Duration,
}

/// What the broker knows about an existing subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub topic: String,
    pub name: String,
    pub idle_auto_delete: Duration,
    pub message_ttl: Duration,
    /// Messages currently queued and not yet delivered.
    pub pending: usize,
}

/// Outcome the handler reports for one delivered message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Processing finished; the broker may forget the message.
    Complete,
    /// Processing was interrupted; the broker may redeliver.
    Abandon,
}

/// Callback the broker invokes for messages on a registered subscription.
///
/// A receiver delivers one message at a time: `on_message` is not invoked
/// again until the previous call has returned.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, payload: Bytes, cancel: CancellationToken) -> Disposition;

    /// Transport-level failure observed by the receiver.
    fn on_error(&self, error: &BrokerError);
}

/// Handle on a registered receiver.
///
/// Dropping a handle without closing it must release the subscription's
/// receiver slot before `drop` returns, so a new receiver can attach at once.
#[async_trait]
pub trait ReceiverHandle: Send {
    /// Stop delivering messages. In-flight handler calls are cancelled and
    /// awaited. Closing an already closed receiver is a no-op.
    async fn close(&mut self) -> Result<(), BrokerError>;

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish one message to every subscription on the topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Returns `Ok(None)` when the subscription does not exist.
    async fn get_subscription(
        &self,
        topic: &str,
        name: &str,
    ) -> Result<Option<SubscriptionInfo>, BrokerError>;

    /// Fails with [`BrokerError::SubscriptionExists`] when the name is taken.
    async fn create_subscription(&self, spec: &SubscriptionSpec) -> Result<(), BrokerError>;

    /// Fails with [`BrokerError::SubscriptionNotFound`] when absent.
    async fn delete_subscription(&self, topic: &str, name: &str) -> Result<(), BrokerError>;

    /// Start pumping messages from the subscription into `handler`.
    async fn register_receiver(
        &self,
        topic: &str,
        name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn ReceiverHandle>, BrokerError>;
}
