//! Lifecycle of the node's own broker subscription.
//!
//! A node owns exactly one subscription, named after its [`NodeId`], on the
//! shared topic. It is created on start if missing and deleted on stop. A
//! subscription left behind by a crashed node is removed by the broker once
//! it has been idle for `idle_auto_delete`.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hubmesh_core::broker::{Broker, MessageHandler, ReceiverHandle, SubscriptionSpec};
use hubmesh_core::errors::BrokerError;

use crate::error::{BackplaneError, Result};

/// Outcome of the two independent teardown steps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TeardownReport {
    pub close: std::result::Result<(), BrokerError>,
    pub delete: std::result::Result<(), BrokerError>,
}

impl Default for TeardownReport {
    fn default() -> Self {
        Self {
            close: Ok(()),
            delete: Ok(()),
        }
    }
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.close.is_ok() && self.delete.is_ok()
    }
}

pub struct SubscriptionManager {
    broker: Arc<dyn Broker>,
    spec: SubscriptionSpec,
    /// Set once the subscription is known to exist, cleared by teardown.
    owned: bool,
    /// This manager created the subscription rather than adopting it.
    created: bool,
    receiver: Option<Box<dyn ReceiverHandle>>,
}

impl SubscriptionManager {
    pub fn new(broker: Arc<dyn Broker>, spec: SubscriptionSpec) -> Self {
        Self {
            broker,
            spec,
            owned: false,
            created: false,
            receiver: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn topic(&self) -> &str {
        &self.spec.topic
    }

    /// Whether the current subscription was created here rather than found.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn is_listening(&self) -> bool {
        self.receiver.as_ref().is_some_and(|r| !r.is_closed())
    }

    /// Make sure the subscription exists, creating it when missing.
    ///
    /// Losing a creation race to another caller counts as success.
    pub async fn ensure_exists(&mut self, cancel: &CancellationToken) -> Result<String> {
        let (topic, name) = (self.spec.topic.as_str(), self.spec.name.as_str());

        let existing = guard(cancel, self.broker.get_subscription(topic, name)).await?;
        if existing.is_some() {
            debug!(topic, subscription = name, "subscription already exists");
            self.owned = true;
            return Ok(self.spec.name.clone());
        }

        match guard(cancel, self.broker.create_subscription(&self.spec)).await {
            Ok(()) => {
                info!(
                    topic,
                    subscription = name,
                    idle_auto_delete_secs = self.spec.idle_auto_delete.as_secs(),
                    message_ttl_secs = self.spec.message_ttl.as_secs(),
                    "subscription created"
                );
                self.created = true;
            }
            Err(BackplaneError::Broker(BrokerError::SubscriptionExists { .. })) => {
                debug!(topic, subscription = name, "subscription created concurrently");
            }
            Err(e) => return Err(e),
        }
        self.owned = true;
        Ok(self.spec.name.clone())
    }

    /// Attach `handler` as the subscription's receiver.
    pub async fn listen(&mut self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if self.is_listening() {
            return Err(BackplaneError::InvalidState(format!(
                "subscription '{}' already has a receiver",
                self.spec.name
            )));
        }
        let handle = self
            .broker
            .register_receiver(&self.spec.topic, &self.spec.name, handler)
            .await?;
        self.receiver = Some(handle);
        debug!(topic = %self.spec.topic, subscription = %self.spec.name, "receiver attached");
        Ok(())
    }

    /// Close the receiver, then delete the subscription.
    ///
    /// Both steps are attempted even if the other fails. Calling this again
    /// afterwards is a no-op.
    pub async fn teardown(&mut self, cancel: &CancellationToken) -> TeardownReport {
        self.release(cancel, true).await
    }

    /// Undo a failed start. The receiver is closed, but the subscription is
    /// deleted only if this manager created it: an adopted subscription may
    /// still be serving another receiver and holds messages for this node.
    pub async fn rollback(&mut self, cancel: &CancellationToken) -> TeardownReport {
        let created = self.created;
        self.release(cancel, created).await
    }

    async fn release(&mut self, cancel: &CancellationToken, delete: bool) -> TeardownReport {
        let mut report = TeardownReport::default();
        let (topic, name) = (self.spec.topic.clone(), self.spec.name.clone());

        // An unclosed receiver frees its slot when dropped below.
        if let Some(mut receiver) = self.receiver.take() {
            report.close = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(BrokerError::Cancelled),
                r = receiver.close() => r,
            };
            if let Err(e) = &report.close {
                warn!(topic = %topic, subscription = %name, error = %e, "failed to close receiver");
            }
        }

        let owned = std::mem::take(&mut self.owned);
        self.created = false;
        if owned && !delete {
            debug!(topic = %topic, subscription = %name, "leaving adopted subscription in place");
        } else if owned {
            report.delete = match guard(cancel, self.broker.delete_subscription(&topic, &name)).await {
                Ok(()) => Ok(()),
                Err(BackplaneError::Broker(BrokerError::SubscriptionNotFound { .. })) => {
                    debug!(topic = %topic, subscription = %name, "subscription already gone");
                    Ok(())
                }
                Err(BackplaneError::Broker(e)) => Err(e),
                Err(_) => Err(BrokerError::Cancelled),
            };
            match &report.delete {
                Ok(()) => info!(topic = %topic, subscription = %name, "subscription deleted"),
                Err(e) => warn!(topic = %topic, subscription = %name, error = %e, "failed to delete subscription"),
            }
        }

        report
    }
}

/// Race a broker call against cancellation.
async fn guard<T, F>(cancel: &CancellationToken, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, BrokerError>>,
{
    if cancel.is_cancelled() {
        return Err(BackplaneError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackplaneError::Cancelled),
        r = call => r.map_err(BackplaneError::from),
    }
}
