//! Publishing side of the backplane.
//!
//! Every send first reaches the clients connected to this node, then goes out
//! to the broker as an [`Envelope`] so the other nodes can replay it. Local
//! delivery always completes before the envelope is published; if it fails,
//! nothing is published.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use hubmesh_core::broker::Broker;
use hubmesh_core::delivery::LocalDelivery;
use hubmesh_core::envelope::Envelope;
use hubmesh_core::errors::DeliveryError;
use hubmesh_core::hub::Hub;
use hubmesh_core::ids::NodeId;
use hubmesh_core::recipient::Recipient;
use hubmesh_telemetry::MetricsRecorder;

use crate::error::{BackplaneError, Result};

/// Cluster-wide fanout for hub `H`.
pub struct ClusterPublisher<H: Hub> {
    node_id: NodeId,
    topic: String,
    broker: Arc<dyn Broker>,
    delivery: Arc<dyn LocalDelivery>,
    metrics: Arc<MetricsRecorder>,
    _hub: PhantomData<fn() -> H>,
}

impl<H: Hub> Clone for ClusterPublisher<H> {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id.clone(),
            topic: self.topic.clone(),
            broker: Arc::clone(&self.broker),
            delivery: Arc::clone(&self.delivery),
            metrics: Arc::clone(&self.metrics),
            _hub: PhantomData,
        }
    }
}

impl<H: Hub> ClusterPublisher<H> {
    pub fn new(
        node_id: NodeId,
        topic: impl Into<String>,
        broker: Arc<dyn Broker>,
        delivery: Arc<dyn LocalDelivery>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            node_id,
            topic: topic.into(),
            broker,
            delivery,
            metrics,
            _hub: PhantomData,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Delivery service for this hub's local clients.
    pub fn delivery(&self) -> &Arc<dyn LocalDelivery> {
        &self.delivery
    }

    pub async fn send_all(
        &self,
        method: &str,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.local(cancel, self.delivery.send_to_all(method, &args, cancel))
            .await?;
        self.publish(method, args, Recipient::all(), cancel).await
    }

    pub async fn send_all_except(
        &self,
        method: &str,
        args: Vec<Value>,
        excluded_connection_ids: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.local(
            cancel,
            self.delivery
                .send_to_all_except(method, &args, &excluded_connection_ids, cancel),
        )
        .await?;
        self.publish(
            method,
            args,
            Recipient::all_except(excluded_connection_ids),
            cancel,
        )
        .await
    }

    pub async fn send_connection(
        &self,
        connection_id: &str,
        method: &str,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.local(
            cancel,
            self.delivery
                .send_to_connection(connection_id, method, &args, cancel),
        )
        .await?;
        self.publish(method, args, Recipient::connection(connection_id), cancel)
            .await
    }

    pub async fn send_connections(
        &self,
        connection_ids: Vec<String>,
        method: &str,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.local(
            cancel,
            self.delivery
                .send_to_connections(&connection_ids, method, &args, cancel),
        )
        .await?;
        self.publish(method, args, Recipient::connections(connection_ids), cancel)
            .await
    }

    pub async fn send_group(
        &self,
        group_name: &str,
        method: &str,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.local(
            cancel,
            self.delivery.send_to_group(group_name, method, &args, cancel),
        )
        .await?;
        self.publish(method, args, Recipient::group(group_name), cancel)
            .await
    }

    pub async fn send_group_except(
        &self,
        group_name: &str,
        method: &str,
        args: Vec<Value>,
        excluded_connection_ids: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.local(
            cancel,
            self.delivery.send_to_group_except(
                group_name,
                method,
                &args,
                &excluded_connection_ids,
                cancel,
            ),
        )
        .await?;
        self.publish(
            method,
            args,
            Recipient::group_except(group_name, excluded_connection_ids),
            cancel,
        )
        .await
    }

    pub async fn send_groups(
        &self,
        group_names: Vec<String>,
        method: &str,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.local(
            cancel,
            self.delivery.send_to_groups(&group_names, method, &args, cancel),
        )
        .await?;
        self.publish(method, args, Recipient::groups(group_names), cancel)
            .await
    }

    pub async fn send_user(
        &self,
        user_id: &str,
        method: &str,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.local(
            cancel,
            self.delivery.send_to_user(user_id, method, &args, cancel),
        )
        .await?;
        self.publish(method, args, Recipient::user(user_id), cancel)
            .await
    }

    pub async fn send_users(
        &self,
        user_ids: Vec<String>,
        method: &str,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.local(
            cancel,
            self.delivery.send_to_users(&user_ids, method, &args, cancel),
        )
        .await?;
        self.publish(method, args, Recipient::users(user_ids), cancel)
            .await
    }

    /// Group membership is per node; nothing is published.
    pub async fn add_to_group(
        &self,
        connection_id: &str,
        group_name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.local(
            cancel,
            self.delivery.add_to_group(connection_id, group_name, cancel),
        )
        .await
    }

    pub async fn remove_from_group(
        &self,
        connection_id: &str,
        group_name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.local(
            cancel,
            self.delivery
                .remove_from_group(connection_id, group_name, cancel),
        )
        .await
    }

    /// Publish an envelope for `recipient` without local delivery.
    pub async fn publish(
        &self,
        method: &str,
        args: Vec<Value>,
        recipient: Recipient,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(BackplaneError::Cancelled);
        }
        let kind = recipient.kind();
        let envelope = Envelope::new(self.node_id.clone(), H::NAME, method, args, vec![recipient]);
        let payload = envelope.encode()?;
        let bytes = payload.len();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BackplaneError::Cancelled),
            r = self.broker.publish(&self.topic, payload) => r.map_err(BackplaneError::from),
        };

        match &result {
            Ok(()) => {
                self.metrics
                    .counter_inc("backplane_envelopes_published_total", &[("hub", H::NAME)], 1);
                debug!(node_id = %self.node_id, hub = H::NAME, method, recipient = kind, bytes, "envelope published");
            }
            Err(e) => {
                self.metrics
                    .counter_inc("backplane_publish_failures_total", &[("hub", H::NAME)], 1);
                warn!(node_id = %self.node_id, hub = H::NAME, method, recipient = kind, error = %e, "envelope publish failed");
            }
        }
        result
    }

    async fn local<F>(&self, cancel: &CancellationToken, delivery: F) -> Result<()>
    where
        F: Future<Output = std::result::Result<(), DeliveryError>>,
    {
        if cancel.is_cancelled() {
            return Err(BackplaneError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BackplaneError::Cancelled),
            r = delivery => r.map_err(BackplaneError::from),
        }
    }
}
