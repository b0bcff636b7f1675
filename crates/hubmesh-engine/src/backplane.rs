//! Composition root for one node.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use hubmesh_core::broker::{Broker, SubscriptionSpec};
use hubmesh_core::delivery::HubRegistry;
use hubmesh_core::hub::Hub;
use hubmesh_core::ids::NodeId;
use hubmesh_settings::BackplaneSettings;
use hubmesh_telemetry::MetricsRecorder;

use crate::dispatcher::{Dispatcher, DispatcherState};
use crate::error::{BackplaneError, Result};
use crate::publisher::ClusterPublisher;
use crate::subscription::TeardownReport;

/// Everything one node needs to take part in the cluster: its identity, the
/// broker, the hub registry, publishers and the dispatcher.
pub struct Backplane {
    node_id: NodeId,
    settings: BackplaneSettings,
    broker: Arc<dyn Broker>,
    registry: Arc<dyn HubRegistry>,
    metrics: Arc<MetricsRecorder>,
    dispatcher: Dispatcher,
}

impl Backplane {
    /// Build a node with a fresh [`NodeId`].
    pub fn new(
        settings: BackplaneSettings,
        broker: Arc<dyn Broker>,
        registry: Arc<dyn HubRegistry>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self::with_node_id(NodeId::new(), settings, broker, registry, metrics)
    }

    pub fn with_node_id(
        node_id: NodeId,
        settings: BackplaneSettings,
        broker: Arc<dyn Broker>,
        registry: Arc<dyn HubRegistry>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        let spec = SubscriptionSpec {
            topic: settings.topic_name.clone(),
            name: node_id.subscription_name(),
            idle_auto_delete: settings.idle_auto_delete(),
            message_ttl: settings.message_ttl(),
        };
        let dispatcher = Dispatcher::new(
            node_id.clone(),
            Arc::clone(&broker),
            spec,
            Arc::clone(&registry),
            Arc::clone(&metrics),
        );
        Self {
            node_id,
            settings,
            broker,
            registry,
            metrics,
            dispatcher,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn settings(&self) -> &BackplaneSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn state(&self) -> DispatcherState {
        self.dispatcher.state()
    }

    /// Publisher for hub `H`, bound to that hub's local delivery service.
    pub fn publisher<H: Hub>(&self) -> Result<ClusterPublisher<H>> {
        let delivery = self
            .registry
            .resolve(H::NAME)
            .ok_or_else(|| BackplaneError::UnknownHub(H::NAME.to_string()))?;
        Ok(ClusterPublisher::new(
            self.node_id.clone(),
            self.settings.topic_name.clone(),
            Arc::clone(&self.broker),
            delivery,
            Arc::clone(&self.metrics),
        ))
    }

    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        info!(node_id = %self.node_id, topic = %self.settings.topic_name, "starting backplane");
        self.dispatcher.start(cancel).await
    }

    pub async fn stop(&self, cancel: &CancellationToken) -> TeardownReport {
        self.dispatcher.stop(cancel).await
    }
}
