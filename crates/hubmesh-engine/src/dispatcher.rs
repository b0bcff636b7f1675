//! Receiving side of the backplane.
//!
//! The [`Dispatcher`] owns the node's subscription and moves through
//! `Stopped -> Starting -> Listening -> Stopping -> Stopped`. While listening,
//! every payload the broker hands over runs through the [`ReceivePipeline`]:
//! decode, validate, drop own echoes, resolve the hub, replay each recipient.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hubmesh_core::broker::{Broker, Disposition, MessageHandler, SubscriptionSpec};
use hubmesh_core::delivery::HubRegistry;
use hubmesh_core::envelope::Envelope;
use hubmesh_core::errors::{BrokerError, DeliveryError};
use hubmesh_core::ids::NodeId;
use hubmesh_telemetry::MetricsRecorder;

use crate::error::{BackplaneError, Result};
use crate::subscription::{SubscriptionManager, TeardownReport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatcherState {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Listening => "listening",
            Self::Stopping => "stopping",
        })
    }
}

/// Why an envelope was dropped without any replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    Decode,
    Invalid,
    SelfOrigin,
    UnknownHub,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Invalid => "invalid",
            Self::SelfOrigin => "self",
            Self::UnknownHub => "unknown_hub",
        }
    }
}

/// Result of running one payload through the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
    Replayed { succeeded: usize, failed: usize },
    Dropped(DropReason),
    Cancelled,
}

/// Turns broker payloads into local delivery calls.
pub struct ReceivePipeline {
    node_id: NodeId,
    registry: Arc<dyn HubRegistry>,
    metrics: Arc<MetricsRecorder>,
}

impl ReceivePipeline {
    pub fn new(
        node_id: NodeId,
        registry: Arc<dyn HubRegistry>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            node_id,
            registry,
            metrics,
        }
    }

    pub async fn process(&self, payload: &[u8], cancel: &CancellationToken) -> PipelineOutcome {
        self.metrics
            .counter_inc("backplane_envelopes_received_total", &[], 1);

        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(node_id = %self.node_id, bytes = payload.len(), error = %e, "failed to decode envelope");
                return self.drop_with(DropReason::Decode);
            }
        };

        if let Err(reason) = envelope.validate() {
            warn!(
                node_id = %self.node_id,
                sender_id = %envelope.sender_id,
                hub = %envelope.target_hub,
                method = %envelope.method,
                reason = reason.reason(),
                "dropping invalid envelope"
            );
            return self.drop_with(DropReason::Invalid);
        }

        if envelope.is_from(&self.node_id) {
            return self.drop_with(DropReason::SelfOrigin);
        }

        let Some(delivery) = self.registry.resolve(&envelope.target_hub) else {
            warn!(
                node_id = %self.node_id,
                hub = %envelope.target_hub,
                method = %envelope.method,
                "no local delivery for hub, dropping envelope"
            );
            return self.drop_with(DropReason::UnknownHub);
        };

        let started = Instant::now();
        let (mut succeeded, mut failed) = (0, 0);
        for recipient in envelope.recipients() {
            if cancel.is_cancelled() {
                return PipelineOutcome::Cancelled;
            }
            let kind = recipient.kind();
            match recipient
                .replay(delivery.as_ref(), &envelope.method, envelope.args(), cancel)
                .await
            {
                Ok(()) => {
                    succeeded += 1;
                    self.metrics
                        .counter_inc("backplane_replays_total", &[("recipient", kind)], 1);
                }
                Err(DeliveryError::Cancelled) => return PipelineOutcome::Cancelled,
                Err(e) => {
                    failed += 1;
                    self.metrics
                        .counter_inc("backplane_replay_failures_total", &[("recipient", kind)], 1);
                    warn!(
                        node_id = %self.node_id,
                        hub = %envelope.target_hub,
                        method = %envelope.method,
                        recipient = kind,
                        error = %e,
                        "recipient replay failed"
                    );
                }
            }
        }
        self.metrics.histogram_observe(
            "backplane_replay_duration_ms",
            &[],
            started.elapsed().as_secs_f64() * 1000.0,
        );
        debug!(
            node_id = %self.node_id,
            sender_id = %envelope.sender_id,
            hub = %envelope.target_hub,
            method = %envelope.method,
            succeeded,
            failed,
            "envelope replayed"
        );
        PipelineOutcome::Replayed { succeeded, failed }
    }

    fn drop_with(&self, reason: DropReason) -> PipelineOutcome {
        self.metrics.counter_inc(
            "backplane_envelopes_dropped_total",
            &[("reason", reason.as_str())],
            1,
        );
        PipelineOutcome::Dropped(reason)
    }
}

#[async_trait]
impl MessageHandler for ReceivePipeline {
    async fn on_message(&self, payload: Bytes, cancel: CancellationToken) -> Disposition {
        match self.process(&payload, &cancel).await {
            PipelineOutcome::Cancelled => Disposition::Abandon,
            _ => Disposition::Complete,
        }
    }

    fn on_error(&self, error: &BrokerError) {
        warn!(node_id = %self.node_id, error = %error, kind = error.error_kind(), "receiver error");
    }
}

/// Owns the node's subscription and the pipeline attached to it.
pub struct Dispatcher {
    node_id: NodeId,
    state: Mutex<DispatcherState>,
    subscription: tokio::sync::Mutex<SubscriptionManager>,
    pipeline: Arc<ReceivePipeline>,
}

impl Dispatcher {
    pub fn new(
        node_id: NodeId,
        broker: Arc<dyn Broker>,
        spec: SubscriptionSpec,
        registry: Arc<dyn HubRegistry>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        let pipeline = Arc::new(ReceivePipeline::new(node_id.clone(), registry, metrics));
        Self {
            node_id,
            state: Mutex::new(DispatcherState::Stopped),
            subscription: tokio::sync::Mutex::new(SubscriptionManager::new(broker, spec)),
            pipeline,
        }
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.lock()
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn pipeline(&self) -> &Arc<ReceivePipeline> {
        &self.pipeline
    }

    /// Create the subscription if needed and start receiving.
    ///
    /// On failure the dispatcher is back in `Stopped`. A subscription this
    /// start created is deleted again; one it adopted is left for its messages.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != DispatcherState::Stopped {
                return Err(BackplaneError::InvalidState(format!(
                    "cannot start while {}",
                    *state
                )));
            }
            *state = DispatcherState::Starting;
        }

        let mut subscription = self.subscription.lock().await;
        let result = match subscription.ensure_exists(cancel).await {
            Ok(_) => subscription.listen(self.pipeline.clone()).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                let mut state = self.state.lock();
                if *state == DispatcherState::Starting {
                    *state = DispatcherState::Listening;
                }
                info!(node_id = %self.node_id, subscription = subscription.name(), "dispatcher listening");
                Ok(())
            }
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "dispatcher failed to start");
                let report = subscription.rollback(&CancellationToken::new()).await;
                if !report.is_clean() {
                    warn!(node_id = %self.node_id, ?report, "cleanup after failed start was incomplete");
                }
                *self.state.lock() = DispatcherState::Stopped;
                Err(e)
            }
        }
    }

    /// Close the receiver and delete the subscription.
    ///
    /// Always ends in `Stopped`. Stopping a stopped dispatcher does nothing.
    pub async fn stop(&self, cancel: &CancellationToken) -> TeardownReport {
        {
            let mut state = self.state.lock();
            if *state == DispatcherState::Stopped {
                return TeardownReport::default();
            }
            *state = DispatcherState::Stopping;
        }

        let report = self.subscription.lock().await.teardown(cancel).await;
        *self.state.lock() = DispatcherState::Stopped;
        if report.is_clean() {
            info!(node_id = %self.node_id, "dispatcher stopped");
        } else {
            warn!(node_id = %self.node_id, ?report, "dispatcher stopped with errors");
        }
        report
    }
}
