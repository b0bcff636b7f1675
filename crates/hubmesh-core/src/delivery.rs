use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::DeliveryError;

/// In-process delivery of method invocations to the clients connected to
/// this node. One instance exists per hub.
///
/// The backplane never talks to clients itself: publishing nodes call these
/// operations for their own clients, and receiving nodes replay envelopes
/// against them.
#[async_trait]
pub trait LocalDelivery: Send + Sync {
    async fn send_to_all(
        &self,
        method: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError>;

    async fn send_to_all_except(
        &self,
        method: &str,
        args: &[Value],
        excluded_connection_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError>;

    async fn send_to_connection(
        &self,
        connection_id: &str,
        method: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError>;

    async fn send_to_connections(
        &self,
        connection_ids: &[String],
        method: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError>;

    async fn send_to_group(
        &self,
        group_name: &str,
        method: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError>;

    async fn send_to_group_except(
        &self,
        group_name: &str,
        method: &str,
        args: &[Value],
        excluded_connection_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError>;

    async fn send_to_groups(
        &self,
        group_names: &[String],
        method: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError>;

    async fn send_to_user(
        &self,
        user_id: &str,
        method: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError>;

    async fn send_to_users(
        &self,
        user_ids: &[String],
        method: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError>;

    /// Add a locally connected client to a group.
    async fn add_to_group(
        &self,
        connection_id: &str,
        group_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError>;

    /// Remove a locally connected client from a group.
    async fn remove_from_group(
        &self,
        connection_id: &str,
        group_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError>;
}

/// Lookup from hub discriminator to the local delivery service for that hub.
pub trait HubRegistry: Send + Sync {
    /// Returns `None` when this node does not serve the hub.
    fn resolve(&self, hub: &str) -> Option<Arc<dyn LocalDelivery>>;
}
