//! Invocation fan-out to the clients connected to this node.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use hubmesh_core::delivery::LocalDelivery;
use hubmesh_core::errors::DeliveryError;
use hubmesh_core::hub::Hub;

use crate::connection::ClientConnection;

/// Frame type tag for a method invocation pushed to a client.
pub const INVOCATION_FRAME_TYPE: u8 = 1;

#[derive(Serialize)]
struct InvocationFrame<'a> {
    #[serde(rename = "type")]
    kind: u8,
    target: &'a str,
    arguments: &'a [Value],
}

/// Serialize the frame a client receives for `method(args)`.
pub fn encode_invocation(method: &str, args: &[Value]) -> Result<Arc<String>, DeliveryError> {
    let frame = InvocationFrame {
        kind: INVOCATION_FRAME_TYPE,
        target: method,
        arguments: args,
    };
    serde_json::to_string(&frame)
        .map(Arc::new)
        .map_err(|e| DeliveryError::Serialization(e.to_string()))
}

#[derive(Default)]
struct Inner {
    connections: HashMap<String, Arc<ClientConnection>>,
    /// Group name -> member connection ids.
    groups: HashMap<String, HashSet<String>>,
}

/// Tracks the connections, groups and users of one hub on this node.
pub struct ConnectionManager {
    hub: String,
    inner: RwLock<Inner>,
}

impl ConnectionManager {
    pub fn new(hub: impl Into<String>) -> Self {
        Self {
            hub: hub.into(),
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn for_hub<H: Hub>() -> Self {
        Self::new(H::NAME)
    }

    pub fn hub(&self) -> &str {
        &self.hub
    }

    /// Register a newly connected client.
    pub async fn on_connected(&self, connection: Arc<ClientConnection>) {
        let mut inner = self.inner.write().await;
        debug!(hub = %self.hub, conn_id = %connection.id, user_id = ?connection.user_id(), "client connected");
        let _ = inner
            .connections
            .insert(connection.id.as_str().to_string(), connection);
    }

    /// Forget a client and drop it from every group it joined.
    pub async fn on_disconnected(&self, connection_id: &str) {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.remove(connection_id) else {
            return;
        };
        for group in conn.groups() {
            if let Some(members) = inner.groups.get_mut(&group) {
                let _ = members.remove(connection_id);
                if members.is_empty() {
                    let _ = inner.groups.remove(&group);
                }
            }
        }
        debug!(hub = %self.hub, conn_id = connection_id, "client disconnected");
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Sorted member ids of a group.
    pub async fn group_members(&self, group_name: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut members: Vec<String> = inner
            .groups
            .get(group_name)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Push one frame to each target, logging the ones that could not take it.
    fn deliver<'a>(
        &self,
        targets: impl IntoIterator<Item = &'a Arc<ClientConnection>>,
        frame: &Arc<String>,
        method: &str,
    ) -> usize {
        let mut delivered = 0;
        for conn in targets {
            if conn.send(frame.clone()) {
                delivered += 1;
            } else {
                warn!(hub = %self.hub, conn_id = %conn.id, method, "failed to send invocation to client");
            }
        }
        delivered
    }

    fn group_targets<'a>(
        inner: &'a Inner,
        group_names: &[String],
    ) -> Vec<&'a Arc<ClientConnection>> {
        let mut seen = HashSet::new();
        group_names
            .iter()
            .filter_map(|g| inner.groups.get(g))
            .flat_map(|members| members.iter())
            .filter(|id| seen.insert(*id))
            .filter_map(|id| inner.connections.get(id))
            .collect()
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), DeliveryError> {
    if cancel.is_cancelled() {
        Err(DeliveryError::Cancelled)
    } else {
        Ok(())
    }
}

#[async_trait]
impl LocalDelivery for ConnectionManager {
    async fn send_to_all(
        &self,
        method: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        self.send_to_all_except(method, args, &[], cancel).await
    }

    async fn send_to_all_except(
        &self,
        method: &str,
        args: &[Value],
        excluded_connection_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        check_cancel(cancel)?;
        let frame = encode_invocation(method, args)?;
        let inner = self.inner.read().await;
        let targets = inner
            .connections
            .iter()
            .filter(|(id, _)| !excluded_connection_ids.contains(*id))
            .map(|(_, c)| c);
        let recipients = self.deliver(targets, &frame, method);
        debug!(hub = %self.hub, method, recipients, excluded = excluded_connection_ids.len(), "sent to all");
        Ok(())
    }

    /// Unknown ids are ignored: the connection usually lives on another node.
    async fn send_to_connection(
        &self,
        connection_id: &str,
        method: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        check_cancel(cancel)?;
        let frame = encode_invocation(method, args)?;
        let inner = self.inner.read().await;
        let Some(conn) = inner.connections.get(connection_id) else {
            return Ok(());
        };
        if !conn.send(frame) && conn.is_closed() {
            return Err(DeliveryError::ConnectionClosed(connection_id.to_string()));
        }
        Ok(())
    }

    async fn send_to_connections(
        &self,
        connection_ids: &[String],
        method: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        check_cancel(cancel)?;
        let frame = encode_invocation(method, args)?;
        let inner = self.inner.read().await;
        let mut seen = HashSet::new();
        let targets = connection_ids
            .iter()
            .filter(|id| seen.insert(*id))
            .filter_map(|id| inner.connections.get(id));
        let recipients = self.deliver(targets, &frame, method);
        debug!(hub = %self.hub, method, recipients, "sent to connections");
        Ok(())
    }

    async fn send_to_group(
        &self,
        group_name: &str,
        method: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        self.send_to_group_except(group_name, method, args, &[], cancel)
            .await
    }

    async fn send_to_group_except(
        &self,
        group_name: &str,
        method: &str,
        args: &[Value],
        excluded_connection_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        check_cancel(cancel)?;
        let frame = encode_invocation(method, args)?;
        let inner = self.inner.read().await;
        let Some(members) = inner.groups.get(group_name) else {
            return Ok(());
        };
        let targets = members
            .iter()
            .filter(|id| !excluded_connection_ids.contains(*id))
            .filter_map(|id| inner.connections.get(id));
        let recipients = self.deliver(targets, &frame, method);
        debug!(hub = %self.hub, group = group_name, method, recipients, "sent to group");
        Ok(())
    }

    async fn send_to_groups(
        &self,
        group_names: &[String],
        method: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        check_cancel(cancel)?;
        let frame = encode_invocation(method, args)?;
        let inner = self.inner.read().await;
        let targets = Self::group_targets(&inner, group_names);
        let recipients = self.deliver(targets, &frame, method);
        debug!(hub = %self.hub, groups = group_names.len(), method, recipients, "sent to groups");
        Ok(())
    }

    async fn send_to_user(
        &self,
        user_id: &str,
        method: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        self.send_to_users(&[user_id.to_string()], method, args, cancel)
            .await
    }

    async fn send_to_users(
        &self,
        user_ids: &[String],
        method: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        check_cancel(cancel)?;
        let frame = encode_invocation(method, args)?;
        let inner = self.inner.read().await;
        let targets = inner.connections.values().filter(|c| {
            c.user_id()
                .is_some_and(|u| user_ids.iter().any(|wanted| wanted == u))
        });
        let recipients = self.deliver(targets, &frame, method);
        debug!(hub = %self.hub, users = user_ids.len(), method, recipients, "sent to users");
        Ok(())
    }

    async fn add_to_group(
        &self,
        connection_id: &str,
        group_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        check_cancel(cancel)?;
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get(connection_id).cloned() else {
            return Err(DeliveryError::ConnectionNotFound(connection_id.to_string()));
        };
        if conn.join(group_name) {
            let _ = inner
                .groups
                .entry(group_name.to_string())
                .or_default()
                .insert(connection_id.to_string());
            debug!(hub = %self.hub, conn_id = connection_id, group = group_name, "joined group");
        }
        Ok(())
    }

    async fn remove_from_group(
        &self,
        connection_id: &str,
        group_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        check_cancel(cancel)?;
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get(connection_id).cloned() else {
            return Err(DeliveryError::ConnectionNotFound(connection_id.to_string()));
        };
        if conn.leave(group_name) {
            if let Some(members) = inner.groups.get_mut(group_name) {
                let _ = members.remove(connection_id);
                if members.is_empty() {
                    let _ = inner.groups.remove(group_name);
                }
            }
            debug!(hub = %self.hub, conn_id = connection_id, group = group_name, "left group");
        }
        Ok(())
    }
}
