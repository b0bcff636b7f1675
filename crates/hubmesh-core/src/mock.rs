//! Test doubles for the collaborator traits.
//!
//! [`RecordingDelivery`] captures every call made against it so tests can
//! assert on the exact local operation a publish or replay produced.
//! [`MemoryRegistry`] is a fixed map from hub name to delivery service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::delivery::{HubRegistry, LocalDelivery};
use crate::errors::DeliveryError;

/// One recorded call against a [`RecordingDelivery`].
#[derive(Clone, Debug, PartialEq)]
pub enum DeliveryCall {
    All {
        method: String,
        args: Vec<Value>,
    },
    AllExcept {
        method: String,
        args: Vec<Value>,
        excluded: Vec<String>,
    },
    Connection {
        connection_id: String,
        method: String,
        args: Vec<Value>,
    },
    Connections {
        connection_ids: Vec<String>,
        method: String,
        args: Vec<Value>,
    },
    Group {
        group_name: String,
        method: String,
        args: Vec<Value>,
    },
    GroupExcept {
        group_name: String,
        method: String,
        args: Vec<Value>,
        excluded: Vec<String>,
    },
    Groups {
        group_names: Vec<String>,
        method: String,
        args: Vec<Value>,
    },
    User {
        user_id: String,
        method: String,
        args: Vec<Value>,
    },
    Users {
        user_ids: Vec<String>,
        method: String,
        args: Vec<Value>,
    },
    AddToGroup {
        connection_id: String,
        group_name: String,
    },
    RemoveFromGroup {
        connection_id: String,
        group_name: String,
    },
}

/// Delivery service that records calls and optionally fails them.
///
/// Failing instances still record the call before returning the error.
#[derive(Default)]
pub struct RecordingDelivery {
    calls: Mutex<Vec<DeliveryCall>>,
    failure: Option<DeliveryError>,
    /// Fail only the first `n` calls when set alongside `failure`.
    fail_first: Option<usize>,
    seen: AtomicUsize,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with `error`.
    pub fn failing(error: DeliveryError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    /// The first `n` calls fail with `error`; later calls succeed.
    pub fn failing_first(n: usize, error: DeliveryError) -> Self {
        Self {
            failure: Some(error),
            fail_first: Some(n),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<DeliveryCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn record(&self, call: DeliveryCall) -> Result<(), DeliveryError> {
        self.calls.lock().push(call);
        let index = self.seen.fetch_add(1, Ordering::Relaxed);
        match (&self.failure, self.fail_first) {
            (Some(err), Some(n)) if index < n => Err(err.clone()),
            (Some(err), None) => Err(err.clone()),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl LocalDelivery for RecordingDelivery {
    async fn send_to_all(
        &self,
        method: &str,
        args: &[Value],
        _cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        self.record(DeliveryCall::All {
            method: method.into(),
            args: args.to_vec(),
        })
    }

    async fn send_to_all_except(
        &self,
        method: &str,
        args: &[Value],
        excluded_connection_ids: &[String],
        _cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        self.record(DeliveryCall::AllExcept {
            method: method.into(),
            args: args.to_vec(),
            excluded: excluded_connection_ids.to_vec(),
        })
    }

    async fn send_to_connection(
        &self,
        connection_id: &str,
        method: &str,
        args: &[Value],
        _cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        self.record(DeliveryCall::Connection {
            connection_id: connection_id.into(),
            method: method.into(),
            args: args.to_vec(),
        })
    }

    async fn send_to_connections(
        &self,
        connection_ids: &[String],
        method: &str,
        args: &[Value],
        _cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        self.record(DeliveryCall::Connections {
            connection_ids: connection_ids.to_vec(),
            method: method.into(),
            args: args.to_vec(),
        })
    }

    async fn send_to_group(
        &self,
        group_name: &str,
        method: &str,
        args: &[Value],
        _cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        self.record(DeliveryCall::Group {
            group_name: group_name.into(),
            method: method.into(),
            args: args.to_vec(),
        })
    }

    async fn send_to_group_except(
        &self,
        group_name: &str,
        method: &str,
        args: &[Value],
        excluded_connection_ids: &[String],
        _cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        self.record(DeliveryCall::GroupExcept {
            group_name: group_name.into(),
            method: method.into(),
            args: args.to_vec(),
            excluded: excluded_connection_ids.to_vec(),
        })
    }

    async fn send_to_groups(
        &self,
        group_names: &[String],
        method: &str,
        args: &[Value],
        _cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        self.record(DeliveryCall::Groups {
            group_names: group_names.to_vec(),
            method: method.into(),
            args: args.to_vec(),
        })
    }

    async fn send_to_user(
        &self,
        user_id: &str,
        method: &str,
        args: &[Value],
        _cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        self.record(DeliveryCall::User {
            user_id: user_id.into(),
            method: method.into(),
            args: args.to_vec(),
        })
    }

    async fn send_to_users(
        &self,
        user_ids: &[String],
        method: &str,
        args: &[Value],
        _cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        self.record(DeliveryCall::Users {
            user_ids: user_ids.to_vec(),
            method: method.into(),
            args: args.to_vec(),
        })
    }

    async fn add_to_group(
        &self,
        connection_id: &str,
        group_name: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        self.record(DeliveryCall::AddToGroup {
            connection_id: connection_id.into(),
            group_name: group_name.into(),
        })
    }

    async fn remove_from_group(
        &self,
        connection_id: &str,
        group_name: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        self.record(DeliveryCall::RemoveFromGroup {
            connection_id: connection_id.into(),
            group_name: group_name.into(),
        })
    }
}

/// Fixed hub registry backed by a map.
#[derive(Default)]
pub struct MemoryRegistry {
    hubs: HashMap<String, Arc<dyn LocalDelivery>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, hub: impl Into<String>, delivery: Arc<dyn LocalDelivery>) -> Self {
        self.hubs.insert(hub.into(), delivery);
        self
    }
}

impl HubRegistry for MemoryRegistry {
    fn resolve(&self, hub: &str) -> Option<Arc<dyn LocalDelivery>> {
        self.hubs.get(hub).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failing_first_recovers() {
        let delivery = RecordingDelivery::failing_first(1, DeliveryError::Cancelled);
        let cancel = CancellationToken::new();
        assert!(delivery.send_to_all("A", &[], &cancel).await.is_err());
        assert!(delivery.send_to_all("B", &[], &cancel).await.is_ok());
        assert_eq!(delivery.call_count(), 2);
    }

    #[test]
    fn registry_resolves_registered_hubs_only() {
        let registry = MemoryRegistry::new().with("chat", Arc::new(RecordingDelivery::new()));
        assert!(registry.resolve("chat").is_some());
        assert!(registry.resolve("other").is_none());
    }
}
