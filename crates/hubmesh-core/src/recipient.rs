//! Addressing instructions carried by an envelope.
//!
//! Each variant knows which single [`LocalDelivery`] operation reproduces it
//! on a receiving node. The wire form is internally tagged with `"type"` so a
//! decoded recipient is always the same variant that was encoded.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::delivery::LocalDelivery;
use crate::errors::DeliveryError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Recipient {
    /// Every local connection except the excluded ones.
    All {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        excluded_connection_ids: Option<Vec<String>>,
    },
    /// Exactly one connection.
    Connection { connection_id: String },
    /// Exactly these connections.
    Connections { connection_ids: Vec<String> },
    /// Every member of a group except the excluded connections.
    Group {
        group_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        excluded_connection_ids: Option<Vec<String>>,
    },
    /// Every member of each named group.
    Groups { group_names: Vec<String> },
    /// Every connection belonging to one user.
    User { user_id: String },
    /// Every connection belonging to any of these users.
    Users { user_ids: Vec<String> },
}

impl Recipient {
    pub fn all() -> Self {
        Self::All {
            excluded_connection_ids: None,
        }
    }

    pub fn all_except(excluded: Vec<String>) -> Self {
        Self::All {
            excluded_connection_ids: Some(excluded),
        }
    }

    pub fn connection(connection_id: impl Into<String>) -> Self {
        Self::Connection {
            connection_id: connection_id.into(),
        }
    }

    pub fn connections(connection_ids: Vec<String>) -> Self {
        Self::Connections { connection_ids }
    }

    pub fn group(group_name: impl Into<String>) -> Self {
        Self::Group {
            group_name: group_name.into(),
            excluded_connection_ids: None,
        }
    }

    pub fn group_except(group_name: impl Into<String>, excluded: Vec<String>) -> Self {
        Self::Group {
            group_name: group_name.into(),
            excluded_connection_ids: Some(excluded),
        }
    }

    pub fn groups(group_names: Vec<String>) -> Self {
        Self::Groups { group_names }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self::User {
            user_id: user_id.into(),
        }
    }

    pub fn users(user_ids: Vec<String>) -> Self {
        Self::Users { user_ids }
    }

    /// Wire tag of the variant, used as a log field and metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::All { .. } => "all",
            Self::Connection { .. } => "connection",
            Self::Connections { .. } => "connections",
            Self::Group { .. } => "group",
            Self::Groups { .. } => "groups",
            Self::User { .. } => "user",
            Self::Users { .. } => "users",
        }
    }

    /// Whether the fields required by the variant's meaning are non-empty.
    pub fn is_well_formed(&self) -> bool {
        match self {
            Self::All { .. }
            | Self::Connections { .. }
            | Self::Groups { .. }
            | Self::Users { .. } => true,
            Self::Connection { connection_id } => !connection_id.is_empty(),
            Self::Group { group_name, .. } => !group_name.is_empty(),
            Self::User { user_id } => !user_id.is_empty(),
        }
    }

    /// Reproduce this addressing instruction against a local delivery service.
    ///
    /// Exclusion lists that were absent on the wire are replayed as empty.
    pub async fn replay(
        &self,
        delivery: &dyn LocalDelivery,
        method: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        match self {
            Self::All {
                excluded_connection_ids,
            } => {
                let excluded = excluded_connection_ids.as_deref().unwrap_or_default();
                delivery
                    .send_to_all_except(method, args, excluded, cancel)
                    .await
            }
            Self::Connection { connection_id } => {
                delivery
                    .send_to_connection(connection_id, method, args, cancel)
                    .await
            }
            Self::Connections { connection_ids } => {
                delivery
                    .send_to_connections(connection_ids, method, args, cancel)
                    .await
            }
            Self::Group {
                group_name,
                excluded_connection_ids,
            } => {
                let excluded = excluded_connection_ids.as_deref().unwrap_or_default();
                delivery
                    .send_to_group_except(group_name, method, args, excluded, cancel)
                    .await
            }
            Self::Groups { group_names } => {
                delivery
                    .send_to_groups(group_names, method, args, cancel)
                    .await
            }
            Self::User { user_id } => delivery.send_to_user(user_id, method, args, cancel).await,
            Self::Users { user_ids } => {
                delivery.send_to_users(user_ids, method, args, cancel).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{DeliveryCall, RecordingDelivery};
    use serde_json::json;

    fn args() -> Vec<Value> {
        vec![json!("hello"), json!(42)]
    }

    async fn replay_one(recipient: Recipient) -> Vec<DeliveryCall> {
        let delivery = RecordingDelivery::new();
        recipient
            .replay(&delivery, "Foo", &args(), &CancellationToken::new())
            .await
            .unwrap();
        delivery.calls()
    }

    #[tokio::test]
    async fn all_without_exclusions_replays_as_all_except_empty() {
        let calls = replay_one(Recipient::all()).await;
        assert_eq!(
            calls,
            vec![DeliveryCall::AllExcept {
                method: "Foo".into(),
                args: args(),
                excluded: vec![],
            }]
        );
    }

    #[tokio::test]
    async fn all_except_passes_exclusions() {
        let excluded = vec!["c1".to_string(), "c2".to_string()];
        let calls = replay_one(Recipient::all_except(excluded.clone())).await;
        assert_eq!(
            calls,
            vec![DeliveryCall::AllExcept {
                method: "Foo".into(),
                args: args(),
                excluded,
            }]
        );
    }

    #[tokio::test]
    async fn connection_replays_to_single_connection() {
        let calls = replay_one(Recipient::connection("c1")).await;
        assert_eq!(
            calls,
            vec![DeliveryCall::Connection {
                connection_id: "c1".into(),
                method: "Foo".into(),
                args: args(),
            }]
        );
    }

    #[tokio::test]
    async fn connections_replays_to_connection_set() {
        let ids = vec!["c1".to_string(), "c2".to_string()];
        let calls = replay_one(Recipient::connections(ids.clone())).await;
        assert_eq!(
            calls,
            vec![DeliveryCall::Connections {
                connection_ids: ids,
                method: "Foo".into(),
                args: args(),
            }]
        );
    }

    #[tokio::test]
    async fn group_without_exclusions_replays_as_group_except_empty() {
        let calls = replay_one(Recipient::group("room1")).await;
        assert_eq!(
            calls,
            vec![DeliveryCall::GroupExcept {
                group_name: "room1".into(),
                method: "Foo".into(),
                args: args(),
                excluded: vec![],
            }]
        );
    }

    #[tokio::test]
    async fn group_except_passes_exclusions() {
        let calls = replay_one(Recipient::group_except("room1", vec!["c1".into()])).await;
        assert_eq!(
            calls,
            vec![DeliveryCall::GroupExcept {
                group_name: "room1".into(),
                method: "Foo".into(),
                args: args(),
                excluded: vec!["c1".into()],
            }]
        );
    }

    #[tokio::test]
    async fn groups_replays_to_group_set() {
        let names = vec!["a".to_string(), "b".to_string()];
        let calls = replay_one(Recipient::groups(names.clone())).await;
        assert_eq!(
            calls,
            vec![DeliveryCall::Groups {
                group_names: names,
                method: "Foo".into(),
                args: args(),
            }]
        );
    }

    #[tokio::test]
    async fn user_and_users() {
        let calls = replay_one(Recipient::user("alice")).await;
        assert_eq!(
            calls,
            vec![DeliveryCall::User {
                user_id: "alice".into(),
                method: "Foo".into(),
                args: args(),
            }]
        );

        let ids = vec!["alice".to_string(), "bob".to_string()];
        let calls = replay_one(Recipient::users(ids.clone())).await;
        assert_eq!(
            calls,
            vec![DeliveryCall::Users {
                user_ids: ids,
                method: "Foo".into(),
                args: args(),
            }]
        );
    }

    #[tokio::test]
    async fn replay_propagates_delivery_failure() {
        let delivery = RecordingDelivery::failing(DeliveryError::ConnectionClosed("c1".into()));
        let err = Recipient::connection("c1")
            .replay(&delivery, "Foo", &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::ConnectionClosed("c1".into()));
    }

    #[test]
    fn wire_form_is_tagged_and_omits_absent_exclusions() {
        let json = serde_json::to_value(Recipient::group("room1")).unwrap();
        assert_eq!(json, json!({"type": "group", "groupName": "room1"}));

        let json = serde_json::to_value(Recipient::all_except(vec!["c1".into()])).unwrap();
        assert_eq!(json, json!({"type": "all", "excludedConnectionIds": ["c1"]}));
    }

    #[test]
    fn decoding_preserves_variant_identity() {
        let decoded: Recipient =
            serde_json::from_value(json!({"type": "users", "userIds": ["u1", "u2"]})).unwrap();
        assert_eq!(decoded, Recipient::users(vec!["u1".into(), "u2".into()]));

        let decoded: Recipient =
            serde_json::from_value(json!({"type": "user", "userId": "u1"})).unwrap();
        assert_eq!(decoded.kind(), "user");
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let result: Result<Recipient, _> =
            serde_json::from_value(json!({"type": "everyone", "userId": "u1"}));
        assert!(result.is_err());
    }

    #[test]
    fn well_formed_requires_addressing_fields() {
        assert!(Recipient::all().is_well_formed());
        assert!(Recipient::group("room1").is_well_formed());
        assert!(!Recipient::group("").is_well_formed());
        assert!(!Recipient::connection("").is_well_formed());
        assert!(!Recipient::user("").is_well_formed());
        assert!(Recipient::users(vec![]).is_well_formed());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let result: Result<Recipient, _> = serde_json::from_value(json!({"type": "connection"}));
        assert!(result.is_err());
    }
}
