//! The cross-node wire message.
//!
//! An [`Envelope`] says "hub `target_hub` should invoke `method(args)` on
//! these recipients". It is serialized as camelCase JSON; optional fields that
//! are absent are omitted rather than written as `null`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EnvelopeError;
use crate::ids::NodeId;
use crate::recipient::Recipient;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Node that published the envelope.
    pub sender_id: NodeId,
    /// Discriminator of the hub whose delivery service must handle it.
    #[serde(default)]
    pub target_hub: String,
    /// Client-side method to invoke.
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<Recipient>>,
}

/// Reason an envelope failed validation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidEnvelope {
    #[error("target hub is empty")]
    MissingTargetHub,
    #[error("method is empty")]
    MissingMethod,
    #[error("args are missing")]
    MissingArgs,
    #[error("recipients are missing")]
    MissingRecipients,
    #[error("recipient {index} ({kind}) is missing its address")]
    MalformedRecipient { index: usize, kind: &'static str },
}

impl InvalidEnvelope {
    /// Short classification string for logging.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingTargetHub => "missing_target_hub",
            Self::MissingMethod => "missing_method",
            Self::MissingArgs => "missing_args",
            Self::MissingRecipients => "missing_recipients",
            Self::MalformedRecipient { .. } => "malformed_recipient",
        }
    }
}

impl Envelope {
    pub fn new(
        sender_id: NodeId,
        target_hub: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Value>,
        recipients: Vec<Recipient>,
    ) -> Self {
        Self {
            sender_id,
            target_hub: target_hub.into(),
            method: method.into(),
            args: Some(args),
            recipients: Some(recipients),
        }
    }

    /// Check the structural invariants a receiving node relies on.
    pub fn validate(&self) -> Result<(), InvalidEnvelope> {
        if self.target_hub.is_empty() {
            return Err(InvalidEnvelope::MissingTargetHub);
        }
        if self.method.is_empty() {
            return Err(InvalidEnvelope::MissingMethod);
        }
        if self.args.is_none() {
            return Err(InvalidEnvelope::MissingArgs);
        }
        let Some(recipients) = &self.recipients else {
            return Err(InvalidEnvelope::MissingRecipients);
        };
        if let Some((index, recipient)) = recipients
            .iter()
            .enumerate()
            .find(|(_, r)| !r.is_well_formed())
        {
            return Err(InvalidEnvelope::MalformedRecipient {
                index,
                kind: recipient.kind(),
            });
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Arguments, or an empty slice when absent.
    pub fn args(&self) -> &[Value] {
        self.args.as_deref().unwrap_or_default()
    }

    /// Recipients, or an empty slice when absent.
    pub fn recipients(&self) -> &[Recipient] {
        self.recipients.as_deref().unwrap_or_default()
    }

    /// Whether this envelope was published by `node`.
    pub fn is_from(&self, node: &NodeId) -> bool {
        &self.sender_id == node
    }

    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(EnvelopeError::Encode)
    }

    /// Decode a wire payload. Does not validate; see [`Envelope::validate`].
    pub fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(payload).map_err(EnvelopeError::Decode)
    }

    /// Decode then validate.
    pub fn decode_valid(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope = Self::decode(payload)?;
        envelope.validate().map_err(EnvelopeError::Invalid)?;
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Envelope {
        Envelope::new(
            NodeId::from_raw("node_a"),
            "chat",
            "ReceiveMessage",
            vec![json!(42), json!("hi"), json!({"nested": [1, 2]})],
            vec![
                Recipient::all_except(vec!["c1".into()]),
                Recipient::group_except("room1", vec!["c2".into()]),
                Recipient::users(vec!["alice".into()]),
            ],
        )
    }

    #[test]
    fn roundtrip_preserves_every_field_and_variant() {
        let original = sample();
        let bytes = original.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();

        assert_eq!(decoded.sender_id, original.sender_id);
        assert_eq!(decoded.target_hub, "chat");
        assert_eq!(decoded.method, "ReceiveMessage");
        assert_eq!(decoded.args(), original.args());
        assert_eq!(decoded.recipients(), original.recipients());
        assert!(matches!(
            decoded.recipients()[1],
            Recipient::Group { ref group_name, excluded_connection_ids: Some(ref ex) }
                if group_name == "room1" && ex == &vec!["c2".to_string()]
        ));
    }

    #[test]
    fn every_recipient_variant_survives_the_wire() {
        let recipients = vec![
            Recipient::all(),
            Recipient::all_except(vec!["c1".into(), "c2".into()]),
            Recipient::connection("c3"),
            Recipient::connections(vec!["c4".into(), "c5".into()]),
            Recipient::group("room1"),
            Recipient::group_except("room2", vec!["c6".into()]),
            Recipient::groups(vec!["room3".into(), "room4".into()]),
            Recipient::user("alice"),
            Recipient::users(vec!["bob".into(), "carol".into()]),
        ];
        let original = Envelope::new(
            NodeId::from_raw("node_a"),
            "chat",
            "Foo",
            vec![json!(42), json!("hi")],
            recipients.clone(),
        );

        let decoded = Envelope::decode_valid(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded.sender_id, original.sender_id);
        assert_eq!(decoded.recipients().len(), recipients.len());
        for (got, want) in decoded.recipients().iter().zip(&recipients) {
            assert_eq!(got.kind(), want.kind());
            assert_eq!(got, want);
        }
        let kinds: Vec<&str> = decoded.recipients().iter().map(Recipient::kind).collect();
        assert_eq!(
            kinds,
            ["all", "all", "connection", "connections", "group", "group", "groups", "user", "users"]
        );
    }

    #[test]
    fn wire_form_is_camel_case() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["senderId"], "node_a");
        assert_eq!(value["targetHub"], "chat");
        assert_eq!(value["method"], "ReceiveMessage");
        assert_eq!(value["recipients"][0]["type"], "all");
        assert_eq!(value["recipients"][2]["userIds"], json!(["alice"]));
    }

    #[test]
    fn valid_envelope_passes() {
        assert!(sample().is_valid());
    }

    #[test]
    fn empty_args_and_empty_recipients_are_valid() {
        let envelope = Envelope::new(NodeId::new(), "chat", "Ping", vec![], vec![]);
        assert!(envelope.is_valid());
    }

    #[test]
    fn missing_hub_is_invalid() {
        let mut envelope = sample();
        envelope.target_hub.clear();
        assert_eq!(envelope.validate(), Err(InvalidEnvelope::MissingTargetHub));
    }

    #[test]
    fn missing_method_is_invalid() {
        let mut envelope = sample();
        envelope.method.clear();
        assert_eq!(envelope.validate(), Err(InvalidEnvelope::MissingMethod));
    }

    #[test]
    fn null_args_and_null_recipients_are_invalid() {
        let payload = json!({
            "senderId": "node_b",
            "targetHub": "chat",
            "method": "Foo",
            "args": null,
            "recipients": [{"type": "all"}]
        });
        let envelope: Envelope = serde_json::from_value(payload).unwrap();
        assert_eq!(envelope.validate(), Err(InvalidEnvelope::MissingArgs));

        let payload = json!({
            "senderId": "node_b",
            "targetHub": "chat",
            "method": "Foo",
            "args": []
        });
        let envelope: Envelope = serde_json::from_value(payload).unwrap();
        assert_eq!(envelope.validate(), Err(InvalidEnvelope::MissingRecipients));
    }

    #[test]
    fn malformed_recipient_is_invalid() {
        let envelope = Envelope::new(
            NodeId::new(),
            "chat",
            "Foo",
            vec![],
            vec![Recipient::all(), Recipient::group("")],
        );
        assert_eq!(
            envelope.validate(),
            Err(InvalidEnvelope::MalformedRecipient {
                index: 1,
                kind: "group"
            })
        );
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            Envelope::decode(b"not json"),
            Err(EnvelopeError::Decode(_))
        ));
    }

    #[test]
    fn decode_rejects_missing_sender() {
        let payload = br#"{"targetHub":"chat","method":"Foo","args":[],"recipients":[]}"#;
        assert!(matches!(
            Envelope::decode(payload),
            Err(EnvelopeError::Decode(_))
        ));
    }

    #[test]
    fn decode_valid_reports_reason() {
        let payload = br#"{"senderId":"node_x","targetHub":"","method":"Foo","args":[],"recipients":[]}"#;
        match Envelope::decode_valid(payload) {
            Err(EnvelopeError::Invalid(reason)) => {
                assert_eq!(reason.reason(), "missing_target_hub");
            }
            other => panic!("expected invalid envelope, got {other:?}"),
        }
    }

    #[test]
    fn is_from_compares_sender() {
        let envelope = sample();
        assert!(envelope.is_from(&NodeId::from_raw("node_a")));
        assert!(!envelope.is_from(&NodeId::from_raw("node_b")));
    }

    #[test]
    fn absent_optionals_are_omitted_from_wire() {
        let mut envelope = sample();
        envelope.args = None;
        let text = String::from_utf8(envelope.encode().unwrap().to_vec()).unwrap();
        assert!(!text.contains("args"));
        assert!(!text.contains("null"));
    }
}
