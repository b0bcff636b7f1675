use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(
    /// Identity of one running node. Created once by the composition root and
    /// handed to the publisher and dispatcher; only ever compared for equality.
    NodeId,
    "node"
);

branded_id!(
    /// Identifier handed out to a locally connected client.
    ConnectionId,
    "conn"
);

impl NodeId {
    /// Name of the broker subscription owned by this node.
    pub fn subscription_name(&self) -> String {
        format!("sub-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_has_prefix() {
        let id = NodeId::new();
        assert!(id.as_str().starts_with("node_"), "got: {id}");
    }

    #[test]
    fn connection_id_has_prefix() {
        let id = ConnectionId::new();
        assert!(id.as_str().starts_with("conn_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(NodeId::new(), NodeId::new());
    }

    #[test]
    fn subscription_name_is_deterministic() {
        let id = NodeId::from_raw("node_abc");
        assert_eq!(id.subscription_name(), "sub-node_abc");
        assert_eq!(id.subscription_name(), id.clone().subscription_name());
    }

    #[test]
    fn serde_is_transparent() {
        let id = NodeId::from_raw("node_1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"node_1\"");
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn from_str_roundtrip() {
        let id: ConnectionId = "conn_x".parse().unwrap();
        assert_eq!(id.as_ref(), "conn_x");
    }
}
