//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]`. Each type implements
//! [`Default`] with production default values and is marked
//! `#[serde(default)]`, so partial JSON is accepted.

mod backplane;
mod logging;

pub use backplane::*;
pub use logging::*;

use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// Root settings type for a hubmesh node.
///
/// ```json
/// {
///   "backplane": { "topicName": "signals", "messageTtlSecs": 600 },
///   "logging": { "level": "debug" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubmeshSettings {
    /// Settings schema version.
    pub version: String,
    /// Application name.
    pub name: String,
    pub backplane: BackplaneSettings,
    pub logging: LoggingSettings,
}

impl Default for HubmeshSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            name: "hubmesh".to_string(),
            backplane: BackplaneSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl HubmeshSettings {
    /// Reject values the backplane cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.backplane.validate()
    }
}
