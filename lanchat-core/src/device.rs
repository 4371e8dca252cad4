//! Discovered peer entries. The device list crosses the collaborator
//! boundary as JSON, so field names are part of the contract.

use serde::{Deserialize, Serialize};

/// One peer-reachable address. Lists are replaced wholesale on every
/// discovery pass; entries are never patched in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    pub is_local: bool,
}
