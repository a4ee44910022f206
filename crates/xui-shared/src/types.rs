use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::NODE_ID_LEN;

// Node identity = 12 hex chars taken from a random UUID
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(hex[..NODE_ID_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Where a registry record came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PeerSource {
    #[serde(rename = "LAN")]
    Lan,
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "WORLD")]
    World,
}

impl PeerSource {
    /// Only LAN records expire.
    pub fn expires(self) -> bool {
        matches!(self, Self::Lan)
    }
}

impl std::fmt::Display for PeerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Lan => "LAN",
            Self::Manual => "manual",
            Self::World => "WORLD",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    Voice,
    VoiceScreen,
}

/// Registry key for an endpoint.
pub fn peer_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

/// Wall-clock seconds since the epoch, as carried in every `ts` field.
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
