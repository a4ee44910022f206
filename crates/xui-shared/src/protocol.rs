use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::constants::{LEGACY_WORLD_CHAT_KIND, WORLD_CHAT_KIND};
use crate::error::{Result, XuiError};
use crate::identity::NodeIdentity;
use crate::types::{now_ts, CallMode, NodeId};

// ---------------------------------------------------------------------------
// UDP discovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    Announce,
    Probe,
}

/// One discovery datagram.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryPacket {
    #[serde(rename = "type")]
    pub kind: DiscoveryKind,
    pub node_id: NodeId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub chat_port: u16,
    #[serde(default)]
    pub reply_port: u16,
    #[serde(default)]
    pub ts: f64,
}

impl DiscoveryPacket {
    pub fn new(kind: DiscoveryKind, identity: &NodeIdentity) -> Self {
        Self {
            kind,
            node_id: identity.node_id.clone(),
            name: identity.nickname.clone(),
            chat_port: identity.chat_port,
            reply_port: identity.discovery_port,
            ts: now_ts(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| XuiError::Parse(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// TCP chat envelopes
// ---------------------------------------------------------------------------

/// Per-type payload, tagged by the envelope's `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EnvelopeBody {
    Chat {
        text: String,
    },
    PrivateMessage {
        text: String,
    },
    FriendRequest {
        #[serde(default)]
        note: String,
    },
    VoiceMessage {
        #[serde(default)]
        mime: String,
        #[serde(default)]
        duration: f64,
        voice_b64: String,
    },
    CallInvite {
        mode: CallMode,
        audio_port: u16,
        #[serde(default)]
        video_port: u16,
        #[serde(default)]
        note: String,
    },
}

impl EnvelopeBody {
    pub fn voice(mime: &str, duration: f64, blob: &[u8]) -> Self {
        Self::VoiceMessage {
            mime: mime.to_string(),
            duration,
            voice_b64: base64::engine::general_purpose::STANDARD.encode(blob),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Chat { .. } => "chat",
            Self::PrivateMessage { .. } => "private_message",
            Self::FriendRequest { .. } => "friend_request",
            Self::VoiceMessage { .. } => "voice_message",
            Self::CallInvite { .. } => "call_invite",
        }
    }
}

/// One newline-delimited JSON line on a chat connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatEnvelope {
    #[serde(flatten)]
    pub body: EnvelopeBody,
    #[serde(default)]
    pub node_id: NodeId,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub ts: f64,
    #[serde(default)]
    pub reply_port: u16,
}

impl ChatEnvelope {
    pub fn new(identity: &NodeIdentity, body: EnvelopeBody) -> Self {
        Self {
            body,
            node_id: identity.node_id.clone(),
            from: identity.nickname.clone(),
            ts: now_ts(),
            reply_port: identity.chat_port,
        }
    }

    /// Serialize as a single newline-terminated line.
    pub fn to_line(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    pub fn from_line(line: &[u8]) -> Result<Self> {
        serde_json::from_slice(line).map_err(|e| XuiError::Parse(e.to_string()))
    }
}

/// Decode a received voice blob.
pub fn decode_voice(voice_b64: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(voice_b64.trim())
        .map_err(|e| XuiError::Parse(format!("voice blob: {e}")))
}

// ---------------------------------------------------------------------------
// World relay
// ---------------------------------------------------------------------------

/// Publish body posted to the relay topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldChatMessage {
    pub kind: String,
    #[serde(default)]
    pub node_id: NodeId,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub ts: f64,
}

impl WorldChatMessage {
    pub fn new(identity: &NodeIdentity, room: &str, text: &str) -> Self {
        Self {
            kind: WORLD_CHAT_KIND.to_string(),
            node_id: identity.node_id.clone(),
            from: identity.nickname.clone(),
            text: text.to_string(),
            room: room.to_string(),
            ts: now_ts(),
        }
    }

    pub fn is_world_chat(&self) -> bool {
        self.kind == WORLD_CHAT_KIND || self.kind == LEGACY_WORLD_CHAT_KIND
    }
}

/// One NDJSON line from the relay subscription stream.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RelayRecord {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub time: Option<serde_json::Value>,
}

impl RelayRecord {
    pub fn is_message(&self) -> bool {
        self.event == "message"
    }
}
