use crate::constants::DEFAULT_NICKNAME;
use crate::types::NodeId;

/// The local process's identity. Immutable once the engine is built.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub nickname: String,
    /// 0 when no chat port could be bound.
    pub chat_port: u16,
    pub discovery_port: u16,
}

impl NodeIdentity {
    /// Build an identity with a fresh random node id.
    pub fn generate(nickname: &str, chat_port: u16, discovery_port: u16) -> Self {
        Self {
            node_id: NodeId::generate(),
            nickname: normalize_nickname(nickname),
            chat_port,
            discovery_port,
        }
    }

    pub fn can_receive_chat(&self) -> bool {
        self.chat_port != 0
    }
}

fn normalize_nickname(nickname: &str) -> String {
    let trimmed = nickname.trim();
    if trimmed.is_empty() {
        DEFAULT_NICKNAME.to_string()
    } else {
        trimmed.to_string()
    }
}
