//! The event bus: the only path from worker tasks to the consumer.
//!
//! Producers clone an [`EventBus`]; the single consumer owns the matching
//! [`EventStream`] and either drains it on a timer or awaits the next event.

use tokio::sync::mpsc;
use tracing::trace;

use xui_shared::protocol::ChatEnvelope;
use xui_shared::types::{CallMode, NodeId};

use crate::peers::PeerRecord;

/// Who sent an inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Sender {
    pub name: String,
    pub host: String,
    /// The sender's advertised chat port (0 if it cannot receive).
    pub port: u16,
    pub node_id: NodeId,
}

impl Sender {
    pub fn from_envelope(envelope: &ChatEnvelope, host: &str) -> Self {
        Self {
            name: envelope.from.clone(),
            host: host.to_string(),
            port: envelope.reply_port,
            node_id: envelope.node_id.clone(),
        }
    }
}

/// Everything the engine reports to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Status(String),
    PeerUp(PeerRecord),
    PeerDown {
        key: String,
    },
    Chat {
        sender: Sender,
        text: String,
    },
    PrivateMessage {
        sender: Sender,
        text: String,
    },
    FriendRequest {
        sender: Sender,
        note: String,
    },
    VoiceMessage {
        sender: Sender,
        mime: String,
        duration: f64,
        audio: Vec<u8>,
    },
    CallInvite {
        sender: Sender,
        mode: CallMode,
        audio_port: u16,
        video_port: u16,
        note: String,
    },
    WorldChat {
        from: String,
        node_id: NodeId,
        text: String,
        room: String,
        ts: f64,
    },
    WorldStatus(String),
    WorldRoom(String),
}

impl EngineEvent {
    /// Short tag, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::PeerUp(_) => "peer_up",
            Self::PeerDown { .. } => "peer_down",
            Self::Chat { .. } => "chat",
            Self::PrivateMessage { .. } => "private_message",
            Self::FriendRequest { .. } => "friend_request",
            Self::VoiceMessage { .. } => "voice_message",
            Self::CallInvite { .. } => "call_invite",
            Self::WorldChat { .. } => "world_chat",
            Self::WorldStatus(_) => "world_status",
            Self::WorldRoom(_) => "world_room",
        }
    }
}

/// Producer half. Cheap to clone; never blocks.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

/// Consumer half.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl EventBus {
    pub fn channel() -> (EventBus, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventBus { tx }, EventStream { rx })
    }

    pub fn emit(&self, event: EngineEvent) {
        trace!(kind = event.kind(), "Event emitted");
        // A dropped consumer just means nobody is listening any more.
        let _ = self.tx.send(event);
    }

    pub fn status(&self, text: impl Into<String>) {
        self.emit(EngineEvent::Status(text.into()));
    }

    pub fn world_status(&self, text: impl Into<String>) {
        self.emit(EngineEvent::WorldStatus(text.into()));
    }
}

impl EventStream {
    /// Take every pending event without waiting.
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait for the next event. `None` once every producer is gone.
    pub async fn next(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }
}
