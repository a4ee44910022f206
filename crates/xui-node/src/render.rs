//! One-line rendering of engine events for the terminal.

use xui_net::{EngineEvent, PeerRecord, Sender};

fn who(sender: &Sender) -> String {
    format!("{} ({}:{})", sender.name, sender.host, sender.port)
}

pub fn peer_line(peer: &PeerRecord) -> String {
    format!(
        "{:<24} {:<7} {}",
        peer.key(),
        peer.source.to_string(),
        peer.name
    )
}

pub fn event_line(event: &EngineEvent) -> String {
    match event {
        EngineEvent::Status(text) => format!("* {text}"),
        EngineEvent::PeerUp(peer) => format!("+ {} [{}] {}", peer.name, peer.source, peer.key()),
        EngineEvent::PeerDown { key } => format!("- {key} gone"),
        EngineEvent::Chat { sender, text } => format!("<{}> {text}", who(sender)),
        EngineEvent::PrivateMessage { sender, text } => format!("[pm] <{}> {text}", who(sender)),
        EngineEvent::FriendRequest { sender, note } if note.is_empty() => {
            format!("{} wants to be friends", who(sender))
        }
        EngineEvent::FriendRequest { sender, note } => {
            format!("{} wants to be friends: {note}", who(sender))
        }
        EngineEvent::VoiceMessage {
            sender,
            mime,
            duration,
            audio,
        } => format!(
            "{} sent a voice message ({mime}, {duration:.1}s, {} bytes)",
            who(sender),
            audio.len()
        ),
        EngineEvent::CallInvite {
            sender,
            mode,
            audio_port,
            video_port,
            note,
        } => format!(
            "{} is calling ({mode:?}, audio {audio_port}, video {video_port}) {note}",
            who(sender)
        ),
        EngineEvent::WorldChat { from, text, room, .. } => format!("#{room} <{from}> {text}"),
        EngineEvent::WorldStatus(text) => format!("* world: {text}"),
        EngineEvent::WorldRoom(room) => format!("* world room is now #{room}"),
    }
}
