//! Parsing of the slash commands typed at the prompt.

use thiserror::Error;

use xui_net::{parse_peer_spec, ManualPeer};
use xui_shared::types::CallMode;

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("Unknown command: /{0} (try /help)")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Invalid peer: {0}")]
    Peer(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Peers,
    Quit,
    Chat { peer: ManualPeer, text: String },
    Private { peer: ManualPeer, text: String },
    Friend { peer: ManualPeer, note: String },
    Call { peer: ManualPeer, mode: CallMode, audio_port: u16, video_port: u16 },
    World(String),
    Room(String),
    WorldEnabled(bool),
    Relay(String),
    AddPeer(ManualPeer),
    RemovePeer { host: String, port: u16 },
}

pub const HELP: &str = "\
/peers                          list known peers
/msg <host:port> <text>         chat message
/pm <host:port> <text>          private message
/friend <host:port> [note]      friend request
/call <host:port> <audio> [video]  call invite (video port makes it a screen call)
/world <text>                   post to the world room (plain text does the same)
/room <name>                    switch world room
/worldchat on|off               toggle world chat
/relay <url>                    change world relay
/add [name@]<host:port>         save a manual peer
/remove <host:port>             forget a manual peer
/quit";

/// Parse one input line. Empty lines yield `None`.
pub fn parse(line: &str) -> Option<Result<Command, CommandError>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Ok(Command::World(line.to_string())));
    };

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };

    Some(match name.to_ascii_lowercase().as_str() {
        "help" | "h" => Ok(Command::Help),
        "peers" => Ok(Command::Peers),
        "quit" | "q" | "exit" => Ok(Command::Quit),
        "msg" => target_and_text(args, "/msg <host:port> <text>", true)
            .map(|(peer, text)| Command::Chat { peer, text }),
        "pm" => target_and_text(args, "/pm <host:port> <text>", true)
            .map(|(peer, text)| Command::Private { peer, text }),
        "friend" => target_and_text(args, "/friend <host:port> [note]", false)
            .map(|(peer, note)| Command::Friend { peer, note }),
        "call" => parse_call(args),
        "world" if !args.is_empty() => Ok(Command::World(args.to_string())),
        "world" => Err(CommandError::Usage("/world <text>")),
        "room" if !args.is_empty() => Ok(Command::Room(args.to_string())),
        "room" => Err(CommandError::Usage("/room <name>")),
        "worldchat" => match args.to_ascii_lowercase().as_str() {
            "on" => Ok(Command::WorldEnabled(true)),
            "off" => Ok(Command::WorldEnabled(false)),
            _ => Err(CommandError::Usage("/worldchat on|off")),
        },
        "relay" if !args.is_empty() => Ok(Command::Relay(args.to_string())),
        "relay" => Err(CommandError::Usage("/relay <url>")),
        "add" => parse_peer_spec(args)
            .map(Command::AddPeer)
            .map_err(|e| CommandError::Peer(e.to_string())),
        "remove" => parse_peer_spec(args)
            .map(|p| Command::RemovePeer {
                host: p.host,
                port: p.port,
            })
            .map_err(|e| CommandError::Peer(e.to_string())),
        other => Err(CommandError::Unknown(other.to_string())),
    })
}

fn target_and_text(
    args: &str,
    usage: &'static str,
    text_required: bool,
) -> Result<(ManualPeer, String), CommandError> {
    let (target, text) = match args.split_once(char::is_whitespace) {
        Some((target, text)) => (target, text.trim()),
        None => (args, ""),
    };
    if target.is_empty() || (text_required && text.is_empty()) {
        return Err(CommandError::Usage(usage));
    }
    let peer = parse_peer_spec(target).map_err(|e| CommandError::Peer(e.to_string()))?;
    Ok((peer, text.to_string()))
}

fn parse_call(args: &str) -> Result<Command, CommandError> {
    const USAGE: &str = "/call <host:port> <audio_port> [video_port]";
    let mut parts = args.split_whitespace();
    let target = parts.next().ok_or(CommandError::Usage(USAGE))?;
    let audio_port = parts
        .next()
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or(CommandError::Usage(USAGE))?;
    let video_port = match parts.next() {
        Some(p) => p.parse::<u16>().map_err(|_| CommandError::Usage(USAGE))?,
        None => 0,
    };
    let peer = parse_peer_spec(target).map_err(|e| CommandError::Peer(e.to_string()))?;
    let mode = if video_port == 0 {
        CallMode::Voice
    } else {
        CallMode::VoiceScreen
    };
    Ok(Command::Call {
        peer,
        mode,
        audio_port,
        video_port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(line: &str) -> Command {
        parse(line).unwrap().unwrap()
    }

    #[test]
    fn test_plain_text_goes_to_world() {
        assert_eq!(ok("hello everyone"), Command::World("hello everyone".into()));
        assert!(parse("   ").is_none());
    }

    #[test]
    fn test_msg() {
        match ok("/msg 192.168.1.20:38601 hi there") {
            Command::Chat { peer, text } => {
                assert_eq!(peer.host, "192.168.1.20");
                assert_eq!(peer.port, 38601);
                assert_eq!(text, "hi there");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            parse("/msg 192.168.1.20:38601").unwrap(),
            Err(CommandError::Usage("/msg <host:port> <text>"))
        );
    }

    #[test]
    fn test_friend_note_optional() {
        match ok("/friend 10.0.0.2:38600") {
            Command::Friend { note, .. } => assert!(note.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_call_modes() {
        match ok("/call 10.0.0.2:38600 5004") {
            Command::Call { mode, video_port, .. } => {
                assert_eq!(mode, CallMode::Voice);
                assert_eq!(video_port, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        match ok("/call 10.0.0.2:38600 5004 5006") {
            Command::Call { mode, .. } => assert_eq!(mode, CallMode::VoiceScreen),
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse("/call 10.0.0.2:38600").unwrap().is_err());
    }

    #[test]
    fn test_world_controls() {
        assert_eq!(ok("/worldchat ON"), Command::WorldEnabled(true));
        assert_eq!(ok("/room Family Room!"), Command::Room("Family Room!".into()));
        assert!(parse("/worldchat maybe").unwrap().is_err());
    }

    #[test]
    fn test_manual_peer_commands() {
        match ok("/add alice@203.0.113.5:41000") {
            Command::AddPeer(peer) => assert_eq!(peer.name, "alice"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            ok("/remove 203.0.113.5:41000"),
            Command::RemovePeer {
                host: "203.0.113.5".into(),
                port: 41000
            }
        );
        assert!(matches!(parse("/add nope").unwrap(), Err(CommandError::Peer(_))));
    }

    #[test]
    fn test_unknown() {
        assert_eq!(
            parse("/dance").unwrap(),
            Err(CommandError::Unknown("dance".into()))
        );
    }
}
