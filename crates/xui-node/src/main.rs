//! # xui-node
//!
//! Terminal front-end for the XUI peer link.
//!
//! Runs one engine and provides:
//! - **LAN discovery** of other nodes on the local network
//! - **Direct messages** (chat, private, friend requests, call invites) over TCP
//! - **World chat** through an HTTP relay, one room at a time
//! - **Manual peers** saved to disk for hosts discovery cannot see
//!
//! Usage: `xui-node [nickname]` (or set `XUI_NICKNAME`). Type `/help` at the
//! prompt.

mod commands;
mod render;

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use xui_net::{Engine, EngineConfig};

use crate::commands::{Command, HELP};

/// How often queued engine events are printed.
const EVENT_POLL: Duration = Duration::from_millis(120);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,xui_net=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting xui-node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = EngineConfig::from_env();
    info!(?config, "Loaded configuration");

    let nickname = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("XUI_NICKNAME").ok())
        .unwrap_or_default();

    // -----------------------------------------------------------------------
    // 3. Start the engine
    // -----------------------------------------------------------------------
    let engine = Engine::new(&nickname, config);
    engine.start().await?;

    let me = engine.identity();
    println!(
        "{} [{}] chat port {}, world room #{}. Type /help.",
        me.nickname,
        me.node_id,
        me.chat_port,
        engine.world_settings().room
    );

    // -----------------------------------------------------------------------
    // 4. Prompt loop (blocks until /quit, EOF or Ctrl+C)
    // -----------------------------------------------------------------------
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut poll = tokio::time::interval(EVENT_POLL);

    loop {
        tokio::select! {
            _ = poll.tick() => {
                for event in engine.take_events() {
                    println!("{}", render::event_line(&event));
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match commands::parse(&line) {
                    None => {}
                    Some(Ok(Command::Quit)) => break,
                    Some(Ok(command)) => run(&engine, command).await,
                    Some(Err(e)) => println!("! {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    engine.stop().await;
    for event in engine.take_events() {
        println!("{}", render::event_line(&event));
    }
    Ok(())
}

/// Execute one command, printing the outcome.
async fn run(engine: &Engine, command: Command) {
    let outcome = match command {
        Command::Help => {
            println!("{HELP}");
            Ok(())
        }
        Command::Peers => {
            let peers = engine.peers().await;
            if peers.is_empty() {
                println!("(no peers yet)");
            }
            for peer in &peers {
                println!("{}", render::peer_line(peer));
            }
            Ok(())
        }
        Command::Chat { peer, text } => engine
            .send_chat(&peer.host, peer.port, &text)
            .await
            .map(|used| println!("-> {}", used.key())),
        Command::Private { peer, text } => engine
            .send_private_message(&peer.host, peer.port, &text)
            .await
            .map(|used| println!("-> [pm] {}", used.key())),
        Command::Friend { peer, note } => engine
            .send_friend_request(&peer.host, peer.port, &note)
            .await
            .map(|used| println!("-> friend request to {}", used.key())),
        Command::Call {
            peer,
            mode,
            audio_port,
            video_port,
        } => engine
            .send_call_invite(&peer.host, peer.port, mode, audio_port, video_port, "")
            .await
            .map(|used| println!("-> calling {}", used.key())),
        Command::World(text) => engine.send_world_chat(&text).await.map(|()| {
            let settings = engine.world_settings();
            println!("#{} <{}> {text}", settings.room, engine.identity().nickname);
        }),
        Command::Room(room) => engine.set_world_topic(&room).map(|_| ()),
        Command::WorldEnabled(enabled) => engine.set_world_enabled(enabled).await,
        Command::Relay(url) => engine
            .set_world_relay(&url)
            .map(|()| println!("* world relay is now {url}")),
        Command::AddPeer(peer) => engine
            .add_manual_peer(&peer.name, &peer.host, peer.port)
            .await,
        Command::RemovePeer { host, port } => engine
            .remove_manual_peer(&host, port)
            .await
            .map(|removed| {
                if !removed {
                    println!("! {host}:{port} was not a saved peer");
                }
            }),
        Command::Quit => Ok(()),
    };

    if let Err(e) = outcome {
        println!("! {e}");
    }
}
