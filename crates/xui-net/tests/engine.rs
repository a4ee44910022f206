//! Two engines talking over loopback, with LAN discovery and world chat off.

use std::time::Duration;

use tokio::time::timeout;

use xui_net::{Engine, EngineConfig, EngineEvent};
use xui_shared::types::{CallMode, PeerSource};
use xui_shared::XuiError;

fn config(dir: &tempfile::TempDir, base: u16) -> EngineConfig {
    EngineConfig {
        chat_port_base: base,
        chat_port_span: 10,
        discovery_enabled: false,
        relay_url: "http://127.0.0.1:9".into(),
        data_dir: dir.path().to_path_buf(),
        ..EngineConfig::default()
    }
}

async fn pair(base: u16) -> (Engine, Engine, tempfile::TempDir, tempfile::TempDir) {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let alice = Engine::new("Alice", config(&dir_a, base));
    let bob = Engine::new("Bob", config(&dir_b, base + 10));
    alice.start().await.unwrap();
    bob.start().await.unwrap();
    (alice, bob, dir_a, dir_b)
}

async fn wait_for(engine: &Engine, pred: impl Fn(&EngineEvent) -> bool) -> EngineEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(event) = engine.next_event().await {
                if pred(&event) {
                    return event;
                }
            }
        }
    })
    .await
    .expect("event not received in time")
}

fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn chat_reaches_peer_and_registers_sender() {
    let (alice, bob, _a, _b) = pair(47400).await;
    let alice_port = alice.identity().chat_port;
    let bob_port = bob.identity().chat_port;
    assert_ne!(alice_port, 0);
    assert_ne!(bob_port, 0);

    let used = bob.send_chat("127.0.0.1", alice_port, "hello alice").await.unwrap();
    assert_eq!(used.port, alice_port);
    assert_eq!(used.rank, 0);

    let event = wait_for(&alice, |e| matches!(e, EngineEvent::Chat { .. })).await;
    let EngineEvent::Chat { sender, text } = event else {
        unreachable!()
    };
    assert_eq!(text, "hello alice");
    assert_eq!(sender.name, "Bob");
    assert_eq!(sender.port, bob_port);
    assert_eq!(sender.node_id, bob.identity().node_id);

    let peers = alice.peers().await;
    let bob_record = peers
        .iter()
        .find(|p| p.key() == format!("127.0.0.1:{bob_port}"))
        .expect("sender registered");
    assert_eq!(bob_record.source, PeerSource::Lan);
    assert_eq!(bob_record.name, "Bob");

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn every_envelope_kind_is_delivered() {
    let (alice, bob, _a, _b) = pair(47420).await;
    let port = alice.identity().chat_port;

    bob.send_private_message("127.0.0.1", port, "psst").await.unwrap();
    let event = wait_for(&alice, |e| matches!(e, EngineEvent::PrivateMessage { .. })).await;
    assert!(matches!(event, EngineEvent::PrivateMessage { ref text, .. } if text == "psst"));

    bob.send_friend_request("127.0.0.1", port, "add me").await.unwrap();
    let event = wait_for(&alice, |e| matches!(e, EngineEvent::FriendRequest { .. })).await;
    assert!(matches!(event, EngineEvent::FriendRequest { ref note, .. } if note == "add me"));

    let clip: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    bob.send_voice_message("127.0.0.1", port, "audio/wav", 1.5, &clip)
        .await
        .unwrap();
    let event = wait_for(&alice, |e| matches!(e, EngineEvent::VoiceMessage { .. })).await;
    match event {
        EngineEvent::VoiceMessage {
            mime,
            duration,
            audio,
            ..
        } => {
            assert_eq!(mime, "audio/wav");
            assert_eq!(duration, 1.5);
            assert_eq!(audio, clip);
        }
        other => panic!("unexpected {other:?}"),
    }

    bob.send_call_invite("127.0.0.1", port, CallMode::VoiceScreen, 5004, 5006, "call?")
        .await
        .unwrap();
    let event = wait_for(&alice, |e| matches!(e, EngineEvent::CallInvite { .. })).await;
    match event {
        EngineEvent::CallInvite {
            mode,
            audio_port,
            video_port,
            ..
        } => {
            assert_eq!(mode, CallMode::VoiceScreen);
            assert_eq!(audio_port, 5004);
            assert_eq!(video_port, 5006);
        }
        other => panic!("unexpected {other:?}"),
    }

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn stale_port_falls_back_to_known_endpoint() {
    let (alice, bob, _a, _b) = pair(47440).await;
    let alice_port = alice.identity().chat_port;
    let bob_port = bob.identity().chat_port;

    // Alice writes first so Bob learns her node id and chat port.
    alice.send_chat("127.0.0.1", bob_port, "hi bob").await.unwrap();
    wait_for(&bob, |e| matches!(e, EngineEvent::Chat { .. })).await;

    let stale = dead_port();
    let used = bob.send_chat("127.0.0.1", stale, "still there?").await.unwrap();
    assert_eq!(used.port, alice_port);
    assert!(used.rank > 0);

    let event = wait_for(&alice, |e| matches!(e, EngineEvent::Chat { .. })).await;
    assert!(matches!(event, EngineEvent::Chat { ref text, .. } if text == "still there?"));

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn unreachable_peer_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new("Loner", config(&dir, 47460));
    engine.start().await.unwrap();

    let result = engine.send_chat("127.0.0.1", dead_port(), "anyone?").await;
    assert!(matches!(result, Err(XuiError::Delivery { attempts: 1, .. })));

    engine.stop().await;
}

#[tokio::test]
async fn manual_peer_is_persisted_and_not_expired() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new("Carol", config(&dir, 47480));
    engine.start().await.unwrap();
    engine
        .add_manual_peer("dave", "203.0.113.9", 41000)
        .await
        .unwrap();

    // Longer than the LAN TTL: manual peers never expire.
    tokio::time::sleep(Duration::from_secs(11)).await;
    let peers = engine.peers().await;
    assert!(peers
        .iter()
        .any(|p| p.key() == "203.0.113.9:41000" && p.source == PeerSource::Manual));
    engine.stop().await;

    let restarted = Engine::new("Carol", config(&dir, 47490));
    restarted.start().await.unwrap();
    assert!(restarted
        .peers()
        .await
        .iter()
        .any(|p| p.name == "dave"));
    restarted.stop().await;
}

#[tokio::test]
async fn stop_finishes_within_join_timeout() {
    let (alice, bob, _a, _b) = pair(47500).await;
    timeout(Duration::from_secs(5), async {
        alice.stop().await;
        bob.stop().await;
    })
    .await
    .expect("stop hung");

    let result = bob.send_chat("127.0.0.1", alice.identity().chat_port, "late").await;
    assert!(matches!(result, Err(XuiError::EngineStopped)));
}
