//! The engine facade: owns the identity, the background tasks and the
//! persisted settings, and exposes the operations a front-end calls.
//!
//! Construction never fails. Features that cannot get their sockets degrade
//! and say so through a `Status` event.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use xui_shared::constants::{STOP_JOIN_TIMEOUT, WORLD_PEER_HOST, WORLD_PEER_NAME};
use xui_shared::error::{Result, XuiError};
use xui_shared::protocol::EnvelopeBody;
use xui_shared::types::{peer_key, CallMode, NodeId, PeerSource};
use xui_shared::{sanitize_topic, NodeIdentity};

use crate::config::EngineConfig;
use crate::discovery;
use crate::events::{EngineEvent, EventBus, EventStream};
use crate::messaging::{self, Messenger};
use crate::peers::{Candidate, PeerRecord};
use crate::registry::{RegistryActor, RegistryHandle};
use crate::relay::{self, WorldSettings};
use crate::store::{ManualPeer, ManualPeerStore, WorldSettingsStore};

enum Lifecycle {
    /// Built, sockets claimed, nothing spawned yet.
    Idle {
        actor: RegistryActor,
        chat_listener: Option<std::net::TcpListener>,
    },
    Running(Vec<(&'static str, JoinHandle<()>)>),
    Stopped,
}

/// A running (or ready to run) peer link node.
pub struct Engine {
    identity: NodeIdentity,
    config: EngineConfig,
    bus: EventBus,
    events: Mutex<EventStream>,
    registry: RegistryHandle,
    messenger: Messenger,
    http: reqwest::Client,
    world_tx: watch::Sender<WorldSettings>,
    world_store: WorldSettingsStore,
    peer_store: ManualPeerStore,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

impl Engine {
    /// Claim a chat port, generate an identity and load world settings.
    pub fn new(nickname: &str, config: EngineConfig) -> Self {
        let (bus, events) = EventBus::channel();

        let chat_listener = messaging::claim_chat_port(config.chat_port_base, config.chat_port_span);
        let chat_port = chat_listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map_or(0, |addr| addr.port());
        if chat_port == 0 {
            let last = config
                .chat_port_base
                .saturating_add(config.chat_port_span.saturating_sub(1));
            warn!(base = config.chat_port_base, last, "No free chat port");
            bus.status(format!(
                "No free chat port in {}-{}; incoming messages are disabled",
                config.chat_port_base, last
            ));
        }

        let identity = NodeIdentity::generate(nickname, chat_port, config.discovery_port);
        let (registry, actor) = RegistryHandle::channel(bus.clone());
        let messenger = Messenger::new(identity.clone(), registry.clone());

        let world_store = WorldSettingsStore::new(config.world_settings_path());
        let world = world_store.load(WorldSettings {
            relay: config.relay_url.clone(),
            ..WorldSettings::default()
        });
        let (world_tx, _) = watch::channel(world);
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            node_id = %identity.node_id,
            nickname = %identity.nickname,
            chat_port,
            discovery_port = identity.discovery_port,
            "Engine created"
        );

        Self {
            peer_store: ManualPeerStore::new(config.peers_path()),
            identity,
            config,
            bus,
            events: Mutex::new(events),
            registry,
            messenger,
            http: reqwest::Client::new(),
            world_tx,
            world_store,
            shutdown_tx,
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle::Idle {
                actor,
                chat_listener,
            }),
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn every background loop and load manual peers. Calling it again
    /// while running is a no-op; a stopped engine cannot be restarted.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let (actor, chat_listener) = match mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Idle {
                actor,
                chat_listener,
            } => (actor, chat_listener),
            running @ Lifecycle::Running(_) => {
                *lifecycle = running;
                return Ok(());
            }
            Lifecycle::Stopped => return Err(XuiError::EngineStopped),
        };

        let mut tasks = Vec::new();
        tasks.push((
            "registry",
            tokio::spawn(actor.run(self.shutdown_tx.subscribe())),
        ));

        if let Some(listener) = chat_listener {
            match TcpListener::from_std(listener) {
                Ok(listener) => tasks.push((
                    "chat server",
                    tokio::spawn(messaging::run_server(
                        listener,
                        self.registry.clone(),
                        self.bus.clone(),
                        self.shutdown_tx.subscribe(),
                    )),
                )),
                Err(e) => {
                    warn!(error = %e, "Chat listener unusable");
                    self.bus
                        .status(format!("Chat server unavailable: {e}"));
                }
            }
        }

        if self.config.discovery_enabled {
            match discovery::bind_listener(self.config.discovery_port).await {
                Ok(socket) => {
                    tasks.push((
                        "discovery listener",
                        tokio::spawn(discovery::run_listener(
                            socket,
                            self.identity.clone(),
                            self.registry.clone(),
                            self.shutdown_tx.subscribe(),
                        )),
                    ));
                    tasks.push((
                        "discovery sender",
                        tokio::spawn(discovery::run_sender(
                            self.identity.clone(),
                            self.bus.clone(),
                            self.shutdown_tx.subscribe(),
                        )),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "LAN discovery disabled");
                    self.bus.status(format!("LAN discovery disabled: {e}"));
                }
            }
        } else {
            info!("LAN discovery disabled by configuration");
        }

        tasks.push((
            "world relay",
            tokio::spawn(relay::run_receiver(
                self.http.clone(),
                self.identity.clone(),
                self.world_tx.subscribe(),
                self.bus.clone(),
                self.shutdown_tx.subscribe(),
            )),
        ));

        *lifecycle = Lifecycle::Running(tasks);
        self.running.store(true, Ordering::SeqCst);
        drop(lifecycle);

        for peer in self.peer_store.load() {
            self.upsert_manual(&peer).await?;
        }
        if self.world_settings().enabled {
            self.upsert_world_peer().await?;
        }

        info!(tasks = self.task_count().await, "Engine started");
        self.bus.status(format!(
            "{} online (chat port {})",
            self.identity.nickname, self.identity.chat_port
        ));
        Ok(())
    }

    /// Signal shutdown and join every task, aborting any that take longer
    /// than the join timeout. Safe to call more than once.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        self.running.store(false, Ordering::SeqCst);

        let mut lifecycle = self.lifecycle.lock().await;
        let Lifecycle::Running(tasks) = mem::replace(&mut *lifecycle, Lifecycle::Stopped) else {
            return;
        };
        drop(lifecycle);

        for (name, mut handle) in tasks {
            match timeout(STOP_JOIN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "Task finished"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Task ended abnormally"),
                Err(_) => {
                    warn!(task = name, "Task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        info!("Engine stopped");
        self.bus.status("Engine stopped");
    }

    async fn task_count(&self) -> usize {
        match &*self.lifecycle.lock().await {
            Lifecycle::Running(tasks) => tasks.len(),
            _ => 0,
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(XuiError::EngineStopped)
        }
    }

    // -- Events --------------------------------------------------------------

    /// Every event queued since the last call, without waiting.
    pub fn take_events(&self) -> Vec<EngineEvent> {
        match self.events.try_lock() {
            Ok(mut events) => events.drain(),
            Err(_) => Vec::new(),
        }
    }

    /// Wait for the next event.
    pub async fn next_event(&self) -> Option<EngineEvent> {
        self.events.lock().await.next().await
    }

    // -- Peers ---------------------------------------------------------------

    /// Registry contents sorted by key. Empty unless running.
    pub async fn peers(&self) -> Vec<PeerRecord> {
        if !self.is_running() {
            return Vec::new();
        }
        self.registry.snapshot().await.unwrap_or_default()
    }

    pub async fn add_manual_peer(&self, name: &str, host: &str, port: u16) -> Result<()> {
        let host = host.trim();
        if host.is_empty() || port == 0 {
            return Err(XuiError::InvalidPeer(peer_key(host, port)));
        }
        let name = match name.trim() {
            "" => host,
            n => n,
        };
        let peer = ManualPeer {
            name: name.to_string(),
            host: host.to_string(),
            port,
        };

        self.peer_store.add(peer.clone())?;
        self.upsert_manual(&peer).await?;
        info!(peer = %peer_key(host, port), name, "Manual peer added");
        Ok(())
    }

    /// Forget a saved peer. Returns whether it was saved; discovered
    /// records under the same key are left alone.
    pub async fn remove_manual_peer(&self, host: &str, port: u16) -> Result<bool> {
        let host = host.trim();
        let removed = self.peer_store.remove(host, port)?;
        if removed {
            if self.is_running() {
                self.registry.remove(&peer_key(host, port)).await?;
            }
            info!(peer = %peer_key(host, port), "Manual peer removed");
        }
        Ok(removed)
    }

    async fn upsert_manual(&self, peer: &ManualPeer) -> Result<()> {
        self.registry
            .upsert(
                &peer.name,
                &peer.host,
                peer.port,
                PeerSource::Manual,
                &NodeId::default(),
            )
            .await
    }

    async fn upsert_world_peer(&self) -> Result<()> {
        self.registry
            .upsert(
                WORLD_PEER_NAME,
                WORLD_PEER_HOST,
                0,
                PeerSource::World,
                &NodeId::default(),
            )
            .await
    }

    // -- Direct messages -----------------------------------------------------

    async fn send(&self, host: &str, port: u16, body: EnvelopeBody) -> Result<Candidate> {
        self.ensure_running()?;
        self.messenger.send(host, port, body).await
    }

    pub async fn send_chat(&self, host: &str, port: u16, text: &str) -> Result<Candidate> {
        self.send(host, port, EnvelopeBody::Chat { text: text.to_string() })
            .await
    }

    pub async fn send_private_message(&self, host: &str, port: u16, text: &str) -> Result<Candidate> {
        self.send(
            host,
            port,
            EnvelopeBody::PrivateMessage {
                text: text.to_string(),
            },
        )
        .await
    }

    pub async fn send_friend_request(&self, host: &str, port: u16, note: &str) -> Result<Candidate> {
        self.send(
            host,
            port,
            EnvelopeBody::FriendRequest {
                note: note.to_string(),
            },
        )
        .await
    }

    pub async fn send_voice_message(
        &self,
        host: &str,
        port: u16,
        mime: &str,
        duration: f64,
        blob: &[u8],
    ) -> Result<Candidate> {
        self.send(host, port, EnvelopeBody::voice(mime, duration, blob))
            .await
    }

    pub async fn send_call_invite(
        &self,
        host: &str,
        port: u16,
        mode: CallMode,
        audio_port: u16,
        video_port: u16,
        note: &str,
    ) -> Result<Candidate> {
        self.send(
            host,
            port,
            EnvelopeBody::CallInvite {
                mode,
                audio_port,
                video_port,
                note: note.to_string(),
            },
        )
        .await
    }

    // -- World chat ----------------------------------------------------------

    pub fn world_settings(&self) -> WorldSettings {
        self.world_tx.borrow().clone()
    }

    pub async fn send_world_chat(&self, text: &str) -> Result<()> {
        let settings = self.world_settings();
        relay::publish(&self.http, &settings, &self.identity, text).await
    }

    /// Switch rooms. Returns the sanitized topic actually used.
    pub fn set_world_topic(&self, room: &str) -> Result<String> {
        let topic = sanitize_topic(room);
        self.world_tx.send_modify(|s| s.room = topic.clone());
        info!(room = %topic, "World room changed");
        self.bus.emit(EngineEvent::WorldRoom(topic.clone()));
        self.save_world_settings()?;
        Ok(topic)
    }

    pub async fn set_world_enabled(&self, enabled: bool) -> Result<()> {
        self.world_tx.send_modify(|s| s.enabled = enabled);

        if self.is_running() {
            if enabled {
                self.upsert_world_peer().await?;
            } else {
                self.registry
                    .remove(&peer_key(WORLD_PEER_HOST, 0))
                    .await?;
            }
        }

        let settings = self.world_settings();
        info!(enabled, room = %settings.room, "World chat toggled");
        if enabled {
            self.bus
                .world_status(format!("World chat enabled in room '{}'", settings.room));
        } else {
            self.bus.world_status("World chat disabled");
        }
        self.save_world_settings()
    }

    pub fn set_world_relay(&self, url: &str) -> Result<()> {
        let url = url.trim().trim_end_matches('/');
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(XuiError::Relay(format!("invalid relay URL '{url}'")));
        }
        self.world_tx.send_modify(|s| s.relay = url.to_string());
        info!(relay = url, "World relay changed");
        self.save_world_settings()
    }

    fn save_world_settings(&self) -> Result<()> {
        let settings = self.world_settings();
        self.world_store.save(&settings).map_err(|e| {
            warn!(error = %e, "Failed to save world settings");
            e
        })
    }

    /// Saved manual peers, as on disk.
    pub fn manual_peers(&self) -> Vec<ManualPeer> {
        self.peer_store.load()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(dir: &tempfile::TempDir, base: u16) -> EngineConfig {
        EngineConfig {
            chat_port_base: base,
            chat_port_span: 8,
            discovery_enabled: false,
            relay_url: "http://127.0.0.1:9".into(),
            data_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_new_claims_port_and_defaults_nickname() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new("  ", config(&dir, 47100));
        assert_eq!(engine.identity().nickname, "XUI");
        assert!(engine.identity().chat_port >= 47100);
        assert_eq!(engine.identity().node_id.as_str().len(), 12);
        assert!(!engine.world_settings().enabled);
    }

    #[tokio::test]
    async fn test_operations_require_start() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new("A", config(&dir, 47120));
        assert!(engine.peers().await.is_empty());
        let result = engine.send_chat("127.0.0.1", 47121, "hi").await;
        assert!(matches!(result, Err(XuiError::EngineStopped)));
    }

    #[tokio::test]
    async fn test_world_toggle_adds_and_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new("A", config(&dir, 47140));
        engine.start().await.unwrap();
        engine.take_events();

        engine.set_world_enabled(true).await.unwrap();
        let topic = engine.set_world_topic("Family Room!").unwrap();
        assert_eq!(topic, "family-room");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let peers = engine.peers().await;
        assert!(peers
            .iter()
            .any(|p| p.source == PeerSource::World && p.name == WORLD_PEER_NAME));

        let events = engine.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::WorldRoom(t) if t == "family-room")));

        engine.set_world_enabled(false).await.unwrap();
        assert!(engine
            .peers()
            .await
            .iter()
            .all(|p| p.source != PeerSource::World));
        assert!(matches!(
            engine.send_world_chat("hi").await,
            Err(XuiError::WorldDisabled)
        ));

        // Settings survive a restart of the process.
        let saved = WorldSettingsStore::new(dir.path().join("world_chat.json"))
            .load(WorldSettings::default());
        assert_eq!(saved.room, "family-room");
        assert!(!saved.enabled);

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_manual_peers_loaded_on_start() {
        let dir = tempfile::tempdir().unwrap();
        ManualPeerStore::new(dir.path().join("peers.json"))
            .add(ManualPeer {
                name: "alice".into(),
                host: "203.0.113.5".into(),
                port: 41000,
            })
            .unwrap();

        let engine = Engine::new("B", config(&dir, 47160));
        engine.start().await.unwrap();
        let peers = engine.peers().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].key(), "203.0.113.5:41000");
        assert_eq!(peers[0].source, PeerSource::Manual);

        assert!(engine.remove_manual_peer("203.0.113.5", 41000).await.unwrap());
        assert!(engine.peers().await.is_empty());
        assert!(engine.manual_peers().is_empty());

        assert!(engine.add_manual_peer("x", "", 41000).await.is_err());
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_removing_unsaved_peer_keeps_lan_record() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new("A", config(&dir, 47170));
        engine.start().await.unwrap();
        engine
            .registry
            .upsert("Bob", "10.0.0.2", 38601, PeerSource::Lan, &NodeId::from("b2"))
            .await
            .unwrap();
        engine.take_events();

        assert!(!engine.remove_manual_peer("10.0.0.2", 38601).await.unwrap());
        let peers = engine.peers().await;
        assert!(peers
            .iter()
            .any(|p| p.key() == "10.0.0.2:38601" && p.source == PeerSource::Lan));
        assert!(!engine
            .take_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::PeerDown { .. })));

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_bounded_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new("A", config(&dir, 47180));
        engine.start().await.unwrap();
        engine.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), engine.stop())
            .await
            .unwrap();
        engine.stop().await;
        assert!(!engine.is_running());
        assert!(matches!(engine.start().await, Err(XuiError::EngineStopped)));
    }
}
