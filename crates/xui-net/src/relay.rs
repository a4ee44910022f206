//! World chat over a topic-addressed HTTP relay.
//!
//! Publishing is a plain POST of a JSON body to `{relay}/{topic}`. Receiving
//! holds a streaming GET on `{relay}/{topic}/json` and reads NDJSON records.
//! Any ntfy-compatible server works as the relay.
//!
//! The receive loop is driven by a `watch` channel of [`WorldSettings`]: a
//! settings change or a shutdown request interrupts an in-flight request or
//! read immediately instead of waiting for the socket to time out.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use xui_shared::constants::{
    DEDUPE_CAPACITY, DEFAULT_RELAY_URL, DEFAULT_WORLD_ROOM, RELAY_BACKOFF_MAX, RELAY_BACKOFF_MIN,
    RELAY_MIN_SESSION, RELAY_PUBLISH_TIMEOUT, RELAY_SESSION_TIMEOUT,
};
use xui_shared::error::{Result, XuiError};
use xui_shared::protocol::{RelayRecord, WorldChatMessage};
use xui_shared::types::{now_ts, NodeId};
use xui_shared::{sanitize_topic, NodeIdentity};

use crate::events::{EngineEvent, EventBus};
use crate::shutdown::{self, ShutdownRx};

/// A relay line longer than this is garbage; the buffer is reset.
const MAX_RELAY_LINE: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// World chat settings, persisted as `{"room","enabled","relay"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorldSettings {
    #[serde(default = "default_room")]
    pub room: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_relay")]
    pub relay: String,
}

fn default_room() -> String {
    DEFAULT_WORLD_ROOM.to_string()
}

fn default_relay() -> String {
    DEFAULT_RELAY_URL.to_string()
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            room: default_room(),
            enabled: false,
            relay: default_relay(),
        }
    }
}

impl WorldSettings {
    /// Sanitized room, trimmed relay URL (empty falls back to the default).
    pub fn normalized(mut self) -> Self {
        self.room = sanitize_topic(&self.room);
        let relay = self.relay.trim().trim_end_matches('/');
        self.relay = if relay.is_empty() {
            default_relay()
        } else {
            relay.to_string()
        };
        self
    }

    pub fn publish_url(&self) -> String {
        format!("{}/{}", self.relay, self.room)
    }

    pub fn subscribe_url(&self) -> String {
        format!("{}/{}/json", self.relay, self.room)
    }
}

// ---------------------------------------------------------------------------
// Dedupe and filtering
// ---------------------------------------------------------------------------

/// Fixed-capacity set of recently seen relay ids. The oldest id is evicted
/// first, in O(1).
#[derive(Debug, Clone)]
pub struct DedupeSet {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl DedupeSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`. Returns `false` if it was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

impl Default for DedupeSet {
    fn default() -> Self {
        Self::new(DEDUPE_CAPACITY)
    }
}

/// Turns relay NDJSON lines into `WorldChat` events for the active room.
#[derive(Debug, Clone)]
pub struct WorldInbox {
    local: NodeId,
    topic: String,
    dedupe: DedupeSet,
}

impl WorldInbox {
    pub fn new(local: NodeId, topic: &str) -> Self {
        Self {
            local,
            topic: sanitize_topic(topic),
            dedupe: DedupeSet::default(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Switch rooms. The dedupe memory only resets when the room changes.
    pub fn set_topic(&mut self, topic: &str) {
        let topic = sanitize_topic(topic);
        if topic != self.topic {
            debug!(from = %self.topic, to = %topic, "World inbox switched room");
            self.topic = topic;
            self.dedupe.clear();
        }
    }

    /// Process one NDJSON line.
    ///
    /// Drops non-message records, repeated ids, bodies of another kind or
    /// room, and our own echoes. A body that is not JSON at all is kept as
    /// plain text attributed to the record title.
    pub fn accept_line(&mut self, line: &[u8]) -> Option<EngineEvent> {
        let text = std::str::from_utf8(line).ok()?.trim();
        if text.is_empty() {
            return None;
        }

        let record: RelayRecord = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "Skipping malformed relay line");
                return None;
            }
        };
        if !record.is_message() {
            return None;
        }
        if !record.id.is_empty() && !self.dedupe.insert(&record.id) {
            debug!(id = %record.id, "Duplicate relay message");
            return None;
        }

        match serde_json::from_str::<WorldChatMessage>(&record.message) {
            Ok(msg) => {
                if !msg.is_world_chat() || sanitize_topic(&msg.room) != self.topic {
                    return None;
                }
                if msg.node_id == self.local {
                    return None;
                }
                Some(EngineEvent::WorldChat {
                    from: msg.from,
                    node_id: msg.node_id,
                    text: msg.text,
                    room: self.topic.clone(),
                    ts: msg.ts,
                })
            }
            Err(_) => {
                let body = record.message.trim();
                if body.is_empty() {
                    return None;
                }
                let from = if record.title.trim().is_empty() {
                    "world".to_string()
                } else {
                    record.title.trim().to_string()
                };
                Some(EngineEvent::WorldChat {
                    from,
                    node_id: NodeId::default(),
                    text: body.to_string(),
                    room: self.topic.clone(),
                    ts: record
                        .time
                        .as_ref()
                        .and_then(serde_json::Value::as_f64)
                        .unwrap_or_else(now_ts),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Publish
// ---------------------------------------------------------------------------

/// Post one world chat line to the active room.
pub async fn publish(
    client: &reqwest::Client,
    settings: &WorldSettings,
    identity: &NodeIdentity,
    text: &str,
) -> Result<()> {
    if !settings.enabled {
        return Err(XuiError::WorldDisabled);
    }

    let body = serde_json::to_string(&WorldChatMessage::new(identity, &settings.room, text))?;
    let mut request = client
        .post(settings.publish_url())
        .header(CONTENT_TYPE, "text/plain")
        .timeout(RELAY_PUBLISH_TIMEOUT)
        .body(body);
    if let Ok(title) = HeaderValue::from_str(&identity.nickname) {
        request = request.header("Title", title);
    }

    let response = request
        .send()
        .await
        .map_err(|e| XuiError::Relay(e.to_string()))?;
    if !response.status().is_success() {
        return Err(XuiError::Relay(format!("publish returned {}", response.status())));
    }

    debug!(room = %settings.room, "World chat published");
    Ok(())
}

// ---------------------------------------------------------------------------
// Receive loop
// ---------------------------------------------------------------------------

/// Doubling backoff, capped.
pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(RELAY_BACKOFF_MAX)
}

struct LinkState {
    connected: bool,
    backoff: Duration,
}

impl LinkState {
    fn mark_connected(&mut self, bus: &EventBus, room: &str) {
        if !self.connected {
            self.connected = true;
            info!(room, "World relay connected");
            bus.world_status(format!("Connected to world room '{room}'"));
        }
    }

    /// Current delay, advancing the backoff for next time.
    fn take_delay(&mut self) -> Duration {
        let delay = self.backoff;
        self.backoff = next_backoff(delay);
        delay
    }
}

/// Subscription loop. Sleeps without touching the network while disabled.
///
/// Every reconnect is rate limited: a session that fails, or that the relay
/// closes within [`RELAY_MIN_SESSION`], waits out the current backoff first.
pub async fn run_receiver(
    client: reqwest::Client,
    identity: NodeIdentity,
    mut settings_rx: watch::Receiver<WorldSettings>,
    bus: EventBus,
    mut shutdown_rx: ShutdownRx,
) {
    let mut inbox = WorldInbox::new(identity.node_id.clone(), &settings_rx.borrow().room);
    let mut link = LinkState {
        connected: false,
        backoff: RELAY_BACKOFF_MIN,
    };
    info!("World relay receiver running");

    loop {
        let settings = settings_rx.borrow_and_update().clone();
        inbox.set_topic(&settings.room);

        if !settings.enabled {
            link.connected = false;
            tokio::select! {
                changed = settings_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = shutdown::requested(&mut shutdown_rx) => break,
            }
        }

        let started = Instant::now();
        let session = tokio::select! {
            result = run_session(&client, &settings, &mut inbox, &bus, &mut link) => result,
            changed = settings_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                link.connected = false;
                link.backoff = RELAY_BACKOFF_MIN;
                continue;
            }
            _ = shutdown::requested(&mut shutdown_rx) => break,
        };
        if started.elapsed() >= RELAY_MIN_SESSION {
            link.backoff = RELAY_BACKOFF_MIN;
        }

        let delay = match session {
            Ok(()) if started.elapsed() >= RELAY_MIN_SESSION => continue,
            Ok(()) => {
                let delay = link.take_delay();
                debug!(retry_in = ?delay, "World relay closed the subscription early");
                delay
            }
            Err(e) => {
                link.connected = false;
                let delay = link.take_delay();
                warn!(error = %e, retry_in = ?delay, "World relay unavailable");
                bus.world_status(format!(
                    "World relay unavailable, retrying in {:.1}s: {e}",
                    delay.as_secs_f64()
                ));
                delay
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = settings_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                // Retry immediately with the new settings.
                link.connected = false;
                link.backoff = RELAY_BACKOFF_MIN;
            }
            _ = shutdown::requested(&mut shutdown_rx) => break,
        }
    }

    info!("World relay receiver stopped");
}

/// One streaming GET. `Ok` means the session ended naturally.
async fn run_session(
    client: &reqwest::Client,
    settings: &WorldSettings,
    inbox: &mut WorldInbox,
    bus: &EventBus,
    link: &mut LinkState,
) -> Result<()> {
    let response = client
        .get(settings.subscribe_url())
        .timeout(RELAY_SESSION_TIMEOUT)
        .send()
        .await
        .map_err(|e| XuiError::Relay(e.to_string()))?;
    if !response.status().is_success() {
        return Err(XuiError::Relay(format!("subscribe returned {}", response.status())));
    }
    link.mark_connected(bus, &settings.room);

    let mut stream = response.bytes_stream();
    let mut pending: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) if e.is_timeout() => return Ok(()),
            Err(e) => return Err(XuiError::Relay(e.to_string())),
        };
        pending.extend_from_slice(&chunk);

        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            if let Some(event) = inbox.accept_line(&line) {
                bus.emit(event);
            }
        }
        if pending.len() > MAX_RELAY_LINE {
            warn!(len = pending.len(), "Discarding oversized relay line");
            pending.clear();
        }
    }
    if let Some(event) = inbox.accept_line(&pending) {
        bus.emit(event);
    }
    Ok(())
}
