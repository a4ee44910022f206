//! Point-to-point chat over TCP.
//!
//! Every message travels on its own connection: the sender connects, writes
//! one or more newline-terminated JSON envelopes and closes. The receiver
//! reads to EOF (bounded by [`MAX_ENVELOPE_BYTES`]), then splits and
//! dispatches line by line.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use xui_shared::constants::{CONNECT_TIMEOUT, MAX_ENVELOPE_BYTES, READ_TIMEOUT, WRITE_TIMEOUT};
use xui_shared::error::{Result, XuiError};
use xui_shared::protocol::{decode_voice, ChatEnvelope, EnvelopeBody};
use xui_shared::types::{peer_key, PeerSource};
use xui_shared::NodeIdentity;

use crate::events::{EngineEvent, EventBus, Sender};
use crate::peers::Candidate;
use crate::registry::RegistryHandle;
use crate::shutdown::{self, ShutdownRx};

// ---------------------------------------------------------------------------
// Port selection
// ---------------------------------------------------------------------------

/// Bind the first free port in `base..base + span`.
///
/// Returns `None` when every port in the range is taken. The listener is
/// left non-blocking so it can be handed to tokio later.
pub fn claim_chat_port(base: u16, span: u16) -> Option<std::net::TcpListener> {
    for offset in 0..span.max(1) {
        let Some(port) = base.checked_add(offset) else {
            break;
        };
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        match std::net::TcpListener::bind(addr) {
            Ok(listener) => {
                if let Err(e) = listener.set_nonblocking(true) {
                    warn!(port, error = %e, "Cannot make chat listener non-blocking");
                    continue;
                }
                debug!(port, "Claimed chat port");
                return Some(listener);
            }
            Err(e) => debug!(port, error = %e, "Chat port busy"),
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Accept loop. In-flight connections are aborted when the loop exits.
pub async fn run_server(
    listener: TcpListener,
    registry: RegistryHandle,
    bus: EventBus,
    mut shutdown_rx: ShutdownRx,
) {
    let mut connections = JoinSet::new();
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Chat server listening");
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let registry = registry.clone();
                        let bus = bus.clone();
                        connections.spawn(async move {
                            handle_connection(stream, peer, registry, bus).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown::requested(&mut shutdown_rx) => break,
        }
    }

    connections.shutdown().await;
    info!("Chat server stopped");
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: RegistryHandle,
    bus: EventBus,
) {
    let payload = match timeout(READ_TIMEOUT, read_payload(&mut stream, MAX_ENVELOPE_BYTES)).await {
        Ok(Ok(p)) => p,
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "Dropping inbound payload");
            return;
        }
        Err(_) => {
            debug!(peer = %peer, "Inbound connection timed out");
            return;
        }
    };
    drop(stream);

    let host = canonical_host(peer.ip());
    for envelope in parse_payload(&payload) {
        if envelope.reply_port != 0 {
            let _ = registry
                .upsert(
                    &envelope.from,
                    &host,
                    envelope.reply_port,
                    PeerSource::Lan,
                    &envelope.node_id,
                )
                .await;
        }
        match envelope_event(envelope, &host) {
            Some(event) => {
                debug!(peer = %peer, kind = event.kind(), "Envelope received");
                bus.emit(event);
            }
            None => debug!(peer = %peer, "Dropping undecodable envelope"),
        }
    }
}

/// Read everything the peer sends, refusing payloads over `max` bytes.
pub async fn read_payload<R: AsyncRead + Unpin>(reader: &mut R, max: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.take(max as u64 + 1).read_to_end(&mut buf).await?;
    if buf.len() > max {
        return Err(XuiError::Oversize {
            size: buf.len(),
            max,
        });
    }
    Ok(buf)
}

/// Split a payload into envelopes, silently skipping blank, malformed and
/// unknown lines.
pub fn parse_payload(payload: &[u8]) -> Vec<ChatEnvelope> {
    payload
        .split(|b| *b == b'\n')
        .map(trim_line)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match ChatEnvelope::from_line(line) {
            Ok(env) => Some(env),
            Err(e) => {
                debug!(error = %e, "Skipping malformed envelope line");
                None
            }
        })
        .collect()
}

/// Turn an envelope from `host` into the event the consumer sees.
///
/// Returns `None` when a voice blob fails to decode.
pub fn envelope_event(envelope: ChatEnvelope, host: &str) -> Option<EngineEvent> {
    let sender = Sender::from_envelope(&envelope, host);
    let event = match envelope.body {
        EnvelopeBody::Chat { text } => EngineEvent::Chat { sender, text },
        EnvelopeBody::PrivateMessage { text } => EngineEvent::PrivateMessage { sender, text },
        EnvelopeBody::FriendRequest { note } => EngineEvent::FriendRequest { sender, note },
        EnvelopeBody::VoiceMessage {
            mime,
            duration,
            voice_b64,
        } => EngineEvent::VoiceMessage {
            sender,
            mime,
            duration,
            audio: decode_voice(&voice_b64).ok()?,
        },
        EnvelopeBody::CallInvite {
            mode,
            audio_port,
            video_port,
            note,
        } => EngineEvent::CallInvite {
            sender,
            mode,
            audio_port,
            video_port,
            note,
        },
    };
    Some(event)
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(line.len());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &line[start..end]
}

fn canonical_host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(|v4| v4.to_string())
            .unwrap_or_else(|| v6.to_string()),
        IpAddr::V4(v4) => v4.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Write one encoded payload to `host:port` and close.
pub async fn send_payload(host: &str, port: u16, payload: &[u8]) -> Result<()> {
    let addr = peer_key(host, port);

    let mut stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            return Err(XuiError::Connect {
                addr,
                reason: e.to_string(),
            })
        }
        Err(_) => {
            return Err(XuiError::Connect {
                addr,
                reason: "timed out".into(),
            })
        }
    };

    let write = async {
        stream.write_all(payload).await?;
        stream.shutdown().await?;
        Ok::<(), std::io::Error>(())
    };
    match timeout(WRITE_TIMEOUT, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(XuiError::Send {
            addr,
            reason: e.to_string(),
        }),
        Err(_) => Err(XuiError::Send {
            addr,
            reason: "timed out".into(),
        }),
    }
}

/// Try each candidate in order until one accepts the payload.
///
/// Per-candidate failures are logged and swallowed; only exhaustion is
/// returned. On success the endpoint that took the payload is returned.
pub async fn deliver(candidates: &[Candidate], payload: &[u8]) -> Result<Candidate> {
    let mut last = String::from("no delivery candidates");
    for (i, candidate) in candidates.iter().enumerate() {
        match send_payload(&candidate.host, candidate.port, payload).await {
            Ok(()) => {
                if i > 0 {
                    info!(
                        target_peer = %candidate.key(),
                        rank = candidate.rank,
                        "Delivered via fallback candidate"
                    );
                }
                return Ok(candidate.clone());
            }
            Err(e) => {
                debug!(target_peer = %candidate.key(), rank = candidate.rank, error = %e, "Candidate failed");
                last = e.to_string();
            }
        }
    }
    Err(XuiError::Delivery {
        attempts: candidates.len(),
        last,
    })
}

/// Outbound side: stamps envelopes with our identity and routes them
/// through the ranked candidate list.
#[derive(Debug, Clone)]
pub struct Messenger {
    identity: NodeIdentity,
    registry: RegistryHandle,
}

impl Messenger {
    pub fn new(identity: NodeIdentity, registry: RegistryHandle) -> Self {
        Self { identity, registry }
    }

    /// Send `body` to the peer selected as `host:port`.
    pub async fn send(&self, host: &str, port: u16, body: EnvelopeBody) -> Result<Candidate> {
        let kind = body.type_name();
        let line = ChatEnvelope::new(&self.identity, body).to_line()?;
        if line.len() > MAX_ENVELOPE_BYTES {
            return Err(XuiError::Oversize {
                size: line.len(),
                max: MAX_ENVELOPE_BYTES,
            });
        }

        let candidates = self.registry.candidates(host, port).await?;
        match deliver(&candidates, &line).await {
            Ok(used) => {
                debug!(kind, target_peer = %used.key(), "Envelope sent");
                Ok(used)
            }
            Err(e) => {
                warn!(kind, target_peer = %peer_key(host, port), error = %e, "Delivery failed");
                Err(e)
            }
        }
    }
}
