//! Known-peer bookkeeping.
//!
//! [`PeerRegistry`] is a plain map from `host:port` to [`PeerRecord`]. It
//! holds no lock and spawns nothing; the registry task in
//! [`crate::registry`] owns the only instance and serializes access to it.
//! Every time-dependent method takes `now` explicitly so expiry can be
//! exercised without sleeping.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::debug;

use xui_shared::constants::LAN_PEER_TTL;
use xui_shared::types::{peer_key, NodeId, PeerSource};

/// A known remote endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    /// Display name the peer advertised (or the user gave it).
    pub name: String,
    pub host: String,
    pub port: u16,
    pub source: PeerSource,
    /// Empty for manual peers we have never heard from.
    pub node_id: NodeId,
    pub last_seen: Instant,
}

impl PeerRecord {
    pub fn key(&self) -> String {
        peer_key(&self.host, self.port)
    }
}

/// A concrete endpoint to try when delivering to a logical peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub host: String,
    pub port: u16,
    /// 0 = exact match, 1 = same node id, 2 = same host, 3 = same LAN name.
    pub rank: u8,
}

impl Candidate {
    pub fn key(&self) -> String {
        peer_key(&self.host, self.port)
    }
}

/// Map of known peers keyed by `host:port`.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerRecord>,
    lan_ttl: Duration,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::with_ttl(LAN_PEER_TTL)
    }

    pub fn with_ttl(lan_ttl: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            lan_ttl,
        }
    }

    /// Insert or refresh a record.
    ///
    /// Returns the stored record when the consumer should hear about it:
    /// the key is new, or its name, node id or source changed. Plain
    /// refreshes only bump `last_seen`, so periodic announces do not flood
    /// the event bus.
    ///
    /// A LAN sighting never demotes a manual or world record, and empty
    /// name/node id values never overwrite known ones.
    pub fn upsert(
        &mut self,
        name: &str,
        host: &str,
        port: u16,
        source: PeerSource,
        node_id: &NodeId,
        now: Instant,
    ) -> Option<PeerRecord> {
        let key = peer_key(host, port);

        match self.peers.get_mut(&key) {
            Some(existing) => {
                existing.last_seen = now;

                let mut changed = false;
                if !name.is_empty() && existing.name != name {
                    existing.name = name.to_string();
                    changed = true;
                }
                if !node_id.is_empty() && &existing.node_id != node_id {
                    existing.node_id = node_id.clone();
                    changed = true;
                }
                if source != PeerSource::Lan && existing.source != source {
                    existing.source = source;
                    changed = true;
                }

                changed.then(|| existing.clone())
            }
            None => {
                let record = PeerRecord {
                    name: if name.is_empty() { host.to_string() } else { name.to_string() },
                    host: host.to_string(),
                    port,
                    source,
                    node_id: node_id.clone(),
                    last_seen: now,
                };
                debug!(peer = %key, source = %source, "Tracking new peer");
                self.peers.insert(key, record.clone());
                Some(record)
            }
        }
    }

    /// Remove a record, returning it if it existed.
    pub fn remove(&mut self, key: &str) -> Option<PeerRecord> {
        let removed = self.peers.remove(key);
        if removed.is_some() {
            debug!(peer = %key, "Removed peer from registry");
        }
        removed
    }

    /// Drop LAN records not refreshed within the TTL. Returns removed keys.
    pub fn gc(&mut self, now: Instant) -> Vec<String> {
        let ttl = self.lan_ttl;
        let expired: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.source.expires() && now.saturating_duration_since(p.last_seen) > ttl)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            self.peers.remove(key);
            debug!(peer = %key, "LAN peer expired");
        }
        expired
    }

    pub fn get(&self, key: &str) -> Option<&PeerRecord> {
        self.peers.get(key)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All records, sorted by key.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut all: Vec<PeerRecord> = self.peers.values().cloned().collect();
        all.sort_by_key(|p| p.key());
        all
    }

    /// Ranked delivery candidates for the endpoint the caller selected.
    pub fn candidates(&self, host: &str, port: u16) -> Vec<Candidate> {
        rank_candidates(self.peers.values(), host, port)
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Order the concrete endpoints that may reach the peer selected as
/// `host:port`.
///
/// The selected endpoint always comes first, known or not. After it: other
/// endpoints sharing its node id (the peer moved ports), then other ports on
/// the same host, then LAN records advertising the same display name (the
/// peer moved hosts). World records and port 0 are never candidates. Inside
/// a rank the most recently seen endpoint wins.
pub fn rank_candidates<'a>(
    records: impl IntoIterator<Item = &'a PeerRecord>,
    host: &str,
    port: u16,
) -> Vec<Candidate> {
    let records: Vec<&PeerRecord> = records
        .into_iter()
        .filter(|r| r.source != PeerSource::World && r.port != 0)
        .collect();

    let selected = records.iter().find(|r| r.host == host && r.port == port);
    let node_id = selected.map(|r| r.node_id.clone()).unwrap_or_default();
    let name = selected.map(|r| r.name.clone()).unwrap_or_default();

    let mut ranked: Vec<(u8, Instant, &PeerRecord)> = Vec::new();
    for record in &records {
        let rank = if record.host == host && record.port == port {
            continue;
        } else if !node_id.is_empty() && record.node_id == node_id {
            1
        } else if record.host == host {
            2
        } else if !name.is_empty() && record.name == name && record.source == PeerSource::Lan {
            3
        } else {
            continue;
        };
        ranked.push((rank, record.last_seen, record));
    }
    ranked.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

    let mut out = Vec::with_capacity(ranked.len() + 1);
    let mut seen = HashSet::new();
    if port != 0 {
        seen.insert(peer_key(host, port));
        out.push(Candidate {
            host: host.to_string(),
            port,
            rank: 0,
        });
    }
    for (rank, _, record) in ranked {
        if seen.insert(record.key()) {
            out.push(Candidate {
                host: record.host.clone(),
                port: record.port,
                rank,
            });
        }
    }
    out
}
