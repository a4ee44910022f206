//! JSON persistence for manual peers and world chat settings.
//!
//! Both files are small and rewritten whole. A missing or unreadable file is
//! treated as empty so a broken file never keeps the engine from starting.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use xui_shared::error::{Result, XuiError};

use crate::relay::WorldSettings;

/// A peer entered by hand, reachable without discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManualPeer {
    pub name: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ManualPeerFile {
    #[serde(default)]
    manual_peers: Vec<ManualPeer>,
}

/// Parse `name@host:port` or `host:port` (the host doubles as the name).
pub fn parse_peer_spec(raw: &str) -> Result<ManualPeer> {
    let raw = raw.trim();
    let (name, addr) = match raw.split_once('@') {
        Some((name, addr)) => (name.trim(), addr.trim()),
        None => ("", raw),
    };

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| XuiError::InvalidPeer(format!("missing port in '{raw}'")))?;
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(XuiError::InvalidPeer(format!("missing host in '{raw}'")));
    }
    let port = match port.trim().parse::<u16>() {
        Ok(p) if p > 0 => p,
        _ => return Err(XuiError::InvalidPeer(format!("bad port in '{raw}'"))),
    };

    Ok(ManualPeer {
        name: if name.is_empty() { host.to_string() } else { name.to_string() },
        host: host.to_string(),
        port,
    })
}

/// `<data_dir>/peers.json`.
#[derive(Debug, Clone)]
pub struct ManualPeerStore {
    path: PathBuf,
}

impl ManualPeerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Vec<ManualPeer> {
        read_json::<ManualPeerFile>(&self.path)
            .map(|file| file.manual_peers)
            .unwrap_or_default()
    }

    pub fn save(&self, peers: &[ManualPeer]) -> Result<()> {
        let file = ManualPeerFile {
            manual_peers: peers.to_vec(),
        };
        write_json(&self.path, &file)
    }

    /// Insert or replace the entry for `peer.host:peer.port`.
    pub fn add(&self, peer: ManualPeer) -> Result<Vec<ManualPeer>> {
        let mut peers = self.load();
        peers.retain(|p| !(p.host == peer.host && p.port == peer.port));
        peers.push(peer);
        self.save(&peers)?;
        Ok(peers)
    }

    /// Returns whether an entry was removed.
    pub fn remove(&self, host: &str, port: u16) -> Result<bool> {
        let mut peers = self.load();
        let before = peers.len();
        peers.retain(|p| !(p.host == host && p.port == port));
        if peers.len() == before {
            return Ok(false);
        }
        self.save(&peers)?;
        Ok(true)
    }
}

/// `<data_dir>/world_chat.json`.
#[derive(Debug, Clone)]
pub struct WorldSettingsStore {
    path: PathBuf,
}

impl WorldSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Saved settings, or `fallback` when nothing usable is on disk.
    pub fn load(&self, fallback: WorldSettings) -> WorldSettings {
        read_json::<WorldSettings>(&self.path)
            .unwrap_or(fallback)
            .normalized()
    }

    pub fn save(&self, settings: &WorldSettings) -> Result<()> {
        write_json(&self.path, settings)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "No saved file");
            return None;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read file");
            return None;
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring corrupt file");
            None
        }
    }
}

/// Serialize to a sibling temp file, then rename over the target.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let json = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "Saved");
    Ok(())
}
