//! Engine configuration loaded from environment variables.
//!
//! Every setting has a default so a node runs with zero configuration on a
//! home network.

use std::path::PathBuf;

use directories::ProjectDirs;

use xui_shared::constants::{
    APP_NAME, DEFAULT_CHAT_PORT_BASE, DEFAULT_CHAT_PORT_SPAN, DEFAULT_DISCOVERY_PORT,
    DEFAULT_RELAY_URL,
};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fixed UDP port for announces and probes.
    /// Env: `XUI_DISCOVERY_PORT`
    /// Default: `38599`
    pub discovery_port: u16,

    /// First TCP port tried for the chat listener.
    /// Env: `XUI_CHAT_PORT_BASE`
    /// Default: `38600`
    pub chat_port_base: u16,

    /// Number of consecutive chat ports to probe.
    /// Env: `XUI_CHAT_PORT_SPAN`
    /// Default: `24`
    pub chat_port_span: u16,

    /// Whether LAN discovery runs at all.
    /// Env: `XUI_DISCOVERY` (`0`/`false` disables)
    /// Default: `true`
    pub discovery_enabled: bool,

    /// Base URL of the world chat relay. Used when no saved settings exist.
    /// Env: `XUI_WORLD_RELAY`
    /// Default: `https://ntfy.sh`
    pub relay_url: String,

    /// Directory for `peers.json` and `world_chat.json`.
    /// Env: `XUI_DATA_DIR`
    /// Default: the platform data directory, else `./xui-data`
    pub data_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            chat_port_base: DEFAULT_CHAT_PORT_BASE,
            chat_port_span: DEFAULT_CHAT_PORT_SPAN,
            discovery_enabled: true,
            relay_url: DEFAULT_RELAY_URL.to_string(),
            data_dir: default_data_dir(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup("XUI_DISCOVERY_PORT") {
            parse_port("XUI_DISCOVERY_PORT", &val, &mut config.discovery_port);
        }

        if let Some(val) = lookup("XUI_CHAT_PORT_BASE") {
            parse_port("XUI_CHAT_PORT_BASE", &val, &mut config.chat_port_base);
        }

        if let Some(val) = lookup("XUI_CHAT_PORT_SPAN") {
            match val.trim().parse::<u16>() {
                Ok(n) if n > 0 => config.chat_port_span = n,
                _ => tracing::warn!(value = %val, "Invalid XUI_CHAT_PORT_SPAN, using default"),
            }
        }

        if let Some(val) = lookup("XUI_DISCOVERY") {
            let val = val.trim().to_ascii_lowercase();
            config.discovery_enabled = val != "false" && val != "0";
        }

        if let Some(url) = lookup("XUI_WORLD_RELAY") {
            let url = url.trim().trim_end_matches('/');
            if url.starts_with("http://") || url.starts_with("https://") {
                config.relay_url = url.to_string();
            } else {
                tracing::warn!(value = %url, "Invalid XUI_WORLD_RELAY, using default");
            }
        }

        if let Some(path) = lookup("XUI_DATA_DIR") {
            if !path.trim().is_empty() {
                config.data_dir = PathBuf::from(path);
            }
        }

        config
    }

    pub fn peers_path(&self) -> PathBuf {
        self.data_dir.join("peers.json")
    }

    pub fn world_settings_path(&self) -> PathBuf {
        self.data_dir.join("world_chat.json")
    }
}

fn parse_port(name: &str, val: &str, slot: &mut u16) {
    match val.trim().parse::<u16>() {
        Ok(port) if port > 0 => *slot = port,
        _ => tracing::warn!(var = name, value = %val, "Invalid port, using default"),
    }
}

fn default_data_dir() -> PathBuf {
    ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./xui-data"))
}
