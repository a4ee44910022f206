use thiserror::Error;

#[derive(Error, Debug)]
pub enum XuiError {
    #[error("Failed to bind {what} on port {port}: {source}")]
    Bind {
        what: &'static str,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("Send to {addr} failed: {reason}")]
    Send { addr: String, reason: String },

    #[error("Delivery failed after {attempts} attempt(s): {last}")]
    Delivery { attempts: usize, last: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Payload too large: {size} bytes (max {max})")]
    Oversize { size: usize, max: usize },

    #[error("World chat is disabled")]
    WorldDisabled,

    #[error("Invalid peer: {0}")]
    InvalidPeer(String),

    #[error("Engine is not running")]
    EngineStopped,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, XuiError>;
