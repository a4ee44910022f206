//! Wire formats, identity and shared constants for the XUI peer link.

pub mod constants;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod topic;
pub mod types;

pub use error::{Result, XuiError};
pub use identity::NodeIdentity;
pub use topic::sanitize_topic;
pub use types::{NodeId, PeerSource};
