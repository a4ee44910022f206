use std::time::Duration;

/// Application name
pub const APP_NAME: &str = "XUI";

/// Nickname used when the caller supplies an empty one
pub const DEFAULT_NICKNAME: &str = "XUI";

/// Length of the hex node id carved out of a UUID v4
pub const NODE_ID_LEN: usize = 12;

/// Well-known UDP port for announce/probe traffic
pub const DEFAULT_DISCOVERY_PORT: u16 = 38599;

/// First TCP port tried for the chat server
pub const DEFAULT_CHAT_PORT_BASE: u16 = 38600;

/// Number of contiguous chat ports probed
pub const DEFAULT_CHAT_PORT_SPAN: u16 = 24;

/// Interval between discovery announces
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_millis(2500);

/// Subnet broadcast targets are rescanned every N announce ticks
pub const BROADCAST_REFRESH_TICKS: u64 = 8;

/// Local interface addresses are rescanned by the listener at this interval
pub const LOCAL_ADDR_REFRESH: Duration = Duration::from_secs(20);

/// Maximum accepted discovery datagram
pub const MAX_DATAGRAM_SIZE: usize = 8192;

/// Registry garbage-collection interval
pub const GC_INTERVAL: Duration = Duration::from_secs(2);

/// LAN peers not refreshed within this window are dropped
pub const LAN_PEER_TTL: Duration = Duration::from_secs(10);

/// Connect timeout for a single delivery candidate
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for writing an envelope once connected
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for reading an inbound connection to EOF
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum inbound payload per connection (16 MiB, sized for voice clips)
pub const MAX_ENVELOPE_BYTES: usize = 16 * 1024 * 1024;

/// Default world relay (any ntfy-compatible pub/sub server)
pub const DEFAULT_RELAY_URL: &str = "https://ntfy.sh";

/// Room used when a topic sanitizes to nothing
pub const DEFAULT_WORLD_ROOM: &str = "xui-world";

/// `kind` tag on world chat publish bodies
pub const WORLD_CHAT_KIND: &str = "xui_world_chat";

/// Older clients published this tag; still accepted on receive
pub const LEGACY_WORLD_CHAT_KIND: &str = "world_chat";

/// A single relay subscription is recycled after this long
pub const RELAY_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// A subscription that ends sooner than this counts as a failed attempt
pub const RELAY_MIN_SESSION: Duration = Duration::from_secs(1);

/// Relay publish timeout
pub const RELAY_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// First relay retry delay
pub const RELAY_BACKOFF_MIN: Duration = Duration::from_millis(1200);

/// Relay retry delay cap
pub const RELAY_BACKOFF_MAX: Duration = Duration::from_secs(8);

/// Number of relay message ids remembered for dedupe
pub const DEDUPE_CAPACITY: usize = 1200;

/// Per-task join timeout used by engine shutdown
pub const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Name of the singleton registry record standing for the world room
pub const WORLD_PEER_NAME: &str = "World Chat";

/// Host of the singleton world record
pub const WORLD_PEER_HOST: &str = "world";
