/// Wire timestamp format (local time, second precision).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Broadcast messages replayed to a connection right after login.
pub const BROADCAST_REPLAY_LIMIT: usize = 50;

/// Default page size for private history, and the per-thread window scanned
/// when replaying pending private messages on login.
pub const PRIVATE_HISTORY_LIMIT: usize = 50;

/// Default number of broadcast messages returned by the admin history view.
pub const ADMIN_HISTORY_LIMIT: usize = 10;

/// Character used to mask filtered terms.
pub const MASK_CHAR: char = '*';

/// Default per-connection outbound queue capacity.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Default socket address for the chat server.
pub const DEFAULT_CHAT_PORT: u16 = 8000;

/// Default identity service endpoint.
pub const DEFAULT_AUTH_URL: &str = "http://localhost:8001/api/user/info";

/// Persistence document keys
pub const DOC_BROADCAST_HISTORY: &str = "broadcast_history";
pub const DOC_PRIVATE_THREADS: &str = "private_threads";
pub const DOC_UNREAD_COUNTERS: &str = "unread_counters";
pub const DOC_BLOCKS: &str = "blocks";
