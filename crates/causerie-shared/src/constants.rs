/// Maximum message content length in characters.
pub const MAX_CONTENT_LEN: usize = 10_000;

/// Maximum free-text length on contact requests and block reasons.
pub const MAX_NOTE_LEN: usize = 500;

/// Maximum participants accepted on conversation creation.
pub const MAX_PARTICIPANTS: usize = 50;

/// Page size cap for conversation and message listings.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Contact requests expire this many days after creation.
pub const CONTACT_REQUEST_TTL_DAYS: i64 = 7;

/// A typing entry older than this is no longer "typing".
pub const TYPING_STALE_MS: i64 = 5_000;

/// Typing state for a conversation is dropped wholesale after this long.
pub const TYPING_KEY_TTL_MS: i64 = 10_000;

/// Grace window before a disconnect is published as `presence:offline`.
pub const OFFLINE_GRACE_MS: u64 = 5_000;

/// Default HTTP/WebSocket listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 3020;

/// Presence scope used for users without a tenant.
pub const GLOBAL_SCOPE: &str = "global";
