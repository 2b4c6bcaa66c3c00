//! Wire protocol for RRC (Reticulum Relay Chat): envelope codec, envelope
//! construction/validation, and text sanitizers.
//!
//! Envelopes are CBOR maps keyed by small unsigned integers (see
//! [`envelope`]), kept deliberately compact since they travel over a
//! bandwidth-constrained mesh link.

pub mod codec;
pub mod envelope;
pub mod sanitize;

pub use codec::{decode, encode};
pub use envelope::{make_envelope, Body, Envelope, MessageType};

/// Protocol version every accepted envelope must carry.
pub const PROTOCOL_VERSION: u64 = 1;

/// Hard ceiling on envelope size at decode time, independent of transport MTU.
pub const MAX_ENVELOPE_BYTES: usize = 524_288;

/// Maximum size of an out-of-band resource transfer this client will accept.
pub const MAX_RESOURCE_BYTES: u64 = 262_144;

/// Maximum number of pending resource expectations tracked at once.
pub const MAX_PENDING_EXPECTATIONS: usize = 8;

/// Maximum number of resource transfers actively in flight at once.
pub const MAX_ACTIVE_RESOURCES: usize = 16;

/// Time-to-live for a resource expectation before it is garbage collected.
pub const EXPECTATION_TTL_SECS: u64 = 30;

/// Interval between HELLO retransmissions during handshake.
pub const HELLO_INTERVAL_SECS: u64 = 3;

/// Maximum number of HELLO attempts before giving up on a WELCOME.
pub const HELLO_MAX_ATTEMPTS: u32 = 3;

/// Overall deadline for `connect()` (path-wait + identity-recall + welcome-wait).
pub const CONNECT_TIMEOUT_SECS: u64 = 20;

/// Interval between keepalive pings once welcomed.
pub const PING_INTERVAL_SECS: u64 = 30;

/// Maximum number of rooms tracked at once.
pub const MAX_ROOMS: usize = 100;

/// Maximum number of messages retained per room (FIFO, drop oldest).
pub const MAX_MESSAGES_PER_ROOM: usize = 1000;

/// Maximum size of an announce's opaque `app_data` payload.
pub const MAX_ANNOUNCE_APP_DATA: usize = 10_240;

/// A discovered hub older than this (in seconds) is considered stale.
pub const STALE_HUB_THRESHOLD_SECS: u64 = 3600;

/// Maximum number of discovered-hub records retained (capacity eviction by
/// least-recently-seen), supplementing the staleness threshold above.
pub const MAX_TOTAL_DISCOVERED_HUBS: usize = 100;

/// Room names are capped at this many characters.
pub const MAX_ROOM_NAME_CHARS: usize = 64;

/// Display nicknames are capped at this many characters.
pub const MAX_NICK_CHARS: usize = 32;

/// Free-text chat/notice bodies are capped at this many characters.
pub const MAX_TEXT_CHARS: usize = 10_000;

/// A hub hash is exactly this many hex characters (16 bytes).
pub const HUB_HASH_HEX_CHARS: usize = 32;

/// Inbound envelopes whose timestamp skews from local time by more than this
/// (in milliseconds) trigger a warning log, but are not rejected.
pub const MAX_TIMESTAMP_SKEW_MS: i64 = 300_000;

/// Room join/part operations are rate-limited to this many calls...
pub const ROOM_OP_RATE_LIMIT: usize = 10;

/// ...per this many seconds, per room key.
pub const ROOM_OP_RATE_WINDOW_SECS: u64 = 5;

/// Errors produced by envelope encoding, decoding, and validation.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("envelope of {0} bytes exceeds the {MAX_ENVELOPE_BYTES} byte ceiling")]
    TooLarge(usize),
    #[error("CBOR encode failed: {0}")]
    Encode(String),
    #[error("CBOR decode failed: {0}")]
    Decode(String),
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unsupported protocol version {0}")]
    BadVersion(u64),
    #[error("invalid field: {0}")]
    BadField(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
