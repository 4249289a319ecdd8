//! Error types for devlink-core.
//!
//! One [`DevlinkError`] composes every sub-crate's narrow error type via
//! `From` impls, matching the taxonomy in the design's error-handling
//! section: crypto, protocol, timeout, and transport errors each carry
//! different recovery semantics for the caller.

use std::fmt;

/// The unified error type returned from any `devlink-core` operation.
#[derive(Debug)]
pub enum DevlinkError {
    /// AEAD authentication failure, wrong key/nonce length. Fatal to a CSP
    /// or rendezvous session; for an individual reflected envelope this is
    /// instead logged and the frame is still acked unless ephemeral.
    Crypto(devlink_crypto::CryptoError),
    /// Unexpected frame type for the current state, malformed structure, or
    /// a sequence-number regression. Fatal to the session.
    Protocol(String),
    /// A caller-facing wait exceeded its deadline. The specific awaiter
    /// fails; the session itself survives.
    Timeout(TimeoutKind),
    /// WebSocket closure or other network failure. Triggers the
    /// supervisor's reconnect loop; every pending waiter fails with this.
    Transport(String),
    /// A persisted-state file was missing, malformed, or could not be
    /// atomically replaced.
    Storage(std::io::Error),
    /// A JSON payload (file-message, persisted state) failed to parse.
    Json(serde_json::Error),
    /// The caller handed in something invalid. Rejected before any I/O.
    Caller(CallerError),
}

/// Which timeout-bound wait failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    /// A mediator `ReflectAck` did not arrive within 15 s.
    ReflectAck,
    /// A CSP `OutgoingMessageAck` did not arrive within 20 s.
    OutgoingMessageAck,
    /// `waitForLeaderAndCsp`/`waitForCspReady` exceeded the caller's deadline.
    Readiness,
}

/// Caller mistakes caught at the API boundary, before any bytes move.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallerError {
    /// An identity was not eight characters of `[*0-9A-Z]`.
    InvalidIdentity(String),
    /// A text or edit body was empty.
    EmptyText,
    /// An edit body exceeded the 6,000-byte limit.
    OversizedEdit {
        /// The rejected body's length in bytes.
        len: usize,
    },
    /// A reaction emoji was outside the 1-64 UTF-8-byte bound.
    EmojiLength {
        /// The rejected emoji's length in bytes.
        len: usize,
    },
}

impl fmt::Display for CallerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidIdentity(id) => write!(f, "invalid identity {id:?}: expected eight characters of [*0-9A-Z]"),
            Self::EmptyText => write!(f, "message text must not be empty"),
            Self::OversizedEdit { len } => write!(f, "edit body of {len} bytes exceeds the 6000-byte limit"),
            Self::EmojiLength { len } => write!(f, "emoji of {len} bytes outside the 1..=64 byte bound"),
        }
    }
}

impl std::error::Error for CallerError {}

impl From<CallerError> for DevlinkError {
    fn from(e: CallerError) -> Self { Self::Caller(e) }
}

impl fmt::Display for DevlinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crypto(e) => write!(f, "crypto error: {e}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Timeout(kind) => write!(f, "timed out waiting for {kind:?}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Json(e) => write!(f, "malformed persisted state: {e}"),
            Self::Caller(e) => write!(f, "invalid call: {e}"),
        }
    }
}

impl std::error::Error for DevlinkError {}

impl From<devlink_crypto::CryptoError> for DevlinkError {
    fn from(e: devlink_crypto::CryptoError) -> Self { Self::Crypto(e) }
}

impl From<devlink_wire::deserialize::Error> for DevlinkError {
    fn from(e: devlink_wire::deserialize::Error) -> Self { Self::Protocol(e.to_string()) }
}

impl From<devlink_proto::authentication::Error> for DevlinkError {
    fn from(e: devlink_proto::authentication::Error) -> Self {
        match e {
            devlink_proto::authentication::Error::Crypto(c) => Self::Crypto(c),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<devlink_proto::csp::Error> for DevlinkError {
    fn from(e: devlink_proto::csp::Error) -> Self {
        match e {
            devlink_proto::csp::Error::Crypto(c) => Self::Crypto(c),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<devlink_proto::mediator::Error> for DevlinkError {
    fn from(e: devlink_proto::mediator::Error) -> Self {
        match e {
            devlink_proto::mediator::Error::Crypto(c) => Self::Crypto(c),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<std::io::Error> for DevlinkError {
    fn from(e: std::io::Error) -> Self { Self::Storage(e) }
}

impl From<serde_json::Error> for DevlinkError {
    fn from(e: serde_json::Error) -> Self { Self::Json(e) }
}
