//! # devlink — linked-device client for an end-to-end-encrypted chat network
//!
//! `devlink` is a modular Rust library wiring together the sub-crates built
//! for each layer of the protocol:
//!
//! | Sub-crate       | Role                                                   |
//! |-----------------|---------------------------------------------------------|
//! | `devlink-crypto`| X25519/HSalsa20 precompute, AEAD, keyed BLAKE2b KDF     |
//! | `devlink-wire`  | Fixed binary framing: relay, mediator, CSP, messages    |
//! | `devlink-proto` | Sans-IO handshakes: rendezvous, mediator, chat-server   |
//! | `devlink-net`   | WebSocket dialers and HTTP blob transport               |
//! | `devlink-join`  | Device-join message consumption and state persistence   |
//! | `devlink-core`  | Message engine, blob channel, dedupe, supervisor        |
//!
//! ## Quick start: scan a QR code and link
//!
//! ```rust,no_run
//! use devlink::proto::authentication;
//!
//! // The initiator side of the rendezvous handshake begins as soon as the
//! // QR payload's path is dialed over devlink-net.
//! let initiator = authentication::start();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Re-export of [`devlink_crypto`] — X25519 precompute, AEAD, KDF.
pub use devlink_crypto as crypto;

/// Re-export of [`devlink_wire`] — fixed binary framing and codecs.
pub use devlink_wire as wire;

/// Re-export of [`devlink_proto`] — sans-IO handshake state machines.
pub use devlink_proto as proto;

/// Re-export of [`devlink_net`] — WebSocket and HTTP transports.
pub use devlink_net as net;

/// Re-export of [`devlink_join`] — device-join protocol.
pub use devlink_join as join;

/// Re-export of [`devlink_core`] — message engine, blob channel, dedupe,
/// supervisor.
pub use devlink_core as core;

// ─── Convenience re-exports ───────────────────────────────────────────────────

pub use devlink_core::{ClientConfig, DevlinkError};
pub use devlink_proto::{authentication, csp, mediator};
